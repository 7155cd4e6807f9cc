//! Partitions: a labeled slice of the topology, its allocation root, and
//! the reboot policy that staggers server restarts.
//!
//! Reboot timestamps come from a weekly schedule and are materialized into
//! an ordered run of [`RebootBucket`]s, extended lazily so the sequence is
//! effectively infinite. Servers are balanced across buckets whose
//! timestamp falls inside the server's allowed uptime window; a server
//! already past its maximum uptime is forced into the earliest bucket.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use tracing::debug;

use warden_types::{Dimensions, ResourceVector};

use crate::alloc::Allocation;
use crate::app::UnixSecs;

/// Youngest a server may be at its scheduled reboot.
pub const DEFAULT_MIN_SERVER_UPTIME: i64 = 24 * 60 * 60;

/// Oldest a server may get before a reboot is forced.
pub const DEFAULT_MAX_SERVER_UPTIME: i64 = 21 * 24 * 60 * 60;

/// How many future buckets `tick` keeps materialized.
const FUTURE_BUCKETS: usize = 7;

const WEEK_SECS: i64 = 7 * 24 * 60 * 60;

/// Weekly reboot schedule: day-of-week and time-of-day entries.
#[derive(Debug, Clone)]
pub struct RebootSchedule {
    entries: Vec<(Weekday, NaiveTime)>,
}

impl RebootSchedule {
    #[must_use]
    pub fn new(entries: Vec<(Weekday, NaiveTime)>) -> Self {
        Self { entries }
    }

    /// Every day at the given UTC time.
    #[must_use]
    pub fn daily_at(time: NaiveTime) -> Self {
        use Weekday::*;
        Self::new([Mon, Tue, Wed, Thu, Fri, Sat, Sun].map(|day| (day, time)).to_vec())
    }

    /// The earliest scheduled timestamp strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: UnixSecs) -> UnixSecs {
        let Some(dt) = DateTime::<Utc>::from_timestamp(after, 0) else {
            return after + 24 * 60 * 60;
        };
        let mut best: Option<UnixSecs> = None;
        for (weekday, time) in &self.entries {
            let days_ahead = (weekday.num_days_from_monday() + 7
                - dt.weekday().num_days_from_monday())
                % 7;
            let date = dt.date_naive() + Days::new(u64::from(days_ahead));
            let mut candidate = date.and_time(*time).and_utc().timestamp();
            if candidate <= after {
                candidate += WEEK_SECS;
            }
            best = Some(best.map_or(candidate, |b| b.min(candidate)));
        }
        best.unwrap_or(after + 24 * 60 * 60)
    }
}

impl Default for RebootSchedule {
    /// Nightly at 23:30 UTC.
    fn default() -> Self {
        let time = NaiveTime::from_hms_opt(23, 30, 0).expect("valid time literal");
        Self::daily_at(time)
    }
}

/// One scheduled reboot slot and the servers assigned to it.
#[derive(Debug, Clone)]
pub struct RebootBucket {
    at: UnixSecs,
    servers: BTreeSet<String>,
}

impl RebootBucket {
    fn new(at: UnixSecs) -> Self {
        Self {
            at,
            servers: BTreeSet::new(),
        }
    }

    /// The bucket's reboot timestamp.
    #[must_use]
    pub fn at(&self) -> UnixSecs {
        self.at
    }

    /// Servers currently assigned to reboot at this timestamp.
    #[must_use]
    pub fn servers(&self) -> &BTreeSet<String> {
        &self.servers
    }

    /// Cost of adding a server: current occupancy if the bucket falls
    /// within `[up_since + min_uptime, up_since + max_uptime]`, infinite
    /// otherwise.
    #[must_use]
    pub fn cost(&self, up_since: UnixSecs, min_uptime: i64, max_uptime: i64) -> f64 {
        if self.at >= up_since + min_uptime && self.at <= up_since + max_uptime {
            self.servers.len() as f64
        } else {
            f64::INFINITY
        }
    }
}

/// A partition binds an allocation tree to the servers carrying its label.
#[derive(Debug)]
pub struct Partition {
    label: String,
    pub(crate) allocation: Allocation,
    min_server_uptime: i64,
    max_server_uptime: i64,
    max_app_lease: i64,
    threshold: f64,
    schedule: RebootSchedule,
    buckets: VecDeque<RebootBucket>,
}

impl Partition {
    #[must_use]
    pub fn new(label: impl Into<String>, dims: Dimensions) -> Self {
        let label = label.into();
        let mut allocation = Allocation::new(label.clone(), ResourceVector::zero(dims));
        allocation.set_label(Some(label.clone()));
        Self {
            label,
            allocation,
            min_server_uptime: DEFAULT_MIN_SERVER_UPTIME,
            max_server_uptime: DEFAULT_MAX_SERVER_UPTIME,
            max_app_lease: 0,
            threshold: 1.0,
            schedule: RebootSchedule::default(),
            buckets: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Root allocation of this partition's fair-share tree.
    #[must_use]
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    pub fn allocation_mut(&mut self) -> &mut Allocation {
        &mut self.allocation
    }

    /// Longest lease accepted for apps in this partition, `0` = unbounded.
    #[must_use]
    pub fn max_app_lease(&self) -> i64 {
        self.max_app_lease
    }

    pub fn set_max_app_lease(&mut self, max_app_lease: i64) {
        self.max_app_lease = max_app_lease;
    }

    /// Down-server utilization threshold, carried as configuration for
    /// collaborators; the placement pass itself does not consume it.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    pub fn set_server_uptime(&mut self, min: i64, max: i64) {
        assert!(min <= max, "min uptime above max uptime");
        self.min_server_uptime = min;
        self.max_server_uptime = max;
    }

    /// Replaces the reboot schedule. Materialized buckets are rebuilt on
    /// the next `tick`; servers keep their already-assigned deadlines.
    pub fn set_reboot_schedule(&mut self, schedule: RebootSchedule) {
        self.schedule = schedule;
        self.buckets.clear();
    }

    /// Materialized reboot buckets, earliest first.
    #[must_use]
    pub fn reboot_buckets(&self) -> impl Iterator<Item = &RebootBucket> {
        self.buckets.iter()
    }

    /// Discards past buckets and extends the future run.
    pub fn tick(&mut self, now: UnixSecs) {
        while matches!(self.buckets.front(), Some(bucket) if bucket.at <= now) {
            self.buckets.pop_front();
        }
        let mut last = self.buckets.back().map_or(now, |bucket| bucket.at);
        while self.buckets.len() < FUTURE_BUCKETS {
            last = self.schedule.next_after(last);
            self.buckets.push_back(RebootBucket::new(last));
        }
    }

    /// Assigns a server to a reboot bucket and returns the bucket's
    /// timestamp, which becomes the server's valid-until deadline.
    pub fn assign_reboot_bucket(
        &mut self,
        server: &str,
        up_since: UnixSecs,
        now: UnixSecs,
    ) -> UnixSecs {
        self.tick(now);
        let idx = if now - up_since > self.max_server_uptime {
            // Past max uptime already: reboot at the earliest opportunity.
            0
        } else {
            let mut best = 0;
            let mut best_cost = f64::INFINITY;
            for (i, bucket) in self.buckets.iter().enumerate() {
                let cost = bucket.cost(up_since, self.min_server_uptime, self.max_server_uptime);
                if cost < best_cost {
                    best = i;
                    best_cost = cost;
                }
            }
            best
        };
        let bucket = &mut self.buckets[idx];
        bucket.servers.insert(server.to_string());
        debug!(partition = %self.label, server, at = bucket.at, "reboot bucket assigned");
        bucket.at
    }

    /// Drops a removed server from its reboot bucket, if any.
    pub fn forget_server(&mut self, server: &str) {
        for bucket in &mut self.buckets {
            bucket.servers.remove(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DAY: i64 = 24 * 60 * 60;

    fn noon_daily() -> RebootSchedule {
        RebootSchedule::daily_at(NaiveTime::from_hms_opt(12, 0, 0).unwrap())
    }

    fn partition() -> Partition {
        let mut partition = Partition::new("part1", Dimensions::new(1));
        partition.set_reboot_schedule(noon_daily());
        partition
    }

    #[test]
    fn test_next_after_daily() {
        let schedule = noon_daily();
        assert_eq!(schedule.next_after(0), DAY / 2);
        assert_eq!(schedule.next_after(DAY / 2), DAY / 2 + DAY);
        assert_eq!(schedule.next_after(DAY / 2 - 1), DAY / 2);
    }

    #[test]
    fn test_next_after_weekly_wraps() {
        // Epoch starts on a Thursday.
        let schedule = RebootSchedule::new(vec![(
            Weekday::Thu,
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        )]);
        assert_eq!(schedule.next_after(0), 7 * DAY);
        assert_eq!(schedule.next_after(1), 7 * DAY);
        assert_eq!(schedule.next_after(7 * DAY - 1), 7 * DAY);
    }

    #[rstest]
    #[case::before_window(0, f64::INFINITY)]
    #[case::window_start(DAY, 0.0)]
    #[case::window_end(21 * DAY, 0.0)]
    #[case::past_window(21 * DAY + 1, f64::INFINITY)]
    fn test_bucket_cost_window(#[case] at: UnixSecs, #[case] expected: f64) {
        let mut bucket = RebootBucket::new(at);
        assert_eq!(bucket.cost(0, DAY, 21 * DAY), expected);
        bucket.servers.insert("s1".to_string());
        if expected.is_finite() {
            assert_eq!(bucket.cost(0, DAY, 21 * DAY), 1.0);
        } else {
            assert!(bucket.cost(0, DAY, 21 * DAY).is_infinite());
        }
    }

    #[test]
    fn test_tick_keeps_future_run() {
        let mut partition = partition();
        partition.tick(0);
        let first: Vec<UnixSecs> = partition.reboot_buckets().map(RebootBucket::at).collect();
        assert_eq!(first.len(), 7);
        assert!(first.iter().all(|&at| at > 0));
        assert!(first.windows(2).all(|w| w[0] < w[1]));

        // Two days later the past buckets are gone, the run is refilled.
        partition.tick(2 * DAY);
        let later: Vec<UnixSecs> = partition.reboot_buckets().map(RebootBucket::at).collect();
        assert_eq!(later.len(), 7);
        assert!(later.iter().all(|&at| at > 2 * DAY));
    }

    #[test]
    fn test_servers_balance_across_buckets() {
        let mut partition = partition();
        let at1 = partition.assign_reboot_bucket("s1", 0, 0);
        let at2 = partition.assign_reboot_bucket("s2", 0, 0);
        assert_ne!(at1, at2);
        // Both land inside the uptime window, never in the first (too
        // young) bucket at noon of day zero.
        assert!(at1 >= DAY && at2 >= DAY);
    }

    #[test]
    fn test_overdue_server_forced_into_earliest_bucket() {
        let mut partition = partition();
        let now = 30 * DAY;
        let at = partition.assign_reboot_bucket("old", 0, now);
        let earliest = partition
            .reboot_buckets()
            .map(RebootBucket::at)
            .next()
            .unwrap();
        assert_eq!(at, earliest);
    }

    #[test]
    fn test_forget_server() {
        let mut partition = partition();
        partition.assign_reboot_bucket("s1", 0, 0);
        partition.forget_server("s1");
        assert!(partition.reboot_buckets().all(|b| b.servers().is_empty()));
    }
}
