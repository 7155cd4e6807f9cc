//! Schedulable applications.
//!
//! An [`Application`] mixes three kinds of state, kept explicit here:
//!
//! - configuration from the collaborator (demand, affinity, lease, priority);
//! - the persistent placement record (`server`, `placement_expiry`,
//!   `identity`, `evicted`), which survives across scheduling cycles;
//! - per-cycle scratch (`renew` consumption, `final_rank`, `final_util`),
//!   meaningful only during/after a single `schedule()` call.
//!
//! The eviction-and-restore logic of the placement pass depends on `evicted`
//! carrying over within one cycle, so the fields live on the application
//! rather than in a side table.

use warden_types::{Affinity, ResourceVector, TraitSet};

/// Unix timestamp in seconds. `0` means "unbounded" wherever a deadline or
/// expiry is optional.
pub type UnixSecs = i64;

/// Constraints an application inherits from its allocation: the partition
/// label its placement must stay within and the traits a server must
/// advertise. Restamped from the allocation tree at the start of every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConstraints {
    pub label: Option<String>,
    pub traits: TraitSet,
}

/// A schedulable unit with a multi-dimensional demand.
#[derive(Debug, Clone)]
pub struct Application {
    /// Unique name, cell-wide.
    pub name: String,
    /// Resource demand, one value per cell dimension.
    pub demand: ResourceVector,
    /// Co-location grouping and per-level limits.
    pub affinity: Affinity,
    /// Fairness priority. `0` is a reserved sentinel: always lowest fairness
    /// rank, best-effort.
    pub priority: i32,
    /// Maximum placement duration in seconds, `0` = unbounded.
    pub lease: i64,
    /// How long data on a down server stays worth waiting for, in seconds.
    /// `0` = evict immediately when the server goes down.
    pub data_retention: i64,
    /// Identity group this app draws a stable integer identity from.
    pub identity_group: Option<String>,
    /// Never re-placed after its first eviction.
    pub schedule_once: bool,

    // Persistent placement record, mutated by the scheduler.
    /// Currently assigned server name, if placed.
    pub server: Option<String>,
    /// When the current placement's lease runs out, `0` = unbounded.
    pub placement_expiry: UnixSecs,
    /// Assigned identity within `identity_group`.
    pub identity: Option<u32>,
    /// Set when the app loses a placement; cleared on the next successful
    /// placement. Gates `schedule_once` retries and same-server restores.
    pub evicted: bool,
    /// Collaborator requests: renew the lease on the current server this
    /// cycle.
    pub renew: bool,
    /// Collaborator requests: remove from frozen servers.
    pub unschedule: bool,
    /// Excluded from placement entirely; evicted if currently placed.
    pub blacklisted: bool,

    // Assigned by the cell at registration.
    pub(crate) allocation: Option<String>,
    pub(crate) order: u64,
    pub(crate) constraints: AppConstraints,

    // Per-cycle scratch, recorded for explainability.
    /// Rank this app was scheduled with in the last cycle.
    pub final_rank: i64,
    /// Utilization after this app in the last cycle's queue.
    pub final_util: f64,
}

impl Application {
    /// Creates an application with the given demand and affinity, all other
    /// settings at their defaults (priority 1, unbounded lease, no identity).
    #[must_use]
    pub fn new(name: impl Into<String>, demand: ResourceVector, affinity: Affinity) -> Self {
        Self {
            name: name.into(),
            demand,
            affinity,
            priority: 1,
            lease: 0,
            data_retention: 0,
            identity_group: None,
            schedule_once: false,
            server: None,
            placement_expiry: 0,
            identity: None,
            evicted: false,
            renew: false,
            unschedule: false,
            blacklisted: false,
            allocation: None,
            order: 0,
            constraints: AppConstraints::default(),
            final_rank: 0,
            final_util: 0.0,
        }
    }

    /// Sets the fairness priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the lease duration in seconds.
    #[must_use]
    pub fn with_lease(mut self, lease: i64) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the data retention grace period in seconds.
    #[must_use]
    pub fn with_data_retention(mut self, retention: i64) -> Self {
        self.data_retention = retention;
        self
    }

    /// Requires a stable integer identity from the named group.
    #[must_use]
    pub fn with_identity_group(mut self, group: impl Into<String>) -> Self {
        self.identity_group = Some(group.into());
        self
    }

    /// Marks the app as never re-placed after its first eviction.
    #[must_use]
    pub fn schedule_once(mut self) -> Self {
        self.schedule_once = true;
        self
    }

    /// True iff the app is currently placed.
    #[must_use]
    pub fn is_placed(&self) -> bool {
        self.server.is_some()
    }

    /// The dotted allocation path this app was registered under.
    #[must_use]
    pub fn allocation_path(&self) -> Option<&str> {
        self.allocation.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::{Affinity, ResourceVector};

    #[test]
    fn test_defaults() {
        let app = Application::new(
            "proid.web#001",
            ResourceVector::from_values(vec![1.0, 1.0]),
            Affinity::unlimited("proid.web"),
        );
        assert_eq!(app.priority, 1);
        assert_eq!(app.lease, 0);
        assert!(!app.is_placed());
        assert!(!app.evicted);
    }
}
