//! Tenant allocations and fair-share queue construction.
//!
//! Allocations form a tree per partition: each node reserves capacity and
//! holds applications; sub-allocations subdivide the parent's share. The
//! scheduling order for a partition comes from merging every allocation's
//! private queue, lazily, with utilization recomputed at each level of the
//! tree so sibling tenants interleave by how deep into their reservation
//! they are rather than by insertion order.
//!
//! Queue entries sort by `(rank, util_before, util_after, pending, order,
//! name)`. Within one allocation the private queue is emitted in ascending
//! entry order, which keeps the k-way merge correct without materializing
//! sub-trees.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use warden_types::{Dimensions, ResourceVector, TraitSet};

use crate::app::Application;

/// Rank assigned past the utilization cap; sorts after every real rank.
pub const RANK_UNPLACED: i64 = i64::MAX;

/// Rank of a freshly created allocation.
pub const DEFAULT_RANK: i64 = 100;

/// One row of a partition's scheduling order.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Allocation rank, possibly adjusted, or [`RANK_UNPLACED`].
    pub rank: i64,
    /// Utilization before this app's demand is added.
    pub util_before: f64,
    /// Utilization after this app's demand is added.
    pub util_after: f64,
    /// `0` if currently placed, `1` otherwise.
    pub pending: u8,
    /// Cell-wide registration order, the final stable tie-break.
    pub order: u64,
    /// Application name.
    pub app: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.util_before.total_cmp(&other.util_before))
            .then_with(|| self.util_after.total_cmp(&other.util_after))
            .then_with(|| self.pending.cmp(&other.pending))
            .then_with(|| self.order.cmp(&other.order))
            .then_with(|| self.app.cmp(&other.app))
    }
}

/// A capacity reservation holding applications and sub-allocations.
#[derive(Debug)]
pub struct Allocation {
    path: String,
    reserved: ResourceVector,
    rank: i64,
    rank_adjustment: i64,
    max_utilization: f64,
    label: Option<String>,
    traits: TraitSet,
    apps: BTreeSet<String>,
    sub_allocations: BTreeMap<String, Allocation>,
}

impl Allocation {
    #[must_use]
    pub fn new(path: impl Into<String>, reserved: ResourceVector) -> Self {
        Self {
            path: path.into(),
            reserved,
            rank: DEFAULT_RANK,
            rank_adjustment: 0,
            max_utilization: f64::INFINITY,
            label: None,
            traits: TraitSet::empty(),
            apps: BTreeSet::new(),
            sub_allocations: BTreeMap::new(),
        }
    }

    /// Dotted path from the partition root, e.g. `tenant1/dev`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn reserved(&self) -> &ResourceVector {
        &self.reserved
    }

    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    #[must_use]
    pub fn traits(&self) -> TraitSet {
        self.traits
    }

    /// Replaces reservation and fairness settings in one step, the shape a
    /// collaborator update arrives in.
    pub fn update(
        &mut self,
        reserved: ResourceVector,
        rank: i64,
        rank_adjustment: i64,
        max_utilization: f64,
    ) {
        self.reserved = reserved;
        self.rank = rank;
        self.rank_adjustment = rank_adjustment;
        self.max_utilization = max_utilization;
    }

    pub fn set_label(&mut self, label: Option<String>) {
        self.label = label;
    }

    pub fn set_traits(&mut self, traits: TraitSet) {
        self.traits = traits;
    }

    pub fn set_rank(&mut self, rank: i64) {
        self.rank = rank;
    }

    pub fn set_rank_adjustment(&mut self, adjustment: i64) {
        self.rank_adjustment = adjustment;
    }

    pub fn set_max_utilization(&mut self, max_utilization: f64) {
        self.max_utilization = max_utilization;
    }

    pub(crate) fn add_app(&mut self, name: &str) {
        self.apps.insert(name.to_string());
    }

    pub(crate) fn remove_app(&mut self, name: &str) {
        self.apps.remove(name);
    }

    /// Gets or creates a direct sub-allocation. New sub-allocations inherit
    /// the parent's partition label.
    pub fn sub_allocation_mut(&mut self, name: &str) -> &mut Allocation {
        if !self.sub_allocations.contains_key(name) {
            let mut sub = Allocation::new(
                format!("{}/{}", self.path, name),
                ResourceVector::zero(Dimensions::new(self.reserved.dims())),
            );
            sub.label = self.label.clone();
            self.sub_allocations.insert(name.to_string(), sub);
        }
        self.sub_allocations
            .get_mut(name)
            .expect("sub-allocation inserted above")
    }

    pub fn remove_sub_allocation(&mut self, name: &str) -> bool {
        self.sub_allocations.remove(name).is_some()
    }

    /// Navigates a `/`-separated path below this allocation. Empty path
    /// returns `self`.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&Allocation> {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current.sub_allocations.get(segment)?;
        }
        Some(current)
    }

    /// Mutable variant of [`find`](Self::find), creating missing segments.
    pub fn find_or_create_mut(&mut self, path: &str) -> &mut Allocation {
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current.sub_allocation_mut(segment);
        }
        current
    }

    /// Sum of reservations over this allocation and all sub-allocations.
    #[must_use]
    pub fn total_reserved(&self) -> ResourceVector {
        let mut total = self.reserved.clone();
        for sub in self.sub_allocations.values() {
            total.add_assign(&sub.total_reserved());
        }
        total
    }

    /// Depth-first visit over the allocation tree.
    pub fn for_each(&self, f: &mut impl FnMut(&Allocation)) {
        f(self);
        for sub in self.sub_allocations.values() {
            sub.for_each(f);
        }
    }

    /// Names of applications registered directly under this allocation.
    #[must_use]
    pub fn app_names(&self) -> impl Iterator<Item = &str> {
        self.apps.iter().map(String::as_str)
    }

    /// This allocation's own queue: its direct apps ordered by descending
    /// priority, placed before pending, then registration order. Utilization
    /// runs against the allocation's private reservation, rank adjustment
    /// rewards staying under it, and crossing `max_utilization` demotes the
    /// rest of the queue to [`RANK_UNPLACED`].
    fn priv_utilization_queue(&self, apps: &HashMap<String, Application>) -> Vec<QueueEntry> {
        let mut own: Vec<&Application> = self
            .apps
            .iter()
            .filter_map(|name| apps.get(name))
            .collect();
        own.sort_by(|a, b| {
            let ka = (
                -(a.priority as i64),
                u8::from(!a.is_placed()),
                a.order,
                &a.name,
            );
            let kb = (
                -(b.priority as i64),
                u8::from(!b.is_placed()),
                b.order,
                &b.name,
            );
            ka.cmp(&kb)
        });

        let available = self.reserved.plus_scalar(f64::EPSILON);
        let mut acc = ResourceVector::zero(Dimensions::new(self.reserved.dims()));
        let mut entries = Vec::with_capacity(own.len());
        for app in own {
            let util_before = acc.utilization(&self.reserved, &available);
            acc.add_assign(&app.demand);
            let util_after = acc.utilization(&self.reserved, &available);
            let entry = if app.priority == 0 {
                QueueEntry {
                    rank: self.rank,
                    util_before: f64::INFINITY,
                    util_after: f64::INFINITY,
                    pending: u8::from(!app.is_placed()),
                    order: app.order,
                    app: app.name.clone(),
                }
            } else {
                let rank = if util_after > self.max_utilization - 1.0 {
                    RANK_UNPLACED
                } else if util_before < 0.0 {
                    self.rank - self.rank_adjustment
                } else {
                    self.rank
                };
                QueueEntry {
                    rank,
                    util_before,
                    util_after,
                    pending: u8::from(!app.is_placed()),
                    order: app.order,
                    app: app.name.clone(),
                }
            };
            entries.push(entry);
        }
        entries
    }

    /// The merged scheduling queue for this allocation sub-tree.
    ///
    /// Sub-allocation queues and the private queue are k-way merged by entry
    /// order; utilizations are then re-derived against this level's total
    /// reservation with `free_capacity` as headroom, so the caller sees one
    /// consistent utilization scale per partition.
    pub fn utilization_queue<'a>(
        &'a self,
        apps: &'a HashMap<String, Application>,
        free_capacity: &ResourceVector,
    ) -> Box<dyn Iterator<Item = QueueEntry> + 'a> {
        let mut sources: Vec<Box<dyn Iterator<Item = QueueEntry> + 'a>> = Vec::new();
        for sub in self.sub_allocations.values() {
            sources.push(sub.utilization_queue(apps, free_capacity));
        }
        sources.push(Box::new(self.priv_utilization_queue(apps).into_iter()));

        let allocated = self.total_reserved();
        let mut available = allocated.clone();
        available.add_assign(free_capacity);
        let available = available.plus_scalar(f64::EPSILON);
        let acc = ResourceVector::zero(Dimensions::new(allocated.dims()));

        Box::new(LevelQueue {
            merged: MergedQueue::new(sources),
            apps,
            allocated,
            available,
            acc,
        })
    }
}

/// K-way merge over already-sorted entry streams.
struct MergedQueue<'a> {
    sources: Vec<Box<dyn Iterator<Item = QueueEntry> + 'a>>,
    heap: BinaryHeap<Reverse<(QueueEntry, usize)>>,
}

impl<'a> MergedQueue<'a> {
    fn new(mut sources: Vec<Box<dyn Iterator<Item = QueueEntry> + 'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(entry) = source.next() {
                heap.push(Reverse((entry, idx)));
            }
        }
        Self { sources, heap }
    }
}

impl Iterator for MergedQueue<'_> {
    type Item = QueueEntry;

    fn next(&mut self) -> Option<QueueEntry> {
        let Reverse((entry, idx)) = self.heap.pop()?;
        if let Some(next) = self.sources[idx].next() {
            self.heap.push(Reverse((next, idx)));
        }
        Some(entry)
    }
}

/// Re-derives utilization for merged entries at one allocation level.
struct LevelQueue<'a> {
    merged: MergedQueue<'a>,
    apps: &'a HashMap<String, Application>,
    allocated: ResourceVector,
    available: ResourceVector,
    acc: ResourceVector,
}

impl Iterator for LevelQueue<'_> {
    type Item = QueueEntry;

    fn next(&mut self) -> Option<QueueEntry> {
        let mut entry = self.merged.next()?;
        let Some(app) = self.apps.get(&entry.app) else {
            return Some(entry);
        };
        let util_before = self.acc.utilization(&self.allocated, &self.available);
        self.acc.add_assign(&app.demand);
        let util_after = self.acc.utilization(&self.allocated, &self.available);
        if app.priority == 0 {
            entry.util_before = f64::INFINITY;
            entry.util_after = f64::INFINITY;
        } else {
            entry.util_before = util_before;
            entry.util_after = util_after;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::{Affinity, Dimensions};

    fn vector(values: &[f64]) -> ResourceVector {
        ResourceVector::from_values(values.to_vec())
    }

    fn app(name: &str, demand: &[f64], priority: i32, order: u64) -> Application {
        let mut app = Application::new(name, vector(demand), Affinity::unlimited(name))
            .with_priority(priority);
        app.order = order;
        app
    }

    fn queue_names(
        alloc: &Allocation,
        apps: &HashMap<String, Application>,
        free: &ResourceVector,
    ) -> Vec<String> {
        alloc
            .utilization_queue(apps, free)
            .map(|entry| entry.app)
            .collect()
    }

    #[test]
    fn test_priority_orders_private_queue() {
        let mut alloc = Allocation::new("t1", vector(&[4.0]));
        let mut apps = HashMap::new();
        for (name, priority, order) in [("a#1", 1, 1), ("a#2", 5, 2), ("a#3", 3, 3)] {
            alloc.add_app(name);
            apps.insert(name.to_string(), app(name, &[1.0], priority, order));
        }
        let names = queue_names(&alloc, &apps, &ResourceVector::zero(Dimensions::new(1)));
        assert_eq!(names, ["a#2", "a#3", "a#1"]);
    }

    #[test]
    fn test_placed_apps_sort_before_pending_at_same_priority() {
        let mut alloc = Allocation::new("t1", vector(&[4.0]));
        let mut apps = HashMap::new();
        let mut placed = app("a#1", &[1.0], 1, 2);
        placed.server = Some("s1".to_string());
        alloc.add_app("a#1");
        apps.insert("a#1".to_string(), placed);
        alloc.add_app("a#2");
        apps.insert("a#2".to_string(), app("a#2", &[1.0], 1, 1));
        let names = queue_names(&alloc, &apps, &ResourceVector::zero(Dimensions::new(1)));
        assert_eq!(names, ["a#1", "a#2"]);
    }

    #[test]
    fn test_rank_adjustment_applies_within_reservation() {
        let mut alloc = Allocation::new("t1", vector(&[2.0]));
        alloc.set_rank(100);
        alloc.set_rank_adjustment(10);
        let mut apps = HashMap::new();
        for (name, order) in [("a#1", 1), ("a#2", 2), ("a#3", 3)] {
            alloc.add_app(name);
            apps.insert(name.to_string(), app(name, &[1.0], 1, order));
        }
        let entries: Vec<QueueEntry> = alloc
            .utilization_queue(&apps, &ResourceVector::zero(Dimensions::new(1)))
            .collect();
        // First two apps fit inside the reservation and get the bonus rank.
        assert_eq!(entries[0].rank, 90);
        assert_eq!(entries[1].rank, 90);
        assert_eq!(entries[2].rank, 100);
    }

    #[test]
    fn test_max_utilization_demotes_overflow() {
        let mut alloc = Allocation::new("t1", vector(&[2.0]));
        alloc.set_max_utilization(1.0);
        let mut apps = HashMap::new();
        for (name, order) in [("a#1", 1), ("a#2", 2), ("a#3", 3)] {
            alloc.add_app(name);
            apps.insert(name.to_string(), app(name, &[1.0], 1, order));
        }
        let entries: Vec<QueueEntry> = alloc
            .utilization_queue(&apps, &ResourceVector::zero(Dimensions::new(1)))
            .collect();
        assert_ne!(entries[0].rank, RANK_UNPLACED);
        assert_ne!(entries[1].rank, RANK_UNPLACED);
        assert_eq!(entries[2].rank, RANK_UNPLACED);
    }

    #[test]
    fn test_priority_zero_pinned_to_infinite_utilization() {
        let mut alloc = Allocation::new("t1", vector(&[4.0]));
        alloc.set_rank_adjustment(10);
        alloc.add_app("a#1");
        let mut apps = HashMap::new();
        apps.insert("a#1".to_string(), app("a#1", &[1.0], 0, 1));
        let entries: Vec<QueueEntry> = alloc
            .utilization_queue(&apps, &ResourceVector::zero(Dimensions::new(1)))
            .collect();
        assert_eq!(entries[0].rank, DEFAULT_RANK);
        assert!(entries[0].util_before.is_infinite());
        assert!(entries[0].util_after.is_infinite());
    }

    #[test]
    fn test_sibling_tenants_interleave() {
        let mut root = Allocation::new("root", vector(&[0.0]));
        for tenant in ["t1", "t2"] {
            let sub = root.sub_allocation_mut(tenant);
            sub.update(vector(&[1.0]), DEFAULT_RANK, 0, f64::INFINITY);
        }
        let mut apps = HashMap::new();
        let mut order = 0;
        for tenant in ["t1", "t2"] {
            for i in 1..=2 {
                order += 1;
                let name = format!("{tenant}.app#{i}");
                root.find_or_create_mut(tenant).add_app(&name);
                apps.insert(name.clone(), app(&name, &[1.0], 1, order));
            }
        }
        let names = queue_names(&root, &apps, &vector(&[2.0]));
        // One app per tenant before either tenant's second app.
        assert_eq!(
            names,
            ["t1.app#1", "t2.app#1", "t1.app#2", "t2.app#2"]
        );
    }

    #[test]
    fn test_sub_allocation_inherits_label() {
        let mut root = Allocation::new("root", vector(&[1.0]));
        root.set_label(Some("gpu".to_string()));
        let sub = root.sub_allocation_mut("t1");
        assert_eq!(sub.label(), Some("gpu"));
        assert_eq!(sub.path(), "root/t1");
    }

    #[test]
    fn test_total_reserved_sums_tree() {
        let mut root = Allocation::new("root", vector(&[1.0, 0.0]));
        root.sub_allocation_mut("t1")
            .update(vector(&[2.0, 1.0]), DEFAULT_RANK, 0, f64::INFINITY);
        root.find_or_create_mut("t1/dev")
            .update(vector(&[1.0, 1.0]), DEFAULT_RANK, 0, f64::INFINITY);
        assert_eq!(root.total_reserved().as_slice(), &[4.0, 2.0]);
    }
}
