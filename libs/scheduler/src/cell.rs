//! The cell: the root of the topology and the scheduling cycle driver.
//!
//! Collaborators mutate the cell between cycles (server inventory,
//! applications, allocation configuration), then call [`Cell::schedule`].
//! One cycle runs to completion synchronously, performs no I/O, and returns
//! the placement diff to apply. The cycle never fails; expected runtime
//! conditions (identity exhaustion, infeasible demand, failed lease
//! renewal) leave the affected application pending and are logged.
//!
//! Cycle order is fixed: fix placements referencing vanished servers,
//! handle down/frozen servers, evict blacklisted apps, fix invalid
//! identities, then per partition build the fairness queue and run the
//! placement pass with its eviction cascade.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use warden_types::{Dimensions, IdentityGroup, TraitRegistry};

use crate::alloc::{Allocation, QueueEntry, RANK_UNPLACED};
use crate::app::{AppConstraints, Application, UnixSecs};
use crate::error::{Error, Result};
use crate::feasibility::FeasibilityTracker;
use crate::node::{NodeId, NodeState, ServerSpec, Topology};
use crate::partition::Partition;
use crate::strategy::PlacementStrategy;

/// One row of the diff returned by [`Cell::schedule`]: an application whose
/// `(server, expiry)` pair changed this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub name: String,
    pub old_server: Option<String>,
    pub old_expiry: UnixSecs,
    pub new_server: Option<String>,
    pub new_expiry: UnixSecs,
}

/// Top-level scheduler state: topology, applications, partitions, and
/// identity groups.
#[derive(Debug)]
pub struct Cell {
    name: String,
    dims: Dimensions,
    topology: Topology,
    apps: HashMap<String, Application>,
    partitions: BTreeMap<String, Partition>,
    identity_groups: HashMap<String, IdentityGroup>,
    trait_registry: TraitRegistry,
    next_order: u64,
}

impl Cell {
    #[must_use]
    pub fn new(name: impl Into<String>, dims: Dimensions) -> Self {
        let name = name.into();
        Self {
            topology: Topology::new(name.clone(), dims),
            name,
            dims,
            apps: HashMap::new(),
            partitions: BTreeMap::new(),
            identity_groups: HashMap::new(),
            trait_registry: TraitRegistry::new(),
            next_order: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Root bucket id, the anchor for building out the topology.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.topology.root()
    }

    /// Read access to the topology, mainly for inspection and tests.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub fn app(&self, name: &str) -> Option<&Application> {
        self.apps.get(name)
    }

    pub fn apps(&self) -> impl Iterator<Item = &Application> {
        self.apps.values()
    }

    // -------------------------------------------------------------------------
    // Topology mutation
    // -------------------------------------------------------------------------

    pub fn add_bucket(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        level: impl Into<String>,
    ) -> Result<NodeId> {
        self.topology.add_bucket(parent, name, level)
    }

    /// Adds a server, interning its traits and assigning it a reboot bucket
    /// in its partition.
    pub fn add_server(&mut self, parent: NodeId, spec: &ServerSpec) -> Result<NodeId> {
        self.add_server_at(parent, spec, Utc::now().timestamp())
    }

    /// Deterministic variant of [`add_server`](Self::add_server).
    pub fn add_server_at(
        &mut self,
        parent: NodeId,
        spec: &ServerSpec,
        now: UnixSecs,
    ) -> Result<NodeId> {
        let traits = self
            .trait_registry
            .intern_all(spec.traits.iter().map(String::as_str))?;
        let id = self.topology.add_server(parent, spec, traits)?;
        if let Some(label) = spec.label.clone() {
            let dims = self.dims;
            let partition = self
                .partitions
                .entry(label.clone())
                .or_insert_with(|| Partition::new(label, dims));
            let deadline = partition.assign_reboot_bucket(&spec.name, spec.up_since, now);
            self.topology.set_server_valid_until(id, deadline);
        }
        Ok(id)
    }

    /// Applies an incoming server definition: a no-op when nothing changed,
    /// otherwise a full replacement. Matching definitions keep placements
    /// and uptime history.
    pub fn update_server(
        &mut self,
        parent: NodeId,
        spec: &ServerSpec,
        now: UnixSecs,
    ) -> Result<NodeId> {
        if let Some(id) = self.topology.server_id(&spec.name) {
            let traits = self
                .trait_registry
                .intern_all(spec.traits.iter().map(String::as_str))?;
            if self.topology.server_is_same(id, spec, traits) {
                return Ok(id);
            }
            debug!(server = %spec.name, "server definition changed, replacing");
            self.remove_server(&spec.name)?;
        }
        self.add_server_at(parent, spec, now)
    }

    /// Removes a server. Placements referencing it are fixed up at the
    /// start of the next cycle.
    pub fn remove_server(&mut self, name: &str) -> Result<()> {
        let id = self
            .topology
            .server_id(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        self.topology.remove_node(id);
        for partition in self.partitions.values_mut() {
            partition.forget_server(name);
        }
        Ok(())
    }

    /// Removes a bucket subtree, dropping every server under it.
    pub fn remove_bucket(&mut self, id: NodeId) {
        let before = self.topology.server_names();
        self.topology.remove_node(id);
        for name in before {
            if self.topology.server_id(&name).is_none() {
                for partition in self.partitions.values_mut() {
                    partition.forget_server(&name);
                }
            }
        }
    }

    pub fn set_server_state(&mut self, name: &str, state: NodeState, at: UnixSecs) -> Result<()> {
        let id = self
            .topology
            .server_id(name)
            .ok_or_else(|| Error::UnknownNode(name.to_string()))?;
        self.topology.set_server_state(id, state, at);
        Ok(())
    }

    pub fn set_bucket_strategy(&mut self, bucket: NodeId, affinity: &str, kind: PlacementStrategy) {
        self.topology.set_strategy(bucket, affinity, kind);
    }

    pub fn set_default_strategy(&mut self, bucket: NodeId, kind: PlacementStrategy) {
        self.topology.set_default_strategy(bucket, kind);
    }

    // -------------------------------------------------------------------------
    // Applications, allocations, identity groups
    // -------------------------------------------------------------------------

    /// Registers an application under an allocation path. The first path
    /// segment is the partition label; the rest names nested
    /// sub-allocations, created on first reference.
    pub fn add_app(&mut self, allocation: &str, mut app: Application) -> Result<()> {
        if self.apps.contains_key(&app.name) {
            return Err(Error::DuplicateApp(app.name));
        }
        assert_eq!(
            app.demand.dims(),
            self.dims.count(),
            "application demand dimension mismatch"
        );
        let (label, sub_path) = split_allocation_path(allocation);
        let dims = self.dims;
        let partition = self
            .partitions
            .entry(label.to_string())
            .or_insert_with(|| Partition::new(label, dims));
        let max = partition.max_app_lease();
        if max > 0 && app.lease > max {
            return Err(Error::LeaseTooLong {
                lease: app.lease,
                max,
            });
        }
        let alloc = partition.allocation_mut().find_or_create_mut(sub_path);
        alloc.add_app(&app.name);
        app.constraints = AppConstraints {
            label: alloc.label().map(str::to_string),
            traits: alloc.traits(),
        };
        app.allocation = Some(allocation.to_string());
        self.next_order += 1;
        app.order = self.next_order;
        debug!(app = %app.name, allocation, order = app.order, "application registered");
        self.apps.insert(app.name.clone(), app);
        Ok(())
    }

    /// Deregisters an application, freeing its placement and identity.
    pub fn remove_app(&mut self, name: &str) -> Result<Application> {
        let mut app = self
            .apps
            .remove(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;
        if let Some(server) = app.server.take() {
            if let Some(id) = self.topology.server_id(&server) {
                self.topology.remove_app(id, &app);
            }
        }
        self.release_identity(&mut app);
        if let Some(path) = app.allocation.clone() {
            let (label, sub_path) = split_allocation_path(&path);
            if let Some(partition) = self.partitions.get_mut(label) {
                partition
                    .allocation_mut()
                    .find_or_create_mut(sub_path)
                    .remove_app(name);
            }
        }
        Ok(app)
    }

    /// Gets or creates the allocation at a path (`label` or
    /// `label/tenant/...`).
    pub fn allocation_mut(&mut self, path: &str) -> &mut Allocation {
        let (label, sub_path) = split_allocation_path(path);
        let dims = self.dims;
        self.partitions
            .entry(label.to_string())
            .or_insert_with(|| Partition::new(label, dims))
            .allocation_mut()
            .find_or_create_mut(sub_path)
    }

    /// Interns trait names and requires them on the allocation's apps.
    pub fn set_allocation_traits<'a, I>(&mut self, path: &str, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let traits = self.trait_registry.intern_all(names)?;
        self.allocation_mut(path).set_traits(traits);
        Ok(())
    }

    /// Gets or creates the partition for a label, for reboot and lease
    /// policy configuration.
    pub fn partition_mut(&mut self, label: &str) -> &mut Partition {
        let dims = self.dims;
        self.partitions
            .entry(label.to_string())
            .or_insert_with(|| Partition::new(label, dims))
    }

    #[must_use]
    pub fn partition(&self, label: &str) -> Option<&Partition> {
        self.partitions.get(label)
    }

    /// Flags an app to renew its lease on its current server next cycle.
    pub fn request_renew(&mut self, name: &str) -> Result<()> {
        self.flag_app(name, |app| app.renew = true)
    }

    /// Flags an app for removal from a frozen server.
    pub fn request_unschedule(&mut self, name: &str) -> Result<()> {
        self.flag_app(name, |app| app.unschedule = true)
    }

    /// Blacklisted apps are evicted and excluded from placement until
    /// cleared.
    pub fn set_blacklisted(&mut self, name: &str, blacklisted: bool) -> Result<()> {
        self.flag_app(name, |app| app.blacklisted = blacklisted)
    }

    fn flag_app(&mut self, name: &str, f: impl FnOnce(&mut Application)) -> Result<()> {
        let app = self
            .apps
            .get_mut(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?;
        f(app);
        Ok(())
    }

    /// Creates or resizes an identity group. Identities above a shrunk
    /// count are reclaimed from their apps at the next cycle.
    pub fn configure_identity_group(&mut self, name: &str, count: u32) {
        match self.identity_groups.get_mut(name) {
            Some(group) => group.adjust(count),
            None => {
                self.identity_groups
                    .insert(name.to_string(), IdentityGroup::new(count));
            }
        }
    }

    pub fn remove_identity_group(&mut self, name: &str) {
        self.identity_groups.remove(name);
    }

    #[must_use]
    pub fn identity_group(&self, name: &str) -> Option<&IdentityGroup> {
        self.identity_groups.get(name)
    }

    // -------------------------------------------------------------------------
    // The scheduling cycle
    // -------------------------------------------------------------------------

    /// Runs one scheduling cycle at the current wall-clock time.
    pub fn schedule(&mut self) -> Vec<Placement> {
        self.schedule_at(Utc::now().timestamp())
    }

    /// Runs one scheduling cycle at an explicit timestamp and returns the
    /// placement diff.
    #[instrument(skip_all, fields(cell = %self.name, now = now))]
    pub fn schedule_at(&mut self, now: UnixSecs) -> Vec<Placement> {
        let before: HashMap<String, (Option<String>, UnixSecs)> = self
            .apps
            .iter()
            .map(|(name, app)| (name.clone(), (app.server.clone(), app.placement_expiry)))
            .collect();

        self.restamp_constraints();
        self.fix_invalid_placements();
        self.handle_inactive_servers(now);
        self.handle_blacklisted();
        self.fix_invalid_identities();

        let labels: Vec<String> = self.partitions.keys().cloned().collect();
        for label in labels {
            let Some(partition) = self.partitions.get_mut(&label) else {
                continue;
            };
            partition.tick(now);
            let size = self.topology.size(&label);
            let queue: Vec<QueueEntry> = partition
                .allocation()
                .utilization_queue(&self.apps, &size)
                .collect();
            for entry in &queue {
                if let Some(app) = self.apps.get_mut(&entry.app) {
                    app.final_rank = entry.rank;
                    app.final_util = entry.util_after;
                }
            }
            self.find_placements(&queue, now);
        }

        let mut diff: Vec<Placement> = Vec::new();
        for (name, (old_server, old_expiry)) in before {
            let (new_server, new_expiry) = self
                .apps
                .get(&name)
                .map_or((None, 0), |app| (app.server.clone(), app.placement_expiry));
            if new_server != old_server || new_expiry != old_expiry {
                diff.push(Placement {
                    name,
                    old_server,
                    old_expiry,
                    new_server,
                    new_expiry,
                });
            }
        }
        diff.sort_by(|a, b| a.name.cmp(&b.name));
        info!(changed = diff.len(), apps = self.apps.len(), "cycle complete");
        diff
    }

    /// Copies each allocation's label and traits onto its apps, so config
    /// changes between cycles take effect without re-registration.
    fn restamp_constraints(&mut self) {
        let mut stamped: Vec<(String, AppConstraints)> = Vec::new();
        for partition in self.partitions.values() {
            partition.allocation().for_each(&mut |alloc| {
                for name in alloc.app_names() {
                    stamped.push((
                        name.to_string(),
                        AppConstraints {
                            label: alloc.label().map(str::to_string),
                            traits: alloc.traits(),
                        },
                    ));
                }
            });
        }
        for (name, constraints) in stamped {
            if let Some(app) = self.apps.get_mut(&name) {
                app.constraints = constraints;
            }
        }
    }

    fn fix_invalid_placements(&mut self) {
        for app in self.apps.values_mut() {
            let Some(server) = app.server.clone() else {
                continue;
            };
            let hosted = self
                .topology
                .server_id(&server)
                .is_some_and(|id| self.topology.server_hosts(id, &app.name));
            if hosted {
                continue;
            }
            debug!(app = %app.name, server, "placed on vanished server, detaching");
            app.server = None;
            app.placement_expiry = 0;
            app.evicted = true;
            if let Some(id) = app.identity.take() {
                if let Some(group) = app
                    .identity_group
                    .as_ref()
                    .and_then(|g| self.identity_groups.get_mut(g))
                {
                    group.release(id);
                }
            }
        }
    }

    fn handle_inactive_servers(&mut self, now: UnixSecs) {
        for name in self.topology.server_names() {
            let Some(id) = self.topology.server_id(&name) else {
                continue;
            };
            let state = self.topology.state(id);
            if state == NodeState::Up {
                continue;
            }
            let since = self.topology.state_since(id);
            for app_name in self.topology.server_apps(id) {
                let Some(app) = self.apps.get_mut(&app_name) else {
                    continue;
                };
                let evict = match state {
                    NodeState::Down => {
                        app.data_retention == 0 || since + app.data_retention <= now
                    }
                    NodeState::Frozen => app.unschedule,
                    NodeState::Up => false,
                };
                if evict {
                    debug!(app = %app.name, server = %name, ?state, "evicting from inactive server");
                    app.server = None;
                    app.placement_expiry = 0;
                    app.evicted = true;
                    self.topology.remove_app(id, app);
                }
            }
        }
    }

    fn handle_blacklisted(&mut self) {
        for app in self.apps.values_mut() {
            if !app.blacklisted {
                continue;
            }
            let Some(server) = app.server.take() else {
                continue;
            };
            app.placement_expiry = 0;
            app.evicted = true;
            if let Some(id) = self.topology.server_id(&server) {
                self.topology.remove_app(id, app);
            }
        }
    }

    fn fix_invalid_identities(&mut self) {
        for app in self.apps.values_mut() {
            let Some(id) = app.identity else { continue };
            let valid = app
                .identity_group
                .as_ref()
                .and_then(|g| self.identity_groups.get(g))
                .is_some_and(|group| id < group.count());
            if valid {
                continue;
            }
            app.identity = None;
            if let Some(server) = app.server.take() {
                app.placement_expiry = 0;
                app.evicted = true;
                if let Some(sid) = self.topology.server_id(&server) {
                    self.topology.remove_app(sid, app);
                }
            }
        }
    }

    /// Single pass over one partition's ordered queue. Eviction candidates
    /// come from the tail of the same queue, never from positions at or
    /// before the app currently being placed.
    fn find_placements(&mut self, queue: &[QueueEntry], now: UnixSecs) {
        let mut feasibility = FeasibilityTracker::new();
        for i in 0..queue.len() {
            let entry = &queue[i];
            let Some(mut app) = self.apps.remove(&entry.app) else {
                continue;
            };

            if app.blacklisted {
                self.apps.insert(entry.app.clone(), app);
                continue;
            }

            if entry.rank == RANK_UNPLACED {
                if let Some(server) = app.server.take() {
                    debug!(app = %app.name, "over quota, evicting");
                    app.placement_expiry = 0;
                    app.evicted = true;
                    if let Some(sid) = self.topology.server_id(&server) {
                        self.topology.remove_app(sid, &app);
                    }
                }
                self.apps.insert(entry.app.clone(), app);
                continue;
            }

            // Lease renewal happens in place. A failed renewal frees the
            // server but remembers it as a restore candidate: the app first
            // tries to move to a server its lease fits on, and only falls
            // back to the candidate when no such server exists. It does not
            // count as evicted, so the restore is reachable below.
            let mut restore: Option<(String, UnixSecs)> = None;
            if app.renew {
                if let Some(server) = app.server.clone() {
                    match self.topology.server_id(&server) {
                        Some(sid) if self.topology.check_app_lifetime(sid, &app, now) => {
                            app.placement_expiry = expiry_at(app.lease, now);
                            app.renew = false;
                        }
                        Some(sid) => {
                            debug!(app = %app.name, server, "lease renewal failed");
                            restore = Some((server, app.placement_expiry));
                            self.topology.remove_app(sid, &app);
                            app.server = None;
                            app.placement_expiry = 0;
                            app.renew = false;
                        }
                        None => {
                            app.server = None;
                            app.placement_expiry = 0;
                            app.renew = false;
                            app.evicted = true;
                        }
                    }
                } else {
                    app.renew = false;
                }
            }

            if app.is_placed() {
                self.apps.insert(entry.app.clone(), app);
                continue;
            }

            if let Some(group_name) = app.identity_group.clone() {
                if app.identity.is_none() {
                    let acquired = self
                        .identity_groups
                        .get_mut(&group_name)
                        .and_then(|group| group.acquire().ok());
                    match acquired {
                        Some(id) => app.identity = Some(id),
                        None => {
                            debug!(app = %app.name, group = %group_name, "identity unavailable");
                            self.apps.insert(entry.app.clone(), app);
                            continue;
                        }
                    }
                }
            }

            if app.schedule_once && app.evicted {
                self.apps.insert(entry.app.clone(), app);
                continue;
            }

            let mut placed = false;
            if feasibility.feasible(&app) {
                if let Some(sid) = self.topology.place(&app, now) {
                    app.server = Some(self.topology.name(sid).to_string());
                    app.placement_expiry = expiry_at(app.lease, now);
                    app.evicted = false;
                    placed = true;
                } else {
                    placed = self.evict_and_retry(queue, i, &mut app, now);
                }
            }

            if !placed {
                if let Some((server, old_expiry)) = restore {
                    if let Some(sid) = self.topology.server_id(&server) {
                        if self.topology.restore_on_server(sid, &app) {
                            app.server = Some(server);
                            app.placement_expiry = old_expiry;
                            app.renew = true;
                            app.evicted = false;
                        }
                    }
                } else {
                    self.release_identity(&mut app);
                    feasibility.record_failure(&app);
                    debug!(app = %app.name, "no placement found");
                }
            }
            self.apps.insert(entry.app.clone(), app);
        }
    }

    /// Evicts queue-tail apps one at a time, retrying the pending app on
    /// each freed server, stopping before reaching position `i`.
    fn evict_and_retry(
        &mut self,
        queue: &[QueueEntry],
        i: usize,
        app: &mut Application,
        now: UnixSecs,
    ) -> bool {
        for j in (i + 1..queue.len()).rev() {
            let Some(victim) = self.apps.get_mut(&queue[j].app) else {
                continue;
            };
            let Some(server) = victim.server.clone() else {
                continue;
            };
            let Some(sid) = self.topology.server_id(&server) else {
                continue;
            };
            debug!(victim = %victim.name, for_app = %app.name, server, "evicting for better-ranked app");
            victim.server = None;
            victim.placement_expiry = 0;
            victim.evicted = true;
            self.topology.remove_app(sid, victim);
            if self.topology.place_on_server(sid, app, now, true) {
                app.server = Some(server);
                app.placement_expiry = expiry_at(app.lease, now);
                app.evicted = false;
                return true;
            }
        }
        false
    }

    fn release_identity(&mut self, app: &mut Application) {
        if let Some(id) = app.identity.take() {
            if let Some(group) = app
                .identity_group
                .as_ref()
                .and_then(|g| self.identity_groups.get_mut(g))
            {
                group.release(id);
            }
        }
    }
}

fn expiry_at(lease: i64, now: UnixSecs) -> UnixSecs {
    if lease > 0 {
        now + lease
    } else {
        0
    }
}

fn split_allocation_path(path: &str) -> (&str, &str) {
    match path.split_once('/') {
        Some((label, rest)) => (label, rest),
        None => (path, ""),
    }
}
