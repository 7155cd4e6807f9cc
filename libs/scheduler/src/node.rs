//! The topology tree: buckets, servers, and aggregate propagation.
//!
//! Nodes live in an arena indexed by [`NodeId`]; children are index slots
//! with holes left where nodes were removed, and the parent link is a plain
//! index, so the parent/child cycle never turns into shared ownership.
//!
//! Aggregates kept on every node and their propagation rules:
//!
//! - traits: own traits OR'd with the union of all children's traits;
//! - labels: union of all descendants' labels;
//! - affinity counts: sum over descendants' placed applications;
//! - valid-until: max over `up` children (`0` = unbounded / empty);
//! - free capacity: element-wise **max** over `up` children; an application
//!   must fit on one descendant server, capacity never sums across siblings.
//!
//! Capacity increases propagate upward unconditionally (max with the
//! existing value). Decreases recompute from live `up` children and only
//! keep walking while the recomputed value is strictly lower in at least one
//! dimension. A server leaving the `up` state is a capacity drop to zero as
//! far as its parent is concerned.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use warden_types::{Dimensions, ResourceVector, TraitSet};

use crate::app::{Application, UnixSecs};
use crate::strategy::{PlacementStrategy, StrategyCursor};

/// The level tag servers carry; bucket levels are free-form.
pub const SERVER_LEVEL: &str = "server";

/// Arena index of a topology node. Stable for the life of the cell; removed
/// nodes leave tombstones and their ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    #[cfg(test)]
    pub(crate) fn from_index(idx: usize) -> Self {
        Self(idx)
    }
}

/// Server availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Accepting placements.
    Up,
    /// Gone; placements are evicted once data retention lapses.
    Down,
    /// Existing placements persist, no new ones accepted.
    Frozen,
}

/// Collaborator-supplied server definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub capacity: Vec<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub up_since: UnixSecs,
    #[serde(default)]
    pub presence_id: Option<String>,
}

#[derive(Debug)]
struct NodeCore {
    name: String,
    level: String,
    parent: Option<NodeId>,
    children: Vec<Option<NodeId>>,
    children_by_name: HashMap<String, NodeId>,
    free_capacity: ResourceVector,
    own_traits: TraitSet,
    traits: TraitSet,
    labels: HashSet<String>,
    affinity_counts: HashMap<String, u32>,
    valid_until: UnixSecs,
    state: NodeState,
    state_since: UnixSecs,
}

#[derive(Debug)]
enum NodeKind {
    Bucket {
        strategies: HashMap<String, StrategyCursor>,
        default_strategy: PlacementStrategy,
    },
    Server {
        init_capacity: ResourceVector,
        label: Option<String>,
        apps: BTreeSet<String>,
        up_since: UnixSecs,
        presence_id: Option<String>,
    },
}

#[derive(Debug)]
struct Node {
    core: NodeCore,
    kind: NodeKind,
    attached: bool,
}

/// The cell's node arena.
#[derive(Debug)]
pub struct Topology {
    dims: Dimensions,
    nodes: Vec<Node>,
    root: NodeId,
    servers: HashMap<String, NodeId>,
}

impl Topology {
    /// Creates a topology with a single root bucket at level `cell`.
    #[must_use]
    pub fn new(cell_name: impl Into<String>, dims: Dimensions) -> Self {
        let root_core = NodeCore {
            name: cell_name.into(),
            level: "cell".to_string(),
            parent: None,
            children: Vec::new(),
            children_by_name: HashMap::new(),
            free_capacity: ResourceVector::zero(dims),
            own_traits: TraitSet::empty(),
            traits: TraitSet::empty(),
            labels: HashSet::new(),
            affinity_counts: HashMap::new(),
            valid_until: 0,
            state: NodeState::Up,
            state_since: 0,
        };
        let root = Node {
            core: root_core,
            kind: NodeKind::Bucket {
                strategies: HashMap::new(),
                default_strategy: PlacementStrategy::Spread,
            },
            attached: true,
        };
        Self {
            dims,
            nodes: vec![root],
            root: NodeId(0),
            servers: HashMap::new(),
        }
    }

    /// The root bucket of the cell.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Resource dimensions of the cell.
    #[must_use]
    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    fn core(&self, id: NodeId) -> &NodeCore {
        &self.nodes[id.0].core
    }

    fn core_mut(&mut self, id: NodeId) -> &mut NodeCore {
        &mut self.nodes[id.0].core
    }

    /// Node name.
    #[must_use]
    pub fn name(&self, id: NodeId) -> &str {
        &self.core(id).name
    }

    /// Node state; buckets are always `Up`.
    #[must_use]
    pub fn state(&self, id: NodeId) -> NodeState {
        self.core(id).state
    }

    /// Timestamp of the node's last state change.
    #[must_use]
    pub fn state_since(&self, id: NodeId) -> UnixSecs {
        self.core(id).state_since
    }

    /// Aggregated free capacity.
    #[must_use]
    pub fn free_capacity(&self, id: NodeId) -> &ResourceVector {
        &self.core(id).free_capacity
    }

    /// Aggregated trait set.
    #[must_use]
    pub fn traits(&self, id: NodeId) -> TraitSet {
        self.core(id).traits
    }

    /// Reboot deadline, `0` = unbounded.
    #[must_use]
    pub fn valid_until(&self, id: NodeId) -> UnixSecs {
        self.core(id).valid_until
    }

    /// Aggregated placed-application count for an affinity name.
    #[must_use]
    pub fn affinity_count(&self, id: NodeId, affinity: &str) -> u32 {
        self.core(id)
            .affinity_counts
            .get(affinity)
            .copied()
            .unwrap_or(0)
    }

    /// Looks up an attached server by name.
    #[must_use]
    pub fn server_id(&self, name: &str) -> Option<NodeId> {
        self.servers.get(name).copied()
    }

    /// Whether the server currently hosts the named application. Guards
    /// against stale placements when a server is replaced under the same
    /// name.
    #[must_use]
    pub fn server_hosts(&self, id: NodeId, app: &str) -> bool {
        match &self.nodes[id.0].kind {
            NodeKind::Server { apps, .. } => apps.contains(app),
            NodeKind::Bucket { .. } => false,
        }
    }

    /// Names of applications placed on a server.
    #[must_use]
    pub fn server_apps(&self, id: NodeId) -> Vec<String> {
        match &self.nodes[id.0].kind {
            NodeKind::Server { apps, .. } => apps.iter().cloned().collect(),
            NodeKind::Bucket { .. } => Vec::new(),
        }
    }

    /// The server's fixed initial capacity.
    #[must_use]
    pub fn init_capacity(&self, id: NodeId) -> Option<&ResourceVector> {
        match &self.nodes[id.0].kind {
            NodeKind::Server { init_capacity, .. } => Some(init_capacity),
            NodeKind::Bucket { .. } => None,
        }
    }

    /// When the server came up.
    #[must_use]
    pub fn up_since(&self, id: NodeId) -> UnixSecs {
        match &self.nodes[id.0].kind {
            NodeKind::Server { up_since, .. } => *up_since,
            NodeKind::Bucket { .. } => 0,
        }
    }

    /// Names of attached servers, sorted.
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sum of `init_capacity` over attached servers carrying `label`.
    ///
    /// This is the partition "total size" fed to the fairness queue. Server
    /// state is deliberately ignored so the denominator stays stable while
    /// servers bounce through reboots.
    #[must_use]
    pub fn size(&self, label: &str) -> ResourceVector {
        let mut total = ResourceVector::zero(self.dims);
        for &id in self.servers.values() {
            if let NodeKind::Server {
                init_capacity,
                label: Some(server_label),
                ..
            } = &self.nodes[id.0].kind
            {
                if server_label == label {
                    total.add_assign(init_capacity);
                }
            }
        }
        total
    }

    // -------------------------------------------------------------------------
    // Construction and mutation
    // -------------------------------------------------------------------------

    /// Adds a bucket under `parent`.
    ///
    /// Fails if `parent` is a server or a sibling already uses the name.
    pub fn add_bucket(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        level: impl Into<String>,
    ) -> Result<NodeId, crate::Error> {
        let name = name.into();
        let core = NodeCore {
            name: name.clone(),
            level: level.into(),
            parent: None,
            children: Vec::new(),
            children_by_name: HashMap::new(),
            free_capacity: ResourceVector::zero(self.dims),
            own_traits: TraitSet::empty(),
            traits: TraitSet::empty(),
            labels: HashSet::new(),
            affinity_counts: HashMap::new(),
            valid_until: 0,
            state: NodeState::Up,
            state_since: 0,
        };
        let kind = NodeKind::Bucket {
            strategies: HashMap::new(),
            default_strategy: PlacementStrategy::Spread,
        };
        let id = self.alloc(core, kind);
        self.attach(parent, id)?;
        Ok(id)
    }

    /// Adds a server under `parent`. `traits` must already be interned.
    pub fn add_server(
        &mut self,
        parent: NodeId,
        spec: &ServerSpec,
        traits: TraitSet,
    ) -> Result<NodeId, crate::Error> {
        assert_eq!(
            spec.capacity.len(),
            self.dims.count(),
            "server capacity dimension mismatch"
        );
        if self.servers.contains_key(&spec.name) {
            return Err(crate::Error::DuplicateNode(spec.name.clone()));
        }
        let capacity = ResourceVector::from_values(spec.capacity.clone());
        let mut labels = HashSet::new();
        if let Some(label) = &spec.label {
            labels.insert(label.clone());
        }
        let core = NodeCore {
            name: spec.name.clone(),
            level: SERVER_LEVEL.to_string(),
            parent: None,
            children: Vec::new(),
            children_by_name: HashMap::new(),
            free_capacity: capacity.clone(),
            own_traits: traits,
            traits,
            labels,
            affinity_counts: HashMap::new(),
            valid_until: 0,
            state: NodeState::Up,
            state_since: spec.up_since,
        };
        let kind = NodeKind::Server {
            init_capacity: capacity,
            label: spec.label.clone(),
            apps: BTreeSet::new(),
            up_since: spec.up_since,
            presence_id: spec.presence_id.clone(),
        };
        let id = self.alloc(core, kind);
        self.attach(parent, id)?;
        self.servers.insert(spec.name.clone(), id);
        debug!(server = %spec.name, "server attached");
        Ok(id)
    }

    fn alloc(&mut self, core: NodeCore, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            core,
            kind,
            attached: false,
        });
        id
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), crate::Error> {
        assert!(
            self.core(child).parent.is_none(),
            "node {:?} already has a parent",
            self.core(child).name
        );
        let child_name = self.core(child).name.clone();
        {
            let p = &mut self.nodes[parent.0];
            let NodeKind::Bucket { .. } = p.kind else {
                return Err(crate::Error::NotABucket(p.core.name.clone()));
            };
            if p.core.children_by_name.contains_key(&child_name) {
                return Err(crate::Error::DuplicateNode(child_name));
            }
            // Reuse the first hole so slot indices stay bounded.
            let slot = p.core.children.iter().position(Option::is_none);
            match slot {
                Some(idx) => p.core.children[idx] = Some(child),
                None => p.core.children.push(Some(child)),
            }
            p.core.children_by_name.insert(child_name, child);
        }
        self.core_mut(child).parent = Some(parent);
        self.nodes[child.0].attached = true;

        // Aggregate the child's traits, labels, affinity counts, deadline,
        // and capacity into every ancestor.
        let traits = self.core(child).traits;
        let labels: Vec<String> = self.core(child).labels.iter().cloned().collect();
        let counts: Vec<(String, u32)> = self
            .core(child)
            .affinity_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let valid_until = self.core(child).valid_until;
        let child_up = self.core(child).state == NodeState::Up;

        let mut ancestor = Some(parent);
        while let Some(id) = ancestor {
            let core = self.core_mut(id);
            core.traits.union_with(traits);
            core.labels.extend(labels.iter().cloned());
            for (name, count) in &counts {
                *core.affinity_counts.entry(name.clone()).or_insert(0) += count;
            }
            if child_up && valid_until > core.valid_until {
                core.valid_until = valid_until;
            }
            ancestor = core.parent;
        }
        self.adjust_capacity_up(child);
        Ok(())
    }

    /// Detaches a node (and its subtree) from the tree, leaving a hole in
    /// the parent's child slots.
    pub fn remove_node(&mut self, id: NodeId) {
        let Some(parent) = self.core(id).parent else {
            panic!("cannot remove the root bucket");
        };
        let name = self.core(id).name.clone();
        {
            let p = self.core_mut(parent);
            p.children_by_name.remove(&name);
            for slot in &mut p.children {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
        self.core_mut(id).parent = None;

        let counts: Vec<(String, u32)> = self
            .core(id)
            .affinity_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let mut ancestor = Some(parent);
        while let Some(aid) = ancestor {
            let core = self.core_mut(aid);
            for (affinity, count) in &counts {
                if let Some(existing) = core.affinity_counts.get_mut(affinity) {
                    *existing = existing.saturating_sub(*count);
                    if *existing == 0 {
                        core.affinity_counts.remove(affinity);
                    }
                }
            }
            ancestor = core.parent;
        }
        self.refresh_traits_chain(Some(parent));
        self.refresh_labels_chain(Some(parent));
        self.refresh_valid_until_chain(Some(parent));
        self.recompute_capacity_down(Some(parent));
        self.mark_detached(id);
        debug!(node = %name, "node removed");
    }

    fn mark_detached(&mut self, id: NodeId) {
        self.nodes[id.0].attached = false;
        if let NodeKind::Server { .. } = self.nodes[id.0].kind {
            let name = self.core(id).name.clone();
            self.servers.remove(&name);
        }
        let children: Vec<NodeId> = self.core(id).children.iter().flatten().copied().collect();
        for child in children {
            self.mark_detached(child);
        }
    }

    /// Whether the node is still part of the tree.
    #[must_use]
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.nodes[id.0].attached
    }

    /// Transitions a server's state, adjusting ancestor capacity and
    /// deadlines.
    pub fn set_server_state(&mut self, id: NodeId, state: NodeState, at: UnixSecs) {
        let core = self.core(id);
        if core.state == state {
            return;
        }
        let was_up = core.state == NodeState::Up;
        let parent = core.parent;
        {
            let core = self.core_mut(id);
            core.state = state;
            core.state_since = at;
        }
        debug!(server = %self.core(id).name, ?state, "server state changed");
        if state == NodeState::Up {
            self.adjust_capacity_up(id);
        } else if was_up {
            self.recompute_capacity_down(parent);
        }
        self.refresh_valid_until_chain(parent);
    }

    /// Sets a server's reboot deadline and propagates it up the tree.
    pub fn set_server_valid_until(&mut self, id: NodeId, valid_until: UnixSecs) {
        let parent = self.core(id).parent;
        self.core_mut(id).valid_until = valid_until;
        self.refresh_valid_until_chain(parent);
    }

    /// Per-bucket, per-affinity strategy override.
    pub fn set_strategy(&mut self, bucket: NodeId, affinity: &str, kind: PlacementStrategy) {
        match &mut self.nodes[bucket.0].kind {
            NodeKind::Bucket { strategies, .. } => {
                strategies.insert(affinity.to_string(), StrategyCursor::new(kind));
            }
            NodeKind::Server { .. } => panic!("servers have no placement strategy"),
        }
    }

    /// Default strategy for affinities without an override on this bucket.
    pub fn set_default_strategy(&mut self, bucket: NodeId, kind: PlacementStrategy) {
        match &mut self.nodes[bucket.0].kind {
            NodeKind::Bucket {
                default_strategy, ..
            } => *default_strategy = kind,
            NodeKind::Server { .. } => panic!("servers have no placement strategy"),
        }
    }

    /// True iff an incoming definition matches the attached server, so
    /// inventory refreshes don't churn placements or reset uptime history.
    #[must_use]
    pub fn server_is_same(&self, id: NodeId, spec: &ServerSpec, traits: TraitSet) -> bool {
        match &self.nodes[id.0].kind {
            NodeKind::Server {
                init_capacity,
                label,
                presence_id,
                ..
            } => {
                init_capacity.as_slice() == spec.capacity.as_slice()
                    && *label == spec.label
                    && *presence_id == spec.presence_id
                    && self.core(id).own_traits == traits
            }
            NodeKind::Bucket { .. } => false,
        }
    }

    // -------------------------------------------------------------------------
    // Aggregate propagation
    // -------------------------------------------------------------------------

    fn adjust_capacity_up(&mut self, from: NodeId) {
        if self.core(from).state != NodeState::Up {
            return;
        }
        let mut current = from;
        while let Some(parent) = self.core(current).parent {
            let cap = self.core(current).free_capacity.clone();
            self.core_mut(parent).free_capacity.max_assign(&cap);
            current = parent;
        }
    }

    fn recompute_capacity_down(&mut self, mut node: Option<NodeId>) {
        while let Some(id) = node {
            let mut recomputed = ResourceVector::zero(self.dims);
            for child in self.core(id).children.iter().flatten() {
                let child_core = self.core(*child);
                if child_core.state == NodeState::Up {
                    recomputed.max_assign(&child_core.free_capacity);
                }
            }
            let core = self.core_mut(id);
            let strictly_less = recomputed.any_less_than(&core.free_capacity);
            core.free_capacity = recomputed;
            if !strictly_less {
                break;
            }
            node = core.parent;
        }
    }

    fn refresh_traits_chain(&mut self, mut node: Option<NodeId>) {
        while let Some(id) = node {
            let mut traits = self.core(id).own_traits;
            for child in self.core(id).children.iter().flatten() {
                traits.union_with(self.core(*child).traits);
            }
            let core = self.core_mut(id);
            if core.traits == traits {
                break;
            }
            core.traits = traits;
            node = core.parent;
        }
    }

    fn refresh_labels_chain(&mut self, mut node: Option<NodeId>) {
        while let Some(id) = node {
            let mut labels = HashSet::new();
            if let NodeKind::Server {
                label: Some(own), ..
            } = &self.nodes[id.0].kind
            {
                labels.insert(own.clone());
            }
            for child in self.core(id).children.iter().flatten() {
                labels.extend(self.core(*child).labels.iter().cloned());
            }
            let core = self.core_mut(id);
            if core.labels == labels {
                break;
            }
            core.labels = labels;
            node = core.parent;
        }
    }

    fn refresh_valid_until_chain(&mut self, mut node: Option<NodeId>) {
        while let Some(id) = node {
            let mut deadline = 0;
            for child in self.core(id).children.iter().flatten() {
                let child_core = self.core(*child);
                if child_core.state == NodeState::Up && child_core.valid_until > deadline {
                    deadline = child_core.valid_until;
                }
            }
            let core = self.core_mut(id);
            core.valid_until = deadline;
            node = core.parent;
        }
    }

    fn bump_affinity(&mut self, server: NodeId, affinity: &str, delta: i32) {
        let mut node = Some(server);
        while let Some(id) = node {
            let core = self.core_mut(id);
            let entry = core.affinity_counts.entry(affinity.to_string()).or_insert(0);
            if delta > 0 {
                *entry += delta as u32;
            } else {
                *entry = entry.saturating_sub((-delta) as u32);
            }
            if *entry == 0 {
                core.affinity_counts.remove(affinity);
            }
            node = core.parent;
        }
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    /// Label, trait, affinity-limit, and capacity admission at one node.
    #[must_use]
    pub fn check_app_constraints(&self, id: NodeId, app: &Application) -> bool {
        let core = self.core(id);
        if let Some(label) = &app.constraints.label {
            if !core.labels.contains(label) {
                return false;
            }
        }
        if !app.constraints.traits.is_subset_of(core.traits) {
            return false;
        }
        let count = core
            .affinity_counts
            .get(&app.affinity.name)
            .copied()
            .unwrap_or(0);
        if count >= app.affinity.limit_at(&core.level) {
            return false;
        }
        app.demand.fits_within(&core.free_capacity)
    }

    /// Whether the app's lease fits before the server's reboot deadline.
    #[must_use]
    pub fn check_app_lifetime(&self, id: NodeId, app: &Application, now: UnixSecs) -> bool {
        let valid_until = self.core(id).valid_until;
        app.lease == 0 || valid_until == 0 || now + app.lease < valid_until
    }

    /// Recursive placement from the root. Returns the chosen server.
    pub fn place(&mut self, app: &Application, now: UnixSecs) -> Option<NodeId> {
        self.place_at(self.root, app, now)
    }

    fn place_at(&mut self, node: NodeId, app: &Application, now: UnixSecs) -> Option<NodeId> {
        if !self.check_app_constraints(node, app) {
            return None;
        }
        if matches!(self.nodes[node.0].kind, NodeKind::Server { .. }) {
            if self.core(node).state != NodeState::Up {
                return None;
            }
            if !self.check_app_lifetime(node, app, now) {
                return None;
            }
            self.commit(node, app);
            return Some(node);
        }

        let children = self.core(node).children.clone();
        let mut cursor = match &mut self.nodes[node.0].kind {
            NodeKind::Bucket {
                strategies,
                default_strategy,
            } => {
                let default = *default_strategy;
                strategies
                    .remove(&app.affinity.name)
                    .unwrap_or_else(|| StrategyCursor::new(default))
            }
            NodeKind::Server { .. } => unreachable!(),
        };

        let mut placed = None;
        if let Some(first) = cursor.suggested(&children) {
            let mut idx = first;
            loop {
                let child = children[idx].expect("cursor only yields occupied slots");
                if let Some(server) = self.place_at(child, app, now) {
                    placed = Some(server);
                    break;
                }
                match cursor.next(&children) {
                    Some(next) if next != first => idx = next,
                    _ => break,
                }
            }
        }

        if let NodeKind::Bucket { strategies, .. } = &mut self.nodes[node.0].kind {
            strategies.insert(app.affinity.name.clone(), cursor);
        }
        placed
    }

    /// Direct placement on a specific server, used when retrying on a slot
    /// just freed by an eviction and when restoring a failed renewal.
    pub fn place_on_server(
        &mut self,
        id: NodeId,
        app: &Application,
        now: UnixSecs,
        enforce_lifetime: bool,
    ) -> bool {
        if !self.nodes[id.0].attached {
            return false;
        }
        let NodeKind::Server { .. } = self.nodes[id.0].kind else {
            return false;
        };
        if self.core(id).state != NodeState::Up {
            return false;
        }
        if !self.check_app_constraints(id, app) {
            return false;
        }
        if enforce_lifetime && !self.check_app_lifetime(id, app, now) {
            return false;
        }
        self.commit(id, app);
        true
    }

    /// Unconditional re-placement on the server an app occupied earlier in
    /// the same cycle. The slot was freed by this cycle's own removal, so
    /// capacity accounting stays consistent.
    pub fn restore_on_server(&mut self, id: NodeId, app: &Application) -> bool {
        if !self.nodes[id.0].attached {
            return false;
        }
        let NodeKind::Server { .. } = self.nodes[id.0].kind else {
            return false;
        };
        self.commit(id, app);
        true
    }

    fn commit(&mut self, server: NodeId, app: &Application) {
        let demand = app.demand.clone();
        {
            let node = &mut self.nodes[server.0];
            match &mut node.kind {
                NodeKind::Server { apps, .. } => {
                    let inserted = apps.insert(app.name.clone());
                    assert!(inserted, "app {:?} already on server", app.name);
                }
                NodeKind::Bucket { .. } => unreachable!(),
            }
            node.core.free_capacity.sub_assign(&demand);
        }
        self.bump_affinity(server, &app.affinity.name, 1);
        let parent = self.core(server).parent;
        self.recompute_capacity_down(parent);
    }

    /// Removes a placed app from a server, restoring capacity.
    pub fn remove_app(&mut self, server: NodeId, app: &Application) {
        {
            let node = &mut self.nodes[server.0];
            match &mut node.kind {
                NodeKind::Server { apps, .. } => {
                    let removed = apps.remove(&app.name);
                    assert!(removed, "app {:?} not on server", app.name);
                }
                NodeKind::Bucket { .. } => unreachable!(),
            }
            node.core.free_capacity.add_assign(&app.demand);
        }
        self.bump_affinity(server, &app.affinity.name, -1);
        if self.core(server).state == NodeState::Up {
            self.adjust_capacity_up(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::Affinity;

    fn topo() -> Topology {
        Topology::new("test-cell", Dimensions::new(2))
    }

    fn spec(name: &str, capacity: &[f64]) -> ServerSpec {
        ServerSpec {
            name: name.to_string(),
            capacity: capacity.to_vec(),
            label: Some("part1".to_string()),
            traits: Vec::new(),
            up_since: 100,
            presence_id: None,
        }
    }

    fn app(name: &str, demand: &[f64]) -> Application {
        Application::new(
            name,
            ResourceVector::from_values(demand.to_vec()),
            Affinity::unlimited(name.rsplit_once('#').map_or(name, |(base, _)| base)),
        )
    }

    #[test]
    fn test_bucket_capacity_is_max_not_sum() {
        let mut t = topo();
        let rack = t.add_bucket(t.root(), "rack1", "rack").unwrap();
        t.add_server(rack, &spec("s1", &[2.0, 1.0]), TraitSet::empty())
            .unwrap();
        t.add_server(rack, &spec("s2", &[1.0, 3.0]), TraitSet::empty())
            .unwrap();
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[2.0, 3.0]);
        assert_eq!(t.free_capacity(rack).as_slice(), &[2.0, 3.0]);
    }

    #[test]
    fn test_attach_under_server_rejected() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[2.0, 2.0]), TraitSet::empty())
            .unwrap();
        let err = t.add_bucket(s1, "rack1", "rack").unwrap_err();
        assert!(matches!(err, crate::Error::NotABucket(name) if name == "s1"));
        let err = t
            .add_server(s1, &spec("s2", &[1.0, 1.0]), TraitSet::empty())
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotABucket(_)));
        assert!(t.server_id("s2").is_none());
    }

    #[test]
    fn test_capacity_restored_after_place_remove() {
        let mut t = topo();
        let rack = t.add_bucket(t.root(), "rack1", "rack").unwrap();
        let s1 = t
            .add_server(rack, &spec("s1", &[2.0, 2.0]), TraitSet::empty())
            .unwrap();
        let before_root = t.free_capacity(t.root()).clone();
        let a = app("proid.web#1", &[1.0, 1.0]);
        assert_eq!(t.place(&a, 0), Some(s1));
        assert_eq!(t.free_capacity(s1).as_slice(), &[1.0, 1.0]);
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[1.0, 1.0]);
        t.remove_app(s1, &a);
        assert_eq!(t.free_capacity(s1).as_slice(), &[2.0, 2.0]);
        assert_eq!(t.free_capacity(t.root()), &before_root);
    }

    #[test]
    fn test_down_server_drops_out_of_parent_capacity() {
        let mut t = topo();
        let rack = t.add_bucket(t.root(), "rack1", "rack").unwrap();
        let s1 = t
            .add_server(rack, &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        t.add_server(rack, &spec("s2", &[1.0, 1.0]), TraitSet::empty())
            .unwrap();
        t.set_server_state(s1, NodeState::Down, 50);
        assert_eq!(t.free_capacity(rack).as_slice(), &[1.0, 1.0]);
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[1.0, 1.0]);
        t.set_server_state(s1, NodeState::Up, 60);
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[4.0, 4.0]);
    }

    #[test]
    fn test_frozen_server_excluded_like_down() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        t.set_server_state(s1, NodeState::Frozen, 10);
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn test_remove_node_recomputes_aggregates() {
        let mut t = topo();
        let rack = t.add_bucket(t.root(), "rack1", "rack").unwrap();
        let s1 = t
            .add_server(rack, &spec("s1", &[4.0, 4.0]), TraitSet::from_bits(0b01))
            .unwrap();
        t.add_server(rack, &spec("s2", &[1.0, 1.0]), TraitSet::from_bits(0b10))
            .unwrap();
        assert_eq!(t.traits(t.root()).bits(), 0b11);
        t.remove_node(s1);
        assert_eq!(t.traits(t.root()).bits(), 0b10);
        assert_eq!(t.free_capacity(t.root()).as_slice(), &[1.0, 1.0]);
        assert!(t.server_id("s1").is_none());
        assert!(!t.is_attached(s1));
    }

    #[test]
    fn test_valid_until_max_over_up_children() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[1.0, 1.0]), TraitSet::empty())
            .unwrap();
        let s2 = t
            .add_server(t.root(), &spec("s2", &[1.0, 1.0]), TraitSet::empty())
            .unwrap();
        t.set_server_valid_until(s1, 1000);
        t.set_server_valid_until(s2, 2000);
        assert_eq!(t.valid_until(t.root()), 2000);
        t.set_server_state(s2, NodeState::Down, 10);
        assert_eq!(t.valid_until(t.root()), 1000);
        t.remove_node(s1);
        assert_eq!(t.valid_until(t.root()), 0);
    }

    #[test]
    fn test_affinity_limit_enforced_per_level() {
        let mut t = topo();
        let rack = t.add_bucket(t.root(), "rack1", "rack").unwrap();
        let s1 = t
            .add_server(rack, &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        let mut a1 = app("proid.web#1", &[1.0, 1.0]);
        a1.affinity = Affinity::unlimited("proid.web").with_limit("server", 1);
        let mut a2 = app("proid.web#2", &[1.0, 1.0]);
        a2.affinity = a1.affinity.clone();

        assert_eq!(t.place(&a1, 0), Some(s1));
        // Only one proid.web instance allowed per server.
        assert_eq!(t.place(&a2, 0), None);
        assert_eq!(t.affinity_count(t.root(), "proid.web"), 1);
    }

    #[test]
    fn test_lease_respects_valid_until() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        t.set_server_valid_until(s1, 1000);
        let mut a = app("proid.web#1", &[1.0, 1.0]);
        a.lease = 500;
        assert_eq!(t.place(&a, 600), None); // 600 + 500 >= 1000
        assert_eq!(t.place(&a, 400), Some(s1)); // 400 + 500 < 1000
    }

    #[test]
    fn test_spread_alternates_servers() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        let s2 = t
            .add_server(t.root(), &spec("s2", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        let a1 = app("proid.web#1", &[1.0, 1.0]);
        let a2 = app("proid.web#2", &[1.0, 1.0]);
        assert_eq!(t.place(&a1, 0), Some(s1));
        assert_eq!(t.place(&a2, 0), Some(s2));
    }

    #[test]
    fn test_pack_fills_first_server() {
        let mut t = topo();
        let s1 = t
            .add_server(t.root(), &spec("s1", &[2.0, 2.0]), TraitSet::empty())
            .unwrap();
        let s2 = t
            .add_server(t.root(), &spec("s2", &[2.0, 2.0]), TraitSet::empty())
            .unwrap();
        t.set_default_strategy(t.root(), PlacementStrategy::Pack);
        let a1 = app("proid.web#1", &[1.0, 1.0]);
        let a2 = app("proid.web#2", &[1.0, 1.0]);
        let a3 = app("proid.web#3", &[1.0, 1.0]);
        assert_eq!(t.place(&a1, 0), Some(s1));
        assert_eq!(t.place(&a2, 0), Some(s1));
        assert_eq!(t.place(&a3, 0), Some(s2));
    }

    #[test]
    fn test_label_constraint() {
        let mut t = topo();
        t.add_server(t.root(), &spec("s1", &[4.0, 4.0]), TraitSet::empty())
            .unwrap();
        let mut a = app("proid.web#1", &[1.0, 1.0]);
        a.constraints.label = Some("part2".to_string());
        assert_eq!(t.place(&a, 0), None);
        a.constraints.label = Some("part1".to_string());
        assert!(t.place(&a, 0).is_some());
    }

    #[test]
    fn test_server_spec_json_defaults() {
        let parsed: ServerSpec =
            serde_json::from_str(r#"{"name":"s1","capacity":[1.0,2.0]}"#).unwrap();
        assert_eq!(parsed.name, "s1");
        assert_eq!(parsed.label, None);
        assert!(parsed.traits.is_empty());
        assert_eq!(parsed.up_since, 0);
    }

    #[test]
    fn test_server_is_same() {
        let mut t = topo();
        let s = spec("s1", &[4.0, 4.0]);
        let id = t.add_server(t.root(), &s, TraitSet::empty()).unwrap();
        assert!(t.server_is_same(id, &s, TraitSet::empty()));
        let mut changed = s.clone();
        changed.capacity = vec![8.0, 4.0];
        assert!(!t.server_is_same(id, &changed, TraitSet::empty()));
        assert!(!t.server_is_same(id, &s, TraitSet::from_bits(1)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // After any sequence of placements, removals, and state flips,
            // the root's free capacity is the element-wise max over the up
            // servers' free capacities.
            #[test]
            fn test_root_capacity_is_max_over_up_servers(
                ops in proptest::collection::vec((0u8..4, 0usize..3), 1..40),
            ) {
                let mut t = topo();
                let mut ids = Vec::new();
                for i in 0..3 {
                    let name = format!("s{i}");
                    ids.push(
                        t.add_server(t.root(), &spec(&name, &[4.0, 4.0]), TraitSet::empty())
                            .unwrap(),
                    );
                }
                let mut hosted: Vec<Vec<Application>> = vec![Vec::new(); 3];
                let mut counter = 0u32;
                for (op, srv) in ops {
                    let id = ids[srv];
                    match op {
                        0 => {
                            counter += 1;
                            let a = app(&format!("proid.p#{counter}"), &[1.0, 1.0]);
                            if t.place_on_server(id, &a, 0, true) {
                                hosted[srv].push(a);
                            }
                        }
                        1 => {
                            if let Some(a) = hosted[srv].pop() {
                                t.remove_app(id, &a);
                            }
                        }
                        2 => t.set_server_state(id, NodeState::Down, 5),
                        _ => t.set_server_state(id, NodeState::Up, 6),
                    }
                    let mut expected = ResourceVector::zero(Dimensions::new(2));
                    for &sid in &ids {
                        if t.state(sid) == NodeState::Up {
                            expected.max_assign(t.free_capacity(sid));
                        }
                    }
                    prop_assert_eq!(
                        t.free_capacity(t.root()).as_slice(),
                        expected.as_slice()
                    );
                }
            }
        }
    }
}
