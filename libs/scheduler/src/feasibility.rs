//! Per-cycle placement feasibility memo.
//!
//! Once an application fails to place, any later application in the same
//! cycle with the same constraint shape and equal-or-larger demand cannot
//! place either, so the pass skips it without walking the tree. The tracker
//! keys on everything except demand that affects admission, and remembers
//! the element-wise minimum demand that failed per shape. It is rebuilt
//! fresh each cycle.

use std::collections::HashMap;

use warden_types::ResourceVector;

use crate::app::Application;

/// Constraint shape of an application, demand excluded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShapeKey {
    affinity: String,
    limits: Vec<(String, u32)>,
    lease: i64,
    label: Option<String>,
    trait_bits: u64,
}

impl ShapeKey {
    fn of(app: &Application) -> Self {
        let mut limits: Vec<(String, u32)> = app
            .affinity
            .limits
            .iter()
            .map(|(level, limit)| (level.clone(), *limit))
            .collect();
        limits.sort();
        Self {
            affinity: app.affinity.name.clone(),
            limits,
            lease: app.lease,
            label: app.constraints.label.clone(),
            trait_bits: app.constraints.traits.bits(),
        }
    }
}

/// Tracks demands that failed to place, per constraint shape.
#[derive(Debug, Default)]
pub struct FeasibilityTracker {
    failed: HashMap<ShapeKey, ResourceVector>,
}

impl FeasibilityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// False if an app with the same shape and no larger demand already
    /// failed this cycle.
    #[must_use]
    pub fn feasible(&self, app: &Application) -> bool {
        match self.failed.get(&ShapeKey::of(app)) {
            Some(failed) => !app.demand.dominates(failed),
            None => true,
        }
    }

    /// Records a placement failure for the app's shape.
    pub fn record_failure(&mut self, app: &Application) {
        match self.failed.entry(ShapeKey::of(app)) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().min_assign(&app.demand);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(app.demand.clone());
            }
        }
    }
}
