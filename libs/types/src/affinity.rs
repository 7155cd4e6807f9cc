//! Application affinity: named co-location limits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A grouping constraint limiting how many applications sharing the same
/// affinity name may be placed under a single node at a given level.
///
/// A missing level means unlimited. The affinity name usually identifies the
/// application pattern (e.g. `webapp.frontend`), so replicas of the same
/// service spread according to the limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    /// The grouping key shared by instances of the same workload.
    pub name: String,
    /// Level tag (e.g. "server", "rack", "cell") to maximum co-located count.
    #[serde(default)]
    pub limits: HashMap<String, u32>,
}

impl Affinity {
    /// An affinity with no co-location limits.
    #[must_use]
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: HashMap::new(),
        }
    }

    /// Adds a per-level limit.
    #[must_use]
    pub fn with_limit(mut self, level: impl Into<String>, limit: u32) -> Self {
        self.limits.insert(level.into(), limit);
        self
    }

    /// Returns the limit at `level`, or `u32::MAX` if unconstrained.
    #[must_use]
    pub fn limit_at(&self, level: &str) -> u32 {
        self.limits.get(level).copied().unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults_to_unlimited() {
        let affinity = Affinity::unlimited("webapp.frontend").with_limit("server", 1);
        assert_eq!(affinity.limit_at("server"), 1);
        assert_eq!(affinity.limit_at("rack"), u32::MAX);
    }

    #[test]
    fn test_json_roundtrip() {
        let affinity = Affinity::unlimited("db.shard").with_limit("rack", 2);
        let json = serde_json::to_string(&affinity).unwrap();
        let parsed: Affinity = serde_json::from_str(&json).unwrap();
        assert_eq!(affinity, parsed);
    }
}
