//! Server capability traits.
//!
//! A trait is a named capability flag a server advertises (e.g. "ssd",
//! "gpu") and an application may require. Sets are stored as bit masks and
//! unioned recursively from servers up to their ancestors, so subset tests
//! on the hot scheduling path are single instructions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from trait name interning.
#[derive(Debug, Error)]
pub enum TraitError {
    /// The registry is full; a cell supports at most 64 distinct traits.
    #[error("trait limit reached (64), cannot register {0:?}")]
    Exhausted(String),
}

/// A set of capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitSet(u64);

impl TraitSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a set from a raw bit mask.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bit mask.
    #[must_use]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// True iff no trait is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Unions `other` into this set.
    pub fn union_with(&mut self, other: TraitSet) {
        self.0 |= other.0;
    }

    /// Returns the union of the two sets.
    #[must_use]
    pub const fn union(&self, other: TraitSet) -> TraitSet {
        TraitSet(self.0 | other.0)
    }

    /// True iff every trait in `self` is present in `other`.
    #[must_use]
    pub const fn is_subset_of(&self, other: TraitSet) -> bool {
        self.0 & other.0 == self.0
    }
}

/// Interns trait names to bits, one registry per cell.
#[derive(Debug, Clone, Default)]
pub struct TraitRegistry {
    bits: HashMap<String, u64>,
}

impl TraitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bit for `name`, interning it on first use.
    pub fn intern(&mut self, name: &str) -> Result<TraitSet, TraitError> {
        if let Some(&bit) = self.bits.get(name) {
            return Ok(TraitSet(bit));
        }
        let next = self.bits.len();
        if next >= 64 {
            return Err(TraitError::Exhausted(name.to_string()));
        }
        let bit = 1u64 << next;
        self.bits.insert(name.to_string(), bit);
        Ok(TraitSet(bit))
    }

    /// Interns a list of names into a combined set.
    pub fn intern_all<'a, I>(&mut self, names: I) -> Result<TraitSet, TraitError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut set = TraitSet::empty();
        for name in names {
            set.union_with(self.intern(name)?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut reg = TraitRegistry::new();
        let a1 = reg.intern("ssd").unwrap();
        let b = reg.intern("gpu").unwrap();
        let a2 = reg.intern("ssd").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_subset_semantics() {
        let mut reg = TraitRegistry::new();
        let both = reg.intern_all(["ssd", "gpu"]).unwrap();
        let ssd = reg.intern("ssd").unwrap();
        assert!(ssd.is_subset_of(both));
        assert!(!both.is_subset_of(ssd));
        assert!(TraitSet::empty().is_subset_of(ssd));
    }

    #[test]
    fn test_registry_exhaustion() {
        let mut reg = TraitRegistry::new();
        for i in 0..64 {
            reg.intern(&format!("t{i}")).unwrap();
        }
        assert!(matches!(reg.intern("t64"), Err(TraitError::Exhausted(_))));
        // Already-interned names still resolve.
        assert!(reg.intern("t0").is_ok());
    }
}
