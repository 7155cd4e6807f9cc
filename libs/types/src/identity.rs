//! Bounded pools of small integer identities.
//!
//! Some applications need a stable small number (0..count) unique among
//! instances of the same group, e.g. for partitioned consumers. The pool can
//! be resized at runtime; shrinking never hands out an identity at or above
//! the new count, and the scheduler evicts holders of now-invalid identities.

use std::collections::BTreeSet;

use thiserror::Error;

/// Errors from identity acquisition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Every identity in the group is currently assigned.
    #[error("identity group exhausted (count {count})")]
    Exhausted { count: u32 },
}

/// A bounded pool of integer identities `0..count`.
#[derive(Debug, Clone)]
pub struct IdentityGroup {
    count: u32,
    available: BTreeSet<u32>,
}

impl IdentityGroup {
    /// Creates a pool with identities `0..count`, all free.
    #[must_use]
    pub fn new(count: u32) -> Self {
        Self {
            count,
            available: (0..count).collect(),
        }
    }

    /// Returns the configured pool size.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns how many identities are currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Acquires the lowest free identity.
    pub fn acquire(&mut self) -> Result<u32, IdentityError> {
        match self.available.iter().next().copied() {
            Some(id) => {
                self.available.remove(&id);
                Ok(id)
            }
            None => Err(IdentityError::Exhausted { count: self.count }),
        }
    }

    /// Returns an identity to the pool.
    ///
    /// Identities at or above the current count are dropped silently; they
    /// belong to a shrunk configuration.
    pub fn release(&mut self, id: u32) {
        if id < self.count {
            self.available.insert(id);
        }
    }

    /// Resizes the pool to `new_count`.
    ///
    /// Growing frees the new identities immediately. Shrinking removes free
    /// identities at or above the new count; assigned ones are reclaimed by
    /// the scheduler when it clears invalid identities.
    pub fn adjust(&mut self, new_count: u32) {
        if new_count > self.count {
            self.available.extend(self.count..new_count);
        } else {
            self.available = self.available.split_off(&0);
            self.available.retain(|&id| id < new_count);
        }
        self.count = new_count;
    }
}
