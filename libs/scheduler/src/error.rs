//! Scheduler errors.
//!
//! Only expected runtime conditions surface as errors; invariant violations
//! (adding an already-parented node, mixing vector dimensions) panic, since
//! they indicate a collaborator bug rather than a condition to recover from.

use thiserror::Error;
use warden_types::TraitError;

/// Errors from cell mutation operations.
///
/// `schedule()` itself never fails; it always returns a (possibly empty)
/// diff.
#[derive(Debug, Error)]
pub enum Error {
    /// An application with this name is already registered.
    #[error("application {0:?} already registered")]
    DuplicateApp(String),

    /// No application with this name exists.
    #[error("unknown application {0:?}")]
    UnknownApp(String),

    /// A sibling with this name already exists under the target bucket.
    #[error("duplicate node name {0:?}")]
    DuplicateNode(String),

    /// No node with this name or id exists in the topology.
    #[error("unknown node {0:?}")]
    UnknownNode(String),

    /// The target node is a server; only buckets take children.
    #[error("node {0:?} is not a bucket")]
    NotABucket(String),

    /// The application lease exceeds the partition's maximum.
    #[error("lease {lease}s exceeds partition limit {max}s")]
    LeaseTooLong { lease: i64, max: i64 },

    /// Trait name interning failed.
    #[error(transparent)]
    Trait(#[from] TraitError),
}

/// Result alias for cell operations.
pub type Result<T> = std::result::Result<T, Error>;
