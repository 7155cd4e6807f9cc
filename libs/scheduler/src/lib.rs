//! Hierarchical placement scheduler.
//!
//! The cell owns a tree of buckets and servers with aggregate capacity,
//! trait, label, and reboot-deadline propagation; partitions bind labeled
//! server sets to fair-share allocation trees; [`Cell::schedule`] runs one
//! synchronous scheduling cycle and returns the placement diff.
//!
//! The scheduler is single-threaded by design: callers serialize all
//! mutation and all cycles, typically from one control-loop task. A cycle
//! performs no I/O and has no internal suspension points.

mod alloc;
mod app;
mod cell;
mod error;
mod feasibility;
mod node;
mod partition;
mod strategy;

pub use alloc::{Allocation, QueueEntry, DEFAULT_RANK, RANK_UNPLACED};
pub use app::{AppConstraints, Application, UnixSecs};
pub use cell::{Cell, Placement};
pub use error::{Error, Result};
pub use feasibility::FeasibilityTracker;
pub use node::{NodeId, NodeState, ServerSpec, Topology, SERVER_LEVEL};
pub use partition::{
    Partition, RebootBucket, RebootSchedule, DEFAULT_MAX_SERVER_UPTIME, DEFAULT_MIN_SERVER_UPTIME,
};
pub use strategy::{PlacementStrategy, StrategyCursor};
