//! # warden-types
//!
//! Leaf value types shared across the warden scheduler:
//!
//! - [`ResourceVector`]: fixed-dimension capacity/demand vectors with
//!   element-wise comparison semantics.
//! - [`TraitSet`] / [`TraitRegistry`]: capability flags servers advertise
//!   and applications require.
//! - [`IdentityGroup`]: bounded pools of small integer identities.
//! - [`Affinity`]: named co-location limits per topology level.
//!
//! These types carry no scheduling logic and no I/O; the scheduler crate
//! builds the topology tree and the fairness queues on top of them.

mod affinity;
mod identity;
mod resources;
mod traits;

pub use affinity::Affinity;
pub use identity::{IdentityError, IdentityGroup};
pub use resources::{Dimensions, ResourceVector};
pub use traits::{TraitError, TraitRegistry, TraitSet};
