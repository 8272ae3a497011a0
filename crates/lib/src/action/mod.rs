//! Actions: the nodes of the build graph.
//!
//! An [`Action`] is composed from small, orthogonal capabilities rather than
//! one large interface:
//!
//! - [`Identifiable`] - stable target identity and ordering
//! - [`Fingerprintable`] - the declared inputs a rule key is computed from
//! - [`Executable`] - the transformation producing the action's artifact
//! - [`Cacheable`] - whether the artifact may go through the cache
//!
//! Nothing about the surrounding build (cache, resolver, output layout) is
//! stored on an action; the scheduler passes that context in explicitly.

pub mod actions;
mod spec;
mod target;
mod types;

pub use spec::{ActionSpec, StepSpec};
pub use target::{Target, TargetError};
pub use types::*;
