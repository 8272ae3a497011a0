//! keel-lib: build-graph scheduling with content-addressed caching.
//!
//! - [`graph::ActionGraph`]: validated, acyclic graph of [`action::Action`]s
//! - [`rulekey`]: fingerprints computed from everything an action declares
//! - [`cache`]: local and remote tiers keyed by fingerprint
//! - [`execute::run`]: the parallel scheduler
//! - [`result::BuildResult`]: the frozen outcome of a run

pub mod action;
pub mod artifact;
pub mod cache;
pub mod config;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod platform;
pub mod result;
pub mod rulekey;
pub mod trace;
pub mod util;
