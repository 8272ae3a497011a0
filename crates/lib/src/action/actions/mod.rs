//! Built-in transformations.
//!
//! - [`cmd`] - Shell command execution with an isolated environment
//! - [`write`] - Literal file content and no-op steps

pub mod cmd;
pub mod write;

pub use cmd::CmdStep;
pub use write::{NoopStep, WriteStep};
