//! machassert library
//!
//! Declarative file assertions evaluated against the local machine or
//! remote machines over SSH, with remediation actions for assertions that
//! don't hold.

pub mod cli;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod paths;
pub mod target;

// Re-export main types for convenience
pub use config::{Action, Assertion, AssertionGroup, AssertionKind, Machine, MachineSpec};
pub use engine::{AssertionResult, Evaluation, Executor, Reporter, Scope};
pub use error::{Error, Result};
pub use target::{AuthPrompter, Connector, Target};
