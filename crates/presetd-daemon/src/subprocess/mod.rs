//! Worker and hook subprocesses.

pub mod hooks;
pub mod instance;

pub use hooks::{HookError, HookPhase};
pub use instance::{Instance, InstanceError, InstanceOptions, InstanceRun, RunSpec};
