//! Preset orchestration: instance pool, restart limiting and the supervisor.
//!
//! - [`Runner`]: pool of reusable instance slots keyed by preset name.
//! - [`RestartLimiter`]: sliding-window cap on crash auto-restarts.
//! - [`Supervisor`]: event loop owning preset state and driving the runner.

pub mod pool;
pub mod restart;
pub mod supervisor;

pub use pool::{PresetEvent, RunResult, Runner, RunnerError, RunnerEvents, RunnerOptions};
pub use restart::RestartLimiter;
pub use supervisor::{PresetSnapshot, PresetStatus, Supervisor, SupervisorError, SupervisorHandle};
