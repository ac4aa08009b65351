//! presetd Daemon Library
//!
//! Supervision of long-running worker processes:
//! - Lifecycle hooks (blocking and async) around every run
//! - Auto-reconnecting control channel to each worker
//! - Instance pool with slot reuse and per-preset event streams
//! - Supervisor loop with crash auto-restart and preset switching

pub mod control;
pub mod orchestration;
pub mod subprocess;
