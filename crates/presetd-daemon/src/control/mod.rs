//! Control channel to a running worker.
//!
//! One [`ControlClient`] lives in each instance slot and is reused across
//! runs. It keeps at most one TCP connection open and reconnects when the
//! worker asks it to.

mod client;
mod error;

pub use client::ControlClient;
pub use error::ControlError;
