//! Control channel error type.

use std::time::Duration;

/// Errors from the worker control channel.
///
/// None of these are fatal to a run; callers log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to connect to control port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to control port {port} after {timeout:?}")]
    ConnectTimeout { port: u16, timeout: Duration },

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("no control connection accepted the message within {timeout:?}")]
    SendTimeout { timeout: Duration },

    #[error("control connection closed")]
    Disconnected,
}
