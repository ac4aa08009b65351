//! Error types for presetd core library.

use thiserror::Error;

/// Result type alias using presetd Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for presetd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Control protocol frame could not be decoded
    #[error("Failed to parse control frame: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML deserialization error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
