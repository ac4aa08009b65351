//! presetd Core Library
//!
//! Shared functionality for presetd components:
//! - Configuration model and TOML loading with preset defaults
//! - Control protocol message types and frame parsing
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::{Config, Hooks, Preset};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, ServerFrame, ServerMessage};
