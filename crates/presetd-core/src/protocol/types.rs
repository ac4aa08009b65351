//! Message types for the worker control protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Substring a worker sends right before dropping a connection that wrote
/// something it could not understand (older workers do this for requests
/// they do not support).
pub const INVALID_MESSAGE_NOTICE: &str = "you sent an invalid message";

/// Requests sent from the supervisor to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClientMessage {
    /// Ask the worker for the names of all layers in its loaded config.
    RequestLayerNames {},
}

impl ClientMessage {
    /// Serialize to a single JSON object without a trailing newline.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Messages pushed by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    LayerChange(LayerChange),
    LayerNames(LayerNames),
    ConfigFileReload(ConfigFileReload),
    Unknown { msg_type: String, payload: Value },
}

/// The active layer changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChange {
    pub new: String,
}

/// Reply to [`ClientMessage::RequestLayerNames`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerNames {
    #[serde(default)]
    pub names: Vec<String>,
}

/// The worker reloaded its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileReload {
    pub new: String,
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// The worker rejected our last request and is closing the connection.
    InvalidMessageNotice,
    Message(ServerMessage),
}
