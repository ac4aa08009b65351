//! Frame parser for the worker control protocol.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single newline-delimited frame received from a worker.
///
/// The invalid-message notice is matched as a substring and never reaches
/// the JSON decoder.
pub fn parse_frame(line: &str) -> Result<ServerFrame> {
    if line.contains(INVALID_MESSAGE_NOTICE) {
        return Ok(ServerFrame::InvalidMessageNotice);
    }
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw).map(ServerFrame::Message)
}

/// Parse a JSON value into a server message.
pub fn parse_value(raw: &Value) -> Result<ServerMessage> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::Protocol("expected a JSON object".into()))?;

    if let Some(body) = obj.get("LayerChange") {
        return Ok(ServerMessage::LayerChange(serde_json::from_value(
            body.clone(),
        )?));
    }
    if let Some(body) = obj.get("LayerNames") {
        return Ok(ServerMessage::LayerNames(serde_json::from_value(
            body.clone(),
        )?));
    }
    if let Some(body) = obj.get("ConfigFileReload") {
        return Ok(ServerMessage::ConfigFileReload(serde_json::from_value(
            body.clone(),
        )?));
    }

    let msg_type = obj.keys().next().cloned().unwrap_or_default();
    Ok(ServerMessage::Unknown {
        msg_type,
        payload: raw.clone(),
    })
}
