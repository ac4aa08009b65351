//! Control protocol spoken with a running worker over TCP.
//!
//! Frames are newline-delimited JSON objects keyed by message kind, e.g.
//! `{"LayerChange":{"new":"nav"}}`. Parsing follows a tolerant reader
//! pattern: unknown kinds are kept as [`ServerMessage::Unknown`] instead of
//! failing the connection.

mod parser;
mod types;

pub use parser::{parse_frame, parse_value};
pub use types::*;
