//! IPC framing for controller ↔ worker communication.
//!
//! Uses JSON Lines: every frame is one JSON object without embedded
//! newlines. The message types live in `madx-model-types`.

pub use madx_model_types::{Command, Response, Summary, Table, TableArgs, Value};

/// One encoded message.
pub type Frame = String;

/// A frame the worker could not decode as a [`Command`].
#[derive(Debug, thiserror::Error)]
#[error("unrecognized command frame ({reason}): {frame}")]
pub struct ProtocolFault {
    pub frame: String,
    pub reason: String,
}

pub fn encode_command(command: &Command) -> Frame {
    // Command contains only strings and string lists, serialization cannot fail
    serde_json::to_string(command).unwrap_or_default()
}

pub fn decode_command(frame: &str) -> Result<Command, ProtocolFault> {
    serde_json::from_str(frame).map_err(|e| ProtocolFault {
        frame: truncate(frame, 200),
        reason: e.to_string(),
    })
}

pub fn encode_response(response: &Response) -> Result<Frame, serde_json::Error> {
    serde_json::to_string(response)
}

pub fn decode_response(frame: &str) -> Result<Response, serde_json::Error> {
    serde_json::from_str(frame)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
