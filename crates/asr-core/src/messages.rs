//! JSON control messages exchanged with browser clients.
//!
//! Every message is a JSON object tagged by `"type"`:
//!
//! ```json
//! {"type": "start", "language": "en-US", "mimeType": "audio/webm;codecs=opus", "sampleRate": 48000}
//! {"type": "transcript", "text": "hello", "isFinal": false}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AsrError, AsrResult};

/// WebSocket close code for failed or revoked authorization.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;

/// Close reason sent with [`UNAUTHORIZED_CLOSE_CODE`].
pub const UNAUTHORIZED_REASON: &str = "Unauthorized";

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    Audio {
        /// Base64-encoded audio chunk.
        payload: String,
    },
    Stop,
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> AsrResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| AsrError::InvalidMessage(e.to_string()))
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Started,
    Transcript { text: String, is_final: bool },
    Error { message: String },
    Pong,
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> AsrResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
