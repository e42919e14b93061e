//! asr-core: Shared protocol library for the speech relay.
//!
//! Provides the upstream binary frame codec, event and error packets,
//! handshake header construction, transcript extraction, and the JSON control
//! messages spoken with browser clients.

pub mod audio;
pub mod auth;
pub mod codec;
pub mod error;
pub mod event;
pub mod messages;
pub mod transcript;

// Re-export commonly used items at crate root.
pub use audio::{AudioFormat, SessionParams};
pub use auth::{build_auth_headers, AuthParams};
pub use codec::{
    audio_only_request, build_header, decode_by_serialization, decode_frame, decode_payload,
    decode_server_frame, encode_frame, full_client_request, Compression, Frame, FrameHeader,
    MessageType, Payload, Serialization,
};
pub use error::{AsrError, AsrResult};
pub use event::{decode_error_packet, decode_event_packet, encode_event_frame, ErrorPacket, EventPacket};
pub use messages::{ClientMessage, ServerEvent, UNAUTHORIZED_CLOSE_CODE, UNAUTHORIZED_REASON};
pub use transcript::{extract_transcript, Transcript};
