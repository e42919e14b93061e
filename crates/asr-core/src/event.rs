//! Event packets: session-oriented frames carrying an event id and a
//! session identifier ahead of the payload.
//!
//! Wire format:
//!
//! ```text
//! [header][i32 BE event][u32 BE session-id len][session-id][u32 BE payload len][payload]
//! ```
//!
//! Error packets share the header but carry `[u32 BE code][u32 BE msg len][msg]`.

use crate::codec::{
    self, decode_by_serialization, decode_payload, encode_frame, read_u32, Compression,
    FrameHeader, MessageType, Payload, Serialization,
};
use crate::error::AsrResult;

/// Smallest well-formed event packet: header, event, session-id len, payload len.
pub const MIN_EVENT_PACKET_LEN: usize = 16;

/// Smallest well-formed error packet: header, code, message len.
pub const MIN_ERROR_PACKET_LEN: usize = 12;

/// A decoded event packet.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    pub event: i32,
    pub session_id: String,
    pub payload: Payload,
    /// Payload bytes after decompression, before deserialization.
    pub raw_payload: Vec<u8>,
    pub message_type: MessageType,
    pub flags: u8,
}

/// A decoded error packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u32,
    pub message: String,
    pub flags: u8,
}

/// Builder for event frames; defaults to a JSON full-client-request.
#[derive(Debug, Clone)]
pub struct EventFrameBuilder<'a> {
    event: i32,
    session_id: &'a str,
    message_type: MessageType,
    flags: u8,
    compression: Compression,
}

impl<'a> EventFrameBuilder<'a> {
    pub fn new(event: i32, session_id: &'a str) -> Self {
        Self {
            event,
            session_id,
            message_type: MessageType::FullClientRequest,
            flags: codec::flags::WITH_EVENT,
            compression: Compression::None,
        }
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Serialize `payload` as JSON and encode the frame.
    pub fn encode<T: serde::Serialize>(&self, payload: &T) -> AsrResult<Vec<u8>> {
        let body = serde_json::to_vec(payload)?;
        let event = self.event.to_be_bytes();
        let session_len = (self.session_id.len() as u32).to_be_bytes();
        encode_frame(
            self.message_type,
            self.flags,
            Serialization::Json,
            self.compression,
            &[&event, &session_len, self.session_id.as_bytes()],
            &body,
        )
    }
}

/// Encode a JSON full-client-request event frame.
pub fn encode_event_frame<T: serde::Serialize>(
    event: i32,
    session_id: &str,
    payload: &T,
    compression: Compression,
) -> AsrResult<Vec<u8>> {
    EventFrameBuilder::new(event, session_id)
        .compression(compression)
        .encode(payload)
}

/// Decode an event packet.
///
/// Returns `None` for anything truncated, inconsistent, undecompressable, or
/// flagged as an error packet (see [`decode_error_packet`]).
pub fn decode_event_packet(bytes: &[u8]) -> Option<EventPacket> {
    if bytes.len() < MIN_EVENT_PACKET_LEN {
        return None;
    }
    let header = FrameHeader::parse(bytes)?;
    if header.message_type == MessageType::Error || header.header_units == 0 {
        return None;
    }

    let mut offset = header.header_len();
    let event = read_u32(bytes, offset)? as i32;
    offset += 4;

    let session_len = read_u32(bytes, offset)? as usize;
    offset += 4;
    let session_end = offset.checked_add(session_len)?;
    let session_id = String::from_utf8_lossy(bytes.get(offset..session_end)?).into_owned();
    offset = session_end;

    let payload_len = read_u32(bytes, offset)? as usize;
    offset += 4;
    let payload_end = offset.checked_add(payload_len)?;
    let body = bytes.get(offset..payload_end)?;

    let raw_payload = decode_payload(body, header.compression).ok()?;
    let payload = decode_by_serialization(&raw_payload, header.serialization);

    Some(EventPacket {
        event,
        session_id,
        payload,
        raw_payload,
        message_type: header.message_type,
        flags: header.flags,
    })
}

/// Decode an error packet. Returns `None` unless the header says error and
/// the declared message fits in the buffer.
pub fn decode_error_packet(bytes: &[u8]) -> Option<ErrorPacket> {
    if bytes.len() < MIN_ERROR_PACKET_LEN {
        return None;
    }
    let header = FrameHeader::parse(bytes)?;
    if header.message_type != MessageType::Error {
        return None;
    }

    let code = read_u32(bytes, 4)?;
    let len = read_u32(bytes, 8)? as usize;
    let end = MIN_ERROR_PACKET_LEN.checked_add(len)?;
    let message = String::from_utf8_lossy(bytes.get(MIN_ERROR_PACKET_LEN..end)?).into_owned();

    Some(ErrorPacket {
        code,
        message,
        flags: header.flags,
    })
}

/// Build an error packet. Mostly useful for tests and local fakes.
pub fn encode_error_packet(code: u32, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_ERROR_PACKET_LEN + message.len());
    out.extend_from_slice(&codec::build_header(
        MessageType::Error,
        codec::flags::NONE,
        Serialization::Json,
        Compression::None,
    ));
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}
