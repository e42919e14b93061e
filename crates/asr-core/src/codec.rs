//! Binary framing for the upstream speech-recognition protocol.
//!
//! Wire format:
//!
//! ```text
//! [4-byte header][prefix bytes...][4-byte big-endian payload length][payload]
//! ```
//!
//! Header layout (one nibble per field):
//!
//! | byte | high nibble       | low nibble          |
//! |------|-------------------|---------------------|
//! | 0    | protocol version  | header size (x4)    |
//! | 1    | message type      | message-type flags  |
//! | 2    | serialization     | compression         |
//! | 3    | reserved (zero)   |                     |
//!
//! Parsers in this module never panic on hostile input: truncated or
//! inconsistent frames come back as `None` and the caller drops them.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{AsrError, AsrResult};

/// Protocol version written into every outgoing header.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte units for outgoing frames.
pub const HEADER_UNITS: u8 = 0b0001;

/// Minimum length of any frame: header plus payload length.
pub const MIN_FRAME_LEN: usize = 8;

/// gzip payloads at or above this size are compressed on the blocking pool.
pub const OFFLOAD_THRESHOLD: usize = 16 * 1024;

/// Message-type flag bits (low nibble of byte 1).
pub mod flags {
    pub const NONE: u8 = 0b0000;
    /// A positive sequence number follows the header.
    pub const POSITIVE_SEQUENCE: u8 = 0b0001;
    /// Last packet of the stream.
    pub const LAST_PACKET: u8 = 0b0010;
    /// Last packet, carrying a negative sequence number.
    pub const NEGATIVE_SEQUENCE: u8 = 0b0011;
    /// An event id follows the header.
    pub const WITH_EVENT: u8 = 0b0100;
}

/// Message type (high nibble of byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    FullClientRequest,
    AudioOnlyRequest,
    FullServerResponse,
    AudioOnlyServerResponse,
    Error,
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0b0001 => Self::FullClientRequest,
            0b0010 => Self::AudioOnlyRequest,
            0b1001 => Self::FullServerResponse,
            0b1011 => Self::AudioOnlyServerResponse,
            0b1111 => Self::Error,
            other => Self::Other(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(m: MessageType) -> u8 {
        match m {
            MessageType::FullClientRequest => 0b0001,
            MessageType::AudioOnlyRequest => 0b0010,
            MessageType::FullServerResponse => 0b1001,
            MessageType::AudioOnlyServerResponse => 0b1011,
            MessageType::Error => 0b1111,
            MessageType::Other(v) => v & 0x0F,
        }
    }
}

/// Payload serialization (high nibble of byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serialization {
    None,
    Json,
    Other(u8),
}

impl From<u8> for Serialization {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0 => Self::None,
            1 => Self::Json,
            other => Self::Other(other),
        }
    }
}

impl From<Serialization> for u8 {
    fn from(s: Serialization) -> u8 {
        match s {
            Serialization::None => 0,
            Serialization::Json => 1,
            Serialization::Other(v) => v & 0x0F,
        }
    }
}

/// Payload compression (low nibble of byte 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None,
    Gzip,
    Other(u8),
}

impl From<u8> for Compression {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0 => Self::None,
            1 => Self::Gzip,
            other => Self::Other(other),
        }
    }
}

impl From<Compression> for u8 {
    fn from(c: Compression) -> u8 {
        match c {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Other(v) => v & 0x0F,
        }
    }
}

/// Decoded 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub header_units: u8,
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
    pub reserved: u8,
}

impl FrameHeader {
    pub fn new(
        message_type: MessageType,
        flags: u8,
        serialization: Serialization,
        compression: Compression,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            header_units: HEADER_UNITS,
            message_type,
            flags: flags & 0x0F,
            serialization,
            compression,
            reserved: 0,
        }
    }

    /// Parse the first four bytes of `bytes`. Returns `None` if too short.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Self {
            version: raw[0] >> 4,
            header_units: raw[0] & 0x0F,
            message_type: MessageType::from(raw[1] >> 4),
            flags: raw[1] & 0x0F,
            serialization: Serialization::from(raw[2] >> 4),
            compression: Compression::from(raw[2] & 0x0F),
            reserved: raw[3],
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [
            ((self.version & 0x0F) << 4) | (self.header_units & 0x0F),
            (u8::from(self.message_type) << 4) | (self.flags & 0x0F),
            (u8::from(self.serialization) << 4) | u8::from(self.compression),
            self.reserved,
        ]
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        self.header_units as usize * 4
    }

    pub fn is_last_packet(&self) -> bool {
        self.flags & flags::LAST_PACKET != 0
    }

    pub fn has_sequence(&self) -> bool {
        self.flags & flags::POSITIVE_SEQUENCE != 0
    }
}

/// Pack a header from its four fields.
pub fn build_header(
    message_type: MessageType,
    flags: u8,
    serialization: Serialization,
    compression: Compression,
) -> [u8; 4] {
    FrameHeader::new(message_type, flags, serialization, compression).to_bytes()
}

/// A parsed frame. `payload` is still compressed if the header says so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    /// Raw prefix bytes between the header and the payload length.
    pub prefix: Vec<u8>,
    /// Sequence number, when decoded with [`decode_server_frame`].
    pub sequence: Option<i32>,
    pub payload: Vec<u8>,
}

/// Payload after deserialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let raw: [u8; 4] = bytes.get(offset..end)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// gzip-compress `data`.
pub fn gzip(data: &[u8]) -> AsrResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AsrError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| AsrError::Compression(e.to_string()))
}

/// Decompress a gzip stream.
pub fn gunzip(data: &[u8]) -> AsrResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AsrError::Compression(e.to_string()))?;
    Ok(out)
}

/// Encode a complete frame.
///
/// The payload is gzip-compressed only when `compression` is gzip and the
/// payload is non-empty; an empty payload is always sent as zero bytes.
pub fn encode_frame(
    message_type: MessageType,
    flags: u8,
    serialization: Serialization,
    compression: Compression,
    prefixes: &[&[u8]],
    payload: &[u8],
) -> AsrResult<Vec<u8>> {
    let body = if compression == Compression::Gzip && !payload.is_empty() {
        gzip(payload)?
    } else {
        payload.to_vec()
    };

    let len = u32::try_from(body.len())
        .map_err(|_| AsrError::Codec(format!("payload too large: {} bytes", body.len())))?;

    let prefix_len: usize = prefixes.iter().map(|p| p.len()).sum();
    let mut frame = Vec::with_capacity(4 + prefix_len + 4 + body.len());
    frame.extend_from_slice(&build_header(message_type, flags, serialization, compression));
    for prefix in prefixes {
        frame.extend_from_slice(prefix);
    }
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(body);
    Ok(frame)
}

/// [`encode_frame`] with large gzip work moved onto the blocking pool.
pub async fn encode_frame_offloaded(
    message_type: MessageType,
    flags: u8,
    serialization: Serialization,
    compression: Compression,
    prefixes: Vec<Vec<u8>>,
    payload: Vec<u8>,
) -> AsrResult<Vec<u8>> {
    let inline = compression != Compression::Gzip || payload.len() < OFFLOAD_THRESHOLD;
    let encode = move || {
        let refs: Vec<&[u8]> = prefixes.iter().map(Vec::as_slice).collect();
        encode_frame(message_type, flags, serialization, compression, &refs, &payload)
    };

    if inline {
        return encode();
    }
    tokio::task::spawn_blocking(encode)
        .await
        .map_err(|e| AsrError::Other(format!("compression task failed: {e}")))?
}

/// Decode a frame with no prefix: the payload length follows the header.
pub fn decode_frame(bytes: &[u8]) -> Option<Frame> {
    decode_frame_with_prefix(bytes, 0)
}

/// Decode a frame whose header is followed by `prefix_len` bytes of
/// protocol-specific fields before the payload length.
pub fn decode_frame_with_prefix(bytes: &[u8], prefix_len: usize) -> Option<Frame> {
    if bytes.len() < MIN_FRAME_LEN {
        return None;
    }
    let header = FrameHeader::parse(bytes)?;
    if header.header_units == 0 {
        return None;
    }

    let prefix_start = header.header_len();
    let prefix_end = prefix_start.checked_add(prefix_len)?;
    let prefix = bytes.get(prefix_start..prefix_end)?.to_vec();

    let len = read_u32(bytes, prefix_end)? as usize;
    let payload_start = prefix_end + 4;
    let payload_end = payload_start.checked_add(len)?;
    let payload = bytes.get(payload_start..payload_end)?.to_vec();

    Some(Frame {
        header,
        prefix,
        sequence: None,
        payload,
    })
}

/// Decode a frame sent by the recognition service.
///
/// Server responses carry a 4-byte signed sequence number after the header
/// whenever the sequence bit is set in the flags.
pub fn decode_server_frame(bytes: &[u8]) -> Option<Frame> {
    let header = FrameHeader::parse(bytes)?;
    let prefix_len = if header.has_sequence() { 4 } else { 0 };
    let mut frame = decode_frame_with_prefix(bytes, prefix_len)?;
    if prefix_len == 4 {
        let raw: [u8; 4] = frame.prefix.as_slice().try_into().ok()?;
        frame.sequence = Some(i32::from_be_bytes(raw));
    }
    Some(frame)
}

/// Undo payload compression. Zero-length payloads pass through untouched.
pub fn decode_payload(payload: &[u8], compression: Compression) -> AsrResult<Vec<u8>> {
    match compression {
        Compression::Gzip if !payload.is_empty() => gunzip(payload),
        _ => Ok(payload.to_vec()),
    }
}

/// [`decode_payload`] with large gzip work moved onto the blocking pool.
pub async fn decode_payload_offloaded(
    payload: Vec<u8>,
    compression: Compression,
) -> AsrResult<Vec<u8>> {
    if compression != Compression::Gzip || payload.len() < OFFLOAD_THRESHOLD {
        return decode_payload(&payload, compression);
    }
    tokio::task::spawn_blocking(move || decode_payload(&payload, compression))
        .await
        .map_err(|e| AsrError::Other(format!("decompression task failed: {e}")))?
}

/// Interpret decompressed bytes according to the serialization flag.
///
/// JSON that fails to parse falls back to its text form; this never errors.
pub fn decode_by_serialization(bytes: &[u8], serialization: Serialization) -> Payload {
    match serialization {
        Serialization::Json => match serde_json::from_slice(bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(bytes).into_owned()),
        },
        Serialization::None | Serialization::Other(_) => Payload::Bytes(bytes.to_vec()),
    }
}

/// Build the session handshake frame carrying a JSON request body.
pub fn full_client_request(json: &serde_json::Value, compression: Compression) -> AsrResult<Vec<u8>> {
    let body = serde_json::to_vec(json)?;
    encode_frame(
        MessageType::FullClientRequest,
        flags::NONE,
        Serialization::Json,
        compression,
        &[],
        &body,
    )
}

/// Build an audio chunk frame. `last` marks the end of the stream.
pub fn audio_only_request(audio: &[u8], last: bool, compression: Compression) -> AsrResult<Vec<u8>> {
    let flags = if last { flags::LAST_PACKET } else { flags::NONE };
    encode_frame(
        MessageType::AudioOnlyRequest,
        flags,
        Serialization::None,
        compression,
        &[],
        audio,
    )
}
