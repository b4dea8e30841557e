//! Frame codec for the synchronization protocol.
//!
//! Wire format: all multi-byte integers are big-endian, strings are
//! length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload (len counts the payload only)
//!
//! A connection starts with a HELLO exchange, then carries exactly one
//! REQUEST and its RESPONSE. Content updates and uploads stream their parts
//! (SEED_PART, SOURCE_PART, DATA) after the request, closed by PARTS_END or
//! ABORT.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::rdc::TransferPart;

pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// zstd level for DATA frames
const COMPRESSION_LEVEL: i32 = 3;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Request = 0x02,
    Response = 0x03,
    SeedPart = 0x04,
    SourcePart = 0x05,
    Data = 0x06,
    PartsEnd = 0x07,
    Abort = 0x08,
    Fatal = 0x0E,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Request),
            0x03 => Some(Self::Response),
            0x04 => Some(Self::SeedPart),
            0x05 => Some(Self::SourcePart),
            0x06 => Some(Self::Data),
            0x07 => Some(Self::PartsEnd),
            0x08 => Some(Self::Abort),
            0x0E => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        const COMPRESSION = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length missing", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!("{} truncated", what);
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

fn frame_header(buf: &mut BytesMut, payload_len: usize, msg_type: MessageType) {
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    /// Public address of the sending server, empty for plain clients
    pub server_url: String,
}

impl Hello {
    pub fn new(flags: HelloFlags, server_url: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            server_url: server_url.into(),
        }
    }

    pub fn compression(&self) -> bool {
        self.flags.contains(HelloFlags::COMPRESSION)
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + 4 + 2 + self.server_url.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);

        frame_header(&mut buf, payload_len, MessageType::Hello);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        put_string(&mut buf, &self.server_url);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let flags = HelloFlags::from_bits_truncate(payload.get_u32());
        let server_url = get_string(&mut payload, "Hello server url")?;

        Ok(Self {
            version,
            flags,
            server_url,
        })
    }
}

// =============================================================================
// REQUEST (0x02) / RESPONSE (0x03)
// =============================================================================

/// Frame carrying `value` as JSON.
pub fn encode_json<T: Serialize>(msg_type: MessageType, value: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(value).context("Failed to encode JSON frame")?;
    let mut buf = BytesMut::with_capacity(5 + json.len());
    frame_header(&mut buf, json.len(), msg_type);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

pub fn decode_json<T: DeserializeOwned>(payload: Bytes) -> Result<T> {
    serde_json::from_slice(&payload).context("Invalid JSON frame")
}

// =============================================================================
// SEED_PART (0x04) / SOURCE_PART (0x05)
// =============================================================================

fn encode_range(msg_type: MessageType, offset: u64, length: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + 16);
    frame_header(&mut buf, 16, msg_type);
    buf.put_u64(offset);
    buf.put_u64(length);
    buf.freeze()
}

fn decode_range(mut payload: Bytes, what: &str) -> Result<(u64, u64)> {
    if payload.remaining() < 16 {
        anyhow::bail!("{} payload too short", what);
    }
    Ok((payload.get_u64(), payload.get_u64()))
}

// =============================================================================
// DATA (0x06)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Data {
    pub flags: DataFlags,
    pub data: Bytes,
}

impl Data {
    /// DATA frame for `data`, compressed when asked and when it pays off.
    pub fn new(data: Bytes, compress: bool) -> Result<Self> {
        if compress && !data.is_empty() {
            let compressed = zstd::encode_all(data.as_ref(), COMPRESSION_LEVEL)
                .context("Failed to compress data")?;
            if compressed.len() < data.len() {
                return Ok(Self {
                    flags: DataFlags::COMPRESSED,
                    data: Bytes::from(compressed),
                });
            }
        }
        Ok(Self {
            flags: DataFlags::empty(),
            data,
        })
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + self.data.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        frame_header(&mut buf, payload_len, MessageType::Data);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            anyhow::bail!("Data payload too short");
        }
        let flags = DataFlags::from_bits_truncate(payload.get_u8());
        Ok(Self {
            flags,
            data: payload,
        })
    }

    /// The original bytes.
    pub fn into_content(self) -> Result<Bytes> {
        if self.flags.contains(DataFlags::COMPRESSED) {
            let content = zstd::decode_all(self.data.as_ref()).context("Failed to decompress data")?;
            Ok(Bytes::from(content))
        } else {
            Ok(self.data)
        }
    }
}

// =============================================================================
// PARTS_END (0x07) / ABORT (0x08)
// =============================================================================

pub fn encode_parts_end() -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    frame_header(&mut buf, 0, MessageType::PartsEnd);
    buf.freeze()
}

/// Sent instead of PARTS_END when the sender could not produce all parts.
#[derive(Debug, Clone)]
pub struct Abort {
    pub message: String,
}

impl Abort {
    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + self.message.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        frame_header(&mut buf, payload_len, MessageType::Abort);
        put_string(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let message = get_string(&mut payload, "Abort message")?;
        Ok(Self { message })
    }
}

// =============================================================================
// FATAL (0x0E)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub const UNSUPPORTED_VERSION: u16 = 1;
    pub const UNEXPECTED_MESSAGE: u16 = 2;
    pub const BAD_REQUEST: u16 = 3;

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + 2 + self.message.len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        frame_header(&mut buf, payload_len, MessageType::Fatal);
        buf.put_u16(self.code);
        put_string(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Fatal payload too short");
        }
        let code = payload.get_u16();
        let message = get_string(&mut payload, "Fatal message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Transfer parts
// =============================================================================

pub fn encode_part(part: &TransferPart, compress: bool) -> Result<Bytes> {
    match part {
        TransferPart::Seed { offset, length } => {
            Ok(encode_range(MessageType::SeedPart, *offset, *length))
        }
        TransferPart::Source { offset, length } => {
            Ok(encode_range(MessageType::SourcePart, *offset, *length))
        }
        TransferPart::Data(data) => Ok(Data::new(data.clone(), compress)?.encode()),
    }
}

/// Decode a part frame. Returns `None` for frames that are not parts.
pub fn decode_part(msg_type: MessageType, payload: Bytes) -> Result<Option<TransferPart>> {
    match msg_type {
        MessageType::SeedPart => {
            let (offset, length) = decode_range(payload, "SeedPart")?;
            Ok(Some(TransferPart::Seed { offset, length }))
        }
        MessageType::SourcePart => {
            let (offset, length) = decode_range(payload, "SourcePart")?;
            Ok(Some(TransferPart::Source { offset, length }))
        }
        MessageType::Data => Ok(Some(TransferPart::Data(
            Data::decode(payload)?.into_content()?,
        ))),
        _ => Ok(None),
    }
}

// =============================================================================
// Frame I/O
// =============================================================================

/// Maximum frame size (64MB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    Supported(u16),
    /// Peer needs an upgrade
    TooOld { client: u16, min_supported: u16 },
    /// This server needs an upgrade
    TooNew { client: u16, max_supported: u16 },
}

pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
