//! Frame codec
//!
//! Wire format:
//!
//! ```text
//! [u32 BE frame_len][u8 kind][u32 BE header_len][JSON header][f32 LE tail]
//! ```
//!
//! `frame_len` counts every byte after itself. The tail is empty except for
//! messages that carry a parameter vector.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::{Message, MessageKind};
use crate::error::{Error, Result};

/// Default upper bound on a single frame (256 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Kind byte plus header length field
const PREAMBLE_LEN: usize = 1 + 4;

/// Reads and writes framed messages with a size limit
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Encode a message into a complete frame, length prefix included
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>> {
        let header = encode_header(msg)?;
        let tail = msg.tail().unwrap_or(&[]);

        let frame_len = PREAMBLE_LEN + header.len() + tail.len() * 4;
        if frame_len > self.max_frame_bytes || frame_len > u32::MAX as usize {
            return Err(Error::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_bytes,
            });
        }

        let mut buf = Vec::with_capacity(4 + frame_len);
        buf.extend_from_slice(&(frame_len as u32).to_be_bytes());
        buf.push(msg.kind() as u8);
        buf.extend_from_slice(&(header.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header);
        extend_f32_le(&mut buf, tail);
        Ok(buf)
    }

    /// Write one framed message and flush
    pub async fn write<W>(&self, writer: &mut W, msg: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one framed message
    ///
    /// A clean close before the length prefix surfaces as an
    /// `UnexpectedEof` IO error.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let frame_len = reader.read_u32().await? as usize;
        if frame_len > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_bytes,
            });
        }
        if frame_len < PREAMBLE_LEN {
            return Err(Error::malformed(format!("frame of {} bytes is too short", frame_len)));
        }

        let kind = reader.read_u8().await?;
        let header_len = reader.read_u32().await? as usize;
        let remaining = frame_len - PREAMBLE_LEN;
        if header_len > remaining {
            return Err(Error::malformed(format!(
                "header length {} exceeds frame body {}",
                header_len, remaining
            )));
        }

        let tail_len = remaining - header_len;
        if tail_len % 4 != 0 {
            return Err(Error::malformed(format!(
                "tail of {} bytes is not a whole number of f32 values",
                tail_len
            )));
        }

        let mut header = vec![0u8; header_len];
        reader.read_exact(&mut header).await?;

        let mut tail = vec![0f32; tail_len / 4];
        reader
            .read_exact(bytemuck::cast_slice_mut(tail.as_mut_slice()))
            .await?;
        if cfg!(target_endian = "big") {
            for value in tail.iter_mut() {
                *value = f32::from_bits(u32::from_le(value.to_bits()));
            }
        }

        decode(kind, &header, tail)
    }
}

/// Build a message from its kind byte, JSON header and decoded tail
pub fn decode(kind: u8, header: &[u8], tail: Vec<f32>) -> Result<Message> {
    let kind = MessageKind::from_u8(kind)?;
    let mut msg = match kind {
        MessageKind::Register => Message::Register(parse_header(header)?),
        MessageKind::NeighborTable => Message::NeighborTable(parse_header(header)?),
        MessageKind::Resolve => Message::Resolve(parse_header(header)?),
        MessageKind::Resolved => Message::Resolved(parse_header(header)?),
        MessageKind::Telemetry => Message::Telemetry(parse_header(header)?),
        MessageKind::PeerHello => Message::PeerHello(parse_header(header)?),
        MessageKind::PeerVector => Message::PeerVector(parse_header(header)?),
        MessageKind::Error => Message::Error(parse_header(header)?),
        MessageKind::Goodbye => Message::Goodbye(parse_header(header)?),
    };
    msg.attach_tail(tail)?;
    Ok(msg)
}

/// Read with the default size limit
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    FrameCodec::default().read(reader).await
}

/// Write with the default size limit
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    FrameCodec::default().write(writer, msg).await
}

fn encode_header(msg: &Message) -> Result<Vec<u8>> {
    match msg {
        Message::Register(m) => to_header(m),
        Message::NeighborTable(m) => to_header(m),
        Message::Resolve(m) => to_header(m),
        Message::Resolved(m) => to_header(m),
        Message::Telemetry(m) => to_header(m),
        Message::PeerHello(m) => to_header(m),
        Message::PeerVector(m) => to_header(m),
        Message::Error(m) => to_header(m),
        Message::Goodbye(m) => to_header(m),
    }
}

fn to_header<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Internal(format!("header encoding: {}", e)))
}

fn parse_header<T: DeserializeOwned>(header: &[u8]) -> Result<T> {
    serde_json::from_slice(header).map_err(|e| Error::malformed(format!("bad header: {}", e)))
}

fn extend_f32_le(buf: &mut Vec<u8>, values: &[f32]) {
    if cfg!(target_endian = "little") {
        buf.extend_from_slice(bytemuck::cast_slice(values));
    } else {
        for value in values {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
