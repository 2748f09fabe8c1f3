//! Wire framing
//!
//! Every packet is `magic(4) | command(12) | length(4) | checksum(4) | payload`.
//! The checksum is the first four bytes of double SHA-256 over the payload.

use crate::crypto::checksum;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size
pub const HEADER_SIZE: usize = 24;

/// Maximum payload we accept (a 4 MB block plus slack)
pub const MAX_MESSAGE_SIZE: usize = 4_000_000 + 1_000;

const COMMAND_SIZE: usize = 12;

/// Framing errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Packet too large: {0} bytes (max: {1})")]
    PacketTooLarge(usize, usize),
    #[error("Invalid command string")]
    InvalidCommand,
    #[error("Checksum mismatch for {0}")]
    BadChecksum(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A framed packet before payload parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub command: String,
    pub payload: Bytes,
    /// Precomputed checksum, if the caller already has it
    pub checksum: Option<[u8; 4]>,
}

impl RawPacket {
    pub fn new(command: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
            checksum: None,
        }
    }
}

/// Bitcoin message codec, one instance per connection
#[derive(Debug, Clone)]
pub struct WireCodec {
    magic: u32,
}

impl WireCodec {
    pub fn new(magic: u32) -> Self {
        Self { magic }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }
}

fn parse_command(raw: &[u8]) -> Result<String, CodecError> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    // Everything after the terminator must be padding
    if raw[end..].iter().any(|b| *b != 0) {
        return Err(CodecError::InvalidCommand);
    }
    let name = &raw[..end];
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(CodecError::InvalidCommand);
    }
    String::from_utf8(name.to_vec()).map_err(|_| CodecError::InvalidCommand)
}

impl Encoder<RawPacket> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RawPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = item.command.as_bytes();
        if command.len() > COMMAND_SIZE {
            return Err(CodecError::InvalidCommand);
        }
        if item.payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::PacketTooLarge(item.payload.len(), MAX_MESSAGE_SIZE));
        }

        let sum = item.checksum.unwrap_or_else(|| checksum(&item.payload));

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u32_le(self.magic);
        dst.put_slice(command);
        dst.put_bytes(0, COMMAND_SIZE - command.len());
        dst.put_u32_le(item.payload.len() as u32);
        dst.put_slice(&sum);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = RawPacket;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Check magic
        let magic = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if magic != self.magic {
            return Err(CodecError::InvalidMagic(magic));
        }

        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CodecError::PacketTooLarge(len, MAX_MESSAGE_SIZE));
        }

        // Check if we have full message
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let command = parse_command(&src[4..16])?;
        let sum = [src[20], src[21], src[22], src[23]];

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        if checksum(&payload) != sum {
            return Err(CodecError::BadChecksum(command));
        }

        Ok(Some(RawPacket {
            command,
            payload,
            checksum: Some(sum),
        }))
    }
}

/// Frame a single packet into a standalone buffer
pub fn frame(
    magic: u32,
    command: &str,
    payload: &[u8],
    sum: Option<[u8; 4]>,
) -> Result<Bytes, CodecError> {
    let mut codec = WireCodec::new(magic);
    let mut buf = BytesMut::new();
    let packet = RawPacket {
        command: command.to_string(),
        payload: Bytes::copy_from_slice(payload),
        checksum: sum,
    };
    codec.encode(packet, &mut buf)?;
    Ok(buf.freeze())
}
