//! Consensus encoding helpers
//!
//! Little-endian integers, CompactSize var-ints and length-prefixed byte
//! strings over `bytes::Buf` / `bytes::BufMut`.

use crate::crypto::Hash256;
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Non-canonical var-int")]
    NonCanonicalVarint,
    #[error("{0} too large: {1} (max: {2})")]
    TooLarge(&'static str, u64, u64),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type EncodingResult<T> = Result<T, EncodingError>;

fn ensure<B: Buf>(buf: &B, needed: usize) -> EncodingResult<()> {
    if buf.remaining() < needed {
        return Err(EncodingError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8<B: Buf>(buf: &mut B) -> EncodingResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16<B: Buf>(buf: &mut B) -> EncodingResult<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

/// Big-endian u16 (network port numbers)
pub fn read_u16_be<B: Buf>(buf: &mut B) -> EncodingResult<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_u32<B: Buf>(buf: &mut B) -> EncodingResult<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32<B: Buf>(buf: &mut B) -> EncodingResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn read_u64<B: Buf>(buf: &mut B) -> EncodingResult<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn read_i64<B: Buf>(buf: &mut B) -> EncodingResult<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn read_hash<B: Buf>(buf: &mut B) -> EncodingResult<Hash256> {
    let mut hash = [0u8; 32];
    read_exact(buf, &mut hash)?;
    Ok(hash)
}

pub fn read_exact<B: Buf>(buf: &mut B, out: &mut [u8]) -> EncodingResult<()> {
    ensure(buf, out.len())?;
    buf.copy_to_slice(out);
    Ok(())
}

/// Read a CompactSize var-int, rejecting non-minimal encodings
pub fn read_varint<B: Buf>(buf: &mut B) -> EncodingResult<u64> {
    let prefix = read_u8(buf)?;
    let (value, min) = match prefix {
        0xfd => (read_u16(buf)? as u64, 0xfd),
        0xfe => (read_u32(buf)? as u64, 0x1_0000),
        0xff => (read_u64(buf)?, 0x1_0000_0000),
        n => return Ok(n as u64),
    };
    if value < min {
        return Err(EncodingError::NonCanonicalVarint);
    }
    Ok(value)
}

/// Read a var-int used as a count, bounded by `max`
pub fn read_count<B: Buf>(buf: &mut B, what: &'static str, max: usize) -> EncodingResult<usize> {
    let count = read_varint(buf)?;
    if count > max as u64 {
        return Err(EncodingError::TooLarge(what, count, max as u64));
    }
    Ok(count as usize)
}

pub fn read_var_bytes<B: Buf>(buf: &mut B, max: usize) -> EncodingResult<Vec<u8>> {
    let len = read_count(buf, "byte string", max)?;
    let mut data = vec![0u8; len];
    read_exact(buf, &mut data)?;
    Ok(data)
}

pub fn read_var_string<B: Buf>(buf: &mut B, max: usize) -> EncodingResult<String> {
    let data = read_var_bytes(buf, max)?;
    String::from_utf8(data).map_err(|e| EncodingError::InvalidData(e.to_string()))
}

pub fn put_varint<B: BufMut>(buf: &mut B, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn put_var_bytes<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}
