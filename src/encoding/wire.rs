//! The byte-exact wire codec for scheduling messages. Fields are laid out in
//! a fixed order as little-endian 32-bit values with no framing, so that two
//! workers built from the same source always agree on every byte. The layout
//! is not self-describing: the receiver must know the concrete type from the
//! message tag.
//!
//! Rich payloads (descriptions, results) do not use this codec; they go
//! through [`super::bincode`] instead.

use crate::error::{Error, Result};

/// A type with a fixed little-endian wire layout.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(buf: &[u8], offset: &mut usize) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        Self::decode(buf, &mut offset)
    }
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = *offset + len;
    if end > buf.len() {
        return Err(Error::Serialization(format!(
            "message truncated: need {} bytes at offset {}, have {}",
            len,
            offset,
            buf.len()
        )));
    }
    let slice = &buf[*offset..end];
    *offset = end;
    Ok(slice)
}

pub fn get_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(buf, offset, 4)?.try_into().unwrap()))
}

pub fn get_i32(buf: &[u8], offset: &mut usize) -> Result<i32> {
    Ok(i32::from_le_bytes(take(buf, offset, 4)?.try_into().unwrap()))
}

pub fn get_f32(buf: &[u8], offset: &mut usize) -> Result<f32> {
    Ok(f32::from_le_bytes(take(buf, offset, 4)?.try_into().unwrap()))
}

pub fn get_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(buf, offset, 8)?.try_into().unwrap()))
}

pub fn get_bool(buf: &[u8], offset: &mut usize) -> Result<bool> {
    Ok(take(buf, offset, 1)?[0] != 0)
}

/// Encodes a flat sequence of 32-bit integers, the payload shape of most
/// small control messages (job IDs, indexes, volumes, epochs).
pub fn encode_i32s(values: &[i32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        put_i32(&mut buf, v);
    }
    buf
}

/// Decodes a flat sequence of 32-bit integers, requiring at least `min`
/// entries. Trailing bytes that do not form a whole integer are an error.
pub fn decode_i32s(buf: &[u8], min: usize) -> Result<Vec<i32>> {
    if buf.len() % 4 != 0 {
        return Err(Error::Serialization(format!(
            "int payload has {} trailing bytes",
            buf.len() % 4
        )));
    }
    let mut offset = 0;
    let mut values = Vec::with_capacity(buf.len() / 4);
    while offset < buf.len() {
        values.push(get_i32(buf, &mut offset)?);
    }
    if values.len() < min {
        return Err(Error::Serialization(format!(
            "int payload has {} entries, need {min}",
            values.len()
        )));
    }
    Ok(values)
}
