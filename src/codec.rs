// Copyright (c) 2023 The Quartz Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Byte codecs used across the node.
//!
//! Stored records (transactions, AT records) go through bincode with one
//! pinned configuration; consensus-critical layouts (the AT state blob,
//! packed timestamps, register lanes) are hand-packed little-endian via the
//! helpers below.

use bincode::config::{Configuration, Limit, LittleEndian, Varint};
use bincode::enc::write::Writer;

/// Upper bound on any single encoded record. Anything larger than this is
/// corrupt or hostile, not a real block, transaction or AT blob.
pub const CODEC_BYTES_LIMIT: usize = 1_000_000;

type CodecConfig = Configuration<LittleEndian, Varint, Limit<CODEC_BYTES_LIMIT>>;

/// The one configuration every bincode payload uses: little-endian to match
/// the hand-packed layouts, varint lengths, and no length prefixes on fixed
/// arrays so keys and signatures encode at their natural width (fixed-size
/// arrays never carry a length prefix in bincode's own `Encode`/`Decode`
/// impls, so no extra config is needed for that part).
fn codec_config() -> CodecConfig {
    bincode::config::standard()
        .with_little_endian()
        .with_variable_int_encoding()
        .with_limit::<CODEC_BYTES_LIMIT>()
}

pub fn encode_to_vec<T: bincode::Encode>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(val, codec_config())
}

pub fn encode<W: Writer, T: bincode::Encode>(
    writer: W,
    val: &T,
) -> Result<(), bincode::error::EncodeError> {
    bincode::encode_into_writer(val, writer, codec_config())
}

pub fn decode<T: bincode::Decode>(bytes: &[u8]) -> Result<T, bincode::error::DecodeError> {
    bincode::decode_from_slice(bytes, codec_config()).map(|r| r.0)
}

/// Reads a little-endian u64 at `offset`. Used wherever a consensus byte
/// layout stores 64-bit lanes, e.g. the AT scratch registers.
#[inline]
#[must_use]
pub fn u64_from_le(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
#[must_use]
pub fn u32_from_le(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub fn put_u64_le(bytes: &mut [u8], offset: usize, v: u64) {
    bytes[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u32_le(bytes: &mut [u8], offset: usize, v: u32) {
    bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

/// Cursor over a consensus byte layout. Every read is bounds-checked so a
/// truncated blob surfaces as `None` rather than a panic.
pub struct LeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let v = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        if self.pos + 4 > self.bytes.len() {
            return None;
        }
        let v = u32_from_le(self.bytes, self.pos);
        self.pos += 4;
        Some(v)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        if self.pos + 8 > self.bytes.len() {
            return None;
        }
        let v = u64_from_le(self.bytes, self.pos);
        self.pos += 8;
        Some(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return None;
        }
        let v = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Some(v)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}
