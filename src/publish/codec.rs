//! Payload compression.
//!
//! zstd frames are decoded with a capacity of one byte more than the
//! declared length so an oversized frame is caught instead of truncated.
//! lz4 payloads carry a little-endian u32 size prefix, which is checked
//! against the declared length before anything is allocated.

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::{Payload, PayloadFlags};

/// Default bound on a payload's declared (decompressed) length (1GB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1024 * 1024 * 1024;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Declared payload length {length} exceeds limit {max}")]
    TooLarge { length: u64, max: u64 },

    #[error("Payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("Payload flags {0:?} name more than one codec")]
    ConflictingFlags(PayloadFlags),

    #[error("zstd decompression failed: {0}")]
    Zstd(#[source] std::io::Error),

    #[error("lz4 decompression failed: {0}")]
    Lz4(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn flags(self) -> PayloadFlags {
        match self {
            Self::None => PayloadFlags::empty(),
            Self::Zstd => PayloadFlags::ZSTD,
            Self::Lz4 => PayloadFlags::LZ4,
        }
    }
}

/// Build a payload for sending.
pub fn encode_payload(data: &[u8], compression: Compression) -> Result<Payload, PayloadError> {
    let encoded = match compression {
        Compression::None => Bytes::copy_from_slice(data),
        Compression::Zstd => {
            let packed = zstd::bulk::compress(data, ZSTD_LEVEL).map_err(PayloadError::Zstd)?;
            Bytes::from(packed)
        }
        Compression::Lz4 => Bytes::from(lz4_flex::compress_prepend_size(data)),
    };
    Ok(Payload {
        length: data.len() as u64,
        flags: compression.flags(),
        data: encoded,
    })
}

/// Decompress if needed and check the result against the declared length.
///
/// The declared length is checked against `max_bytes` before any buffer is
/// sized from it. Unflagged data that starts with the zstd magic and does
/// not already match the declared length is treated as zstd.
pub fn decode_payload(payload: &Payload, max_bytes: u64) -> Result<Bytes, PayloadError> {
    if payload.length > max_bytes {
        return Err(PayloadError::TooLarge {
            length: payload.length,
            max: max_bytes,
        });
    }
    if payload.flags.contains(PayloadFlags::ZSTD | PayloadFlags::LZ4) {
        return Err(PayloadError::ConflictingFlags(payload.flags));
    }

    let sniffed_zstd = payload.flags.is_empty()
        && payload.data.len() as u64 != payload.length
        && payload.data.starts_with(&ZSTD_MAGIC);

    let decoded = if payload.flags.contains(PayloadFlags::ZSTD) || sniffed_zstd {
        decode_zstd(&payload.data, payload.length)?
    } else if payload.flags.contains(PayloadFlags::LZ4) {
        decode_lz4(&payload.data, payload.length)?
    } else {
        payload.data.clone()
    };

    check_length(payload.length, decoded.len())?;
    Ok(decoded)
}

fn decode_zstd(data: &[u8], declared: u64) -> Result<Bytes, PayloadError> {
    let capacity = declared as usize + 1;
    let out = zstd::bulk::decompress(data, capacity).map_err(PayloadError::Zstd)?;
    Ok(Bytes::from(out))
}

fn decode_lz4(data: &[u8], declared: u64) -> Result<Bytes, PayloadError> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| PayloadError::Lz4("missing size prefix".to_string()))?;
    check_length(declared, u32::from_le_bytes(prefix) as usize)?;

    let out = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| PayloadError::Lz4(e.to_string()))?;
    Ok(Bytes::from(out))
}

fn check_length(declared: u64, actual: usize) -> Result<(), PayloadError> {
    if actual as u64 != declared {
        return Err(PayloadError::LengthMismatch {
            declared,
            actual: actual as u64,
        });
    }
    Ok(())
}
