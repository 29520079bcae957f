//! Generic message envelope: header plus ordered parts.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// category:u32 | subtype:i32 | sequence:i32
pub const HEADER_LEN: usize = 12;

/// part_type:u32 | length:u32
pub const PART_HEADER_LEN: usize = 8;

// =============================================================================
// Category
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Category {
    /// Server-originated error replies not tied to a decoded request
    Generic = 0,
    /// Requests about the server itself
    Control = 1,
    /// File-publish protocol
    Data = 2,
}

impl Category {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Generic),
            1 => Some(Self::Control),
            2 => Some(Self::Data),
            _ => None,
        }
    }
}

// =============================================================================
// Decode errors
// =============================================================================

/// The message could not be understood. Answered with `BAD_MESSAGE`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Message too short: {len} bytes, header needs {HEADER_LEN}")]
    TooShort { len: usize },

    #[error("Unknown message category {0}")]
    UnknownCategory(u32),

    #[error("Part {index} header truncated: {remaining} bytes left")]
    PartHeaderTruncated { index: usize, remaining: usize },

    #[error("Part {index} (type {part_type}) declares {declared} bytes, only {remaining} left")]
    PartTruncated {
        index: usize,
        part_type: u32,
        declared: usize,
        remaining: usize,
    },

    #[error("Part type {part_type} should be {expected} bytes, got {actual}")]
    PartSize {
        part_type: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Part type {part_type} is not valid UTF-8")]
    InvalidUtf8 { part_type: u32 },
}

// =============================================================================
// Header / Part / Message
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub category: Category,
    pub subtype: i32,
    pub sequence: i32,
}

impl Header {
    /// Validate and decode only the fixed header.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }
        let mut buf = &bytes[..HEADER_LEN];
        let raw_category = buf.get_u32();
        let category =
            Category::from_u32(raw_category).ok_or(DecodeError::UnknownCategory(raw_category))?;
        Ok(Self {
            category,
            subtype: buf.get_i32(),
            sequence: buf.get_i32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub part_type: u32,
    pub data: Bytes,
}

impl Part {
    pub fn as_str(&self) -> Result<&str, DecodeError> {
        std::str::from_utf8(&self.data).map_err(|_| DecodeError::InvalidUtf8 {
            part_type: self.part_type,
        })
    }

    /// Check a fixed-size part and return a cursor over it.
    pub fn fixed(&self, expected: usize) -> Result<&[u8], DecodeError> {
        if self.data.len() != expected {
            return Err(DecodeError::PartSize {
                part_type: self.part_type,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(&self.data)
    }

    pub fn as_u32(&self) -> Result<u32, DecodeError> {
        Ok(self.fixed(4)?.get_u32())
    }

    pub fn as_i64(&self) -> Result<i64, DecodeError> {
        Ok(self.fixed(8)?.get_i64())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub category: Category,
    pub subtype: i32,
    pub sequence: i32,
    parts: Vec<Part>,
}

impl Message {
    pub fn new(category: Category, subtype: i32, sequence: i32) -> Self {
        Self {
            category,
            subtype,
            sequence,
            parts: Vec::new(),
        }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn add_part(&mut self, part_type: u32, data: impl Into<Bytes>) -> &mut Self {
        self.parts.push(Part {
            part_type,
            data: data.into(),
        });
        self
    }

    pub fn add_str(&mut self, part_type: u32, value: &str) -> &mut Self {
        self.add_part(part_type, Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn add_u32(&mut self, part_type: u32, value: u32) -> &mut Self {
        self.add_part(part_type, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn add_i64(&mut self, part_type: u32, value: i64) -> &mut Self {
        self.add_part(part_type, Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// First part of the given type.
    pub fn part(&self, part_type: u32) -> Option<&Part> {
        self.parts.iter().find(|p| p.part_type == part_type)
    }

    pub fn parts_of(&self, part_type: u32) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(move |p| p.part_type == part_type)
    }

    pub fn str_part(&self, part_type: u32) -> Result<Option<String>, DecodeError> {
        self.part(part_type)
            .map(|p| p.as_str().map(str::to_owned))
            .transpose()
    }

    pub fn u32_part(&self, part_type: u32) -> Result<Option<u32>, DecodeError> {
        self.part(part_type).map(Part::as_u32).transpose()
    }

    pub fn i64_part(&self, part_type: u32) -> Result<Option<i64>, DecodeError> {
        self.part(part_type).map(Part::as_i64).transpose()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self
                .parts
                .iter()
                .map(|p| PART_HEADER_LEN + p.data.len())
                .sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.category as u32);
        buf.put_i32(self.subtype);
        buf.put_i32(self.sequence);
        for part in &self.parts {
            buf.put_u32(part.part_type);
            buf.put_u32(part.data.len() as u32);
            buf.put_slice(&part.data);
        }
        buf.freeze()
    }

    /// Decode a whole message. Parts are zero-copy slices of `bytes`.
    pub fn decode(mut bytes: Bytes) -> Result<Self, DecodeError> {
        let header = Header::decode(&bytes)?;
        bytes.advance(HEADER_LEN);

        let mut parts = Vec::new();
        while bytes.has_remaining() {
            let index = parts.len();
            if bytes.remaining() < PART_HEADER_LEN {
                return Err(DecodeError::PartHeaderTruncated {
                    index,
                    remaining: bytes.remaining(),
                });
            }
            let part_type = bytes.get_u32();
            let declared = bytes.get_u32() as usize;
            if bytes.remaining() < declared {
                return Err(DecodeError::PartTruncated {
                    index,
                    part_type,
                    declared,
                    remaining: bytes.remaining(),
                });
            }
            parts.push(Part {
                part_type,
                data: bytes.split_to(declared),
            });
        }

        Ok(Self {
            category: header.category,
            subtype: header.subtype,
            sequence: header.sequence,
            parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let mut msg = Message::new(Category::Control, 2, 7);
        msg.add_u32(30, 0xDEADBEEF);
        let encoded = msg.encode();

        assert_eq!(
            encoded.as_ref(),
            &[
                0, 0, 0, 1, // category
                0, 0, 0, 2, // subtype
                0, 0, 0, 7, // sequence
                0, 0, 0, 30, // part_type
                0, 0, 0, 4, // length
                0xDE, 0xAD, 0xBE, 0xEF,
            ]
        );
        assert_eq!(encoded.len(), msg.encoded_len());
    }

    #[test]
    fn test_decode_preserves_part_order() {
        let mut msg = Message::new(Category::Data, 3, -1);
        msg.add_str(21, "first")
            .add_str(1, "url")
            .add_str(21, "second");
        let decoded = Message::decode(msg.encode()).unwrap();

        assert_eq!(decoded.sequence, -1);
        let errs: Vec<_> = decoded
            .parts_of(21)
            .map(|p| p.as_str().unwrap().to_string())
            .collect();
        assert_eq!(errs, vec!["first", "second"]);
        assert_eq!(decoded.str_part(1).unwrap().as_deref(), Some("url"));
    }

    #[test]
    fn test_decode_rejects_short_message() {
        let err = Message::decode(Bytes::from_static(&[0, 0, 0, 1, 0])).unwrap_err();
        assert_eq!(err, DecodeError::TooShort { len: 5 });
    }

    #[test]
    fn test_decode_rejects_unknown_category() {
        let mut raw = BytesMut::new();
        raw.put_u32(9);
        raw.put_i32(1);
        raw.put_i32(0);
        let err = Message::decode(raw.freeze()).unwrap_err();
        assert_eq!(err, DecodeError::UnknownCategory(9));
    }

    #[test]
    fn test_decode_rejects_truncated_part() {
        let mut raw = BytesMut::new();
        raw.put_u32(2);
        raw.put_i32(1);
        raw.put_i32(0);
        raw.put_u32(7);
        raw.put_u32(100);
        raw.put_slice(b"short");
        let err = Message::decode(raw.freeze()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PartTruncated {
                index: 0,
                part_type: 7,
                declared: 100,
                remaining: 5
            }
        );
    }

    #[test]
    fn test_decode_rejects_dangling_part_header() {
        let mut raw = BytesMut::new();
        raw.put_u32(1);
        raw.put_i32(1);
        raw.put_i32(0);
        raw.put_u16(3);
        let err = Message::decode(raw.freeze()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PartHeaderTruncated {
                index: 0,
                remaining: 2
            }
        );
    }

    #[test]
    fn test_fixed_part_size_checked() {
        let mut msg = Message::new(Category::Data, 1, 0);
        msg.add_part(4, Bytes::from_static(&[1, 2, 3]));
        let err = msg.i64_part(4).unwrap_err();
        assert_eq!(
            err,
            DecodeError::PartSize {
                part_type: 4,
                expected: 8,
                actual: 3
            }
        );
    }

    #[test]
    fn test_invalid_utf8_part() {
        let mut msg = Message::new(Category::Data, 1, 0);
        msg.add_part(1, Bytes::from_static(&[0xFF, 0xFE]));
        assert_eq!(
            msg.str_part(1).unwrap_err(),
            DecodeError::InvalidUtf8 { part_type: 1 }
        );
    }
}
