//! Wire message codec.
//!
//! Every message is a fixed header followed by typed parts:
//!
//! ```text
//! +----------------+---------------+----------------+------------------------+
//! | category (u32) | subtype (i32) | sequence (i32) | parts ...              |
//! +----------------+---------------+----------------+------------------------+
//! part: part_type (u32) | length (u32) | bytes[length]
//! ```
//!
//! All integers are big-endian. Field order and widths are fixed so that
//! clients can be written independently of this crate.

pub mod control;
pub mod message;
pub mod publish;
pub mod reply;

pub use control::{ControlCommand, ControlReply, UnknownCommand};
pub use message::{Category, DecodeError, Header, Message, Part, HEADER_LEN, PART_HEADER_LEN};
pub use publish::{
    FileInfo, LdataFields, Payload, PublishKind, PublishReply, PublishRequest, RequestError,
};
pub use reply::ErrorReply;

// =============================================================================
// Part Types
// =============================================================================

pub mod part {
    pub const URL: u32 = 1;
    pub const FILE_NAME: u32 = 2;
    /// mod_time: i64 | overwrite_age_secs: i32
    pub const FILE_INFO: u32 = 3;
    /// i64 unix seconds, time-keyed variants only
    pub const DATA_TIME: u32 = 4;
    pub const FILE_EXT: u32 = 5;
    /// length: u64 (uncompressed) | flags: u32
    pub const PAYLOAD_INFO: u32 = 6;
    pub const PAYLOAD: u32 = 7;
    pub const WRITER: u32 = 8;
    pub const DATA_TYPE: u32 = 9;
    pub const USER_INFO1: u32 = 10;
    pub const USER_INFO2: u32 = 11;

    pub const ERR_CODE: u32 = 20;
    /// May repeat; joined with newlines
    pub const ERR_STRING: u32 = 21;
    pub const DO_PUT: u32 = 22;

    pub const PID: u32 = 30;
    pub const SERVER_NAME: u32 = 31;
    pub const NUM_CLIENTS: u32 = 32;
}

// =============================================================================
// Payload Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PayloadFlags: u32 {
        const ZSTD = 1 << 0;
        /// lz4 block with little-endian u32 size prefix
        const LZ4 = 1 << 1;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ErrorCode {
    #[default]
    None = 0,
    BadMessage = 1,
    ServerError = 2,
    ServiceDenied = 3,
    UnknownCommand = 4,
    PublishFailed = 5,
    SecurityDenied = 6,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::BadMessage),
            2 => Some(Self::ServerError),
            3 => Some(Self::ServiceDenied),
            4 => Some(Self::UnknownCommand),
            5 => Some(Self::PublishFailed),
            6 => Some(Self::SecurityDenied),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::None
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::BadMessage => "BAD_MESSAGE",
            Self::ServerError => "SERVER_ERROR",
            Self::ServiceDenied => "SERVICE_DENIED",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::PublishFailed => "PUBLISH_FAILED",
            Self::SecurityDenied => "SECURITY_DENIED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_from_u32() {
        assert_eq!(ErrorCode::from_u32(0), Some(ErrorCode::None));
        assert_eq!(ErrorCode::from_u32(3), Some(ErrorCode::ServiceDenied));
        assert_eq!(ErrorCode::from_u32(6), Some(ErrorCode::SecurityDenied));
        assert_eq!(ErrorCode::from_u32(99), None);
    }

    #[test]
    fn test_payload_flags_bits() {
        assert_eq!(PayloadFlags::ZSTD.bits(), 1);
        assert_eq!(PayloadFlags::LZ4.bits(), 2);
        assert_eq!(PayloadFlags::from_bits_truncate(0xFF), PayloadFlags::all());
    }
}
