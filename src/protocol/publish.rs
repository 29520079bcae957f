//! Data category: typed publish requests and replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::{Category, DecodeError, Message};
use super::reply::{put_status, read_status};
use super::{part, ErrorCode, PayloadFlags};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Expected a data message, got {0:?}")]
    NotData(Category),

    #[error("Unknown data subtype {0}")]
    UnknownSubtype(i32),

    #[error("{kind} request is missing the {part} part")]
    MissingPart {
        kind: &'static str,
        part: &'static str,
    },
}

// =============================================================================
// Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PublishKind {
    EnquireForPut = 1,
    PutAfterEnquire = 2,
    PutForced = 3,
    /// Deprecated: file name derived from the data time
    EnquireByTime = 4,
    /// Deprecated: file name derived from the data time
    PutByTime = 5,
}

impl PublishKind {
    pub fn from_subtype(subtype: i32) -> Option<Self> {
        match subtype {
            1 => Some(Self::EnquireForPut),
            2 => Some(Self::PutAfterEnquire),
            3 => Some(Self::PutForced),
            4 => Some(Self::EnquireByTime),
            5 => Some(Self::PutByTime),
            _ => None,
        }
    }

    pub fn is_enquire(self) -> bool {
        matches!(self, Self::EnquireForPut | Self::EnquireByTime)
    }

    pub fn is_by_time(self) -> bool {
        matches!(self, Self::EnquireByTime | Self::PutByTime)
    }

    pub fn carries_payload(self) -> bool {
        !self.is_enquire()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EnquireForPut => "ENQUIRE_FOR_PUT",
            Self::PutAfterEnquire => "PUT_AFTER_ENQUIRE",
            Self::PutForced => "PUT_FORCED",
            Self::EnquireByTime => "ENQUIRE_BY_TIME",
            Self::PutByTime => "PUT_BY_TIME",
        }
    }
}

// =============================================================================
// Parts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Unix seconds; `<= 0` leaves the published file's mtime alone.
    pub mod_time: i64,
    /// Seconds; see [`FileInfo::NEVER_OVERWRITE`].
    pub overwrite_age: i32,
}

impl FileInfo {
    pub const NEVER_OVERWRITE: i32 = -1;
    const ENCODED_LEN: usize = 12;

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_i64(self.mod_time);
        buf.put_i32(self.overwrite_age);
        buf.freeze()
    }

    fn decode(msg: &Message) -> Result<Option<Self>, DecodeError> {
        let Some(p) = msg.part(part::FILE_INFO) else {
            return Ok(None);
        };
        let mut buf = p.fixed(Self::ENCODED_LEN)?;
        Ok(Some(Self {
            mod_time: buf.get_i64(),
            overwrite_age: buf.get_i32(),
        }))
    }
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            mod_time: 0,
            overwrite_age: Self::NEVER_OVERWRITE,
        }
    }
}

/// File contents as sent. `length` is the size after decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub length: u64,
    pub flags: PayloadFlags,
    pub data: Bytes,
}

impl Payload {
    const INFO_LEN: usize = 12;

    pub fn raw(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            length: data.len() as u64,
            flags: PayloadFlags::empty(),
            data,
        }
    }

    fn encode_info(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::INFO_LEN);
        buf.put_u64(self.length);
        buf.put_u32(self.flags.bits());
        buf.freeze()
    }

    fn decode(msg: &Message, kind: PublishKind) -> Result<Self, RequestError> {
        let info = msg.part(part::PAYLOAD_INFO).ok_or(RequestError::MissingPart {
            kind: kind.name(),
            part: "PAYLOAD_INFO",
        })?;
        let data = msg.part(part::PAYLOAD).ok_or(RequestError::MissingPart {
            kind: kind.name(),
            part: "PAYLOAD",
        })?;
        let mut buf = info.fixed(Self::INFO_LEN)?;
        Ok(Self {
            length: buf.get_u64(),
            flags: PayloadFlags::from_bits_truncate(buf.get_u32()),
            data: data.data.clone(),
        })
    }
}

/// Optional metadata copied into the latest-data-info record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdataFields {
    pub writer: Option<String>,
    pub data_type: Option<String>,
    pub user_info1: Option<String>,
    pub user_info2: Option<String>,
}

impl LdataFields {
    /// Fill unset fields from `earlier`.
    pub fn merged_over(self, earlier: &LdataFields) -> Self {
        Self {
            writer: self.writer.or_else(|| earlier.writer.clone()),
            data_type: self.data_type.or_else(|| earlier.data_type.clone()),
            user_info1: self.user_info1.or_else(|| earlier.user_info1.clone()),
            user_info2: self.user_info2.or_else(|| earlier.user_info2.clone()),
        }
    }

    fn encode_into(&self, msg: &mut Message) {
        for (id, value) in [
            (part::WRITER, &self.writer),
            (part::DATA_TYPE, &self.data_type),
            (part::USER_INFO1, &self.user_info1),
            (part::USER_INFO2, &self.user_info2),
        ] {
            if let Some(v) = value {
                msg.add_str(id, v);
            }
        }
    }

    fn decode(msg: &Message) -> Result<Self, DecodeError> {
        Ok(Self {
            writer: msg.str_part(part::WRITER)?,
            data_type: msg.str_part(part::DATA_TYPE)?,
            user_info1: msg.str_part(part::USER_INFO1)?,
            user_info2: msg.str_part(part::USER_INFO2)?,
        })
    }
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub kind: PublishKind,
    pub sequence: i32,
    pub url: String,
    pub file_name: Option<String>,
    pub file_info: FileInfo,
    pub data_time: Option<i64>,
    pub file_ext: Option<String>,
    pub payload: Option<Payload>,
    pub ldata: LdataFields,
}

impl PublishRequest {
    pub fn new(kind: PublishKind, sequence: i32, url: impl Into<String>) -> Self {
        Self {
            kind,
            sequence,
            url: url.into(),
            file_name: None,
            file_info: FileInfo::default(),
            data_time: None,
            file_ext: None,
            payload: None,
            ldata: LdataFields::default(),
        }
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(Category::Data, self.kind as i32, self.sequence);
        msg.add_str(part::URL, &self.url);
        if let Some(name) = &self.file_name {
            msg.add_str(part::FILE_NAME, name);
        }
        msg.add_part(part::FILE_INFO, self.file_info.encode());
        if let Some(t) = self.data_time {
            msg.add_i64(part::DATA_TIME, t);
        }
        if let Some(ext) = &self.file_ext {
            msg.add_str(part::FILE_EXT, ext);
        }
        if let Some(payload) = &self.payload {
            msg.add_part(part::PAYLOAD_INFO, payload.encode_info());
            msg.add_part(part::PAYLOAD, payload.data.clone());
        }
        self.ldata.encode_into(&mut msg);
        msg
    }

    /// Decode and validate the parts each kind requires.
    pub fn from_message(msg: &Message) -> Result<Self, RequestError> {
        if msg.category != Category::Data {
            return Err(RequestError::NotData(msg.category));
        }
        let kind = PublishKind::from_subtype(msg.subtype)
            .ok_or(RequestError::UnknownSubtype(msg.subtype))?;
        let missing = |part: &'static str| RequestError::MissingPart {
            kind: kind.name(),
            part,
        };

        let url = msg.str_part(part::URL)?.ok_or_else(|| missing("URL"))?;

        let file_info = match FileInfo::decode(msg)? {
            Some(info) => info,
            None if kind.is_enquire() => return Err(missing("FILE_INFO")),
            None => FileInfo::default(),
        };

        let data_time = msg.i64_part(part::DATA_TIME)?;
        if kind.is_by_time() && data_time.is_none() {
            return Err(missing("DATA_TIME"));
        }

        let payload = if kind.carries_payload() {
            Some(Payload::decode(msg, kind)?)
        } else {
            None
        };

        Ok(Self {
            kind,
            sequence: msg.sequence,
            url,
            file_name: msg.str_part(part::FILE_NAME)?,
            file_info,
            data_time,
            file_ext: msg.str_part(part::FILE_EXT)?,
            payload,
            ldata: LdataFields::decode(msg)?,
        })
    }
}

// =============================================================================
// Reply
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReply {
    pub kind: PublishKind,
    pub sequence: i32,
    pub error: ErrorCode,
    pub error_message: String,
    /// Set on enquiry replies only.
    pub do_put: Option<bool>,
}

impl PublishReply {
    pub fn ok(kind: PublishKind, sequence: i32) -> Self {
        Self {
            kind,
            sequence,
            error: ErrorCode::None,
            error_message: String::new(),
            do_put: None,
        }
    }

    pub fn enquired(kind: PublishKind, sequence: i32, do_put: bool) -> Self {
        Self {
            do_put: Some(do_put),
            ..Self::ok(kind, sequence)
        }
    }

    pub fn failed(
        kind: PublishKind,
        sequence: i32,
        error: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sequence,
            error,
            error_message: message.into(),
            do_put: if kind.is_enquire() { Some(false) } else { None },
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_ok()
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(Category::Data, self.kind as i32, self.sequence);
        put_status(&mut msg, self.error, &self.error_message);
        if let Some(do_put) = self.do_put {
            msg.add_u32(part::DO_PUT, u32::from(do_put));
        }
        msg
    }

    pub fn from_message(msg: &Message) -> Result<Self, RequestError> {
        if msg.category != Category::Data {
            return Err(RequestError::NotData(msg.category));
        }
        let kind = PublishKind::from_subtype(msg.subtype)
            .ok_or(RequestError::UnknownSubtype(msg.subtype))?;
        let (error, error_message) = read_status(msg)?;
        Ok(Self {
            kind,
            sequence: msg.sequence,
            error,
            error_message,
            do_put: msg.u32_part(part::DO_PUT)?.map(|v| v != 0),
        })
    }
}
