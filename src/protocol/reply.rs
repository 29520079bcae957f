//! Status parts shared by every reply, and the generic error reply.

use super::message::{Category, DecodeError, Message};
use super::{part, ErrorCode};

/// Append `ERR_CODE` and, if non-empty, `ERR_STRING` parts.
pub fn put_status(msg: &mut Message, code: ErrorCode, message: &str) {
    msg.add_u32(part::ERR_CODE, code as u32);
    if !message.is_empty() {
        msg.add_str(part::ERR_STRING, message);
    }
}

/// Read back the status of a reply.
///
/// A missing `ERR_CODE` means success. Unknown codes are reported as
/// `SERVER_ERROR` so that newer servers still read as failures.
pub fn read_status(msg: &Message) -> Result<(ErrorCode, String), DecodeError> {
    let code = match msg.u32_part(part::ERR_CODE)? {
        Some(raw) => ErrorCode::from_u32(raw).unwrap_or(ErrorCode::ServerError),
        None => ErrorCode::None,
    };
    let lines = msg
        .parts_of(part::ERR_STRING)
        .map(|p| p.as_str())
        .collect::<Result<Vec<_>, _>>()?;
    Ok((code, lines.join("\n")))
}

/// Reply for failures that happen before a request could be decoded,
/// or that apply to the connection rather than the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_message(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadMessage, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    pub fn service_denied(max_clients: usize) -> Self {
        Self::new(
            ErrorCode::ServiceDenied,
            format!("Too many clients, limit is {max_clients}"),
        )
    }

    pub fn to_message(&self, sequence: i32) -> Message {
        let mut msg = Message::new(Category::Generic, 0, sequence);
        put_status(&mut msg, self.code, &self.message);
        msg
    }

    pub fn from_message(msg: &Message) -> Result<Self, DecodeError> {
        let (code, message) = read_status(msg)?;
        Ok(Self { code, message })
    }
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code.name())
        } else {
            write!(f, "{}: {}", self.code.name(), self.message)
        }
    }
}
