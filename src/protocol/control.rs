//! Control category: questions about the server itself.

use thiserror::Error;

use super::message::{Category, DecodeError, Message};
use super::reply::{put_status, read_status};
use super::{part, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlCommand {
    IsAlive = 1,
    GetClientCount = 2,
    Shutdown = 3,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown control command {0}")]
pub struct UnknownCommand(pub i32);

impl ControlCommand {
    pub fn from_subtype(subtype: i32) -> Result<Self, UnknownCommand> {
        match subtype {
            1 => Ok(Self::IsAlive),
            2 => Ok(Self::GetClientCount),
            3 => Ok(Self::Shutdown),
            other => Err(UnknownCommand(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::IsAlive => "IS_ALIVE",
            Self::GetClientCount => "GET_CLIENT_COUNT",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Control requests carry no parts.
    pub fn request(self, sequence: i32) -> Message {
        Message::new(Category::Control, self as i32, sequence)
    }
}

/// Reply to a control request. Fields not relevant to the command stay `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub subtype: i32,
    pub sequence: i32,
    pub error: ErrorCode,
    pub error_message: String,
    pub pid: Option<u32>,
    pub server_name: Option<String>,
    pub num_clients: Option<u32>,
}

impl ControlReply {
    fn ok(command: ControlCommand, sequence: i32) -> Self {
        Self {
            subtype: command as i32,
            sequence,
            error: ErrorCode::None,
            error_message: String::new(),
            pid: None,
            server_name: None,
            num_clients: None,
        }
    }

    pub fn alive(sequence: i32, pid: u32, server_name: impl Into<String>) -> Self {
        Self {
            pid: Some(pid),
            server_name: Some(server_name.into()),
            ..Self::ok(ControlCommand::IsAlive, sequence)
        }
    }

    pub fn client_count(sequence: i32, num_clients: u32) -> Self {
        Self {
            num_clients: Some(num_clients),
            ..Self::ok(ControlCommand::GetClientCount, sequence)
        }
    }

    pub fn shutdown_ack(sequence: i32) -> Self {
        Self::ok(ControlCommand::Shutdown, sequence)
    }

    pub fn unknown(unknown: UnknownCommand, sequence: i32) -> Self {
        Self {
            subtype: unknown.0,
            sequence,
            error: ErrorCode::UnknownCommand,
            error_message: unknown.to_string(),
            pid: None,
            server_name: None,
            num_clients: None,
        }
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(Category::Control, self.subtype, self.sequence);
        put_status(&mut msg, self.error, &self.error_message);
        if let Some(pid) = self.pid {
            msg.add_u32(part::PID, pid);
        }
        if let Some(name) = &self.server_name {
            msg.add_str(part::SERVER_NAME, name);
        }
        if let Some(n) = self.num_clients {
            msg.add_u32(part::NUM_CLIENTS, n);
        }
        msg
    }

    pub fn from_message(msg: &Message) -> Result<Self, DecodeError> {
        let (error, error_message) = read_status(msg)?;
        Ok(Self {
            subtype: msg.subtype,
            sequence: msg.sequence,
            error,
            error_message,
            pid: msg.u32_part(part::PID)?,
            server_name: msg.str_part(part::SERVER_NAME)?,
            num_clients: msg.u32_part(part::NUM_CLIENTS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_subtype() {
        assert_eq!(ControlCommand::from_subtype(1), Ok(ControlCommand::IsAlive));
        assert_eq!(
            ControlCommand::from_subtype(2),
            Ok(ControlCommand::GetClientCount)
        );
        assert_eq!(
            ControlCommand::from_subtype(3),
            Ok(ControlCommand::Shutdown)
        );
        assert_eq!(ControlCommand::from_subtype(42), Err(UnknownCommand(42)));
    }

    #[test]
    fn test_alive_reply_carries_identity() {
        let reply = ControlReply::alive(5, 1234, "publishd-5440");
        let decoded = Message::decode(reply.to_message().encode()).unwrap();
        let back = ControlReply::from_message(&decoded).unwrap();

        assert_eq!(back, reply);
        assert_eq!(back.pid, Some(1234));
        assert_eq!(back.num_clients, None);
    }

    #[test]
    fn test_unknown_reply_keeps_subtype() {
        let reply = ControlReply::unknown(UnknownCommand(99), 1);
        let msg = reply.to_message();
        assert_eq!(msg.subtype, 99);

        let back = ControlReply::from_message(&msg).unwrap();
        assert_eq!(back.error, ErrorCode::UnknownCommand);
        assert!(back.error_message.contains("99"));
    }
}
