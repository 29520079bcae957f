//! One connection, end to end.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

use super::lifecycle::ClientGauge;
use crate::protocol::{
    Category, ControlCommand, ControlReply, ErrorCode, ErrorReply, Header, Message,
    PublishRequest, RequestError,
};
use crate::publish::{PublishHandler, ServeError};
use crate::transport::{Connection, TransportError};

/// Write timeout for replies sent when a request could not be read.
const ERROR_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable context shared by every unit.
#[derive(Debug)]
pub struct UnitContext {
    pub publish: PublishHandler,
    pub gauge: ClientGauge,
    pub server_name: String,
    pub comm_timeout: Option<Duration>,
}

/// What a finished unit reports back to the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub peer: SocketAddr,
    pub shutdown_requested: bool,
    /// Set when the request could not be handled
    pub failed: Option<String>,
}

impl UnitOutcome {
    fn ok(peer: SocketAddr) -> Self {
        Self {
            peer,
            shutdown_requested: false,
            failed: None,
        }
    }

    fn failed(peer: SocketAddr, reason: impl Into<String>) -> Self {
        Self {
            failed: Some(reason.into()),
            ..Self::ok(peer)
        }
    }
}

/// Read one request, answer it and close the connection.
pub async fn serve_connection(ctx: &UnitContext, mut conn: Connection) -> UnitOutcome {
    let outcome = exchange(ctx, &mut conn).await;
    conn.finish().await;
    outcome
}

async fn exchange(ctx: &UnitContext, conn: &mut Connection) -> UnitOutcome {
    let peer = conn.peer();

    let raw = match conn.read_message(ctx.comm_timeout).await {
        Ok(raw) => raw,
        Err(e) if e.is_disconnect() => {
            tracing::debug!(peer = %peer, error = %e, "Client left before sending a request");
            return UnitOutcome::ok(peer);
        }
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Failed to read request");
            send_best_effort(conn, &ErrorReply::server_error(e.to_string()), 0).await;
            return UnitOutcome::failed(peer, e.to_string());
        }
    };

    // Echo the sequence whenever the fixed header itself is readable
    let sequence = Header::decode(&raw).map_or(0, |header| header.sequence);
    let msg = match Message::decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Undecodable request");
            let reply = ErrorReply::bad_message(e.to_string());
            send_best_effort(conn, &reply, sequence).await;
            return UnitOutcome::failed(peer, e.to_string());
        }
    };

    match msg.category {
        Category::Control => control(ctx, conn, &msg).await,
        Category::Data => data(ctx, conn, &msg).await,
        Category::Generic => {
            let reason = "Generic messages are replies, not requests";
            send_best_effort(conn, &ErrorReply::bad_message(reason), msg.sequence).await;
            UnitOutcome::failed(peer, reason)
        }
    }
}

async fn control(ctx: &UnitContext, conn: &mut Connection, msg: &Message) -> UnitOutcome {
    let peer = conn.peer();
    let (reply, mut outcome) = match ControlCommand::from_subtype(msg.subtype) {
        Ok(ControlCommand::IsAlive) => (
            ControlReply::alive(msg.sequence, std::process::id(), &ctx.server_name),
            UnitOutcome::ok(peer),
        ),
        Ok(ControlCommand::GetClientCount) => {
            let count = u32::try_from(ctx.gauge.get()).unwrap_or(u32::MAX);
            (
                ControlReply::client_count(msg.sequence, count),
                UnitOutcome::ok(peer),
            )
        }
        Ok(ControlCommand::Shutdown) => {
            tracing::info!(peer = %peer, "Shutdown requested");
            (
                ControlReply::shutdown_ack(msg.sequence),
                UnitOutcome::ok(peer),
            )
        }
        Err(unknown) => {
            tracing::warn!(peer = %peer, subtype = unknown.0, "Unknown control command");
            (
                ControlReply::unknown(unknown, msg.sequence),
                UnitOutcome::failed(peer, unknown.to_string()),
            )
        }
    };

    if let Err(e) = write(conn, &reply.to_message().encode(), ctx.comm_timeout).await {
        if outcome.failed.is_none() {
            outcome.failed = Some(e.to_string());
        }
    }
    // Shut down even if the acknowledgement was lost
    outcome.shutdown_requested = msg.subtype == ControlCommand::Shutdown as i32;
    outcome
}

async fn data(ctx: &UnitContext, conn: &mut Connection, msg: &Message) -> UnitOutcome {
    let peer = conn.peer();
    let request = match PublishRequest::from_message(msg) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Rejected data request");
            let code = match e {
                RequestError::UnknownSubtype(_) => ErrorCode::UnknownCommand,
                _ => ErrorCode::BadMessage,
            };
            send_best_effort(conn, &ErrorReply::new(code, e.to_string()), msg.sequence).await;
            return UnitOutcome::failed(peer, e.to_string());
        }
    };

    match ctx.publish.serve(conn, request).await {
        Ok(()) => UnitOutcome::ok(peer),
        Err(ServeError::Transport(e)) if e.is_disconnect() => {
            tracing::info!(peer = %peer, error = %e, "Client disconnected mid-exchange");
            UnitOutcome::failed(peer, e.to_string())
        }
        Err(e) => UnitOutcome::failed(peer, e.to_string()),
    }
}

async fn write(
    conn: &mut Connection,
    bytes: &Bytes,
    timeout: Option<Duration>,
) -> Result<(), TransportError> {
    let peer = conn.peer();
    conn.write_message(bytes, timeout).await.map_err(|e| {
        tracing::debug!(peer = %peer, error = %e, "Failed to send reply");
        e
    })
}

async fn send_best_effort(conn: &mut Connection, reply: &ErrorReply, sequence: i32) {
    let bytes = reply.to_message(sequence).encode();
    let _ = write(conn, &bytes, Some(ERROR_REPLY_TIMEOUT)).await;
}
