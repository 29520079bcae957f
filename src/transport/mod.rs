//! Framed TCP transport.
//!
//! Frame format: len:u32 (big-endian) | message bytes.
//! One accepted socket is one [`Connection`]. Every operation takes an
//! explicit timeout; `None` blocks indefinitely.

mod connection;

pub use connection::Connection;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, ToSocketAddrs};

/// Default upper bound for a single frame (512MB)
pub const DEFAULT_MAX_MESSAGE_BYTES: u32 = 512 * 1024 * 1024;

/// Bound on `Interrupted` retries within one read or write
pub const MAX_INTERRUPT_RETRIES: usize = 16;

/// Frame length prefix size
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{op} timed out after {after:?}")]
    TimedOut { op: &'static str, after: Duration },

    #[error("{op}: connection closed by peer")]
    Closed { op: &'static str },

    #[error("Frame size {size} exceeds maximum allowed size {max}")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// The peer is gone; replying is pointless.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result of a bounded accept.
#[derive(Debug)]
pub enum Accepted {
    Connection(Connection),
    /// No client within the timeout; the caller gets control back.
    TimedOut,
}

/// Listening socket handing out framed connections.
pub struct Listener {
    inner: TcpListener,
    max_message_bytes: u32,
}

impl Listener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        max_message_bytes: u32,
    ) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Io {
                op: "bind",
                source,
            })?;
        Ok(Self {
            inner,
            max_message_bytes,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the next client.
    ///
    /// Cancel safe: used inside `tokio::select!` by the server loop.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Accepted, TransportError> {
        let accept = self.inner.accept();
        let result = match timeout {
            Some(after) => match tokio::time::timeout(after, accept).await {
                Ok(result) => result,
                Err(_) => return Ok(Accepted::TimedOut),
            },
            None => accept.await,
        };

        let (stream, peer) = result.map_err(|source| TransportError::Io {
            op: "accept",
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Accepted::Connection(Connection::new(
            stream,
            peer,
            self.max_message_bytes,
        )))
    }
}
