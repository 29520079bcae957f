//! A single framed TCP connection.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use super::{TransportError, FRAME_HEADER_LEN, MAX_INTERRUPT_RETRIES};

/// How long `finish` keeps draining unread client bytes before closing.
const LINGER: Duration = Duration::from_millis(200);

/// One accepted (or dialed) socket. Owned by exactly one task.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    max_message_bytes: u32,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, max_message_bytes: u32) -> Self {
        Self {
            stream,
            peer,
            max_message_bytes,
        }
    }

    /// Dial a server.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        max_message_bytes: u32,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Io {
                op: "connect",
                source,
            })?;
        let peer = stream.peer_addr().map_err(|source| TransportError::Io {
            op: "connect",
            source,
        })?;
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream, peer, max_message_bytes))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read one whole frame and return its message bytes.
    pub async fn read_message(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        let max = self.max_message_bytes;
        let stream = &mut self.stream;
        with_timeout("read message", timeout, async move {
            let mut header = [0u8; FRAME_HEADER_LEN];
            read_full(stream, &mut header, "read frame length").await?;
            let len = u32::from_be_bytes(header);

            // Validate frame size before allocation
            if len > max {
                return Err(TransportError::FrameTooLarge { size: len, max });
            }

            let mut body = BytesMut::zeroed(len as usize);
            read_full(stream, &mut body, "read frame payload").await?;
            Ok(body.freeze())
        })
        .await
    }

    /// Write one whole frame.
    pub async fn write_message(
        &mut self,
        message: &Bytes,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let len = u32::try_from(message.len()).map_err(|_| TransportError::FrameTooLarge {
            size: u32::MAX,
            max: self.max_message_bytes,
        })?;
        if len > self.max_message_bytes {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_message_bytes,
            });
        }

        let stream = &mut self.stream;
        with_timeout("write message", timeout, async move {
            write_full(stream, &len.to_be_bytes(), "write frame length").await?;
            write_full(stream, message, "write frame payload").await?;
            stream.flush().await.map_err(|source| TransportError::Io {
                op: "flush",
                source,
            })
        })
        .await
    }

    /// Close the connection after the reply went out.
    ///
    /// Half-closes the write side, then drains whatever the client still
    /// has in flight for a short while so the kernel does not answer
    /// unread data with a reset that could swallow the reply.
    pub async fn finish(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(peer = %self.peer, error = %e, "Shutdown after reply failed");
            return;
        }
        let mut sink = [0u8; 8192];
        let drain = async {
            loop {
                match self.stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        let _ = tokio::time::timeout(LINGER, drain).await;
    }
}

async fn with_timeout<T, F>(
    op: &'static str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match timeout {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| TransportError::TimedOut { op, after })?,
        None => fut.await,
    }
}

async fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    op: &'static str,
) -> Result<(), TransportError> {
    let mut filled = 0;
    let mut interrupts = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => return Err(TransportError::Closed { op }),
            Ok(n) => filled += n,
            Err(e) if is_interrupt(&e) && interrupts < MAX_INTERRUPT_RETRIES => {
                interrupts += 1;
            }
            Err(source) => return Err(TransportError::Io { op, source }),
        }
    }
    Ok(())
}

fn is_interrupt(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}

async fn write_full(
    stream: &mut TcpStream,
    buf: &[u8],
    op: &'static str,
) -> Result<(), TransportError> {
    let mut written = 0;
    let mut interrupts = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]).await {
            Ok(0) => return Err(TransportError::Closed { op }),
            Ok(n) => written += n,
            Err(e) if is_interrupt(&e) && interrupts < MAX_INTERRUPT_RETRIES => {
                interrupts += 1;
            }
            Err(source) => return Err(TransportError::Io { op, source }),
        }
    }
    Ok(())
}
