//! Client side of the publish protocol.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    Category, ControlCommand, ControlReply, DecodeError, ErrorCode, ErrorReply, FileInfo,
    LdataFields, Message, PublishKind, PublishReply, PublishRequest, RequestError,
};
use crate::publish::codec::{encode_payload, Compression, PayloadError};
use crate::transport::{Connection, TransportError, DEFAULT_MAX_MESSAGE_BYTES};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Bad reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("Bad reply: {0}")]
    Reply(#[from] RequestError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("Server rejected request: {0}")]
    Rejected(ErrorReply),
}

impl ClientError {
    /// Error code sent by the server, if it answered at all.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected(reply) => Some(reply.code),
            _ => None,
        }
    }
}

/// Per-put options.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Unix seconds applied as the published file's mtime; 0 leaves it alone
    pub mod_time: i64,
    /// Used by enquiries; see [`FileInfo::NEVER_OVERWRITE`]
    pub overwrite_age: i32,
    pub compression: Compression,
    pub data_time: Option<i64>,
    pub file_ext: Option<String>,
    pub ldata: LdataFields,
}

/// What an enquire-then-put achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Published,
    /// The server kept its existing, recent enough file
    Skipped,
}

pub struct PublishClient {
    addr: String,
    timeout: Option<Duration>,
    max_message_bytes: u32,
    sequence: AtomicI32,
}

impl PublishClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Some(Duration::from_secs(30)),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            sequence: AtomicI32::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn connect(&self) -> Result<Connection, ClientError> {
        let conn = Connection::connect(self.addr.as_str(), self.max_message_bytes).await?;
        Ok(conn)
    }

    /// Send `msg` on `conn` and read one reply. Generic replies become errors.
    pub async fn round_trip(
        &self,
        conn: &mut Connection,
        msg: &Message,
    ) -> Result<Message, ClientError> {
        conn.write_message(&msg.encode(), self.timeout).await?;
        let reply = Message::decode(conn.read_message(self.timeout).await?)?;
        if reply.category == Category::Generic {
            return Err(ClientError::Rejected(ErrorReply::from_message(&reply)?));
        }
        Ok(reply)
    }

    async fn control(&self, command: ControlCommand) -> Result<ControlReply, ClientError> {
        let mut conn = self.connect().await?;
        let reply = self
            .round_trip(&mut conn, &command.request(self.next_sequence()))
            .await?;
        let reply = ControlReply::from_message(&reply)?;
        if !reply.error.is_ok() {
            return Err(ClientError::Rejected(ErrorReply::new(
                reply.error,
                reply.error_message,
            )));
        }
        Ok(reply)
    }

    pub async fn is_alive(&self) -> Result<ControlReply, ClientError> {
        self.control(ControlCommand::IsAlive).await
    }

    pub async fn client_count(&self) -> Result<u32, ClientError> {
        let reply = self.control(ControlCommand::GetClientCount).await?;
        Ok(reply.num_clients.unwrap_or(0))
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.control(ControlCommand::Shutdown).await.map(drop)
    }

    fn request(
        &self,
        kind: PublishKind,
        url: &str,
        file_name: Option<&str>,
        opts: &PutOptions,
    ) -> PublishRequest {
        let mut req = PublishRequest::new(kind, self.next_sequence(), url);
        req.file_name = file_name.map(str::to_owned);
        req.file_info = FileInfo {
            mod_time: opts.mod_time,
            overwrite_age: opts.overwrite_age,
        };
        req.data_time = opts.data_time;
        req.file_ext = opts.file_ext.clone();
        req.ldata = opts.ldata.clone();
        req
    }

    async fn publish_once(
        &self,
        conn: &mut Connection,
        req: &PublishRequest,
    ) -> Result<PublishReply, ClientError> {
        let reply = self.round_trip(conn, &req.to_message()).await?;
        let reply = PublishReply::from_message(&reply)?;
        if !reply.success() {
            return Err(ClientError::Rejected(ErrorReply::new(
                reply.error,
                reply.error_message,
            )));
        }
        Ok(reply)
    }

    /// Publish unconditionally.
    pub async fn put_forced(
        &self,
        url: &str,
        file_name: Option<&str>,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<(), ClientError> {
        let mut req = self.request(PublishKind::PutForced, url, file_name, opts);
        req.payload = Some(encode_payload(data, opts.compression)?);
        let mut conn = self.connect().await?;
        self.publish_once(&mut conn, &req).await?;
        conn.finish().await;
        Ok(())
    }

    /// Publish under a name derived from `opts.data_time`.
    pub async fn put_by_time(
        &self,
        url: &str,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<(), ClientError> {
        let mut req = self.request(PublishKind::PutByTime, url, None, opts);
        req.payload = Some(encode_payload(data, opts.compression)?);
        let mut conn = self.connect().await?;
        self.publish_once(&mut conn, &req).await?;
        conn.finish().await;
        Ok(())
    }

    /// Ask first, and send the data only if the server wants it.
    pub async fn enquire_and_put(
        &self,
        url: &str,
        file_name: Option<&str>,
        data: &[u8],
        opts: &PutOptions,
    ) -> Result<PutOutcome, ClientError> {
        let payload = encode_payload(data, opts.compression)?;
        let enquire_kind = if opts.data_time.is_some() && file_name.is_none() {
            PublishKind::EnquireByTime
        } else {
            PublishKind::EnquireForPut
        };

        let mut conn = self.connect().await?;
        let enquiry = self.request(enquire_kind, url, file_name, opts);
        let reply = self.publish_once(&mut conn, &enquiry).await?;
        if reply.do_put != Some(true) {
            conn.finish().await;
            return Ok(PutOutcome::Skipped);
        }

        let mut put = self.request(PublishKind::PutAfterEnquire, url, file_name, opts);
        put.payload = Some(payload);
        self.publish_once(&mut conn, &put).await?;
        conn.finish().await;
        Ok(PutOutcome::Published)
    }

    /// Send an enquiry and return the open connection without following up.
    pub async fn enquire(
        &self,
        url: &str,
        file_name: Option<&str>,
        opts: &PutOptions,
    ) -> Result<(Connection, bool), ClientError> {
        let mut conn = self.connect().await?;
        let enquiry = self.request(PublishKind::EnquireForPut, url, file_name, opts);
        let reply = self.publish_once(&mut conn, &enquiry).await?;
        Ok((conn, reply.do_put == Some(true)))
    }
}
