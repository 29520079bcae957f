//! File publish protocol.
//!
//! A data request either carries the file (`PUT_FORCED`, `PUT_BY_TIME`) or
//! asks first (`ENQUIRE_FOR_PUT`, `ENQUIRE_BY_TIME`). An approved enquiry
//! reserves the target with an empty file, replies, and then expects one
//! follow-up put on the same connection. Every publish is written to a
//! temp file and renamed into place, and then the directory's
//! latest-data-info record is replaced.

pub mod codec;
pub mod ldata;
pub mod target;
pub mod url;
pub mod writer;

pub use codec::{Compression, PayloadError};
pub use ldata::{LatestDataInfo, LdataError};
pub use target::{decide_put, PublishTarget};
pub use url::DataUrl;
pub use writer::Reservation;

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    ErrorCode, ErrorReply, Message, PublishKind, PublishReply, PublishRequest, RequestError,
};
use crate::transport::{Connection, TransportError};

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Invalid data URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Security check failed: {0}")]
    SecurityDenied(String),

    #[error("Server is read-only, publishing is disabled")]
    ReadOnly,

    #[error("Rejected file name '{name}': {reason}")]
    UnsafeName { name: String, reason: String },

    #[error("Cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create reservation {path}: {source}")]
    Reserve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Bad payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot set modification time on {path}: {source}")]
    SetMtime {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("published {published} but failed to write latest data info: {source}")]
    Sidecar {
        published: PathBuf,
        #[source]
        source: LdataError,
    },

    #[error("PUT_AFTER_ENQUIRE must follow an approved enquiry on the same connection")]
    StandalonePut,

    #[error("{got} cannot follow {enquiry}")]
    UnexpectedFollowUp {
        enquiry: &'static str,
        got: &'static str,
    },

    #[error("Undecodable follow-up put: {0}")]
    BadFollowUp(#[source] RequestError),

    #[error("{0} request carries no payload")]
    MissingPayload(&'static str),

    #[error("Enquiry {0} needs a connection to receive the follow-up")]
    NeedsConnection(&'static str),

    #[error("Publish task failed: {0}")]
    Task(String),
}

impl PublishError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SecurityDenied(_) | Self::ReadOnly => ErrorCode::SecurityDenied,
            Self::StandalonePut
            | Self::UnexpectedFollowUp { .. }
            | Self::BadFollowUp(_)
            | Self::MissingPayload(_)
            | Self::NeedsConnection(_) => ErrorCode::BadMessage,
            Self::Task(_) => ErrorCode::ServerError,
            _ => ErrorCode::PublishFailed,
        }
    }
}

/// Why a data exchange did not end in success.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Already reported to the client.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

// =============================================================================
// Handler
// =============================================================================

/// Immutable per-server settings for data requests.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub data_dir: PathBuf,
    pub tmp_dir: Option<PathBuf>,
    pub secure: bool,
    pub read_only: bool,
    /// Writer recorded in the sidecar when the request names none
    pub writer: String,
    pub ldata_no_write: bool,
    pub comm_timeout: Option<Duration>,
    pub max_payload_bytes: u64,
}

impl PublishSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            tmp_dir: None,
            secure: false,
            read_only: false,
            writer: "publishd".to_string(),
            ldata_no_write: false,
            comm_timeout: Some(Duration::from_secs(30)),
            max_payload_bytes: codec::DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Outcome of an enquiry. Holds the reservation while the upload is pending.
#[derive(Debug)]
pub struct Enquiry {
    pub target: PublishTarget,
    pub do_put: bool,
    pub reservation: Option<Reservation>,
}

#[derive(Debug, Clone)]
pub struct PublishHandler {
    settings: PublishSettings,
}

impl PublishHandler {
    pub fn new(settings: PublishSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Run one data exchange on `conn`, starting from its decoded first request.
    pub async fn serve(
        &self,
        conn: &mut Connection,
        request: PublishRequest,
    ) -> Result<(), ServeError> {
        let timeout = self.settings.comm_timeout;

        if !request.kind.is_enquire() {
            let result = self.handle(&request).await;
            let reply = reply_for(request.kind, request.sequence, &result);
            conn.write_message(&reply.to_message().encode(), timeout)
                .await?;
            return result.map(drop).map_err(ServeError::from);
        }

        let enquiry = match self.enquire(&request).await {
            Ok(enquiry) => enquiry,
            Err(e) => {
                log_failure(&request, &e);
                let reply =
                    PublishReply::failed(request.kind, request.sequence, e.code(), e.to_string());
                conn.write_message(&reply.to_message().encode(), timeout)
                    .await?;
                return Err(e.into());
            }
        };

        let reply = PublishReply::enquired(request.kind, request.sequence, enquiry.do_put);
        conn.write_message(&reply.to_message().encode(), timeout)
            .await?;
        let Some(reservation) = enquiry.reservation else {
            tracing::debug!(
                path = %enquiry.target.target_path.display(),
                "Enquiry declined, existing file is recent"
            );
            return Ok(());
        };

        // A read failure drops the reservation, which removes the empty file
        let raw = conn.read_message(timeout).await?;
        let follow_up = match Message::decode(raw)
            .map_err(RequestError::from)
            .and_then(|msg| PublishRequest::from_message(&msg))
        {
            Ok(follow_up) => follow_up,
            Err(e) => {
                let e = PublishError::BadFollowUp(e);
                let reply = ErrorReply::bad_message(e.to_string());
                conn.write_message(&reply.to_message(request.sequence).encode(), timeout)
                    .await?;
                return Err(e.into());
            }
        };

        let result = match check_follow_up(request.kind, follow_up.kind) {
            Ok(()) => {
                let merged = merge_follow_up(&request, follow_up.clone());
                self.publish(&enquiry.target, &merged, Some(reservation))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log_failure(&follow_up, e);
        }
        let reply = reply_for(follow_up.kind, follow_up.sequence, &result);
        conn.write_message(&reply.to_message().encode(), timeout)
            .await?;
        result.map(drop).map_err(ServeError::from)
    }

    /// Handle a request that needs no follow-up.
    pub async fn handle(&self, request: &PublishRequest) -> Result<PathBuf, PublishError> {
        let result = match request.kind {
            PublishKind::PutForced | PublishKind::PutByTime => {
                match target::resolve(request, &self.settings) {
                    Ok(target) => self.publish(&target, request, None).await,
                    Err(e) => Err(e),
                }
            }
            PublishKind::PutAfterEnquire => Err(PublishError::StandalonePut),
            PublishKind::EnquireForPut | PublishKind::EnquireByTime => {
                Err(PublishError::NeedsConnection(request.kind.name()))
            }
        };
        if let Err(e) = &result {
            log_failure(request, e);
        }
        result
    }

    /// Decide whether the client should send the file, reserving the target if so.
    pub async fn enquire(&self, request: &PublishRequest) -> Result<Enquiry, PublishError> {
        let target = target::resolve(request, &self.settings)?;
        let do_put = target::decide(&target, &request.file_info, now()).await?;

        let reservation = if do_put {
            target::ensure_dir(&target.target_dir).await?;
            Some(Reservation::create(&target.target_path)?)
        } else {
            None
        };
        tracing::debug!(
            kind = request.kind.name(),
            path = %target.target_path.display(),
            do_put,
            "Enquiry decided"
        );

        Ok(Enquiry {
            target,
            do_put,
            reservation,
        })
    }

    /// Write the request's payload to `target` and update the sidecar.
    ///
    /// A reservation is released once the real file has replaced it.
    pub async fn publish(
        &self,
        target: &PublishTarget,
        request: &PublishRequest,
        reservation: Option<Reservation>,
    ) -> Result<PathBuf, PublishError> {
        let payload = request
            .payload
            .clone()
            .ok_or(PublishError::MissingPayload(request.kind.name()))?;
        target::ensure_dir(&target.target_dir).await?;

        let target_path = target.target_path.clone();
        let tmp_dir = self.settings.tmp_dir.clone();
        let mod_time = request.file_info.mod_time;
        let max_payload = self.settings.max_payload_bytes;
        let written = tokio::task::spawn_blocking(move || -> Result<u64, PublishError> {
            let data = codec::decode_payload(&payload, max_payload)?;
            writer::write_atomic(&target_path, &data, mod_time, tmp_dir.as_deref())?;
            Ok(data.len() as u64)
        })
        .await
        .map_err(|e| PublishError::Task(e.to_string()))??;

        if let Some(reservation) = reservation {
            reservation.release();
        }

        if !self.settings.ldata_no_write {
            let info = self.ldata_record(target, request);
            let ldata_dir = target.ldata_dir.clone();
            tokio::task::spawn_blocking(move || info.write(&ldata_dir))
                .await
                .map_err(|e| PublishError::Task(e.to_string()))?
                .map_err(|source| PublishError::Sidecar {
                    published: target.target_path.clone(),
                    source,
                })?;
        }

        tracing::info!(
            kind = request.kind.name(),
            path = %target.target_path.display(),
            bytes = written,
            "Published"
        );
        Ok(target.target_path.clone())
    }

    fn ldata_record(&self, target: &PublishTarget, request: &PublishRequest) -> LatestDataInfo {
        let mod_time = request.file_info.mod_time;
        let latest_time = request
            .data_time
            .or((mod_time > 0).then_some(mod_time))
            .unwrap_or_else(now);
        let ldata = &request.ldata;
        LatestDataInfo {
            latest_time,
            rel_data_path: target.rel_path.clone(),
            file_ext: target.file_ext.clone(),
            data_type: ldata
                .data_type
                .clone()
                .unwrap_or_else(|| ldata::guess_data_type(&target.file_ext)),
            user_info1: ldata.user_info1.clone().unwrap_or_default(),
            user_info2: ldata.user_info2.clone().unwrap_or_default(),
            writer: ldata
                .writer
                .clone()
                .unwrap_or_else(|| self.settings.writer.clone()),
            max_time: 0,
            prev_mod_time: 0,
        }
    }
}

fn check_follow_up(enquiry: PublishKind, got: PublishKind) -> Result<(), PublishError> {
    match (enquiry, got) {
        (_, PublishKind::PutAfterEnquire)
        | (PublishKind::EnquireByTime, PublishKind::PutByTime) => Ok(()),
        _ => Err(PublishError::UnexpectedFollowUp {
            enquiry: enquiry.name(),
            got: got.name(),
        }),
    }
}

/// The follow-up's values win; the enquiry fills in what it left out.
fn merge_follow_up(enquiry: &PublishRequest, mut follow_up: PublishRequest) -> PublishRequest {
    if follow_up.file_info.mod_time == 0 {
        follow_up.file_info.mod_time = enquiry.file_info.mod_time;
    }
    follow_up.data_time = follow_up.data_time.or(enquiry.data_time);
    follow_up.ldata = follow_up.ldata.merged_over(&enquiry.ldata);
    follow_up
}

fn reply_for(
    kind: PublishKind,
    sequence: i32,
    result: &Result<PathBuf, PublishError>,
) -> PublishReply {
    match result {
        Ok(_) => PublishReply::ok(kind, sequence),
        Err(e) => PublishReply::failed(kind, sequence, e.code(), e.to_string()),
    }
}

fn log_failure(request: &PublishRequest, e: &PublishError) {
    let kind = request.kind.name();
    match e.code() {
        ErrorCode::SecurityDenied => {
            tracing::warn!(kind, url = %request.url, error = %e, "Denied")
        }
        _ => tracing::warn!(kind, url = %request.url, error = %e, "Publish failed"),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileInfo, Payload};
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::TempDir;

    fn handler(root: &Path) -> PublishHandler {
        let mut settings = PublishSettings::new(root);
        settings.writer = "test-writer".to_string();
        PublishHandler::new(settings)
    }

    fn forced(name: &str, body: &'static [u8]) -> PublishRequest {
        let mut req = PublishRequest::new(PublishKind::PutForced, 1, "mdvp:://localhost::obs");
        req.file_name = Some(name.to_string());
        req.payload = Some(Payload::raw(Bytes::from_static(body)));
        req
    }

    #[tokio::test]
    async fn test_forced_put_writes_file_and_sidecar() {
        let tmp = TempDir::new().unwrap();
        let path = handler(tmp.path())
            .handle(&forced("20240101/a.mdv", b"ABC"))
            .await
            .unwrap();

        assert_eq!(path, tmp.path().join("obs/20240101/a.mdv"));
        assert_eq!(std::fs::read(&path).unwrap(), b"ABC");

        let obs = tmp.path().join("obs");
        let info = LatestDataInfo::read(&obs).unwrap().unwrap();
        assert_eq!(info.rel_data_path, "20240101/a.mdv");
        assert_eq!(info.file_ext, "mdv");
        assert_eq!(info.data_type, "mdv");
        assert_eq!(info.writer, "test-writer");
    }

    #[tokio::test]
    async fn test_ldata_no_write_skips_sidecar() {
        let tmp = TempDir::new().unwrap();
        let mut settings = PublishSettings::new(tmp.path());
        settings.ldata_no_write = true;
        PublishHandler::new(settings)
            .handle(&forced("a.txt", b"x"))
            .await
            .unwrap();

        let obs = tmp.path().join("obs");
        assert!(LatestDataInfo::read(&obs).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sidecar_time_prefers_data_time_then_mod_time() {
        let tmp = TempDir::new().unwrap();
        let h = handler(tmp.path());

        let mut req = forced("a.dat", b"x");
        req.file_info.mod_time = 1_600_000_000;
        h.handle(&req).await.unwrap();
        let obs = tmp.path().join("obs");
        let info = LatestDataInfo::read(&obs).unwrap().unwrap();
        assert_eq!(info.latest_time, 1_600_000_000);

        req.data_time = Some(1_650_000_000);
        h.handle(&req).await.unwrap();
        let info = LatestDataInfo::read(&obs).unwrap().unwrap();
        assert_eq!(info.latest_time, 1_650_000_000);
    }

    #[tokio::test]
    async fn test_standalone_put_after_enquire_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut req = forced("a.dat", b"x");
        req.kind = PublishKind::PutAfterEnquire;

        let err = handler(tmp.path()).handle(&req).await.unwrap_err();
        assert!(matches!(err, PublishError::StandalonePut));
        assert_eq!(err.code(), ErrorCode::BadMessage);
        assert!(!tmp.path().join("obs/a.dat").exists());
    }

    #[tokio::test]
    async fn test_read_only_denies_before_fs_work() {
        let tmp = TempDir::new().unwrap();
        let mut settings = PublishSettings::new(tmp.path());
        settings.read_only = true;

        let err = PublishHandler::new(settings)
            .handle(&forced("a.dat", b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SecurityDenied);
        assert!(!tmp.path().join("obs").exists());
    }

    #[tokio::test]
    async fn test_unsafe_file_name_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = handler(tmp.path())
            .handle(&forced("../escape.dat", b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::UnsafeName { .. }));
    }

    #[tokio::test]
    async fn test_enquire_reserves_absent_target() {
        let tmp = TempDir::new().unwrap();
        let mut req = PublishRequest::new(PublishKind::EnquireForPut, 1, "mdvp:://h::obs");
        req.file_name = Some("new.dat".to_string());
        req.file_info = FileInfo {
            mod_time: 0,
            overwrite_age: 60,
        };

        let enquiry = handler(tmp.path()).enquire(&req).await.unwrap();
        assert!(enquiry.do_put);
        let reserved = tmp.path().join("obs/new.dat");
        assert_eq!(std::fs::metadata(&reserved).unwrap().len(), 0);

        drop(enquiry);
        assert!(!reserved.exists());
    }

    #[tokio::test]
    async fn test_empty_payload_publish_survives_reservation() {
        let tmp = TempDir::new().unwrap();
        let h = handler(tmp.path());
        let mut enquire = PublishRequest::new(PublishKind::EnquireForPut, 1, "mdvp:://h::obs");
        enquire.file_name = Some("empty.dat".to_string());
        enquire.file_info.overwrite_age = 0;

        let enquiry = h.enquire(&enquire).await.unwrap();
        let mut put = forced("empty.dat", b"");
        put.kind = PublishKind::PutAfterEnquire;
        h.publish(&enquiry.target, &put, enquiry.reservation)
            .await
            .unwrap();

        assert!(tmp.path().join("obs/empty.dat").exists());
    }

    #[tokio::test]
    async fn test_sidecar_failure_message() {
        let tmp = TempDir::new().unwrap();
        // A directory where the sidecar file should go
        let obs = tmp.path().join("obs");
        std::fs::create_dir_all(obs.join(ldata::LDATA_FILE_NAME).join("blocker")).unwrap();

        let err = handler(tmp.path())
            .handle(&forced("a.dat", b"x"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("published "));
        assert!(message.contains("but failed to write latest data info"));
        assert_eq!(std::fs::read(obs.join("a.dat")).unwrap(), b"x");
    }

    #[test]
    fn test_follow_up_rules() {
        use PublishKind::*;
        assert!(check_follow_up(EnquireForPut, PutAfterEnquire).is_ok());
        assert!(check_follow_up(EnquireByTime, PutAfterEnquire).is_ok());
        assert!(check_follow_up(EnquireByTime, PutByTime).is_ok());
        assert!(check_follow_up(EnquireForPut, PutByTime).is_err());
        assert!(check_follow_up(EnquireForPut, PutForced).is_err());
    }

    #[test]
    fn test_merge_follow_up() {
        let mut enquiry = PublishRequest::new(PublishKind::EnquireForPut, 1, "u://h::d");
        enquiry.file_info.mod_time = 500;
        enquiry.ldata.writer = Some("enquirer".to_string());
        enquiry.data_time = Some(42);

        let follow_up = PublishRequest::new(PublishKind::PutAfterEnquire, 2, "u://h::d");
        let merged = merge_follow_up(&enquiry, follow_up);
        assert_eq!(merged.file_info.mod_time, 500);
        assert_eq!(merged.data_time, Some(42));
        assert_eq!(merged.ldata.writer.as_deref(), Some("enquirer"));
        assert_eq!(merged.sequence, 2);
    }
}
