//! publishd - network publish server.
//!
//! Clients submit files addressed by a data URL. The server writes each one
//! atomically into its data tree, applies an overwrite-age policy, and
//! records the newest file per directory in a latest-data-info sidecar.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod publish;
pub mod server;
pub mod temp_file;
pub mod transport;

pub use client::{ClientError, PublishClient, PutOptions, PutOutcome};
pub use config::{ConfigError, ServerConfig};
pub use error::{Error, Result};
pub use server::{ExitReason, Server};
