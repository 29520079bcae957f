//! Crate-level error type for the server lifecycle.
//!
//! Each layer keeps its own error enum (`TransportError`, `DecodeError`,
//! `RequestError`, `PublishError`, `ConfigError`); this one is what
//! `Server::run` and friends surface to the binary.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Listener gave up after {failures} consecutive accept failures: {source}")]
    AcceptFailed {
        failures: u32,
        #[source]
        source: TransportError,
    },

    #[error("Handler for {peer} failed in strict mode: {reason}")]
    UnitFailed { peer: SocketAddr, reason: String },

    #[error("Handler task panicked in strict mode: {0}")]
    UnitPanicked(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
