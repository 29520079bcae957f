//! Accept loop and connection lifecycle.
//!
//! The listener task owns all lifecycle state. Each admitted connection
//! runs in its own task; the listener reaps finished tasks from a
//! `JoinSet`, which is the only place the active count goes down.

pub mod dispatch;
pub mod health;
pub mod lifecycle;

pub use dispatch::{UnitContext, UnitOutcome};
pub use health::{HealthRegistry, LogRegistry, RecordingRegistry};
pub use lifecycle::{ClientGauge, Lifecycle};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::ErrorReply;
use crate::publish::PublishHandler;
use crate::transport::{Accepted, Connection, Listener};

/// Bound on a single health registry call.
const HEALTH_TIMEOUT: Duration = Duration::from_millis(500);

/// Write timeout for the admission denial.
const DENY_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive accept errors tolerated before the listener gives up.
const MAX_ACCEPT_FAILURES: u32 = 32;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Why [`Server::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No clients for longer than the quiescence limit
    Quiescent,
    /// A client sent SHUTDOWN, or the caller's shutdown signal fired
    Shutdown,
}

pub struct Server {
    listener: Listener,
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
    ctx: Arc<UnitContext>,
    registry: Arc<dyn HealthRegistry>,
    accept_timeout: Duration,
    no_threads: bool,
    strict: bool,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let registry = Arc::new(LogRegistry::new(config.server_name()));
        Self::with_registry(config, registry).await
    }

    pub async fn with_registry(
        config: &ServerConfig,
        registry: Arc<dyn HealthRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = Listener::bind(config.bind_addr(), config.max_message_bytes).await?;
        let local_addr = listener.local_addr()?;

        let lifecycle = Lifecycle::new(config.max_clients(), config.max_quiescent());
        let ctx = Arc::new(UnitContext {
            publish: PublishHandler::new(config.publish_settings()),
            gauge: lifecycle.gauge(),
            server_name: config.server_name(),
            comm_timeout: config.comm_timeout(),
        });

        tracing::info!(
            addr = %local_addr,
            data_dir = %config.data_dir.display(),
            max_clients = ?config.max_clients(),
            max_quiescent = ?config.max_quiescent(),
            "Listening"
        );

        Ok(Self {
            listener,
            local_addr,
            lifecycle,
            ctx,
            registry,
            accept_timeout: config.accept_timeout(),
            no_threads: config.no_threads,
            strict: config.strict,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_gauge(&self) -> ClientGauge {
        self.lifecycle.gauge()
    }

    /// Serve until a client asks for shutdown or the server goes quiescent.
    pub async fn run(self) -> Result<ExitReason> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), also stopping when `shutdown` completes.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<ExitReason> {
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        tokio::pin!(shutdown);

        let result = self.serve(&mut units, shutdown).await;

        if !units.is_empty() {
            tracing::info!(in_flight = units.len(), "Waiting for in-flight clients");
        }
        while let Some(joined) = units.join_next().await {
            if let Err(e) = self.reap(joined) {
                tracing::error!(error = %e, "Client handler failed during drain");
            }
        }

        self.health(|r| async move { r.unregister().await }).await;
        match &result {
            Ok(reason) => tracing::info!(reason = ?reason, "Server exiting"),
            Err(e) => tracing::error!(error = %e, "Server exiting with error"),
        }
        result
    }

    async fn serve(
        &mut self,
        units: &mut JoinSet<UnitOutcome>,
        mut shutdown: std::pin::Pin<&mut impl Future<Output = ()>>,
    ) -> Result<ExitReason> {
        let mut accept_failures = 0u32;
        let port = self.local_addr.port();

        loop {
            if self.lifecycle.shutdown_requested() {
                return Ok(ExitReason::Shutdown);
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(ExitReason::Shutdown);
                }
                Some(joined) = units.join_next(), if !units.is_empty() => {
                    self.reap(joined)?;
                    if self.lifecycle.is_quiescent(Instant::now()) {
                        return Ok(ExitReason::Quiescent);
                    }
                }
                accepted = self.listener.accept(Some(self.accept_timeout)) => match accepted {
                    Ok(Accepted::TimedOut) => {
                        accept_failures = 0;
                        let status = format!("Listening, port: {port}");
                        self.health(|r| async move { r.register(&status).await })
                            .await;
                        if self.lifecycle.is_quiescent(Instant::now()) {
                            tracing::info!("No clients for too long, exiting");
                            return Ok(ExitReason::Quiescent);
                        }
                    }
                    Ok(Accepted::Connection(conn)) => {
                        accept_failures = 0;
                        self.admit(units, conn).await?;
                    }
                    Err(e) => {
                        accept_failures += 1;
                        tracing::warn!(error = %e, failures = accept_failures, "Accept failed");
                        if accept_failures >= MAX_ACCEPT_FAILURES {
                            return Err(Error::AcceptFailed {
                                failures: accept_failures,
                                source: e,
                            });
                        }
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    async fn admit(&mut self, units: &mut JoinSet<UnitOutcome>, conn: Connection) -> Result<()> {
        let peer = conn.peer();
        if self.lifecycle.at_capacity() {
            let max = self.lifecycle.max_clients().unwrap_or_default();
            tracing::warn!(
                peer = %peer,
                active = self.lifecycle.active(),
                max,
                "Denying client"
            );
            // Detached and uncounted; the listener never waits on a denied peer
            tokio::spawn(deny(conn, max));
            return Ok(());
        }

        self.lifecycle.admit();
        tracing::debug!(peer = %peer, active = self.lifecycle.active(), "Admitted client");
        let status = format!("Received a client, port: {}", self.local_addr.port());
        self.health(|r| async move { r.register(&status).await })
            .await;

        let ctx = Arc::clone(&self.ctx);
        if self.no_threads {
            let outcome = dispatch::serve_connection(&ctx, conn).await;
            self.reap(Ok(outcome))
        } else {
            units.spawn(async move { dispatch::serve_connection(&ctx, conn).await });
            Ok(())
        }
    }

    /// Account for one finished unit. Errors only in strict mode.
    fn reap(&mut self, joined: std::result::Result<UnitOutcome, JoinError>) -> Result<()> {
        self.lifecycle.reap();
        match joined {
            Ok(outcome) => {
                if outcome.shutdown_requested {
                    self.lifecycle.request_shutdown();
                }
                match outcome.failed {
                    Some(reason) if self.strict => Err(Error::UnitFailed {
                        peer: outcome.peer,
                        reason,
                    }),
                    Some(reason) => {
                        tracing::debug!(
                            peer = %outcome.peer,
                            reason = %reason,
                            "Client exchange failed"
                        );
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    "handler panicked".to_string()
                } else {
                    e.to_string()
                };
                tracing::error!(error = %e, "Client handler did not finish");
                if self.strict {
                    Err(Error::UnitPanicked(reason))
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn health<F, Fut>(&self, call: F)
    where
        F: FnOnce(Arc<dyn HealthRegistry>) -> Fut,
        Fut: Future<Output = ()>,
    {
        let registry = Arc::clone(&self.registry);
        if tokio::time::timeout(HEALTH_TIMEOUT, call(registry))
            .await
            .is_err()
        {
            tracing::debug!("Health registry call timed out");
        }
    }
}

async fn deny(mut conn: Connection, max_clients: usize) {
    let reply = ErrorReply::service_denied(max_clients);
    if let Err(e) = conn
        .write_message(&reply.to_message(0).encode(), Some(DENY_TIMEOUT))
        .await
    {
        tracing::debug!(peer = %conn.peer(), error = %e, "Failed to send denial");
    }
    conn.finish().await;
}
