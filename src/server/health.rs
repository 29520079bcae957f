//! Process-health registration.
//!
//! The listener reports its status periodically. Where that goes is up to
//! the registry; the default one only logs.

use async_trait::async_trait;
use std::sync::Mutex;

#[async_trait]
pub trait HealthRegistry: Send + Sync {
    async fn register(&self, status: &str);
    async fn unregister(&self);
}

/// Logs status changes through `tracing`.
#[derive(Debug)]
pub struct LogRegistry {
    name: String,
    last: Mutex<Option<String>>,
}

impl LogRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HealthRegistry for LogRegistry {
    async fn register(&self, status: &str) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Heartbeats repeat every accept timeout; only log transitions
        if last.as_deref() == Some(status) {
            tracing::trace!(server = %self.name, status, "Heartbeat");
            return;
        }
        tracing::debug!(server = %self.name, status, "Health status");
        *last = Some(status.to_string());
    }

    async fn unregister(&self) {
        tracing::debug!(server = %self.name, "Unregistered");
    }
}

/// Records every call, for tests.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    events: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn events(&self) -> Vec<String> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, event: String) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[async_trait]
impl HealthRegistry for RecordingRegistry {
    async fn register(&self, status: &str) {
        self.push(status.to_string());
    }

    async fn unregister(&self) {
        self.push("unregister".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_registry() {
        let registry = RecordingRegistry::default();
        registry.register("Listening, port: 1").await;
        registry.unregister().await;
        assert_eq!(registry.events(), vec!["Listening, port: 1", "unregister"]);
    }

    #[tokio::test]
    async fn test_log_registry_tolerates_repeats() {
        let registry = LogRegistry::new("test");
        registry.register("Listening, port: 1").await;
        registry.register("Listening, port: 1").await;
        registry.unregister().await;
    }
}
