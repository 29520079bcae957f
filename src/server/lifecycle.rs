//! Listener-owned lifecycle state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read-only view of the active client count for handler tasks.
#[derive(Debug, Clone)]
pub struct ClientGauge(Arc<AtomicUsize>);

impl ClientGauge {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters mutated only by the listener task.
#[derive(Debug)]
pub struct Lifecycle {
    active: Arc<AtomicUsize>,
    last_action: Instant,
    shutdown_requested: bool,
    max_clients: Option<usize>,
    max_quiescent: Option<Duration>,
}

impl Lifecycle {
    pub fn new(max_clients: Option<usize>, max_quiescent: Option<Duration>) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            last_action: Instant::now(),
            shutdown_requested: false,
            max_clients,
            max_quiescent,
        }
    }

    pub fn gauge(&self) -> ClientGauge {
        ClientGauge(Arc::clone(&self.active))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_clients(&self) -> Option<usize> {
        self.max_clients
    }

    /// True if one more client would exceed the limit.
    pub fn at_capacity(&self) -> bool {
        self.max_clients.is_some_and(|max| self.active() >= max)
    }

    pub fn admit(&mut self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.last_action = Instant::now();
    }

    /// Account for one finished unit. Called exactly once per admit.
    pub fn reap(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "reaped more units than were admitted");
        self.last_action = Instant::now();
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// No clients, and idle for longer than the configured threshold.
    pub fn is_quiescent(&self, now: Instant) -> bool {
        match self.max_quiescent {
            Some(limit) => {
                self.active() == 0 && now.saturating_duration_since(self.last_action) > limit
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_and_reap_track_gauge() {
        let mut lc = Lifecycle::new(Some(2), None);
        let gauge = lc.gauge();

        lc.admit();
        lc.admit();
        assert_eq!(gauge.get(), 2);
        assert!(lc.at_capacity());

        lc.reap();
        assert_eq!(gauge.get(), 1);
        assert!(!lc.at_capacity());
    }

    #[test]
    fn test_unlimited_clients() {
        let mut lc = Lifecycle::new(None, None);
        for _ in 0..10_000 {
            lc.admit();
        }
        assert!(!lc.at_capacity());
    }

    #[test]
    fn test_quiescence_requires_idle_and_empty() {
        let mut lc = Lifecycle::new(None, Some(Duration::from_secs(5)));
        let start = Instant::now();

        assert!(!lc.is_quiescent(start));
        assert!(lc.is_quiescent(start + Duration::from_secs(6)));

        lc.admit();
        assert!(!lc.is_quiescent(Instant::now() + Duration::from_secs(60)));

        lc.reap();
        let reaped_at = Instant::now();
        assert!(!lc.is_quiescent(reaped_at + Duration::from_secs(4)));
        assert!(lc.is_quiescent(reaped_at + Duration::from_secs(6)));
    }

    #[test]
    fn test_quiescence_disabled() {
        let lc = Lifecycle::new(None, None);
        let tomorrow = Instant::now() + Duration::from_secs(86_400);
        assert!(!lc.is_quiescent(tomorrow));
    }

    #[test]
    fn test_shutdown_flag() {
        let mut lc = Lifecycle::new(None, None);
        assert!(!lc.shutdown_requested());
        lc.request_shutdown();
        assert!(lc.shutdown_requested());
    }
}
