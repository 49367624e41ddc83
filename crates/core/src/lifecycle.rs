//! Lifecycle & health (spec §4.12, §7): startup readiness, graceful drain
//! with in-flight tracking, and the process-health flag background panics
//! trip.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

/// Shared process lifecycle state, built once at startup and threaded
/// explicitly through request contexts rather than kept as an ambient global.
pub struct Lifecycle {
    shutdown_begun: AtomicBool,
    process_unhealthy_until_ms: AtomicI64,
    in_flight: AtomicUsize,
    ml_healthy: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub shutdown_begun: bool,
    pub ml_healthy: bool,
    pub process_health_cooldown_active: bool,
    pub in_flight_requests: usize,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            shutdown_begun: AtomicBool::new(false),
            process_unhealthy_until_ms: AtomicI64::new(0),
            in_flight: AtomicUsize::new(0),
            ml_healthy: AtomicBool::new(true),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin_shutdown(&self) {
        self.shutdown_begun.store(true, Ordering::SeqCst);
    }

    pub fn set_ml_healthy(&self, healthy: bool) {
        self.ml_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Trips the process-health flag for `cooldown`, called when a background
    /// task panics. `/readyz` reports 503 until the cooldown elapses.
    pub fn trip_process_health(&self, cooldown: Duration) {
        let until = crate::util::unix_timestamp_ms() as i64 + cooldown.as_millis() as i64;
        self.process_unhealthy_until_ms.store(until, Ordering::SeqCst);
    }

    fn process_health_cooldown_active(&self) -> bool {
        let until = self.process_unhealthy_until_ms.load(Ordering::SeqCst);
        until > crate::util::unix_timestamp_ms() as i64
    }

    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { lifecycle: self.clone() }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// `/readyz` per spec §8 invariant 10: 503 whenever shutdown has begun or
    /// ML is unhealthy, 200 otherwise.
    pub fn readiness(&self) -> ReadinessReport {
        let shutdown_begun = self.shutdown_begun.load(Ordering::SeqCst);
        let ml_healthy = self.ml_healthy.load(Ordering::SeqCst);
        let cooldown_active = self.process_health_cooldown_active();
        ReadinessReport {
            ready: !shutdown_begun && ml_healthy && !cooldown_active,
            shutdown_begun,
            ml_healthy,
            process_health_cooldown_active: cooldown_active,
            in_flight_requests: self.in_flight_count(),
        }
    }

    /// Waits for in-flight requests to drain, up to `deadline`.
    pub async fn drain(&self, deadline: Duration) {
        let start = std::time::Instant::now();
        while self.in_flight_count() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub struct InFlightGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_when_healthy_and_not_shutting_down() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.readiness().ready);
    }

    #[test]
    fn not_ready_once_shutdown_begins() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_shutdown();
        assert!(!lifecycle.readiness().ready);
    }

    #[test]
    fn not_ready_when_ml_unhealthy() {
        let lifecycle = Lifecycle::new();
        lifecycle.set_ml_healthy(false);
        assert!(!lifecycle.readiness().ready);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let lifecycle = Lifecycle::new();
        {
            let _guard = lifecycle.begin_request();
            assert_eq!(lifecycle.in_flight_count(), 1);
        }
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_returns_once_in_flight_hits_zero() {
        let lifecycle = Lifecycle::new();
        let guard = lifecycle.begin_request();
        let lc = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        lifecycle.drain(Duration::from_secs(1)).await;
        assert_eq!(lc.in_flight_count(), 0);
    }
}
