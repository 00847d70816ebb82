//! Per-partition circuit breaker for upstream failure isolation.
//!
//! One circuit per partition key (the two-letter state prefix of an ORI),
//! created lazily on first failure. State machine:
//!
//! ```text
//!                 failure_threshold consecutive failures
//!      CLOSED ───────────────────────────────────────────▶ OPEN
//!        ▲                                                  │
//!        │ half_open_success_threshold                      │ first availability
//!        │ consecutive successes                            │ read after cooldown
//!        │                                                  ▼
//!        └────────────────────────────────────────────  HALF_OPEN
//!                         (one failure while half-open reopens
//!                          with a fresh cooldown)
//! ```
//!
//! The OPEN to HALF_OPEN transition is lazy: it happens on the first
//! `is_available` call after the cooldown expires, not on a timer.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use blotter_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Circuit breaker tuning, shared by all partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip CLOSED to OPEN.
    pub failure_threshold: u32,
    /// How long an open circuit blocks requests before probing.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(3600),
            half_open_success_threshold: 2,
        }
    }
}

/// Current state of one partition's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Partition unhealthy, requests blocked until cooldown expires.
    Open,
    /// Probing recovery after cooldown.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Internal per-partition breaker state.
#[derive(Debug, Clone)]
struct CircuitStatus {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl CircuitStatus {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_at: None,
            cooldown_until: None,
        }
    }
}

/// Externally visible view of one partition's circuit, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Time remaining until an open circuit starts probing, if open.
    pub cooldown_remaining: Option<Duration>,
}

/// Thread-safe circuit breaker keyed by partition.
///
/// All mutation is serialized through one async lock; call volume is
/// bounded by the rate limiter upstream of it, so contention stays low.
/// Each process owns its own breaker state; there is no cross-process
/// sharing.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, CircuitStatus>>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration and clock.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, circuits: Mutex::new(HashMap::new()) }
    }

    /// Whether requests to `partition` may proceed.
    ///
    /// Reading availability on an open circuit whose cooldown has expired
    /// flips it to half-open and resets the half-open success counter.
    pub async fn is_available(&self, partition: &str) -> bool {
        let mut circuits = self.circuits.lock().await;
        let Some(status) = circuits.get_mut(partition) else {
            // No entry means no failure was ever recorded.
            return true;
        };

        if status.state == CircuitState::Open {
            let expired = status.cooldown_until.is_some_and(|until| self.clock.now() >= until);
            if expired {
                tracing::info!(partition, "circuit cooldown expired, probing half-open");
                status.state = CircuitState::HalfOpen;
                status.half_open_successes = 0;
            }
        }

        status.state != CircuitState::Open
    }

    /// Records a successful call for `partition`.
    pub async fn record_success(&self, partition: &str) {
        let mut circuits = self.circuits.lock().await;
        let Some(status) = circuits.get_mut(partition) else {
            return;
        };

        match status.state {
            CircuitState::Closed => {
                status.consecutive_failures = 0;
            },
            CircuitState::HalfOpen => {
                status.half_open_successes += 1;
                if status.half_open_successes >= self.config.half_open_success_threshold {
                    tracing::info!(partition, "circuit closing, partition recovered");
                    *status = CircuitStatus::new();
                }
            },
            CircuitState::Open => {
                tracing::warn!(partition, "success recorded for open circuit");
            },
        }
    }

    /// Records a failed call for `partition`.
    ///
    /// Returns `true` when this call tripped the breaker open (from either
    /// closed or half-open), for alerting.
    pub async fn record_failure(&self, partition: &str) -> bool {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock().await;
        let status = circuits.entry(partition.to_string()).or_insert_with(CircuitStatus::new);

        status.consecutive_failures += 1;
        status.half_open_successes = 0;
        status.last_failure_at = Some(now);

        match status.state {
            CircuitState::Closed => {
                if status.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        partition,
                        failures = status.consecutive_failures,
                        "circuit opening"
                    );
                    status.state = CircuitState::Open;
                    status.cooldown_until = Some(now + self.config.cooldown);
                    return true;
                }
                false
            },
            CircuitState::HalfOpen => {
                tracing::warn!(partition, "half-open probe failed, circuit reopening");
                status.state = CircuitState::Open;
                status.cooldown_until = Some(now + self.config.cooldown);
                true
            },
            CircuitState::Open => false,
        }
    }

    /// Snapshot of every currently open circuit, for dashboards.
    pub async fn all_open(&self) -> HashMap<String, CircuitSnapshot> {
        let now = self.clock.now();
        let circuits = self.circuits.lock().await;

        circuits
            .iter()
            .filter(|(_, status)| status.state == CircuitState::Open)
            .map(|(partition, status)| (partition.clone(), snapshot(status, now)))
            .collect()
    }

    /// Snapshot of one partition's circuit, if it has ever failed.
    pub async fn status(&self, partition: &str) -> Option<CircuitSnapshot> {
        let now = self.clock.now();
        let circuits = self.circuits.lock().await;
        circuits.get(partition).map(|status| snapshot(status, now))
    }

    /// Manual override: clears all state for a partition.
    pub async fn reset(&self, partition: &str) {
        let mut circuits = self.circuits.lock().await;
        if circuits.remove(partition).is_some() {
            tracing::info!(partition, "circuit manually reset");
        }
    }
}

fn snapshot(status: &CircuitStatus, now: Instant) -> CircuitSnapshot {
    CircuitSnapshot {
        state: status.state,
        consecutive_failures: status.consecutive_failures,
        cooldown_remaining: status
            .cooldown_until
            .filter(|_| status.state == CircuitState::Open)
            .map(|until| until.saturating_duration_since(now)),
    }
}

#[cfg(test)]
mod tests {
    use blotter_core::TestClock;

    use super::*;

    fn breaker() -> (CircuitBreaker, TestClock) {
        let clock = TestClock::new();
        let breaker = CircuitBreaker::new(CircuitConfig::default(), Arc::new(clock.clone()));
        (breaker, clock)
    }

    #[tokio::test]
    async fn unknown_partition_is_available() {
        let (breaker, _clock) = breaker();
        assert!(breaker.is_available("CA").await);
        assert!(breaker.status("CA").await.is_none());
    }

    #[tokio::test]
    async fn three_consecutive_failures_trip_the_circuit() {
        let (breaker, _clock) = breaker();

        assert!(!breaker.record_failure("TX").await);
        assert!(!breaker.record_failure("TX").await);
        assert!(breaker.is_available("TX").await);

        // Third failure trips it.
        assert!(breaker.record_failure("TX").await);
        assert!(!breaker.is_available("TX").await);

        let status = breaker.status("TX").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn availability_read_after_cooldown_goes_half_open() {
        let (breaker, clock) = breaker();

        for _ in 0..3 {
            breaker.record_failure("NY").await;
        }
        assert!(!breaker.is_available("NY").await);

        clock.advance(Duration::from_secs(3599));
        assert!(!breaker.is_available("NY").await);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_available("NY").await);
        assert_eq!(breaker.status("NY").await.unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn two_half_open_successes_close_the_circuit() {
        let (breaker, clock) = breaker();

        for _ in 0..3 {
            breaker.record_failure("FL").await;
        }
        clock.advance(Duration::from_secs(3600));
        assert!(breaker.is_available("FL").await);

        breaker.record_success("FL").await;
        assert_eq!(breaker.status("FL").await.unwrap().state, CircuitState::HalfOpen);

        breaker.record_success("FL").await;
        let status = breaker.status("FL").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_fresh_cooldown() {
        let (breaker, clock) = breaker();

        for _ in 0..3 {
            breaker.record_failure("WA").await;
        }
        clock.advance(Duration::from_secs(3600));
        assert!(breaker.is_available("WA").await);

        // One failure while half-open reopens immediately.
        assert!(breaker.record_failure("WA").await);
        assert!(!breaker.is_available("WA").await);

        // The cooldown restarted from the half-open failure, not the
        // original trip.
        clock.advance(Duration::from_secs(3599));
        assert!(!breaker.is_available("WA").await);
        clock.advance(Duration::from_secs(1));
        assert!(breaker.is_available("WA").await);
    }

    #[tokio::test]
    async fn closed_success_resets_failure_count() {
        let (breaker, _clock) = breaker();

        breaker.record_failure("OR").await;
        breaker.record_failure("OR").await;
        breaker.record_success("OR").await;

        assert_eq!(breaker.status("OR").await.unwrap().consecutive_failures, 0);

        // Two more failures stay below the threshold after the reset.
        breaker.record_failure("OR").await;
        assert!(!breaker.record_failure("OR").await);
        assert!(breaker.is_available("OR").await);
    }

    #[tokio::test]
    async fn all_open_lists_only_open_circuits() {
        let (breaker, _clock) = breaker();

        for _ in 0..3 {
            breaker.record_failure("AK").await;
        }
        breaker.record_failure("HI").await;

        let open = breaker.all_open().await;
        assert_eq!(open.len(), 1);
        assert!(open.contains_key("AK"));
    }

    #[tokio::test]
    async fn reset_clears_partition_state() {
        let (breaker, _clock) = breaker();

        for _ in 0..3 {
            breaker.record_failure("NV").await;
        }
        assert!(!breaker.is_available("NV").await);

        breaker.reset("NV").await;
        assert!(breaker.is_available("NV").await);
        assert!(breaker.status("NV").await.is_none());
    }
}
