//! Circuit breaker keyed by operation.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast with `CircuitOpen`
//! - Half-Open: one trial call in flight
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Half-Open: first call after opened_at + cooldown
//! Half-Open → Closed: trial succeeds (failures reset to 0)
//! Half-Open → Open: trial fails (opened_at = now, cooldown grows)
//! ```
//!
//! Only transient failures (timeouts, network, 429, 5xx) count. A 4xx answer
//! proves the dependency is reachable and is treated as a success here.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{SyncError, SyncResult};
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn code(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

/// Per-operation breaker state. Only this module reads or writes it.
#[derive(Debug, Clone)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    reopen_count: u32,
}

impl CircuitState {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown,
            trial_in_flight: false,
            reopen_count: 0,
        }
    }
}

/// Read-only view for logs and health output.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub operation: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub cooldown_secs: u64,
}

/// Registry of breakers, one per operation key.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    base_cooldown: Duration,
    reopen_multiplier: f64,
    max_cooldown: Duration,
    circuits: DashMap<String, CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            base_cooldown: cooldown,
            reopen_multiplier: 1.0,
            max_cooldown: cooldown,
            circuits: DashMap::new(),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.cooldown_secs))
            .with_reopen_backoff(
                config.reopen_backoff_multiplier,
                Duration::from_secs(config.max_cooldown_secs),
            )
    }

    /// Grow the cooldown by `multiplier` after every failed trial, up to `max`.
    pub fn with_reopen_backoff(mut self, multiplier: f64, max: Duration) -> Self {
        self.reopen_multiplier = multiplier.max(1.0);
        self.max_cooldown = max.max(self.base_cooldown);
        self
    }

    /// Run `call` under the breaker for `operation`.
    pub async fn call<T, F, Fut>(&self, operation: &str, call: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let permit = self.try_acquire(operation)?;
        let result = call().await;
        match &result {
            Err(e) if e.is_retryable() => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    /// Ask for permission to call `operation`.
    pub fn try_acquire(&self, operation: &str) -> SyncResult<Permit<'_>> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(operation.to_string())
            .or_insert_with(|| CircuitState::new(self.base_cooldown));

        let trial = match circuit.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                let reopen_at = opened_at + circuit.cooldown;
                if now < reopen_at {
                    return Err(SyncError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_in: reopen_at - now,
                    });
                }
                circuit.state = BreakerState::HalfOpen;
                circuit.trial_in_flight = true;
                tracing::info!(operation = %operation, "Circuit half-open, allowing trial call");
                metrics::record_circuit_state(operation, BreakerState::HalfOpen.code());
                true
            }
            BreakerState::HalfOpen => {
                if circuit.trial_in_flight {
                    return Err(SyncError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_in: Duration::ZERO,
                    });
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: self,
            operation: operation.to_string(),
            trial,
            settled: false,
        })
    }

    fn on_success(&self, operation: &str, trial: bool) {
        let Some(mut circuit) = self.circuits.get_mut(operation) else {
            return;
        };
        if !trial && circuit.state != BreakerState::Closed {
            // a call admitted before the breaker opened; the trial decides
            return;
        }
        if circuit.state == BreakerState::HalfOpen {
            tracing::info!(operation = %operation, "Circuit closed after successful trial");
            metrics::record_circuit_state(operation, BreakerState::Closed.code());
        }
        circuit.state = BreakerState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.trial_in_flight = false;
        circuit.reopen_count = 0;
        circuit.cooldown = self.base_cooldown;
    }

    fn on_failure(&self, operation: &str, trial: bool) {
        let Some(mut circuit) = self.circuits.get_mut(operation) else {
            return;
        };
        let now = Instant::now();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        if trial {
            circuit.reopen_count = circuit.reopen_count.saturating_add(1);
            let grown = self.base_cooldown.as_secs_f64()
                * self.reopen_multiplier.powi(circuit.reopen_count as i32);
            circuit.cooldown = Duration::from_secs_f64(grown.min(self.max_cooldown.as_secs_f64()));
            circuit.state = BreakerState::Open;
            circuit.opened_at = Some(now);
            circuit.trial_in_flight = false;
            tracing::warn!(
                operation = %operation,
                cooldown_secs = circuit.cooldown.as_secs(),
                "Circuit re-opened after failed trial"
            );
            metrics::record_circuit_state(operation, BreakerState::Open.code());
            return;
        }

        if circuit.state == BreakerState::Closed
            && circuit.consecutive_failures >= self.failure_threshold
        {
            circuit.state = BreakerState::Open;
            circuit.opened_at = Some(now);
            circuit.cooldown = self.base_cooldown;
            tracing::warn!(
                operation = %operation,
                failures = circuit.consecutive_failures,
                cooldown_secs = circuit.cooldown.as_secs(),
                "Circuit opened after threshold reached"
            );
            metrics::record_circuit_state(operation, BreakerState::Open.code());
        }
    }

    fn release_trial(&self, operation: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(operation) {
            circuit.trial_in_flight = false;
        }
    }

    /// Current state for `operation` (Closed if never called).
    pub fn state(&self, operation: &str) -> BreakerState {
        self.circuits
            .get(operation)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn consecutive_failures(&self, operation: &str) -> u32 {
        self.circuits
            .get(operation)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self
            .circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                operation: entry.key().clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                cooldown_secs: entry.cooldown.as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.operation.cmp(&b.operation));
        out
    }
}

/// Admission to call an operation. Settle it with `success` or `failure`;
/// dropping it unsettled (e.g. a cancelled future) only frees the trial slot.
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    operation: String,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(&self.operation, self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(&self.operation, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial(&self.operation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientCause;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> SyncError {
        SyncError::transient("op", TransientCause::Server(500), "boom")
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let attempts = AtomicU32::new(0);

        for _ in 0..3 {
            let r: SyncResult<()> = breaker
                .call("op", || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(server_error())
                })
                .await;
            assert!(r.is_err());
        }
        assert_eq!(breaker.state("op"), BreakerState::Open);

        let r: SyncResult<()> = breaker
            .call("op", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(r, Err(SyncError::CircuitOpen { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "no call while open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        breaker.try_acquire("op").unwrap().failure();
        assert_eq!(breaker.state("op"), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.try_acquire("op").unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state("op"), BreakerState::HalfOpen);
        assert!(matches!(breaker.try_acquire("op"), Err(SyncError::CircuitOpen { .. })));

        trial.success();
        assert_eq!(breaker.state("op"), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures("op"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_longer_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10))
            .with_reopen_backoff(2.0, Duration::from_secs(100));
        breaker.try_acquire("op").unwrap().failure();

        tokio::time::advance(Duration::from_secs(10)).await;
        breaker.try_acquire("op").unwrap().failure();
        assert_eq!(breaker.state("op"), BreakerState::Open);

        // cooldown restarted and doubled
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire("op").is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire("op").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(1));
        breaker.try_acquire("op").unwrap().failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        drop(breaker.try_acquire("op").unwrap());
        assert!(breaker.try_acquire("op").unwrap().is_trial());
    }

    #[tokio::test]
    async fn test_non_transient_errors_do_not_count() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let r: SyncResult<()> = breaker
            .call("op", || async { Err(SyncError::from_status("op", 400, "bad", None)) })
            .await;
        assert!(r.is_err());
        assert_eq!(breaker.state("op"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failures_and_keys_are_independent() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.try_acquire("a").unwrap().failure();
        breaker.try_acquire("a").unwrap().failure();
        breaker.try_acquire("b").unwrap().failure();
        assert_eq!(breaker.consecutive_failures("a"), 2);

        breaker.try_acquire("a").unwrap().success();
        assert_eq!(breaker.consecutive_failures("a"), 0);
        assert_eq!(breaker.consecutive_failures("b"), 1);
        assert_eq!(breaker.snapshot().len(), 2);
    }
}
