//! Outbound rate limiting.
//!
//! A rolling one-second window per key (or one shared key in global scope).
//! `acquire` never fails: when the window is saturated the caller sleeps until
//! the oldest start leaves the window, then re-checks.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::{RateLimitConfig, RateLimitScope};
use crate::observability::metrics;

const GLOBAL_KEY: &str = "global";

/// Call starts admitted within the current rolling window.
#[derive(Debug)]
pub struct RateWindow {
    starts: VecDeque<Instant>,
    limit_per_second: u32,
}

impl RateWindow {
    fn new(limit_per_second: u32) -> Self {
        Self {
            starts: VecDeque::new(),
            limit_per_second,
        }
    }

    /// Admit a start at `now`, or return how long to wait before retrying.
    fn try_admit(&mut self, now: Instant, span: Duration) -> Result<(), Duration> {
        while let Some(&oldest) = self.starts.front() {
            if now.duration_since(oldest) >= span {
                self.starts.pop_front();
            } else {
                break;
            }
        }

        if self.starts.len() < self.limit_per_second as usize {
            self.starts.push_back(now);
            return Ok(());
        }

        // saturated: front is within the window
        let oldest = self.starts.front().copied().unwrap_or(now);
        Err((oldest + span).saturating_duration_since(now))
    }

    /// Start of the current window (oldest admitted call still inside it).
    pub fn window_start(&self) -> Option<Instant> {
        self.starts.front().copied()
    }

    pub fn count(&self) -> usize {
        self.starts.len()
    }
}

/// Throttles outbound calls to a fixed ceiling per second.
#[derive(Debug)]
pub struct RateLimiter {
    limit_per_second: u32,
    span: Duration,
    scope: RateLimitScope,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(limit_per_second: u32, scope: RateLimitScope) -> Self {
        Self {
            limit_per_second: limit_per_second.max(1),
            span: Duration::from_secs(1),
            scope,
            windows: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.scope)
    }

    fn window_key<'a>(&self, operation_key: &'a str) -> &'a str {
        match self.scope {
            RateLimitScope::Global => GLOBAL_KEY,
            RateLimitScope::PerOperation => operation_key,
        }
    }

    /// Block until a slot is free for `operation_key`.
    pub async fn acquire(&self, operation_key: &str) {
        let key = self.window_key(operation_key);
        let started = Instant::now();

        loop {
            // the shard lock is released before sleeping
            let wait = {
                let mut window = self
                    .windows
                    .entry(key.to_string())
                    .or_insert_with(|| RateWindow::new(self.limit_per_second));
                window.try_admit(Instant::now(), self.span).err()
            };

            match wait {
                None => break,
                Some(delay) => {
                    tracing::trace!(key = %key, delay_ms = delay.as_millis() as u64, "Rate limit saturated, waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            tracing::debug!(key = %key, waited_ms = waited.as_millis() as u64, "Rate limiter delayed call");
            metrics::record_limiter_wait(key, waited);
        }
    }

    /// Starts currently counted in the window for `operation_key`.
    pub fn in_flight_window(&self, operation_key: &str) -> usize {
        let key = self.window_key(operation_key);
        self.windows.get(key).map(|w| w.count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_n_plus_one_call_is_delayed() {
        let limiter = RateLimiter::new(3, RateLimitScope::Global);
        let t0 = Instant::now();

        for _ in 0..3 {
            limiter.acquire("query").await;
        }
        assert_eq!(t0.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_flight_window("query"), 3);

        limiter.acquire("query").await;
        assert!(t0.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_operation_scope_isolates_keys() {
        let limiter = RateLimiter::new(1, RateLimitScope::PerOperation);
        let t0 = Instant::now();

        limiter.acquire("a").await;
        limiter.acquire("b").await;
        assert_eq!(t0.elapsed(), Duration::ZERO);

        limiter.acquire("a").await;
        assert!(t0.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_respect_ceiling() {
        let limiter = Arc::new(RateLimiter::new(3, RateLimitScope::Global));
        let starts = Arc::new(Mutex::new(Vec::new()));
        let t0 = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let starts = starts.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("create").await;
                starts.lock().unwrap().push(t0.elapsed());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut starts = starts.lock().unwrap().clone();
        starts.sort();
        assert_eq!(starts.len(), 10);
        // any 4 consecutive starts must span at least one second
        for pair in starts.windows(4) {
            assert!(pair[3] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_window_bookkeeping() {
        let mut window = RateWindow::new(2);
        let now = Instant::now();
        assert!(window.try_admit(now, Duration::from_secs(1)).is_ok());
        assert!(window.try_admit(now, Duration::from_secs(1)).is_ok());
        let wait = window.try_admit(now, Duration::from_secs(1)).unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));
        assert_eq!(window.window_start(), Some(now));
    }
}
