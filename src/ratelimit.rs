//! Fixed-window admission control keyed by client.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RouterError, RouterResult};

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    count: u64,
}

impl WindowState {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.started) >= window
    }

    fn remaining_window(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.duration_since(self.started))
    }
}

/// Outcome of [`RateLimiter::reserve`]
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Admitted now
    pub ok: bool,
    /// How long to wait before retrying when not admitted
    pub delay: Duration,
    pub reset_at: DateTime<Utc>,
}

/// Values for the X-Rate-Limit-* response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the current window ends
    pub reset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub active_keys: usize,
    pub last_reset: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
struct Counters {
    total: u64,
    allowed: u64,
    denied: u64,
    last_reset: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl Default for Counters {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total: 0,
            allowed: 0,
            denied: 0,
            last_reset: now,
            last_updated: now,
        }
    }
}

/// Per-key fixed window counter.
///
/// A key's window opens at its first admitted call and lasts `window`;
/// within it at most `limit` permits are granted. Once the window has
/// elapsed the next call opens a fresh one.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, WindowState>>,
    counters: Mutex<Counters>,
}

fn epoch_after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        self.allow_n(key, 1, limit, window)
    }

    /// Take `n` permits at once, all or nothing
    pub fn allow_n(&self, key: &str, n: u64, limit: u64, window: Duration) -> bool {
        let admitted = self.try_acquire(key, n, limit, window).is_ok();
        self.count(admitted);
        admitted
    }

    /// Take one permit if available, otherwise report how long until the
    /// window resets. Refused reservations consume nothing.
    pub fn reserve(&self, key: &str, limit: u64, window: Duration) -> Reservation {
        let reservation = match self.try_acquire(key, 1, limit, window) {
            Ok(remaining_window) => Reservation {
                ok: true,
                delay: Duration::ZERO,
                reset_at: epoch_after(remaining_window),
            },
            Err(delay) => Reservation {
                ok: false,
                delay,
                reset_at: epoch_after(delay),
            },
        };
        self.count(reservation.ok);
        reservation
    }

    /// Wait until a permit is granted or `cancel` fires
    pub async fn wait(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cancel: &CancellationToken,
    ) -> RouterResult<()> {
        if limit == 0 {
            return Err(RouterError::rate_limited(key, limit, Utc::now().timestamp()));
        }
        loop {
            let reservation = self.reserve(key, limit, window);
            if reservation.ok {
                return Ok(());
            }
            debug!(key, delay_ms = reservation.delay.as_millis() as u64, "Waiting for rate limit window");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RouterError::rate_limited(
                        key,
                        limit,
                        reservation.reset_at.timestamp(),
                    ));
                }
                _ = tokio::time::sleep(reservation.delay.max(Duration::from_millis(1))) => {}
            }
        }
    }

    /// Header values for `key` without consuming a permit
    pub fn status(&self, key: &str, limit: u64, window: Duration) -> RateLimitStatus {
        let now = Instant::now();
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let (used, until_reset) = match windows.get(key) {
            Some(state) if !state.expired(now, window) => {
                (state.count, state.remaining_window(now, window))
            }
            _ => (0, window),
        };
        let reset = epoch_after(until_reset);
        // Round up so clients never retry before the window actually ends
        let reset = if reset.timestamp_subsec_nanos() > 0 {
            reset.timestamp() + 1
        } else {
            reset.timestamp()
        };
        RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(used),
            reset,
        }
    }

    /// Ok(time left in the window) when admitted, Err(delay) otherwise
    fn try_acquire(&self, key: &str, n: u64, limit: u64, window: Duration) -> Result<Duration, Duration> {
        if n > limit {
            return Err(window);
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let state = windows.entry(key.to_string()).or_insert(WindowState {
            started: now,
            count: 0,
        });
        if state.expired(now, window) {
            *state = WindowState {
                started: now,
                count: 0,
            };
        }
        if state.count + n <= limit {
            state.count += n;
            Ok(state.remaining_window(now, window))
        } else {
            Err(state.remaining_window(now, window))
        }
    }

    fn count(&self, admitted: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total += 1;
        if admitted {
            counters.allowed += 1;
        } else {
            counters.denied += 1;
            metrics::counter!("router_rate_limit_denied_total").increment(1);
        }
        counters.last_updated = Utc::now();
    }

    /// Forget keys whose window has elapsed
    pub fn purge_expired(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, state| !state.expired(now, window));
        before - windows.len()
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let active_keys = self
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        RateLimiterMetrics {
            total_requests: counters.total,
            allowed_requests: counters.allowed,
            denied_requests: counters.denied,
            active_keys,
            last_reset: counters.last_reset,
            last_updated: counters.last_updated,
        }
    }

    pub fn reset_metrics(&self) {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_limit_calls_admitted() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        for i in 0..5 {
            assert!(limiter.allow("client", 5, window), "call {} should pass", i);
        }
        assert!(!limiter.allow("client", 5, window));
        assert!(limiter.allow("other", 5, window));
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(50);
        assert!(limiter.allow("k", 2, window));
        assert!(limiter.allow("k", 2, window));
        assert!(!limiter.allow("k", 2, window));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(limiter.allow("k", 2, window));
    }

    #[test]
    fn test_allow_n_is_all_or_nothing() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        assert!(limiter.allow_n("k", 3, 4, window));
        assert!(!limiter.allow_n("k", 2, 4, window));
        assert!(limiter.allow_n("k", 1, 4, window));
        assert!(!limiter.allow_n("x", 5, 4, window));
    }

    #[test]
    fn test_reserve_reports_delay() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(10);
        assert!(limiter.reserve("k", 1, window).ok);

        let refused = limiter.reserve("k", 1, window);
        assert!(!refused.ok);
        assert!(refused.delay > Duration::from_secs(9));
        assert!(refused.delay <= window);
        assert_eq!(limiter.status("k", 1, window).remaining, 0);
    }

    #[tokio::test]
    async fn test_wait_admits_after_window() {
        let limiter = RateLimiter::new();
        let window = Duration::from_millis(40);
        let token = CancellationToken::new();
        assert!(limiter.allow("k", 1, window));

        let start = Instant::now();
        limiter.wait("k", 1, window, &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let token = CancellationToken::new();
        assert!(limiter.allow("k", 1, window));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = limiter.wait("k", 1, window, &token).await.unwrap_err();
        assert!(matches!(err, RouterError::RateLimitExceeded { .. }));
    }

    #[test]
    fn test_status_and_metrics() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        limiter.allow("k", 3, window);
        limiter.allow("k", 3, window);

        let status = limiter.status("k", 3, window);
        assert_eq!(status.limit, 3);
        assert_eq!(status.remaining, 1);
        assert!(status.reset > Utc::now().timestamp());

        limiter.allow("k", 3, window);
        limiter.allow("k", 3, window);
        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 4);
        assert_eq!(metrics.allowed_requests, 3);
        assert_eq!(metrics.denied_requests, 1);
        assert_eq!(metrics.active_keys, 1);

        limiter.reset_metrics();
        assert_eq!(limiter.metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let limiter = RateLimiter::new();
        limiter.allow("a", 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.purge_expired(Duration::from_millis(10)), 1);
        assert_eq!(limiter.metrics().active_keys, 0);
    }
}
