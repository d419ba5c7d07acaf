//! Per-read options: freshness windows, retry policy, and attempt timeout.

use std::time::Duration;

use rand::Rng;

/// Retry policy for transient fetch failures.
///
/// Only errors for which [`QueryError::is_transient`](ledger_core::QueryError::is_transient)
/// holds are retried. Backoff doubles per attempt up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: false,
    };

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    #[must_use]
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let spread = rand::rng().random_range(0..=half.as_millis().max(1));
            #[allow(clippy::cast_possible_truncation)]
            let spread = Duration::from_millis(spread as u64);
            half + spread.min(half)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Options applied to a single [`QueryStore::read`](super::QueryStore::read).
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// How long fetched data counts as fresh.
    pub stale_time: Duration,
    /// How long an unreferenced entry survives after going stale.
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    /// Deadline for each attempt. `None` waits forever.
    pub fetch_timeout: Option<Duration>,
}

impl QueryOptions {
    /// Sets the stale time (builder style).
    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Sets the eviction window (builder style).
    #[must_use]
    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    /// Sets the retry policy (builder style).
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-attempt timeout (builder style).
    #[must_use]
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(5 * 60),
            gc_time: Duration::from_secs(10 * 60),
            retry: RetryPolicy::default(),
            fetch_timeout: Some(Duration::from_secs(30)),
        }
    }
}
