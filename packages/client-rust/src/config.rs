use std::time::Duration;

use crate::store::{QueryOptions, RetryPolicy, DEFAULT_EVENT_CAPACITY};

/// Client-level configuration for the transaction client.
///
/// Controls the remote endpoint, page size, per-query cache windows, and
/// background maintenance intervals.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the transaction service, without a trailing slash.
    pub base_url: String,
    /// Rows requested per page.
    pub page_size: usize,
    /// Cache options for list pages.
    pub list_options: QueryOptions,
    /// Cache options for the aggregated summary.
    pub aggregate_options: QueryOptions,
    /// Interval between garbage collection sweeps in milliseconds.
    pub gc_interval_ms: u64,
    /// Transport-level timeout for each HTTP request in milliseconds.
    pub request_timeout_ms: u64,
    /// Capacity of the cache and settled-mutation broadcast channels.
    pub event_capacity: usize,
}

/// Errors returned by [`ClientConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

impl ClientConfig {
    /// Checks the values a client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        for (field, value) in [
            ("page_size", self.page_size as u64),
            ("event_capacity", self.event_capacity as u64),
            ("gc_interval_ms", self.gc_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3333".to_string(),
            page_size: 10,
            list_options: QueryOptions::default()
                .with_stale_time(Duration::from_secs(5 * 60))
                .with_gc_time(Duration::from_secs(10 * 60)),
            aggregate_options: QueryOptions::default()
                .with_stale_time(Duration::from_secs(2 * 60))
                .with_gc_time(Duration::from_secs(5 * 60))
                .with_retry(RetryPolicy::default()),
            gc_interval_ms: 60_000,
            request_timeout_ms: 30_000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
