//! Cache observer trait, composite fan-out, and the default tracing observer.
//!
//! Defines [`CacheObserver`] for reacting to fetch failures, mutation
//! outcomes, invalidation, and eviction inside the
//! [`QueryStore`](crate::store::QueryStore) and
//! [`MutationExecutor`](crate::mutation::MutationExecutor), and
//! [`CompositeCacheObserver`] which fans notifications out to several
//! observers.

use std::sync::Arc;

use ledger_core::{QueryError, QueryKey};

/// Observer for cache-level events.
///
/// Implementations can log, count, or surface notifications to the user.
/// Callbacks run synchronously on the task that produced the event, possibly
/// while the store's lock is held. They must not block or call back into the
/// store.
///
/// Used as `Arc<dyn CacheObserver>`.
pub trait CacheObserver: Send + Sync {
    /// Called when a fetch gives up, after `attempts` attempts.
    fn on_fetch_error(&self, key: &QueryKey, error: &QueryError, attempts: u32);

    /// Called when a mutation's remote call or optimistic patch fails.
    fn on_mutation_error(&self, mutation: &str, error: &QueryError);

    /// Called once per mutation after it has committed or rolled back.
    fn on_mutation_settled(&self, mutation: &str, succeeded: bool);

    /// Called for every entry marked stale by an invalidation.
    fn on_invalidate(&self, key: &QueryKey);

    /// Called for every entry removed by eviction.
    fn on_evict(&self, key: &QueryKey);
}

/// Composite observer that fans out to multiple observers.
#[derive(Default)]
pub struct CompositeCacheObserver {
    observers: Vec<Arc<dyn CacheObserver>>,
}

impl CompositeCacheObserver {
    /// Creates a composite observer with the given list of observers.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn CacheObserver>>) -> Self {
        Self { observers }
    }

    /// Adds an observer after construction.
    pub fn add(&mut self, observer: Arc<dyn CacheObserver>) {
        self.observers.push(observer);
    }
}

impl CacheObserver for CompositeCacheObserver {
    fn on_fetch_error(&self, key: &QueryKey, error: &QueryError, attempts: u32) {
        for observer in &self.observers {
            observer.on_fetch_error(key, error, attempts);
        }
    }

    fn on_mutation_error(&self, mutation: &str, error: &QueryError) {
        for observer in &self.observers {
            observer.on_mutation_error(mutation, error);
        }
    }

    fn on_mutation_settled(&self, mutation: &str, succeeded: bool) {
        for observer in &self.observers {
            observer.on_mutation_settled(mutation, succeeded);
        }
    }

    fn on_invalidate(&self, key: &QueryKey) {
        for observer in &self.observers {
            observer.on_invalidate(key);
        }
    }

    fn on_evict(&self, key: &QueryKey) {
        for observer in &self.observers {
            observer.on_evict(key);
        }
    }
}

/// Logs every event through `tracing`. The default observer.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn on_fetch_error(&self, key: &QueryKey, error: &QueryError, attempts: u32) {
        tracing::warn!(key = %key, kind = error.kind(), attempts, error = %error, "query failed");
    }

    fn on_mutation_error(&self, mutation: &str, error: &QueryError) {
        tracing::error!(mutation, kind = error.kind(), error = %error, "mutation failed");
    }

    fn on_mutation_settled(&self, mutation: &str, succeeded: bool) {
        tracing::debug!(mutation, succeeded, "mutation settled");
    }

    fn on_invalidate(&self, key: &QueryKey) {
        tracing::trace!(key = %key, "entry invalidated");
    }

    fn on_evict(&self, key: &QueryKey) {
        tracing::debug!(key = %key, "entry evicted");
    }
}
