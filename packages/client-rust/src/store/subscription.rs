//! Change notifications and subscriber registration.
//!
//! The store publishes every entry transition on one broadcast channel.
//! A [`Subscription`] filters that channel by key prefix and, while alive,
//! keeps matching entries from being evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ledger_core::QueryKey;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEventKind {
    /// A fetch started.
    Loading,
    /// Data changed (fetch success, optimistic patch, or rollback).
    Updated,
    /// A fetch failed.
    Failed,
    /// The entry was marked stale.
    Invalidated,
    /// The entry was removed or evicted.
    Removed,
}

/// Notification published for every entry transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub key: QueryKey,
    pub kind: QueryEventKind,
}

/// Registry of live subscription prefixes, shared by the store and its
/// subscriptions.
#[derive(Debug, Default)]
pub(crate) struct SubscriberRegistry {
    next_id: AtomicU64,
    prefixes: Mutex<HashMap<u64, QueryKey>>,
}

impl SubscriberRegistry {
    fn register(&self, prefix: QueryKey) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.prefixes.lock().insert(id, prefix);
        id
    }

    fn unregister(&self, id: u64) {
        self.prefixes.lock().remove(&id);
    }

    /// Returns `true` if any live subscription covers `key`.
    pub fn is_observed(&self, key: &QueryKey) -> bool {
        self.prefixes
            .lock()
            .values()
            .any(|prefix| key.starts_with(prefix))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.prefixes.lock().len()
    }
}

/// Live stream of [`QueryEvent`]s for keys under a prefix.
///
/// Unregisters itself on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    prefix: QueryKey,
    rx: broadcast::Receiver<QueryEvent>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub(crate) fn new(
        prefix: QueryKey,
        rx: broadcast::Receiver<QueryEvent>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        let id = registry.register(prefix.clone());
        Self {
            id,
            prefix,
            rx,
            registry,
        }
    }

    /// Prefix this subscription listens to.
    #[must_use]
    pub fn prefix(&self) -> &QueryKey {
        &self.prefix
    }

    /// Waits for the next event under the prefix.
    ///
    /// Returns `None` once the store has been dropped. Events missed because
    /// the receiver lagged are skipped with a warning.
    pub async fn recv(&mut self) -> Option<QueryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(prefix = %self.prefix, skipped, "subscription lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
