//! Cache entry and its lifecycle metadata.

use std::time::Duration;

use ledger_core::clock::deadline_after;
use ledger_core::{QueryError, QueryKey};

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Entry exists but has never been fetched.
    Idle,
    /// A fetch is in flight. Previous data, if any, is still served.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed; `error` holds the failure.
    Error,
}

/// One keyed result in the [`QueryStore`](super::QueryStore).
///
/// Mutated in place by the store only. Consumers see it through
/// [`EntrySnapshot`].
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub key: QueryKey,
    pub data: Option<V>,
    pub status: QueryStatus,
    /// Millis after which a read triggers a refetch.
    pub stale_at: u64,
    /// Millis after which the entry may be discarded if unreferenced.
    pub evict_at: u64,
    pub error: Option<QueryError>,
    /// Millis of the last data change (fetch, patch, or rollback).
    pub updated_at: u64,
    /// Window applied on each successful fetch.
    pub stale_time: Duration,
    pub gc_time: Duration,
    /// Identifier of the fetch whose result this entry will accept.
    pub fetch_id: Option<u64>,
    /// Status to restore if the in-flight fetch is cancelled.
    pub status_before_fetch: QueryStatus,
    /// Unsettled mutations holding this entry, oldest first.
    pub holds: Vec<Hold<V>>,
}

/// One unsettled mutation's claim on an entry.
#[derive(Debug, Clone)]
pub(crate) struct Hold<V> {
    pub mutation_id: u64,
    /// Data to restore if this mutation and every newer one roll back.
    pub base: Option<V>,
}

impl<V> CacheEntry<V> {
    /// Creates an idle, already-stale entry.
    pub fn new(key: QueryKey, now: u64, stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            stale_at: now,
            evict_at: deadline_after(now, gc_time),
            error: None,
            updated_at: now,
            stale_time,
            gc_time,
            fetch_id: None,
            status_before_fetch: QueryStatus::Idle,
            holds: Vec::new(),
        }
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        self.status == QueryStatus::Success && now < self.stale_at
    }

    /// Marks the start of a fetch.
    pub fn begin_fetch(&mut self, fetch_id: u64, stale_time: Duration, gc_time: Duration) {
        if self.fetch_id.is_none() {
            self.status_before_fetch = self.status;
        }
        self.fetch_id = Some(fetch_id);
        self.status = QueryStatus::Loading;
        self.stale_time = stale_time;
        self.gc_time = gc_time;
    }

    /// Detaches the in-flight fetch and restores the pre-fetch status.
    pub fn detach_fetch(&mut self) -> bool {
        if self.fetch_id.take().is_some() {
            self.status = self.status_before_fetch;
            true
        } else {
            false
        }
    }

    /// Records a successful fetch.
    pub fn succeed(&mut self, data: V, now: u64) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.error = None;
        self.updated_at = now;
        self.stale_at = deadline_after(now, self.stale_time);
        self.evict_at = deadline_after(self.stale_at, self.gc_time);
    }

    /// Records a failed fetch. Previous data is kept.
    pub fn fail(&mut self, error: QueryError, now: u64) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.evict_at = self.evict_at.max(deadline_after(now, self.gc_time));
    }

    /// Forces the next read to refetch without dropping data.
    pub fn mark_stale(&mut self) {
        self.stale_at = 0;
    }

    pub fn is_held(&self) -> bool {
        !self.holds.is_empty()
    }

    /// Records a hold for `mutation_id` over the current data.
    pub fn hold(&mut self, mutation_id: u64) -> Option<V>
    where
        V: Clone,
    {
        let base = self.data.clone();
        self.holds.push(Hold {
            mutation_id,
            base: base.clone(),
        });
        base
    }

    /// Drops the hold of `mutation_id`. Returns `true` if data was restored.
    ///
    /// A rollback restores the hold's base only when it is the newest hold.
    /// Otherwise the base passes to the next newer hold, whose own rollback
    /// then restores past both patches.
    pub fn release(&mut self, mutation_id: u64, rollback: bool, now: u64) -> bool {
        let Some(pos) = self.holds.iter().position(|hold| hold.mutation_id == mutation_id) else {
            return false;
        };
        let released = self.holds.remove(pos);
        if !rollback {
            return false;
        }
        if let Some(newer) = self.holds.get_mut(pos) {
            newer.base = released.base;
            return false;
        }
        if released.base.is_none() && self.status == QueryStatus::Success {
            self.status = QueryStatus::Idle;
        }
        self.data = released.base;
        self.updated_at = now;
        true
    }

    /// Whether the entry may be evicted, ignoring subscribers.
    pub fn is_evictable(&self, now: u64) -> bool {
        self.fetch_id.is_none() && self.holds.is_empty() && now > self.evict_at
    }
}

/// Read-only copy of an entry's state, handed to consumers.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    pub key: QueryKey,
    pub data: Option<V>,
    pub status: QueryStatus,
    pub stale_at: u64,
    pub evict_at: u64,
    pub error: Option<QueryError>,
    pub updated_at: u64,
    /// `true` if an unsettled mutation currently holds the entry.
    pub held: bool,
}

impl<V> EntrySnapshot<V> {
    /// Whether the entry would be served without a refetch at `now`.
    #[must_use]
    pub fn is_stale(&self, now: u64) -> bool {
        now >= self.stale_at
    }
}

impl<V: Clone> From<&CacheEntry<V>> for EntrySnapshot<V> {
    fn from(entry: &CacheEntry<V>) -> Self {
        Self {
            key: entry.key.clone(),
            data: entry.data.clone(),
            status: entry.status,
            stale_at: entry.stale_at,
            evict_at: entry.evict_at,
            error: entry.error.clone(),
            updated_at: entry.updated_at,
            held: entry.is_held(),
        }
    }
}
