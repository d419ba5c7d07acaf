//! Keyed query cache with deduplicated fetches, staleness, and eviction.
//!
//! [`QueryStore`] is a cheap `Clone` handle over shared state. All state sits
//! behind one `parking_lot::Mutex` that is never held across an `.await`;
//! fetches run in spawned tasks and write back only if the entry is still
//! waiting on that particular fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use ledger_core::{ClockSource, QueryError, QueryKey, SystemClock};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::entry::{CacheEntry, EntrySnapshot};
use super::options::QueryOptions;
use super::subscription::{QueryEvent, QueryEventKind, SubscriberRegistry, Subscription};
use crate::observer::{CacheObserver, TracingObserver};

/// Capacity of the change-notification channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

/// Data captured before an optimistic patch, one slot per affected key.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot<V> {
    /// Identifies the mutation's holds on each entry.
    pub mutation_id: u64,
    pub entries: Vec<(QueryKey, Option<V>)>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time counters for a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads served from cache without a fetch.
    pub hits: u64,
    /// Reads that started or joined a fetch.
    pub misses: u64,
    /// Fetches started.
    pub fetches: u64,
    /// Entries removed by eviction.
    pub evictions: u64,
    /// Entries currently held.
    pub entries: usize,
}

impl StoreStats {
    /// Fraction of reads served from cache, or 0 with no reads.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct InFlight<V> {
    fetch_id: u64,
    result: SharedFetch<V>,
}

struct StoreState<V> {
    entries: HashMap<QueryKey, CacheEntry<V>>,
    in_flight: HashMap<QueryKey, InFlight<V>>,
    next_fetch_id: u64,
    next_mutation_id: u64,
}

struct StoreShared<V> {
    state: Mutex<StoreState<V>>,
    clock: Arc<dyn ClockSource>,
    events: broadcast::Sender<QueryEvent>,
    subscribers: Arc<SubscriberRegistry>,
    observer: Arc<dyn CacheObserver>,
    stats: StatCounters,
}

enum Acquired<V> {
    Ready(V),
    Pending(SharedFetch<V>),
}

// ---------------------------------------------------------------------------
// QueryStore
// ---------------------------------------------------------------------------

/// Cache of fetched values keyed by [`QueryKey`].
///
/// Cloning yields another handle to the same cache.
pub struct QueryStore<V> {
    shared: Arc<StoreShared<V>>,
}

impl<V> Clone for QueryStore<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for QueryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> QueryStore<V> {
    /// Creates a store on the system clock with the tracing observer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(SystemClock),
            Arc::new(TracingObserver),
            DEFAULT_EVENT_CAPACITY,
        )
    }

    /// Creates a store with an injected clock, observer, and event capacity.
    #[must_use]
    pub fn with_parts(
        clock: Arc<dyn ClockSource>,
        observer: Arc<dyn CacheObserver>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(StoreState {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_fetch_id: 1,
                    next_mutation_id: 1,
                }),
                clock,
                events,
                subscribers: Arc::new(SubscriberRegistry::default()),
                observer,
                stats: StatCounters::default(),
            }),
        }
    }

    /// Returns the entry's data, fetching it first if missing or stale.
    ///
    /// Concurrent reads of one key share a single fetch. While a mutation
    /// holds the key, the current (optimistic) data is served without a
    /// fetch. Transient failures are retried according to `options.retry`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the last fetch attempt.
    pub async fn read<F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions,
    ) -> Result<V, QueryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        match self.acquire(key, fetcher, options) {
            Acquired::Ready(data) => Ok(data),
            Acquired::Pending(result) => result.await,
        }
    }

    /// Starts a background fetch unless the entry is fresh or already loading.
    ///
    /// Returns `true` if a fetch was started or joined. Must be called from
    /// within a tokio runtime.
    pub fn prefetch<F, Fut>(&self, key: &QueryKey, fetcher: F, options: &QueryOptions) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        matches!(self.acquire(key, fetcher, options), Acquired::Pending(_))
    }

    /// Current data for `key`, without fetching.
    #[must_use]
    pub fn get_data(&self, key: &QueryKey) -> Option<V> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        self.evict_if_expired(&mut state, key, now);
        state.entries.get(key).and_then(|entry| entry.data.clone())
    }

    /// Copy of the entry's full state, without fetching.
    #[must_use]
    pub fn snapshot(&self, key: &QueryKey) -> Option<EntrySnapshot<V>> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        self.evict_if_expired(&mut state, key, now);
        state.entries.get(key).map(EntrySnapshot::from)
    }

    /// Copies of every entry under `prefix`, ordered by key.
    #[must_use]
    pub fn entries_matching(&self, prefix: &QueryKey) -> Vec<EntrySnapshot<V>> {
        let state = self.shared.state.lock();
        let mut found: Vec<EntrySnapshot<V>> = state
            .entries
            .values()
            .filter(|entry| entry.key.starts_with(prefix))
            .map(EntrySnapshot::from)
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    /// Marks every entry under `prefix` stale. Data is kept.
    ///
    /// Returns the number of entries touched.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let touched: Vec<QueryKey> = {
            let mut state = self.shared.state.lock();
            state
                .entries
                .values_mut()
                .filter(|entry| entry.key.starts_with(prefix))
                .map(|entry| {
                    entry.mark_stale();
                    entry.key.clone()
                })
                .collect()
        };
        for key in &touched {
            self.shared.observer.on_invalidate(key);
            self.notify(key, QueryEventKind::Invalidated);
        }
        tracing::debug!(prefix = %prefix, count = touched.len(), "invalidated entries");
        touched.len()
    }

    /// Replaces an entry's data through `updater`. Status is left unchanged.
    ///
    /// Returns `Ok(false)` without calling `updater` when the key has no data.
    ///
    /// # Errors
    ///
    /// Returns the updater's error; the entry is left untouched.
    pub fn set_data<U>(&self, key: &QueryKey, updater: U) -> Result<bool, QueryError>
    where
        U: FnOnce(&V) -> Result<V, QueryError>,
    {
        let now = self.shared.clock.now();
        {
            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return Ok(false);
            };
            let Some(current) = entry.data.as_ref() else {
                return Ok(false);
            };
            let next = updater(current)?;
            entry.data = Some(next);
            entry.updated_at = now;
        }
        self.notify(key, QueryEventKind::Updated);
        Ok(true)
    }

    /// Detaches in-flight fetches under `prefix`.
    ///
    /// The transport call keeps running; its result is not written to the
    /// cache. Returns the number of fetches detached.
    pub fn cancel(&self, prefix: &QueryKey) -> usize {
        let mut state = self.shared.state.lock();
        let keys: Vec<QueryKey> = state
            .in_flight
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.in_flight.remove(key);
            if let Some(entry) = state.entries.get_mut(key) {
                entry.detach_fetch();
            }
        }
        if !keys.is_empty() {
            tracing::debug!(prefix = %prefix, count = keys.len(), "cancelled in-flight fetches");
        }
        keys.len()
    }

    /// Drops every entry under `prefix` immediately, cancelling their fetches.
    ///
    /// Returns the number of entries removed.
    pub fn remove(&self, prefix: &QueryKey) -> usize {
        let removed: Vec<QueryKey> = {
            let mut state = self.shared.state.lock();
            state.in_flight.retain(|key, _| !key.starts_with(prefix));
            let keys: Vec<QueryKey> = state
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            for key in &keys {
                state.entries.remove(key);
            }
            keys
        };
        for key in &removed {
            self.notify(key, QueryEventKind::Removed);
        }
        removed.len()
    }

    /// Evicts every expired, unreferenced entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.shared.clock.now();
        let evicted: Vec<QueryKey> = {
            let mut state = self.shared.state.lock();
            let keys: Vec<QueryKey> = state
                .entries
                .values()
                .filter(|entry| {
                    entry.is_evictable(now) && !self.shared.subscribers.is_observed(&entry.key)
                })
                .map(|entry| entry.key.clone())
                .collect();
            for key in &keys {
                state.entries.remove(key);
            }
            keys
        };
        for key in &evicted {
            self.record_eviction(key);
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "swept expired entries");
        }
        evicted.len()
    }

    /// Cancels every fetch and clears the cache.
    pub fn dispose(&self) {
        let removed: Vec<QueryKey> = {
            let mut state = self.shared.state.lock();
            state.in_flight.clear();
            state.entries.drain().map(|(key, _)| key).collect()
        };
        for key in &removed {
            self.notify(key, QueryEventKind::Removed);
        }
        tracing::debug!(count = removed.len(), "query store disposed");
    }

    /// Streams change events for every key under `prefix`.
    ///
    /// Matching entries are never evicted while the subscription is alive.
    #[must_use]
    pub fn subscribe(&self, prefix: QueryKey) -> Subscription {
        Subscription::new(
            prefix,
            self.shared.events.subscribe(),
            Arc::clone(&self.shared.subscribers),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let stats = &self.shared.stats;
        StoreStats {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            fetches: stats.fetches.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// The clock this store measures staleness with.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.shared.clock
    }

    /// The observer this store reports to.
    #[must_use]
    pub fn observer(&self) -> &Arc<dyn CacheObserver> {
        &self.shared.observer
    }

    // -- Optimistic holds ---------------------------------------------------

    /// Patches every entry under `prefixes` in one step and places a hold on
    /// each matching key.
    ///
    /// Every patch is computed before any is written, so a failing patch
    /// leaves the cache untouched and places no holds. Entries without data
    /// are held and snapshotted but not patched. In-flight fetches under the
    /// prefixes are detached under the same lock, so none of them can land
    /// on top of the patch.
    pub(crate) fn apply_optimistic<P>(
        &self,
        prefixes: &[QueryKey],
        patch: P,
    ) -> Result<Snapshot<V>, QueryError>
    where
        P: Fn(&QueryKey, &V) -> Result<V, QueryError>,
    {
        let now = self.shared.clock.now();
        let (snapshot, patched_keys) = {
            let mut state = self.shared.state.lock();
            let mut keys: Vec<QueryKey> = state
                .entries
                .keys()
                .filter(|key| prefixes.iter().any(|prefix| key.starts_with(prefix)))
                .cloned()
                .collect();
            keys.sort();

            let mut patched = Vec::new();
            for key in &keys {
                if let Some(current) = state.entries.get(key).and_then(|entry| entry.data.as_ref()) {
                    patched.push((key.clone(), patch(key, current)?));
                }
            }

            for key in &keys {
                if state.in_flight.remove(key).is_some() {
                    tracing::debug!(key = %key, "detached fetch before optimistic patch");
                }
            }
            let mutation_id = state.next_mutation_id;
            state.next_mutation_id += 1;
            let mut entries = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.detach_fetch();
                    entries.push((key.clone(), entry.hold(mutation_id)));
                }
            }
            let snapshot = Snapshot { mutation_id, entries };
            let mut patched_keys = Vec::with_capacity(patched.len());
            for (key, next) in patched {
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.data = Some(next);
                    entry.updated_at = now;
                }
                patched_keys.push(key);
            }
            (snapshot, patched_keys)
        };
        for key in &patched_keys {
            self.notify(key, QueryEventKind::Updated);
        }
        Ok(snapshot)
    }

    /// Releases the holds placed by [`apply_optimistic`](Self::apply_optimistic).
    ///
    /// On rollback each entry returns to the data it had before the oldest
    /// patch still being rolled back. While a newer mutation still holds an
    /// entry, its data is left alone and that mutation inherits the restore
    /// point. Entries removed in the meantime are skipped.
    pub(crate) fn release_optimistic(&self, snapshot: &Snapshot<V>, rollback: bool) {
        let now = self.shared.clock.now();
        let restored: Vec<QueryKey> = {
            let mut state = self.shared.state.lock();
            let mut restored = Vec::new();
            for (key, _) in &snapshot.entries {
                if let Some(entry) = state.entries.get_mut(key) {
                    if entry.release(snapshot.mutation_id, rollback, now) {
                        restored.push(key.clone());
                    }
                }
            }
            restored
        };
        for key in &restored {
            self.notify(key, QueryEventKind::Updated);
        }
    }

    // -- Internals ----------------------------------------------------------

    fn acquire<F, Fut>(&self, key: &QueryKey, fetcher: F, options: &QueryOptions) -> Acquired<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.lock();
        self.evict_if_expired(&mut state, key, now);

        if let Some(entry) = state.entries.get(key) {
            let servable = entry.is_fresh(now) || entry.is_held();
            if let (true, Some(data)) = (servable, entry.data.as_ref()) {
                self.record_hit();
                return Acquired::Ready(data.clone());
            }
        }

        self.record_miss();
        if let Some(in_flight) = state.in_flight.get(key) {
            tracing::trace!(key = %key, fetch_id = in_flight.fetch_id, "joining in-flight fetch");
            return Acquired::Pending(in_flight.result.clone());
        }

        let result = self.start_fetch(&mut state, key, fetcher, options, now);
        drop(state);
        self.notify(key, QueryEventKind::Loading);
        Acquired::Pending(result)
    }

    fn start_fetch<F, Fut>(
        &self,
        state: &mut StoreState<V>,
        key: &QueryKey,
        fetcher: F,
        options: &QueryOptions,
        now: u64,
    ) -> SharedFetch<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, QueryError>> + Send + 'static,
    {
        let fetch_id = state.next_fetch_id;
        state.next_fetch_id += 1;

        state
            .entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone(), now, options.stale_time, options.gc_time))
            .begin_fetch(fetch_id, options.stale_time, options.gc_time);

        let store = self.clone();
        let task_key = key.clone();
        let task_options = options.clone();
        let handle = tokio::spawn(async move {
            let (result, attempts) = fetch_with_retry(&task_key, &fetcher, &task_options).await;
            store.settle_fetch(&task_key, fetch_id, &result, attempts);
            result
        });

        let result: SharedFetch<V> = async move {
            handle
                .await
                .unwrap_or_else(|err| Err(QueryError::Internal(format!("fetch task failed: {err}"))))
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key.clone(),
            InFlight {
                fetch_id,
                result: result.clone(),
            },
        );
        self.shared.stats.fetches.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ledger_cache_fetches_total").increment(1);
        tracing::debug!(key = %key, fetch_id, "fetch started");
        result
    }

    /// Writes a fetch result into its entry if the entry still expects it.
    fn settle_fetch(&self, key: &QueryKey, fetch_id: u64, result: &Result<V, QueryError>, attempts: u32) {
        let now = self.shared.clock.now();
        let applied = {
            let mut state = self.shared.state.lock();
            if state
                .in_flight
                .get(key)
                .is_some_and(|in_flight| in_flight.fetch_id == fetch_id)
            {
                state.in_flight.remove(key);
            }
            match state.entries.get_mut(key) {
                Some(entry) if entry.fetch_id == Some(fetch_id) && entry.is_held() => {
                    entry.detach_fetch();
                    entry.mark_stale();
                    tracing::debug!(key = %key, fetch_id, "entry held by a mutation; fetch result not cached");
                    return;
                }
                Some(entry) if entry.fetch_id == Some(fetch_id) => {
                    entry.fetch_id = None;
                    match result {
                        Ok(data) => entry.succeed(data.clone(), now),
                        Err(err) => entry.fail(err.clone(), now),
                    }
                    true
                }
                _ => false,
            }
        };

        if !applied {
            tracing::debug!(key = %key, fetch_id, "discarding result of detached fetch");
            return;
        }
        match result {
            Ok(_) => {
                tracing::debug!(key = %key, fetch_id, attempts, "fetch succeeded");
                self.notify(key, QueryEventKind::Updated);
            }
            Err(err) => {
                metrics::counter!("ledger_cache_fetch_errors_total", "kind" => err.kind()).increment(1);
                self.shared.observer.on_fetch_error(key, err, attempts);
                self.notify(key, QueryEventKind::Failed);
            }
        }
    }

    /// Removes `key` if it has expired and nothing references it.
    fn evict_if_expired(&self, state: &mut StoreState<V>, key: &QueryKey, now: u64) {
        let expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_evictable(now));
        if expired && !self.shared.subscribers.is_observed(key) {
            state.entries.remove(key);
            self.record_eviction(key);
        }
    }

    fn record_hit(&self) {
        self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ledger_cache_hits_total").increment(1);
    }

    fn record_miss(&self) {
        self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ledger_cache_misses_total").increment(1);
    }

    fn record_eviction(&self, key: &QueryKey) {
        self.shared.stats.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ledger_cache_evictions_total").increment(1);
        self.shared.observer.on_evict(key);
        self.notify(key, QueryEventKind::Removed);
    }

    fn notify(&self, key: &QueryKey, kind: QueryEventKind) {
        // No receivers is not an error.
        let _ = self.shared.events.send(QueryEvent {
            key: key.clone(),
            kind,
        });
    }
}

/// Runs `fetcher` until it succeeds, fails permanently, or runs out of attempts.
///
/// Returns the final result and the number of attempts made.
async fn fetch_with_retry<V, F, Fut>(
    key: &QueryKey,
    fetcher: &F,
    options: &QueryOptions,
) -> (Result<V, QueryError>, u32)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<V, QueryError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match options.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetcher()).await {
                Ok(outcome) => outcome,
                #[allow(clippy::cast_possible_truncation)]
                Err(_) => Err(QueryError::timeout(limit.as_millis() as u64)),
            },
            None => fetcher().await,
        };

        match outcome {
            Ok(data) => return (Ok(data), attempt),
            Err(err) if err.is_transient() && options.retry.allows_retry_after(attempt) => {
                let delay = options.retry.delay_after(attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                tracing::debug!(key = %key, attempt, delay_ms, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use ledger_core::ManualClock;
    use tokio::sync::Notify;

    use super::*;
    use crate::observer::tests::CountingObserver;
    use crate::store::entry::QueryStatus;
    use crate::store::options::RetryPolicy;

    fn key(name: &str) -> QueryKey {
        QueryKey::new("test").with(name)
    }

    fn options() -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(Duration::from_millis(100))
            .with_gc_time(Duration::from_millis(1_000))
            .with_retry(RetryPolicy::NONE)
            .with_fetch_timeout(None)
    }

    struct Harness {
        store: QueryStore<u32>,
        clock: Arc<ManualClock>,
        observer: Arc<CountingObserver>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let observer = Arc::new(CountingObserver::default());
        let store = QueryStore::with_parts(clock.clone(), observer.clone(), 64);
        Harness {
            store,
            clock,
            observer,
        }
    }

    /// Fetcher returning `value` and counting invocations.
    fn counting(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(value) }.boxed()
        }
    }

    /// Fetcher that blocks until `gate` is notified, then returns `value`.
    fn gated(
        gate: &Arc<Notify>,
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static {
        let gate = Arc::clone(gate);
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(value)
            }
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fresh_entry_is_served_from_cache() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(h.store.read(&key("a"), counting(&calls, 1), &options()).await, Ok(1));
        assert_eq!(h.store.read(&key("a"), counting(&calls, 2), &options()).await, Ok(1));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = h.store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.fetches, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stale_entry_is_refetched() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));

        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.clock.advance(Duration::from_millis(100));
        let value = h.store.read(&key("a"), counting(&calls, 2), &options()).await;

        assert_eq!(value, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let snapshot = h.store.snapshot(&key("a")).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Success);
        assert_eq!(snapshot.stale_at, 1_200);
        assert_eq!(snapshot.evict_at, 2_200);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_fetch() {
        let h = harness();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let store = h.store.clone();
            let fetcher = gated(&gate, &calls, 7);
            tokio::spawn(async move { store.read(&key("a"), fetcher, &options()).await })
        };
        let second = {
            let store = h.store.clone();
            let fetcher = gated(&gate, &calls, 8);
            tokio::spawn(async move { store.read(&key("a"), fetcher, &options()).await })
        };
        settle().await;
        assert_eq!(h.store.snapshot(&key("a")).unwrap().status, QueryStatus::Loading);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(7));
        assert_eq!(second.await.unwrap(), Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_data_is_kept_while_revalidating() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.clock.advance(Duration::from_millis(500));

        let gate = Arc::new(Notify::new());
        assert!(h.store.prefetch(&key("a"), gated(&gate, &calls, 2), &options()));
        let snapshot = h.store.snapshot(&key("a")).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Loading);
        assert_eq!(snapshot.data, Some(1));

        gate.notify_one();
        settle().await;
        assert_eq!(h.store.get_data(&key("a")), Some(2));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_reported() {
        let h = harness();
        let err = QueryError::Server {
            status: 500,
            message: "boom".into(),
        };
        let fetch_err = err.clone();
        let result = h
            .store
            .read(
                &key("a"),
                move || {
                    let err = fetch_err.clone();
                    async move { Err::<u32, _>(err) }
                },
                &options(),
            )
            .await;

        assert_eq!(result, Err(err.clone()));
        let snapshot = h.store.snapshot(&key("a")).unwrap();
        assert_eq!(snapshot.status, QueryStatus::Error);
        assert_eq!(snapshot.error, Some(err));
        assert_eq!(h.observer.fetch_error_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(QueryError::Network("connection reset".into()))
                } else {
                    Ok(5)
                }
            }
        };
        let opts = options().with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: false,
        });

        assert_eq!(h.store.read(&key("a"), fetcher, &opts).await, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.observer.fetch_error_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_max_attempts() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(QueryError::Network("unreachable".into())) }
        };
        let opts = options().with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: true,
        });

        let result = h.store.read(&key("a"), fetcher, &opts).await;
        assert!(matches!(result, Err(QueryError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<u32, _>(QueryError::Client {
                    status: 404,
                    message: "missing".into(),
                })
            }
        };
        let opts = options().with_retry(RetryPolicy::default());

        let result = h.store.read(&key("a"), fetcher, &opts).await;
        assert!(matches!(result, Err(QueryError::Client { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_attempt_times_out_as_network_error() {
        let h = harness();
        let fetcher = || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1_u32)
        };
        let opts = options().with_fetch_timeout(Some(Duration::from_millis(250)));

        let result = h.store.read(&key("a"), fetcher, &opts).await;
        assert_eq!(result, Err(QueryError::timeout(250)));
        assert_eq!(h.store.snapshot(&key("a")).unwrap().status, QueryStatus::Error);
    }

    #[tokio::test]
    async fn cancelled_fetch_result_is_discarded() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.clock.advance(Duration::from_millis(200));

        let gate = Arc::new(Notify::new());
        assert!(h.store.prefetch(&key("a"), gated(&gate, &calls, 99), &options()));
        assert_eq!(h.store.cancel(&QueryKey::new("test")), 1);
        assert_eq!(h.store.snapshot(&key("a")).unwrap().status, QueryStatus::Success);

        gate.notify_one();
        settle().await;
        assert_eq!(h.store.get_data(&key("a")), Some(1));
    }

    #[tokio::test]
    async fn invalidate_marks_matching_entries_stale() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.store.read(&key("b"), counting(&calls, 2), &options()).await.unwrap();
        h.store
            .read(&QueryKey::new("other"), counting(&calls, 3), &options())
            .await
            .unwrap();

        assert_eq!(h.store.invalidate(&QueryKey::new("test")), 2);
        assert_eq!(h.observer.invalidate_count.load(Ordering::Relaxed), 2);
        assert_eq!(h.store.get_data(&key("a")), Some(1));

        h.store.read(&key("a"), counting(&calls, 10), &options()).await.unwrap();
        h.store
            .read(&QueryKey::new("other"), counting(&calls, 30), &options())
            .await
            .unwrap();
        assert_eq!(h.store.get_data(&key("a")), Some(10));
        assert_eq!(h.store.get_data(&QueryKey::new("other")), Some(3));
    }

    #[tokio::test]
    async fn set_data_transforms_without_touching_status() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 4), &options()).await.unwrap();

        assert_eq!(h.store.set_data(&key("a"), |v| Ok(v * 10)), Ok(true));
        assert_eq!(h.store.get_data(&key("a")), Some(40));
        assert_eq!(h.store.snapshot(&key("a")).unwrap().status, QueryStatus::Success);

        assert_eq!(h.store.set_data(&key("missing"), |v| Ok(v + 1)), Ok(false));
        let err = QueryError::Validation("nope".into());
        assert_eq!(h.store.set_data(&key("a"), |_| Err(err.clone())), Err(err));
        assert_eq!(h.store.get_data(&key("a")), Some(40));
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_lazily_and_by_sweep() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.store.read(&key("b"), counting(&calls, 2), &options()).await.unwrap();

        // stale_at = 1_100, evict_at = 2_100
        h.clock.set(2_100);
        assert_eq!(h.store.sweep(), 0);
        h.clock.set(2_101);
        assert_eq!(h.store.get_data(&key("a")), None);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.sweep(), 1);
        assert!(h.store.is_empty());
        assert_eq!(h.store.stats().evictions, 2);
        assert_eq!(h.observer.evict_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn subscribed_entries_survive_sweep() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();

        let subscription = h.store.subscribe(QueryKey::new("test"));
        h.clock.set(10_000);
        assert_eq!(h.store.sweep(), 0);
        drop(subscription);
        assert_eq!(h.store.sweep(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut subscription = h.store.subscribe(QueryKey::new("test"));

        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.store.invalidate(&key("a"));

        let kinds = [
            subscription.recv().await.unwrap().kind,
            subscription.recv().await.unwrap().kind,
            subscription.recv().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            [
                QueryEventKind::Loading,
                QueryEventKind::Updated,
                QueryEventKind::Invalidated
            ]
        );
    }

    #[tokio::test]
    async fn optimistic_patch_is_served_while_held() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();

        let snapshot = h
            .store
            .apply_optimistic(&[QueryKey::new("test")], |_, v| Ok(v + 100))
            .unwrap();
        h.clock.advance(Duration::from_millis(500));
        let value = h.store.read(&key("a"), counting(&calls, 7), &options()).await;
        assert_eq!(value, Ok(101));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.store.snapshot(&key("a")).unwrap().held);

        h.store.release_optimistic(&snapshot, true);
        assert_eq!(h.store.get_data(&key("a")), Some(1));
        assert!(!h.store.snapshot(&key("a")).unwrap().held);
    }

    #[tokio::test]
    async fn failing_patch_leaves_every_entry_untouched() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.store.read(&key("b"), counting(&calls, 2), &options()).await.unwrap();

        let result = h.store.apply_optimistic(&[QueryKey::new("test")], |k, v| {
            if *k == key("b") {
                Err(QueryError::Validation("bad patch".into()))
            } else {
                Ok(v + 1)
            }
        });

        assert!(matches!(result, Err(QueryError::Validation(_))));
        assert_eq!(h.store.get_data(&key("a")), Some(1));
        assert_eq!(h.store.get_data(&key("b")), Some(2));
        assert!(!h.store.snapshot(&key("a")).unwrap().held);
    }

    #[tokio::test]
    async fn fetch_in_flight_at_patch_time_does_not_overwrite_patch() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.clock.advance(Duration::from_millis(200));

        let gate = Arc::new(Notify::new());
        assert!(h.store.prefetch(&key("a"), gated(&gate, &calls, 99), &options()));
        let snapshot = h
            .store
            .apply_optimistic(&[QueryKey::new("test")], |_, v| Ok(v + 100))
            .unwrap();
        assert_eq!(h.store.snapshot(&key("a")).unwrap().status, QueryStatus::Success);

        gate.notify_one();
        settle().await;
        assert_eq!(h.store.get_data(&key("a")), Some(101));

        h.store.release_optimistic(&snapshot, true);
        assert_eq!(h.store.get_data(&key("a")), Some(1));
    }

    #[tokio::test]
    async fn held_entry_without_data_does_not_cache_fetch_result() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        assert!(h.store.prefetch(&key("a"), gated(&gate, &calls, 99), &options()));

        let snapshot = h
            .store
            .apply_optimistic(&[QueryKey::new("test")], |_, v| Ok(v + 1))
            .unwrap();
        assert_eq!(snapshot.entries, vec![(key("a"), None)]);

        let value = h.store.read(&key("a"), counting(&calls, 7), &options()).await;
        assert_eq!(value, Ok(7));
        let entry = h.store.snapshot(&key("a")).unwrap();
        assert_eq!(entry.data, None);
        assert_ne!(entry.status, QueryStatus::Success);

        h.store.release_optimistic(&snapshot, true);
        gate.notify_one();
        settle().await;
        let entry = h.store.snapshot(&key("a")).unwrap();
        assert_eq!(entry.data, None);
        assert_ne!(entry.status, QueryStatus::Success);
        assert!(!entry.held);
    }

    #[tokio::test]
    async fn remove_and_dispose_clear_entries() {
        let h = harness();
        let calls = Arc::new(AtomicUsize::new(0));
        h.store.read(&key("a"), counting(&calls, 1), &options()).await.unwrap();
        h.store
            .read(&QueryKey::new("other"), counting(&calls, 2), &options())
            .await
            .unwrap();

        assert_eq!(h.store.remove(&QueryKey::new("test")), 1);
        assert_eq!(h.store.len(), 1);
        h.store.dispose();
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn removed_entry_ignores_late_fetch_result() {
        let h = harness();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(h.store.prefetch(&key("a"), gated(&gate, &calls, 3), &options()));

        h.store.remove(&key("a"));
        gate.notify_one();
        settle().await;
        assert!(h.store.is_empty());
    }
}
