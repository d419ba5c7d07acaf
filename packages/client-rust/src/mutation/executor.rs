//! Runs remote writes with an optimistic cache patch around them.

use std::future::Future;

use ledger_core::{QueryError, QueryKey};

use super::record::MutationRecord;
use crate::store::QueryStore;

/// Which cache entries a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationScope {
    /// Label used in logs and observer callbacks.
    pub name: String,
    /// Prefixes whose entries are detached from in-flight reads, snapshotted, and patched.
    pub affected: Vec<QueryKey>,
    /// Prefixes invalidated on settle in addition to `affected`, such as an
    /// aggregate computed from the affected rows.
    pub derived: Vec<QueryKey>,
}

impl MutationScope {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affected: Vec::new(),
            derived: Vec::new(),
        }
    }

    /// Adds an affected prefix (builder style).
    #[must_use]
    pub fn affects(mut self, prefix: QueryKey) -> Self {
        self.affected.push(prefix);
        self
    }

    /// Adds a derived prefix (builder style).
    #[must_use]
    pub fn derives(mut self, prefix: QueryKey) -> Self {
        self.derived.push(prefix);
        self
    }

    fn invalidation_prefixes(&self) -> Vec<QueryKey> {
        let mut prefixes = self.affected.clone();
        for prefix in &self.derived {
            if !prefixes.contains(prefix) {
                prefixes.push(prefix.clone());
            }
        }
        prefixes
    }
}

/// Applies optimistic writes to a [`QueryStore`] and reconciles them with the
/// remote outcome.
///
/// Never retries: a failed write is rolled back and its error returned.
pub struct MutationExecutor<V> {
    store: QueryStore<V>,
}

impl<V> Clone for MutationExecutor<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> MutationExecutor<V> {
    #[must_use]
    pub fn new(store: QueryStore<V>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &QueryStore<V> {
        &self.store
    }

    /// Detaches in-flight reads under the affected prefixes, then snapshots and
    /// patches every matching entry, all in one step.
    ///
    /// # Errors
    ///
    /// Returns the patch's error (normally [`QueryError::Validation`]); the
    /// cache is left unpatched and no record is opened.
    pub fn begin<P>(&self, scope: &MutationScope, patch: P) -> Result<MutationRecord<V>, QueryError>
    where
        P: Fn(&QueryKey, &V) -> Result<V, QueryError>,
    {
        let snapshot = self.store.apply_optimistic(&scope.affected, patch)?;
        tracing::debug!(mutation = %scope.name, keys = snapshot.entries.len(), "optimistic patch applied");
        Ok(MutationRecord::new(
            self.store.clone(),
            scope.name.clone(),
            snapshot,
            scope.invalidation_prefixes(),
        ))
    }

    /// Patches the cache, awaits `remote_call`, then commits or rolls back.
    ///
    /// Affected and derived entries are invalidated only after the remote call
    /// settles. If the returned future is dropped before that, the patch is
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns the patch error without calling the remote, or the remote
    /// call's error after rolling back.
    pub async fn execute<R, Fut, T, P>(
        &self,
        remote_call: R,
        scope: &MutationScope,
        patch: P,
    ) -> Result<T, QueryError>
    where
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
        P: Fn(&QueryKey, &V) -> Result<V, QueryError>,
    {
        let observer = self.store.observer();
        let record = match self.begin(scope, patch) {
            Ok(record) => record,
            Err(err) => {
                observer.on_mutation_error(&scope.name, &err);
                return Err(err);
            }
        };

        match remote_call().await {
            Ok(value) => {
                record.commit();
                metrics::counter!("ledger_mutations_total", "outcome" => "committed").increment(1);
                observer.on_mutation_settled(&scope.name, true);
                Ok(value)
            }
            Err(err) => {
                observer.on_mutation_error(&scope.name, &err);
                record.rollback();
                metrics::counter!("ledger_mutations_total", "outcome" => "rolled_back").increment(1);
                observer.on_mutation_settled(&scope.name, false);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use ledger_core::{ClockSource, ManualClock};
    use tokio::sync::Notify;

    use super::*;
    use crate::observer::tests::CountingObserver;
    use crate::store::{QueryOptions, RetryPolicy};

    fn row(n: u64) -> QueryKey {
        QueryKey::new("rows").with("page").with(n)
    }

    fn total() -> QueryKey {
        QueryKey::new("rows").with("total")
    }

    fn options() -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(Duration::from_secs(60))
            .with_retry(RetryPolicy::NONE)
            .with_fetch_timeout(None)
    }

    struct Harness {
        store: QueryStore<u32>,
        executor: MutationExecutor<u32>,
        clock: Arc<ManualClock>,
        observer: Arc<CountingObserver>,
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let observer = Arc::new(CountingObserver::default());
        let store = QueryStore::with_parts(clock.clone(), observer.clone(), 64);
        for (n, value) in [(0, 100), (1, 200)] {
            store.read(&row(n), move || async move { Ok(value) }, &options()).await.unwrap();
        }
        store.read(&total(), || async { Ok(300) }, &options()).await.unwrap();
        Harness {
            executor: MutationExecutor::new(store.clone()),
            store,
            clock,
            observer,
        }
    }

    fn scope() -> MutationScope {
        MutationScope::new("reprice")
            .affects(QueryKey::new("rows").with("page"))
            .derives(total())
    }

    #[tokio::test]
    async fn success_keeps_patch_and_invalidates_after_settle() {
        let h = harness().await;
        let result = h
            .executor
            .execute(|| async { Ok("saved") }, &scope(), |_, v| Ok(v + 50))
            .await;

        assert_eq!(result, Ok("saved"));
        let now = h.clock.now();
        for (key, expected) in [(row(0), 150), (row(1), 250), (total(), 300)] {
            let snapshot = h.store.snapshot(&key).unwrap();
            assert_eq!(snapshot.data, Some(expected));
            assert!(snapshot.is_stale(now), "{key} should be stale");
        }
        assert_eq!(h.observer.settled_count.load(Ordering::Relaxed), 1);
        assert_eq!(h.observer.mutation_error_count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn failure_restores_snapshot_exactly() {
        let h = harness().await;
        let err = QueryError::Server {
            status: 500,
            message: "write failed".into(),
        };
        let remote_err = err.clone();
        let result: Result<(), _> = h
            .executor
            .execute(|| async move { Err(remote_err) }, &scope(), |_, v| Ok(v + 50))
            .await;

        assert_eq!(result, Err(err));
        let now = h.clock.now();
        for (key, expected) in [(row(0), 100), (row(1), 200)] {
            let snapshot = h.store.snapshot(&key).unwrap();
            assert_eq!(snapshot.data, Some(expected));
            assert!(snapshot.is_stale(now));
            assert!(!snapshot.held);
        }
        assert_eq!(h.observer.mutation_error_count.load(Ordering::Relaxed), 1);
        assert_eq!(h.observer.settled_count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn optimistic_value_is_visible_before_settle() {
        let h = harness().await;
        let gate = Arc::new(Notify::new());
        let remote_gate = Arc::clone(&gate);

        let executor = h.executor.clone();
        let mutation = tokio::spawn(async move {
            executor
                .execute(
                    || async move {
                        remote_gate.notified().await;
                        Ok(())
                    },
                    &scope(),
                    |_, v| Ok(v + 1),
                )
                .await
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fetches);
        let seen = h
            .store
            .read(
                &row(0),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(0) }
                },
                &options(),
            )
            .await;
        assert_eq!(seen, Ok(101));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(!h.store.snapshot(&total()).unwrap().is_stale(h.clock.now()));

        gate.notify_one();
        assert_eq!(mutation.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn invalid_patch_skips_remote_call() {
        let h = harness().await;
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);

        let result = h
            .executor
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                &scope(),
                |key, v| {
                    if *key == row(1) {
                        Err(QueryError::Validation("negative price".into()))
                    } else {
                        Ok(v + 1)
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(QueryError::Validation(_))));
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get_data(&row(0)), Some(100));
        assert!(!h.store.snapshot(&row(0)).unwrap().is_stale(h.clock.now()));
    }

    #[tokio::test]
    async fn in_flight_read_is_detached_before_patch() {
        let h = harness().await;
        h.clock.advance(Duration::from_secs(120));

        let gate = Arc::new(Notify::new());
        let fetch_gate = Arc::clone(&gate);
        assert!(h.store.prefetch(
            &row(0),
            move || {
                let gate = Arc::clone(&fetch_gate);
                async move {
                    gate.notified().await;
                    Ok(999)
                }
            },
            &options(),
        ));

        h.executor
            .execute(|| async { Ok(()) }, &scope(), |_, v| Ok(v + 1))
            .await
            .unwrap();
        gate.notify_one();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.get_data(&row(0)), Some(101));
    }

    #[tokio::test]
    async fn dropped_mutation_future_rolls_back() {
        let h = harness().await;
        let scope = scope();
        let pending = h.executor.execute(
            || std::future::pending::<Result<(), QueryError>>(),
            &scope,
            |_, v| Ok(v + 1),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(h.store.get_data(&row(0)), Some(100));
        assert!(!h.store.snapshot(&row(0)).unwrap().held);
    }

    #[tokio::test]
    async fn overlapping_rollbacks_oldest_first_restore_server_value() {
        let h = harness().await;
        let scope = MutationScope::new("bump").affects(row(0));
        let first = h.executor.begin(&scope, |_, v| Ok(v + 50)).unwrap();
        let second = h.executor.begin(&scope, |_, v| Ok(v + 1000)).unwrap();
        assert_eq!(h.store.get_data(&row(0)), Some(1150));

        first.rollback();
        assert_eq!(h.store.get_data(&row(0)), Some(1150));
        second.rollback();
        assert_eq!(h.store.get_data(&row(0)), Some(100));
        assert!(!h.store.snapshot(&row(0)).unwrap().held);
    }

    #[tokio::test]
    async fn overlapping_rollbacks_newest_first_restore_server_value() {
        let h = harness().await;
        let scope = MutationScope::new("bump").affects(row(0));
        let first = h.executor.begin(&scope, |_, v| Ok(v + 50)).unwrap();
        let second = h.executor.begin(&scope, |_, v| Ok(v + 1000)).unwrap();

        second.rollback();
        assert_eq!(h.store.get_data(&row(0)), Some(150));
        first.rollback();
        assert_eq!(h.store.get_data(&row(0)), Some(100));
    }

    #[tokio::test]
    async fn older_rollback_under_newer_commit_keeps_committed_patch() {
        let h = harness().await;
        let scope = MutationScope::new("bump").affects(row(0));
        let first = h.executor.begin(&scope, |_, v| Ok(v + 50)).unwrap();
        let second = h.executor.begin(&scope, |_, v| Ok(v + 1000)).unwrap();

        first.rollback();
        second.commit();
        assert_eq!(h.store.get_data(&row(0)), Some(1150));
        let snapshot = h.store.snapshot(&row(0)).unwrap();
        assert!(!snapshot.held);
        assert!(snapshot.is_stale(h.clock.now()));
    }

    #[test]
    fn derived_prefixes_are_deduplicated() {
        let scope = MutationScope::new("x").affects(total()).derives(total());
        assert_eq!(scope.invalidation_prefixes(), vec![total()]);
    }
}
