//! Optimistic-update transaction: snapshot, patch, then commit or roll back.

use ledger_core::QueryKey;

use crate::store::{QueryStore, Snapshot};

/// Open optimistic update against a [`QueryStore`].
///
/// Created by [`MutationExecutor::begin`](super::MutationExecutor::begin),
/// which has already applied the patch. Settling consumes the record:
/// [`commit`](Self::commit) keeps the patched data, [`rollback`](Self::rollback)
/// restores the snapshot. Either way the invalidation prefixes are then
/// marked stale. Dropping an unsettled record rolls it back.
///
/// When records overlap on a key, a rollback leaves data patched by a newer
/// unsettled record in place; the key returns to this record's snapshot
/// once the newer record rolls back too.
#[must_use = "an unsettled mutation record rolls back when dropped"]
pub struct MutationRecord<V: Clone + Send + Sync + 'static> {
    store: QueryStore<V>,
    name: String,
    snapshot: Snapshot<V>,
    invalidate: Vec<QueryKey>,
    settled: bool,
}

impl<V: Clone + Send + Sync + 'static> MutationRecord<V> {
    pub(crate) fn new(
        store: QueryStore<V>,
        name: String,
        snapshot: Snapshot<V>,
        invalidate: Vec<QueryKey>,
    ) -> Self {
        Self {
            store,
            name,
            snapshot,
            invalidate,
            settled: false,
        }
    }

    /// Name the mutation was started with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concrete keys that were held and snapshotted.
    pub fn affected_keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.snapshot.entries.iter().map(|(key, _)| key)
    }

    /// Data `key` had before the patch. `None` if `key` was not affected;
    /// `Some(None)` if it was affected but had no data.
    #[must_use]
    pub fn snapshot_of(&self, key: &QueryKey) -> Option<&Option<V>> {
        self.snapshot
            .entries
            .iter()
            .find(|(affected, _)| affected == key)
            .map(|(_, before)| before)
    }

    /// Keeps the optimistic data and invalidates.
    pub fn commit(mut self) {
        self.settle(false);
    }

    /// Restores every affected key to its snapshot and invalidates.
    pub fn rollback(mut self) {
        self.settle(true);
    }

    fn settle(&mut self, rollback: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.store.release_optimistic(&self.snapshot, rollback);
        for prefix in &self.invalidate {
            self.store.invalidate(prefix);
        }
        if rollback {
            metrics::counter!("ledger_mutation_rollbacks_total").increment(1);
            tracing::debug!(mutation = %self.name, keys = self.snapshot.entries.len(), "mutation rolled back");
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for MutationRecord<V> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(mutation = %self.name, "mutation dropped before settling; rolling back");
            self.settle(true);
        }
    }
}
