//! Transaction queries and optimistic mutations over a shared [`QueryStore`].
//!
//! [`TransactionClient`] caches list pages under `transactions:list:{skip}:{take}`
//! and the summary under `transactions:aggregated`. Every mutation patches the
//! cached pages and summary optimistically, invalidates both on settle, and
//! publishes a [`SettledMutation`].

use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::{
    QueryError, Summary, SystemClock, Transaction, TransactionApi, TransactionKind,
    TransactionPatch,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::mutation::{MutationExecutor, MutationKind, MutationScope, SettledMutation};
use crate::observer::TracingObserver;
use crate::pagination::{PageSource, PaginationAccumulator};
use crate::store::{QueryStore, Subscription};
use crate::worker::{BackgroundWorker, CacheGcRunnable};

/// Prefix of ids assigned to records that exist only in the cache.
pub const OPTIMISTIC_ID_PREFIX: &str = "optimistic-";

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Query keys used by [`TransactionClient`].
pub mod keys {
    use ledger_core::{KeyPart, QueryKey};

    pub const NAMESPACE: &str = "transactions";

    /// Every transaction query.
    #[must_use]
    pub fn all() -> QueryKey {
        QueryKey::new(NAMESPACE)
    }

    /// Every list page.
    #[must_use]
    pub fn lists() -> QueryKey {
        all().with("list")
    }

    #[must_use]
    pub fn page(skip: usize, take: usize) -> QueryKey {
        lists().with(skip).with(take)
    }

    #[must_use]
    pub fn aggregated() -> QueryKey {
        all().with("aggregated")
    }

    /// The `skip` of a page key, or `None` for any other key.
    #[must_use]
    pub fn page_skip(key: &QueryKey) -> Option<u64> {
        if !key.starts_with(&lists()) {
            return None;
        }
        match key.parts().get(1) {
            Some(KeyPart::Int(skip)) => Some(*skip),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CacheValue
// ---------------------------------------------------------------------------

/// Value stored under a transaction key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Page(Vec<Transaction>),
    Summary(Summary),
}

impl CacheValue {
    /// # Errors
    ///
    /// Returns [`QueryError::Internal`] if the value is a summary.
    pub fn into_page(self) -> Result<Vec<Transaction>, QueryError> {
        match self {
            Self::Page(rows) => Ok(rows),
            Self::Summary(_) => Err(QueryError::Internal("expected a page, found a summary".into())),
        }
    }

    /// # Errors
    ///
    /// Returns [`QueryError::Internal`] if the value is a page.
    pub fn into_summary(self) -> Result<Summary, QueryError> {
        match self {
            Self::Summary(summary) => Ok(summary),
            Self::Page(_) => Err(QueryError::Internal("expected a summary, found a page".into())),
        }
    }
}

/// Adds (`added`) or removes one record's contribution to a summary.
fn shift_summary(summary: &Summary, record: &Transaction, added: bool) -> Summary {
    let mut next = summary.clone();
    let amount = if added { record.price } else { -record.price };
    match record.kind {
        TransactionKind::Income => next.total_income += amount,
        TransactionKind::Outcome => next.total_outcome += amount,
    }
    next.total_transactions = if added {
        next.total_transactions + 1
    } else {
        next.total_transactions.saturating_sub(1)
    };
    next
}

fn validate_fields(title: Option<&str>, price: Option<f64>) -> Result<(), QueryError> {
    if title.is_some_and(|title| title.trim().is_empty()) {
        return Err(QueryError::Validation("title must not be blank".into()));
    }
    if price.is_some_and(|price| !price.is_finite() || price < 0.0) {
        return Err(QueryError::Validation("price must be a non-negative number".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TransactionClient
// ---------------------------------------------------------------------------

/// Cached, optimistic access to the transaction service.
#[derive(Clone)]
pub struct TransactionClient {
    api: Arc<dyn TransactionApi>,
    store: QueryStore<CacheValue>,
    executor: MutationExecutor<CacheValue>,
    config: ClientConfig,
    settled: broadcast::Sender<SettledMutation>,
}

impl TransactionClient {
    /// Creates a client with its own store on the system clock.
    #[must_use]
    pub fn new(api: Arc<dyn TransactionApi>, config: ClientConfig) -> Self {
        let store = QueryStore::with_parts(
            Arc::new(SystemClock),
            Arc::new(TracingObserver),
            config.event_capacity,
        );
        Self::with_store(api, config, store)
    }

    /// Creates a client over an existing store.
    #[must_use]
    pub fn with_store(api: Arc<dyn TransactionApi>, config: ClientConfig, store: QueryStore<CacheValue>) -> Self {
        let (settled, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            api,
            executor: MutationExecutor::new(store.clone()),
            store,
            config,
            settled,
        }
    }

    #[must_use]
    pub fn store(&self) -> &QueryStore<CacheValue> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -- Queries ------------------------------------------------------------

    /// One page of transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns the fetch error after retries are exhausted.
    pub async fn list(&self, skip: usize, take: usize) -> Result<Vec<Transaction>, QueryError> {
        let api = Arc::clone(&self.api);
        self.store
            .read(
                &keys::page(skip, take),
                move || {
                    let api = Arc::clone(&api);
                    async move { api.list(skip, take).await.map(CacheValue::Page) }
                },
                &self.config.list_options,
            )
            .await?
            .into_page()
    }

    /// Totals across every transaction.
    ///
    /// # Errors
    ///
    /// Returns the fetch error after retries are exhausted.
    pub async fn aggregate(&self) -> Result<Summary, QueryError> {
        let api = Arc::clone(&self.api);
        self.store
            .read(
                &keys::aggregated(),
                move || {
                    let api = Arc::clone(&api);
                    async move { api.aggregate().await.map(CacheValue::Summary) }
                },
                &self.config.aggregate_options,
            )
            .await?
            .into_summary()
    }

    /// Starts loading a page in the background. Returns `false` if it is
    /// already fresh.
    pub fn prefetch_list(&self, skip: usize, take: usize) -> bool {
        let api = Arc::clone(&self.api);
        self.store.prefetch(
            &keys::page(skip, take),
            move || {
                let api = Arc::clone(&api);
                async move { api.list(skip, take).await.map(CacheValue::Page) }
            },
            &self.config.list_options,
        )
    }

    /// A page as currently cached, without fetching.
    #[must_use]
    pub fn cached_page(&self, skip: usize, take: usize) -> Option<Vec<Transaction>> {
        self.store
            .get_data(&keys::page(skip, take))
            .and_then(|value| value.into_page().ok())
    }

    /// The summary as currently cached, without fetching.
    #[must_use]
    pub fn cached_summary(&self) -> Option<Summary> {
        self.store
            .get_data(&keys::aggregated())
            .and_then(|value| value.into_summary().ok())
    }

    /// First cached record with `id`, searching pages in key order.
    #[must_use]
    pub fn find_cached(&self, id: &str) -> Option<Transaction> {
        self.store
            .entries_matching(&keys::lists())
            .into_iter()
            .filter_map(|entry| match entry.data {
                Some(CacheValue::Page(rows)) => Some(rows),
                _ => None,
            })
            .flatten()
            .find(|record| record.has_id(id))
    }

    /// Drops every cached transaction query. Returns the number removed.
    pub fn clear_cache(&self) -> usize {
        self.store.remove(&keys::all())
    }

    /// Cancels all fetches and empties the cache.
    pub fn dispose(&self) {
        self.store.dispose();
    }

    /// Change events for every cached list page.
    #[must_use]
    pub fn subscribe_lists(&self) -> Subscription {
        self.store.subscribe(keys::lists())
    }

    /// Settlement events for every mutation made through this client.
    #[must_use]
    pub fn settled_mutations(&self) -> broadcast::Receiver<SettledMutation> {
        self.settled.subscribe()
    }

    /// Accumulator over this client's list pages using the configured page size.
    #[must_use]
    pub fn paginate(self: &Arc<Self>) -> PaginationAccumulator<Self> {
        PaginationAccumulator::new(Arc::clone(self), self.config.page_size)
    }

    /// Starts the periodic cache sweep.
    #[must_use]
    pub fn start_gc(&self) -> BackgroundWorker<CacheGcRunnable<CacheValue>> {
        BackgroundWorker::start(CacheGcRunnable::new(self.store.clone()), self.config.gc_interval())
    }

    // -- Mutations ----------------------------------------------------------

    /// Creates a record, showing it at the top of the first page until the
    /// server answers.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Validation`] for a blank title or invalid price
    /// without contacting the server, otherwise the server's error after the
    /// cache has been rolled back.
    pub async fn create(&self, transaction: Transaction) -> Result<Transaction, QueryError> {
        self.validate(MutationKind::Create, Some(transaction.title.as_str()), Some(transaction.price))?;

        let provisional = match &transaction.id {
            Some(_) => transaction.clone(),
            None => transaction
                .clone()
                .with_id(format!("{OPTIMISTIC_ID_PREFIX}{}", Uuid::new_v4())),
        };
        let scope = MutationScope::new(MutationKind::Create.as_str())
            .affects(keys::lists())
            .affects(keys::aggregated());
        let api = Arc::clone(&self.api);

        let result = self
            .executor
            .execute(
                move || async move { api.create(&transaction).await },
                &scope,
                move |key, value| {
                    Ok(match value {
                        CacheValue::Page(rows) if keys::page_skip(key) == Some(0) => {
                            let mut next = Vec::with_capacity(rows.len() + 1);
                            next.push(provisional.clone());
                            next.extend(rows.iter().cloned());
                            CacheValue::Page(next)
                        }
                        CacheValue::Summary(summary) => {
                            CacheValue::Summary(shift_summary(summary, &provisional, true))
                        }
                        other => other.clone(),
                    })
                },
            )
            .await;
        self.publish(MutationKind::Create, result.is_ok());
        result
    }

    /// Applies `patch` to record `id` in every cached page and the summary.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Validation`] for a provisional `id`, a blank
    /// title or an invalid price without contacting the server, otherwise the
    /// server's error after the cache has been rolled back.
    pub async fn update(&self, id: &str, patch: TransactionPatch) -> Result<Transaction, QueryError> {
        self.validate_target(MutationKind::Update, id)?;
        self.validate(MutationKind::Update, patch.title.as_deref(), patch.price)?;

        let previous = self.find_cached(id);
        let scope = MutationScope::new(MutationKind::Update.as_str())
            .affects(keys::lists())
            .affects(keys::aggregated());
        let api = Arc::clone(&self.api);
        let remote_id = id.to_string();
        let remote_patch = patch.clone();
        let target = id.to_string();

        let result = self
            .executor
            .execute(
                move || async move { api.update(&remote_id, &remote_patch).await },
                &scope,
                move |_, value| {
                    Ok(match value {
                        CacheValue::Page(rows) => CacheValue::Page(
                            rows.iter()
                                .map(|row| if row.has_id(&target) { row.merged(&patch) } else { row.clone() })
                                .collect(),
                        ),
                        CacheValue::Summary(summary) => match &previous {
                            Some(before) => {
                                let removed = shift_summary(summary, before, false);
                                CacheValue::Summary(shift_summary(&removed, &before.merged(&patch), true))
                            }
                            None => CacheValue::Summary(summary.clone()),
                        },
                    })
                },
            )
            .await;
        self.publish(MutationKind::Update, result.is_ok());
        result
    }

    /// Removes record `id` from every cached page and the summary.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Validation`] for a provisional `id` without
    /// contacting the server, otherwise the server's error after the cache
    /// has been rolled back.
    pub async fn delete(&self, id: &str) -> Result<(), QueryError> {
        self.validate_target(MutationKind::Delete, id)?;
        let previous = self.find_cached(id);
        let scope = MutationScope::new(MutationKind::Delete.as_str())
            .affects(keys::lists())
            .affects(keys::aggregated());
        let api = Arc::clone(&self.api);
        let remote_id = id.to_string();
        let target = id.to_string();

        let result = self
            .executor
            .execute(
                move || async move { api.delete(&remote_id).await },
                &scope,
                move |_, value| {
                    Ok(match value {
                        CacheValue::Page(rows) => {
                            CacheValue::Page(rows.iter().filter(|row| !row.has_id(&target)).cloned().collect())
                        }
                        CacheValue::Summary(summary) => match &previous {
                            Some(before) => CacheValue::Summary(shift_summary(summary, before, false)),
                            None => CacheValue::Summary(summary.clone()),
                        },
                    })
                },
            )
            .await;
        self.publish(MutationKind::Delete, result.is_ok());
        result
    }

    fn validate(&self, kind: MutationKind, title: Option<&str>, price: Option<f64>) -> Result<(), QueryError> {
        validate_fields(title, price).inspect_err(|err| {
            self.store.observer().on_mutation_error(kind.as_str(), err);
        })
    }

    /// Rejects ids the server has not assigned yet.
    fn validate_target(&self, kind: MutationKind, id: &str) -> Result<(), QueryError> {
        if !id.starts_with(OPTIMISTIC_ID_PREFIX) {
            return Ok(());
        }
        let err = QueryError::Validation(format!("record {id} is still being created"));
        self.store.observer().on_mutation_error(kind.as_str(), &err);
        Err(err)
    }

    fn publish(&self, kind: MutationKind, succeeded: bool) {
        // No receivers is not an error.
        let _ = self.settled.send(SettledMutation { kind, succeeded });
    }
}

#[async_trait]
impl PageSource for TransactionClient {
    type Item = Transaction;

    async fn fetch_page(&self, skip: usize, take: usize) -> Result<Vec<Transaction>, QueryError> {
        self.list(skip, take).await
    }

    fn cached_page(&self, skip: usize, take: usize) -> Option<Vec<Transaction>> {
        Self::cached_page(self, skip, take)
    }
}

/// Returns `true` if `record` exists only in the cache.
#[must_use]
pub fn is_provisional(record: &Transaction) -> bool {
    record
        .id
        .as_deref()
        .is_some_and(|id| id.starts_with(OPTIMISTIC_ID_PREFIX))
}
