//! In-memory [`TransactionApi`] for tests.
//!
//! [`FakeTransactionApi`] keeps records in a `Vec`, counts calls per
//! operation, can fail the next call of an operation, and can hold calls in
//! flight until released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ledger_core::{
    QueryError, Summary, Transaction, TransactionApi, TransactionKind, TransactionPatch,
};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Operation of the remote API, used to target counters and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOp {
    List,
    Aggregate,
    Create,
    Update,
    Delete,
}

/// Scriptable in-memory transaction service.
pub struct FakeTransactionApi {
    records: Mutex<Vec<Transaction>>,
    calls: Mutex<HashMap<ApiOp, usize>>,
    failures: Mutex<HashMap<ApiOp, Vec<QueryError>>>,
    next_id: AtomicU64,
    held: watch::Sender<bool>,
}

impl Default for FakeTransactionApi {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FakeTransactionApi {
    /// Creates a service holding `records`, newest first.
    #[must_use]
    pub fn new(records: Vec<Transaction>) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            records: Mutex::new(records),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            held,
        }
    }

    /// Creates a service with `count` records `t1..=tN`, each an outcome
    /// priced at ten times its index.
    #[must_use]
    pub fn seeded(count: usize) -> Self {
        let records = (1..=count)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let price = (i * 10) as f64;
                Transaction::new(format!("Item {i}"), price, "misc", TransactionKind::Outcome)
                    .with_id(format!("t{i}"))
            })
            .collect();
        Self::new(records)
    }

    /// Number of calls made to `op` so far.
    #[must_use]
    pub fn calls(&self, op: ApiOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Makes the next call to `op` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: ApiOp, error: QueryError) {
        self.failures.lock().entry(op).or_default().push(error);
    }

    /// Holds every subsequent call until [`release`](Self::release).
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    /// Lets held and future calls proceed.
    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Copy of the records currently stored.
    #[must_use]
    pub fn records(&self) -> Vec<Transaction> {
        self.records.lock().clone()
    }

    async fn enter(&self, op: ApiOp) -> Result<(), QueryError> {
        *self.calls.lock().entry(op).or_default() += 1;
        let mut held = self.held.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = held.wait_for(|is_held| !*is_held).await;
        let failure = {
            let mut failures = self.failures.lock();
            failures
                .get_mut(&op)
                .and_then(|queued| (!queued.is_empty()).then(|| queued.remove(0)))
        };
        failure.map_or(Ok(()), Err)
    }

    fn not_found(id: &str) -> QueryError {
        QueryError::Client {
            status: 404,
            message: format!("transaction {id} not found"),
        }
    }
}

#[async_trait]
impl TransactionApi for FakeTransactionApi {
    async fn list(&self, skip: usize, take: usize) -> Result<Vec<Transaction>, QueryError> {
        self.enter(ApiOp::List).await?;
        Ok(self.records.lock().iter().skip(skip).take(take).cloned().collect())
    }

    async fn aggregate(&self) -> Result<Summary, QueryError> {
        self.enter(ApiOp::Aggregate).await?;
        let records = self.records.lock();
        let mut summary = Summary::default();
        for record in records.iter() {
            match record.kind {
                TransactionKind::Income => summary.total_income += record.price,
                TransactionKind::Outcome => summary.total_outcome += record.price,
            }
        }
        summary.total_transactions = records.len() as u64;
        Ok(summary)
    }

    async fn create(&self, transaction: &Transaction) -> Result<Transaction, QueryError> {
        self.enter(ApiOp::Create).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let created = transaction.clone().with_id(format!("srv-{id}"));
        self.records.lock().insert(0, created.clone());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: &TransactionPatch) -> Result<Transaction, QueryError> {
        self.enter(ApiOp::Update).await?;
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|record| record.has_id(id))
            .ok_or_else(|| Self::not_found(id))?;
        *record = record.merged(patch);
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), QueryError> {
        self.enter(ApiOp::Delete).await?;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| !record.has_id(id));
        if records.len() == before {
            return Err(Self::not_found(id));
        }
        Ok(())
    }
}
