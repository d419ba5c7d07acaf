use async_trait::async_trait;

use crate::error::QueryError;
use crate::transaction::{Summary, Transaction, TransactionPatch};

/// Remote collaborator that owns the authoritative transaction records.
///
/// Implementations: HTTP (`ledger-client`), in-memory fake (tests).
/// Used as `Arc<dyn TransactionApi>`.
#[async_trait]
pub trait TransactionApi: Send + Sync {
    /// Fetch up to `take` records starting at offset `skip`, in server order.
    async fn list(&self, skip: usize, take: usize) -> Result<Vec<Transaction>, QueryError>;

    /// Fetch totals across all records.
    async fn aggregate(&self) -> Result<Summary, QueryError>;

    /// Create a record. The input has no id; the returned record does.
    async fn create(&self, transaction: &Transaction) -> Result<Transaction, QueryError>;

    /// Apply a partial update and return the stored record.
    async fn update(&self, id: &str, patch: &TransactionPatch) -> Result<Transaction, QueryError>;

    /// Delete a record by id.
    async fn delete(&self, id: &str) -> Result<(), QueryError>;
}
