//! Ledger Core: transaction records, query keys, error taxonomy, and the remote API trait.

pub mod api;
pub mod clock;
pub mod error;
pub mod key;
pub mod transaction;

pub use api::TransactionApi;
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use error::QueryError;
pub use key::{KeyPart, QueryKey};
pub use transaction::{Summary, Transaction, TransactionKind, TransactionPatch};
