//! Query cache: entries, options, change notifications, and the store itself.

mod entry;
mod options;
mod query_store;
mod subscription;

pub use entry::{EntrySnapshot, QueryStatus};
pub use options::{QueryOptions, RetryPolicy};
pub(crate) use query_store::Snapshot;
pub use query_store::{QueryStore, StoreStats, DEFAULT_EVENT_CAPACITY};
pub use subscription::{QueryEvent, QueryEventKind, Subscription};
