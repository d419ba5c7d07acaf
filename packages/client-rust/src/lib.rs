//! Ledger Client: query cache, optimistic mutations, and infinite-scroll pagination over the transaction service.

pub mod config;
pub mod http;
pub mod mutation;
pub mod observer;
pub mod pagination;
pub mod store;
pub mod transactions;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ClientConfig, ConfigError};
pub use http::HttpTransactionApi;
pub use mutation::{MutationExecutor, MutationKind, MutationRecord, MutationScope, SettledMutation};
pub use observer::{CacheObserver, CompositeCacheObserver, TracingObserver};
pub use pagination::{
    should_load_more, LoadOutcome, PageSource, PageState, PageStatus, PaginationAccumulator,
    ScrollSentinel, ViewportGeometry,
};
pub use store::{QueryEvent, QueryEventKind, QueryOptions, QueryStore, RetryPolicy, Subscription};
pub use transactions::{CacheValue, TransactionClient};
pub use worker::{BackgroundRunnable, BackgroundWorker, CacheGcRunnable, GcTask};
