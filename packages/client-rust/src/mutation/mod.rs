//! Optimistic mutations: scoped cache patches settled against a remote write.

mod event;
mod executor;
mod record;

pub use event::{MutationKind, SettledMutation};
pub use executor::{MutationExecutor, MutationScope};
pub use record::MutationRecord;
