//! Infinite-scroll pagination: page accumulation and scroll-triggered loading.

mod accumulator;
mod sentinel;

pub use accumulator::{LoadOutcome, PageSource, PageState, PageStatus, PaginationAccumulator};
pub use sentinel::{should_load_more, ScrollSentinel, ViewportGeometry};
