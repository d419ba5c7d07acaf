//! Infinite-scroll accumulator over skip/take pages.
//!
//! [`PaginationAccumulator`] concatenates successive pages from a
//! [`PageSource`] into one list. At most one load is in flight at a time;
//! `is_loading_more` is the only guard. A reset bumps an epoch so that a load
//! started before the reset cannot write into the fresh list.

use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::QueryError;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::mutation::SettledMutation;
use crate::store::{QueryEventKind, Subscription};

// ---------------------------------------------------------------------------
// PageSource
// ---------------------------------------------------------------------------

/// Where pages come from.
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Loads `take` items starting at `skip`. May serve from cache.
    async fn fetch_page(&self, skip: usize, take: usize) -> Result<Vec<Self::Item>, QueryError>;

    /// The page as currently cached, without fetching.
    fn cached_page(&self, skip: usize, take: usize) -> Option<Vec<Self::Item>>;
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Accumulated list and paging cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct PageState<T> {
    pub items: Vec<T>,
    /// Offset of the next page to request.
    pub cursor: usize,
    pub page_size: usize,
    /// `false` once a page came back shorter than `page_size`.
    pub has_more: bool,
    pub is_loading_more: bool,
}

impl<T> PageState<T> {
    fn empty(page_size: usize) -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
            page_size,
            has_more: true,
            is_loading_more: false,
        }
    }
}

/// Loading flags consumed by the scroll sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStatus {
    pub has_more: bool,
    /// The first page is loading and nothing is shown yet.
    pub is_initial_loading: bool,
    pub is_loading_more: bool,
}

/// Result of a [`PaginationAccumulator::load_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page with this many items was applied.
    Loaded(usize),
    /// Nothing was requested: a load is already running or no pages remain.
    Skipped,
    /// The page arrived after a reset and was dropped.
    Discarded,
}

/// A page that contributed to `items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    skip: usize,
    len: usize,
}

struct Inner<T> {
    state: PageState<T>,
    epoch: u64,
    segments: Vec<Segment>,
    last_error: Option<QueryError>,
}

struct AccumulatorShared<S: PageSource> {
    source: Arc<S>,
    inner: Mutex<Inner<S::Item>>,
}

/// Clears `is_loading_more` if a load is abandoned before it settles.
struct LoadGuard<'a, S: PageSource> {
    shared: &'a AccumulatorShared<S>,
    epoch: u64,
    armed: bool,
}

impl<S: PageSource> Drop for LoadGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.inner.lock();
            if inner.epoch == self.epoch {
                inner.state.is_loading_more = false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PaginationAccumulator
// ---------------------------------------------------------------------------

/// Accumulates pages from a [`PageSource`] into one growing list.
///
/// Cloning yields another handle to the same list.
pub struct PaginationAccumulator<S: PageSource> {
    shared: Arc<AccumulatorShared<S>>,
}

impl<S: PageSource> Clone for PaginationAccumulator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: PageSource> PaginationAccumulator<S> {
    /// Creates an empty accumulator. A `page_size` of 0 is treated as 1.
    #[must_use]
    pub fn new(source: Arc<S>, page_size: usize) -> Self {
        Self {
            shared: Arc::new(AccumulatorShared {
                source,
                inner: Mutex::new(Inner {
                    state: PageState::empty(page_size.max(1)),
                    epoch: 0,
                    segments: Vec::new(),
                    last_error: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> PageState<S::Item> {
        self.shared.inner.lock().state.clone()
    }

    #[must_use]
    pub fn items(&self) -> Vec<S::Item> {
        self.shared.inner.lock().state.items.clone()
    }

    #[must_use]
    pub fn status(&self) -> PageStatus {
        let inner = self.shared.inner.lock();
        let state = &inner.state;
        PageStatus {
            has_more: state.has_more,
            is_initial_loading: state.is_loading_more && state.cursor == 0,
            is_loading_more: state.is_loading_more,
        }
    }

    /// Error of the most recent failed load, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<QueryError> {
        self.shared.inner.lock().last_error.clone()
    }

    #[must_use]
    pub fn source(&self) -> &Arc<S> {
        &self.shared.source
    }

    /// Loads the page at the cursor and applies it.
    ///
    /// A page requested at cursor 0 replaces the list; later pages append.
    /// The cursor advances by the number of items returned, and `has_more`
    /// becomes `false` once a page is shorter than `page_size`.
    ///
    /// # Errors
    ///
    /// Returns the page source's error. Items and cursor are left unchanged.
    pub async fn load_next(&self) -> Result<LoadOutcome, QueryError> {
        let (epoch, skip, take) = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_loading_more || !inner.state.has_more {
                return Ok(LoadOutcome::Skipped);
            }
            inner.state.is_loading_more = true;
            (inner.epoch, inner.state.cursor, inner.state.page_size)
        };
        let mut guard = LoadGuard {
            shared: &self.shared,
            epoch,
            armed: true,
        };

        let result = self.shared.source.fetch_page(skip, take).await;

        guard.armed = false;
        let mut inner = self.shared.inner.lock();
        if inner.epoch != epoch {
            tracing::debug!(skip, "discarding page loaded before reset");
            return Ok(LoadOutcome::Discarded);
        }
        inner.state.is_loading_more = false;

        match result {
            Ok(page) => {
                let len = page.len();
                if skip == 0 {
                    inner.state.items = page;
                    inner.segments.clear();
                } else {
                    inner.state.items.extend(page);
                }
                inner.segments.push(Segment { skip, len });
                inner.state.has_more = len == take;
                inner.state.cursor = skip + len;
                inner.last_error = None;
                tracing::trace!(skip, len, total = inner.state.items.len(), "page applied");
                Ok(LoadOutcome::Loaded(len))
            }
            Err(err) => {
                tracing::debug!(skip, error = %err, "page load failed");
                inner.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Empties the list, rewinds the cursor, and loads the first page.
    ///
    /// Any load still running from before the reset is discarded when it
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns the first page's error.
    pub async fn reset(&self) -> Result<LoadOutcome, QueryError> {
        {
            let mut inner = self.shared.inner.lock();
            inner.epoch += 1;
            let page_size = inner.state.page_size;
            inner.state = PageState::empty(page_size);
            inner.segments.clear();
            inner.last_error = None;
        }
        tracing::debug!("pagination reset");
        self.load_next().await
    }

    /// Resets after a create or delete settles, whether or not it succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first page's error when a reset happened.
    pub async fn on_mutation_settled(&self, event: &SettledMutation) -> Result<LoadOutcome, QueryError> {
        if event.kind.resets_pagination() {
            self.reset().await
        } else {
            Ok(LoadOutcome::Skipped)
        }
    }

    /// Rebuilds `items` from the cached copies of every loaded page.
    ///
    /// Picks up cache patches such as an optimistic update. Returns `false`
    /// without changing anything if a page is no longer cached, a load or
    /// reset intervened, or the rebuilt list would be shorter than the
    /// current one.
    pub fn sync_from_cache(&self) -> bool {
        let (epoch, page_size, segments) = {
            let inner = self.shared.inner.lock();
            (inner.epoch, inner.state.page_size, inner.segments.clone())
        };
        if segments.is_empty() {
            return false;
        }

        let mut items = Vec::new();
        for segment in &segments {
            match self.shared.source.cached_page(segment.skip, page_size) {
                Some(page) => items.extend(page),
                None => return false,
            }
        }

        let mut inner = self.shared.inner.lock();
        if inner.epoch != epoch || inner.segments != segments || items.len() < inner.state.items.len() {
            return false;
        }
        inner.state.items = items;
        true
    }

    /// Spawns a task that keeps the list in step with the cache.
    ///
    /// Cache updates under the subscription's prefix trigger
    /// [`sync_from_cache`](Self::sync_from_cache); settled mutations go
    /// through [`on_mutation_settled`](Self::on_mutation_settled). The task
    /// ends when either channel closes.
    pub fn spawn_follower(
        &self,
        mut updates: Subscription,
        mut settled: broadcast::Receiver<SettledMutation>,
    ) -> JoinHandle<()> {
        let accumulator = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = updates.recv() => match event {
                        Some(event) if event.kind == QueryEventKind::Updated => {
                            accumulator.sync_from_cache();
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = settled.recv() => match event {
                        Ok(event) => {
                            if let Err(err) = accumulator.on_mutation_settled(&event).await {
                                tracing::warn!(mutation = %event.kind, error = %err, "reload after mutation failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "missed settled mutations; resetting");
                            if let Err(err) = accumulator.reset().await {
                                tracing::warn!(error = %err, "reset after lag failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("pagination follower stopped");
        })
    }
}
