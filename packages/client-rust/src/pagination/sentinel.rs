//! Scroll-triggered loading.
//!
//! The decision is the pure function [`should_load_more`]; the event source
//! (scroll listener, intersection callback, terminal redraw) only has to
//! report [`ViewportGeometry`] to a [`ScrollSentinel`].

use ledger_core::QueryError;

use super::accumulator::{LoadOutcome, PageSource, PageStatus, PaginationAccumulator};

/// Where the end of the list sits relative to the viewport.
///
/// All values share one unit (pixels, rows) and are measured from the top of
/// the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportGeometry {
    /// Offset of the bottom edge of the rendered content.
    pub content_bottom: f64,
    pub viewport_height: f64,
    /// How far below the viewport the bottom edge may be and still count.
    pub threshold: f64,
}

impl ViewportGeometry {
    /// Whether the bottom edge is within the viewport, extended by `threshold`.
    #[must_use]
    pub fn bottom_in_view(&self) -> bool {
        self.content_bottom <= self.viewport_height + self.threshold
    }
}

/// Returns `true` if the next page should be requested now.
#[must_use]
pub fn should_load_more(geometry: &ViewportGeometry, status: PageStatus) -> bool {
    geometry.bottom_in_view() && status.has_more && !status.is_initial_loading && !status.is_loading_more
}

/// Bridges viewport changes to [`PaginationAccumulator::load_next`].
pub struct ScrollSentinel<S: PageSource> {
    accumulator: PaginationAccumulator<S>,
}

impl<S: PageSource> ScrollSentinel<S> {
    #[must_use]
    pub fn new(accumulator: PaginationAccumulator<S>) -> Self {
        Self { accumulator }
    }

    #[must_use]
    pub fn accumulator(&self) -> &PaginationAccumulator<S> {
        &self.accumulator
    }

    /// Requests the next page if the bottom of the content came into view.
    ///
    /// # Errors
    ///
    /// Returns the page load's error.
    pub async fn on_viewport_change(&self, geometry: ViewportGeometry) -> Result<LoadOutcome, QueryError> {
        if should_load_more(&geometry, self.accumulator.status()) {
            self.accumulator.load_next().await
        } else {
            Ok(LoadOutcome::Skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use proptest::prelude::*;
    use tokio::sync::Notify;

    use super::*;
    use crate::pagination::accumulator::tests::VecSource;

    fn ready() -> PageStatus {
        PageStatus {
            has_more: true,
            is_initial_loading: false,
            is_loading_more: false,
        }
    }

    fn geometry(content_bottom: f64) -> ViewportGeometry {
        ViewportGeometry {
            content_bottom,
            viewport_height: 800.0,
            threshold: 100.0,
        }
    }

    #[test]
    fn loads_when_bottom_is_within_threshold() {
        assert!(should_load_more(&geometry(850.0), ready()));
        assert!(should_load_more(&geometry(900.0), ready()));
        assert!(!should_load_more(&geometry(900.5), ready()));
    }

    #[test]
    fn blocked_by_loading_or_exhaustion() {
        let g = geometry(400.0);
        assert!(!should_load_more(&g, PageStatus { has_more: false, ..ready() }));
        assert!(!should_load_more(&g, PageStatus { is_loading_more: true, ..ready() }));
        assert!(!should_load_more(&g, PageStatus { is_initial_loading: true, ..ready() }));
    }

    #[tokio::test]
    async fn rapid_viewport_changes_issue_one_request() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(VecSource::gated(50, gate.clone()));
        let sentinel = Arc::new(ScrollSentinel::new(PaginationAccumulator::new(source.clone(), 10)));

        let first = tokio::spawn({
            let sentinel = Arc::clone(&sentinel);
            async move { sentinel.on_viewport_change(geometry(0.0)).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        let second = sentinel.on_viewport_change(geometry(0.0)).await;

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(LoadOutcome::Loaded(10)));
        assert_eq!(second, Ok(LoadOutcome::Skipped));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_screen_bottom_does_not_load() {
        let source = Arc::new(VecSource::new(50));
        let sentinel = ScrollSentinel::new(PaginationAccumulator::new(source.clone(), 10));
        let outcome = sentinel.on_viewport_change(geometry(5_000.0)).await;
        assert_eq!(outcome, Ok(LoadOutcome::Skipped));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn predicate_matches_its_definition(
            bottom in -500.0f64..3_000.0,
            height in 0.0f64..2_000.0,
            threshold in 0.0f64..500.0,
            has_more in any::<bool>(),
            initial in any::<bool>(),
            loading in any::<bool>()
        ) {
            let g = ViewportGeometry { content_bottom: bottom, viewport_height: height, threshold };
            let status = PageStatus { has_more, is_initial_loading: initial, is_loading_more: loading };
            let expected = bottom <= height + threshold && has_more && !initial && !loading;
            prop_assert_eq!(should_load_more(&g, status), expected);
        }
    }
}
