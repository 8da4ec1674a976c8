//! Continuation-token tracking for paginated fetches.
//!
//! Providers signal the end of a collection in several ways: no token, an
//! empty token, or (buggy APIs) the same token again. The tracker folds all
//! of them into a single [`PageStep::Exhausted`] so the pager never loops.

use std::collections::HashSet;
use sync_types::SyncCursor;

/// What the pager should do after a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStep {
    /// Request the next page with this cursor.
    Continue(SyncCursor),
    /// Stop paging.
    Exhausted(Exhaustion),
}

/// Why paging stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The provider returned no cursor.
    NoCursor,
    /// The provider returned an empty cursor.
    EmptyCursor,
    /// The provider returned a cursor already used in this fetch.
    RepeatedCursor,
    /// The configured page limit was reached.
    PageLimit,
}

/// Tracks cursors consumed during one fetch.
#[derive(Debug, Clone, Default)]
pub struct PageCursor {
    /// Cursor for the next request (`None` = first page).
    current: Option<SyncCursor>,
    /// Every cursor handed out so far.
    seen: HashSet<SyncCursor>,
    /// Pages fetched so far.
    pages: u32,
    /// Upper bound on pages per fetch.
    max_pages: Option<u32>,
}

impl PageCursor {
    /// Tracker for a fresh fetch without a page limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that stops after `max_pages` pages.
    pub fn with_max_pages(max_pages: u32) -> Self {
        Self {
            max_pages: Some(max_pages),
            ..Self::default()
        }
    }

    /// Cursor to pass with the next request.
    pub fn current(&self) -> Option<&SyncCursor> {
        self.current.as_ref()
    }

    /// Number of pages recorded.
    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// Record a fetched page and its `next_cursor`.
    pub fn advance(&mut self, next: Option<SyncCursor>) -> PageStep {
        self.pages = self.pages.saturating_add(1);

        let next = match next {
            None => return PageStep::Exhausted(Exhaustion::NoCursor),
            Some(cursor) if cursor.is_exhausted() => {
                return PageStep::Exhausted(Exhaustion::EmptyCursor)
            }
            Some(cursor) => cursor,
        };

        if self.current.as_ref() == Some(&next) || self.seen.contains(&next) {
            return PageStep::Exhausted(Exhaustion::RepeatedCursor);
        }

        if self.max_pages.is_some_and(|max| self.pages >= max) {
            return PageStep::Exhausted(Exhaustion::PageLimit);
        }

        self.seen.insert(next.clone());
        self.current = Some(next.clone());
        PageStep::Continue(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(s: &str) -> Option<SyncCursor> {
        Some(SyncCursor::new(s))
    }

    /// Feed a sequence of returned cursors; return how many pages were fetched.
    fn drive(returned: &[Option<SyncCursor>]) -> (u32, Exhaustion) {
        let mut tracker = PageCursor::new();
        for next in returned {
            if let PageStep::Exhausted(reason) = tracker.advance(next.clone()) {
                return (tracker.pages(), reason);
            }
        }
        panic!("sequence did not exhaust");
    }

    #[test]
    fn starts_at_first_page() {
        let tracker = PageCursor::new();
        assert!(tracker.current().is_none());
        assert_eq!(tracker.pages(), 0);
    }

    #[test]
    fn empty_cursor_terminates_after_page_b() {
        let (pages, reason) = drive(&[cursor("A"), cursor("B"), cursor("")]);
        assert_eq!(pages, 3);
        assert_eq!(reason, Exhaustion::EmptyCursor);
    }

    #[test]
    fn repeated_cursor_terminates_after_page_b() {
        let (pages, reason) = drive(&[cursor("A"), cursor("B"), cursor("B")]);
        assert_eq!(pages, 3);
        assert_eq!(reason, Exhaustion::RepeatedCursor);
    }

    #[test]
    fn absent_cursor_terminates() {
        let (pages, reason) = drive(&[cursor("A"), None]);
        assert_eq!(pages, 2);
        assert_eq!(reason, Exhaustion::NoCursor);
    }

    #[test]
    fn cycle_back_to_earlier_cursor_terminates() {
        let (_, reason) = drive(&[cursor("A"), cursor("B"), cursor("A")]);
        assert_eq!(reason, Exhaustion::RepeatedCursor);
    }

    #[test]
    fn continue_carries_the_next_cursor() {
        let mut tracker = PageCursor::new();
        assert_eq!(
            tracker.advance(cursor("A")),
            PageStep::Continue(SyncCursor::new("A"))
        );
        assert_eq!(tracker.current(), Some(&SyncCursor::new("A")));
    }

    #[test]
    fn page_limit_stops_runaway_provider() {
        let mut tracker = PageCursor::with_max_pages(2);
        assert!(matches!(tracker.advance(cursor("A")), PageStep::Continue(_)));
        assert_eq!(
            tracker.advance(cursor("B")),
            PageStep::Exhausted(Exhaustion::PageLimit)
        );
    }
}
