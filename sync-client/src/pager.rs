//! Remote pagination.
//!
//! [`RemotePager`] walks a provider's pages until the cursor runs out, the
//! page limit is hit, or a page crosses the sync window. Records that fail to
//! map are skipped one by one; an unreadable page fails the whole fetch.

use crate::abort::AbortSignal;
use crate::provider::{Provider, RequestContext};
use crate::transport::Transport;
use sync_core::{Exhaustion, PageCursor, PageStep, SyncWindow};
use sync_types::{Entity, SyncCursor, SyncError};
use tracing::{debug, info, warn};

/// One fetched and mapped page.
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Mapped entities, in provider order.
    pub entities: Vec<Entity>,
    /// Continuation cursor.
    pub next_cursor: Option<SyncCursor>,
    /// Sync token issued with this page.
    pub sync_token: Option<String>,
    /// Records that failed to map.
    pub skipped: usize,
}

/// Result of paging through a collection.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Every admitted entity, in fetch order.
    pub entities: Vec<Entity>,
    /// Pages fetched.
    pub pages: u32,
    /// Records that failed to map.
    pub skipped: usize,
    /// Why paging stopped; `None` when the window cut it short.
    pub exhaustion: Option<Exhaustion>,
    /// A page contained entities older than the sync window.
    pub window_truncated: bool,
    /// Last sync token the provider issued.
    pub sync_token: Option<String>,
}

impl FetchOutcome {
    /// The page limit stopped paging while the provider still had pages.
    pub fn hit_page_limit(&self) -> bool {
        self.exhaustion == Some(Exhaustion::PageLimit)
    }
}

/// Fetches pages from one provider.
pub struct RemotePager<'a> {
    transport: &'a dyn Transport,
    provider: &'a dyn Provider,
    max_pages: u32,
    window: SyncWindow,
}

impl<'a> RemotePager<'a> {
    /// Pager without page limit or window.
    pub fn new(transport: &'a dyn Transport, provider: &'a dyn Provider) -> Self {
        Self {
            transport,
            provider,
            max_pages: u32::MAX,
            window: SyncWindow::unbounded(),
        }
    }

    /// Stop after `max_pages` pages (at least one page is always fetched).
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Stop at the first entity older than the window.
    pub fn with_window(mut self, window: SyncWindow) -> Self {
        self.window = window;
        self
    }

    /// Fetch and map a single page.
    pub async fn fetch_page(
        &self,
        ctx: &RequestContext<'_>,
        cursor: Option<&SyncCursor>,
    ) -> Result<FetchedPage, SyncError> {
        let request = self.provider.page_request(ctx, cursor)?;
        let response = self
            .transport
            .request(request)
            .await
            .map_err(SyncError::from)?
            .error_for_status()?;
        let remote = self.provider.parse_page(&response.body)?;

        let mut page = FetchedPage {
            entities: Vec::with_capacity(remote.page.items.len()),
            next_cursor: remote.page.next_cursor,
            sync_token: remote.sync_token,
            skipped: 0,
        };
        for raw in &remote.page.items {
            match self.provider.map_to_entity(raw) {
                Ok(entity) => page.entities.push(entity),
                Err(e) => {
                    warn!("{}: skipping unreadable record: {}", self.provider.name(), e);
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }

    /// Page through the whole collection.
    ///
    /// `on_page` is called with the running page count after every page.
    /// `abort` is checked before each request.
    pub async fn fetch_all<F>(
        &self,
        ctx: &RequestContext<'_>,
        abort: &AbortSignal,
        mut on_page: F,
    ) -> Result<FetchOutcome, SyncError>
    where
        F: FnMut(u32) + Send,
    {
        let mut cursor = PageCursor::with_max_pages(self.max_pages);
        let mut outcome = FetchOutcome::default();

        loop {
            abort.check()?;
            let page = self.fetch_page(ctx, cursor.current()).await?;
            outcome.skipped += page.skipped;
            if page.sync_token.is_some() {
                outcome.sync_token = page.sync_token;
            }

            let (kept, truncated) = self.window.truncate(page.entities);
            outcome.entities.extend(kept);
            let step = cursor.advance(page.next_cursor);
            on_page(cursor.pages());

            if truncated {
                info!(
                    "{}: page {} reached the sync window, stopping",
                    self.provider.name(),
                    cursor.pages()
                );
                outcome.window_truncated = true;
                break;
            }
            match step {
                PageStep::Continue(next) => {
                    debug!("{}: continuing at cursor {}", self.provider.name(), next);
                }
                PageStep::Exhausted(reason) => {
                    if reason == Exhaustion::RepeatedCursor || reason == Exhaustion::PageLimit {
                        warn!(
                            "{}: paging stopped early ({:?}) after {} pages",
                            self.provider.name(),
                            reason,
                            cursor.pages()
                        );
                    }
                    outcome.exhaustion = Some(reason);
                    break;
                }
            }
        }

        outcome.pages = cursor.pages();
        debug!(
            "{}: fetched {} entities in {} pages",
            self.provider.name(),
            outcome.entities.len(),
            outcome.pages
        );
        Ok(outcome)
    }
}
