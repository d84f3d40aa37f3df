//! Registry of live page sessions.
//!
//! ```text
//!              subscribe(page)
//!                    │
//!                    ▼
//!   ┌────────────────────────────────────────────┐
//!   │ RwLock<HashMap<PageId, Arc<OnceCell<..>>>> │
//!   └───────────────┬────────────────────────────┘
//!                   │ get_or_try_init (one load per page,
//!                   ▼  concurrent callers await it)
//!           DocumentStore::load_page
//! ```
//!
//! A page session is created on first subscribe and evicted when its last
//! subscriber leaves, but only after its state has been flushed. Failed
//! loads and closed sessions are removed from the map so the next caller
//! starts a fresh load.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::block::{PageId, PageInfo, SessionId};
use crate::block_store::{BlockStore, PageSnapshot};
use crate::config::PagesConfig;
use crate::error::PagesError;
use crate::operation::AppliedOperation;
use crate::oplog::LogError;
use crate::page_session::{PageSession, Subscriber, Subscription};
use crate::presence::DepartureReason;
use crate::storage::DocumentStore;

/// Attempts to subscribe when a page session closes underneath us.
const SUBSCRIBE_ATTEMPTS: usize = 3;

type Slot = Arc<OnceCell<Arc<PageSession>>>;

/// Owns every resident page session.
pub struct PageSessionManager {
    documents: Arc<dyn DocumentStore>,
    config: PagesConfig,
    pages: RwLock<HashMap<PageId, Slot>>,
}

impl PageSessionManager {
    pub fn new(documents: Arc<dyn DocumentStore>, config: PagesConfig) -> Self {
        Self {
            documents,
            config,
            pages: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PagesConfig {
        &self.config
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// Register a new page with the document store.
    pub async fn create_page(&self, page: PageInfo) -> Result<(), PagesError> {
        let id = page.id;
        self.documents.create_page(page).await?;
        log::info!("Created page {id}");
        Ok(())
    }

    // ─── Lookup ───────────────────────────────────────────────────────

    async fn slot(&self, page_id: PageId) -> Slot {
        if let Some(slot) = self.pages.read().await.get(&page_id) {
            return Arc::clone(slot);
        }
        let mut pages = self.pages.write().await;
        Arc::clone(pages.entry(page_id).or_default())
    }

    /// The live session for a page, loading it if needed.
    ///
    /// Concurrent callers for the same page share one load.
    pub async fn get_or_create(&self, page_id: PageId) -> Result<Arc<PageSession>, PagesError> {
        let slot = self.slot(page_id).await;
        let loaded = slot
            .get_or_try_init(|| async {
                let stored = self.documents.load_page(page_id).await?;
                log::info!(
                    "Loaded page {page_id}: {} blocks at sequence {}",
                    stored.blocks.len(),
                    stored.sequence
                );
                PageSession::new(stored, self.config.clone()).map(Arc::new)
            })
            .await;
        match loaded {
            Ok(session) => Ok(Arc::clone(session)),
            Err(e) => {
                log::warn!("Loading page {page_id} failed: {e}");
                self.remove_slot(page_id, &slot).await;
                Err(e)
            }
        }
    }

    /// Session for a page if it is resident.
    pub async fn resident(&self, page_id: PageId) -> Option<Arc<PageSession>> {
        self.pages
            .read()
            .await
            .get(&page_id)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn resident_pages(&self) -> Vec<PageId> {
        let pages = self.pages.read().await;
        pages
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| *id)
            .collect()
    }

    async fn sessions(&self) -> Vec<Arc<PageSession>> {
        let pages = self.pages.read().await;
        pages.values().filter_map(|slot| slot.get().cloned()).collect()
    }

    async fn remove_slot(&self, page_id: PageId, slot: &Slot) {
        let mut pages = self.pages.write().await;
        if pages.get(&page_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            pages.remove(&page_id);
        }
    }

    async fn forget(&self, session: &Arc<PageSession>) {
        let mut pages = self.pages.write().await;
        let same = pages
            .get(&session.page_id())
            .and_then(|slot| slot.get())
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if same {
            pages.remove(&session.page_id());
        }
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to a page, loading it on first use.
    pub async fn subscribe(
        &self,
        page_id: PageId,
        subscriber: Subscriber,
        since: Option<u64>,
    ) -> Result<(Arc<PageSession>, Subscription), PagesError> {
        for _ in 0..SUBSCRIBE_ATTEMPTS {
            let session = self.get_or_create(page_id).await?;
            match session
                .subscribe(subscriber.clone(), since, Instant::now())
                .await
            {
                Err(PagesError::Capacity(_)) if session.is_closed().await => {
                    log::debug!("Page {page_id} closed during subscribe, reloading");
                    self.forget(&session).await;
                }
                Ok(subscription) => return Ok((session, subscription)),
                Err(e) => return Err(e),
            }
        }
        Err(PagesError::Capacity(page_id))
    }

    /// Leave a page and evict it if it became empty.
    pub async fn unsubscribe(
        &self,
        page_id: PageId,
        session_id: SessionId,
        reason: DepartureReason,
    ) -> Result<bool, PagesError> {
        let Some(session) = self.resident(page_id).await else {
            return Ok(false);
        };
        let left = session.unsubscribe(session_id, reason).await;
        if left && session.subscriber_count().await == 0 {
            self.evict(page_id).await?;
        }
        Ok(left)
    }

    /// Flush and drop an idle page. Returns false if it still has
    /// subscribers or was not resident.
    pub async fn evict(&self, page_id: PageId) -> Result<bool, PagesError> {
        let Some(session) = self.resident(page_id).await else {
            return Ok(false);
        };
        if !session.close_if_idle(self.documents.as_ref()).await? {
            return Ok(false);
        }
        self.forget(&session).await;
        log::info!("Evicted page {page_id}");
        Ok(true)
    }

    // ─── Non-realtime reads ───────────────────────────────────────────

    /// Current live tree, from memory if resident, else from the store.
    pub async fn get_snapshot(&self, page_id: PageId) -> Result<PageSnapshot, PagesError> {
        if let Some(session) = self.resident(page_id).await {
            return Ok(session.snapshot().await);
        }
        let stored = self.documents.load_page(page_id).await?;
        let store = BlockStore::from_blocks(stored.page, stored.blocks, stored.sequence)
            .map_err(|e| PagesError::Integrity(e.to_string()))?;
        Ok(store.snapshot())
    }

    /// Operations after `since`, combining durable and in-memory history.
    pub async fn get_operation_history(
        &self,
        page_id: PageId,
        since: u64,
    ) -> Result<Vec<Arc<AppliedOperation>>, PagesError> {
        let resident = self.resident(page_id).await;
        if let Some(session) = &resident {
            match session.history(since).await {
                Ok(ops) => return Ok(ops),
                Err(LogError::Compacted { .. }) => {}
                Err(e) => return Err(PagesError::Invalid(e.to_string())),
            }
        }

        let mut ops: Vec<Arc<AppliedOperation>> = self
            .documents
            .load_operations(page_id, since)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        if let Some(session) = resident {
            let durable = ops.last().map(|op| op.sequence).unwrap_or(since);
            if let Ok(rest) = session.history(durable).await {
                ops.extend(rest);
            }
        }
        Ok(ops)
    }

    /// Archive or unarchive a page.
    pub async fn set_archived(&self, page_id: PageId, archived: bool) -> Result<(), PagesError> {
        let session = self.get_or_create(page_id).await?;
        session.set_archived(archived).await;
        if session.subscriber_count().await == 0 {
            self.evict(page_id).await?;
        }
        Ok(())
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Expire stale presence on every page. Returns the number of sessions
    /// removed.
    pub async fn sweep_presence(&self, now: Instant) -> usize {
        let mut removed = 0;
        for session in self.sessions().await {
            let expired = session.expire_presence(now).await;
            if expired.is_empty() {
                continue;
            }
            removed += expired.len();
            if session.subscriber_count().await == 0 {
                if let Err(e) = self.evict(session.page_id()).await {
                    log::error!("Evicting page {} after timeout failed: {e}", session.page_id());
                }
            }
        }
        removed
    }

    /// Flush every dirty page. Returns the number flushed.
    pub async fn flush_dirty(&self) -> usize {
        let mut flushed = 0;
        for session in self.sessions().await {
            match session.flush(self.documents.as_ref()).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => log::error!("Periodic flush of page {} failed: {e}", session.page_id()),
            }
        }
        flushed
    }

    /// Flush and close every page. Every page is attempted; the last
    /// error is returned.
    pub async fn shutdown(&self) -> Result<(), PagesError> {
        let mut result = Ok(());
        for session in self.sessions().await {
            match session.close(self.documents.as_ref()).await {
                Ok(()) => self.forget(&session).await,
                Err(e) => {
                    log::error!("Closing page {} failed: {e}", session.page_id());
                    result = Err(e);
                }
            }
        }
        log::info!("Page session manager shut down");
        result
    }

    /// Periodic presence sweep and flush. The task ends when the manager
    /// is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut sweep = interval(self.config.sweep_interval);
        let mut flush = interval(self.config.flush_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        let removed = manager.sweep_presence(Instant::now()).await;
                        if removed > 0 {
                            log::debug!("Presence sweep removed {removed} sessions");
                        }
                    }
                    _ = flush.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.flush_dirty().await;
                    }
                }
            }
            log::debug!("Maintenance task stopped");
        })
    }
}
