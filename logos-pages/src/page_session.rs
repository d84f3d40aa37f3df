//! One live page: block store, operation log, presence, and fan-out.
//!
//! ```text
//!   coordinator A ─┐                         ┌─▶ receiver A
//!   coordinator B ─┼─▶ Mutex<PageState> ─────┼─▶ receiver B
//!   coordinator C ─┘   apply → resolve       └─▶ receiver C
//!                      → append → send
//! ```
//!
//! Every mutation of a page goes through the state mutex. Tokio's mutex
//! is fair, so operations are applied in the order they reached the page,
//! and events are sent while the lock is held so every receiver sees them
//! in sequence order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::block::{Block, BlockId, FieldMap, FieldValue, PageId, SessionId, UserId};
use crate::block_store::{BlockStore, PageSnapshot};
use crate::broadcast::{BroadcastGroup, BroadcastStats, PageEvent};
use crate::config::PagesConfig;
use crate::error::{ApplyError, PagesError, RejectReason};
use crate::operation::{AppliedOperation, Operation, OperationKind, Placement, UpdateMode};
use crate::oplog::{LogError, OperationLog};
use crate::presence::{
    CursorPosition, DepartureReason, PresenceChange, PresenceEntry, PresenceTracker,
    SelectionRange,
};
use crate::resolver::{ConflictResolver, Resolution};
use crate::storage::{DocumentStore, FlushBatch, StoredPage};

/// Upper bound on resolve-and-retry rounds for one operation.
const MAX_REBASES: usize = 4;

/// A session joining a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
}

/// How a new subscriber catches up.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    Snapshot(PageSnapshot),
    /// Operations after `since`, in order
    Replay {
        since: u64,
        operations: Vec<Arc<AppliedOperation>>,
    },
}

impl CatchUp {
    /// Sequence the subscriber is at once it has applied this catch-up.
    pub fn sequence(&self) -> u64 {
        match self {
            CatchUp::Snapshot(snapshot) => snapshot.sequence,
            CatchUp::Replay { since, operations } => {
                operations.last().map(|op| op.sequence).unwrap_or(*since)
            }
        }
    }
}

/// Result of joining a page.
pub struct Subscription {
    pub page_id: PageId,
    /// Every event after the catch-up point
    pub receiver: broadcast::Receiver<PageEvent>,
    pub catch_up: CatchUp,
    /// Presence at join time, the new subscriber included
    pub presence: Vec<PresenceEntry>,
}

/// Result of submitting an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    Applied(Arc<AppliedOperation>),
    Rejected(RejectReason),
}

impl SubmitResult {
    pub fn applied(&self) -> Option<&Arc<AppliedOperation>> {
        match self {
            SubmitResult::Applied(op) => Some(op),
            SubmitResult::Rejected(_) => None,
        }
    }
}

/// Snapshot of a page session's counters.
#[derive(Debug, Clone, Default)]
pub struct PageSessionStats {
    pub subscribers: usize,
    pub present: usize,
    pub head: u64,
    pub retained_operations: usize,
    pub flushed_sequence: u64,
    pub broadcast: BroadcastStats,
}

struct PageState {
    store: BlockStore,
    log: OperationLog,
    presence: PresenceTracker,
    subscribers: HashMap<SessionId, Subscriber>,
    /// Page metadata changed since the last flush
    page_dirty: bool,
    closed: bool,
}

impl PageState {
    fn is_dirty(&self) -> bool {
        self.page_dirty || self.log.flushed_sequence() < self.log.head()
    }
}

/// Live state of one page.
pub struct PageSession {
    page_id: PageId,
    state: Mutex<PageState>,
    broadcast: BroadcastGroup,
    resolver: ConflictResolver,
    config: PagesConfig,
}

impl PageSession {
    /// Materialize a page loaded from the document store.
    pub fn new(stored: StoredPage, config: PagesConfig) -> Result<Self, PagesError> {
        let page_id = stored.page.id;
        let store = BlockStore::from_blocks(stored.page, stored.blocks, stored.sequence)
            .map_err(|e| PagesError::Integrity(e.to_string()))?;
        let log = OperationLog::from_sequence(page_id, config.log.clone(), stored.sequence);
        let presence = PresenceTracker::new(page_id, config.heartbeat_timeout);
        Ok(Self {
            page_id,
            state: Mutex::new(PageState {
                store,
                log,
                presence,
                subscribers: HashMap::new(),
                page_dirty: false,
                closed: false,
            }),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            resolver: ConflictResolver::new(),
            config,
        })
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Join the page. `since` is the last sequence the client already has.
    pub async fn subscribe(
        &self,
        subscriber: Subscriber,
        since: Option<u64>,
        now: Instant,
    ) -> Result<Subscription, PagesError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PagesError::Capacity(self.page_id));
        }
        let session_id = subscriber.session_id;
        let rejoining = state.subscribers.contains_key(&session_id);
        if !rejoining && state.subscribers.len() >= self.config.max_sessions_per_page {
            log::warn!(
                "Page {} full ({} sessions), refusing {session_id}",
                self.page_id,
                state.subscribers.len()
            );
            return Err(PagesError::Capacity(self.page_id));
        }

        let head = state.log.head();
        let replay = since
            .filter(|s| *s <= head)
            .and_then(|s| state.log.replay_since(s).map(|ops| (s, ops)));
        let catch_up = match replay {
            Some((since, operations)) => CatchUp::Replay { since, operations },
            None => CatchUp::Snapshot(state.store.snapshot()),
        };
        state.log.register(session_id, catch_up.sequence());

        let entry = state.presence.join(
            session_id,
            subscriber.user_id,
            &subscriber.display_name,
            now,
        );
        state.subscribers.insert(session_id, subscriber);
        let receiver = self.broadcast.subscribe();
        if !rejoining {
            self.broadcast
                .send(PageEvent::Presence(PresenceChange::Joined(entry)));
        }
        log::info!(
            "Session {session_id} subscribed to page {} at sequence {} ({})",
            self.page_id,
            catch_up.sequence(),
            match &catch_up {
                CatchUp::Snapshot(_) => "snapshot",
                CatchUp::Replay { .. } => "replay",
            }
        );

        Ok(Subscription {
            page_id: self.page_id,
            receiver,
            catch_up,
            presence: state.presence.list(),
        })
    }

    /// Leave the page. Returns false when the session was not subscribed.
    pub async fn unsubscribe(&self, session_id: SessionId, reason: DepartureReason) -> bool {
        let mut state = self.state.lock().await;
        let Some(subscriber) = state.subscribers.remove(&session_id) else {
            return false;
        };
        state.log.unregister(session_id);
        if state.presence.remove(session_id).is_some() {
            self.broadcast.send(PageEvent::Presence(PresenceChange::Left {
                session_id,
                user_id: subscriber.user_id,
                reason,
            }));
        }
        state.log.compact();
        log::info!(
            "Session {session_id} left page {} ({reason:?})",
            self.page_id
        );
        true
    }

    pub async fn is_subscribed(&self, session_id: SessionId) -> bool {
        self.state.lock().await.subscribers.contains_key(&session_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Validate, resolve, sequence, log, and broadcast one operation.
    ///
    /// Expected failures (conflicts that cannot be rebased, deleted targets,
    /// invalid payloads) come back as `SubmitResult::Rejected`.
    pub async fn submit(&self, op: Operation) -> Result<SubmitResult, PagesError> {
        let mut state = self.state.lock().await;
        self.submit_locked(&mut state, op)
    }

    fn submit_locked(
        &self,
        state: &mut PageState,
        op: Operation,
    ) -> Result<SubmitResult, PagesError> {
        if state.closed {
            return Err(PagesError::Capacity(self.page_id));
        }
        if op.page_id != self.page_id {
            log::error!(
                "Integrity: operation for page {} from session {} routed to page {}",
                op.page_id,
                op.session_id,
                self.page_id
            );
            return Ok(SubmitResult::Rejected(RejectReason::Integrity {
                message: format!("operation does not belong to page {}", self.page_id),
            }));
        }
        if !state.subscribers.contains_key(&op.session_id) {
            return Err(PagesError::NotSubscribed {
                session_id: op.session_id,
                page_id: self.page_id,
            });
        }
        state.presence.heartbeat(op.session_id, Instant::now());

        let applied = match self.apply_resolved(&mut state.store, state.log.next_sequence(), op) {
            Ok(applied) => applied,
            Err(reason) => return Ok(SubmitResult::Rejected(reason)),
        };
        let deletes = matches!(applied.operation.kind, OperationKind::Delete);
        let applied = state
            .log
            .append(applied)
            .map_err(|e| PagesError::Integrity(e.to_string()))?;
        log::debug!(
            "Page {} applied #{} {} on {} from {}",
            self.page_id,
            applied.sequence,
            applied.operation.kind.name(),
            applied.operation.block_id,
            applied.origin()
        );
        self.broadcast.send(PageEvent::Applied(Arc::clone(&applied)));

        if deletes {
            let PageState {
                store, presence, ..
            } = &mut *state;
            for entry in presence.clear_block(|id| store.is_live(id)) {
                self.broadcast
                    .send(PageEvent::Presence(PresenceChange::Updated(entry)));
            }
        }
        state.log.compact();
        Ok(SubmitResult::Applied(applied))
    }

    fn apply_resolved(
        &self,
        store: &mut BlockStore,
        sequence: u64,
        op: Operation,
    ) -> Result<AppliedOperation, RejectReason> {
        let mut current = op;
        let mut outcomes = Vec::new();
        for _ in 0..MAX_REBASES {
            match store.apply(&current, sequence) {
                Ok(mut applied) => {
                    applied.outcomes = outcomes;
                    return Ok(applied);
                }
                Err(ApplyError::Conflict(conflict)) => {
                    match self.resolver.resolve(&current, &conflict) {
                        Resolution::Rebase { operation, outcome } => {
                            log::trace!(
                                "Rebased {} on {}: {outcome:?}",
                                current.kind.name(),
                                current.block_id
                            );
                            outcomes.push(outcome);
                            current = operation;
                        }
                        Resolution::Reject(reason) => return Err(reason),
                    }
                }
                Err(e @ ApplyError::Integrity(_)) => {
                    log::error!("Page {}: {e}", self.page_id);
                    return Err(e.into());
                }
                Err(e) => {
                    log::debug!("Page {} rejected {}: {e}", self.page_id, current.kind.name());
                    return Err(e.into());
                }
            }
        }
        log::error!(
            "Page {}: operation on {} did not settle after {MAX_REBASES} rebases",
            self.page_id,
            current.block_id
        );
        Err(RejectReason::Integrity {
            message: "conflict did not settle".into(),
        })
    }

    /// Submit the inverse of an earlier operation by the same session.
    ///
    /// Undoing a delete restores the block and the subtree it still owns.
    /// Children that delete lifted out (`rescued`) stay where they were
    /// moved: they were placed by other sessions the deleter had not seen.
    pub async fn undo(
        &self,
        session_id: SessionId,
        author_id: UserId,
        sequence: u64,
        received_at: u64,
    ) -> Result<SubmitResult, PagesError> {
        let mut state = self.state.lock().await;
        let unavailable = SubmitResult::Rejected(RejectReason::UndoUnavailable { sequence });
        let Some(entry) = state.log.get(sequence).cloned() else {
            return Ok(unavailable);
        };
        if entry.origin() != session_id {
            return Ok(unavailable);
        }
        let Some(kind) = inverse(&entry, &state.store) else {
            return Ok(unavailable);
        };
        let base_version = entry.target().map(|b| b.version).unwrap_or(0);
        let op = Operation {
            page_id: self.page_id,
            block_id: entry.operation.block_id,
            kind,
            base_version,
            observed_sequence: entry.sequence,
            session_id,
            author_id,
            received_at,
            sequence: 0,
        };
        log::debug!("Session {session_id} undoing #{sequence} on page {}", self.page_id);
        self.submit_locked(&mut state, op)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Replace a session's cursor, selection, and typing flag.
    ///
    /// Positions inside blocks that are no longer live are dropped.
    pub async fn update_presence(
        &self,
        session_id: SessionId,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        typing: bool,
        now: Instant,
    ) -> Result<PresenceEntry, PagesError> {
        let mut state = self.state.lock().await;
        if !state.subscribers.contains_key(&session_id) {
            return Err(PagesError::NotSubscribed {
                session_id,
                page_id: self.page_id,
            });
        }
        let cursor = cursor.filter(|c| state.store.is_live(c.block_id));
        let selection = selection.filter(|s| {
            state.store.is_live(s.anchor.block_id) && state.store.is_live(s.head.block_id)
        });
        let entry = state
            .presence
            .update(session_id, cursor, selection, typing, now)
            .ok_or(PagesError::NotSubscribed {
                session_id,
                page_id: self.page_id,
            })?;
        self.broadcast
            .send(PageEvent::Presence(PresenceChange::Updated(entry.clone())));
        Ok(entry)
    }

    /// Refresh a session's presence. Returns false if it is not on the page.
    pub async fn heartbeat(&self, session_id: SessionId, now: Instant) -> bool {
        self.state.lock().await.presence.heartbeat(session_id, now)
    }

    pub async fn presence(&self) -> Vec<PresenceEntry> {
        self.state.lock().await.presence.list()
    }

    /// Drop every session whose presence timed out.
    ///
    /// Each expired session gets exactly one departure event and loses its
    /// subscription.
    pub async fn expire_presence(&self, now: Instant) -> Vec<PresenceEntry> {
        let mut state = self.state.lock().await;
        let expired = state.presence.expire(now);
        for entry in &expired {
            state.subscribers.remove(&entry.session_id);
            state.log.unregister(entry.session_id);
            log::warn!(
                "Session {} timed out on page {}",
                entry.session_id,
                self.page_id
            );
            self.broadcast.send(PageEvent::Presence(PresenceChange::Left {
                session_id: entry.session_id,
                user_id: entry.user_id,
                reason: DepartureReason::TimedOut,
            }));
            self.broadcast.send(PageEvent::Expired {
                session_id: entry.session_id,
            });
        }
        if !expired.is_empty() {
            state.log.compact();
        }
        expired
    }

    // ─── Acknowledgements & reads ─────────────────────────────────────

    pub async fn acknowledge(&self, session_id: SessionId, sequence: u64) -> Result<(), PagesError> {
        let mut state = self.state.lock().await;
        if !state.subscribers.contains_key(&session_id) {
            return Err(PagesError::NotSubscribed {
                session_id,
                page_id: self.page_id,
            });
        }
        state.presence.heartbeat(session_id, Instant::now());
        state
            .log
            .acknowledge(session_id, sequence)
            .map_err(|e| PagesError::Invalid(e.to_string()))?;
        state.log.compact();
        Ok(())
    }

    pub async fn snapshot(&self) -> PageSnapshot {
        self.state.lock().await.store.snapshot()
    }

    /// Retained operations after `since`.
    pub async fn history(&self, since: u64) -> Result<Vec<Arc<AppliedOperation>>, LogError> {
        self.state.lock().await.log.since(since)
    }

    pub async fn head(&self) -> u64 {
        self.state.lock().await.log.head()
    }

    /// Archive or unarchive. Archived pages reject every mutation.
    pub async fn set_archived(&self, archived: bool) {
        let mut state = self.state.lock().await;
        if state.store.page().archived != archived {
            state.store.set_archived(archived);
            state.page_dirty = true;
            log::info!("Page {} archived = {archived}", self.page_id);
        }
    }

    pub async fn stats(&self) -> PageSessionStats {
        let state = self.state.lock().await;
        PageSessionStats {
            subscribers: state.subscribers.len(),
            present: state.presence.len(),
            head: state.log.head(),
            retained_operations: state.log.len(),
            flushed_sequence: state.log.flushed_sequence(),
            broadcast: self.broadcast.stats(),
        }
    }

    // ─── Durability & lifecycle ───────────────────────────────────────

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.is_dirty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Flush unpersisted changes. Returns false when there was nothing to write.
    pub async fn flush(&self, documents: &dyn DocumentStore) -> Result<bool, PagesError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state, documents).await
    }

    async fn flush_locked(
        &self,
        state: &mut PageState,
        documents: &dyn DocumentStore,
    ) -> Result<bool, PagesError> {
        if !state.is_dirty() {
            return Ok(false);
        }
        let batch = pending_flush(state);
        documents.flush(&batch).await.map_err(|e| {
            log::error!("Flush of page {} failed: {e}", self.page_id);
            PagesError::from(e)
        })?;
        state.log.mark_flushed(batch.sequence);
        state.page_dirty = false;
        state.log.compact();
        log::info!(
            "Flushed page {}: {} operations, {} blocks, head {}",
            self.page_id,
            batch.operations.len(),
            batch.blocks.len(),
            batch.sequence
        );
        Ok(true)
    }

    /// Flush and close if nobody is subscribed. A failed flush leaves the
    /// page open.
    pub async fn close_if_idle(&self, documents: &dyn DocumentStore) -> Result<bool, PagesError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(true);
        }
        if !state.subscribers.is_empty() {
            return Ok(false);
        }
        self.flush_locked(&mut state, documents).await?;
        state.closed = true;
        log::debug!("Page session {} closed", self.page_id);
        Ok(true)
    }

    /// Flush and close regardless of subscribers.
    pub async fn close(&self, documents: &dyn DocumentStore) -> Result<(), PagesError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state, documents).await?;
        state.closed = true;
        Ok(())
    }
}

/// Current state of every block touched by the unflushed operations.
fn pending_flush(state: &PageState) -> FlushBatch {
    let operations = state.log.unflushed();
    let mut seen: HashSet<BlockId> = HashSet::new();
    let blocks: Vec<Block> = operations
        .iter()
        .flat_map(|op| op.blocks.iter().map(|b| b.id))
        .filter(|id| seen.insert(*id))
        .filter_map(|id| state.store.get(id).cloned())
        .collect();
    FlushBatch {
        page: state.store.page().clone(),
        blocks,
        operations,
        sequence: state.log.head(),
    }
}

/// Position right after the sibling that preceded `block`, or the start.
fn placement_of(store: &BlockStore, block: &Block) -> Placement {
    store
        .siblings(block.parent_id)
        .into_iter()
        .filter(|b| b.id != block.id)
        .take_while(|b| (&b.order_key, b.id) < (&block.order_key, block.id))
        .last()
        .map(|b| Placement::After(b.id))
        .unwrap_or(Placement::Start)
}

/// Operation that reverts `entry`, if one exists.
fn inverse(entry: &AppliedOperation, store: &BlockStore) -> Option<OperationKind> {
    match &entry.operation.kind {
        OperationKind::Insert { .. } | OperationKind::Restore { .. } => Some(OperationKind::Delete),
        OperationKind::Delete => {
            let before = entry.before.as_ref()?;
            Some(OperationKind::Restore {
                parent_id: before.parent_id,
                placement: placement_of(store, before),
            })
        }
        OperationKind::Move { .. } => {
            let before = entry.before.as_ref()?;
            Some(OperationKind::Move {
                parent_id: before.parent_id,
                placement: placement_of(store, before),
            })
        }
        OperationKind::Update { .. } => {
            let before = entry.before.as_ref()?;
            let after = entry.target()?;
            let fields: FieldMap = before
                .content
                .keys()
                .chain(after.content.keys())
                .filter(|name| before.content.get(*name) != after.content.get(*name))
                .map(|name| {
                    let value = before.content.get(name).cloned().unwrap_or(FieldValue::Null);
                    (name.clone(), value)
                })
                .collect();
            let block_type = (before.block_type != after.block_type).then_some(before.block_type);
            if fields.is_empty() && block_type.is_none() {
                return None;
            }
            Some(OperationKind::Update {
                block_type,
                fields,
                mode: UpdateMode::Fields,
            })
        }
    }
}
