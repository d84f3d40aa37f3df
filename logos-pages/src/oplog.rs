//! Per-page ordered log of applied operations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   OperationLog                       │
//! │                                                      │
//! │   oldest                                   head      │
//! │     ▼                                        ▼       │
//! │   [ 41 | 42 | 43 | ... | 118 | 119 | 120 ]           │
//! │          ▲ flushed ───────▲      ▲ acks: s1=119      │
//! │                                          s2=120      │
//! │                                                      │
//! │  Compact when: entry ≤ min(ack) and ≤ flushed,       │
//! │  keeping at least `history_retention` entries.       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Sequence numbers start at 1 and are gap-free. A reconnecting client
//! catches up by replay when it is at most `replay_threshold` operations
//! behind and the entries are still retained; otherwise it gets a snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::block::{PageId, SessionId};
use crate::operation::AppliedOperation;

/// Log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Max operations a client may be behind and still get a replay. Default: 200.
    pub replay_threshold: u64,
    /// Entries always kept after compaction. Default: 500.
    pub history_retention: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            replay_threshold: 200,
            history_retention: 500,
        }
    }
}

impl LogConfig {
    /// Config for testing (tiny windows).
    pub fn for_testing() -> Self {
        Self {
            replay_threshold: 5,
            history_retention: 3,
        }
    }
}

/// Log errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Append with a sequence other than the next one
    OutOfOrder { expected: u64, got: u64 },
    /// Append of an operation for a different page
    WrongPage { expected: PageId, got: PageId },
    /// Requested entries were compacted away
    Compacted { requested: u64, oldest: u64 },
    /// Client claims a sequence the server never issued
    Ahead { requested: u64, head: u64 },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::OutOfOrder { expected, got } => {
                write!(f, "Log append out of order: expected {expected}, got {got}")
            }
            LogError::WrongPage { expected, got } => {
                write!(f, "Log append for page {got}, log belongs to {expected}")
            }
            LogError::Compacted { requested, oldest } => {
                write!(f, "Sequence {requested} compacted (oldest retained {oldest})")
            }
            LogError::Ahead { requested, head } => {
                write!(f, "Sequence {requested} is ahead of head {head}")
            }
        }
    }
}

impl std::error::Error for LogError {}

/// Ordered, compactable history of one page.
pub struct OperationLog {
    page_id: PageId,
    config: LogConfig,
    /// Retained entries, ascending by sequence
    entries: VecDeque<Arc<AppliedOperation>>,
    /// Next sequence that will be assigned
    next_sequence: u64,
    /// Highest sequence handed to durable storage
    flushed_sequence: u64,
    /// Last acknowledged sequence per subscribed session
    acks: HashMap<SessionId, u64>,
    total_appended: u64,
    total_compacted: u64,
}

impl OperationLog {
    pub fn new(page_id: PageId, config: LogConfig) -> Self {
        Self::from_sequence(page_id, config, 0)
    }

    /// Resume after `head`, which is already durable.
    pub fn from_sequence(page_id: PageId, config: LogConfig, head: u64) -> Self {
        Self {
            page_id,
            config,
            entries: VecDeque::new(),
            next_sequence: head + 1,
            flushed_sequence: head,
            acks: HashMap::new(),
            total_appended: 0,
            total_compacted: 0,
        }
    }

    /// Sequence the next accepted operation will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Last assigned sequence (0 for an empty page).
    pub fn head(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Oldest sequence still retained, if any.
    pub fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|e| e.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn total_compacted(&self) -> u64 {
        self.total_compacted
    }

    /// Append the next applied operation.
    pub fn append(&mut self, applied: AppliedOperation) -> Result<Arc<AppliedOperation>, LogError> {
        if applied.page_id() != self.page_id {
            return Err(LogError::WrongPage {
                expected: self.page_id,
                got: applied.page_id(),
            });
        }
        if applied.sequence != self.next_sequence {
            return Err(LogError::OutOfOrder {
                expected: self.next_sequence,
                got: applied.sequence,
            });
        }
        let entry = Arc::new(applied);
        self.entries.push_back(Arc::clone(&entry));
        self.next_sequence += 1;
        self.total_appended += 1;
        Ok(entry)
    }

    pub fn get(&self, sequence: u64) -> Option<&Arc<AppliedOperation>> {
        let oldest = self.oldest()?;
        if sequence < oldest {
            return None;
        }
        self.entries.get((sequence - oldest) as usize)
    }

    /// Every retained entry after `since`, in order.
    pub fn since(&self, since: u64) -> Result<Vec<Arc<AppliedOperation>>, LogError> {
        let head = self.head();
        if since > head {
            return Err(LogError::Ahead {
                requested: since,
                head,
            });
        }
        if since == head {
            return Ok(Vec::new());
        }
        match self.oldest() {
            Some(oldest) if since + 1 >= oldest => Ok(self
                .entries
                .iter()
                .skip((since + 1 - oldest) as usize)
                .cloned()
                .collect()),
            oldest => Err(LogError::Compacted {
                requested: since,
                oldest: oldest.unwrap_or(self.next_sequence),
            }),
        }
    }

    /// Entries for a catch-up replay, or `None` when a snapshot is required.
    pub fn replay_since(&self, since: u64) -> Option<Vec<Arc<AppliedOperation>>> {
        if self.head().saturating_sub(since) > self.config.replay_threshold {
            return None;
        }
        self.since(since).ok()
    }

    // ─── Acknowledgements ─────────────────────────────────────────────

    /// Start tracking a session at `acked`.
    pub fn register(&mut self, session_id: SessionId, acked: u64) {
        let acked = acked.min(self.head());
        self.acks.insert(session_id, acked);
    }

    pub fn unregister(&mut self, session_id: SessionId) {
        self.acks.remove(&session_id);
    }

    /// Record that a session has applied everything up to `sequence`.
    ///
    /// Acks only move forward; a lower value is ignored.
    pub fn acknowledge(&mut self, session_id: SessionId, sequence: u64) -> Result<(), LogError> {
        let head = self.head();
        if sequence > head {
            return Err(LogError::Ahead {
                requested: sequence,
                head,
            });
        }
        let ack = self.acks.entry(session_id).or_insert(0);
        *ack = (*ack).max(sequence);
        Ok(())
    }

    pub fn acked(&self, session_id: SessionId) -> Option<u64> {
        self.acks.get(&session_id).copied()
    }

    /// Lowest ack over subscribed sessions; head when nobody is subscribed.
    pub fn min_ack(&self) -> u64 {
        self.acks.values().copied().min().unwrap_or_else(|| self.head())
    }

    // ─── Durability ───────────────────────────────────────────────────

    pub fn flushed_sequence(&self) -> u64 {
        self.flushed_sequence
    }

    /// Entries not yet handed to durable storage.
    pub fn unflushed(&self) -> Vec<Arc<AppliedOperation>> {
        self.entries
            .iter()
            .filter(|e| e.sequence > self.flushed_sequence)
            .cloned()
            .collect()
    }

    pub fn mark_flushed(&mut self, sequence: u64) {
        self.flushed_sequence = self.flushed_sequence.max(sequence.min(self.head()));
    }

    /// Drop entries every subscriber has acknowledged and storage holds,
    /// keeping the last `history_retention` entries. Returns the count removed.
    pub fn compact(&mut self) -> usize {
        let horizon = self.min_ack().min(self.flushed_sequence);
        let mut removed = 0;
        while self.entries.len() > self.config.history_retention {
            match self.entries.front() {
                Some(front) if front.sequence <= horizon => {
                    self.entries.pop_front();
                    removed += 1;
                }
                _ => break,
            }
        }
        self.total_compacted += removed as u64;
        removed
    }
}
