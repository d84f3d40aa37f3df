//! Error types.
//!
//! [`ApplyError`] is what the block store returns for a single operation;
//! [`RejectReason`] is its wire form. [`PagesError`] is the crate-level
//! error for everything around the store: sessions, storage, transport.

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockId, PageId, SessionId};
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

// ─── Conflicts ──────────────────────────────────────────────────────

/// Why an operation could not be applied as written.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictKind {
    /// The target block moved past the operation's base version
    StaleVersion,
    /// The requested parent (or one of its ancestors) is deleted
    ParentUnavailable {
        /// Nearest live ancestor of the requested parent; `None` = page root
        surviving_ancestor: Option<BlockId>,
        /// Child of the surviving ancestor that roots the deleted subtree
        deleted_root: BlockId,
    },
}

/// A conflict the resolver may be able to rebase.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictError {
    pub kind: ConflictKind,
    /// Current state of the contested block (target or parent)
    pub current: Block,
}

impl std::fmt::Display for ConflictError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConflictKind::StaleVersion => write!(
                f,
                "Block {} is at version {}",
                self.current.id, self.current.version
            ),
            ConflictKind::ParentUnavailable { .. } => {
                write!(f, "Parent {} is deleted", self.current.id)
            }
        }
    }
}

impl std::error::Error for ConflictError {}

// ─── Apply errors ───────────────────────────────────────────────────

/// Block store rejection for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    Conflict(ConflictError),
    /// Target is tombstoned (directly or through an ancestor)
    TargetDeleted(Block),
    NotFound(BlockId),
    /// Insert with an id that already exists
    Duplicate(BlockId),
    /// Move would make a block its own ancestor
    Cycle { block_id: BlockId, parent_id: BlockId },
    Invalid(String),
    PageArchived(PageId),
    /// Operation is addressed to another page or out of sequence
    Integrity(String),
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyError::Conflict(c) => write!(f, "Conflict: {c}"),
            ApplyError::TargetDeleted(b) => write!(f, "Block {} is deleted", b.id),
            ApplyError::NotFound(id) => write!(f, "Block not found: {id}"),
            ApplyError::Duplicate(id) => write!(f, "Block already exists: {id}"),
            ApplyError::Cycle { block_id, parent_id } => {
                write!(f, "Moving {block_id} under {parent_id} creates a cycle")
            }
            ApplyError::Invalid(msg) => write!(f, "Invalid operation: {msg}"),
            ApplyError::PageArchived(id) => write!(f, "Page {id} is archived"),
            ApplyError::Integrity(msg) => write!(f, "Integrity error: {msg}"),
        }
    }
}

impl std::error::Error for ApplyError {}

/// Why an operation was rejected, as sent to the originating session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    TargetDeleted { current: Block },
    NotFound { block_id: BlockId },
    Duplicate { block_id: BlockId },
    Cycle { block_id: BlockId, parent_id: BlockId },
    Invalid { message: String },
    PageArchived,
    NotSubscribed,
    Capacity,
    Integrity { message: String },
    /// The referenced operation is unknown, compacted, or not this session's
    UndoUnavailable { sequence: u64 },
}

impl From<ApplyError> for RejectReason {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::TargetDeleted(current) => RejectReason::TargetDeleted { current },
            ApplyError::NotFound(block_id) => RejectReason::NotFound { block_id },
            ApplyError::Duplicate(block_id) => RejectReason::Duplicate { block_id },
            ApplyError::Cycle { block_id, parent_id } => RejectReason::Cycle { block_id, parent_id },
            ApplyError::Invalid(message) => RejectReason::Invalid { message },
            ApplyError::PageArchived(_) => RejectReason::PageArchived,
            ApplyError::Integrity(message) => RejectReason::Integrity { message },
            ApplyError::Conflict(c) => RejectReason::Integrity {
                message: format!("unresolved conflict: {c}"),
            },
        }
    }
}

// ─── Crate errors ───────────────────────────────────────────────────

/// Coarse error category sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    Authentication,
    Capacity,
    Invalid,
    Internal,
}

/// Errors surfaced by page sessions, the manager, and the coordinator.
#[derive(Debug)]
pub enum PagesError {
    Conflict(ConflictError),
    PageNotFound(PageId),
    BlockNotFound(BlockId),
    /// Identity handoff failed
    Authentication(String),
    /// Connection dropped or outbound channel closed
    Transport(String),
    /// Page session full or shutting down
    Capacity(PageId),
    Integrity(String),
    Invalid(String),
    NotSubscribed { session_id: SessionId, page_id: PageId },
    Store(StoreError),
    Protocol(ProtocolError),
}

impl PagesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PagesError::Conflict(_) => ErrorKind::Conflict,
            PagesError::PageNotFound(_) | PagesError::BlockNotFound(_) => ErrorKind::NotFound,
            PagesError::Authentication(_) => ErrorKind::Authentication,
            PagesError::Capacity(_) => ErrorKind::Capacity,
            PagesError::Invalid(_) | PagesError::NotSubscribed { .. } | PagesError::Protocol(_) => {
                ErrorKind::Invalid
            }
            PagesError::Transport(_) | PagesError::Integrity(_) | PagesError::Store(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Errors after which a client session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PagesError::Authentication(_) | PagesError::Transport(_))
    }
}

impl std::fmt::Display for PagesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PagesError::Conflict(c) => write!(f, "Conflict: {c}"),
            PagesError::PageNotFound(id) => write!(f, "Page not found: {id}"),
            PagesError::BlockNotFound(id) => write!(f, "Block not found: {id}"),
            PagesError::Authentication(e) => write!(f, "Authentication failed: {e}"),
            PagesError::Transport(e) => write!(f, "Transport error: {e}"),
            PagesError::Capacity(id) => write!(f, "Page {id} is at capacity"),
            PagesError::Integrity(e) => write!(f, "Integrity error: {e}"),
            PagesError::Invalid(e) => write!(f, "Invalid request: {e}"),
            PagesError::NotSubscribed { session_id, page_id } => {
                write!(f, "Session {session_id} is not subscribed to page {page_id}")
            }
            PagesError::Store(e) => write!(f, "Store error: {e}"),
            PagesError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for PagesError {}

impl From<StoreError> for PagesError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => PagesError::PageNotFound(id),
            other => PagesError::Store(other),
        }
    }
}

impl From<ProtocolError> for PagesError {
    fn from(e: ProtocolError) -> Self {
        PagesError::Protocol(e)
    }
}

impl From<ConflictError> for PagesError {
    fn from(e: ConflictError) -> Self {
        PagesError::Conflict(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_store_not_found_maps_to_page_not_found() {
        let id = Uuid::new_v4();
        let err: PagesError = StoreError::NotFound(id).into();
        assert!(matches!(err, PagesError::PageNotFound(p) if p == id));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(PagesError::Authentication("bad token".into()).is_fatal());
        assert!(PagesError::Transport("closed".into()).is_fatal());
        assert!(!PagesError::Capacity(Uuid::nil()).is_fatal());
        assert!(!PagesError::Invalid("x".into()).is_fatal());
    }

    #[test]
    fn test_reject_reason_from_apply_error() {
        let id = Uuid::new_v4();
        assert_eq!(
            RejectReason::from(ApplyError::NotFound(id)),
            RejectReason::NotFound { block_id: id }
        );
        assert_eq!(
            RejectReason::from(ApplyError::PageArchived(id)),
            RejectReason::PageArchived
        );
    }

    #[test]
    fn test_error_display() {
        let err = PagesError::Capacity(Uuid::nil());
        assert!(err.to_string().contains("capacity"));
        let err = ApplyError::Invalid("reserved field".into());
        assert!(err.to_string().contains("reserved field"));
    }
}
