//! Block operations and their applied results.
//!
//! Clients submit an [`OperationRequest`]. The coordinator stamps it with
//! the session, the authenticated user, and the receive time, producing an
//! [`Operation`]. Once the page session accepts it the operation gets a
//! sequence number and becomes an [`AppliedOperation`]: the unit that is
//! logged, broadcast, replayed, and persisted.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockId, BlockType, FieldMap, PageId, SessionId, UserId};

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where a block lands among the children of its (new) parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Placement {
    /// Before every existing sibling
    Start,
    /// After every existing sibling
    #[default]
    End,
    /// Directly after the given sibling. Falls back to `End` when the
    /// anchor is not a child of the target parent.
    After(BlockId),
}

/// How an update treats fields it does not mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdateMode {
    /// Only the named fields change; `Null` removes a field
    #[default]
    Fields,
    /// The content becomes exactly the given fields
    Replace,
}

/// The mutation an operation performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert {
        parent_id: Option<BlockId>,
        placement: Placement,
        block_type: BlockType,
        content: FieldMap,
    },
    Update {
        block_type: Option<BlockType>,
        fields: FieldMap,
        mode: UpdateMode,
    },
    Move {
        parent_id: Option<BlockId>,
        placement: Placement,
    },
    Delete,
    /// Clear the tombstone and place the block again
    Restore {
        parent_id: Option<BlockId>,
        placement: Placement,
    },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Insert { .. } => "insert",
            OperationKind::Update { .. } => "update",
            OperationKind::Move { .. } => "move",
            OperationKind::Delete => "delete",
            OperationKind::Restore { .. } => "restore",
        }
    }

    /// Target parent for kinds that place a block.
    pub fn parent_id(&self) -> Option<Option<BlockId>> {
        match self {
            OperationKind::Insert { parent_id, .. }
            | OperationKind::Move { parent_id, .. }
            | OperationKind::Restore { parent_id, .. } => Some(*parent_id),
            _ => None,
        }
    }
}

/// Operation as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub page_id: PageId,
    pub block_id: BlockId,
    pub kind: OperationKind,
    /// Block version the client edited against (ignored for inserts)
    pub base_version: u64,
    /// Highest page sequence the client had seen when it issued this
    pub observed_sequence: u64,
}

/// Operation attributed to a session and author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub page_id: PageId,
    pub block_id: BlockId,
    pub kind: OperationKind,
    pub base_version: u64,
    pub observed_sequence: u64,
    pub session_id: SessionId,
    pub author_id: UserId,
    /// Unix millis at which the server received the operation
    pub received_at: u64,
    /// Page sequence; 0 until accepted
    pub sequence: u64,
}

impl Operation {
    pub fn from_request(
        request: OperationRequest,
        session_id: SessionId,
        author_id: UserId,
        received_at: u64,
    ) -> Self {
        Self {
            page_id: request.page_id,
            block_id: request.block_id,
            kind: request.kind,
            base_version: request.base_version,
            observed_sequence: request.observed_sequence,
            session_id,
            author_id,
            received_at,
            sequence: 0,
        }
    }

    /// Same operation, re-targeted at a newer base version.
    pub fn rebased(&self, base_version: u64) -> Self {
        Self {
            base_version,
            ..self.clone()
        }
    }

    /// Same operation with a different kind.
    pub fn with_kind(&self, kind: OperationKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// How a conflict was resolved before the operation was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Stale base, but nobody else touched the fields this operation writes
    Merged { fields: Vec<String> },
    /// This operation replaced writes made by other sessions since its base
    Overwrote {
        sessions: Vec<SessionId>,
        fields: Vec<String>,
    },
    /// The requested parent was deleted; the block went to the nearest live ancestor
    Reparented {
        requested: Option<BlockId>,
        actual: Option<BlockId>,
    },
}

/// An accepted, sequenced operation together with its effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub sequence: u64,
    /// The operation as actually applied (after any rebase)
    pub operation: Operation,
    /// Post-states of every block the operation changed; the target first
    pub blocks: Vec<Block>,
    /// Target block before the operation; `None` for inserts
    pub before: Option<Block>,
    /// Conflict resolutions, empty when the operation applied cleanly
    pub outcomes: Vec<Outcome>,
    /// Children moved out of a deleted block
    pub rescued: Vec<BlockId>,
}

impl AppliedOperation {
    pub fn page_id(&self) -> PageId {
        self.operation.page_id
    }

    pub fn origin(&self) -> SessionId {
        self.operation.session_id
    }

    pub fn target(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Sessions whose writes this operation overwrote, with the fields involved.
    pub fn overwritten(&self) -> impl Iterator<Item = (&SessionId, &[String])> {
        self.outcomes.iter().flat_map(|o| match o {
            Outcome::Overwrote { sessions, fields } => sessions
                .iter()
                .map(|s| (s, fields.as_slice()))
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        })
    }
}
