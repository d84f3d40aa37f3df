//! Wire messages between clients and the page server.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client                                   server
//!   │ Authenticate { token }                 │
//!   │ ─────────────────────────────────────▶ │
//!   │ ◀───────────────────────────────────── │ Authenticated { session_id, .. }
//!   │ Subscribe { page_id, since }           │
//!   │ ─────────────────────────────────────▶ │
//!   │ ◀───────────────────────────────────── │ Snapshot | Replay, PresenceList
//!   │ Operation { client_ref, request }      │
//!   │ ─────────────────────────────────────▶ │
//!   │ ◀───────────────────────────────────── │ OperationAck | OperationRejected
//!   │                                        │ (others: OperationApplied)
//! ```
//!
//! Performance target: encode/decode < 2μs for a typical operation.
//! Reference: Patterson & Hennessy, Section 5.7, Data Compression

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::block::{Block, PageId, SessionId, UserId};
use crate::block_store::PageSnapshot;
use crate::error::{ErrorKind, RejectReason};
use crate::operation::{AppliedOperation, OperationRequest};
use crate::presence::{CursorPosition, PresenceChange, PresenceEntry, SelectionRange};

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    /// `since` is the last sequence the client has for this page
    Subscribe {
        page_id: PageId,
        since: Option<u64>,
    },
    Unsubscribe {
        page_id: PageId,
    },
    /// `client_ref` is echoed back in the ack or rejection
    Operation {
        client_ref: u64,
        request: OperationRequest,
    },
    PresenceUpdate {
        page_id: PageId,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        typing: bool,
    },
    Acknowledge {
        page_id: PageId,
        sequence: u64,
    },
    Undo {
        client_ref: u64,
        page_id: PageId,
        sequence: u64,
    },
    Heartbeat,
    Close,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Authenticated {
        session_id: SessionId,
        user_id: UserId,
        display_name: String,
    },
    AuthenticationFailed {
        reason: String,
    },
    Snapshot {
        page_id: PageId,
        snapshot: PageSnapshot,
    },
    Replay {
        page_id: PageId,
        operations: Vec<AppliedOperation>,
    },
    PresenceList {
        page_id: PageId,
        entries: Vec<PresenceEntry>,
    },
    /// The sender's own operation, as applied
    OperationAck {
        client_ref: u64,
        applied: AppliedOperation,
    },
    /// Another session's operation
    OperationApplied {
        applied: AppliedOperation,
    },
    OperationRejected {
        client_ref: u64,
        page_id: PageId,
        reason: RejectReason,
    },
    /// A later edit replaced fields this session had written
    EditOverwritten {
        page_id: PageId,
        block: Block,
        fields: Vec<String>,
    },
    PresenceChanged {
        page_id: PageId,
        change: PresenceChange,
    },
    /// Presence timed out; the subscription is gone
    SubscriptionExpired {
        page_id: PageId,
    },
    Unsubscribed {
        page_id: PageId,
    },
    HeartbeatAck,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn applied(op: &Arc<AppliedOperation>) -> Self {
        ServerMessage::OperationApplied {
            applied: op.as_ref().clone(),
        }
    }

    pub fn replay(page_id: PageId, operations: &[Arc<AppliedOperation>]) -> Self {
        ServerMessage::Replay {
            page_id,
            operations: operations.iter().map(|op| op.as_ref().clone()).collect(),
        }
    }

    /// Page the message concerns, if any.
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            ServerMessage::Snapshot { page_id, .. }
            | ServerMessage::Replay { page_id, .. }
            | ServerMessage::PresenceList { page_id, .. }
            | ServerMessage::OperationRejected { page_id, .. }
            | ServerMessage::EditOverwritten { page_id, .. }
            | ServerMessage::PresenceChanged { page_id, .. }
            | ServerMessage::SubscriptionExpired { page_id }
            | ServerMessage::Unsubscribed { page_id } => Some(*page_id),
            ServerMessage::OperationAck { applied, .. }
            | ServerMessage::OperationApplied { applied } => Some(applied.page_id()),
            _ => None,
        }
    }
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A text frame or other non-binary payload
    UnexpectedFrame(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(kind) => write!(f, "Unexpected {kind} frame"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
