//! # logos-pages: Real-time collaborative block pages for Logos
//!
//! A page is a tree of typed blocks edited concurrently by many clients.
//! The server holds the authoritative copy of every open page, applies
//! operations in receive order, resolves conflicts, and fans the results
//! out to every subscriber.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌────────────────────┐
//! │ PagesClient │ ◄─────────────────► │ SessionCoordinator │  (one per connection)
//! │ PageReplica │   bincode messages  └─────────┬──────────┘
//! └─────────────┘                               │
//!                                               ▼
//!                                    ┌────────────────────┐
//!                                    │ PageSessionManager │ ── DocumentStore
//!                                    └─────────┬──────────┘    (RocksDB | memory)
//!                                              │ one per open page
//!                                              ▼
//!                      ┌──────────────────── PageSession ───────────────────┐
//!                      │ BlockStore · OperationLog · PresenceTracker        │
//!                      │ ConflictResolver · BroadcastGroup (fan-out)        │
//!                      └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`block`], [`order_key`], [`operation`]: data model
//! - [`block_store`]: authoritative block tree of one page
//! - [`oplog`]: sequenced operation log with acks, replay, compaction
//! - [`resolver`]: conflict policy for stale operations
//! - [`presence`]: cursors, selections, heartbeat expiry
//! - [`page_session`], [`manager`]: live pages and their lifecycle
//! - [`coordinator`], [`protocol`], [`server`], [`client`]: connections
//! - [`storage`]: durable page store
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Apply + broadcast one operation | <50μs |
//! | Message encode/decode | <2μs |
//! | Snapshot of a 1K-block page | <1ms |

pub mod block;
pub mod block_store;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod manager;
pub mod operation;
pub mod oplog;
pub mod order_key;
pub mod page_session;
pub mod presence;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use block::{
    fields, Block, BlockId, BlockNode, BlockType, FieldMap, FieldStamp, FieldValue, PageId,
    PageInfo, SessionId, UserId, WorkspaceId,
};
pub use block_store::{BlockStore, PageSnapshot};
pub use broadcast::{BroadcastGroup, BroadcastStats, PageEvent};
pub use client::{ConnectionState, PageReplica, PagesClient};
pub use config::{ConfigError, PagesConfig, ServerConfig, TokenGrant};
pub use coordinator::{SessionCoordinator, SessionState};
pub use error::{ApplyError, ConflictError, ErrorKind, PagesError, RejectReason};
pub use identity::{Credentials, Identity, IdentityError, IdentityService, StaticIdentityService};
pub use manager::PageSessionManager;
pub use operation::{
    AppliedOperation, Operation, OperationKind, OperationRequest, Outcome, Placement, UpdateMode,
};
pub use oplog::{LogConfig, LogError, OperationLog};
pub use page_session::{CatchUp, PageSession, PageSessionStats, SubmitResult, Subscriber, Subscription};
pub use presence::{
    CursorColor, CursorPosition, DepartureReason, PresenceChange, PresenceEntry, PresenceTracker,
    SelectionRange,
};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use resolver::{ConflictResolver, Resolution};
pub use server::{PagesServer, ServerStats};
pub use storage::{
    DocumentStore, FlushBatch, MemoryDocumentStore, RocksDocumentStore, StoreConfig, StoreError,
    StoredPage,
};
