//! Page and block data model.
//!
//! A page owns a forest of blocks. Each block carries typed content, a
//! parent reference, a fractional order key among its siblings, and a
//! version counter that increases with every accepted mutation.
//!
//! ```text
//! Page
//!  ├── Block (Heading1)        order "i"
//!  │    ├── Block (Todo)       order "i"
//!  │    └── Block (Todo)       order "r"
//!  └── Block (Paragraph)       order "r"
//! ```
//!
//! Per-field stamps record which version and which session last wrote a
//! content field. The conflict resolver reads them to decide whether a
//! stale edit merges cleanly or overwrites someone else's work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::order_key::OrderKey;

pub type PageId = Uuid;
pub type BlockId = Uuid;
pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type WorkspaceId = Uuid;

/// Stamp name for the block type.
pub const TYPE_FIELD: &str = "@type";
/// Stamp name for the block's position (parent + order key).
pub const POSITION_FIELD: &str = "@position";

/// Content field names starting with `@` are reserved for stamps.
pub fn is_reserved_field(name: &str) -> bool {
    name.starts_with('@')
}

// ─── Content ────────────────────────────────────────────────────────

/// Block type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletList,
    NumberedList,
    Todo,
    Code,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Paragraph => "paragraph",
            BlockType::Heading1 => "heading_1",
            BlockType::Heading2 => "heading_2",
            BlockType::Heading3 => "heading_3",
            BlockType::BulletList => "bulleted_list_item",
            BlockType::NumberedList => "numbered_list_item",
            BlockType::Todo => "to_do",
            BlockType::Code => "code",
        }
    }
}

/// A single content field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Setting a field to `Null` removes it
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// Block content: field name → value, ordered for deterministic encoding.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Build a [`FieldMap`] from `(name, value)` pairs.
pub fn fields<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Who last wrote a field, and at which block version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamp {
    pub version: u64,
    pub session_id: SessionId,
}

// ─── Block ──────────────────────────────────────────────────────────

/// A unit of page content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub page_id: PageId,
    /// `None` for blocks at the page root
    pub parent_id: Option<BlockId>,
    pub block_type: BlockType,
    pub content: FieldMap,
    pub order_key: OrderKey,
    /// Starts at 1, bumped on every accepted mutation
    pub version: u64,
    /// Tombstone flag; deleted blocks stay in the store
    pub deleted: bool,
    pub last_writer: UserId,
    /// Unix millis of the last accepted mutation
    pub last_write_at: u64,
    /// Sequence of the operation that last placed this block under its parent
    pub placed_seq: u64,
    /// Per-field write stamps, including `@type` and `@position`
    pub stamps: BTreeMap<String, FieldStamp>,
}

impl Block {
    /// Create a freshly inserted block at version 1.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: BlockId,
        page_id: PageId,
        parent_id: Option<BlockId>,
        block_type: BlockType,
        content: FieldMap,
        order_key: OrderKey,
        author: UserId,
        session_id: SessionId,
        written_at: u64,
        sequence: u64,
    ) -> Self {
        let stamp = FieldStamp {
            version: 1,
            session_id,
        };
        let mut stamps: BTreeMap<String, FieldStamp> =
            content.keys().map(|k| (k.clone(), stamp)).collect();
        stamps.insert(TYPE_FIELD.to_string(), stamp);
        stamps.insert(POSITION_FIELD.to_string(), stamp);

        Self {
            id,
            page_id,
            parent_id,
            block_type,
            content,
            order_key,
            version: 1,
            deleted: false,
            last_writer: author,
            last_write_at: written_at,
            placed_seq: sequence,
            stamps,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.content.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.content.get(name).and_then(FieldValue::as_text)
    }

    pub fn stamp(&self, name: &str) -> Option<&FieldStamp> {
        self.stamps.get(name)
    }

    /// Fields (and `@` stamps) written after `base_version`.
    pub fn changed_since(&self, base_version: u64) -> impl Iterator<Item = (&str, &FieldStamp)> {
        self.stamps
            .iter()
            .filter(move |(_, s)| s.version > base_version)
            .map(|(k, s)| (k.as_str(), s))
    }

    /// Record a write to `name` at the current version.
    pub(crate) fn stamp_field(&mut self, name: &str, session_id: SessionId) {
        self.stamps.insert(
            name.to_string(),
            FieldStamp {
                version: self.version,
                session_id,
            },
        );
    }

    /// Bump the version and record the writer.
    pub(crate) fn touch(&mut self, author: UserId, written_at: u64) {
        self.version += 1;
        self.last_writer = author;
        self.last_write_at = written_at;
    }
}

/// Page metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub id: PageId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    /// Archived pages reject every mutation
    pub archived: bool,
}

impl PageInfo {
    pub fn new(id: PageId, workspace_id: WorkspaceId, title: impl Into<String>) -> Self {
        Self {
            id,
            workspace_id,
            title: title.into(),
            archived: false,
        }
    }
}

/// A live block and its live children, in sibling order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockNode {
    pub block: Block,
    pub children: Vec<BlockNode>,
}
