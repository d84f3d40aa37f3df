//! Authoritative in-memory block tree for one page.
//!
//! The store validates and applies operations one at a time. It never
//! resolves conflicts itself: a stale base version or a deleted parent
//! comes back as [`ApplyError::Conflict`] for the resolver to rebase.
//!
//! ```text
//!   Operation ──▶ validate ──▶ mutate ──▶ AppliedOperation
//!                    │                     (post-states, before-state)
//!                    └──▶ ApplyError (store untouched)
//! ```
//!
//! A block is *live* when neither it nor any ancestor is tombstoned.
//! Snapshots contain only live blocks; tombstones stay in the store so
//! that late operations against them can be answered precisely.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::block::{
    is_reserved_field, Block, BlockId, BlockNode, BlockType, FieldMap, PageId, PageInfo,
    POSITION_FIELD, TYPE_FIELD,
};
use crate::error::{ApplyError, ConflictError, ConflictKind};
use crate::operation::{AppliedOperation, Operation, OperationKind, Placement, UpdateMode};
use crate::order_key::OrderKey;

/// Consistent view of a page at one sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page: PageInfo,
    /// Last applied sequence
    pub sequence: u64,
    /// Max version over every block, tombstones included
    pub version: u64,
    /// Live root blocks with their live descendants
    pub blocks: Vec<BlockNode>,
}

impl PageSnapshot {
    /// Live blocks in document (pre-)order.
    pub fn flatten(&self) -> Vec<&Block> {
        fn walk<'a>(nodes: &'a [BlockNode], out: &mut Vec<&'a Block>) {
            for node in nodes {
                out.push(&node.block);
                walk(&node.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.blocks, &mut out);
        out
    }

    pub fn block_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn find(&self, id: BlockId) -> Option<&Block> {
        self.flatten().into_iter().find(|b| b.id == id)
    }

    /// Pretty JSON export of the page tree.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Blocks changed by one operation.
struct Effects {
    blocks: Vec<Block>,
    before: Option<Block>,
    rescued: Vec<BlockId>,
}

/// Block tree for one page.
#[derive(Debug, Clone)]
pub struct BlockStore {
    page: PageInfo,
    blocks: HashMap<BlockId, Block>,
    sequence: u64,
}

impl BlockStore {
    pub fn new(page: PageInfo) -> Self {
        Self {
            page,
            blocks: HashMap::new(),
            sequence: 0,
        }
    }

    /// Rebuild from persisted blocks (tombstones included).
    pub fn from_blocks(page: PageInfo, blocks: Vec<Block>, sequence: u64) -> Result<Self, ApplyError> {
        let mut map = HashMap::with_capacity(blocks.len());
        for block in blocks {
            if block.page_id != page.id {
                return Err(ApplyError::Integrity(format!(
                    "block {} belongs to page {}, not {}",
                    block.id, block.page_id, page.id
                )));
            }
            map.insert(block.id, block);
        }
        for block in map.values() {
            if let Some(parent) = block.parent_id {
                if !map.contains_key(&parent) {
                    return Err(ApplyError::Integrity(format!(
                        "block {} references missing parent {parent}",
                        block.id
                    )));
                }
            }
        }
        Ok(Self {
            page,
            blocks: map,
            sequence,
        })
    }

    /// Rebuild the live tree of a snapshot.
    pub fn from_snapshot(snapshot: &PageSnapshot) -> Self {
        Self {
            page: snapshot.page.clone(),
            blocks: snapshot
                .flatten()
                .into_iter()
                .map(|b| (b.id, b.clone()))
                .collect(),
            sequence: snapshot.sequence,
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn page(&self) -> &PageInfo {
        &self.page
    }

    pub fn page_id(&self) -> PageId {
        self.page.id
    }

    pub fn set_archived(&mut self, archived: bool) {
        self.page.archived = archived;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    /// Number of stored blocks, tombstones included.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Aggregate page version.
    pub fn version(&self) -> u64 {
        self.blocks.values().map(|b| b.version).max().unwrap_or(0)
    }

    /// True when the block and all its ancestors are undeleted.
    pub fn is_live(&self, id: BlockId) -> bool {
        let mut cursor = Some(id);
        let mut hops = 0;
        while let Some(current) = cursor {
            let Some(block) = self.blocks.get(&current) else {
                return false;
            };
            if block.deleted {
                return false;
            }
            hops += 1;
            if hops > self.blocks.len() {
                return false;
            }
            cursor = block.parent_id;
        }
        true
    }

    /// For a non-live block: its nearest live ancestor and the topmost
    /// deleted block on the path to it.
    pub fn surviving_ancestor(&self, id: BlockId) -> (Option<BlockId>, BlockId) {
        let mut deleted_root = id;
        let mut cursor = self.blocks.get(&id).and_then(|b| b.parent_id);
        let mut hops = 0;
        while let Some(current) = cursor {
            if self.is_live(current) {
                return (Some(current), deleted_root);
            }
            deleted_root = current;
            cursor = self.blocks.get(&current).and_then(|b| b.parent_id);
            hops += 1;
            if hops > self.blocks.len() {
                break;
            }
        }
        (None, deleted_root)
    }

    /// Every child of `parent` in sibling order, tombstones included.
    pub fn siblings(&self, parent: Option<BlockId>) -> Vec<&Block> {
        let mut out: Vec<&Block> = self
            .blocks
            .values()
            .filter(|b| b.parent_id == parent)
            .collect();
        out.sort_by(|a, b| a.order_key.cmp(&b.order_key).then(a.id.cmp(&b.id)));
        out
    }

    /// Live children of `parent` in sibling order.
    pub fn children(&self, parent: Option<BlockId>) -> Vec<&Block> {
        if let Some(p) = parent {
            if !self.is_live(p) {
                return Vec::new();
            }
        }
        self.siblings(parent).into_iter().filter(|b| !b.deleted).collect()
    }

    /// Live root blocks in order.
    pub fn root_blocks(&self) -> Vec<&Block> {
        self.children(None)
    }

    /// Live tree at the current sequence.
    pub fn snapshot(&self) -> PageSnapshot {
        let mut by_parent: HashMap<Option<BlockId>, Vec<&Block>> = HashMap::new();
        for block in self.blocks.values().filter(|b| !b.deleted) {
            by_parent.entry(block.parent_id).or_default().push(block);
        }
        for list in by_parent.values_mut() {
            list.sort_by(|a, b| a.order_key.cmp(&b.order_key).then(a.id.cmp(&b.id)));
        }

        fn build(
            parent: Option<BlockId>,
            by_parent: &HashMap<Option<BlockId>, Vec<&Block>>,
            depth: usize,
        ) -> Vec<BlockNode> {
            if depth > by_parent.len() {
                return Vec::new();
            }
            by_parent
                .get(&parent)
                .map(|children| {
                    children
                        .iter()
                        .map(|b| BlockNode {
                            block: (*b).clone(),
                            children: build(Some(b.id), by_parent, depth + 1),
                        })
                        .collect()
                })
                .unwrap_or_default()
        }

        PageSnapshot {
            page: self.page.clone(),
            sequence: self.sequence,
            version: self.version(),
            blocks: build(None, &by_parent, 0),
        }
    }

    // ─── Apply ────────────────────────────────────────────────────────

    /// Validate and apply one operation as `sequence`.
    ///
    /// On error the store is unchanged.
    pub fn apply(&mut self, op: &Operation, sequence: u64) -> Result<AppliedOperation, ApplyError> {
        if op.page_id != self.page.id {
            return Err(ApplyError::Integrity(format!(
                "operation for page {} routed to page {}",
                op.page_id, self.page.id
            )));
        }
        if sequence != self.sequence + 1 {
            return Err(ApplyError::Integrity(format!(
                "sequence {sequence} does not follow {}",
                self.sequence
            )));
        }
        if self.page.archived {
            return Err(ApplyError::PageArchived(self.page.id));
        }

        let effects = match &op.kind {
            OperationKind::Insert {
                parent_id,
                placement,
                block_type,
                content,
            } => self.insert(op, *parent_id, *placement, *block_type, content, sequence)?,
            OperationKind::Update {
                block_type,
                fields,
                mode,
            } => self.update(op, *block_type, fields, *mode)?,
            OperationKind::Move {
                parent_id,
                placement,
            } => self.relocate(op, *parent_id, *placement, sequence, false)?,
            OperationKind::Delete => self.delete(op, sequence)?,
            OperationKind::Restore {
                parent_id,
                placement,
            } => self.relocate(op, *parent_id, *placement, sequence, true)?,
        };

        self.sequence = sequence;
        let mut operation = op.clone();
        operation.sequence = sequence;
        Ok(AppliedOperation {
            sequence,
            operation,
            blocks: effects.blocks,
            before: effects.before,
            outcomes: Vec::new(),
            rescued: effects.rescued,
        })
    }

    /// Apply an already-sequenced operation by copying its post-states.
    pub fn integrate(&mut self, applied: &AppliedOperation) -> Result<(), ApplyError> {
        if applied.page_id() != self.page.id {
            return Err(ApplyError::Integrity("operation for another page".into()));
        }
        if applied.sequence != self.sequence + 1 {
            return Err(ApplyError::Integrity(format!(
                "sequence {} does not follow {}",
                applied.sequence, self.sequence
            )));
        }
        for block in &applied.blocks {
            self.blocks.insert(block.id, block.clone());
        }
        self.sequence = applied.sequence;
        Ok(())
    }

    fn insert(
        &mut self,
        op: &Operation,
        parent_id: Option<BlockId>,
        placement: Placement,
        block_type: BlockType,
        content: &FieldMap,
        sequence: u64,
    ) -> Result<Effects, ApplyError> {
        if self.blocks.contains_key(&op.block_id) {
            return Err(ApplyError::Duplicate(op.block_id));
        }
        validate_fields(content)?;
        self.check_parent(op.block_id, parent_id)?;
        let order_key = self.place(parent_id, placement, op.block_id)?;

        let content: FieldMap = content
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let block = Block::new(
            op.block_id,
            self.page.id,
            parent_id,
            block_type,
            content,
            order_key,
            op.author_id,
            op.session_id,
            op.received_at,
            sequence,
        );
        self.blocks.insert(block.id, block.clone());
        Ok(Effects {
            blocks: vec![block],
            before: None,
            rescued: Vec::new(),
        })
    }

    fn update(
        &mut self,
        op: &Operation,
        block_type: Option<BlockType>,
        fields: &FieldMap,
        mode: UpdateMode,
    ) -> Result<Effects, ApplyError> {
        validate_fields(fields)?;
        let before = self.live_target(op)?.clone();
        let mut block = before.clone();
        block.touch(op.author_id, op.received_at);

        let mut changed: BTreeSet<String> = BTreeSet::new();
        match mode {
            UpdateMode::Fields => {
                for (name, value) in fields {
                    if value.is_null() {
                        if block.content.remove(name).is_some() {
                            changed.insert(name.clone());
                        }
                    } else if block.content.get(name) != Some(value) {
                        block.content.insert(name.clone(), value.clone());
                        changed.insert(name.clone());
                    }
                }
            }
            UpdateMode::Replace => {
                let next: FieldMap = fields
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for name in block.content.keys().chain(next.keys()) {
                    if block.content.get(name) != next.get(name) {
                        changed.insert(name.clone());
                    }
                }
                block.content = next;
            }
        }
        for name in &changed {
            block.stamp_field(name, op.session_id);
        }
        if let Some(new_type) = block_type {
            if new_type != block.block_type {
                block.block_type = new_type;
                block.stamp_field(TYPE_FIELD, op.session_id);
            }
        }

        self.blocks.insert(block.id, block.clone());
        Ok(Effects {
            blocks: vec![block],
            before: Some(before),
            rescued: Vec::new(),
        })
    }

    /// Move a live block, or restore a tombstoned one, to a new position.
    fn relocate(
        &mut self,
        op: &Operation,
        parent_id: Option<BlockId>,
        placement: Placement,
        sequence: u64,
        restore: bool,
    ) -> Result<Effects, ApplyError> {
        let before = if restore {
            let block = self
                .blocks
                .get(&op.block_id)
                .ok_or(ApplyError::NotFound(op.block_id))?;
            if !block.deleted {
                return Err(ApplyError::Invalid(format!("block {} is not deleted", block.id)));
            }
            check_version(block, op)?;
            block.clone()
        } else {
            self.live_target(op)?.clone()
        };
        self.check_parent(op.block_id, parent_id)?;
        let order_key = self.place(parent_id, placement, op.block_id)?;

        let mut block = before.clone();
        block.deleted = false;
        block.parent_id = parent_id;
        block.order_key = order_key;
        block.placed_seq = sequence;
        block.touch(op.author_id, op.received_at);
        block.stamp_field(POSITION_FIELD, op.session_id);

        self.blocks.insert(block.id, block.clone());
        Ok(Effects {
            blocks: vec![block],
            before: Some(before),
            rescued: Vec::new(),
        })
    }

    /// Tombstone a block. Descendants placed after the deleter's observed
    /// sequence are moved up to the deleted block's parent, right after it,
    /// each taking its own subtree along.
    fn delete(&mut self, op: &Operation, sequence: u64) -> Result<Effects, ApplyError> {
        let before = self.live_target(op)?.clone();

        let late = self.late_descendants(before.id, op.observed_sequence);
        let keys = if late.is_empty() {
            Vec::new()
        } else {
            let siblings = self.siblings(before.parent_id);
            let upper = siblings
                .iter()
                .position(|b| b.id == before.id)
                .and_then(|i| siblings.get(i + 1))
                .map(|b| b.order_key.clone());
            OrderKey::sequence(Some(&before.order_key), upper.as_ref(), late.len())
                .map_err(|e| ApplyError::Integrity(e.to_string()))?
        };

        let mut block = before.clone();
        block.deleted = true;
        block.touch(op.author_id, op.received_at);
        self.blocks.insert(block.id, block.clone());

        let mut changed = vec![block];
        for (child_id, key) in late.iter().zip(keys) {
            if let Some(child) = self.blocks.get_mut(child_id) {
                child.parent_id = before.parent_id;
                child.order_key = key;
                child.placed_seq = sequence;
                child.touch(op.author_id, op.received_at);
                child.stamp_field(POSITION_FIELD, op.session_id);
                changed.push(child.clone());
            }
        }

        Ok(Effects {
            blocks: changed,
            before: Some(before),
            rescued: late,
        })
    }

    /// Topmost live blocks under `root` placed after `observed`, in
    /// document order.
    fn late_descendants(&self, root: BlockId, observed: u64) -> Vec<BlockId> {
        let mut late = Vec::new();
        let mut stack: Vec<BlockId> = self.children(Some(root)).iter().rev().map(|b| b.id).collect();
        while let Some(id) = stack.pop() {
            let Some(block) = self.blocks.get(&id) else { continue };
            if block.placed_seq > observed {
                late.push(id);
            } else {
                stack.extend(self.children(Some(id)).iter().rev().map(|b| b.id));
            }
        }
        late
    }

    // ─── Validation helpers ───────────────────────────────────────────

    fn live_target(&self, op: &Operation) -> Result<&Block, ApplyError> {
        let block = self
            .blocks
            .get(&op.block_id)
            .ok_or(ApplyError::NotFound(op.block_id))?;
        if !self.is_live(block.id) {
            return Err(ApplyError::TargetDeleted(block.clone()));
        }
        check_version(block, op)?;
        Ok(block)
    }

    fn check_parent(&self, block_id: BlockId, parent_id: Option<BlockId>) -> Result<(), ApplyError> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let parent = self
            .blocks
            .get(&parent_id)
            .ok_or(ApplyError::NotFound(parent_id))?;
        if self.is_ancestor_or_self(block_id, parent_id) {
            return Err(ApplyError::Cycle {
                block_id,
                parent_id,
            });
        }
        if !self.is_live(parent_id) {
            let (surviving_ancestor, deleted_root) = self.surviving_ancestor(parent_id);
            return Err(ApplyError::Conflict(ConflictError {
                kind: ConflictKind::ParentUnavailable {
                    surviving_ancestor,
                    deleted_root,
                },
                current: parent.clone(),
            }));
        }
        Ok(())
    }

    fn is_ancestor_or_self(&self, ancestor: BlockId, of: BlockId) -> bool {
        let mut cursor = Some(of);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.blocks.len() {
                return true;
            }
            cursor = self.blocks.get(&current).and_then(|b| b.parent_id);
        }
        false
    }

    /// Order key for `moving` under `parent` at `placement`.
    fn place(
        &self,
        parent: Option<BlockId>,
        placement: Placement,
        moving: BlockId,
    ) -> Result<OrderKey, ApplyError> {
        let siblings: Vec<&Block> = self
            .siblings(parent)
            .into_iter()
            .filter(|b| b.id != moving)
            .collect();
        let (lower, upper) = match placement {
            Placement::Start => (None, siblings.first()),
            Placement::End => (siblings.last(), None),
            Placement::After(anchor) => match siblings.iter().position(|b| b.id == anchor) {
                Some(i) => (siblings.get(i), siblings.get(i + 1)),
                None => (siblings.last(), None),
            },
        };
        OrderKey::between(lower.map(|b| &b.order_key), upper.map(|b| &b.order_key))
            .map_err(|e| ApplyError::Integrity(e.to_string()))
    }
}

fn check_version(block: &Block, op: &Operation) -> Result<(), ApplyError> {
    if block.version != op.base_version {
        return Err(ApplyError::Conflict(ConflictError {
            kind: ConflictKind::StaleVersion,
            current: block.clone(),
        }));
    }
    Ok(())
}

fn validate_fields(fields: &FieldMap) -> Result<(), ApplyError> {
    match fields.keys().find(|k| k.is_empty() || is_reserved_field(k)) {
        Some(name) => Err(ApplyError::Invalid(format!("reserved field name {name:?}"))),
        None => Ok(()),
    }
}
