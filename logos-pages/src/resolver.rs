//! Conflict resolution for operations the block store refused.
//!
//! The resolver is a pure function of the operation and the conflict the
//! store reported. It either rebases the operation so that a retry will
//! apply, or rejects it.
//!
//! | Conflict            | Operation            | Resolution                                 |
//! |---------------------|----------------------|--------------------------------------------|
//! | stale version       | update               | rebase; `Merged` or `Overwrote` per field  |
//! | stale version       | move / restore       | rebase; `Overwrote` if position contested  |
//! | stale version       | delete               | rebase; delete wins over concurrent edits  |
//! | parent unavailable  | insert/move/restore  | rebase onto nearest live ancestor          |
//!
//! Last-writer-wins is decided by arrival order: the operation being
//! resolved arrived later than every write it overwrites.

use std::collections::BTreeSet;

use crate::block::{Block, BlockId, SessionId, POSITION_FIELD, TYPE_FIELD};
use crate::error::{ConflictError, ConflictKind, RejectReason};
use crate::operation::{Operation, OperationKind, Outcome, Placement, UpdateMode};

/// What to do with a conflicting operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Retry with this operation; record the outcome
    Rebase { operation: Operation, outcome: Outcome },
    Reject(RejectReason),
}

/// Stateless conflict resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, op: &Operation, conflict: &ConflictError) -> Resolution {
        match &conflict.kind {
            ConflictKind::StaleVersion => self.resolve_stale(op, &conflict.current),
            ConflictKind::ParentUnavailable {
                surviving_ancestor,
                deleted_root,
            } => self.reparent(op, *surviving_ancestor, *deleted_root),
        }
    }

    fn resolve_stale(&self, op: &Operation, current: &Block) -> Resolution {
        if op.base_version > current.version {
            return Resolution::Reject(RejectReason::Invalid {
                message: format!(
                    "base version {} is ahead of block version {}",
                    op.base_version, current.version
                ),
            });
        }

        let touched: BTreeSet<String> = match &op.kind {
            OperationKind::Update {
                block_type,
                fields,
                mode,
            } => {
                let mut names: BTreeSet<String> = fields.keys().cloned().collect();
                if *mode == UpdateMode::Replace {
                    names.extend(current.content.keys().cloned());
                }
                if block_type.is_some() {
                    names.insert(TYPE_FIELD.to_string());
                }
                names
            }
            OperationKind::Move { .. } | OperationKind::Restore { .. } => {
                BTreeSet::from([POSITION_FIELD.to_string()])
            }
            // A delete discards every concurrent write to the block.
            OperationKind::Delete => current
                .changed_since(op.base_version)
                .map(|(name, _)| name.to_string())
                .collect(),
            OperationKind::Insert { .. } => {
                return Resolution::Reject(RejectReason::Integrity {
                    message: "insert cannot have a stale base".into(),
                });
            }
        };

        let mut sessions: BTreeSet<SessionId> = BTreeSet::new();
        let mut contested: Vec<String> = Vec::new();
        for (name, stamp) in current.changed_since(op.base_version) {
            if stamp.session_id != op.session_id && touched.contains(name) {
                sessions.insert(stamp.session_id);
                contested.push(name.to_string());
            }
        }

        let outcome = if sessions.is_empty() {
            Outcome::Merged {
                fields: touched.into_iter().collect(),
            }
        } else {
            Outcome::Overwrote {
                sessions: sessions.into_iter().collect(),
                fields: contested,
            }
        };
        Resolution::Rebase {
            operation: op.rebased(current.version),
            outcome,
        }
    }

    fn reparent(
        &self,
        op: &Operation,
        surviving_ancestor: Option<BlockId>,
        deleted_root: BlockId,
    ) -> Resolution {
        let placement = Placement::After(deleted_root);
        let (kind, requested) = match &op.kind {
            OperationKind::Insert {
                parent_id,
                block_type,
                content,
                ..
            } => (
                OperationKind::Insert {
                    parent_id: surviving_ancestor,
                    placement,
                    block_type: *block_type,
                    content: content.clone(),
                },
                *parent_id,
            ),
            OperationKind::Move { parent_id, .. } => (
                OperationKind::Move {
                    parent_id: surviving_ancestor,
                    placement,
                },
                *parent_id,
            ),
            OperationKind::Restore { parent_id, .. } => (
                OperationKind::Restore {
                    parent_id: surviving_ancestor,
                    placement,
                },
                *parent_id,
            ),
            other => {
                return Resolution::Reject(RejectReason::Integrity {
                    message: format!("{} does not place a block", other.name()),
                });
            }
        };
        Resolution::Rebase {
            operation: op.with_kind(kind),
            outcome: Outcome::Reparented {
                requested,
                actual: surviving_ancestor,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{fields, BlockType, FieldMap};
    use crate::operation::OperationRequest;
    use crate::order_key::OrderKey;
    use uuid::Uuid;

    fn block_at_v1(session: SessionId) -> Block {
        Block::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            BlockType::Paragraph,
            fields([("text", "hello"), ("color", "red")]),
            OrderKey::first(),
            Uuid::new_v4(),
            session,
            0,
            1,
        )
    }

    /// Simulate another session writing `field` to bring the block to v2.
    fn written_by(mut block: Block, session: SessionId, field: &str) -> Block {
        block.touch(Uuid::new_v4(), 1);
        block.stamp_field(field, session);
        block
    }

    fn op(block: &Block, session: SessionId, kind: OperationKind, base: u64) -> Operation {
        Operation::from_request(
            OperationRequest {
                page_id: block.page_id,
                block_id: block.id,
                kind,
                base_version: base,
                observed_sequence: 0,
            },
            session,
            Uuid::new_v4(),
            2,
        )
    }

    fn update(name: &str, value: &str) -> OperationKind {
        OperationKind::Update {
            block_type: None,
            fields: fields([(name, value)]),
            mode: UpdateMode::Fields,
        }
    }

    fn stale(current: Block) -> ConflictError {
        ConflictError {
            kind: ConflictKind::StaleVersion,
            current,
        }
    }

    #[test]
    fn test_disjoint_fields_merge() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, "color");

        let bobs = op(&current, bob, update("text", "hi"), 1);
        match ConflictResolver::new().resolve(&bobs, &stale(current)) {
            Resolution::Rebase { operation, outcome } => {
                assert_eq!(operation.base_version, 2);
                assert_eq!(
                    outcome,
                    Outcome::Merged {
                        fields: vec!["text".into()]
                    }
                );
            }
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_same_field_overwrites() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, "text");

        let bobs = op(&current, bob, update("text", "bob was here"), 1);
        match ConflictResolver::new().resolve(&bobs, &stale(current)) {
            Resolution::Rebase { outcome, .. } => assert_eq!(
                outcome,
                Outcome::Overwrote {
                    sessions: vec![alice],
                    fields: vec!["text".into()]
                }
            ),
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_own_earlier_write_is_not_contested() {
        let alice = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, "text");
        let again = op(&current, alice, update("text", "again"), 1);
        match ConflictResolver::new().resolve(&again, &stale(current)) {
            Resolution::Rebase { outcome, .. } => {
                assert!(matches!(outcome, Outcome::Merged { .. }))
            }
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_replace_contests_every_field() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, "color");
        let replace = op(
            &current,
            bob,
            OperationKind::Update {
                block_type: None,
                fields: fields([("text", "only")]),
                mode: UpdateMode::Replace,
            },
            1,
        );
        match ConflictResolver::new().resolve(&replace, &stale(current)) {
            Resolution::Rebase { outcome, .. } => assert_eq!(
                outcome,
                Outcome::Overwrote {
                    sessions: vec![alice],
                    fields: vec!["color".into()]
                }
            ),
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_wins_over_edits() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, "text");
        let delete = op(&current, bob, OperationKind::Delete, 1);
        match ConflictResolver::new().resolve(&delete, &stale(current)) {
            Resolution::Rebase { operation, outcome } => {
                assert_eq!(operation.kind, OperationKind::Delete);
                assert_eq!(operation.base_version, 2);
                assert!(matches!(outcome, Outcome::Overwrote { sessions, .. } if sessions == vec![alice]));
            }
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_move_overwrites_position() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let current = written_by(block_at_v1(alice), alice, POSITION_FIELD);
        let mv = op(
            &current,
            bob,
            OperationKind::Move {
                parent_id: None,
                placement: Placement::Start,
            },
            1,
        );
        match ConflictResolver::new().resolve(&mv, &stale(current)) {
            Resolution::Rebase { outcome, .. } => assert_eq!(
                outcome,
                Outcome::Overwrote {
                    sessions: vec![alice],
                    fields: vec![POSITION_FIELD.into()]
                }
            ),
            other => panic!("expected rebase, got {other:?}"),
        }
    }

    #[test]
    fn test_future_base_rejected() {
        let alice = Uuid::new_v4();
        let current = block_at_v1(alice);
        let bogus = op(&current, alice, update("text", "x"), 9);
        assert!(matches!(
            ConflictResolver::new().resolve(&bogus, &stale(current)),
            Resolution::Reject(RejectReason::Invalid { .. })
        ));
    }

    #[test]
    fn test_insert_reparented_after_deleted_root() {
        let alice = Uuid::new_v4();
        let parent = block_at_v1(alice);
        let survivor = Uuid::new_v4();
        let deleted_root = Uuid::new_v4();
        let insert = op(
            &parent,
            alice,
            OperationKind::Insert {
                parent_id: Some(parent.id),
                placement: Placement::End,
                block_type: BlockType::Todo,
                content: FieldMap::new(),
            },
            0,
        );
        let conflict = ConflictError {
            kind: ConflictKind::ParentUnavailable {
                surviving_ancestor: Some(survivor),
                deleted_root,
            },
            current: parent.clone(),
        };
        match ConflictResolver::new().resolve(&insert, &conflict) {
            Resolution::Rebase { operation, outcome } => {
                assert_eq!(
                    operation.kind,
                    OperationKind::Insert {
                        parent_id: Some(survivor),
                        placement: Placement::After(deleted_root),
                        block_type: BlockType::Todo,
                        content: FieldMap::new(),
                    }
                );
                assert_eq!(
                    outcome,
                    Outcome::Reparented {
                        requested: Some(parent.id),
                        actual: Some(survivor)
                    }
                );
            }
            other => panic!("expected rebase, got {other:?}"),
        }
    }
}
