//! Randomized convergence checks.
//!
//! Two peers edit one page from replicas that are only synced now and
//! then, so most operations arrive stale and go through the resolver.
//! Whatever the server decides, replaying its applied operations must
//! rebuild exactly the server's snapshot, in any delivery order.

use std::collections::HashSet;
use std::sync::Arc;

use logos_pages::operation::Placement;
use logos_pages::{
    fields, AppliedOperation, BlockId, BlockStore, BlockType, CatchUp, DocumentStore,
    MemoryDocumentStore, Operation, OperationKind, OperationRequest, PageInfo, PageReplica,
    PageSession, PageSessionManager, PageSnapshot, PagesConfig, ServerMessage, SubmitResult,
    Subscriber, UpdateMode,
};
use proptest::prelude::*;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum Action {
    Insert { parent: Option<usize>, first: bool },
    Update { target: usize, field: usize, value: u8 },
    Move { target: usize, parent: Option<usize> },
    Delete { target: usize },
    Sync,
}

#[derive(Debug, Clone)]
struct Step {
    peer: usize,
    action: Action,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (proptest::option::of(0..16usize), any::<bool>())
            .prop_map(|(parent, first)| Action::Insert { parent, first }),
        3 => (0..16usize, 0..3usize, any::<u8>())
            .prop_map(|(target, field, value)| Action::Update { target, field, value }),
        2 => (0..16usize, proptest::option::of(0..16usize))
            .prop_map(|(target, parent)| Action::Move { target, parent }),
        1 => (0..16usize).prop_map(|target| Action::Delete { target }),
        2 => Just(Action::Sync),
    ]
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(
        (0..2usize, action()).prop_map(|(peer, action)| Step { peer, action }),
        1..60,
    )
}

const FIELDS: [&str; 3] = ["text", "color", "checked"];

struct Peer {
    who: Subscriber,
    session: Arc<PageSession>,
    replica: PageReplica,
}

impl Peer {
    fn base(&self, id: BlockId) -> u64 {
        self.replica.store().get(id).map(|b| b.version).unwrap_or(0)
    }

    fn op(&self, block_id: BlockId, kind: OperationKind, base_version: u64) -> Operation {
        Operation::from_request(
            OperationRequest {
                page_id: self.session.page_id(),
                block_id,
                kind,
                base_version,
                observed_sequence: self.replica.sequence(),
            },
            self.who.session_id,
            self.who.user_id,
            0,
        )
    }
}

fn pick(ids: &[BlockId], index: usize) -> Option<BlockId> {
    if ids.is_empty() {
        None
    } else {
        Some(ids[index % ids.len()])
    }
}

/// Run the script; returns the server snapshot, the initial snapshot,
/// and every applied operation in sequence order.
async fn run(script: Vec<Step>) -> (PageSnapshot, PageSnapshot, Vec<Arc<AppliedOperation>>) {
    let documents = Arc::new(MemoryDocumentStore::new());
    let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Fuzz");
    let page_id = page.id;
    documents.create_page(page).await.unwrap();
    let config = PagesConfig {
        broadcast_capacity: 1024,
        ..PagesConfig::for_testing()
    };
    let manager = PageSessionManager::new(documents, config);

    let mut peers = Vec::new();
    let mut initial = None;
    for name in ["Ada", "Bert"] {
        let who = Subscriber {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: name.into(),
        };
        let (session, sub) = manager.subscribe(page_id, who.clone(), None).await.unwrap();
        let CatchUp::Snapshot(snapshot) = sub.catch_up else {
            panic!("fresh page must send a snapshot");
        };
        initial.get_or_insert_with(|| snapshot.clone());
        peers.push(Peer {
            who,
            session,
            replica: PageReplica::new(&snapshot),
        });
    }

    let mut ids: Vec<BlockId> = Vec::new();
    let mut applied: Vec<Arc<AppliedOperation>> = Vec::new();
    for step in script {
        let peer = &mut peers[step.peer];
        let op = match step.action {
            Action::Sync => {
                for op in applied.iter().skip(peer.replica.sequence() as usize) {
                    peer.replica.observe(&ServerMessage::applied(op)).unwrap();
                }
                continue;
            }
            Action::Insert { parent, first } => {
                let id = Uuid::new_v4();
                ids.push(id);
                let placement = if first { Placement::Start } else { Placement::End };
                peer.op(
                    id,
                    OperationKind::Insert {
                        parent_id: parent.and_then(|i| pick(&ids[..ids.len() - 1], i)),
                        placement,
                        block_type: BlockType::Paragraph,
                        content: fields([("text", "new")]),
                    },
                    0,
                )
            }
            Action::Update {
                target,
                field,
                value,
            } => {
                let Some(id) = pick(&ids, target) else { continue };
                peer.op(
                    id,
                    OperationKind::Update {
                        block_type: None,
                        fields: fields([(FIELDS[field], value.to_string())]),
                        mode: UpdateMode::Fields,
                    },
                    peer.base(id),
                )
            }
            Action::Move { target, parent } => {
                let Some(id) = pick(&ids, target) else { continue };
                peer.op(
                    id,
                    OperationKind::Move {
                        parent_id: parent.and_then(|i| pick(&ids, i)),
                        placement: Placement::End,
                    },
                    peer.base(id),
                )
            }
            Action::Delete { target } => {
                let Some(id) = pick(&ids, target) else { continue };
                peer.op(id, OperationKind::Delete, peer.base(id))
            }
        };
        if let SubmitResult::Applied(op) = peer.session.submit(op).await.unwrap() {
            applied.push(op);
        }
    }

    let server = peers[0].session.snapshot().await;
    (server, initial.unwrap(), applied)
}

/// Every undeleted block's parent chain ends at the page root.
fn assert_acyclic(store: &BlockStore) {
    for block in store.blocks().filter(|b| !b.deleted) {
        let mut cursor = block.parent_id;
        let mut hops = 0;
        while let Some(id) = cursor {
            hops += 1;
            assert!(hops <= store.len(), "cycle through {}", block.id);
            cursor = store.get(id).and_then(|b| b.parent_id);
        }
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_replay_rebuilds_server_snapshot(script in steps()) {
        let (server, initial, applied) = runtime().block_on(run(script));

        let sequences: Vec<u64> = applied.iter().map(|op| op.sequence).collect();
        prop_assert_eq!(sequences, (1..=applied.len() as u64).collect::<Vec<_>>());

        let mut store = BlockStore::from_snapshot(&initial);
        for op in &applied {
            store.integrate(op).unwrap();
        }
        assert_acyclic(&store);
        prop_assert_eq!(store.snapshot(), server.clone());

        let ids: Vec<BlockId> = server.flatten().iter().map(|b| b.id).collect();
        let unique: HashSet<BlockId> = ids.iter().copied().collect();
        prop_assert_eq!(ids.len(), unique.len());
        let live = store.blocks().filter(|b| store.is_live(b.id)).count();
        prop_assert_eq!(live, server.block_count());
    }

    #[test]
    fn test_replica_converges_under_any_delivery_order(
        script in steps(),
        seed in any::<u64>(),
    ) {
        let (server, initial, applied) = runtime().block_on(run(script));

        // Deterministic shuffle of delivery order.
        let mut order: Vec<usize> = (0..applied.len()).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut replica = PageReplica::new(&initial);
        for i in order {
            replica.observe(&ServerMessage::applied(&applied[i])).unwrap();
        }
        prop_assert_eq!(replica.pending(), 0);
        prop_assert_eq!(replica.snapshot(), server);
    }

    #[test]
    fn test_late_joiner_catches_up_by_replay(script in steps(), cut in any::<prop::sample::Index>()) {
        let (server, initial, applied) = runtime().block_on(run(script));

        // A replica that stopped at an arbitrary point resumes from a replay.
        let cut = if applied.is_empty() { 0 } else { cut.index(applied.len() + 1) };
        let mut replica = PageReplica::new(&initial);
        for op in &applied[..cut] {
            replica.observe(&ServerMessage::applied(op)).unwrap();
        }
        let replay = ServerMessage::Replay {
            page_id: initial.page.id,
            operations: applied[cut..].iter().map(|op| (**op).clone()).collect(),
        };
        replica.observe(&replay).unwrap();
        prop_assert_eq!(replica.snapshot(), server);
    }
}
