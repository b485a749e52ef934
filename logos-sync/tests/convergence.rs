//! Convergence properties of the sync engine.
//!
//! Exercises the coordinator, projection, replica and reconciliation buffer
//! together, without sockets: replay determinism, monotonic per-field
//! convergence, idempotent catch-up, snapshot round-trips, provisional id
//! redirection, lost acks and batch splitting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use logos_sync::client::{BatchSink, ReconciliationBuffer, Replica, SaveState};
use logos_sync::compactor::SnapshotCompactor;
use logos_sync::config::{BufferConfig, CompactionConfig, SyncConfig};
use logos_sync::coordinator::SyncCoordinator;
use logos_sync::element::{
    Element, ElementContent, ElementId, ElementPatch, ParentRef, Point, Style, UserId, WorkspaceId,
};
use logos_sync::error::{SyncError, SyncResult};
use logos_sync::hub::Hub;
use logos_sync::operation::{Change, Operation, StateVector};
use logos_sync::projection::Projection;
use logos_sync::protocol::{BatchItem, ItemResult, SubmitRequest, SubmitResponse, SyncRequest};
use logos_sync::store::{MemoryStore, OperationStore};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn coordinator_with(config: SyncConfig) -> (Arc<MemoryStore>, Arc<SyncCoordinator>) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(SyncCoordinator::new(store.clone(), Arc::new(Hub::new(10)), config));
    (store, coordinator)
}

fn coordinator() -> (Arc<MemoryStore>, Arc<SyncCoordinator>) {
    coordinator_with(SyncConfig::default())
}

fn text(s: &str) -> ElementPatch {
    ElementPatch::content(ElementContent::Text { text: s.into() })
}

fn create(provisional_id: ElementId, patch: ElementPatch) -> BatchItem {
    BatchItem::Create { provisional_id, patch }
}

async fn submit(c: &SyncCoordinator, user: UserId, ws: WorkspaceId, items: Vec<BatchItem>) -> Vec<ItemResult> {
    c.submit(user, SubmitRequest { request_id: 0, workspace_id: ws, items })
        .await
        .unwrap()
        .results
}

fn created_id(result: &ItemResult) -> ElementId {
    match result {
        ItemResult::Created { element_id, .. } => *element_id,
        other => panic!("expected created, got {other:?}"),
    }
}

/// Submits straight to a coordinator, optionally holding batches at a gate
/// or losing acks after the batch was applied.
struct CoordinatorSink {
    coordinator: Arc<SyncCoordinator>,
    workspace_id: WorkspaceId,
    user_id: UserId,
    next_request: AtomicU64,
    lose_acks: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    started: Notify,
    gate: Option<Semaphore>,
}

impl CoordinatorSink {
    fn new(coordinator: Arc<SyncCoordinator>, workspace_id: WorkspaceId, user_id: UserId) -> Self {
        Self {
            coordinator,
            workspace_id,
            user_id,
            next_request: AtomicU64::new(0),
            lose_acks: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            started: Notify::new(),
            gate: None,
        }
    }

    fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(100);
        }
    }
}

#[async_trait]
impl BatchSink for CoordinatorSink {
    async fn submit(&self, items: Vec<BatchItem>) -> SyncResult<SubmitResponse> {
        self.batches.lock().push(items.len());
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let response = self
            .coordinator
            .submit(self.user_id, SubmitRequest { request_id, workspace_id: self.workspace_id, items })
            .await?;
        let lost = self
            .lose_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(SyncError::NotConnected);
        }
        Ok(response)
    }
}

fn fast_buffer() -> BufferConfig {
    BufferConfig {
        debounce_ms: 10,
        max_batch_size: 50,
        max_retries: 5,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    }
}

#[tokio::test]
async fn test_replay_matches_live_projection() {
    let (store, c) = coordinator();
    let ws = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let group = Uuid::new_v4();
    let note = Uuid::new_v4();
    let results = submit(
        &c,
        alice,
        ws,
        vec![
            create(group, ElementPatch::content(ElementContent::Group { children: vec![] })),
            create(note, text("note").with_parent(ParentRef::Group(group))),
            create(Uuid::new_v4(), text("scratch")),
        ],
    )
    .await;
    let group_id = created_id(&results[0]);
    let note_id = created_id(&results[1]);
    let scratch_id = created_id(&results[2]);

    submit(
        &c,
        bob,
        ws,
        vec![
            BatchItem::Move { element_id: note_id, position: Point::new(10.0, 4.0), parent: None },
            BatchItem::Update {
                element_id: scratch_id,
                patch: ElementPatch::default().with_style(Style { fill: Some("#ff0".into()), ..Style::default() }),
            },
        ],
    )
    .await;
    submit(
        &c,
        alice,
        ws,
        vec![
            BatchItem::Delete { element_id: scratch_id },
            BatchItem::Update { element_id: note_id, patch: text("edited") },
        ],
    )
    .await;

    let live = c.elements(ws).await.unwrap();
    let ops = store.since(ws, 0, 1000).unwrap();
    assert_eq!(ops.len(), 7);
    assert_eq!(Projection::replay(ws, &ops).elements(), live);

    assert_eq!(live.len(), 2);
    let note = live.iter().find(|e| e.id == note_id).unwrap();
    assert_eq!(note.parent, Some(group_id));
    assert_eq!(note.content, ElementContent::Text { text: "edited".into() });
    assert_eq!(note.position, Point::new(10.0, 4.0));
}

fn permutations(items: &[Operation]) -> Vec<Vec<Operation>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

#[test]
fn test_later_timestamp_never_overwritten() {
    let ws = Uuid::new_v4();
    let id = Uuid::new_v4();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    let element = Element::new(id, ws, ElementContent::Text { text: "t".into() });
    let created = Operation::new(ws, id, a, 1, Change::Create { element, provisional_id: None });
    let edits = vec![
        Operation::new(ws, id, a, 2, Change::Move { position: Point::new(2.0, 0.0), parent: None }),
        Operation::new(ws, id, b, 3, Change::Update {
            patch: ElementPatch::default().with_style(Style { stroke: Some("red".into()), ..Style::default() }),
        }),
        Operation::new(ws, id, b, 4, Change::Move { position: Point::new(4.0, 0.0), parent: None }),
        Operation::new(ws, id, a, 5, Change::Update { patch: text("final") }),
    ];

    let mut canonical = vec![created.clone()];
    canonical.extend(edits.iter().cloned());
    let expected = Projection::replay(ws, &canonical).elements();
    assert_eq!(expected[0].position, Point::new(4.0, 0.0));
    assert_eq!(expected[0].version, 5);

    for order in permutations(&edits) {
        let mut projection = Projection::new(ws);
        projection.apply(&created);
        for op in &order {
            projection.apply(op);
        }
        // Re-applying an older op after a newer one changes nothing
        projection.apply(&edits[0]);
        assert_eq!(projection.elements(), expected);
    }
}

#[tokio::test]
async fn test_catch_up_is_idempotent() {
    let (store, c) = coordinator();
    let ws = Uuid::new_v4();
    submit(&c, Uuid::new_v4(), ws, vec![create(Uuid::new_v4(), text("a")), create(Uuid::new_v4(), text("b"))]).await;

    let first = c.catch_up(&SyncRequest { workspace_id: ws, state_vector: StateVector::new() }).unwrap();
    assert!(first.snapshot.is_none());
    assert_eq!(first.operations.len(), 2);
    assert_eq!(first.cursor, 2);

    for _ in 0..2 {
        let again = c
            .catch_up(&SyncRequest { workspace_id: ws, state_vector: first.state_vector.clone() })
            .unwrap();
        assert!(again.operations.is_empty());
        assert!(again.snapshot.is_none());
        assert_eq!(again.cursor, 2);
        assert!(!again.has_more);
    }
    assert!(store.since(ws, 2, 100).unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_and_tail_rebuild_replica() {
    let (store, c) = coordinator();
    let ws = Uuid::new_v4();
    let user = Uuid::new_v4();
    let compactor = SnapshotCompactor::new(
        c.clone(),
        CompactionConfig { every_n_operations: 0, interval_secs: 0, retained_snapshots: 3 },
    );

    let results = submit(&c, user, ws, vec![create(Uuid::new_v4(), text("a")), create(Uuid::new_v4(), text("b"))]).await;
    let a = created_id(&results[0]);
    compactor.compact(ws, None).await.unwrap();
    submit(
        &c,
        user,
        ws,
        vec![
            BatchItem::Move { element_id: a, position: Point::new(9.0, 9.0), parent: None },
            create(Uuid::new_v4(), text("c")),
        ],
    )
    .await;

    let response = c.catch_up(&SyncRequest { workspace_id: ws, state_vector: StateVector::new() }).unwrap();
    assert_eq!(response.snapshot.as_ref().map(|s| s.version), Some(2));
    assert_eq!(response.operations.len(), 2);

    let mut replica = Replica::new(ws, Uuid::new_v4());
    replica.apply_sync(&response);
    let live = c.elements(ws).await.unwrap();
    assert_eq!(replica.elements(), live);
    assert_eq!(Projection::replay(ws, &store.since(ws, 0, 100).unwrap()).elements(), live);
    assert_eq!(replica.high_water(), 4);
}

#[tokio::test]
async fn test_pending_update_follows_provisional_id() {
    let (_, c) = coordinator();
    let ws = Uuid::new_v4();
    let sink = Arc::new(CoordinatorSink::new(c.clone(), ws, Uuid::new_v4()).gated());
    let buffer = ReconciliationBuffer::spawn(sink.clone(), BufferConfig { debounce_ms: 60_000, ..fast_buffer() });

    let tmp = Uuid::new_v4();
    buffer.track_change(tmp, text("tmp-1"), true).unwrap();
    let flushing = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.flush().await })
    };

    // The create is in flight; this update still names the provisional id
    sink.started.notified().await;
    buffer
        .track_change(tmp, ElementPatch::position(Point::new(42.0, 42.0)), false)
        .unwrap();
    sink.release();
    flushing.await.unwrap().unwrap();

    let server_id = buffer.resolve(tmp).await;
    assert_ne!(server_id, tmp);
    assert_eq!(buffer.pending_count().await, 1);
    buffer.flush().await.unwrap();
    assert_eq!(buffer.pending_count().await, 0);

    let elements = c.elements(ws).await.unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].id, server_id);
    assert_eq!(elements[0].position, Point::new(42.0, 42.0));
    assert_eq!(*sink.batches.lock(), vec![1, 1]);
}

#[tokio::test]
async fn test_concurrent_moves_higher_timestamp_wins() {
    let (store, c) = coordinator();
    let ws = Uuid::new_v4();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let results = submit(&c, alice, ws, vec![create(Uuid::new_v4(), text("shared"))]).await;
    let id = created_id(&results[0]);

    let move_to = |x: f64| vec![BatchItem::Move { element_id: id, position: Point::new(x, x), parent: None }];
    let (a, b) = tokio::join!(
        c.submit(alice, SubmitRequest { request_id: 1, workspace_id: ws, items: move_to(1.0) }),
        c.submit(bob, SubmitRequest { request_id: 1, workspace_id: ws, items: move_to(2.0) }),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let stamp = |r: &SubmitResponse| match r.results[0] {
        ItemResult::Applied { timestamp, .. } => timestamp,
        ref other => panic!("expected applied, got {other:?}"),
    };
    let winner = if stamp(&a) > stamp(&b) { Point::new(1.0, 1.0) } else { Point::new(2.0, 2.0) };

    let live = c.elements(ws).await.unwrap();
    assert_eq!(live[0].position, winner);

    // Peers that see the two moves in opposite orders agree
    let history = store.since(ws, 0, 100).unwrap();
    let mut forward = Replica::new(ws, Uuid::new_v4());
    let mut reversed = Replica::new(ws, Uuid::new_v4());
    forward.apply_remote(&history[0]);
    reversed.apply_remote(&history[0]);
    for op in &history[1..] {
        forward.apply_remote(op);
    }
    for op in history[1..].iter().rev() {
        reversed.apply_remote(op);
    }
    assert_eq!(forward.elements(), live);
    assert_eq!(reversed.elements(), live);
}

#[tokio::test]
async fn test_lost_ack_is_retried_without_duplicates() {
    let (store, c) = coordinator();
    let ws = Uuid::new_v4();
    let user = Uuid::new_v4();
    let existing = submit(&c, user, ws, vec![create(Uuid::new_v4(), text("x")), create(Uuid::new_v4(), text("y"))])
        .await
        .iter()
        .map(created_id)
        .collect::<Vec<_>>();

    let sink = Arc::new(CoordinatorSink::new(c.clone(), ws, user));
    sink.lose_acks.store(1, Ordering::SeqCst);
    let buffer = ReconciliationBuffer::spawn(
        sink.clone(),
        BufferConfig { debounce_ms: 60_000, initial_backoff_ms: 300, max_backoff_ms: 600, ..fast_buffer() },
    );

    // Five pending changes: three creates and two updates
    for i in 0..3 {
        buffer.track_change(Uuid::new_v4(), text(&format!("new {i}")), true).unwrap();
    }
    for (i, id) in existing.iter().enumerate() {
        buffer
            .track_change(*id, ElementPatch::position(Point::new(i as f64, 7.0)), false)
            .unwrap();
    }
    assert_eq!(buffer.pending_count().await, 5);

    // The creates land but their ack is lost
    let err = buffer.flush().await.unwrap_err();
    assert!(err.is_transient());
    assert!(buffer.state().has_unsaved_changes());
    assert_eq!(buffer.pending_count().await, 5);

    let state = timeout(Duration::from_secs(5), buffer.wait_for_state(|s| *s == SaveState::Saved))
        .await
        .unwrap();
    assert_eq!(state, SaveState::Saved);
    assert_eq!(buffer.pending_count().await, 0);

    let elements = c.elements(ws).await.unwrap();
    assert_eq!(elements.len(), 5, "retried creates must not duplicate");
    // 2 seed creates + 3 creates + 2 moves
    assert_eq!(store.operation_count(), 7);
    for (i, id) in existing.iter().enumerate() {
        let element = elements.iter().find(|e| e.id == *id).unwrap();
        assert_eq!(element.position, Point::new(i as f64, 7.0));
    }
}

#[tokio::test]
async fn test_large_pending_set_splits_into_sub_batches() {
    let (_, c) = coordinator_with(SyncConfig { max_batch_size: 2, ..SyncConfig::default() });
    let ws = Uuid::new_v4();

    // The server refuses anything over its limit outright
    let err = c
        .submit(
            Uuid::new_v4(),
            SubmitRequest {
                request_id: 1,
                workspace_id: ws,
                items: (0..3).map(|_| create(Uuid::new_v4(), text("x"))).collect(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::BatchTooLarge { size: 3, max: 2 }));

    let sink = Arc::new(CoordinatorSink::new(c.clone(), ws, Uuid::new_v4()));
    let buffer = ReconciliationBuffer::spawn(
        sink.clone(),
        BufferConfig { debounce_ms: 60_000, max_batch_size: 2, ..fast_buffer() },
    );
    for i in 0..5 {
        buffer.track_change(Uuid::new_v4(), text(&format!("#{i}")), true).unwrap();
    }
    buffer.flush().await.unwrap();

    assert_eq!(*sink.batches.lock(), vec![2, 2, 1]);
    assert_eq!(sink.next_request.load(Ordering::Relaxed), 3);
    assert_eq!(c.elements(ws).await.unwrap().len(), 5);
    assert_eq!(buffer.state(), SaveState::Saved);
}
