//! Batch submission and state-vector catch-up.
//!
//! ```text
//! submit ──► [workspace lock] validate ─► clock.next ─► store.append
//!                                  │                        │
//!                                  │                 projection.apply
//!                                  ▼                        │
//!                            per-item reject         hub.broadcast ──► room
//!
//! sync ──► last = state_vector.high_water()
//!          ├─ small gap ─────────────► since(last)
//!          └─ cold / large / pruned ─► latest snapshot + since(snapshot.version)
//! ```
//!
//! The per-workspace lock covers timestamp assignment, persistence and
//! broadcast, so operations reach every room in the order they were
//! appended. Workspaces never share a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::LogicalClock;
use crate::config::SyncConfig;
use crate::element::{Element, ElementId, ElementKind, ElementPatch, ParentRef, UserId, WorkspaceId};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::hub::Hub;
use crate::operation::{Change, Operation, StateVector, Timestamp};
use crate::projection::Projection;
use crate::protocol::{
    BatchItem, ItemResult, OperationPayload, RejectReason, SnapshotPayload, SubmitRequest, SubmitResponse,
    SyncRequest, SyncResponse,
};
use crate::store::OperationStore;

/// In-memory state of one loaded workspace.
struct WorkspaceLog {
    projection: Projection,
    /// Per user: provisional id → assigned id.
    assigned: HashMap<UserId, HashMap<ElementId, ElementId>>,
    /// Assigned id → timestamp of its create.
    created_at: HashMap<ElementId, Timestamp>,
}

enum Prepared {
    Apply { element_id: ElementId, change: Change },
    AlreadyCreated { provisional_id: ElementId, element_id: ElementId, timestamp: Timestamp },
    Reject { element_id: ElementId, reason: RejectReason },
}

impl WorkspaceLog {
    fn new(projection: Projection) -> Self {
        Self {
            projection,
            assigned: HashMap::new(),
            created_at: HashMap::new(),
        }
    }

    fn record(&mut self, op: &Operation) {
        self.projection.apply(op);
        if let Change::Create { provisional_id: Some(provisional), .. } = &op.change {
            self.assigned
                .entry(op.user_id)
                .or_default()
                .insert(*provisional, op.element_id);
            self.created_at.insert(op.element_id, op.timestamp);
        }
    }

    fn resolve(&self, user_id: UserId, id: ElementId) -> ElementId {
        self.assigned
            .get(&user_id)
            .and_then(|ids| ids.get(&id))
            .copied()
            .unwrap_or(id)
    }

    fn remap(&self, user_id: UserId, patch: &mut ElementPatch) {
        if let Some(ids) = self.assigned.get(&user_id) {
            patch.remap_ids(ids);
        }
    }

    fn check_parent(&self, element_id: ElementId, parent: Option<ParentRef>) -> Result<(), RejectReason> {
        match parent {
            Some(ParentRef::Group(parent_id)) => {
                let is_group = self
                    .projection
                    .get(&parent_id)
                    .map(|p| p.kind() == ElementKind::Group)
                    .unwrap_or(false);
                if parent_id == element_id || !is_group {
                    Err(RejectReason::UnknownParent)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn prepare(&self, workspace_id: WorkspaceId, user_id: UserId, item: BatchItem) -> Prepared {
        match item {
            BatchItem::Create { provisional_id, mut patch } => {
                if let Some(element_id) = self.assigned.get(&user_id).and_then(|ids| ids.get(&provisional_id)) {
                    let timestamp = self.created_at.get(element_id).copied().unwrap_or(0);
                    return Prepared::AlreadyCreated {
                        provisional_id,
                        element_id: *element_id,
                        timestamp,
                    };
                }
                self.remap(user_id, &mut patch);
                let element_id = Uuid::new_v4();
                if let Err(reason) = self.check_parent(element_id, patch.parent) {
                    return Prepared::Reject { element_id: provisional_id, reason };
                }
                match Element::from_patch(element_id, workspace_id, &patch) {
                    Some(element) => Prepared::Apply {
                        element_id,
                        change: Change::Create {
                            element,
                            provisional_id: Some(provisional_id),
                        },
                    },
                    None => Prepared::Reject {
                        element_id: provisional_id,
                        reason: RejectReason::MissingContent,
                    },
                }
            }
            BatchItem::Update { element_id, mut patch } => {
                let element_id = self.resolve(user_id, element_id);
                self.remap(user_id, &mut patch);
                if patch.is_empty() {
                    return Prepared::Reject { element_id, reason: RejectReason::EmptyPatch };
                }
                let Some(existing) = self.projection.get(&element_id) else {
                    return Prepared::Reject { element_id, reason: RejectReason::UnknownElement };
                };
                if let Some(content) = &patch.content {
                    if content.kind() != existing.kind() {
                        return Prepared::Reject { element_id, reason: RejectReason::KindMismatch };
                    }
                }
                if let Err(reason) = self.check_parent(element_id, patch.parent) {
                    return Prepared::Reject { element_id, reason };
                }
                let change = match (patch.is_move(), patch.position) {
                    (true, Some(position)) => Change::Move {
                        position,
                        parent: patch.parent,
                    },
                    _ => Change::Update { patch },
                };
                Prepared::Apply { element_id, change }
            }
            BatchItem::Move { element_id, position, mut parent } => {
                let element_id = self.resolve(user_id, element_id);
                if let Some(ParentRef::Group(id)) = &mut parent {
                    *id = self.resolve(user_id, *id);
                }
                if !self.projection.contains_live(&element_id) {
                    return Prepared::Reject { element_id, reason: RejectReason::UnknownElement };
                }
                if let Err(reason) = self.check_parent(element_id, parent) {
                    return Prepared::Reject { element_id, reason };
                }
                Prepared::Apply {
                    element_id,
                    change: Change::Move { position, parent },
                }
            }
            BatchItem::Delete { element_id } => {
                let element_id = self.resolve(user_id, element_id);
                if !self.projection.contains_live(&element_id) {
                    return Prepared::Reject { element_id, reason: RejectReason::UnknownElement };
                }
                Prepared::Apply {
                    element_id,
                    change: Change::Delete,
                }
            }
        }
    }
}

#[derive(Default)]
struct WorkspaceState {
    log: Mutex<Option<WorkspaceLog>>,
    /// Accepted operations since the last checkpoint.
    pending: AtomicU64,
}

/// Serializes writes per workspace and answers catch-up requests.
pub struct SyncCoordinator {
    store: Arc<dyn OperationStore>,
    clock: LogicalClock,
    hub: Arc<Hub>,
    config: SyncConfig,
    workspaces: DashMap<WorkspaceId, Arc<WorkspaceState>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn OperationStore>, hub: Arc<Hub>, config: SyncConfig) -> Self {
        Self {
            store,
            clock: LogicalClock::new(),
            hub,
            config,
            workspaces: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn state(&self, workspace_id: WorkspaceId) -> Arc<WorkspaceState> {
        self.workspaces
            .entry(workspace_id)
            .or_default()
            .value()
            .clone()
    }

    /// Rebuild from the latest snapshot plus the log tail and seed the clock.
    fn load(&self, workspace_id: WorkspaceId) -> SyncResult<WorkspaceLog> {
        let snapshot = self.store.latest_snapshot(workspace_id)?;
        let (projection, mut cursor) = match snapshot {
            Some(snapshot) => {
                let version = snapshot.version;
                (Projection::from_elements(workspace_id, version, snapshot.elements), version)
            }
            None => (Projection::new(workspace_id), 0),
        };

        let mut workspace = WorkspaceLog::new(projection);
        let mut replayed = 0usize;
        loop {
            let page = self.store.since(workspace_id, cursor, self.config.catch_up_page_size)?;
            let Some(last) = page.last() else { break };
            cursor = last.timestamp;
            for op in &page {
                workspace.record(op);
            }
            replayed += page.len();
            if page.len() < self.config.catch_up_page_size {
                break;
            }
        }

        let high_water = self.store.high_water(workspace_id)?;
        self.clock
            .observe(workspace_id, high_water.max(workspace.projection.high_water()));
        log::info!(
            "Loaded workspace {workspace_id}: {} elements, replayed {replayed} ops, high-water {high_water}",
            workspace.projection.live_count()
        );
        Ok(workspace)
    }

    /// Route store failures; corruption evicts the room and the cached state.
    fn store_failure(&self, workspace_id: WorkspaceId, err: StoreError) -> SyncError {
        match err {
            StoreError::Corrupted { .. } | StoreError::OutOfOrder { .. } => {
                log::error!("Workspace {workspace_id} log inconsistent: {err}");
                self.workspaces.remove(&workspace_id);
                self.hub.force_resync(workspace_id);
                SyncError::WorkspaceCorrupted(workspace_id)
            }
            other => {
                log::error!("Store failure in workspace {workspace_id}: {other}");
                SyncError::Store(other)
            }
        }
    }

    fn lift<T>(&self, workspace_id: WorkspaceId, result: SyncResult<T>) -> SyncResult<T> {
        result.map_err(|err| match err {
            SyncError::Store(store_err) => self.store_failure(workspace_id, store_err),
            other => other,
        })
    }

    /// Apply a batch from `user_id`.
    ///
    /// Invalid items are rejected individually. If persistence fails part
    /// way, the operations already appended are still broadcast and the error
    /// is returned; the client retries the whole batch and its creates are
    /// answered with their original ids.
    pub async fn submit(&self, user_id: UserId, request: SubmitRequest) -> SyncResult<SubmitResponse> {
        if request.items.len() > self.config.max_batch_size {
            return Err(SyncError::BatchTooLarge {
                size: request.items.len(),
                max: self.config.max_batch_size,
            });
        }
        let workspace_id = request.workspace_id;
        let state = self.state(workspace_id);
        let mut guard = state.log.lock().await;
        if guard.is_none() {
            let loaded = self.load(workspace_id);
            *guard = Some(self.lift(workspace_id, loaded)?);
        }
        let Some(workspace) = guard.as_mut() else {
            return Err(SyncError::WorkspaceCorrupted(workspace_id));
        };

        let mut results = Vec::with_capacity(request.items.len());
        let mut accepted = Vec::new();
        let mut failure = None;

        for item in request.items {
            match workspace.prepare(workspace_id, user_id, item) {
                Prepared::Reject { element_id, reason } => {
                    log::debug!("Rejected item for {element_id} in workspace {workspace_id}: {reason}");
                    results.push(ItemResult::Rejected { element_id, reason });
                }
                Prepared::AlreadyCreated { provisional_id, element_id, timestamp } => {
                    results.push(ItemResult::Created {
                        provisional_id,
                        element_id,
                        timestamp,
                    });
                }
                Prepared::Apply { element_id, change } => {
                    let provisional_id = match &change {
                        Change::Create { provisional_id, .. } => *provisional_id,
                        _ => None,
                    };
                    let timestamp = self.clock.next(workspace_id);
                    let op = Operation::new(workspace_id, element_id, user_id, timestamp, change);
                    match self.store.append(op) {
                        Ok(op) => {
                            workspace.record(&op);
                            results.push(match provisional_id {
                                Some(provisional_id) => ItemResult::Created {
                                    provisional_id,
                                    element_id,
                                    timestamp,
                                },
                                None => ItemResult::Applied { element_id, timestamp },
                            });
                            accepted.push(op);
                        }
                        Err(err) => {
                            // The timestamp stays consumed
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        if !accepted.is_empty() {
            if let Err(e) = self.hub.broadcast_operations(workspace_id, &accepted) {
                log::error!("Failed to broadcast {} ops in workspace {workspace_id}: {e}", accepted.len());
            }
            state.pending.fetch_add(accepted.len() as u64, Ordering::Relaxed);
        }
        let high_water = workspace.projection.high_water();
        drop(guard);

        if let Some(err) = failure {
            return Err(self.store_failure(workspace_id, err));
        }

        log::debug!(
            "Workspace {workspace_id}: accepted {} of {} items from {user_id}",
            accepted.len(),
            results.len()
        );
        Ok(SubmitResponse {
            request_id: request.request_id,
            workspace_id,
            results,
            high_water,
        })
    }

    /// Answer a catch-up request with either the log delta or the latest
    /// snapshot plus the operations after it, one page at a time.
    pub fn catch_up(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let workspace_id = request.workspace_id;
        let result = self.compute_catch_up(request);
        self.lift(workspace_id, result)
    }

    fn compute_catch_up(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let workspace_id = request.workspace_id;
        let last = request.state_vector.high_water();
        let high_water = self.store.high_water(workspace_id)?;
        let floor = self.store.log_floor(workspace_id)?;

        // A client ahead of the log holds state this server never accepted
        let diverged = last > high_water;
        let pruned = floor > last.saturating_add(1);
        let lagging = high_water - last.min(high_water) > self.config.delta_threshold;

        let snapshot = if last == 0 || diverged || pruned || lagging {
            self.store.latest_snapshot(workspace_id)?
        } else {
            None
        };

        let snapshot = match snapshot {
            Some(s) if last == 0 || diverged || pruned || s.version > last => Some(SnapshotPayload {
                version: s.version,
                elements: s.elements,
            }),
            _ if diverged => Some(SnapshotPayload { version: 0, elements: Vec::new() }),
            _ if pruned => {
                return Err(SyncError::Store(StoreError::Corrupted {
                    workspace_id,
                    timestamp: floor,
                }))
            }
            _ => None,
        };

        let from = snapshot.as_ref().map(|s| s.version).unwrap_or(last);
        let page_size = self.config.catch_up_page_size;
        let ops = self.store.since(workspace_id, from, page_size)?;
        let cursor = ops.last().map(|op| op.timestamp).unwrap_or(from);
        let has_more = ops.len() == page_size && cursor < high_water;

        let mut state_vector = if snapshot.is_some() {
            StateVector::new()
        } else {
            request.state_vector.clone()
        };
        state_vector.merge(&StateVector::from_operations(&ops));
        state_vector.observe(Uuid::nil(), cursor);

        log::debug!(
            "Catch-up for workspace {workspace_id}: from {last}, snapshot={}, {} ops, has_more={has_more}",
            snapshot.as_ref().map(|s| s.version.to_string()).unwrap_or_else(|| "none".into()),
            ops.len()
        );

        Ok(SyncResponse {
            workspace_id,
            snapshot,
            operations: ops.iter().map(OperationPayload::from).collect(),
            cursor,
            high_water,
            has_more,
            state_vector,
        })
    }

    /// Highest persisted timestamp of a workspace.
    pub fn high_water(&self, workspace_id: WorkspaceId) -> SyncResult<Timestamp> {
        let result = self.store.high_water(workspace_id).map_err(SyncError::from);
        self.lift(workspace_id, result)
    }

    /// Live elements and the timestamp they reflect, read under the
    /// workspace lock. Resets the pending-operation counter.
    pub async fn materialize(&self, workspace_id: WorkspaceId) -> SyncResult<(Timestamp, Vec<Element>)> {
        let state = self.state(workspace_id);
        let mut guard = state.log.lock().await;
        if guard.is_none() {
            let loaded = self.load(workspace_id);
            *guard = Some(self.lift(workspace_id, loaded)?);
        }
        let Some(workspace) = guard.as_ref() else {
            return Err(SyncError::WorkspaceCorrupted(workspace_id));
        };
        state.pending.store(0, Ordering::Relaxed);
        Ok((workspace.projection.high_water(), workspace.projection.elements()))
    }

    /// Live elements of a workspace.
    pub async fn elements(&self, workspace_id: WorkspaceId) -> SyncResult<Vec<Element>> {
        let state = self.state(workspace_id);
        let mut guard = state.log.lock().await;
        if guard.is_none() {
            let loaded = self.load(workspace_id);
            *guard = Some(self.lift(workspace_id, loaded)?);
        }
        Ok(guard.as_ref().map(|workspace| workspace.projection.elements()).unwrap_or_default())
    }

    /// Accepted operations since the last checkpoint.
    pub fn pending_operations(&self, workspace_id: WorkspaceId) -> u64 {
        self.workspaces
            .get(&workspace_id)
            .map(|s| s.pending.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Workspaces currently held in memory.
    pub fn loaded_workspaces(&self) -> Vec<WorkspaceId> {
        self.workspaces.iter().map(|s| *s.key()).collect()
    }

    /// Drop the in-memory state of a workspace without a live room, clock
    /// included. State still referenced by an in-flight request is kept.
    pub fn unload(&self, workspace_id: WorkspaceId) -> bool {
        if self.hub.room(&workspace_id).is_some() {
            return false;
        }
        // The clock is forgotten under the shard lock so a concurrent load
        // cannot seed it in between.
        let removed = self
            .workspaces
            .remove_if(&workspace_id, |_, state| {
                let idle = Arc::strong_count(state) == 1;
                if idle {
                    self.clock.forget(workspace_id);
                }
                idle
            })
            .is_some();
        if removed {
            log::debug!("Unloaded workspace {workspace_id}");
        }
        removed
    }
}
