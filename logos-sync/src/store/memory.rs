//! In-process store used when no storage path is configured, and in tests.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{verify_ascending, OperationStore, Snapshot};
use crate::element::{ElementId, WorkspaceId};
use crate::error::{StoreError, StoreResult};
use crate::operation::{Operation, Timestamp};

#[derive(Debug, Default)]
struct WorkspaceLog {
    /// Ascending by timestamp.
    ops: Vec<Operation>,
    snapshots: BTreeMap<Timestamp, Snapshot>,
    high_water: Timestamp,
    floor: Timestamp,
}

/// Volatile [`OperationStore`]. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    logs: RwLock<HashMap<WorkspaceId, WorkspaceLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total operations retained across all workspaces.
    pub fn operation_count(&self) -> usize {
        self.logs.read().values().map(|log| log.ops.len()).sum()
    }
}

impl OperationStore for MemoryStore {
    fn append(&self, op: Operation) -> StoreResult<Operation> {
        let mut logs = self.logs.write();
        let log = logs.entry(op.workspace_id).or_default();
        if op.timestamp <= log.high_water {
            return Err(StoreError::OutOfOrder {
                workspace_id: op.workspace_id,
                timestamp: op.timestamp,
                high_water: log.high_water,
            });
        }
        log.high_water = op.timestamp;
        log.ops.push(op.clone());
        Ok(op)
    }

    fn since(&self, workspace_id: WorkspaceId, after: Timestamp, limit: usize) -> StoreResult<Vec<Operation>> {
        let logs = self.logs.read();
        let Some(log) = logs.get(&workspace_id) else {
            return Ok(Vec::new());
        };
        let start = log.ops.partition_point(|op| op.timestamp <= after);
        let ops: Vec<Operation> = log.ops[start..].iter().take(limit).cloned().collect();
        verify_ascending(workspace_id, after, &ops)?;
        Ok(ops)
    }

    fn by_element(&self, element_id: ElementId) -> StoreResult<Vec<Operation>> {
        let logs = self.logs.read();
        let mut ops: Vec<Operation> = logs
            .values()
            .flat_map(|log| log.ops.iter())
            .filter(|op| op.element_id == element_id)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.order_key());
        Ok(ops)
    }

    fn high_water(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp> {
        Ok(self.logs.read().get(&workspace_id).map(|log| log.high_water).unwrap_or(0))
    }

    fn log_floor(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp> {
        Ok(self.logs.read().get(&workspace_id).map(|log| log.floor).unwrap_or(0))
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let mut logs = self.logs.write();
        let log = logs.entry(snapshot.workspace_id).or_default();
        if let Some((&latest, _)) = log.snapshots.last_key_value() {
            if snapshot.version <= latest {
                return Err(StoreError::StaleSnapshot {
                    workspace_id: snapshot.workspace_id,
                    version: snapshot.version,
                    latest,
                });
            }
        }
        log.snapshots.insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    fn latest_snapshot(&self, workspace_id: WorkspaceId) -> StoreResult<Option<Snapshot>> {
        let logs = self.logs.read();
        Ok(logs
            .get(&workspace_id)
            .and_then(|log| log.snapshots.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    fn snapshot_versions(&self, workspace_id: WorkspaceId) -> StoreResult<Vec<Timestamp>> {
        let logs = self.logs.read();
        Ok(logs
            .get(&workspace_id)
            .map(|log| log.snapshots.keys().copied().collect())
            .unwrap_or_default())
    }

    fn delete_snapshots_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize> {
        let mut logs = self.logs.write();
        let Some(log) = logs.get_mut(&workspace_id) else {
            return Ok(0);
        };
        let retained = log.snapshots.split_off(&before);
        let removed = log.snapshots.len();
        log.snapshots = retained;
        Ok(removed)
    }

    fn prune_operations_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize> {
        let mut logs = self.logs.write();
        let Some(log) = logs.get_mut(&workspace_id) else {
            return Ok(0);
        };
        let cut = log.ops.partition_point(|op| op.timestamp < before);
        log.ops.drain(..cut);
        log.floor = log.floor.max(before);
        Ok(cut)
    }

    fn workspaces(&self) -> StoreResult<Vec<WorkspaceId>> {
        Ok(self.logs.read().keys().copied().collect())
    }
}
