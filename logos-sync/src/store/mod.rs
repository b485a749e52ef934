//! Durable operation log and snapshot storage.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  append / since   ┌──────────────────┐
//! │ SyncCoordinator│ ────────────────► │ OperationStore   │
//! │ (per-workspace │                   │  MemoryStore     │
//! │  critical sec.)│ ◄──────────────── │  RocksStore      │
//! └───────┬────────┘  latest_snapshot  └────────┬─────────┘
//!         │                                     │ RocksDB column families
//!         │ checkpoint / prune                  ▼
//! ┌───────┴────────┐      ┌───────────────────────────────────────────┐
//! │ Snapshot       │      │ CF "operations"  ws ‖ ts → op (bincode)    │
//! │ Compactor      │      │ CF "element_ops" el ‖ ts → op (bincode)    │
//! └────────────────┘      │ CF "snapshots"   ws ‖ ver → snapshot (lz4) │
//!                         │ CF "metadata"    ws → LogMetadata          │
//!                         └───────────────────────────────────────────┘
//! ```
//!
//! The log is append-only: deletes are tombstone operations. The only
//! removal path is [`OperationStore::prune_operations_before`], called by the
//! compactor below a retained snapshot boundary.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementId, UserId, WorkspaceId};
use crate::error::{StoreError, StoreResult};
use crate::operation::{Operation, Timestamp};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Full materialization of a workspace at a logical timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workspace_id: WorkspaceId,
    /// Every operation with `timestamp <= version` is folded in.
    pub version: Timestamp,
    /// Live elements only; tombstones are dropped at checkpoint time.
    pub elements: Vec<Element>,
    pub element_count: u64,
    /// User that triggered the checkpoint, `None` for the background compactor.
    pub author: Option<UserId>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

impl Snapshot {
    pub fn new(
        workspace_id: WorkspaceId,
        version: Timestamp,
        elements: Vec<Element>,
        author: Option<UserId>,
    ) -> Self {
        Self {
            workspace_id,
            version,
            element_count: elements.len() as u64,
            elements,
            author,
            created_at: unix_now(),
        }
    }
}

/// Append-only, per-workspace ordered operation log plus snapshot table.
///
/// Implementations must be safe to share between tasks. Appends to a single
/// workspace are serialized by the caller.
pub trait OperationStore: Send + Sync {
    /// Persist an accepted operation. Its timestamp must be above the
    /// workspace high-water mark, otherwise [`StoreError::OutOfOrder`].
    fn append(&self, op: Operation) -> StoreResult<Operation>;

    /// Operations with `timestamp > after`, ascending, at most `limit`.
    fn since(&self, workspace_id: WorkspaceId, after: Timestamp, limit: usize) -> StoreResult<Vec<Operation>>;

    /// Every retained operation targeting `element_id`, ascending.
    fn by_element(&self, element_id: ElementId) -> StoreResult<Vec<Operation>>;

    /// Highest persisted timestamp, 0 for an empty log.
    fn high_water(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp>;

    /// Operations below this timestamp may have been pruned; 0 if never.
    fn log_floor(&self, workspace_id: WorkspaceId) -> StoreResult<Timestamp>;

    /// Store a checkpoint. Versions must be strictly increasing.
    fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    fn latest_snapshot(&self, workspace_id: WorkspaceId) -> StoreResult<Option<Snapshot>>;

    /// Versions of all retained snapshots, ascending.
    fn snapshot_versions(&self, workspace_id: WorkspaceId) -> StoreResult<Vec<Timestamp>>;

    /// Remove snapshots with `version < before`. Returns the number removed.
    fn delete_snapshots_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize>;

    /// Remove operations with `timestamp < before` and raise the log floor.
    fn prune_operations_before(&self, workspace_id: WorkspaceId, before: Timestamp) -> StoreResult<usize>;

    /// Workspaces with any persisted state.
    fn workspaces(&self) -> StoreResult<Vec<WorkspaceId>>;
}

/// Check that operations read back from a log are strictly ascending and
/// above `after`. A repeat or a step backwards means the log is corrupt.
pub fn verify_ascending(workspace_id: WorkspaceId, after: Timestamp, ops: &[Operation]) -> StoreResult<()> {
    let mut previous = after;
    for op in ops {
        if op.timestamp <= previous || op.workspace_id != workspace_id {
            return Err(StoreError::Corrupted {
                workspace_id,
                timestamp: op.timestamp,
            });
        }
        previous = op.timestamp;
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
