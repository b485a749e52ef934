//! Per-workspace Lamport clock.
//!
//! The server is the single issuer of timestamps. Each workspace owns an
//! independent counter; `next` is strictly increasing per workspace and safe
//! to call from many tasks at once.

use dashmap::DashMap;

use crate::element::WorkspaceId;
use crate::operation::Timestamp;

#[derive(Debug, Default)]
pub struct LogicalClock {
    counters: DashMap<WorkspaceId, Timestamp>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp for `workspace_id`. The first call returns 1.
    pub fn next(&self, workspace_id: WorkspaceId) -> Timestamp {
        let mut counter = self.counters.entry(workspace_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Advance the counter to at least `seen`. Used to seed the clock from the
    /// persisted high-water mark on startup; never moves backwards.
    pub fn observe(&self, workspace_id: WorkspaceId, seen: Timestamp) {
        let mut counter = self.counters.entry(workspace_id).or_insert(0);
        if seen > *counter {
            *counter = seen;
        }
    }

    /// Last issued (or observed) timestamp, 0 if none.
    pub fn current(&self, workspace_id: WorkspaceId) -> Timestamp {
        self.counters.get(&workspace_id).map(|c| *c).unwrap_or(0)
    }

    /// Forget a workspace, e.g. after it is evicted from memory.
    pub fn forget(&self, workspace_id: WorkspaceId) {
        self.counters.remove(&workspace_id);
    }
}
