//! Snapshot checkpoints and log pruning.
//!
//! A checkpoint materializes the live element set of a workspace at its
//! current high-water and stores it as a [`Snapshot`]. Only the newest
//! `retained_snapshots` are kept; operations older than the oldest retained
//! snapshot are pruned, since any client that far behind is served a
//! snapshot instead of the log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::CompactionConfig;
use crate::coordinator::SyncCoordinator;
use crate::element::{UserId, WorkspaceId};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::operation::Timestamp;
use crate::store::Snapshot;

/// What one compaction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Version of the snapshot written, if any.
    pub snapshot_version: Option<Timestamp>,
    pub snapshots_deleted: usize,
    pub operations_pruned: usize,
}

pub struct SnapshotCompactor {
    coordinator: Arc<SyncCoordinator>,
    config: CompactionConfig,
}

impl SnapshotCompactor {
    pub fn new(coordinator: Arc<SyncCoordinator>, config: CompactionConfig) -> Self {
        Self { coordinator, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Checkpoint a workspace, then apply retention.
    pub async fn compact(&self, workspace_id: WorkspaceId, author: Option<UserId>) -> SyncResult<CompactionReport> {
        let mut report = CompactionReport::default();
        let store = self.coordinator.store().clone();

        let (version, elements) = self.coordinator.materialize(workspace_id).await?;
        let latest = store
            .snapshot_versions(workspace_id)?
            .last()
            .copied()
            .unwrap_or(0);

        if version > latest {
            let snapshot = Snapshot::new(workspace_id, version, elements, author);
            match store.save_snapshot(&snapshot) {
                Ok(()) => {
                    log::info!(
                        "Snapshot of workspace {workspace_id} at {version} ({} elements)",
                        snapshot.element_count
                    );
                    report.snapshot_version = Some(version);
                }
                // A concurrent pass got there first
                Err(StoreError::StaleSnapshot { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let versions = store.snapshot_versions(workspace_id)?;
        let retained = self.config.retained_snapshots.max(1);
        if versions.len() > retained {
            let boundary = versions[versions.len() - retained];
            report.snapshots_deleted = store.delete_snapshots_before(workspace_id, boundary)?;
            report.operations_pruned = store.prune_operations_before(workspace_id, boundary)?;
            log::info!(
                "Compacted workspace {workspace_id}: dropped {} snapshots and {} ops before {boundary}",
                report.snapshots_deleted,
                report.operations_pruned
            );
        }

        Ok(report)
    }

    /// Compact once enough operations accumulated since the last checkpoint.
    pub async fn maybe_compact(&self, workspace_id: WorkspaceId) -> SyncResult<Option<CompactionReport>> {
        let threshold = self.config.every_n_operations;
        if threshold == 0 || self.coordinator.pending_operations(workspace_id) < threshold {
            return Ok(None);
        }
        self.compact(workspace_id, None).await.map(Some)
    }

    /// Checkpoint every loaded workspace with pending operations.
    pub async fn compact_all(&self) -> usize {
        let mut compacted = 0;
        for workspace_id in self.coordinator.loaded_workspaces() {
            if self.coordinator.pending_operations(workspace_id) == 0 {
                continue;
            }
            match self.compact(workspace_id, None).await {
                Ok(_) => compacted += 1,
                Err(SyncError::WorkspaceCorrupted(_)) => {}
                Err(e) => log::error!("Compaction of workspace {workspace_id} failed: {e}"),
            }
        }
        compacted
    }

    /// Periodic checkpoint loop; exits when `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.config.interval_secs == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.compact_all().await;
                    if n > 0 {
                        log::debug!("Periodic compaction checkpointed {n} workspaces");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Final checkpoint so a restart replays as little as possible
        self.compact_all().await;
    }
}
