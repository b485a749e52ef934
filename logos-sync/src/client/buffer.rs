//! Client-side optimistic batching.
//!
//! Local mutations are merged into a pending map keyed by element id and
//! saved after a debounce window (or on [`ReconciliationBuffer::flush`]).
//! A save runs in two phases:
//!
//! ```text
//!  pending ──► creates (chunked) ──► ack: provisional → server ids
//!                                         │ retarget pending, notify
//!                                         ▼
//!              updates / moves / deletes (chunked) ──► ack ──► saved
//! ```
//!
//! State machine: `idle → pending → saving → saved | error → (backoff) → saving`.
//! Entries leave the pending map only once the batch carrying them is
//! acknowledged, so a failed save loses nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::config::BufferConfig;
use crate::element::{ElementId, ElementPatch};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{BatchItem, ItemResult, RejectReason, SubmitResponse};

/// Destination of saved batches, usually a connected `SyncClient`.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit(&self, items: Vec<BatchItem>) -> SyncResult<SubmitResponse>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Pending,
    Saving,
    Saved,
    Error { attempts: u32, message: String },
}

impl SaveState {
    /// Whether the UI should show "unsaved changes".
    pub fn has_unsaved_changes(&self) -> bool {
        matches!(self, SaveState::Pending | SaveState::Saving | SaveState::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    StateChanged(SaveState),
    /// Provisional ids replaced by server ids, in create order.
    IdsRemapped(Vec<(ElementId, ElementId)>),
    Rejected { element_id: ElementId, reason: RejectReason },
    Saved { acknowledged: usize },
}

#[derive(Debug, Clone)]
enum PendingChange {
    Create(ElementPatch),
    Update(ElementPatch),
    Delete,
}

#[derive(Debug, Clone)]
struct Entry {
    change: PendingChange,
    seq: u64,
}

enum Command {
    Track { element_id: ElementId, patch: ElementPatch, is_new: bool },
    Delete { element_id: ElementId },
    Flush(oneshot::Sender<SyncResult<()>>),
    Pause,
    Resume,
    PendingCount(oneshot::Sender<usize>),
    Resolve(ElementId, oneshot::Sender<ElementId>),
    Shutdown(oneshot::Sender<SyncResult<()>>),
}

/// Handle to the buffer task. Cheap to clone.
#[derive(Clone)]
pub struct ReconciliationBuffer {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<BufferEvent>,
    state: watch::Receiver<SaveState>,
}

impl ReconciliationBuffer {
    /// Start the buffer task on the current runtime.
    pub fn spawn(sink: Arc<dyn BatchSink>, config: BufferConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (state_tx, state) = watch::channel(SaveState::Idle);
        let actor = BufferActor {
            sink,
            config,
            pending: HashMap::new(),
            id_map: HashMap::new(),
            next_seq: 0,
            attempts: 0,
            paused: false,
            deadline: None,
            events: events.clone(),
            state: state_tx,
        };
        tokio::spawn(actor.run(rx));
        Self { commands, events, state }
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Shutdown)
    }

    /// Merge a local change into the pending set and restart the debounce.
    pub fn track_change(&self, element_id: ElementId, patch: ElementPatch, is_new: bool) -> SyncResult<()> {
        self.send(Command::Track { element_id, patch, is_new })
    }

    /// Record a delete. Deleting a never-saved element just drops its create.
    pub fn track_delete(&self, element_id: ElementId) -> SyncResult<()> {
        self.send(Command::Delete { element_id })
    }

    /// Save now, bypassing the debounce. Resolves once the pending set is
    /// empty or the save failed.
    pub async fn flush(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx))?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Suppress timer-driven saves. `flush` still saves.
    pub fn pause(&self) -> SyncResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> SyncResult<()> {
        self.send(Command::Resume)
    }

    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Server id for a provisional id, or the id itself.
    pub async fn resolve(&self, element_id: ElementId) -> ElementId {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Resolve(element_id, tx)).is_err() {
            return element_id;
        }
        rx.await.unwrap_or(element_id)
    }

    pub fn state(&self) -> SaveState {
        self.state.borrow().clone()
    }

    /// Wait until the state satisfies `f`.
    pub async fn wait_for_state(&self, f: impl Fn(&SaveState) -> bool) -> SaveState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| f(s)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BufferEvent> {
        self.events.subscribe()
    }

    /// Final save attempt, then stop the task.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| SyncError::Shutdown)?
    }
}

struct BufferActor {
    sink: Arc<dyn BatchSink>,
    config: BufferConfig,
    pending: HashMap<ElementId, Entry>,
    /// Provisional id → server id.
    id_map: HashMap<ElementId, ElementId>,
    next_seq: u64,
    attempts: u32,
    paused: bool,
    deadline: Option<Instant>,
    events: broadcast::Sender<BufferEvent>,
    state: watch::Sender<SaveState>,
}

impl BufferActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let timer = self.deadline.filter(|_| !self.paused);
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command).await {
                        break;
                    }
                }
                _ = async {
                    match timer {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.deadline = None;
                    // Failures are reflected in the state and rescheduled
                    let _ = self.save().await;
                }
            }
        }
        if !self.pending.is_empty() {
            log::warn!("Reconciliation buffer stopped with {} unsaved changes", self.pending.len());
        }
    }

    /// Returns `false` when the task should stop.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Track { element_id, patch, is_new } => {
                if self.track(element_id, patch, is_new) {
                    self.schedule();
                }
            }
            Command::Delete { element_id } => {
                self.delete(element_id);
                if self.pending.is_empty() {
                    self.deadline = None;
                    self.set_state(SaveState::Idle);
                } else {
                    self.schedule();
                }
            }
            Command::Flush(reply) => {
                self.deadline = None;
                let _ = reply.send(self.save().await);
            }
            Command::Pause => self.paused = true,
            Command::Resume => {
                self.paused = false;
                if !self.pending.is_empty() && self.deadline.is_none() {
                    self.schedule();
                }
            }
            Command::PendingCount(reply) => {
                let _ = reply.send(self.pending.len());
            }
            Command::Resolve(id, reply) => {
                let _ = reply.send(self.resolve(id));
            }
            Command::Shutdown(reply) => {
                self.deadline = None;
                let _ = reply.send(self.save().await);
                return false;
            }
        }
        true
    }

    fn resolve(&self, id: ElementId) -> ElementId {
        self.id_map.get(&id).copied().unwrap_or(id)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn track(&mut self, element_id: ElementId, mut patch: ElementPatch, is_new: bool) -> bool {
        if patch.is_empty() {
            return false;
        }
        let id = self.resolve(element_id);
        // Already created on the server: further changes are updates
        let is_new = is_new && id == element_id;
        patch.remap_ids(&self.id_map);

        match self.pending.get_mut(&id) {
            Some(Entry { change: PendingChange::Create(pending) | PendingChange::Update(pending), .. }) => {
                pending.merge(patch);
            }
            Some(Entry { change: PendingChange::Delete, .. }) => {
                log::debug!("Ignoring change to deleted element {id}");
                return false;
            }
            None => {
                let change = if is_new {
                    PendingChange::Create(patch)
                } else {
                    PendingChange::Update(patch)
                };
                let seq = self.next_seq();
                self.pending.insert(id, Entry { change, seq });
            }
        }
        true
    }

    fn delete(&mut self, element_id: ElementId) {
        let id = self.resolve(element_id);
        match self.pending.get_mut(&id) {
            Some(Entry { change: PendingChange::Create(_), .. }) => {
                log::debug!("Element {id} deleted before it was saved; dropping its create");
                self.pending.remove(&id);
            }
            Some(entry) => entry.change = PendingChange::Delete,
            None => {
                let seq = self.next_seq();
                self.pending.insert(id, Entry { change: PendingChange::Delete, seq });
            }
        }
    }

    fn schedule(&mut self) {
        self.attempts = 0;
        self.deadline = Some(Instant::now() + self.config.debounce());
        self.set_state(SaveState::Pending);
    }

    fn set_state(&self, state: SaveState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state.clone());
        let _ = self.events.send(BufferEvent::StateChanged(state));
    }

    fn emit(&self, event: BufferEvent) {
        let _ = self.events.send(event);
    }

    async fn save(&mut self) -> SyncResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.set_state(SaveState::Saving);

        let result = match self.save_creates().await {
            Ok(created) => self.save_updates().await.map(|updated| created + updated),
            Err(e) => Err(e),
        };

        match result {
            Ok(acknowledged) => {
                self.attempts = 0;
                self.emit(BufferEvent::Saved { acknowledged });
                if self.pending.is_empty() {
                    self.set_state(SaveState::Saved);
                } else {
                    self.schedule();
                }
                Ok(())
            }
            Err(e) => {
                self.attempts += 1;
                self.set_state(SaveState::Error {
                    attempts: self.attempts,
                    message: e.to_string(),
                });
                if self.attempts <= self.config.max_retries {
                    let delay = self.config.backoff(self.attempts);
                    log::warn!(
                        "Save failed (attempt {}), retrying in {delay:?}: {e}",
                        self.attempts
                    );
                    self.deadline = Some(Instant::now() + delay);
                } else {
                    log::error!(
                        "Save failed {} times, keeping {} unsaved changes: {e}",
                        self.attempts,
                        self.pending.len()
                    );
                    self.deadline = None;
                }
                Err(e)
            }
        }
    }

    /// Ids of pending entries matching `f`, oldest first.
    fn ordered(&self, f: impl Fn(&PendingChange) -> bool) -> Vec<ElementId> {
        let mut ids: Vec<(u64, ElementId)> = self
            .pending
            .iter()
            .filter(|(_, e)| f(&e.change))
            .map(|(id, e)| (e.seq, *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn chunk_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    async fn save_creates(&mut self) -> SyncResult<usize> {
        let creates = self.ordered(|c| matches!(c, PendingChange::Create(_)));
        let mut acknowledged = 0;

        for chunk in creates.chunks(self.chunk_size()) {
            let items: Vec<BatchItem> = chunk
                .iter()
                .filter_map(|id| match &self.pending.get(id)?.change {
                    PendingChange::Create(patch) => {
                        let mut patch = patch.clone();
                        patch.remap_ids(&self.id_map);
                        Some(BatchItem::Create { provisional_id: *id, patch })
                    }
                    _ => None,
                })
                .collect();
            if items.is_empty() {
                continue;
            }

            let response = self.sink.submit(items).await?;
            let mut remapped = Vec::new();
            for result in response.results {
                match result {
                    ItemResult::Created { provisional_id, element_id, .. } => {
                        self.pending.remove(&provisional_id);
                        self.id_map.insert(provisional_id, element_id);
                        remapped.push((provisional_id, element_id));
                        acknowledged += 1;
                    }
                    ItemResult::Rejected { element_id, reason } => {
                        self.pending.remove(&element_id);
                        log::warn!("Create of {element_id} rejected: {reason}");
                        self.emit(BufferEvent::Rejected { element_id, reason });
                        acknowledged += 1;
                    }
                    ItemResult::Applied { .. } => acknowledged += 1,
                }
            }
            if !remapped.is_empty() {
                self.retarget(&remapped);
                self.emit(BufferEvent::IdsRemapped(remapped));
            }
        }
        Ok(acknowledged)
    }

    /// Rewrite provisional ids still referenced by pending entries.
    fn retarget(&mut self, remapped: &[(ElementId, ElementId)]) {
        let map: HashMap<ElementId, ElementId> = remapped.iter().copied().collect();
        for (provisional, server) in remapped {
            let Some(entry) = self.pending.remove(provisional) else { continue };
            match self.pending.get_mut(server) {
                Some(existing) => match entry.change {
                    PendingChange::Update(moved) => {
                        if let PendingChange::Update(current) = &mut existing.change {
                            current.merge(moved);
                        }
                    }
                    PendingChange::Delete => existing.change = PendingChange::Delete,
                    PendingChange::Create(_) => {}
                },
                None => {
                    self.pending.insert(*server, entry);
                }
            }
        }
        for entry in self.pending.values_mut() {
            if let PendingChange::Create(patch) | PendingChange::Update(patch) = &mut entry.change {
                patch.remap_ids(&map);
            }
        }
    }

    async fn save_updates(&mut self) -> SyncResult<usize> {
        let rest = self.ordered(|c| !matches!(c, PendingChange::Create(_)));
        let mut acknowledged = 0;

        for chunk in rest.chunks(self.chunk_size()) {
            let items: Vec<BatchItem> = chunk
                .iter()
                .filter_map(|id| match &self.pending.get(id)?.change {
                    PendingChange::Update(patch) => Some(BatchItem::from_patch(*id, patch.clone())),
                    PendingChange::Delete => Some(BatchItem::Delete { element_id: *id }),
                    PendingChange::Create(_) => None,
                })
                .collect();
            if items.is_empty() {
                continue;
            }

            let targets: Vec<ElementId> = items.iter().map(BatchItem::element_id).collect();
            let response = self.sink.submit(items).await?;
            for (id, result) in targets.into_iter().zip(response.results) {
                if let ItemResult::Rejected { reason, .. } = result {
                    log::warn!("Change to {id} rejected: {reason}");
                    self.emit(BufferEvent::Rejected { element_id: id, reason });
                }
                self.pending.remove(&id);
                acknowledged += 1;
            }
        }
        Ok(acknowledged)
    }
}
