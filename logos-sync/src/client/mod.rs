//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, catch-up, disconnect, reconnect)
//! - Batch submission correlated with acks by request id
//! - A local [`Replica`] kept current from sync responses and broadcasts
//! - Presence updates and peer tracking
//!
//! Local edits are batched by a [`ReconciliationBuffer`] that submits
//! through the client (see [`SyncClient::buffer`]).

pub mod buffer;
pub mod replica;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::config::{BufferConfig, ClientConfig};
use crate::element::{Element, ElementId, ElementPatch, UserId, WorkspaceId};
use crate::error::{SyncError, SyncResult};
use crate::operation::{Operation, Timestamp};
use crate::protocol::{
    BatchItem, ClientMessage, ItemResult, PeerInfo, PeerPresence, Presence, ServerMessage, SubmitRequest,
    SubmitResponse, SyncRequest,
};

pub use buffer::{BatchSink, BufferEvent, ReconciliationBuffer, SaveState};
pub use replica::Replica;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Joined, catch-up in progress.
    Syncing,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected { connection_id: Uuid, high_water: Timestamp },
    CaughtUp { high_water: Timestamp },
    RemoteOperations(Vec<Operation>),
    Presence(PeerPresence),
    PeerJoined(PeerInfo),
    PeerLeft { connection_id: Uuid, user_id: UserId },
    /// The server dropped us; `full` means local confirmed state was discarded.
    ResyncRequired { full: bool, reason: String },
    Error(String),
    Disconnected,
}

type AckSender = oneshot::Sender<Result<SubmitResponse, String>>;

struct Shared {
    server_url: String,
    workspace_id: WorkspaceId,
    user_id: UserId,
    user_name: String,
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    replica: Mutex<Replica>,
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    /// Bumped per connect so a stale reader cannot tear down a newer link.
    generation: AtomicU64,
    connection_id: Mutex<Option<Uuid>>,
    acks: DashMap<u64, AckSender>,
    next_request: AtomicU64,
    peers: DashMap<Uuid, PeerPresence>,
    events: broadcast::Sender<SyncEvent>,
    caught_up: watch::Sender<bool>,
}

/// The sync client. Clones share one connection.
#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    pub fn new(
        server_url: impl Into<String>,
        workspace_id: WorkspaceId,
        user_id: UserId,
        user_name: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (caught_up, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                server_url: server_url.into(),
                workspace_id,
                user_id,
                user_name: user_name.into(),
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                replica: Mutex::new(Replica::new(workspace_id, user_id)),
                outgoing: Mutex::new(None),
                generation: AtomicU64::new(0),
                connection_id: Mutex::new(None),
                acks: DashMap::new(),
                next_request: AtomicU64::new(0),
                peers: DashMap::new(),
                events,
                caught_up,
            }),
        }
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.shared.workspace_id
    }

    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        *self.shared.connection_id.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Connect, join the workspace and catch up.
    pub async fn connect(&self) -> SyncResult<()> {
        let shared = &self.shared;
        shared.set_state(ConnectionState::Connecting);

        let ws_stream = match tokio_tungstenite::connect_async(shared.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", shared.server_url);
                shared.set_state(ConnectionState::Disconnected);
                return Err(SyncError::NotConnected);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = ClientMessage::Join {
            workspace_id: shared.workspace_id,
            user_id: shared.user_id,
            user_name: shared.user_name.clone(),
        };
        if ws_writer.send(Message::text(join.encode()?)).await.is_err() {
            shared.set_state(ConnectionState::Disconnected);
            return Err(SyncError::NotConnected);
        }

        let joined = tokio::time::timeout(shared.config.join_timeout(), await_joined(&mut ws_reader)).await;
        let (connection_id, high_water, peers) = match joined {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(SyncError::Timeout);
            }
        };

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.outgoing.lock() = Some(out_tx);
        *shared.connection_id.lock() = Some(connection_id);
        shared.caught_up.send_replace(false);
        shared.replica.lock().begin_sync();
        shared.peers.clear();
        for peer in peers {
            shared.peers.insert(peer.peer.connection_id, peer);
        }
        shared.set_state(ConnectionState::Syncing);
        shared.emit(SyncEvent::Connected { connection_id, high_water });
        log::info!("Joined workspace {} as {connection_id}", shared.workspace_id);

        // Reader task: process incoming WebSocket messages
        let reader = self.shared.clone();
        tokio::spawn(async move { reader.read_loop(ws_reader, generation).await });

        shared.request_sync()?;
        let mut caught_up = shared.caught_up.subscribe();
        let synced = tokio::time::timeout(shared.config.join_timeout(), caught_up.wait_for(|done| *done))
            .await
            .map(|waited| waited.map(|_| ()));
        match synced {
            Ok(Ok(())) => {
                shared.set_state(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(_)) => Err(SyncError::NotConnected),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Reconnect with backoff, resuming from the replica's state vector.
    pub async fn reconnect(&self) -> SyncResult<()> {
        let max = self.shared.config.max_reconnect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.shared.set_state(ConnectionState::Reconnecting);
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max => {
                    let delay = self.shared.config.buffer.backoff(attempt);
                    log::warn!("Reconnect attempt {attempt} failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.shared.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// Close the socket. Pending acks fail with `NotConnected`.
    pub fn disconnect(&self) {
        self.shared.outgoing.lock().take();
    }

    /// Tell the server we are leaving, then close.
    pub fn leave(&self) -> SyncResult<()> {
        let sent = self.shared.send(&ClientMessage::Leave);
        self.disconnect();
        sent
    }

    pub fn send_presence(&self, presence: Presence) -> SyncResult<()> {
        self.shared.send(&ClientMessage::Presence(presence))
    }

    pub fn ping(&self) -> SyncResult<()> {
        self.shared.send(&ClientMessage::Ping)
    }

    /// Ask for operations after the replica's state vector.
    pub fn request_sync(&self) -> SyncResult<()> {
        self.shared.request_sync()
    }

    /// Submit one batch and wait for its ack.
    pub async fn submit_batch(&self, items: Vec<BatchItem>) -> SyncResult<SubmitResponse> {
        let shared = &self.shared;
        let request_id = shared.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        shared.acks.insert(request_id, tx);

        let request = SubmitRequest {
            request_id,
            workspace_id: shared.workspace_id,
            items,
        };
        if let Err(e) = shared.send(&ClientMessage::Submit(request)) {
            shared.acks.remove(&request_id);
            return Err(e);
        }

        let response = match tokio::time::timeout(shared.config.ack_timeout(), rx).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(message))) => return Err(SyncError::Rejected(message)),
            Ok(Err(_)) => return Err(SyncError::NotConnected),
            Err(_) => {
                shared.acks.remove(&request_id);
                return Err(SyncError::Timeout);
            }
        };

        let mut replica = shared.replica.lock();
        for result in &response.results {
            match result {
                ItemResult::Created { provisional_id, element_id, .. } => replica.remap(*provisional_id, *element_id),
                ItemResult::Rejected { element_id, .. } => replica.discard(element_id),
                ItemResult::Applied { .. } => {}
            }
        }
        Ok(response)
    }

    /// Spawn a reconciliation buffer that saves through this client.
    pub fn buffer(&self, config: BufferConfig) -> ReconciliationBuffer {
        ReconciliationBuffer::spawn(Arc::new(self.clone()), config)
    }

    /// Optimistically apply a local change to the replica.
    pub fn local_change(&self, element_id: ElementId, patch: ElementPatch) {
        self.shared.replica.lock().local_change(element_id, patch);
    }

    pub fn local_delete(&self, element_id: ElementId) {
        self.shared.replica.lock().local_delete(element_id);
    }

    /// Move local edits to a server-assigned id.
    pub fn remap(&self, provisional: ElementId, server: ElementId) {
        self.shared.replica.lock().remap(provisional, server);
    }

    /// Current merged view of the workspace.
    pub fn elements(&self) -> Vec<Element> {
        self.shared.replica.lock().elements()
    }

    pub fn element(&self, element_id: &ElementId) -> Option<Element> {
        self.shared.replica.lock().element(element_id)
    }

    /// Confirmed-only view, without local edits.
    pub fn confirmed_elements(&self) -> Vec<Element> {
        self.shared.replica.lock().confirmed().elements()
    }

    pub fn high_water(&self) -> Timestamp {
        self.shared.replica.lock().high_water()
    }

    pub fn peers(&self) -> Vec<PeerPresence> {
        self.shared.peers.iter().map(|p| p.value().clone()).collect()
    }
}

#[async_trait]
impl BatchSink for SyncClient {
    async fn submit(&self, items: Vec<BatchItem>) -> SyncResult<SubmitResponse> {
        self.submit_batch(items).await
    }
}

/// Wait for `joined`, skipping anything else.
async fn await_joined<S>(reader: &mut S) -> SyncResult<(Uuid, Timestamp, Vec<PeerPresence>)>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str())? {
                ServerMessage::Joined { connection_id, high_water, peers, .. } => {
                    return Ok((connection_id, high_water, peers));
                }
                ServerMessage::Error { message, .. } => return Err(SyncError::Rejected(message)),
                _ => {}
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Err(SyncError::NotConnected)
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, msg: &ClientMessage) -> SyncResult<()> {
        let frame = Message::text(msg.encode()?);
        let outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            return Err(SyncError::NotConnected);
        };
        tx.try_send(frame).map_err(|e| {
            log::warn!("Outgoing queue unavailable: {e}");
            SyncError::NotConnected
        })
    }

    fn request_sync(&self) -> SyncResult<()> {
        let state_vector = self.replica.lock().state_vector().clone();
        self.send(&ClientMessage::Sync(SyncRequest {
            workspace_id: self.workspace_id,
            state_vector,
        }))
    }

    async fn read_loop<S>(self: Arc<Self>, mut reader: S, generation: u64)
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                    Ok(msg) => self.handle(msg),
                    Err(e) => log::warn!("Undecodable server message: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        self.disconnected(generation);
    }

    fn handle(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::SyncResponse(response) => {
                if response.workspace_id != self.workspace_id {
                    return;
                }
                self.replica.lock().apply_sync(&response);
                if response.has_more {
                    if let Err(e) = self.request_sync() {
                        log::warn!("Catch-up interrupted: {e}");
                    }
                } else {
                    self.caught_up.send_replace(true);
                    self.emit(SyncEvent::CaughtUp { high_water: response.high_water });
                }
            }

            ServerMessage::Operation(payload) => self.apply_remote(vec![payload.into_operation()]),
            ServerMessage::Batch(payloads) => {
                self.apply_remote(payloads.into_iter().map(|p| p.into_operation()).collect())
            }

            ServerMessage::Ack(response) => {
                if let Some((_, tx)) = self.acks.remove(&response.request_id) {
                    let _ = tx.send(Ok(response));
                }
            }

            ServerMessage::Error { request_id: Some(request_id), message } => {
                if let Some((_, tx)) = self.acks.remove(&request_id) {
                    let _ = tx.send(Err(message));
                }
            }
            ServerMessage::Error { request_id: None, message } => {
                log::warn!("Server error: {message}");
                self.emit(SyncEvent::Error(message));
            }

            ServerMessage::Presence(presence) => {
                self.peers.insert(presence.peer.connection_id, presence.clone());
                self.emit(SyncEvent::Presence(presence));
            }
            ServerMessage::PeerJoined(peer) => {
                self.peers.insert(
                    peer.connection_id,
                    PeerPresence { peer: peer.clone(), presence: Presence::default() },
                );
                self.emit(SyncEvent::PeerJoined(peer));
            }
            ServerMessage::PeerLeft { connection_id, user_id } => {
                self.peers.remove(&connection_id);
                self.emit(SyncEvent::PeerLeft { connection_id, user_id });
            }

            ServerMessage::Resync { reason, full, .. } => {
                log::warn!("Server requested resync (full: {full}): {reason}");
                if full {
                    self.replica.lock().reset();
                }
                self.emit(SyncEvent::ResyncRequired { full, reason });
            }

            ServerMessage::Joined { .. } | ServerMessage::Pong => {}
        }
    }

    fn apply_remote(&self, ops: Vec<Operation>) {
        {
            let mut replica = self.replica.lock();
            for op in &ops {
                replica.apply_remote(op);
            }
        }
        self.emit(SyncEvent::RemoteOperations(ops));
    }

    fn disconnected(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outgoing.lock().take();
        *self.connection_id.lock() = None;
        // Dropping the senders fails every waiting submit
        self.acks.clear();
        self.peers.clear();
        self.caught_up.send_replace(false);
        self.set_state(ConnectionState::Disconnected);
        self.emit(SyncEvent::Disconnected);
        log::info!("Disconnected from workspace {}", self.workspace_id);
    }
}

/// Group peers by user, e.g. for an avatar stack.
pub fn peers_by_user(peers: &[PeerPresence]) -> HashMap<UserId, Vec<Uuid>> {
    let mut grouped: HashMap<UserId, Vec<Uuid>> = HashMap::new();
    for p in peers {
        grouped.entry(p.peer.user_id).or_default().push(p.peer.connection_id);
    }
    grouped
}
