//! WebSocket sync server with per-workspace rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── OperationStore (memory | RocksDB)
//!            ├── Room (workspace) ─────┤
//! Client B ──┘        ▲                └── SnapshotCompactor
//!                     │ broadcast
//!              SyncCoordinator ── LogicalClock
//! ```
//!
//! Each socket is served by one task that selects over the socket, the
//! connection's outbound queue, its eviction signal and a heartbeat. The
//! first message must be a `join`; everything else is refused until then.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::compactor::SnapshotCompactor;
use crate::config::ServerConfig;
use crate::connection::{ClientConnection, EvictReason};
use crate::coordinator::SyncCoordinator;
use crate::element::{UserId, WorkspaceId};
use crate::error::{SyncError, SyncResult};
use crate::hub::Hub;
use crate::protocol::{ClientMessage, PeerInfo, ServerMessage};
use crate::store::{MemoryStore, OperationStore, RocksStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub operations_accepted: u64,
    pub items_rejected: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    operations_accepted: AtomicU64,
    items_rejected: AtomicU64,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Session {
    config: Arc<ServerConfig>,
    hub: Arc<Hub>,
    coordinator: Arc<SyncCoordinator>,
    compactor: Arc<SnapshotCompactor>,
    stats: Arc<AtomicServerStats>,
}

/// The sync server.
pub struct SyncServer {
    session: Session,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server; opens RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> SyncResult<Self> {
        let store: Arc<dyn OperationStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::new(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn OperationStore>) -> Self {
        let hub = Arc::new(Hub::new(config.max_peers_per_room));
        let coordinator = Arc::new(SyncCoordinator::new(store, hub.clone(), config.sync.clone()));
        let compactor = Arc::new(SnapshotCompactor::new(coordinator.clone(), config.compaction.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            session: Session {
                config: Arc::new(config),
                hub,
                coordinator,
                compactor,
                stats: Arc::new(AtomicServerStats::default()),
            },
            shutdown,
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind the configured address and serve until [`Self::shutdown`].
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.session.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        tokio::spawn(self.session.compactor.clone().run(self.shutdown.subscribe()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let session = self.session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.handle_connection(stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Sync server stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop accepting connections and evict every client.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let evicted = self.session.hub.close_all(EvictReason::Shutdown);
        log::info!("Shutdown: closed {evicted} connections");
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.session.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.session.hub.room_count(),
            operations_accepted: s.operations_accepted.load(Ordering::Relaxed),
            items_rejected: s.items_rejected.load(Ordering::Relaxed),
            evictions: self.session.hub.stats().evictions,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.session.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.session.hub
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.session.coordinator
    }

    pub fn compactor(&self) -> &Arc<SnapshotCompactor> {
        &self.session.compactor
    }
}

async fn send(ws_sender: &mut WsSender, msg: &ServerMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::text(msg.encode()?)).await?;
    Ok(())
}

impl Session {
    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let result: Result<(), BoxError> = async {
            let Some((workspace_id, user_id, user_name)) = self.await_join(&mut ws_sender, &mut ws_receiver).await?
            else {
                return Ok(());
            };
            let info = PeerInfo::new(Uuid::new_v4(), user_id, user_name);
            let mut conn = ClientConnection::new(info, workspace_id, self.config.outbound_queue_capacity);
            if !self.join(&conn, &mut ws_sender).await? {
                return Ok(());
            }
            let served = self.serve_joined(&mut conn, &mut ws_sender, &mut ws_receiver).await;
            self.leave(&conn);
            served
        }
        .await;

        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection closed from {addr}");
        result
    }

    /// Read until a `join` arrives. `None` when the socket closed first.
    async fn await_join<S>(
        &self,
        ws_sender: &mut WsSender,
        ws_receiver: &mut S,
    ) -> Result<Option<(WorkspaceId, UserId, String)>, BoxError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let deadline = self.config.heartbeat_interval() * 2;
        loop {
            let next = match tokio::time::timeout(deadline, ws_receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    log::debug!("No join within {deadline:?}, closing");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(None);
                }
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    self.count_message(text.len());
                    match ClientMessage::decode(text.as_str()) {
                        Ok(ClientMessage::Join { workspace_id, user_id, user_name }) => {
                            return Ok(Some((workspace_id, user_id, user_name)));
                        }
                        Ok(ClientMessage::Ping) => send(ws_sender, &ServerMessage::Pong).await?,
                        Ok(_) => send(ws_sender, &ServerMessage::error(None, SyncError::NotJoined.to_string())).await?,
                        Err(e) => send(ws_sender, &ServerMessage::error(None, e.to_string())).await?,
                    }
                }
                Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            }
        }
    }

    /// Register with the room and greet. `false` when the join was refused.
    async fn join(&self, conn: &ClientConnection, ws_sender: &mut WsSender) -> Result<bool, BoxError> {
        let workspace_id = conn.workspace_id;
        let room = match self.hub.register(workspace_id, conn.handle()) {
            Ok(room) => room,
            Err(e) => {
                log::warn!("Join to workspace {workspace_id} refused: {e}");
                send(ws_sender, &ServerMessage::error(None, e.to_string())).await?;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(false);
            }
        };
        let high_water = match self.coordinator.high_water(workspace_id) {
            Ok(h) => h,
            Err(e) => {
                self.hub.unregister(workspace_id, conn.id());
                send(ws_sender, &ServerMessage::error(None, e.to_string())).await?;
                return Ok(false);
            }
        };

        // Direct send; broadcasts queued from here on follow it
        send(
            ws_sender,
            &ServerMessage::Joined {
                connection_id: conn.id(),
                workspace_id,
                high_water,
                peers: room.peers(Some(conn.id())),
            },
        )
        .await?;
        room.announce(&ServerMessage::PeerJoined(conn.info().clone()), Some(conn.id()))?;

        log::info!(
            "Peer {} ({}) joined workspace {workspace_id}",
            conn.info().name,
            conn.info().user_id
        );
        Ok(true)
    }

    async fn serve_joined<S>(
        &self,
        conn: &mut ClientConnection,
        ws_sender: &mut WsSender,
        ws_receiver: &mut S,
    ) -> Result<(), BoxError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let workspace_id = conn.workspace_id;
        let user_id = conn.info().user_id;
        let connection_id = conn.id();
        let evicted = conn.evicted();
        tokio::pin!(evicted);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.count_message(text.len());
                            match ClientMessage::decode(text.as_str()) {
                                Ok(msg) => {
                                    if !self.dispatch(workspace_id, user_id, connection_id, msg, ws_sender).await? {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {connection_id}: {e}");
                                    send(ws_sender, &ServerMessage::error(None, e.to_string())).await?;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            send(ws_sender, &ServerMessage::error(None, "binary frames are not supported")).await?;
                        }
                        Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {connection_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = conn.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }

                reason = &mut evicted => {
                    log::info!("Evicting {connection_id} from workspace {workspace_id}: {reason}");
                    let resync = ServerMessage::Resync {
                        workspace_id,
                        reason: reason.to_string(),
                        full: reason.requires_full_resync(),
                    };
                    let _ = send(ws_sender, &resync).await;
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Default::default())).await?;
                }
            }
        }
        Ok(())
    }

    /// Handle one client message. Returns `false` on leave.
    async fn dispatch(
        &self,
        workspace_id: WorkspaceId,
        user_id: UserId,
        connection_id: Uuid,
        msg: ClientMessage,
        ws_sender: &mut WsSender,
    ) -> Result<bool, BoxError> {
        match msg {
            ClientMessage::Join { .. } => {
                send(ws_sender, &ServerMessage::error(None, "already joined")).await?;
            }

            ClientMessage::Sync(request) => {
                if request.workspace_id != workspace_id {
                    let err = SyncError::WorkspaceMismatch { joined: workspace_id, requested: request.workspace_id };
                    send(ws_sender, &ServerMessage::error(None, err.to_string())).await?;
                    return Ok(true);
                }
                match self.coordinator.catch_up(&request) {
                    Ok(response) => send(ws_sender, &ServerMessage::SyncResponse(response)).await?,
                    // The room was evicted; the eviction branch reports it
                    Err(SyncError::WorkspaceCorrupted(_)) => {}
                    Err(e) => send(ws_sender, &ServerMessage::error(None, e.to_string())).await?,
                }
            }

            ClientMessage::Submit(request) => {
                let request_id = request.request_id;
                if request.workspace_id != workspace_id {
                    let err = SyncError::WorkspaceMismatch { joined: workspace_id, requested: request.workspace_id };
                    send(ws_sender, &ServerMessage::error(Some(request_id), err.to_string())).await?;
                    return Ok(true);
                }
                match self.coordinator.submit(user_id, request).await {
                    Ok(ack) => {
                        let rejected = ack.results.iter().filter(|r| r.is_rejected()).count() as u64;
                        let accepted = ack.results.len() as u64 - rejected;
                        self.stats.operations_accepted.fetch_add(accepted, Ordering::Relaxed);
                        self.stats.items_rejected.fetch_add(rejected, Ordering::Relaxed);
                        send(ws_sender, &ServerMessage::Ack(ack)).await?;

                        let compactor = self.compactor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = compactor.maybe_compact(workspace_id).await {
                                log::error!("Compaction of workspace {workspace_id} failed: {e}");
                            }
                        });
                    }
                    Err(SyncError::WorkspaceCorrupted(_)) => {}
                    Err(e) => send(ws_sender, &ServerMessage::error(Some(request_id), e.to_string())).await?,
                }
            }

            ClientMessage::Presence(presence) => {
                if let Some(room) = self.hub.room(&workspace_id) {
                    if let Err(e) = room.update_presence(connection_id, presence) {
                        log::debug!("Presence from {connection_id} dropped: {e}");
                    }
                }
            }

            ClientMessage::Leave => return Ok(false),

            ClientMessage::Ping => send(ws_sender, &ServerMessage::Pong).await?,
        }
        Ok(true)
    }

    /// Unregister, tell the others, and checkpoint a room that just emptied.
    fn leave(&self, conn: &ClientConnection) {
        let workspace_id = conn.workspace_id;
        self.hub.unregister(workspace_id, conn.id());

        match self.hub.room(&workspace_id) {
            Some(room) => {
                let left = ServerMessage::PeerLeft {
                    connection_id: conn.id(),
                    user_id: conn.info().user_id,
                };
                let _ = room.announce(&left, None);
            }
            None => {
                let compactor = self.compactor.clone();
                let coordinator = self.coordinator.clone();
                let author = conn.info().user_id;
                tokio::spawn(async move {
                    if coordinator.pending_operations(workspace_id) > 0 {
                        match compactor.compact(workspace_id, Some(author)).await {
                            Ok(report) => log::info!("Room {workspace_id} closed, checkpointed: {report:?}"),
                            Err(e) => log::error!("Failed to checkpoint workspace {workspace_id}: {e}"),
                        }
                    }
                    coordinator.unload(workspace_id);
                });
            }
        }
        log::info!("Peer {} left workspace {workspace_id}", conn.id());
    }

    fn count_message(&self, bytes: usize) {
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
