//! Per-socket connection state.
//!
//! A [`ClientConnection`] is owned by the task serving one WebSocket. The
//! room only ever holds a [`ConnectionHandle`]: a bounded outbound queue and
//! an eviction signal. Nothing else is shared between connections.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::element::{UserId, WorkspaceId};
use crate::protocol::PeerInfo;

/// Pre-encoded JSON frame shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Why the server is dropping a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Outbound queue overflowed; operations would have been lost.
    Lagged,
    /// The workspace log was found corrupt; local state must be rebuilt.
    Corrupted,
    Shutdown,
}

impl EvictReason {
    /// Whether the client must discard local state and sync from 0.
    pub fn requires_full_resync(&self) -> bool {
        matches!(self, EvictReason::Corrupted)
    }
}

impl std::fmt::Display for EvictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictReason::Lagged => write!(f, "outbound queue exceeded"),
            EvictReason::Corrupted => write!(f, "workspace log corrupted"),
            EvictReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// Cloneable sending side of a connection, held by its room.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub info: PeerInfo,
    tx: mpsc::Sender<Frame>,
    evict: Arc<watch::Sender<Option<EvictReason>>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.info.connection_id
    }

    pub fn user_id(&self) -> UserId {
        self.info.user_id
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.tx.try_send(frame)
    }

    /// Signal the owning task to drop the connection. The first reason wins.
    pub fn evict(&self, reason: EvictReason) {
        self.evict.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn is_evicted(&self) -> bool {
        self.evict.borrow().is_some()
    }
}

/// Receiving side of a connection, owned by the socket task.
#[derive(Debug)]
pub struct ClientConnection {
    pub workspace_id: WorkspaceId,
    handle: ConnectionHandle,
    outbound: mpsc::Receiver<Frame>,
    evicted: watch::Receiver<Option<EvictReason>>,
}

impl ClientConnection {
    pub fn new(info: PeerInfo, workspace_id: WorkspaceId, queue_capacity: usize) -> Self {
        let (tx, outbound) = mpsc::channel(queue_capacity.max(1));
        let (evict_tx, evicted) = watch::channel(None);
        let handle = ConnectionHandle {
            info,
            tx,
            evict: Arc::new(evict_tx),
        };
        Self {
            workspace_id,
            handle,
            outbound,
            evicted,
        }
    }

    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    pub fn info(&self) -> &PeerInfo {
        &self.handle.info
    }

    /// Handle to register with a room.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Next queued frame. Never returns `None` while the connection lives,
    /// since it keeps its own sender.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Resolves once the connection has been evicted. The future does not
    /// borrow the connection, so it can be polled alongside [`Self::recv`].
    pub fn evicted(&self) -> impl Future<Output = EvictReason> + Send + 'static {
        let mut rx = self.evicted.clone();
        async move {
            let reason = rx.wait_for(Option::is_some).await.ok().and_then(|reason| *reason);
            match reason {
                Some(reason) => reason,
                None => std::future::pending().await,
            }
        }
    }

    pub fn eviction(&self) -> Option<EvictReason> {
        *self.evicted.borrow()
    }
}
