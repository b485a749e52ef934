//! Room registry and fan-out.
//!
//! ```text
//!               Hub (DashMap<workspace, Arc<Room>>)
//!                 │
//!        ┌────────┴─────────┐
//!        ▼                  ▼
//!     Room A             Room B
//!   ┌──┴──┬─────┐        ┌──┴──┐
//!   ▼     ▼     ▼        ▼     ▼
//!  conn  conn  conn     conn  conn     bounded mpsc queue each
//! ```
//!
//! Operations are encoded once and pushed with `try_send` in the order the
//! coordinator accepted them. A full queue means the member would miss
//! operations, so it is evicted and resyncs on reconnect. Presence frames are
//! best-effort: on a full queue they are dropped and the member stays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::connection::{ConnectionHandle, EvictReason, Frame};
use crate::element::WorkspaceId;
use crate::error::{SyncError, SyncResult};
use crate::operation::Operation;
use crate::protocol::{PeerPresence, Presence, ServerMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub operations_broadcast: u64,
    pub frames_sent: u64,
    pub presence_dropped: u64,
    pub evictions: u64,
    pub active_rooms: usize,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    operations_broadcast: AtomicU64,
    frames_sent: AtomicU64,
    presence_dropped: AtomicU64,
    evictions: AtomicU64,
}

struct Member {
    handle: ConnectionHandle,
    presence: Presence,
}

/// Broadcast domain for one workspace.
pub struct Room {
    workspace_id: WorkspaceId,
    members: RwLock<HashMap<Uuid, Member>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Room {
    fn new(workspace_id: WorkspaceId, stats: Arc<AtomicBroadcastStats>) -> Self {
        Self {
            workspace_id,
            members: RwLock::new(HashMap::new()),
            stats,
        }
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn contains(&self, connection_id: &Uuid) -> bool {
        self.members.read().contains_key(connection_id)
    }

    /// Presence of every member except `except`.
    pub fn peers(&self, except: Option<Uuid>) -> Vec<PeerPresence> {
        self.members
            .read()
            .values()
            .filter(|m| Some(m.handle.id()) != except)
            .map(|m| PeerPresence {
                peer: m.handle.info.clone(),
                presence: m.presence.clone(),
            })
            .collect()
    }

    /// Fan out accepted operations to every member, the submitter included.
    ///
    /// Must be called in acceptance order; the room never reorders.
    pub fn broadcast_operations(&self, ops: &[Operation]) -> SyncResult<usize> {
        let Some(msg) = ServerMessage::for_operations(ops) else {
            return Ok(0);
        };
        let frame: Frame = Arc::from(msg.encode()?);

        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            let members = self.members.read();
            for (id, member) in members.iter() {
                match member.handle.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Connection {id} in workspace {} lagging, evicting",
                            self.workspace_id
                        );
                        member.handle.evict(EvictReason::Lagged);
                        dropped.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }

        if !dropped.is_empty() {
            let mut members = self.members.write();
            for id in &dropped {
                members.remove(id);
            }
            self.stats.evictions.fetch_add(dropped.len() as u64, Ordering::Relaxed);
        }

        self.stats.operations_broadcast.fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.stats.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Best-effort send to every member except `except`. Full queues drop
    /// the frame.
    pub fn announce(&self, msg: &ServerMessage, except: Option<Uuid>) -> SyncResult<usize> {
        let frame: Frame = Arc::from(msg.encode()?);
        let mut delivered = 0;
        let members = self.members.read();
        for (id, member) in members.iter() {
            if Some(*id) == except {
                continue;
            }
            match member.handle.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.presence_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.stats.frames_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Record a member's latest presence and forward it to the others.
    /// Only the latest value is kept, so a dropped frame is superseded by
    /// the next update or the snapshot a joiner receives.
    pub fn update_presence(&self, connection_id: Uuid, presence: Presence) -> SyncResult<usize> {
        let peer = {
            let mut members = self.members.write();
            let Some(member) = members.get_mut(&connection_id) else {
                return Err(SyncError::NotJoined);
            };
            member.presence = presence.clone();
            member.handle.info.clone()
        };
        self.announce(&ServerMessage::Presence(PeerPresence { peer, presence }), Some(connection_id))
    }

    /// Evict every member. Returns how many were evicted.
    pub fn evict_all(&self, reason: EvictReason) -> usize {
        let mut members = self.members.write();
        let count = members.len();
        for member in members.values() {
            member.handle.evict(reason);
        }
        members.clear();
        self.stats.evictions.fetch_add(count as u64, Ordering::Relaxed);
        count
    }
}

/// Process-wide registry of live rooms.
pub struct Hub {
    rooms: DashMap<WorkspaceId, Arc<Room>>,
    max_peers_per_room: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl Hub {
    pub fn new(max_peers_per_room: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_peers_per_room,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Admit a connection, creating the room on first join.
    pub fn register(&self, workspace_id: WorkspaceId, handle: ConnectionHandle) -> SyncResult<Arc<Room>> {
        // The entry guard keeps `unregister` from dropping the room between
        // lookup and insertion.
        let entry = self
            .rooms
            .entry(workspace_id)
            .or_insert_with(|| Arc::new(Room::new(workspace_id, self.stats.clone())));
        let room = entry.value().clone();
        {
            let mut members = room.members.write();
            if members.len() >= self.max_peers_per_room && !members.contains_key(&handle.id()) {
                return Err(SyncError::RoomFull(workspace_id));
            }
            log::info!(
                "Connection {} ({}) joined workspace {workspace_id} ({} members)",
                handle.id(),
                handle.info.name,
                members.len() + 1
            );
            members.insert(
                handle.id(),
                Member {
                    handle,
                    presence: Presence::default(),
                },
            );
        }
        drop(entry);
        Ok(room)
    }

    /// Remove a connection; tears the room down once empty. Idempotent.
    pub fn unregister(&self, workspace_id: WorkspaceId, connection_id: Uuid) -> bool {
        let removed = match self.rooms.get(&workspace_id) {
            Some(room) => room.members.write().remove(&connection_id).is_some(),
            None => false,
        };
        if self.rooms.remove_if(&workspace_id, |_, room| room.is_empty()).is_some() {
            log::info!("Room {workspace_id} removed (empty)");
        }
        removed
    }

    pub fn room(&self, workspace_id: &WorkspaceId) -> Option<Arc<Room>> {
        self.rooms.get(workspace_id).map(|r| r.value().clone())
    }

    pub fn broadcast_operations(&self, workspace_id: WorkspaceId, ops: &[Operation]) -> SyncResult<usize> {
        match self.room(&workspace_id) {
            Some(room) => room.broadcast_operations(ops),
            None => Ok(0),
        }
    }

    /// Drop every member of a room so each one resyncs from scratch.
    pub fn force_resync(&self, workspace_id: WorkspaceId) -> usize {
        let count = self
            .room(&workspace_id)
            .map(|room| room.evict_all(EvictReason::Corrupted))
            .unwrap_or(0);
        self.rooms.remove_if(&workspace_id, |_, room| room.is_empty());
        if count > 0 {
            log::warn!("Forced resync of {count} connections in workspace {workspace_id}");
        }
        count
    }

    /// Evict everyone, e.g. on shutdown.
    pub fn close_all(&self, reason: EvictReason) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let count = rooms.iter().map(|room| room.evict_all(reason)).sum();
        self.rooms.clear();
        count
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|r| r.value().len()).sum()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            operations_broadcast: self.stats.operations_broadcast.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            presence_dropped: self.stats.presence_dropped.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
            active_connections: self.connection_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;
    use crate::element::Point;
    use crate::operation::Change;
    use crate::protocol::PeerInfo;

    fn connect(ws: WorkspaceId, capacity: usize) -> ClientConnection {
        let info = PeerInfo::new(Uuid::new_v4(), Uuid::new_v4(), "peer");
        ClientConnection::new(info, ws, capacity)
    }

    fn ops(ws: WorkspaceId, range: std::ops::RangeInclusive<u64>) -> Vec<Operation> {
        range
            .map(|ts| Operation::new(ws, Uuid::new_v4(), Uuid::new_v4(), ts, Change::Delete))
            .collect()
    }

    fn timestamps(frame: &str) -> Vec<u64> {
        match ServerMessage::decode(frame).unwrap() {
            ServerMessage::Operation(op) => vec![op.timestamp],
            ServerMessage::Batch(ops) => ops.iter().map(|o| o.timestamp).collect(),
            other => panic!("Expected operations, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_and_teardown() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let a = connect(ws, 8);
        let b = connect(ws, 8);

        hub.register(ws, a.handle()).unwrap();
        hub.register(ws, b.handle()).unwrap();
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.connection_count(), 2);

        assert!(hub.unregister(ws, a.id()));
        assert!(!hub.unregister(ws, a.id()));
        assert_eq!(hub.room_count(), 1);
        hub.unregister(ws, b.id());
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_room_full() {
        let hub = Hub::new(1);
        let ws = Uuid::new_v4();
        let a = connect(ws, 8);
        let b = connect(ws, 8);
        hub.register(ws, a.handle()).unwrap();
        assert!(matches!(hub.register(ws, b.handle()), Err(SyncError::RoomFull(_))));
    }

    #[tokio::test]
    async fn test_operations_reach_everyone_in_order() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let mut a = connect(ws, 16);
        let mut b = connect(ws, 16);
        hub.register(ws, a.handle()).unwrap();
        hub.register(ws, b.handle()).unwrap();

        let all = ops(ws, 1..=3);
        hub.broadcast_operations(ws, &all[..1]).unwrap();
        hub.broadcast_operations(ws, &all[1..]).unwrap();

        for conn in [&mut a, &mut b] {
            let mut seen = timestamps(&conn.recv().await.unwrap());
            seen.extend(timestamps(&conn.recv().await.unwrap()));
            assert_eq!(seen, vec![1, 2, 3]);
        }
        assert_eq!(hub.stats().operations_broadcast, 3);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let mut fast = connect(ws, 64);
        let slow = connect(ws, 2);
        hub.register(ws, fast.handle()).unwrap();
        hub.register(ws, slow.handle()).unwrap();

        for batch in ops(ws, 1..=5).chunks(1) {
            hub.broadcast_operations(ws, batch).unwrap();
        }

        assert_eq!(slow.eviction(), Some(EvictReason::Lagged));
        let room = hub.room(&ws).unwrap();
        assert!(!room.contains(&slow.id()));
        assert!(room.contains(&fast.id()));
        assert_eq!(hub.stats().evictions, 1);

        // The fast member still got everything
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.extend(timestamps(&fast.recv().await.unwrap()));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_presence_dropped_not_evicted() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let sender = connect(ws, 8);
        let slow = connect(ws, 1);
        let room = hub.register(ws, sender.handle()).unwrap();
        hub.register(ws, slow.handle()).unwrap();

        for i in 0..3 {
            let presence = Presence {
                cursor: Some(Point::new(i as f64, 0.0)),
                selection: vec![],
            };
            room.update_presence(sender.id(), presence).unwrap();
        }

        assert!(slow.eviction().is_none());
        assert!(room.contains(&slow.id()));
        assert_eq!(hub.stats().presence_dropped, 2);

        // Latest presence is retained for joiners
        let peers = room.peers(Some(slow.id()));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].presence.cursor, Some(Point::new(2.0, 0.0)));
    }

    #[tokio::test]
    async fn test_presence_skips_originator() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let mut a = connect(ws, 8);
        let mut b = connect(ws, 8);
        let room = hub.register(ws, a.handle()).unwrap();
        hub.register(ws, b.handle()).unwrap();

        assert_eq!(room.update_presence(a.id(), Presence::default()).unwrap(), 1);
        let frame = b.recv().await.unwrap();
        assert!(matches!(ServerMessage::decode(&frame).unwrap(), ServerMessage::Presence(_)));
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_force_resync_evicts_room() {
        let hub = Hub::new(10);
        let ws = Uuid::new_v4();
        let a = connect(ws, 8);
        let b = connect(ws, 8);
        hub.register(ws, a.handle()).unwrap();
        hub.register(ws, b.handle()).unwrap();

        assert_eq!(hub.force_resync(ws), 2);
        assert_eq!(a.eviction(), Some(EvictReason::Corrupted));
        assert_eq!(b.eviction(), Some(EvictReason::Corrupted));
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = Hub::new(10);
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();
        let mut a = connect(ws_a, 8);
        let mut b = connect(ws_b, 8);
        hub.register(ws_a, a.handle()).unwrap();
        hub.register(ws_b, b.handle()).unwrap();

        hub.broadcast_operations(ws_a, &ops(ws_a, 1..=1)).unwrap();
        assert!(a.recv().await.is_some());
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), b.recv())
            .await
            .is_err());
    }
}
