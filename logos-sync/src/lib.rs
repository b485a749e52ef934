//! # logos-sync: Real-time sync engine for the Logos canvas
//!
//! Keeps every client of a workspace converged on the same element set.
//! Edits become operations with a per-workspace logical timestamp, are
//! appended to a durable log, applied to an in-memory projection and fanned
//! out to the workspace room, all in one critical section per workspace.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌─────────────────┐
//! │ SyncClient       │ ◄──────────────► │ SyncServer      │
//! │  Replica         │    JSON frames   │  (per-conn task)│
//! │  Reconciliation  │                  └────────┬────────┘
//! │  Buffer          │                           │
//! └──────────────────┘                           ▼
//!                                       ┌─────────────────┐
//!                                       │ SyncCoordinator │──► LogicalClock
//!                                       │  (projection)   │
//!                                       └───┬─────────┬───┘
//!                                           │         │
//!                                           ▼         ▼
//!                                 ┌──────────────┐ ┌──────────┐
//!                                 │OperationStore│ │ Hub/Room │
//!                                 │ (log+snaps)  │ │ (fan-out)│
//!                                 └──────▲───────┘ └──────────┘
//!                                        │
//!                                 ┌──────┴────────────┐
//!                                 │ SnapshotCompactor │
//!                                 └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`]: Element envelope, typed content and partial patches
//! - [`operation`]: Operations, ordering keys and state vectors
//! - [`projection`]: Per-field last-writer-wins fold of the log
//! - [`clock`]: Per-workspace logical clock
//! - [`store`]: Append-only operation log and snapshots (memory, RocksDB)
//! - [`coordinator`]: Batch submission and state-vector catch-up
//! - [`hub`]: Workspace rooms with bounded fan-out
//! - [`connection`]: Per-connection outbound queue and eviction
//! - [`compactor`]: Snapshot checkpoints and log pruning
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket client, replica and reconciliation buffer
//! - [`config`]: Server and client configuration

pub mod clock;
pub mod client;
pub mod compactor;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod element;
pub mod error;
pub mod hub;
pub mod operation;
pub mod projection;
pub mod protocol;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use client::{
    BatchSink, BufferEvent, ConnectionState, ReconciliationBuffer, Replica, SaveState, SyncClient, SyncEvent,
};
pub use clock::LogicalClock;
pub use compactor::{CompactionReport, SnapshotCompactor};
pub use config::{BufferConfig, ClientConfig, CompactionConfig, ServerConfig, SyncConfig};
pub use connection::{ClientConnection, ConnectionHandle, EvictReason};
pub use coordinator::SyncCoordinator;
pub use element::{
    Element, ElementContent, ElementId, ElementKind, ElementPatch, ParentRef, Point, Size, Style, UserId,
    WorkspaceId,
};
pub use error::{ConfigError, ProtocolError, StoreError, SyncError, SyncResult};
pub use hub::{BroadcastStats, Hub, Room};
pub use operation::{Change, OpKind, Operation, OrderKey, StateVector, Timestamp};
pub use projection::{ApplyOutcome, Projection};
pub use protocol::{
    BatchItem, ClientMessage, ItemResult, OperationPayload, PeerInfo, PeerPresence, Presence, RejectReason,
    ServerMessage, SubmitRequest, SubmitResponse, SyncRequest, SyncResponse,
};
pub use server::{ServerStats, SyncServer};
pub use store::{MemoryStore, OperationStore, RocksStore, Snapshot, StoreConfig};
