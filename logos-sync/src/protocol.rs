//! JSON wire protocol between canvas clients and the sync server.
//!
//! Every WebSocket text frame carries one message:
//! ```text
//! { "type": "<kind>", "payload": { ... } }
//! ```
//!
//! Client → server: `join`, `sync`, `submit`, `presence`, `leave`, `ping`.
//! Server → client: `joined`, `sync_response`, `operation`, `batch`, `ack`,
//! `presence`, `peer_joined`, `peer_left`, `resync`, `error`, `pong`.
//!
//! Operations reach every room member, the submitter included, in log order.
//! Presence is best-effort and never part of the log.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::{Element, ElementId, ElementPatch, ParentRef, Point, UserId, WorkspaceId};
use crate::error::ProtocolError;
use crate::operation::{Change, OpKind, Operation, StateVector, Timestamp};

/// Connection identity with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(connection_id: Uuid, user_id: UserId, name: impl Into<String>) -> Self {
        // Stable color from the user id, so a user keeps it across reconnects
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            connection_id,
            user_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Cursor and selection of one connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Cursor in canvas coordinates (None = off-canvas)
    pub cursor: Option<Point>,
    pub selection: Vec<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub peer: PeerInfo,
    pub presence: Presence,
}

/// Catch-up request. `state_vector.high_water()` is the last log position the
/// client has seen (0 if it never synced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub workspace_id: WorkspaceId,
    pub state_vector: StateVector,
}

/// Checkpoint sent when replaying the log would be too long or impossible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub version: Timestamp,
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub workspace_id: WorkspaceId,
    /// Replaces the client's local state when present.
    pub snapshot: Option<SnapshotPayload>,
    /// Ascending; every timestamp is above the snapshot version.
    pub operations: Vec<OperationPayload>,
    /// Position the client has caught up to with this response.
    pub cursor: Timestamp,
    /// Log high-water at the time of the response.
    pub high_water: Timestamp,
    /// More operations remain past `cursor`; repeat the request.
    pub has_more: bool,
    /// The client's vector advanced by this response. Its nil-user entry
    /// records `cursor`.
    pub state_vector: StateVector,
}

/// One mutation inside a submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchItem {
    Create {
        provisional_id: ElementId,
        patch: ElementPatch,
    },
    Update {
        element_id: ElementId,
        patch: ElementPatch,
    },
    Move {
        element_id: ElementId,
        position: Point,
        parent: Option<ParentRef>,
    },
    Delete {
        element_id: ElementId,
    },
}

impl BatchItem {
    /// Target element (the provisional id for creates).
    pub fn element_id(&self) -> ElementId {
        match self {
            BatchItem::Create { provisional_id, .. } => *provisional_id,
            BatchItem::Update { element_id, .. }
            | BatchItem::Move { element_id, .. }
            | BatchItem::Delete { element_id } => *element_id,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, BatchItem::Create { .. })
    }

    /// Turn a pending patch into the cheapest matching item.
    pub fn from_patch(element_id: ElementId, patch: ElementPatch) -> Self {
        if patch.is_move() {
            if let Some(position) = patch.position {
                return BatchItem::Move {
                    element_id,
                    position,
                    parent: patch.parent,
                };
            }
        }
        BatchItem::Update { element_id, patch }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Client-chosen correlation id, echoed in the ack.
    pub request_id: u64,
    pub workspace_id: WorkspaceId,
    pub items: Vec<BatchItem>,
}

/// Why a single batch item was refused. The rest of the batch still applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Never created, or already deleted.
    UnknownElement,
    UnknownParent,
    /// A create must carry content.
    MissingContent,
    /// An update tried to change the element type.
    KindMismatch,
    EmptyPatch,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::UnknownElement => "unknown element",
            RejectReason::UnknownParent => "unknown parent",
            RejectReason::MissingContent => "missing content",
            RejectReason::KindMismatch => "kind mismatch",
            RejectReason::EmptyPatch => "empty patch",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemResult {
    Created {
        provisional_id: ElementId,
        element_id: ElementId,
        timestamp: Timestamp,
    },
    Applied {
        element_id: ElementId,
        timestamp: Timestamp,
    },
    Rejected {
        element_id: ElementId,
        reason: RejectReason,
    },
}

impl ItemResult {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ItemResult::Rejected { .. })
    }
}

/// Acknowledgement of a [`SubmitRequest`], one result per item in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub request_id: u64,
    pub workspace_id: WorkspaceId,
    pub results: Vec<ItemResult>,
    pub high_water: Timestamp,
}

/// Broadcast form of an accepted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub id: Uuid,
    pub element_id: ElementId,
    pub workspace_id: WorkspaceId,
    pub user_id: UserId,
    pub op_type: OpKind,
    pub data: Change,
    pub timestamp: Timestamp,
}

impl From<&Operation> for OperationPayload {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id,
            element_id: op.element_id,
            workspace_id: op.workspace_id,
            user_id: op.user_id,
            op_type: op.kind(),
            data: op.change.clone(),
            timestamp: op.timestamp,
        }
    }
}

impl OperationPayload {
    pub fn into_operation(self) -> Operation {
        Operation {
            id: self.id,
            workspace_id: self.workspace_id,
            element_id: self.element_id,
            user_id: self.user_id,
            timestamp: self.timestamp,
            change: self.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection. Identity comes from upstream auth.
    Join {
        workspace_id: WorkspaceId,
        user_id: UserId,
        user_name: String,
    },
    Sync(SyncRequest),
    Submit(SubmitRequest),
    Presence(Presence),
    Leave,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        connection_id: Uuid,
        workspace_id: WorkspaceId,
        high_water: Timestamp,
        peers: Vec<PeerPresence>,
    },
    SyncResponse(SyncResponse),
    Operation(OperationPayload),
    Batch(Vec<OperationPayload>),
    Ack(SubmitResponse),
    Presence(PeerPresence),
    PeerJoined(PeerInfo),
    PeerLeft {
        connection_id: Uuid,
        user_id: UserId,
    },
    /// Sent right before the server drops the connection. With `full` set,
    /// local state can no longer be trusted and must be rebuilt from 0;
    /// otherwise catching up from the last seen position is enough.
    Resync {
        workspace_id: WorkspaceId,
        reason: String,
        full: bool,
    },
    Error {
        request_id: Option<u64>,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// `operation` for a single op, `batch` for several.
    pub fn for_operations(ops: &[Operation]) -> Option<Self> {
        match ops {
            [] => None,
            [op] => Some(ServerMessage::Operation(op.into())),
            ops => Some(ServerMessage::Batch(ops.iter().map(OperationPayload::from).collect())),
        }
    }

    pub fn error(request_id: Option<u64>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            message: message.into(),
        }
    }
}

macro_rules! json_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> Result<String, ProtocolError> {
                serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
            }

            pub fn decode(text: &str) -> Result<Self, ProtocolError> {
                serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
            }
        }
    };
}

json_codec!(ClientMessage);
json_codec!(ServerMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementContent;

    #[test]
    fn test_client_message_shape() {
        let msg = ClientMessage::Submit(SubmitRequest {
            request_id: 7,
            workspace_id: Uuid::nil(),
            items: vec![BatchItem::Delete { element_id: Uuid::nil() }],
        });
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "submit");
        assert_eq!(json["payload"]["request_id"], 7);
        assert_eq!(json["payload"]["items"][0]["op"], "delete");

        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unit_messages() {
        let ping = ClientMessage::Ping.encode().unwrap();
        assert_eq!(ClientMessage::decode(&ping).unwrap(), ClientMessage::Ping);
        let pong = ServerMessage::Pong.encode().unwrap();
        assert_eq!(ServerMessage::decode(&pong).unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn test_operation_broadcast_shape() {
        let ws = Uuid::new_v4();
        let element = Uuid::new_v4();
        let op = Operation::new(ws, element, Uuid::new_v4(), 12, Change::Move {
            position: Point::new(1.0, 2.0),
            parent: None,
        });

        let msg = ServerMessage::for_operations(std::slice::from_ref(&op)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "operation");
        assert_eq!(json["payload"]["op_type"], "move");
        assert_eq!(json["payload"]["timestamp"], 12);
        assert_eq!(json["payload"]["element_id"], element.to_string());

        let two = ServerMessage::for_operations(&[op.clone(), op.clone()]).unwrap();
        assert!(matches!(two, ServerMessage::Batch(ref ops) if ops.len() == 2));
        assert!(ServerMessage::for_operations(&[]).is_none());
    }

    #[test]
    fn test_payload_converts_back() {
        let ws = Uuid::new_v4();
        let element = Element::new(Uuid::new_v4(), ws, ElementContent::Text { text: "x".into() });
        let op = Operation::new(ws, element.id, Uuid::new_v4(), 3, Change::Create {
            element,
            provisional_id: Some(Uuid::new_v4()),
        });
        let payload = OperationPayload::from(&op);
        assert_eq!(payload.op_type, OpKind::Create);
        assert_eq!(payload.into_operation(), op);
    }

    #[test]
    fn test_batch_item_from_patch_detects_moves() {
        let id = Uuid::new_v4();
        let item = BatchItem::from_patch(id, ElementPatch::position(Point::new(4.0, 4.0)));
        assert!(matches!(item, BatchItem::Move { .. }));

        let parent_only = BatchItem::from_patch(id, ElementPatch::default().with_parent(ParentRef::Root));
        assert!(matches!(parent_only, BatchItem::Update { .. }));

        let item = BatchItem::from_patch(
            id,
            ElementPatch::position(Point::new(4.0, 4.0)).with_size(crate::element::Size::new(1.0, 1.0)),
        );
        assert!(matches!(item, BatchItem::Update { .. }));
        assert_eq!(item.element_id(), id);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ClientMessage::decode("{\"type\":\"nope\"}"),
            Err(ProtocolError::Deserialization(_))
        ));
        assert!(ServerMessage::decode("not json").is_err());
    }
}
