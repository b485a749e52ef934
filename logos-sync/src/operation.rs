//! Operations and their total order.
//!
//! An [`Operation`] is an immutable fact accepted into a workspace log. Within
//! a workspace, operations are totally ordered by [`OrderKey`]
//! `(timestamp, user_id)`; the server never issues the same timestamp twice
//! in a workspace, so the user id only breaks ties for out-of-band merges.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::element::{Element, ElementId, ElementPatch, ParentRef, Point, UserId, WorkspaceId};

/// Per-workspace logical (Lamport) timestamp.
pub type Timestamp = u64;

/// Operation kind as exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
    Move,
}

/// The state change carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Full initial state. `provisional_id` is the client-side id the
    /// element was created under, kept for idempotent retries.
    Create {
        element: Element,
        provisional_id: Option<ElementId>,
    },
    Update {
        patch: ElementPatch,
    },
    Move {
        position: Point,
        parent: Option<ParentRef>,
    },
    Delete,
}

impl Change {
    pub fn kind(&self) -> OpKind {
        match self {
            Change::Create { .. } => OpKind::Create,
            Change::Update { .. } => OpKind::Update,
            Change::Move { .. } => OpKind::Move,
            Change::Delete => OpKind::Delete,
        }
    }

    /// Field values carried by this change, as a patch.
    pub fn as_patch(&self) -> Option<ElementPatch> {
        match self {
            Change::Create { element, .. } => Some(element.to_patch()),
            Change::Update { patch } => Some(patch.clone()),
            Change::Move { position, parent } => Some(ElementPatch {
                position: Some(*position),
                parent: *parent,
                ..ElementPatch::default()
            }),
            Change::Delete => None,
        }
    }
}

/// Deterministic total-order key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey {
    pub timestamp: Timestamp,
    pub user_id: UserId,
}

impl OrderKey {
    pub const ZERO: OrderKey = OrderKey { timestamp: 0, user_id: Uuid::nil() };

    pub fn new(timestamp: Timestamp, user_id: UserId) -> Self {
        Self { timestamp, user_id }
    }
}

/// An accepted, immutable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub workspace_id: WorkspaceId,
    pub element_id: ElementId,
    pub user_id: UserId,
    pub timestamp: Timestamp,
    pub change: Change,
}

impl Operation {
    pub fn new(
        workspace_id: WorkspaceId,
        element_id: ElementId,
        user_id: UserId,
        timestamp: Timestamp,
        change: Change,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            element_id,
            user_id,
            timestamp,
            change,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.change.kind()
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey::new(self.timestamp, self.user_id)
    }
}

/// Sort operations into the canonical workspace order.
pub fn sort_canonical(ops: &mut [Operation]) {
    ops.sort_by_key(|op| op.order_key());
}

/// Per-user high-water marks of observed timestamps in one workspace.
///
/// Only used for catch-up; always derivable by replaying the log.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<UserId, Timestamp>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A vector with a single entry, as sent by a client that only tracks
    /// its own position in the log.
    pub fn for_user(user_id: UserId, timestamp: Timestamp) -> Self {
        let mut sv = Self::new();
        sv.observe(user_id, timestamp);
        sv
    }

    /// Rebuild from a log: each author has observed at least its own writes.
    pub fn from_operations<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut sv = Self::new();
        for op in ops {
            sv.observe(op.user_id, op.timestamp);
        }
        sv
    }

    /// Record that `user_id` has observed `timestamp`. Never moves backwards.
    pub fn observe(&mut self, user_id: UserId, timestamp: Timestamp) {
        let entry = self.entries.entry(user_id).or_insert(0);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    pub fn get(&self, user_id: &UserId) -> Timestamp {
        self.entries.get(user_id).copied().unwrap_or(0)
    }

    /// Highest timestamp any entry has observed (0 if never synced).
    pub fn high_water(&self) -> Timestamp {
        self.entries.values().copied().max().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &StateVector) {
        for (user, ts) in &other.entries {
            self.observe(*user, *ts);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &Timestamp)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_at(ts: Timestamp, user: UserId) -> Operation {
        Operation::new(Uuid::nil(), Uuid::new_v4(), user, ts, Change::Delete)
    }

    #[test]
    fn test_order_key_ties_break_on_user() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(OrderKey::new(5, a) < OrderKey::new(5, b));
        assert!(OrderKey::new(4, b) < OrderKey::new(5, a));
        assert!(OrderKey::ZERO < OrderKey::new(1, Uuid::nil()));
    }

    #[test]
    fn test_sort_canonical() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut ops = vec![op_at(3, a), op_at(1, b), op_at(3, b), op_at(2, a)];
        sort_canonical(&mut ops);
        let keys: Vec<_> = ops.iter().map(|o| (o.timestamp, o.user_id)).collect();
        assert_eq!(keys, vec![(1, b), (2, a), (3, a), (3, b)]);
    }

    #[test]
    fn test_state_vector_is_monotonic() {
        let user = Uuid::new_v4();
        let mut sv = StateVector::new();
        assert_eq!(sv.high_water(), 0);

        sv.observe(user, 10);
        sv.observe(user, 4);
        assert_eq!(sv.get(&user), 10);
        assert_eq!(sv.high_water(), 10);
    }

    #[test]
    fn test_state_vector_from_log_and_merge() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ops = vec![op_at(1, a), op_at(2, b), op_at(3, a)];
        let sv = StateVector::from_operations(&ops);
        assert_eq!(sv.get(&a), 3);
        assert_eq!(sv.get(&b), 2);

        let mut other = StateVector::for_user(b, 9);
        other.merge(&sv);
        assert_eq!(other.get(&b), 9);
        assert_eq!(other.get(&a), 3);
        assert_eq!(other.high_water(), 9);
    }

    #[test]
    fn test_move_change_as_patch() {
        let change = Change::Move { position: Point::new(3.0, 4.0), parent: None };
        let patch = change.as_patch().unwrap();
        assert!(patch.is_move());
        assert_eq!(change.kind(), OpKind::Move);
        assert!(Change::Delete.as_patch().is_none());
    }
}
