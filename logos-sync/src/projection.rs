//! In-memory materialization of a workspace log.
//!
//! Each element keeps the [`OrderKey`] of the operation that last wrote each
//! field. A change only overwrites a field when its key is strictly greater,
//! so applying operations out of order, or applying one twice, converges on
//! the same state as applying the log in canonical order.

use std::collections::HashMap;

use crate::element::{Element, ElementId, Field, WorkspaceId};
use crate::operation::{Change, Operation, OrderKey, Timestamp};

/// Outcome of folding one operation into the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// At least one field changed.
    Applied,
    /// Every field the operation touches already holds a newer write, or the
    /// operation was applied before.
    Superseded,
    /// The target element is unknown to this projection.
    MissingElement,
}

#[derive(Debug, Clone)]
struct Entry {
    element: Element,
    stamps: HashMap<Field, OrderKey>,
    created: OrderKey,
    deleted: Option<OrderKey>,
}

impl Entry {
    fn stamp(&self, field: Field) -> OrderKey {
        self.stamps.get(&field).copied().unwrap_or(self.created)
    }
}

/// Materialized element set for one workspace.
#[derive(Debug, Clone)]
pub struct Projection {
    workspace_id: WorkspaceId,
    entries: HashMap<ElementId, Entry>,
    high_water: Timestamp,
}

impl Projection {
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            entries: HashMap::new(),
            high_water: 0,
        }
    }

    /// Rebuild from a checkpoint. Every field is stamped with the snapshot
    /// version, so any later operation overrides it.
    pub fn from_elements(workspace_id: WorkspaceId, version: Timestamp, elements: Vec<Element>) -> Self {
        let base = OrderKey::new(version, uuid::Uuid::nil());
        let entries = elements
            .into_iter()
            .map(|element| {
                let deleted = element.deleted_at.map(|ts| OrderKey::new(ts, uuid::Uuid::nil()));
                (
                    element.id,
                    Entry {
                        element,
                        stamps: HashMap::new(),
                        created: base,
                        deleted,
                    },
                )
            })
            .collect();
        Self {
            workspace_id,
            entries,
            high_water: version,
        }
    }

    /// Fold a sequence of operations.
    pub fn replay<'a>(workspace_id: WorkspaceId, ops: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut projection = Self::new(workspace_id);
        for op in ops {
            projection.apply(op);
        }
        projection
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.workspace_id
    }

    /// Highest timestamp folded so far.
    pub fn high_water(&self) -> Timestamp {
        self.high_water
    }

    pub fn apply(&mut self, op: &Operation) -> ApplyOutcome {
        let key = op.order_key();
        if op.timestamp > self.high_water {
            self.high_water = op.timestamp;
        }

        match &op.change {
            Change::Create { element, .. } => {
                if let Some(entry) = self.entries.get_mut(&op.element_id) {
                    if entry.created == key {
                        return ApplyOutcome::Superseded;
                    }
                    // Same id created twice: treat the later create as a full write.
                    let patch = element.to_patch();
                    return Self::write_fields(entry, &patch, key, op.timestamp);
                }
                let mut element = element.clone();
                element.id = op.element_id;
                element.workspace_id = op.workspace_id;
                element.version = op.timestamp;
                element.deleted_at = None;
                self.entries.insert(
                    op.element_id,
                    Entry {
                        element,
                        stamps: HashMap::new(),
                        created: key,
                        deleted: None,
                    },
                );
                ApplyOutcome::Applied
            }
            Change::Update { .. } | Change::Move { .. } => {
                let Some(entry) = self.entries.get_mut(&op.element_id) else {
                    return ApplyOutcome::MissingElement;
                };
                match op.change.as_patch() {
                    Some(patch) => Self::write_fields(entry, &patch, key, op.timestamp),
                    None => ApplyOutcome::Superseded,
                }
            }
            Change::Delete => {
                let Some(entry) = self.entries.get_mut(&op.element_id) else {
                    return ApplyOutcome::MissingElement;
                };
                entry.element.version = entry.element.version.max(op.timestamp);
                match entry.deleted {
                    Some(existing) if existing <= key => ApplyOutcome::Superseded,
                    Some(_) => {
                        // The earliest delete owns the tombstone marker.
                        entry.deleted = Some(key);
                        entry.element.deleted_at = Some(op.timestamp);
                        ApplyOutcome::Superseded
                    }
                    None => {
                        entry.deleted = Some(key);
                        entry.element.deleted_at = Some(op.timestamp);
                        ApplyOutcome::Applied
                    }
                }
            }
        }
    }

    fn write_fields(
        entry: &mut Entry,
        patch: &crate::element::ElementPatch,
        key: OrderKey,
        timestamp: Timestamp,
    ) -> ApplyOutcome {
        let mut winners = Vec::new();
        for field in patch.fields() {
            if key > entry.stamp(field) {
                winners.push(field);
            }
        }
        if winners.is_empty() {
            return ApplyOutcome::Superseded;
        }

        entry.element.apply_field_values(patch, |f| winners.contains(&f));
        for field in winners {
            entry.stamps.insert(field, key);
        }
        entry.element.version = entry.element.version.max(timestamp);
        ApplyOutcome::Applied
    }

    /// Live element by id (tombstones excluded).
    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.entries
            .get(id)
            .map(|e| &e.element)
            .filter(|e| !e.is_tombstoned())
    }

    /// Element by id, including tombstones.
    pub fn get_any(&self, id: &ElementId) -> Option<&Element> {
        self.entries.get(id).map(|e| &e.element)
    }

    pub fn contains_live(&self, id: &ElementId) -> bool {
        self.get(id).is_some()
    }

    /// Live elements in render order (z-index, then id).
    pub fn elements(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = self
            .entries
            .values()
            .map(|e| &e.element)
            .filter(|e| !e.is_tombstoned())
            .cloned()
            .collect();
        elements.sort_by(|a, b| a.z_index.cmp(&b.z_index).then(a.id.cmp(&b.id)));
        elements
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| !e.element.is_tombstoned()).count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries.len() - self.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementContent, ElementPatch, Point, Size};
    use uuid::Uuid;

    fn text(s: &str) -> ElementContent {
        ElementContent::Text { text: s.into() }
    }

    fn create(ws: Uuid, id: Uuid, ts: u64, user: Uuid) -> Operation {
        let element = Element::new(id, ws, text("hello"));
        Operation::new(ws, id, user, ts, Change::Create { element, provisional_id: None })
    }

    fn mv(ws: Uuid, id: Uuid, ts: u64, user: Uuid, x: f64) -> Operation {
        Operation::new(ws, id, user, ts, Change::Move { position: Point::new(x, x), parent: None })
    }

    #[test]
    fn test_create_then_update() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut p = Projection::new(ws);

        assert_eq!(p.apply(&create(ws, id, 1, user)), ApplyOutcome::Applied);
        let patch = ElementPatch::default().with_size(Size::new(5.0, 6.0));
        let update = Operation::new(ws, id, user, 2, Change::Update { patch });
        assert_eq!(p.apply(&update), ApplyOutcome::Applied);

        let element = p.get(&id).unwrap();
        assert_eq!(element.size, Size::new(5.0, 6.0));
        assert_eq!(element.version, 2);
        assert_eq!(p.high_water(), 2);
    }

    #[test]
    fn test_older_write_never_overrides_newer() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut p = Projection::new(ws);
        p.apply(&create(ws, id, 1, user));

        // Arrives out of order: t=3 first, then t=2
        assert_eq!(p.apply(&mv(ws, id, 3, user, 30.0)), ApplyOutcome::Applied);
        assert_eq!(p.apply(&mv(ws, id, 2, user, 20.0)), ApplyOutcome::Superseded);

        let element = p.get(&id).unwrap();
        assert_eq!(element.position, Point::new(30.0, 30.0));
        assert_eq!(element.version, 3);
    }

    #[test]
    fn test_reapplying_is_idempotent() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let ops = vec![create(ws, id, 1, user), mv(ws, id, 2, user, 9.0)];

        let once = Projection::replay(ws, &ops);
        let mut twice = Projection::replay(ws, &ops);
        for op in &ops {
            assert_eq!(twice.apply(op), ApplyOutcome::Superseded);
        }
        assert_eq!(once.elements(), twice.elements());
    }

    #[test]
    fn test_delete_tombstones_element() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut p = Projection::new(ws);
        p.apply(&create(ws, id, 1, user));
        p.apply(&Operation::new(ws, id, user, 2, Change::Delete));

        assert!(p.get(&id).is_none());
        assert_eq!(p.get_any(&id).unwrap().deleted_at, Some(2));
        assert_eq!(p.live_count(), 0);
        assert_eq!(p.tombstone_count(), 1);
        assert!(p.elements().is_empty());
    }

    #[test]
    fn test_update_unknown_element() {
        let ws = Uuid::new_v4();
        let mut p = Projection::new(ws);
        let outcome = p.apply(&mv(ws, Uuid::new_v4(), 1, Uuid::new_v4(), 1.0));
        assert_eq!(outcome, ApplyOutcome::MissingElement);
    }

    #[test]
    fn test_per_field_merge_keeps_disjoint_writes() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut p = Projection::new(ws);
        p.apply(&create(ws, id, 1, alice));

        // Bob resizes at t=3, Alice moves at t=2 but arrives later
        let resize = Operation::new(ws, id, bob, 3, Change::Update {
            patch: ElementPatch::default().with_size(Size::new(1.0, 1.0)),
        });
        p.apply(&resize);
        assert_eq!(p.apply(&mv(ws, id, 2, alice, 7.0)), ApplyOutcome::Applied);

        let element = p.get(&id).unwrap();
        assert_eq!(element.size, Size::new(1.0, 1.0));
        assert_eq!(element.position, Point::new(7.0, 7.0));
        assert_eq!(element.version, 3);
    }

    #[test]
    fn test_from_elements_yields_to_later_ops() {
        let ws = Uuid::new_v4();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut element = Element::new(id, ws, text("snap"));
        element.version = 5;

        let mut p = Projection::from_elements(ws, 5, vec![element]);
        assert_eq!(p.high_water(), 5);
        assert_eq!(p.apply(&mv(ws, id, 4, user, 1.0)), ApplyOutcome::Superseded);
        assert_eq!(p.apply(&mv(ws, id, 6, user, 2.0)), ApplyOutcome::Applied);
        assert_eq!(p.get(&id).unwrap().position, Point::new(2.0, 2.0));
    }
}
