//! Client-side workspace view.
//!
//! The replica keeps the confirmed server state (a [`Projection`] fed by
//! sync responses and broadcasts) separate from local edits that have not
//! been echoed back yet. Reads merge the two. When the server echoes one of
//! our own operations, overlay fields holding the same value are dropped, so
//! later remote writes to those fields become visible again.

use std::collections::HashMap;

use crate::element::{Element, ElementId, ElementPatch, UserId, WorkspaceId};
use crate::operation::{Change, Operation, StateVector, Timestamp};
use crate::projection::{ApplyOutcome, Projection};
use crate::protocol::SyncResponse;

#[derive(Debug, Clone, PartialEq)]
enum LocalEdit {
    Upsert(ElementPatch),
    Removed,
}

/// Clear every field of `local` that `confirmed` sets to the same value.
fn prune_matching(local: &mut ElementPatch, confirmed: &ElementPatch) {
    macro_rules! prune {
        ($($field:ident),*) => {
            $(
                if local.$field.is_some() && local.$field == confirmed.$field {
                    local.$field = None;
                }
            )*
        };
    }
    prune!(position, size, rotation, style, content, z_index, parent);
}

#[derive(Debug, Clone)]
pub struct Replica {
    user_id: UserId,
    confirmed: Projection,
    overlay: HashMap<ElementId, LocalEdit>,
    state_vector: StateVector,
    /// Set between [`Replica::begin_sync`] and the final catch-up page.
    syncing: bool,
    /// Broadcasts seen while syncing; the state vector only covers a
    /// contiguous prefix of the log until catch-up completes.
    deferred: StateVector,
}

impl Replica {
    pub fn new(workspace_id: WorkspaceId, user_id: UserId) -> Self {
        Self {
            user_id,
            confirmed: Projection::new(workspace_id),
            overlay: HashMap::new(),
            state_vector: StateVector::new(),
            syncing: false,
            deferred: StateVector::new(),
        }
    }

    pub fn workspace_id(&self) -> WorkspaceId {
        self.confirmed.workspace_id()
    }

    /// What to send in the next sync request.
    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn high_water(&self) -> Timestamp {
        self.state_vector.high_water()
    }

    pub fn confirmed(&self) -> &Projection {
        &self.confirmed
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Enter catch-up. Until the last page arrives, broadcasts are folded
    /// into the confirmed state without advancing the state vector.
    pub fn begin_sync(&mut self) {
        self.syncing = true;
        self.deferred = StateVector::new();
    }

    /// Fold one catch-up page. A snapshot replaces the confirmed state.
    pub fn apply_sync(&mut self, response: &SyncResponse) -> usize {
        if let Some(snapshot) = &response.snapshot {
            self.confirmed =
                Projection::from_elements(self.workspace_id(), snapshot.version, snapshot.elements.clone());
        }
        let mut applied = 0;
        for payload in &response.operations {
            let op = payload.clone().into_operation();
            if self.apply_confirmed(&op) == ApplyOutcome::Applied {
                applied += 1;
            }
        }
        self.state_vector = response.state_vector.clone();
        if self.syncing && !response.has_more {
            self.syncing = false;
            let deferred = std::mem::take(&mut self.deferred);
            self.state_vector.merge(&deferred);
        }
        applied
    }

    /// Fold a broadcast operation.
    pub fn apply_remote(&mut self, op: &Operation) -> ApplyOutcome {
        let outcome = self.apply_confirmed(op);
        if self.syncing {
            self.deferred.observe(op.user_id, op.timestamp);
        } else {
            self.state_vector.observe(op.user_id, op.timestamp);
        }
        outcome
    }

    fn apply_confirmed(&mut self, op: &Operation) -> ApplyOutcome {
        let outcome = self.confirmed.apply(op);
        if op.user_id == self.user_id {
            self.settle(op);
        }
        outcome
    }

    fn settle(&mut self, op: &Operation) {
        match &op.change {
            Change::Create { element, provisional_id } => {
                let edit = provisional_id
                    .and_then(|p| self.overlay.remove(&p))
                    .or_else(|| self.overlay.remove(&op.element_id));
                match edit {
                    Some(LocalEdit::Upsert(mut patch)) => {
                        prune_matching(&mut patch, &element.to_patch());
                        if !patch.is_empty() {
                            self.overlay.insert(op.element_id, LocalEdit::Upsert(patch));
                        }
                    }
                    Some(LocalEdit::Removed) => {
                        self.overlay.insert(op.element_id, LocalEdit::Removed);
                    }
                    None => {}
                }
            }
            Change::Delete => {
                if self.overlay.get(&op.element_id) == Some(&LocalEdit::Removed) {
                    self.overlay.remove(&op.element_id);
                }
            }
            change => {
                let Some(confirmed) = change.as_patch() else { return };
                if let Some(LocalEdit::Upsert(local)) = self.overlay.get_mut(&op.element_id) {
                    prune_matching(local, &confirmed);
                    if local.is_empty() {
                        self.overlay.remove(&op.element_id);
                    }
                }
            }
        }
    }

    /// Record an optimistic local change.
    pub fn local_change(&mut self, element_id: ElementId, patch: ElementPatch) {
        match self.overlay.get_mut(&element_id) {
            Some(LocalEdit::Upsert(local)) => local.merge(patch),
            Some(LocalEdit::Removed) => {}
            None => {
                self.overlay.insert(element_id, LocalEdit::Upsert(patch));
            }
        }
    }

    pub fn local_delete(&mut self, element_id: ElementId) {
        self.overlay.insert(element_id, LocalEdit::Removed);
    }

    /// Move local edits from a provisional id to its server id.
    pub fn remap(&mut self, provisional: ElementId, server: ElementId) {
        if let Some(edit) = self.overlay.remove(&provisional) {
            // Edits already filed under the server id are the newer ones
            let merged = match (edit, self.overlay.remove(&server)) {
                (LocalEdit::Upsert(mut older), Some(LocalEdit::Upsert(newer))) => {
                    older.merge(newer);
                    LocalEdit::Upsert(older)
                }
                (LocalEdit::Removed, _) | (_, Some(LocalEdit::Removed)) => LocalEdit::Removed,
                (edit, None) => edit,
            };
            self.overlay.insert(server, merged);
        }
        let map = HashMap::from([(provisional, server)]);
        for edit in self.overlay.values_mut() {
            if let LocalEdit::Upsert(patch) = edit {
                patch.remap_ids(&map);
            }
        }
    }

    /// Drop local edits for an element, e.g. after the server rejected them.
    pub fn discard(&mut self, element_id: &ElementId) {
        self.overlay.remove(element_id);
    }

    /// Forget confirmed state; local edits are kept for resubmission.
    pub fn reset(&mut self) {
        self.confirmed = Projection::new(self.workspace_id());
        self.state_vector = StateVector::new();
        self.deferred = StateVector::new();
    }

    pub fn has_local_edits(&self) -> bool {
        !self.overlay.is_empty()
    }

    /// Merged view of one element.
    pub fn element(&self, element_id: &ElementId) -> Option<Element> {
        match (self.confirmed.get(element_id), self.overlay.get(element_id)) {
            (_, Some(LocalEdit::Removed)) => None,
            (Some(element), Some(LocalEdit::Upsert(patch))) => {
                let mut element = element.clone();
                element.apply_field_values(patch, |_| true);
                Some(element)
            }
            (Some(element), None) => Some(element.clone()),
            (None, Some(LocalEdit::Upsert(patch))) => {
                Element::from_patch(*element_id, self.workspace_id(), patch)
            }
            (None, None) => None,
        }
    }

    /// Merged view of every live element, ordered by z-index.
    pub fn elements(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = self
            .confirmed
            .elements()
            .into_iter()
            .filter_map(|e| self.element(&e.id))
            .collect();
        for (id, edit) in &self.overlay {
            if let LocalEdit::Upsert(patch) = edit {
                if self.confirmed.get_any(id).is_none() {
                    if let Some(element) = Element::from_patch(*id, self.workspace_id(), patch) {
                        elements.push(element);
                    }
                }
            }
        }
        elements.sort_by(|a, b| a.z_index.cmp(&b.z_index).then(a.id.cmp(&b.id)));
        elements
    }
}
