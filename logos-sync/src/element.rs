//! Canvas element model.
//!
//! Every element shares one envelope (position, size, rotation, style,
//! z-index, parent) and carries a type-specific [`ElementContent`] payload.
//!
//! ```text
//! ┌──────────────────── Element ────────────────────┐
//! │ id · workspace_id · version · deleted_at         │
//! │ position · size · rotation · style · z · parent  │
//! │ ┌──────────── ElementContent ─────────────────┐  │
//! │ │ Text | Shape | Image | Drawing | Sticky |   │  │
//! │ │ List | Connector | Group                    │  │
//! │ └─────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Partial updates travel as [`ElementPatch`]; merging two patches keeps the
//! newer value of every field both touch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::Timestamp;

pub type ElementId = Uuid;
pub type WorkspaceId = Uuid;
pub type UserId = Uuid;

/// Position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

impl Default for Size {
    fn default() -> Self {
        Self { width: 100.0, height: 100.0 }
    }
}

/// Visual style shared by all element types. Unset fields fall back to the
/// renderer's defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Style {
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f32>,
    pub opacity: Option<f32>,
    pub font_family: Option<String>,
    pub font_size: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Text,
    Shape,
    Image,
    Drawing,
    Sticky,
    List,
    Connector,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Triangle,
    Diamond,
    Line,
    Arrow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub text: String,
    pub checked: bool,
}

/// Type-specific element payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementContent {
    Text {
        text: String,
    },
    Shape {
        shape: ShapeKind,
        label: Option<String>,
    },
    /// Image bytes live in object storage; only the asset reference syncs.
    Image {
        asset_id: String,
        natural_size: Option<Size>,
    },
    Drawing {
        points: Vec<Point>,
        pressure: Vec<f32>,
    },
    Sticky {
        text: String,
        color: String,
    },
    List {
        items: Vec<ListItem>,
    },
    Connector {
        from: Option<ElementId>,
        to: Option<ElementId>,
        waypoints: Vec<Point>,
    },
    Group {
        children: Vec<ElementId>,
    },
}

impl ElementContent {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementContent::Text { .. } => ElementKind::Text,
            ElementContent::Shape { .. } => ElementKind::Shape,
            ElementContent::Image { .. } => ElementKind::Image,
            ElementContent::Drawing { .. } => ElementKind::Drawing,
            ElementContent::Sticky { .. } => ElementKind::Sticky,
            ElementContent::List { .. } => ElementKind::List,
            ElementContent::Connector { .. } => ElementKind::Connector,
            ElementContent::Group { .. } => ElementKind::Group,
        }
    }

    /// Rewrite element references (connector endpoints, group children).
    pub fn remap_ids(&mut self, map: &HashMap<ElementId, ElementId>) {
        match self {
            ElementContent::Connector { from, to, .. } => {
                for end in [from, to] {
                    if let Some(id) = end {
                        if let Some(new_id) = map.get(id) {
                            *id = *new_id;
                        }
                    }
                }
            }
            ElementContent::Group { children } => {
                for child in children.iter_mut() {
                    if let Some(new_id) = map.get(child) {
                        *child = *new_id;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Parent assignment carried by a patch. `Root` detaches from any group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRef {
    Root,
    Group(ElementId),
}

impl ParentRef {
    pub fn as_option(&self) -> Option<ElementId> {
        match self {
            ParentRef::Root => None,
            ParentRef::Group(id) => Some(*id),
        }
    }
}

/// Individually mergeable element fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Position,
    Size,
    Rotation,
    Style,
    Content,
    ZIndex,
    Parent,
}

/// A canvas object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub workspace_id: WorkspaceId,
    pub position: Point,
    pub size: Size,
    pub rotation: f64,
    pub style: Style,
    pub content: ElementContent,
    pub z_index: i64,
    pub parent: Option<ElementId>,
    /// Timestamp of the last accepted operation. Never decreases.
    pub version: Timestamp,
    /// Set when a delete was accepted; kept until compaction.
    pub deleted_at: Option<Timestamp>,
}

impl Element {
    pub fn new(id: ElementId, workspace_id: WorkspaceId, content: ElementContent) -> Self {
        Self {
            id,
            workspace_id,
            position: Point::default(),
            size: Size::default(),
            rotation: 0.0,
            style: Style::default(),
            content,
            z_index: 0,
            parent: None,
            version: 0,
            deleted_at: None,
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.content.kind()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Build an element from a creation patch. Returns `None` without content.
    pub fn from_patch(id: ElementId, workspace_id: WorkspaceId, patch: &ElementPatch) -> Option<Self> {
        let content = patch.content.clone()?;
        let mut element = Self::new(id, workspace_id, content);
        element.apply_field_values(patch, |_| true);
        Some(element)
    }

    /// Apply the patch fields accepted by `accept`.
    pub fn apply_field_values(&mut self, patch: &ElementPatch, mut accept: impl FnMut(Field) -> bool) {
        if let Some(position) = patch.position {
            if accept(Field::Position) {
                self.position = position;
            }
        }
        if let Some(size) = patch.size {
            if accept(Field::Size) {
                self.size = size;
            }
        }
        if let Some(rotation) = patch.rotation {
            if accept(Field::Rotation) {
                self.rotation = rotation;
            }
        }
        if let Some(style) = &patch.style {
            if accept(Field::Style) {
                self.style = style.clone();
            }
        }
        if let Some(content) = &patch.content {
            if accept(Field::Content) {
                self.content = content.clone();
            }
        }
        if let Some(z_index) = patch.z_index {
            if accept(Field::ZIndex) {
                self.z_index = z_index;
            }
        }
        if let Some(parent) = patch.parent {
            if accept(Field::Parent) {
                self.parent = parent.as_option();
            }
        }
    }

    /// The full state of this element expressed as a patch.
    pub fn to_patch(&self) -> ElementPatch {
        ElementPatch {
            position: Some(self.position),
            size: Some(self.size),
            rotation: Some(self.rotation),
            style: Some(self.style.clone()),
            content: Some(self.content.clone()),
            z_index: Some(self.z_index),
            parent: Some(match self.parent {
                Some(id) => ParentRef::Group(id),
                None => ParentRef::Root,
            }),
        }
    }
}

/// Partial element state. `None` means "unchanged".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementPatch {
    pub position: Option<Point>,
    pub size: Option<Size>,
    pub rotation: Option<f64>,
    pub style: Option<Style>,
    pub content: Option<ElementContent>,
    pub z_index: Option<i64>,
    pub parent: Option<ParentRef>,
}

impl ElementPatch {
    pub fn position(position: Point) -> Self {
        Self { position: Some(position), ..Self::default() }
    }

    pub fn content(content: ElementContent) -> Self {
        Self { content: Some(content), ..Self::default() }
    }

    pub fn with_position(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = Some(style);
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Fields this patch sets.
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::with_capacity(7);
        if self.position.is_some() {
            fields.push(Field::Position);
        }
        if self.size.is_some() {
            fields.push(Field::Size);
        }
        if self.rotation.is_some() {
            fields.push(Field::Rotation);
        }
        if self.style.is_some() {
            fields.push(Field::Style);
        }
        if self.content.is_some() {
            fields.push(Field::Content);
        }
        if self.z_index.is_some() {
            fields.push(Field::ZIndex);
        }
        if self.parent.is_some() {
            fields.push(Field::Parent);
        }
        fields
    }

    /// True when the patch only repositions or re-parents the element.
    pub fn is_move(&self) -> bool {
        let fields = self.fields();
        !fields.is_empty()
            && fields
                .iter()
                .all(|f| matches!(f, Field::Position | Field::Parent))
    }

    /// Merge a newer patch into this one. Fields set in `newer` win.
    pub fn merge(&mut self, newer: ElementPatch) {
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.size.is_some() {
            self.size = newer.size;
        }
        if newer.rotation.is_some() {
            self.rotation = newer.rotation;
        }
        if newer.style.is_some() {
            self.style = newer.style;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
        if newer.z_index.is_some() {
            self.z_index = newer.z_index;
        }
        if newer.parent.is_some() {
            self.parent = newer.parent;
        }
    }

    /// Rewrite provisional element ids referenced by this patch.
    pub fn remap_ids(&mut self, map: &HashMap<ElementId, ElementId>) {
        if let Some(ParentRef::Group(parent)) = &mut self.parent {
            if let Some(new_id) = map.get(parent) {
                *parent = *new_id;
            }
        }
        if let Some(content) = &mut self.content {
            content.remap_ids(map);
        }
    }
}
