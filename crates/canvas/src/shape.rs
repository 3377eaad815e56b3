use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{hash_map, HashMap},
    fmt,
};
use uuid::Uuid;

use crate::CanvasError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ShapeId(pub Uuid);

impl ShapeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user editing the canvas
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

fn default_fill() -> String {
    "#9ca3af".to_string()
}

fn default_opacity() -> f64 {
    1.0
}

/// A visual object on the canvas.
///
/// The backing store owns shapes; the engine only touches the typed fields
/// below. Anything else a host keeps per shape rides along in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shape {
    pub id: ShapeId,
    pub position: Point,
    pub size: Size,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_fill")]
    pub fill: String,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub order_key: f64,
    #[serde(default)]
    pub lock_owner: Option<ActorId>,
    /// Incremented by the store on every accepted write
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub last_modified_by: Option<ActorId>,
    /// Milliseconds since epoch
    #[serde(default)]
    pub last_modified_at: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Shape {
    pub fn new(id: ShapeId, position: Point, size: Size) -> Self {
        Self {
            id,
            position,
            size,
            rotation: 0.0,
            fill: default_fill(),
            opacity: default_opacity(),
            order_key: 0.0,
            lock_owner: None,
            version: 0,
            last_modified_by: None,
            last_modified_at: 0,
            metadata: serde_json::Value::Null,
        }
    }

    /// Build a shape from a patch that carries at least position and size.
    pub fn from_patch(id: ShapeId, patch: &ShapePatch) -> Result<Self, CanvasError> {
        let position = patch
            .position
            .ok_or(CanvasError::IncompletePatch(id, "position"))?;
        let size = patch.size.ok_or(CanvasError::IncompletePatch(id, "size"))?;
        let mut shape = Shape::new(id, position, size);
        shape.apply_patch(patch);
        Ok(shape)
    }

    /// Full patch describing every engine-owned field of this shape.
    pub fn to_patch(&self) -> ShapePatch {
        ShapePatch {
            position: Some(self.position),
            size: Some(self.size),
            rotation: Some(self.rotation),
            fill: Some(self.fill.clone()),
            opacity: Some(self.opacity),
            order_key: Some(self.order_key),
            lock_owner: Some(self.lock_owner),
            last_modified_by: self.last_modified_by,
            last_modified_at: Some(self.last_modified_at),
            metadata: match &self.metadata {
                serde_json::Value::Null => None,
                other => Some(other.clone()),
            },
        }
    }

    pub fn apply_patch(&mut self, patch: &ShapePatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(size) = patch.size {
            self.size = size;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(fill) = &patch.fill {
            self.fill = fill.clone();
        }
        if let Some(opacity) = patch.opacity {
            self.opacity = opacity;
        }
        if let Some(order_key) = patch.order_key {
            self.order_key = order_key;
        }
        if let Some(lock_owner) = patch.lock_owner {
            self.lock_owner = lock_owner;
        }
        if let Some(actor) = patch.last_modified_by {
            self.last_modified_by = Some(actor);
        }
        if let Some(at) = patch.last_modified_at {
            self.last_modified_at = at;
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
    }

    /// True when another actor holds the edit lock on this shape.
    pub fn is_locked_by_other(&self, actor: ActorId) -> bool {
        matches!(self.lock_owner, Some(owner) if owner != actor)
    }
}

// Keeps an explicit `null` distinct from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial shape: only the fields that are `Some` are touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShapePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<f64>,
    /// `Some(None)` clears the lock
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub lock_owner: Option<Option<ActorId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ShapePatch {
    pub fn with_position(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = Some(opacity);
        self
    }

    pub fn with_order_key(mut self, order_key: f64) -> Self {
        self.order_key = Some(order_key);
        self
    }

    pub fn with_lock_owner(mut self, owner: Option<ActorId>) -> Self {
        self.lock_owner = Some(owner);
        self
    }

    /// Stamp the authorship fields.
    pub fn stamped(mut self, actor: ActorId, at: i64) -> Self {
        self.last_modified_by = Some(actor);
        self.last_modified_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Shallow right-biased merge: every field set in `newer` wins.
    pub fn merge(&mut self, newer: ShapePatch) {
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.size.is_some() {
            self.size = newer.size;
        }
        if newer.rotation.is_some() {
            self.rotation = newer.rotation;
        }
        if newer.fill.is_some() {
            self.fill = newer.fill;
        }
        if newer.opacity.is_some() {
            self.opacity = newer.opacity;
        }
        if newer.order_key.is_some() {
            self.order_key = newer.order_key;
        }
        if newer.lock_owner.is_some() {
            self.lock_owner = newer.lock_owner;
        }
        if newer.last_modified_by.is_some() {
            self.last_modified_by = newer.last_modified_by;
        }
        if newer.last_modified_at.is_some() {
            self.last_modified_at = newer.last_modified_at;
        }
        if newer.metadata.is_some() {
            self.metadata = newer.metadata;
        }
    }

    pub fn merged(mut self, newer: ShapePatch) -> Self {
        self.merge(newer);
        self
    }

    /// Current values on `shape` for every content field this patch sets.
    ///
    /// Authorship fields are captured too so that reverting a change also
    /// restores who last touched the shape.
    pub fn capture(&self, shape: &Shape) -> ShapePatch {
        ShapePatch {
            position: self.position.map(|_| shape.position),
            size: self.size.map(|_| shape.size),
            rotation: self.rotation.map(|_| shape.rotation),
            fill: self.fill.as_ref().map(|_| shape.fill.clone()),
            opacity: self.opacity.map(|_| shape.opacity),
            order_key: self.order_key.map(|_| shape.order_key),
            lock_owner: self.lock_owner.map(|_| shape.lock_owner),
            last_modified_by: shape.last_modified_by,
            last_modified_at: Some(shape.last_modified_at),
            metadata: self.metadata.as_ref().map(|_| shape.metadata.clone()),
        }
    }

    /// Content fields that differ between two shapes, taking `after`'s values.
    pub fn diff(before: &Shape, after: &Shape) -> ShapePatch {
        ShapePatch {
            position: (before.position != after.position).then_some(after.position),
            size: (before.size != after.size).then_some(after.size),
            rotation: (before.rotation != after.rotation).then_some(after.rotation),
            fill: (before.fill != after.fill).then(|| after.fill.clone()),
            opacity: (before.opacity != after.opacity).then_some(after.opacity),
            order_key: (before.order_key != after.order_key).then_some(after.order_key),
            lock_owner: (before.lock_owner != after.lock_owner).then_some(after.lock_owner),
            last_modified_by: None,
            last_modified_at: None,
            metadata: (before.metadata != after.metadata).then(|| after.metadata.clone()),
        }
    }

    /// Names of the fields this patch sets, authorship excluded.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.position.is_some() {
            names.push("position");
        }
        if self.size.is_some() {
            names.push("size");
        }
        if self.rotation.is_some() {
            names.push("rotation");
        }
        if self.fill.is_some() {
            names.push("fill");
        }
        if self.opacity.is_some() {
            names.push("opacity");
        }
        if self.order_key.is_some() {
            names.push("order_key");
        }
        if self.lock_owner.is_some() {
            names.push("lock_owner");
        }
        if self.metadata.is_some() {
            names.push("metadata");
        }
        names
    }
}

/// The set of shapes on one canvas, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ShapeSet {
    shapes: HashMap<ShapeId, Shape>,
}

impl ShapeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn contains(&self, id: ShapeId) -> bool {
        self.shapes.contains_key(&id)
    }

    pub fn get(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    pub fn get_mut(&mut self, id: ShapeId) -> Option<&mut Shape> {
        self.shapes.get_mut(&id)
    }

    /// Insert or replace, returning the previous shape with the same id.
    pub fn upsert(&mut self, shape: Shape) -> Option<Shape> {
        self.shapes.insert(shape.id, shape)
    }

    pub fn insert(&mut self, shape: Shape) -> Result<(), CanvasError> {
        if self.shapes.contains_key(&shape.id) {
            return Err(CanvasError::ShapeExists(shape.id));
        }
        self.shapes.insert(shape.id, shape);
        Ok(())
    }

    pub fn remove(&mut self, id: ShapeId) -> Option<Shape> {
        self.shapes.remove(&id)
    }

    pub fn apply_patch(&mut self, id: ShapeId, patch: &ShapePatch) -> Result<(), CanvasError> {
        let shape = self
            .shapes
            .get_mut(&id)
            .ok_or(CanvasError::ShapeNotFound(id))?;
        shape.apply_patch(patch);
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.shapes.keys().copied()
    }

    pub fn iter(&self) -> hash_map::Values<'_, ShapeId, Shape> {
        self.shapes.values()
    }

    /// Shapes from back to front: ascending order key, ties broken by id.
    pub fn layered(&self) -> Vec<&Shape> {
        let mut ordered: Vec<&Shape> = self.shapes.values().collect();
        ordered.sort_by(|a, b| a.order_key.total_cmp(&b.order_key).then(a.id.cmp(&b.id)));
        ordered
    }
}

impl FromIterator<Shape> for ShapeSet {
    fn from_iter<I: IntoIterator<Item = Shape>>(iter: I) -> Self {
        Self {
            shapes: iter.into_iter().map(|s| (s.id, s)).collect(),
        }
    }
}

impl IntoIterator for ShapeSet {
    type Item = Shape;
    type IntoIter = hash_map::IntoValues<ShapeId, Shape>;

    fn into_iter(self) -> Self::IntoIter {
        self.shapes.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64) -> Shape {
        Shape::new(ShapeId::new(), Point::new(x, y), Size::new(10.0, 10.0))
    }

    #[test]
    fn test_merge_is_right_biased() {
        let older = ShapePatch::default()
            .with_position(Point::new(1.0, 1.0))
            .with_fill("#ff0000");
        let newer = ShapePatch::default()
            .with_position(Point::new(5.0, 5.0))
            .with_opacity(0.5);

        let merged = older.merged(newer);
        assert_eq!(merged.position, Some(Point::new(5.0, 5.0)));
        assert_eq!(merged.fill.as_deref(), Some("#ff0000"));
        assert_eq!(merged.opacity, Some(0.5));
    }

    #[test]
    fn test_capture_only_touched_fields() {
        let mut shape = square(3.0, 4.0);
        shape.rotation = 45.0;
        let patch = ShapePatch::default().with_position(Point::new(9.0, 9.0));

        let before = patch.capture(&shape);
        assert_eq!(before.position, Some(Point::new(3.0, 4.0)));
        assert_eq!(before.rotation, None);
        assert_eq!(before.field_names(), vec!["position"]);
    }

    #[test]
    fn test_from_patch_requires_geometry() {
        let id = ShapeId::new();
        let patch = ShapePatch::default().with_position(Point::new(0.0, 0.0));
        let err = Shape::from_patch(id, &patch).unwrap_err();
        assert!(matches!(err, CanvasError::IncompletePatch(_, "size")));

        let shape = square(1.0, 2.0);
        let rebuilt = Shape::from_patch(shape.id, &shape.to_patch()).unwrap();
        assert_eq!(rebuilt, shape);
    }

    #[test]
    fn test_lock_owner_null_survives_json() {
        let patch = ShapePatch::default().with_lock_owner(None);
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"lock_owner":null}"#);

        let parsed: ShapePatch = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.lock_owner, Some(None));

        let absent: ShapePatch = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.lock_owner, None);
        assert!(absent.is_empty());
    }

    #[test]
    fn test_diff_reports_changed_fields() {
        let before = square(0.0, 0.0);
        let mut after = before.clone();
        after.size = Size::new(20.0, 20.0);
        after.fill = "#00ff00".to_string();

        let diff = ShapePatch::diff(&before, &after);
        assert_eq!(diff.field_names(), vec!["size", "fill"]);
    }

    #[test]
    fn test_default_ids_are_fresh() {
        assert_ne!(ShapeId::default(), ShapeId::default());
        assert_ne!(ActorId::default(), ActorId::default());
        assert!(!ShapeId::default().0.is_nil());
    }

    #[test]
    fn test_layered_breaks_ties_by_id() {
        let mut a = square(0.0, 0.0);
        let mut b = square(0.0, 0.0);
        a.order_key = 1.0;
        b.order_key = 1.0;
        let set: ShapeSet = vec![a.clone(), b.clone()].into_iter().collect();

        let ids: Vec<ShapeId> = set.layered().iter().map(|s| s.id).collect();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
