//! Canvas operations: the unit of change exchanged between the engine parts.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{ActorId, Shape, ShapeId, ShapePatch};

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Move,
    Resize,
    Rotate,
    Update,
    Delete,
    Duplicate,
    Reorder,
}

impl OperationKind {
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::Move => "Move",
            OperationKind::Resize => "Resize",
            OperationKind::Rotate => "Rotate",
            OperationKind::Update => "Update",
            OperationKind::Delete => "Delete",
            OperationKind::Duplicate => "Duplicate",
            OperationKind::Reorder => "Reorder",
        }
    }
}

/// A recorded change to one or more shapes.
///
/// `before` and `after` hold, per target, the fields the change touched:
/// enough to revert or replay it. A `create` has no `before` entries and a
/// `delete` has no `after` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    pub kind: OperationKind,

    /// User who issued this operation
    pub actor: ActorId,

    /// Client clock, milliseconds since epoch
    pub issued_at: i64,

    /// Affected shapes, in order
    pub target_ids: Vec<ShapeId>,

    #[serde(default)]
    pub before: BTreeMap<ShapeId, ShapePatch>,

    #[serde(default)]
    pub after: BTreeMap<ShapeId, ShapePatch>,
}

impl Operation {
    pub fn new(kind: OperationKind, actor: ActorId, issued_at: i64) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            actor,
            issued_at,
            target_ids: Vec::new(),
            before: BTreeMap::new(),
            after: BTreeMap::new(),
        }
    }

    /// Add a target with its before/after state. Empty patches are not stored.
    pub fn with_change(mut self, target: ShapeId, before: ShapePatch, after: ShapePatch) -> Self {
        if !self.target_ids.contains(&target) {
            self.target_ids.push(target);
        }
        if !before.is_empty() {
            self.before.insert(target, before);
        }
        if !after.is_empty() {
            self.after.insert(target, after);
        }
        self
    }

    pub fn create(actor: ActorId, issued_at: i64, shape: &Shape) -> Self {
        Self::new(OperationKind::Create, actor, issued_at).with_change(
            shape.id,
            ShapePatch::default(),
            shape.to_patch(),
        )
    }

    pub fn delete(actor: ActorId, issued_at: i64, shape: &Shape) -> Self {
        Self::new(OperationKind::Delete, actor, issued_at).with_change(
            shape.id,
            shape.to_patch(),
            ShapePatch::default(),
        )
    }

    /// Field edit on an existing shape; `before` is captured from `shape`.
    pub fn edit(
        kind: OperationKind,
        actor: ActorId,
        issued_at: i64,
        shape: &Shape,
        patch: ShapePatch,
    ) -> Self {
        let before = patch.capture(shape);
        Self::new(kind, actor, issued_at).with_change(shape.id, before, patch)
    }

    /// Copy of `original` placed as `copy`.
    pub fn duplicate(actor: ActorId, issued_at: i64, original: ShapeId, copy: &Shape) -> Self {
        Self::new(OperationKind::Duplicate, actor, issued_at)
            .with_change(original, ShapePatch::default(), ShapePatch::default())
            .with_change(copy.id, ShapePatch::default(), copy.to_patch())
    }

    pub fn touches(&self, id: ShapeId) -> bool {
        self.target_ids.contains(&id)
    }

    pub fn overlaps(&self, other: &Operation) -> bool {
        self.target_ids.iter().any(|id| other.touches(*id))
    }

    pub fn before_of(&self, id: ShapeId) -> Option<&ShapePatch> {
        self.before.get(&id)
    }

    pub fn after_of(&self, id: ShapeId) -> Option<&ShapePatch> {
        self.after.get(&id)
    }

    /// Human readable label, e.g. "Move shape" or "Delete 3 shapes".
    pub fn describe(&self) -> String {
        let count = match self.kind {
            // original + copy per duplicated shape
            OperationKind::Duplicate => (self.target_ids.len() / 2).max(1),
            _ => self.target_ids.len(),
        };
        match count {
            0 | 1 => format!("{} shape", self.kind.verb()),
            n => format!("{} {} shapes", self.kind.verb(), n),
        }
    }

    /// The operation that undoes this one, issued by `actor` at `issued_at`.
    pub fn invert(&self, actor: ActorId, issued_at: i64) -> Operation {
        let kind = match self.kind {
            OperationKind::Create | OperationKind::Duplicate => OperationKind::Delete,
            OperationKind::Delete => OperationKind::Create,
            other => other,
        };
        let target_ids = self
            .target_ids
            .iter()
            .copied()
            .filter(|id| self.before.contains_key(id) || self.after.contains_key(id))
            .collect();
        Operation {
            id: OperationId::new(),
            kind,
            actor,
            issued_at,
            target_ids,
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }

    /// A fresh copy of this operation for re-application.
    pub fn replay(&self, actor: ActorId, issued_at: i64) -> Operation {
        Operation {
            id: OperationId::new(),
            actor,
            issued_at,
            ..self.clone()
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Point, Size};

    fn shape() -> Shape {
        Shape::new(ShapeId::new(), Point::new(10.0, 10.0), Size::new(50.0, 20.0))
    }

    #[test]
    fn test_describe() {
        let actor = ActorId::new();
        let s = shape();
        let op = Operation::edit(
            OperationKind::Move,
            actor,
            0,
            &s,
            ShapePatch::default().with_position(Point::new(0.0, 0.0)),
        );
        assert_eq!(op.describe(), "Move shape");

        let batch = Operation::new(OperationKind::Delete, actor, 0)
            .with_change(ShapeId::new(), ShapePatch::default(), ShapePatch::default())
            .with_change(ShapeId::new(), ShapePatch::default(), ShapePatch::default())
            .with_change(ShapeId::new(), ShapePatch::default(), ShapePatch::default());
        assert_eq!(batch.describe(), "Delete 3 shapes");

        let copy = shape();
        let dup = Operation::duplicate(actor, 0, s.id, &copy);
        assert_eq!(dup.describe(), "Duplicate shape");
    }

    #[test]
    fn test_create_and_delete_shapes() {
        let actor = ActorId::new();
        let s = shape();

        let create = Operation::create(actor, 5, &s);
        assert!(create.before.is_empty());
        assert_eq!(create.after_of(s.id), Some(&s.to_patch()));

        let delete = Operation::delete(actor, 6, &s);
        assert!(delete.after.is_empty());
        assert_eq!(delete.before_of(s.id), Some(&s.to_patch()));
    }

    #[test]
    fn test_invert_swaps_states() {
        let actor = ActorId::new();
        let s = shape();
        let op = Operation::edit(
            OperationKind::Resize,
            actor,
            100,
            &s,
            ShapePatch::default().with_size(Size::new(80.0, 80.0)),
        );

        let inverse = op.invert(actor, 200);
        assert_ne!(inverse.id, op.id);
        assert_eq!(inverse.kind, OperationKind::Resize);
        assert_eq!(inverse.issued_at, 200);
        assert_eq!(
            inverse.after_of(s.id).and_then(|p| p.size),
            Some(Size::new(50.0, 20.0))
        );

        let create = Operation::create(actor, 0, &s);
        assert_eq!(create.invert(actor, 1).kind, OperationKind::Delete);
    }

    #[test]
    fn test_invert_duplicate_deletes_copy_only() {
        let actor = ActorId::new();
        let original = shape();
        let copy = shape();
        let dup = Operation::duplicate(actor, 0, original.id, &copy);

        let inverse = dup.invert(actor, 1);
        assert_eq!(inverse.kind, OperationKind::Delete);
        assert_eq!(inverse.target_ids, vec![copy.id]);
        assert!(inverse.before_of(copy.id).is_some());
    }

    #[test]
    fn test_equality_is_by_id() {
        let actor = ActorId::new();
        let s = shape();
        let op = Operation::create(actor, 0, &s);
        let mut same = op.clone();
        same.issued_at = 99;
        assert_eq!(op, same);
        assert_ne!(op, op.replay(actor, 0));
    }

    #[test]
    fn test_operation_json_uses_snake_case_kinds() {
        let s = shape();
        let op = Operation::create(ActorId::new(), 0, &s);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "create");

        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.target_ids, vec![s.id]);
    }
}
