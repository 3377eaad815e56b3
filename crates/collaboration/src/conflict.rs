//! Conflict detection and resolution between a local and a remote operation.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ConflictConfig, Operation, OperationId, OperationKind};

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// One side deleted a shape the other side was editing
    DeleteWhileEditing,

    /// Both sides created shapes; both legitimately exist
    CreateCollision,

    /// Moves/updates racing each other in quick succession
    RapidEditStorm,

    /// Two users moved or updated the same shape
    SimultaneousMove,

    /// Two users resized or rotated the same shape
    SimultaneousTransform,

    /// Any other overlapping pair of edits
    ConcurrentEdit,
}

impl ConflictKind {
    /// 1 (informational) to 5 (always surfaced)
    pub fn severity(&self) -> u8 {
        match self {
            ConflictKind::DeleteWhileEditing => 5,
            ConflictKind::RapidEditStorm => 4,
            ConflictKind::SimultaneousTransform => 3,
            ConflictKind::SimultaneousMove => 2,
            ConflictKind::ConcurrentEdit => 2,
            ConflictKind::CreateCollision => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::DeleteWhileEditing => "delete-while-editing",
            ConflictKind::CreateCollision => "create-collision",
            ConflictKind::RapidEditStorm => "rapid-edit-storm",
            ConflictKind::SimultaneousMove => "simultaneous-move",
            ConflictKind::SimultaneousTransform => "simultaneous-transform",
            ConflictKind::ConcurrentEdit => "concurrent-edit",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of last-write-wins, seen from the local client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    RemoteWins,
    LocalWins,
    NoConflict,
}

/// Result of comparing two operations. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub has_conflict: bool,
    pub kind: Option<ConflictKind>,
    pub winner: Option<OperationId>,
    pub loser: Option<OperationId>,
    pub resolution: Resolution,
    pub severity: u8,
}

impl ConflictRecord {
    pub fn none() -> Self {
        Self {
            has_conflict: false,
            kind: None,
            winner: None,
            loser: None,
            resolution: Resolution::NoConflict,
            severity: 0,
        }
    }
}

/// Stateless last-write-wins conflict detector
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Compare a pending local operation with an incoming remote one.
    pub fn detect(&self, local: &Operation, remote: &Operation) -> ConflictRecord {
        // Echo of our own write, or edits on unrelated shapes
        if local.actor == remote.actor || !local.overlaps(remote) {
            return ConflictRecord::none();
        }

        let delta = (remote.issued_at - local.issued_at).abs();
        let kind = self.classify(local.kind, remote.kind, delta);

        let resolution = if delta < self.config.tie_window_ms || remote.issued_at > local.issued_at
        {
            // Ties go to the remote side: the store saw it first
            Resolution::RemoteWins
        } else {
            Resolution::LocalWins
        };

        let (winner, loser) = match resolution {
            Resolution::RemoteWins => (remote.id, local.id),
            _ => (local.id, remote.id),
        };

        ConflictRecord {
            has_conflict: true,
            kind: Some(kind),
            winner: Some(winner),
            loser: Some(loser),
            resolution,
            severity: kind.severity(),
        }
    }

    /// Classify the type of conflict
    fn classify(&self, local: OperationKind, remote: OperationKind, delta_ms: i64) -> ConflictKind {
        use OperationKind::*;

        match (local, remote) {
            (Delete, _) | (_, Delete) => ConflictKind::DeleteWhileEditing,
            (Create, Create) => ConflictKind::CreateCollision,
            (Move | Update, Move | Update) => {
                // Two drags racing are a plain simultaneous move; a storm
                // needs a property update in the mix.
                let storm = delta_ms < self.config.storm_window_ms
                    && (local == Update || remote == Update);
                if storm {
                    ConflictKind::RapidEditStorm
                } else {
                    ConflictKind::SimultaneousMove
                }
            }
            (Resize | Rotate, Resize | Rotate) => ConflictKind::SimultaneousTransform,
            _ => ConflictKind::ConcurrentEdit,
        }
    }

    /// Whether the user should hear about this conflict.
    pub fn should_notify(record: &ConflictRecord) -> bool {
        if !record.has_conflict {
            return false;
        }
        match record.kind {
            Some(ConflictKind::DeleteWhileEditing) => true,
            Some(ConflictKind::CreateCollision) => false,
            _ => record.resolution == Resolution::RemoteWins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, Point, Shape, ShapeId, ShapePatch, Size};

    fn shape() -> Shape {
        Shape::new(ShapeId::new(), Point::new(0.0, 0.0), Size::new(10.0, 10.0))
    }

    fn op_on(shape: &Shape, kind: OperationKind, actor: ActorId, at: i64) -> Operation {
        let patch = match kind {
            OperationKind::Resize => ShapePatch::default().with_size(Size::new(5.0, 5.0)),
            OperationKind::Rotate => ShapePatch::default().with_rotation(90.0),
            OperationKind::Update => ShapePatch::default().with_fill("#123456"),
            _ => ShapePatch::default().with_position(Point::new(1.0, 1.0)),
        };
        match kind {
            OperationKind::Delete => Operation::delete(actor, at, shape),
            OperationKind::Create => Operation::create(actor, at, shape),
            _ => Operation::edit(kind, actor, at, shape, patch),
        }
    }

    #[test]
    fn test_disjoint_targets_never_conflict() {
        let detector = ConflictDetector::default();
        let (x, y) = (ActorId::new(), ActorId::new());
        let (a, b) = (shape(), shape());

        for kind in [OperationKind::Move, OperationKind::Delete, OperationKind::Rotate] {
            let record = detector.detect(&op_on(&a, kind, x, 0), &op_on(&b, kind, y, 0));
            assert_eq!(record.resolution, Resolution::NoConflict);
            assert!(!record.has_conflict);
        }
    }

    #[test]
    fn test_same_actor_is_an_echo() {
        let detector = ConflictDetector::default();
        let x = ActorId::new();
        let s = shape();

        let record = detector.detect(
            &op_on(&s, OperationKind::Move, x, 0),
            &op_on(&s, OperationKind::Delete, x, 5000),
        );
        assert_eq!(record, ConflictRecord::none());
    }

    #[test]
    fn test_classification() {
        let detector = ConflictDetector::default();
        let (x, y) = (ActorId::new(), ActorId::new());
        let s = shape();
        let kind_of = |l: OperationKind, r: OperationKind, dt: i64| {
            detector
                .detect(&op_on(&s, l, x, 1000), &op_on(&s, r, y, 1000 + dt))
                .kind
        };

        use OperationKind::*;
        assert_eq!(kind_of(Move, Delete, 0), Some(ConflictKind::DeleteWhileEditing));
        assert_eq!(kind_of(Delete, Rotate, 0), Some(ConflictKind::DeleteWhileEditing));
        assert_eq!(kind_of(Create, Create, 0), Some(ConflictKind::CreateCollision));
        assert_eq!(kind_of(Move, Update, 100), Some(ConflictKind::RapidEditStorm));
        assert_eq!(kind_of(Update, Update, 499), Some(ConflictKind::RapidEditStorm));
        assert_eq!(kind_of(Update, Move, 500), Some(ConflictKind::SimultaneousMove));
        assert_eq!(kind_of(Move, Move, 50), Some(ConflictKind::SimultaneousMove));
        assert_eq!(kind_of(Resize, Rotate, 0), Some(ConflictKind::SimultaneousTransform));
        assert_eq!(kind_of(Move, Resize, 0), Some(ConflictKind::ConcurrentEdit));
    }

    #[test]
    fn test_last_write_wins() {
        let detector = ConflictDetector::default();
        let (x, y) = (ActorId::new(), ActorId::new());
        let s = shape();

        let local = op_on(&s, OperationKind::Move, x, 1000);
        let later = op_on(&s, OperationKind::Move, y, 1050);
        let record = detector.detect(&local, &later);
        assert_eq!(record.resolution, Resolution::RemoteWins);
        assert_eq!(record.winner, Some(later.id));
        assert_eq!(record.loser, Some(local.id));

        let earlier = op_on(&s, OperationKind::Move, y, 900);
        let record = detector.detect(&local, &earlier);
        assert_eq!(record.resolution, Resolution::LocalWins);
        assert_eq!(record.winner, Some(local.id));
    }

    #[test]
    fn test_near_ties_go_to_remote() {
        let detector = ConflictDetector::default();
        let (x, y) = (ActorId::new(), ActorId::new());
        let s = shape();

        let local = op_on(&s, OperationKind::Rotate, x, 1009);
        let remote = op_on(&s, OperationKind::Rotate, y, 1000);
        assert_eq!(
            detector.detect(&local, &remote).resolution,
            Resolution::RemoteWins
        );

        let remote = op_on(&s, OperationKind::Rotate, y, 999);
        assert_eq!(
            detector.detect(&local, &remote).resolution,
            Resolution::LocalWins
        );
    }

    #[test]
    fn test_should_notify() {
        let detector = ConflictDetector::default();
        let (x, y) = (ActorId::new(), ActorId::new());
        let s = shape();

        // delete surfaces even when local wins
        let record = detector.detect(
            &op_on(&s, OperationKind::Delete, x, 5000),
            &op_on(&s, OperationKind::Move, y, 1000),
        );
        assert_eq!(record.resolution, Resolution::LocalWins);
        assert_eq!(record.severity, 5);
        assert!(ConflictDetector::should_notify(&record));

        let record = detector.detect(
            &op_on(&s, OperationKind::Create, x, 0),
            &op_on(&s, OperationKind::Create, y, 100),
        );
        assert!(!ConflictDetector::should_notify(&record));

        let record = detector.detect(
            &op_on(&s, OperationKind::Move, x, 5000),
            &op_on(&s, OperationKind::Move, y, 1000),
        );
        assert!(!ConflictDetector::should_notify(&record));

        let record = detector.detect(
            &op_on(&s, OperationKind::Move, x, 1000),
            &op_on(&s, OperationKind::Move, y, 5000),
        );
        assert!(ConflictDetector::should_notify(&record));
        assert!(!ConflictDetector::should_notify(&ConflictRecord::none()));
    }
}
