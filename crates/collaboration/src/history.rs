//! Per-actor undo/redo history.
//!
//! A manager belongs to one actor and only ever records that actor's
//! operations, so one user's undo never reverts another user's work.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::{ActorId, HistoryConfig, Operation, OperationId, ShapeId, ShapeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub operation: Operation,
    pub description: String,
    /// Operations are recorded as they are applied, at their issue time
    pub recorded_at: i64,
}

impl HistoryEntry {
    fn new(operation: Operation) -> Self {
        Self {
            description: operation.describe(),
            recorded_at: operation.issued_at,
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RefusalReason {
    /// Requester does not own this history
    NotOwner { requester: ActorId },

    /// Another actor changed the shape since the operation was recorded
    StaleOperation { shape: ShapeId, modified_by: ActorId },

    /// A shape the step needs no longer exists
    TargetMissing { shape: ShapeId },
}

/// Outcome of an undo or redo request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStep {
    /// The recorded operation to revert (undo) or re-apply (redo)
    Ready(Operation),
    Empty,
    Refused(RefusalReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Undo,
    Redo,
}

pub struct HistoryManager {
    owner: ActorId,
    max_depth: usize,
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
}

impl HistoryManager {
    pub fn new(owner: ActorId, config: &HistoryConfig) -> Self {
        Self {
            owner,
            max_depth: config.max_depth.max(1),
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
        }
    }

    pub fn owner(&self) -> ActorId {
        self.owner
    }

    /// Record an operation by the owner. Returns false if it was refused.
    pub fn push(&mut self, op: Operation) -> bool {
        if op.actor != self.owner {
            debug!(op = %op.id, actor = %op.actor, "not recording foreign operation");
            return false;
        }
        self.undo_stack.push_back(HistoryEntry::new(op));
        self.redo_stack.clear();
        while self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
        true
    }

    pub fn undo(&mut self, requester: ActorId) -> HistoryStep {
        if requester != self.owner {
            return HistoryStep::Refused(RefusalReason::NotOwner { requester });
        }
        match self.undo_stack.pop_back() {
            Some(entry) => {
                let op = entry.operation.clone();
                self.redo_stack.push(entry);
                HistoryStep::Ready(op)
            }
            None => HistoryStep::Empty,
        }
    }

    pub fn redo(&mut self, requester: ActorId) -> HistoryStep {
        if requester != self.owner {
            return HistoryStep::Refused(RefusalReason::NotOwner { requester });
        }
        match self.redo_stack.pop() {
            Some(entry) => {
                let op = entry.operation.clone();
                self.undo_stack.push_back(entry);
                HistoryStep::Ready(op)
            }
            None => HistoryStep::Empty,
        }
    }

    pub fn peek_undo(&self) -> Option<&Operation> {
        self.undo_stack.back().map(|e| &e.operation)
    }

    pub fn peek_redo(&self) -> Option<&Operation> {
        self.redo_stack.last().map(|e| &e.operation)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.back().map(|e| e.description.as_str())
    }

    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.last().map(|e| e.description.as_str())
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Drop the entry for `id` from both stacks. Returns false if it was not
    /// recorded.
    pub fn forget(&mut self, id: OperationId) -> bool {
        let before = self.undo_stack.len() + self.redo_stack.len();
        self.undo_stack.retain(|e| e.operation.id != id);
        self.redo_stack.retain(|e| e.operation.id != id);
        let forgotten = self.undo_stack.len() + self.redo_stack.len() < before;
        if forgotten {
            debug!(op = %id, "history entry dropped");
        }
        forgotten
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Check whether `op` can still be reverted or re-applied against the
    /// current shapes.
    ///
    /// Undo needs every shape the operation wrote to still exist; redo needs
    /// every shape it read from. Either is refused if another actor was the
    /// last to modify one of those shapes.
    pub fn check_step(
        &self,
        op: &Operation,
        shapes: &ShapeSet,
        direction: StepDirection,
    ) -> Option<RefusalReason> {
        let required = match direction {
            StepDirection::Undo => &op.after,
            StepDirection::Redo => &op.before,
        };

        for shape in required.keys() {
            let Some(current) = shapes.get(*shape) else {
                return Some(RefusalReason::TargetMissing { shape: *shape });
            };
            if let Some(modified_by) = current.last_modified_by {
                if modified_by != self.owner {
                    return Some(RefusalReason::StaleOperation {
                        shape: *shape,
                        modified_by,
                    });
                }
            }
        }
        None
    }
}
