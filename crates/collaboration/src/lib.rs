//! Concurrency and consistency engine for collaborative canvas editing.
//!
//! Local edits are applied optimistically, coalesced per shape and written
//! through a rate limiter; remote snapshots are diffed and resolved against
//! pending local work with last-write-wins conflict detection. Each actor gets
//! its own undo/redo history.
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use canvas::{
    layers, ActorId, CanvasError, LayerMove, Point, Shape, ShapeId, ShapePatch, ShapeSet, Size,
};

mod operations;
pub use operations::*;

mod conflict;
pub use conflict::*;

mod rate_limit;
pub use rate_limit::*;

mod batch;
pub use batch::*;

mod optimistic;
pub use optimistic::*;

mod history;
pub use history::*;

mod store;
pub use store::*;

mod memory;
pub use memory::*;

mod config;
pub use config::*;

mod engine;
pub use engine::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("store error: {0}")]
    StoreError(String),

    #[error("write failed after {attempts} attempts: {message}")]
    WriteFailed { attempts: u32, message: String },

    #[error("operation already pending: {0}")]
    DuplicateOperation(OperationId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// A user taking part in the canvas session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
}

impl Actor {
    pub fn new(id: ActorId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}
