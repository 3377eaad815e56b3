//! Shared canvas model: shapes, partial shape patches and layer ordering.
use thiserror::Error;

mod shape;
pub use shape::*;
pub mod layers;
pub use layers::LayerMove;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("shape already exists: {0}")]
    ShapeExists(ShapeId),
    #[error("shape not found: {0}")]
    ShapeNotFound(ShapeId),
    #[error("patch for {0} is missing required field `{1}`")]
    IncompletePatch(ShapeId, &'static str),
}
