//! Layer (z-order) management with fractional order keys.
//!
//! A single-step move only ever computes one new key for the moved shape; the
//! rest of the canvas keeps its keys. Repeated midpoint inserts between the
//! same neighbours eat into `f64` precision, so callers should run
//! [`normalize`] from time to time (see [`needs_normalize`]).
use serde::{Deserialize, Serialize};

use crate::{ShapeId, ShapeSet};

/// Gap below which neighbouring keys are considered worn out.
pub const MIN_KEY_GAP: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerMove {
    ToFront,
    ToBack,
    Forward,
    Backward,
}

/// New order key for `id` after applying `movement`, or `None` for a no-op.
pub fn reorder_key(shapes: &ShapeSet, id: ShapeId, movement: LayerMove) -> Option<f64> {
    match movement {
        LayerMove::ToFront => bring_to_front(shapes, id),
        LayerMove::ToBack => send_to_back(shapes, id),
        LayerMove::Forward => bring_forward(shapes, id),
        LayerMove::Backward => send_backward(shapes, id),
    }
}

/// Key above every other shape, or `None` when `id` is already topmost.
pub fn bring_to_front(shapes: &ShapeSet, id: ShapeId) -> Option<f64> {
    let order = shapes.layered();
    order.iter().find(|s| s.id == id)?;
    let top = order.last()?;
    (top.id != id).then(|| top.order_key + 1.0)
}

/// Key below every other shape, or `None` when `id` is already at the back.
pub fn send_to_back(shapes: &ShapeSet, id: ShapeId) -> Option<f64> {
    let order = shapes.layered();
    order.iter().find(|s| s.id == id)?;
    let bottom = order.first()?;
    (bottom.id != id).then(|| bottom.order_key - 1.0)
}

/// Step `id` one layer up, past its immediate upper neighbour.
///
/// This is not the midpoint between `id` and the neighbour: that key would
/// still sort below the neighbour and leave the stacking unchanged. The key
/// lands halfway between the neighbour and the shape above it, or one above
/// the neighbour when the neighbour is topmost. Returns `None` when `id` is
/// already at the top.
pub fn bring_forward(shapes: &ShapeSet, id: ShapeId) -> Option<f64> {
    let order = shapes.layered();
    let idx = order.iter().position(|s| s.id == id)?;
    let neighbour = order.get(idx + 1)?;
    let key = match order.get(idx + 2) {
        Some(beyond) => midpoint(neighbour.order_key, beyond.order_key),
        None => neighbour.order_key + 1.0,
    };
    Some(key)
}

/// Step `id` one layer down, past its immediate lower neighbour.
///
/// Mirrors [`bring_forward`]: the key lands halfway between the neighbour and
/// the shape below it, or one below the neighbour when the neighbour is
/// bottommost, never between `id` and the neighbour.
pub fn send_backward(shapes: &ShapeSet, id: ShapeId) -> Option<f64> {
    let order = shapes.layered();
    let idx = order.iter().position(|s| s.id == id)?;
    if idx == 0 {
        return None;
    }
    let neighbour = order[idx - 1];
    let key = if idx >= 2 {
        midpoint(order[idx - 2].order_key, neighbour.order_key)
    } else {
        neighbour.order_key - 1.0
    };
    Some(key)
}

/// 1-based layer of `id` counted from the back, and the number of layers.
pub fn position(shapes: &ShapeSet, id: ShapeId) -> Option<(usize, usize)> {
    let order = shapes.layered();
    let idx = order.iter().position(|s| s.id == id)?;
    Some((idx + 1, order.len()))
}

/// Consecutive integer keys in the current back-to-front order.
pub fn normalize(shapes: &ShapeSet) -> Vec<(ShapeId, f64)> {
    shapes
        .layered()
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id, i as f64))
        .collect()
}

/// True when two adjacent layers are closer than [`MIN_KEY_GAP`].
pub fn needs_normalize(shapes: &ShapeSet) -> bool {
    let order = shapes.layered();
    order
        .windows(2)
        .any(|pair| pair[1].order_key - pair[0].order_key < MIN_KEY_GAP)
}

fn midpoint(a: f64, b: f64) -> f64 {
    a + (b - a) / 2.0
}
