//! Conflict resolution orchestrator.
//!
//! `CollabEngine` is the one place local edits and remote snapshots meet:
//!
//! - local operations are applied optimistically, recorded in the actor's
//!   history and written to the store through the batcher and rate limiter
//! - remote snapshots are diffed against the previous snapshot, checked
//!   against pending local work and resolved last-write-wins
//! - undo/redo replay operations through the same path
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::{
    layers, write_fn, Actor, ActorId, Batcher, CanvasError, Clock, Coalesce, CollaborationError,
    ConflictDetector, ConflictKind, ConflictRecord, EngineConfig, FailedOperation, FlushReport,
    HistoryManager, HistoryStep, LayerMove, LogNotifier, Notification, Notifier, Operation,
    OperationId, OperationKind, OptimisticManager, Point, RateLimiter, RefusalReason, Resolution,
    Result, Shape, ShapeId, ShapePatch, ShapeSet, Size, StepDirection, Store, Subscription,
    SystemClock, WriteFailure, WriteFn,
};

/// Author of remote changes the store does not attribute (deletes)
pub const UNKNOWN_ACTOR: ActorId = ActorId(uuid::Uuid::nil());

const CONFLICT_LOG_LEN: usize = 100;

/// How an operation enters the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// A fresh user edit: recorded and coalesced
    Normal,
    ReplayForUndo,
    ReplayForRedo,
    /// Multi-shape maintenance edit: recorded, written per shape right away
    Bulk,
}

impl ApplyMode {
    pub fn records_history(&self) -> bool {
        matches!(self, ApplyMode::Normal | ApplyMode::Bulk)
    }

    pub fn coalesces(&self) -> bool {
        matches!(self, ApplyMode::Normal)
    }
}

/// What the store is asked to do for one shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ShapeWrite {
    Patch(ShapePatch),
    Create(Shape),
    Delete,
}

/// A pending store write plus the operations it acknowledges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundWrite {
    pub shape: ShapeId,
    pub write: ShapeWrite,
    pub ops: Vec<OperationId>,
}

impl Coalesce for OutboundWrite {
    fn coalesce(&mut self, newer: Self) {
        let older = std::mem::replace(&mut self.write, ShapeWrite::Delete);
        self.write = match (older, newer.write) {
            (ShapeWrite::Patch(mut patch), ShapeWrite::Patch(next)) => {
                patch.merge(next);
                ShapeWrite::Patch(patch)
            }
            (ShapeWrite::Create(mut shape), ShapeWrite::Patch(next)) => {
                shape.apply_patch(&next);
                ShapeWrite::Create(shape)
            }
            (ShapeWrite::Delete, ShapeWrite::Patch(_)) => ShapeWrite::Delete,
            (_, replacement) => replacement,
        };
        for op in newer.ops {
            if !self.ops.contains(&op) {
                self.ops.push(op);
            }
        }
    }
}

struct EngineInner {
    actor: Actor,
    config: EngineConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    detector: ConflictDetector,
    optimistic: OptimisticManager,
    limiter: RateLimiter<ShapeId, OutboundWrite>,
    batcher: Batcher<ShapeId, OutboundWrite>,
    writer: WriteFn<OutboundWrite>,
    /// Serializes local applies, undo/redo and snapshot handling
    serial: Mutex<()>,
    shapes: Mutex<ShapeSet>,
    last_snapshot: Mutex<Option<ShapeSet>>,
    history: Mutex<HistoryManager>,
    /// Unacknowledged shape writes per operation
    outstanding: Mutex<HashMap<OperationId, usize>>,
    /// Undo/redo replays still in flight, mapped to the recorded operation
    replayed: Mutex<HashMap<OperationId, OperationId>>,
    roster: Mutex<HashMap<ActorId, String>>,
    conflict_log: Mutex<VecDeque<ConflictRecord>>,
    subscription: Mutex<Option<Subscription>>,
}

pub struct EngineBuilder {
    actor: Actor,
    store: Arc<dyn Store>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<CollabEngine> {
        self.config.validate()?;
        let EngineBuilder {
            actor,
            store,
            config,
            clock,
            notifier,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let writer = store_writer(weak.clone(), store.clone());

            let limiter: RateLimiter<ShapeId, OutboundWrite> =
                RateLimiter::new(config.rate_limit.clone());
            let on_failure = weak.clone();
            limiter.on_failure(move |failure| {
                if let Some(engine) = CollabEngine::upgrade(&on_failure) {
                    engine.write_failed(failure);
                }
            });

            let sink = weak.clone();
            let batcher = Batcher::new(&config.batch, move |shape: ShapeId, outbound: OutboundWrite| {
                if let Some(engine) = CollabEngine::upgrade(&sink) {
                    let inner = &engine.inner;
                    inner.limiter.enqueue(shape, outbound, inner.writer.clone());
                }
            });

            let mut roster = HashMap::new();
            roster.insert(actor.id, actor.name.clone());

            EngineInner {
                history: Mutex::new(HistoryManager::new(actor.id, &config.history)),
                optimistic: OptimisticManager::new(config.optimistic.clone()),
                detector: ConflictDetector::new(config.conflict.clone()),
                actor,
                config,
                store,
                clock,
                notifier,
                limiter,
                batcher,
                writer,
                serial: Mutex::new(()),
                shapes: Mutex::new(ShapeSet::new()),
                last_snapshot: Mutex::new(None),
                outstanding: Mutex::new(HashMap::new()),
                replayed: Mutex::new(HashMap::new()),
                roster: Mutex::new(roster),
                conflict_log: Mutex::new(VecDeque::new()),
                subscription: Mutex::new(None),
            }
        });

        Ok(CollabEngine { inner })
    }
}

fn store_writer(engine: Weak<EngineInner>, store: Arc<dyn Store>) -> WriteFn<OutboundWrite> {
    write_fn(move |outbound: OutboundWrite| {
        let store = store.clone();
        let engine = engine.clone();
        async move {
            match outbound.write {
                ShapeWrite::Patch(patch) => store.write(outbound.shape, patch).await?,
                ShapeWrite::Create(shape) => {
                    store.create(shape).await?;
                }
                ShapeWrite::Delete => store.delete(outbound.shape).await?,
            }
            if let Some(engine) = CollabEngine::upgrade(&engine) {
                engine.acknowledge(&outbound.ops);
            }
            Ok::<(), CollaborationError>(())
        }
    })
}

/// Stamp every resulting state with the replaying actor.
fn stamped(mut op: Operation, actor: ActorId, at: i64) -> Operation {
    for patch in op.after.values_mut() {
        patch.last_modified_by = Some(actor);
        patch.last_modified_at = Some(at);
    }
    op
}

fn infer_kind(diff: &ShapePatch) -> OperationKind {
    if diff.position.is_some() {
        OperationKind::Move
    } else if diff.size.is_some() {
        OperationKind::Resize
    } else if diff.rotation.is_some() {
        OperationKind::Rotate
    } else if diff.order_key.is_some() {
        OperationKind::Reorder
    } else {
        OperationKind::Update
    }
}

/// Operations explaining how `previous` became `current`.
fn remote_changes(previous: &ShapeSet, current: &ShapeSet, now: i64) -> Vec<Operation> {
    let mut ops = Vec::new();
    for shape in current.iter() {
        let actor = shape.last_modified_by.unwrap_or(UNKNOWN_ACTOR);
        let at = if shape.last_modified_at > 0 {
            shape.last_modified_at
        } else {
            now
        };
        match previous.get(shape.id) {
            None => ops.push(Operation::create(actor, at, shape)),
            Some(old) => {
                let diff = ShapePatch::diff(old, shape);
                if !diff.is_empty() {
                    ops.push(Operation::edit(infer_kind(&diff), actor, at, old, diff));
                }
            }
        }
    }
    for old in previous.iter() {
        if !current.contains(old.id) {
            ops.push(Operation::delete(UNKNOWN_ACTOR, now, old));
        }
    }
    ops
}

/// Move shapes from the `from` states of `op` to its `to` states. Nothing is
/// changed if any shape that has to be rebuilt cannot be.
fn transition(
    shapes: &mut ShapeSet,
    op: &Operation,
    from: &BTreeMap<ShapeId, ShapePatch>,
    to: &BTreeMap<ShapeId, ShapePatch>,
) -> Result<()> {
    let mut rebuilt = Vec::new();
    for &target in &op.target_ids {
        if let Some(state) = to.get(&target) {
            if !shapes.contains(target) {
                let shape = Shape::from_patch(target, state)
                    .map_err(|_| CanvasError::ShapeNotFound(target))?;
                rebuilt.push(shape);
            }
        }
    }

    for &target in &op.target_ids {
        match (from.get(&target), to.get(&target)) {
            (_, Some(state)) => {
                if let Some(shape) = shapes.get_mut(target) {
                    shape.apply_patch(state);
                }
            }
            (Some(_), None) => {
                shapes.remove(target);
            }
            (None, None) => {}
        }
    }
    for shape in rebuilt {
        shapes.upsert(shape);
    }
    Ok(())
}

/// Collaborative editing engine for one actor.
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct CollabEngine {
    inner: Arc<EngineInner>,
}

impl CollabEngine {
    /// Engine with the system clock and log notifications.
    pub fn builder(actor: Actor, store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            actor,
            store,
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(LogNotifier),
        }
    }

    fn upgrade(weak: &Weak<EngineInner>) -> Option<CollabEngine> {
        weak.upgrade().map(|inner| CollabEngine { inner })
    }

    pub fn actor(&self) -> &Actor {
        &self.inner.actor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn actor_id(&self) -> ActorId {
        self.inner.actor.id
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    /// Subscribe to store snapshots. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.subscription.lock().is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.store.subscribe(Arc::new(move |snapshot: ShapeSet| {
            if let Some(engine) = CollabEngine::upgrade(&weak) {
                engine.handle_snapshot(snapshot);
            }
        }));
        *self.inner.subscription.lock() = Some(subscription);
        info!(actor = %self.inner.actor.name, "collaboration engine started");
    }

    /// Write out everything pending, stop all timers and unsubscribe.
    /// Nothing is rolled back.
    pub async fn shutdown(&self) -> FlushReport {
        let batches = self.inner.batcher.flush_all();
        let report = self.inner.limiter.flush_all().await;
        let abandoned = self.inner.optimistic.shutdown();
        self.inner.outstanding.lock().clear();
        self.inner.replayed.lock().clear();

        let subscription = self.inner.subscription.lock().take();
        drop(subscription);

        info!(
            batches,
            written = report.written,
            failed = report.failed,
            abandoned,
            "collaboration engine shut down"
        );
        report
    }

    pub fn register_actor(&self, id: ActorId, name: impl Into<String>) {
        self.inner.roster.lock().insert(id, name.into());
    }

    pub fn actor_name(&self, id: ActorId) -> String {
        self.inner
            .roster
            .lock()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| "Another user".to_string())
    }

    pub fn shape(&self, id: ShapeId) -> Option<Shape> {
        self.inner.shapes.lock().get(id).cloned()
    }

    /// Local view of the canvas, pending edits included
    pub fn shapes(&self) -> ShapeSet {
        self.inner.shapes.lock().clone()
    }

    pub fn is_pending(&self, op: OperationId) -> bool {
        self.inner.optimistic.is_pending(op)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.optimistic.pending_count()
    }

    /// Conflicts found in recent snapshots, oldest first
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflict_log.lock().iter().cloned().collect()
    }

    pub fn failed_ops(&self) -> Vec<FailedOperation> {
        self.inner.optimistic.failed_ops()
    }

    pub fn clear_failed(&self) {
        self.inner.optimistic.clear_failed();
    }

    /// True when no write is batched, queued or in flight
    pub fn is_idle(&self) -> bool {
        self.inner.batcher.is_empty() && self.inner.limiter.is_idle()
    }

    /// Apply an operation by this engine's actor.
    pub fn apply(&self, op: Operation, mode: ApplyMode) -> Result<OperationId> {
        let _serial = self.inner.serial.lock();
        self.apply_serialized(op, mode)
    }

    fn apply_serialized(&self, op: Operation, mode: ApplyMode) -> Result<OperationId> {
        if op.target_ids.is_empty() {
            return Err(CollaborationError::InvalidOp(format!(
                "operation {} has no targets",
                op.id
            )));
        }
        if op.actor != self.actor_id() {
            return Err(CollaborationError::InvalidOp(format!(
                "operation {} belongs to actor {}",
                op.id, op.actor
            )));
        }

        let id = self.inner.optimistic.apply(op.clone(), |op| {
            let mut shapes = self.inner.shapes.lock();
            transition(&mut shapes, op, &op.before, &op.after)
        })?;

        let writes = self.outbound_writes(&op);
        if writes.is_empty() {
            self.inner.optimistic.confirm(id);
        } else {
            self.inner.outstanding.lock().insert(id, writes.len());
            let coalesce = mode.coalesces() && self.inner.config.rate_limit.batch;
            for outbound in writes {
                if coalesce {
                    self.inner.batcher.add(outbound.shape, outbound);
                } else {
                    // an open batch for the shape has to go out first
                    self.inner.batcher.flush(&outbound.shape);
                    self.inner
                        .limiter
                        .enqueue(outbound.shape, outbound, self.inner.writer.clone());
                }
            }
        }

        if mode.records_history() {
            self.inner.history.lock().push(op.clone());
        }
        debug!(op = %id, kind = ?op.kind, ?mode, "operation applied");
        Ok(id)
    }

    fn outbound_writes(&self, op: &Operation) -> Vec<OutboundWrite> {
        let shapes = self.inner.shapes.lock();
        op.target_ids
            .iter()
            .filter_map(|&shape| {
                let write = match (op.before_of(shape), op.after_of(shape)) {
                    (None, Some(_)) => ShapeWrite::Create(shapes.get(shape)?.clone()),
                    (Some(_), Some(after)) => ShapeWrite::Patch(after.clone()),
                    (Some(_), None) => ShapeWrite::Delete,
                    (None, None) => return None,
                };
                Some(OutboundWrite {
                    shape,
                    write,
                    ops: vec![op.id],
                })
            })
            .collect()
    }

    fn acknowledge(&self, ops: &[OperationId]) {
        let mut confirmed = Vec::new();
        {
            let mut outstanding = self.inner.outstanding.lock();
            for op in ops {
                let done = match outstanding.get_mut(op) {
                    Some(remaining) => {
                        *remaining = remaining.saturating_sub(1);
                        *remaining == 0
                    }
                    None => false,
                };
                if done {
                    outstanding.remove(op);
                    confirmed.push(*op);
                }
            }
        }
        if confirmed.is_empty() {
            return;
        }
        for op in confirmed {
            self.inner.optimistic.confirm(op);
            self.inner.replayed.lock().remove(&op);
        }

        // shapes with nothing left in flight take the store's state
        let _serial = self.inner.serial.lock();
        let snapshot = self.inner.last_snapshot.lock().clone();
        if let Some(snapshot) = snapshot {
            self.reconcile(&snapshot);
        }
    }

    fn write_failed(&self, failure: WriteFailure<ShapeId, OutboundWrite>) {
        for op in &failure.payload.ops {
            self.inner.outstanding.lock().remove(op);
            self.inner.optimistic.mark_failed(
                *op,
                CollaborationError::WriteFailed {
                    attempts: failure.attempts,
                    message: failure.message.clone(),
                }
                .to_string(),
            );
        }
    }

    fn local_shape(&self, id: ShapeId) -> Result<Shape> {
        self.shape(id)
            .ok_or_else(|| CanvasError::ShapeNotFound(id).into())
    }

    fn editable_shape(&self, id: ShapeId) -> Result<Shape> {
        let shape = self.local_shape(id)?;
        if shape.is_locked_by_other(self.actor_id()) {
            return Err(CollaborationError::InvalidOp(format!(
                "shape {} is locked by another user",
                id
            )));
        }
        Ok(shape)
    }

    fn top_key(&self) -> f64 {
        self.inner
            .shapes
            .lock()
            .layered()
            .last()
            .map(|s| s.order_key + 1.0)
            .unwrap_or(0.0)
    }

    fn edit(&self, kind: OperationKind, id: ShapeId, patch: ShapePatch) -> Result<OperationId> {
        let _serial = self.inner.serial.lock();
        self.edit_serialized(kind, id, patch)
    }

    fn edit_serialized(
        &self,
        kind: OperationKind,
        id: ShapeId,
        patch: ShapePatch,
    ) -> Result<OperationId> {
        let shape = self.editable_shape(id)?;
        let now = self.now();
        let op = Operation::edit(
            kind,
            self.actor_id(),
            now,
            &shape,
            patch.stamped(self.actor_id(), now),
        );
        self.apply_serialized(op, ApplyMode::Normal)
    }

    /// Add a new shape on top of the stack.
    pub fn create_shape(&self, mut shape: Shape) -> Result<OperationId> {
        let _serial = self.inner.serial.lock();
        if self.inner.shapes.lock().contains(shape.id) {
            return Err(CanvasError::ShapeExists(shape.id).into());
        }
        let now = self.now();
        shape.order_key = self.top_key();
        shape.version = 0;
        shape.last_modified_by = Some(self.actor_id());
        shape.last_modified_at = now;

        let op = Operation::create(self.actor_id(), now, &shape);
        self.apply_serialized(op, ApplyMode::Normal)
    }

    pub fn move_shape(&self, id: ShapeId, to: Point) -> Result<OperationId> {
        self.edit(
            OperationKind::Move,
            id,
            ShapePatch::default().with_position(to),
        )
    }

    pub fn resize_shape(&self, id: ShapeId, size: Size) -> Result<OperationId> {
        self.edit(
            OperationKind::Resize,
            id,
            ShapePatch::default().with_size(size),
        )
    }

    pub fn rotate_shape(&self, id: ShapeId, degrees: f64) -> Result<OperationId> {
        self.edit(
            OperationKind::Rotate,
            id,
            ShapePatch::default().with_rotation(degrees),
        )
    }

    /// Change any other properties (fill, opacity, lock, metadata).
    pub fn update_shape(&self, id: ShapeId, patch: ShapePatch) -> Result<OperationId> {
        if patch.is_empty() {
            return Err(CollaborationError::InvalidOp(format!(
                "empty update for shape {}",
                id
            )));
        }
        self.edit(OperationKind::Update, id, patch)
    }

    pub fn delete_shape(&self, id: ShapeId) -> Result<OperationId> {
        let _serial = self.inner.serial.lock();
        let shape = self.editable_shape(id)?;
        let op = Operation::delete(self.actor_id(), self.now(), &shape);
        self.apply_serialized(op, ApplyMode::Normal)
    }

    /// Copy a shape, offset by `(dx, dy)`, onto the top of the stack.
    /// Returns the operation and the id of the copy.
    pub fn duplicate_shape(&self, id: ShapeId, dx: f64, dy: f64) -> Result<(OperationId, ShapeId)> {
        let _serial = self.inner.serial.lock();
        let original = self.local_shape(id)?;
        let now = self.now();

        let mut copy = original.clone();
        copy.id = ShapeId::new();
        copy.position = original.position.offset(dx, dy);
        copy.order_key = self.top_key();
        copy.lock_owner = None;
        copy.version = 0;
        copy.last_modified_by = Some(self.actor_id());
        copy.last_modified_at = now;

        let op = Operation::duplicate(self.actor_id(), now, original.id, &copy);
        let op_id = self.apply_serialized(op, ApplyMode::Normal)?;
        Ok((op_id, copy.id))
    }

    /// Change a shape's layer. `None` when it is already at the limit.
    pub fn reorder(&self, id: ShapeId, movement: LayerMove) -> Result<Option<OperationId>> {
        let _serial = self.inner.serial.lock();
        let key = {
            let shapes = self.inner.shapes.lock();
            if !shapes.contains(id) {
                return Err(CanvasError::ShapeNotFound(id).into());
            }
            layers::reorder_key(&shapes, id, movement)
        };
        match key {
            Some(key) => self
                .edit_serialized(
                    OperationKind::Reorder,
                    id,
                    ShapePatch::default().with_order_key(key),
                )
                .map(Some),
            None => Ok(None),
        }
    }

    /// Respace every order key to whole numbers, keeping the stacking.
    pub fn normalize_layers(&self) -> Result<Option<OperationId>> {
        let _serial = self.inner.serial.lock();
        let now = self.now();
        let actor = self.actor_id();

        let op = {
            let shapes = self.inner.shapes.lock();
            let mut op = Operation::new(OperationKind::Reorder, actor, now);
            for (id, key) in layers::normalize(&shapes) {
                let Some(shape) = shapes.get(id) else {
                    continue;
                };
                if shape.order_key == key {
                    continue;
                }
                let patch = ShapePatch::default().with_order_key(key);
                let before = patch.capture(shape);
                op = op.with_change(id, before, patch.stamped(actor, now));
            }
            op
        };

        if op.target_ids.is_empty() {
            return Ok(None);
        }
        info!(shapes = op.target_ids.len(), "normalizing layer keys");
        self.apply_serialized(op, ApplyMode::Bulk).map(Some)
    }

    /// Revert the requester's last operation. The returned step carries the
    /// operation that was applied.
    pub fn undo(&self, requester: ActorId) -> Result<HistoryStep> {
        self.step(requester, StepDirection::Undo)
    }

    pub fn redo(&self, requester: ActorId) -> Result<HistoryStep> {
        self.step(requester, StepDirection::Redo)
    }

    fn step(&self, requester: ActorId, direction: StepDirection) -> Result<HistoryStep> {
        let _serial = self.inner.serial.lock();
        let recorded = {
            let history = self.inner.history.lock();
            if requester != history.owner() {
                return Ok(HistoryStep::Refused(RefusalReason::NotOwner { requester }));
            }
            let top = match direction {
                StepDirection::Undo => history.peek_undo(),
                StepDirection::Redo => history.peek_redo(),
            };
            let Some(op) = top.cloned() else {
                return Ok(HistoryStep::Empty);
            };
            let shapes = self.inner.shapes.lock();
            if let Some(reason) = history.check_step(&op, &shapes, direction) {
                info!(op = %op.id, ?direction, ?reason, "history step refused");
                return Ok(HistoryStep::Refused(reason));
            }
            op
        };

        let now = self.now();
        let actor = self.actor_id();
        let (replay, mode) = match direction {
            StepDirection::Undo => (recorded.invert(actor, now), ApplyMode::ReplayForUndo),
            StepDirection::Redo => (recorded.replay(actor, now), ApplyMode::ReplayForRedo),
        };
        let replay = stamped(replay, actor, now);
        let applied = self.apply_serialized(replay.clone(), mode)?;
        if self.inner.optimistic.is_pending(applied) {
            self.inner.replayed.lock().insert(applied, recorded.id);
        }

        let mut history = self.inner.history.lock();
        match direction {
            StepDirection::Undo => history.undo(requester),
            StepDirection::Redo => history.redo(requester),
        };
        Ok(HistoryStep::Ready(replay))
    }

    pub fn can_undo(&self) -> bool {
        self.inner.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.history.lock().can_redo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.inner.history.lock().undo_description().map(str::to_string)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.inner.history.lock().redo_description().map(str::to_string)
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    /// Reconcile a full store snapshot with local state.
    ///
    /// Returns the conflicts found between remote changes and pending local
    /// operations. Shapes without pending local work take the remote state.
    pub fn handle_snapshot(&self, snapshot: ShapeSet) -> Vec<ConflictRecord> {
        let mut notifications = Vec::new();
        let records = {
            let _serial = self.inner.serial.lock();
            let previous = self.inner.last_snapshot.lock().replace(snapshot.clone());

            let mut records = Vec::new();
            if let Some(previous) = previous {
                for remote in remote_changes(&previous, &snapshot, self.now()) {
                    if let Some((record, notification)) = self.resolve(&remote) {
                        records.push(record);
                        notifications.extend(notification);
                    }
                }
            }
            self.reconcile(&snapshot);
            records
        };

        if !records.is_empty() {
            let mut log = self.inner.conflict_log.lock();
            log.extend(records.iter().cloned());
            while log.len() > CONFLICT_LOG_LEN {
                log.pop_front();
            }
        }

        for notification in notifications {
            self.inner.notifier.notify(notification);
        }
        records
    }

    fn resolve(&self, remote: &Operation) -> Option<(ConflictRecord, Option<Notification>)> {
        let shape = *remote.target_ids.first()?;
        let pending = self.inner.optimistic.pending_for(shape);
        let local = pending.last()?;

        // both sides removed it
        if remote.kind == OperationKind::Delete
            && pending.iter().any(|op| op.kind == OperationKind::Delete)
        {
            return None;
        }

        let record = self.inner.detector.detect(local, remote);
        let kind = record.kind?;
        info!(
            shape = %shape,
            kind = %kind,
            resolution = ?record.resolution,
            remote_actor = %remote.actor,
            "conflict detected"
        );

        if record.resolution == Resolution::RemoteWins && kind != ConflictKind::CreateCollision {
            self.roll_back_from(shape, kind);
        }

        let notification = ConflictDetector::should_notify(&record)
            .then(|| self.notification(&record, kind, local, remote, shape));
        Some((record, notification))
    }

    /// Roll back every pending operation on `seed` and, transitively, on the
    /// other shapes those operations touched. Their unsent writes are dropped.
    fn roll_back_from(&self, seed: ShapeId, kind: ConflictKind) {
        let reason = format!("lost {} conflict", kind);
        let mut work = vec![seed];
        let mut seen = HashSet::new();

        while let Some(shape) = work.pop() {
            if !seen.insert(shape) {
                continue;
            }
            self.inner.batcher.discard(&shape);
            self.inner.limiter.cancel(&shape);

            let mut ops = self.inner.optimistic.pending_for(shape);
            ops.reverse();
            for op in ops {
                let reverted = self.inner.optimistic.rollback(
                    op.id,
                    |op| {
                        let mut shapes = self.inner.shapes.lock();
                        if let Err(e) = transition(&mut shapes, op, &op.after, &op.before) {
                            warn!(op = %op.id, error = %e, "could not revert operation");
                        }
                    },
                    reason.as_str(),
                );
                if reverted.is_ok() {
                    self.inner.outstanding.lock().remove(&op.id);
                    // a lost operation never took effect; it cannot be undone
                    let recorded = self.inner.replayed.lock().remove(&op.id).unwrap_or(op.id);
                    self.inner.history.lock().forget(recorded);
                    work.extend(op.target_ids.iter().copied());
                }
            }
        }
    }

    /// Adopt the snapshot for every shape with no pending local work.
    fn reconcile(&self, snapshot: &ShapeSet) {
        let pending = self.inner.optimistic.pending_targets();
        let mut shapes = self.inner.shapes.lock();

        let removed: Vec<ShapeId> = shapes
            .ids()
            .filter(|id| !snapshot.contains(*id) && !pending.contains(id))
            .collect();
        for id in removed {
            shapes.remove(id);
        }
        for remote in snapshot.iter() {
            if pending.contains(&remote.id) {
                continue;
            }
            if shapes.get(remote.id) != Some(remote) {
                shapes.upsert(remote.clone());
            }
        }
    }

    fn notification(
        &self,
        record: &ConflictRecord,
        kind: ConflictKind,
        local: &Operation,
        remote: &Operation,
        shape: ShapeId,
    ) -> Notification {
        let name = self.actor_name(remote.actor);
        let message = match kind {
            ConflictKind::DeleteWhileEditing if local.kind == OperationKind::Delete => {
                format!("{} was editing a shape you deleted", name)
            }
            ConflictKind::DeleteWhileEditing => format!("{} deleted a shape you were editing", name),
            ConflictKind::CreateCollision => format!("{} created a shape at the same time", name),
            ConflictKind::SimultaneousMove => {
                format!("{} moved this shape at the same time; their position was kept", name)
            }
            ConflictKind::RapidEditStorm => {
                format!("{} is editing this shape rapidly; their change was kept", name)
            }
            ConflictKind::SimultaneousTransform => {
                format!("{} transformed this shape at the same time; their change was kept", name)
            }
            ConflictKind::ConcurrentEdit => {
                format!("{} changed this shape at the same time; their change was kept", name)
            }
        };
        Notification {
            conflict_kind: kind,
            actor_name: name,
            severity: record.severity,
            message,
            shape_ids: vec![shape],
        }
    }
}
