//! Optimistic updates: local state changes immediately, the store confirms
//! later.
//!
//! Every applied operation stays pending until confirmed. An unconfirmed
//! operation re-arms its timeout a few times and is then recorded as failed
//! but left applied; the next snapshot reconciles it.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::{CollaborationError, Operation, OperationId, OptimisticConfig, Result, ShapeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No acknowledgement after every timeout re-arm; still applied locally
    Unconfirmed,

    /// The store rejected the write after all retries; still applied locally
    WriteFailed(String),

    /// Reverted locally by the caller
    RolledBack(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedOperation {
    pub operation: Operation,
    pub reason: FailureReason,
}

struct PendingWrite {
    operation: Operation,
    retry_count: u32,
    timer: Option<JoinHandle<()>>,
}

impl PendingWrite {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    config: OptimisticConfig,
    pending: Mutex<HashMap<OperationId, PendingWrite>>,
    failed: Mutex<Vec<FailedOperation>>,
}

/// Tracks operations applied locally but not yet acknowledged by the store.
#[derive(Clone)]
pub struct OptimisticManager {
    inner: Arc<Inner>,
}

impl OptimisticManager {
    pub fn new(config: OptimisticConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(HashMap::new()),
                failed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Apply `op` locally and start waiting for its confirmation.
    ///
    /// `apply_locally` runs synchronously before this returns. If it fails
    /// nothing is registered.
    pub fn apply<F>(&self, op: Operation, apply_locally: F) -> Result<OperationId>
    where
        F: FnOnce(&Operation) -> Result<()>,
    {
        let id = op.id;
        if self.inner.pending.lock().contains_key(&id) {
            return Err(CollaborationError::DuplicateOperation(id));
        }

        apply_locally(&op)?;

        let mut pending = self.inner.pending.lock();
        if pending.contains_key(&id) {
            return Err(CollaborationError::DuplicateOperation(id));
        }
        let timer = self.arm_timeout(id);
        pending.insert(
            id,
            PendingWrite {
                operation: op,
                retry_count: 0,
                timer: Some(timer),
            },
        );
        debug!(op = %id, "operation applied optimistically");
        Ok(id)
    }

    /// The store acknowledged `id`. Returns false when it was not pending.
    pub fn confirm(&self, id: OperationId) -> bool {
        if let Some(mut write) = self.inner.pending.lock().remove(&id) {
            write.cancel_timer();
            debug!(op = %id, retries = write.retry_count, "operation confirmed");
            return true;
        }

        let mut failed = self.inner.failed.lock();
        let before = failed.len();
        failed.retain(|f| !(f.operation.id == id && f.reason == FailureReason::Unconfirmed));
        if failed.len() < before {
            debug!(op = %id, "late confirmation cleared failure");
        }
        false
    }

    /// Revert a pending operation. `revert_locally` undoes the local change.
    pub fn rollback<F>(&self, id: OperationId, revert_locally: F, reason: impl Into<String>) -> Result<()>
    where
        F: FnOnce(&Operation),
    {
        let mut write = self
            .inner
            .pending
            .lock()
            .remove(&id)
            .ok_or(CollaborationError::OperationNotFound(id))?;
        write.cancel_timer();

        let reason = reason.into();
        revert_locally(&write.operation);
        warn!(op = %id, reason = %reason, "operation rolled back");

        self.inner.failed.lock().push(FailedOperation {
            operation: write.operation,
            reason: FailureReason::RolledBack(reason),
        });
        Ok(())
    }

    /// Record a write failure surfaced by the rate limiter. The operation
    /// stays applied locally.
    pub fn mark_failed(&self, id: OperationId, message: impl Into<String>) -> Option<Operation> {
        let mut write = self.inner.pending.lock().remove(&id)?;
        write.cancel_timer();

        let message = message.into();
        error!(op = %id, error = %message, "operation failed, left applied");
        self.inner.failed.lock().push(FailedOperation {
            operation: write.operation.clone(),
            reason: FailureReason::WriteFailed(message),
        });
        Some(write.operation)
    }

    pub fn is_pending(&self, id: OperationId) -> bool {
        self.inner.pending.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Pending operations touching `shape`, oldest first.
    pub fn pending_for(&self, shape: ShapeId) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .inner
            .pending
            .lock()
            .values()
            .filter(|w| w.operation.touches(shape))
            .map(|w| w.operation.clone())
            .collect();
        ops.sort_by_key(|op| op.issued_at);
        ops
    }

    /// Every shape touched by a pending operation.
    pub fn pending_targets(&self) -> HashSet<ShapeId> {
        self.inner
            .pending
            .lock()
            .values()
            .flat_map(|w| w.operation.target_ids.iter().copied())
            .collect()
    }

    pub fn failed_ops(&self) -> Vec<FailedOperation> {
        self.inner.failed.lock().clone()
    }

    pub fn clear_failed(&self) {
        self.inner.failed.lock().clear();
    }

    /// Cancel every timeout without rolling anything back.
    pub fn shutdown(&self) -> usize {
        let mut pending = self.inner.pending.lock();
        for write in pending.values_mut() {
            write.cancel_timer();
        }
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    fn arm_timeout(&self, id: OperationId) -> JoinHandle<()> {
        let manager = self.clone();
        let timeout = self.inner.config.timeout();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            manager.on_timeout(id);
        })
    }

    fn on_timeout(&self, id: OperationId) {
        let mut pending = self.inner.pending.lock();
        let Some(write) = pending.get_mut(&id) else {
            return;
        };

        if write.retry_count < self.inner.config.max_retries {
            write.retry_count += 1;
            warn!(op = %id, retry = write.retry_count, "operation unconfirmed, waiting again");
            write.timer = Some(self.arm_timeout(id));
            return;
        }

        if let Some(write) = pending.remove(&id) {
            drop(pending);
            warn!(op = %id, "operation never confirmed, left applied");
            self.inner.failed.lock().push(FailedOperation {
                operation: write.operation,
                reason: FailureReason::Unconfirmed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, OperationKind, Point, Shape, ShapePatch, Size};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn move_op(shape: &Shape) -> Operation {
        Operation::edit(
            OperationKind::Move,
            ActorId::new(),
            0,
            shape,
            ShapePatch::default().with_position(Point::new(5.0, 5.0)),
        )
    }

    fn shape() -> Shape {
        Shape::new(ShapeId::new(), Point::new(0.0, 0.0), Size::new(1.0, 1.0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_runs_locally_and_tracks() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        let s = shape();
        let applied = AtomicUsize::new(0);

        let id = manager
            .apply(move_op(&s), |_| {
                applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert!(manager.is_pending(id));
        assert_eq!(manager.pending_for(s.id).len(), 1);
        assert!(manager.pending_for(ShapeId::new()).is_empty());
        assert!(manager.pending_targets().contains(&s.id));

        assert!(manager.confirm(id));
        assert!(!manager.is_pending(id));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_unknown_is_noop() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        assert!(!manager.confirm(OperationId::new()));
        assert!(manager.failed_ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_failed_apply_are_rejected() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        let op = move_op(&shape());

        manager.apply(op.clone(), |_| Ok(())).unwrap();
        let err = manager.apply(op.clone(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, CollaborationError::DuplicateOperation(id) if id == op.id));

        let other = move_op(&shape());
        let result = manager.apply(other.clone(), |_| {
            Err(CollaborationError::InvalidOp("missing".to_string()))
        });
        assert!(result.is_err());
        assert!(!manager.is_pending(other.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rearms_then_fails_applied() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        let id = manager.apply(move_op(&shape()), |_| Ok(())).unwrap();

        // three re-arms of 5s each
        time::sleep(Duration::from_millis(19_000)).await;
        assert!(manager.is_pending(id));
        assert!(manager.failed_ops().is_empty());

        time::sleep(Duration::from_millis(2_000)).await;
        assert!(!manager.is_pending(id));
        let failed = manager.failed_ops();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::Unconfirmed);

        // a late acknowledgement clears the record
        assert!(!manager.confirm(id));
        assert!(manager.failed_ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_reverts_and_records() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        let s = shape();
        let id = manager.apply(move_op(&s), |_| Ok(())).unwrap();

        let mut reverted = None;
        manager
            .rollback(id, |op| reverted = Some(op.id), "lost conflict")
            .unwrap();

        assert_eq!(reverted, Some(id));
        assert!(!manager.is_pending(id));
        assert_eq!(
            manager.failed_ops()[0].reason,
            FailureReason::RolledBack("lost conflict".to_string())
        );
        assert!(matches!(
            manager.rollback(id, |_| {}, "again"),
            Err(CollaborationError::OperationNotFound(_))
        ));

        // no timer fires for a rolled back operation
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.failed_ops().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failed_and_shutdown() {
        let manager = OptimisticManager::new(OptimisticConfig::default());
        let a = manager.apply(move_op(&shape()), |_| Ok(())).unwrap();
        manager.apply(move_op(&shape()), |_| Ok(())).unwrap();

        assert!(manager.mark_failed(a, "store offline").is_some());
        assert!(manager.mark_failed(a, "store offline").is_none());
        assert!(matches!(
            manager.failed_ops()[0].reason,
            FailureReason::WriteFailed(_)
        ));

        assert_eq!(manager.shutdown(), 1);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.failed_ops().len(), 1);

        manager.clear_failed();
        assert!(manager.failed_ops().is_empty());
    }
}
