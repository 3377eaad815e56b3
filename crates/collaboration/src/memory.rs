//! In-process store shared by every client of a simulated session.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    CanvasError, CollaborationError, Result, Shape, ShapeId, ShapePatch, ShapeSet,
    SnapshotCallback, Store, Subscription,
};

#[derive(Debug, Default)]
struct FailureInjection {
    fail_next: usize,
    offline: bool,
}

#[derive(Default)]
struct Inner {
    shapes: Mutex<ShapeSet>,
    subscribers: Mutex<BTreeMap<u64, SnapshotCallback>>,
    next_subscriber: AtomicU64,
    failures: Mutex<FailureInjection>,
    accepted: AtomicUsize,
}

/// Reference [`Store`]: bumps versions on every accepted write and pushes
/// the full collection to all subscribers before the write returns. New
/// subscribers receive the current collection straight away.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `shapes`; nobody is notified.
    pub fn with_shapes(shapes: impl IntoIterator<Item = Shape>) -> Self {
        let store = Self::new();
        *store.inner.shapes.lock() = shapes.into_iter().collect();
        store
    }

    pub fn snapshot(&self) -> ShapeSet {
        self.inner.shapes.lock().clone()
    }

    pub fn get(&self, id: ShapeId) -> Option<Shape> {
        self.inner.shapes.lock().get(id).cloned()
    }

    /// Writes accepted so far
    pub fn write_count(&self) -> usize {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Make the next `count` store calls fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.failures.lock().fail_next = count;
    }

    /// Fail every call until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.failures.lock().offline = offline;
    }

    /// Push the current collection to every subscriber.
    pub fn broadcast(&self) {
        let snapshot = self.snapshot();
        let subscribers: Vec<SnapshotCallback> =
            self.inner.subscribers.lock().values().cloned().collect();
        for callback in subscribers {
            callback(snapshot.clone());
        }
    }

    fn check_available(&self, action: &str) -> Result<()> {
        let mut failures = self.inner.failures.lock();
        if failures.offline {
            return Err(CollaborationError::StoreError(format!("{}: store offline", action)));
        }
        if failures.fail_next > 0 {
            failures.fail_next -= 1;
            warn!(action, "injected store failure");
            return Err(CollaborationError::StoreError(format!("{}: injected failure", action)));
        }
        Ok(())
    }

    fn accepted(&self) {
        self.inner.accepted.fetch_add(1, Ordering::SeqCst);
        self.broadcast();
    }
}

#[async_trait]
impl Store for InMemoryStore {
    fn subscribe(&self, on_snapshot: SnapshotCallback) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().insert(id, on_snapshot.clone());
        debug!(subscriber = id, "store subscription added");
        on_snapshot(self.snapshot());

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.lock().remove(&id);
                debug!(subscriber = id, "store subscription removed");
            }
        })
    }

    async fn write(&self, id: ShapeId, patch: ShapePatch) -> Result<()> {
        self.check_available("write")?;
        {
            let mut shapes = self.inner.shapes.lock();
            let shape = shapes.get_mut(id).ok_or(CanvasError::ShapeNotFound(id))?;
            shape.apply_patch(&patch);
            shape.version += 1;
        }
        self.accepted();
        Ok(())
    }

    async fn create(&self, mut shape: Shape) -> Result<ShapeId> {
        self.check_available("create")?;
        let id = shape.id;
        shape.version += 1;
        self.inner.shapes.lock().insert(shape)?;
        self.accepted();
        Ok(id)
    }

    async fn delete(&self, id: ShapeId) -> Result<()> {
        self.check_available("delete")?;
        if self.inner.shapes.lock().remove(id).is_none() {
            // already gone; deletes are idempotent
            debug!(shape = %id, "delete of missing shape");
            return Ok(());
        }
        self.accepted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Point, Size};

    fn square() -> Shape {
        Shape::new(ShapeId::new(), Point::new(0.0, 0.0), Size::new(10.0, 10.0))
    }

    #[tokio::test]
    async fn test_writes_bump_version_and_fan_out() {
        let store = InMemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = store.subscribe(Arc::new(move |shapes: ShapeSet| {
            sink.lock().push(shapes.len());
        }));

        let shape = square();
        let id = store.create(shape.clone()).await.unwrap();
        store
            .write(id, ShapePatch::default().with_rotation(30.0))
            .await
            .unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.rotation, 30.0);
        assert_eq!(*seen.lock(), vec![0, 1, 1]);
        assert_eq!(store.write_count(), 2);

        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn test_write_to_missing_shape_fails() {
        let store = InMemoryStore::new();
        let err = store
            .write(ShapeId::new(), ShapePatch::default().with_opacity(0.3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollaborationError::Canvas(CanvasError::ShapeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let shape = square();
        let store = InMemoryStore::with_shapes(vec![shape.clone()]);
        let patch = ShapePatch::default().with_fill("#000000");

        store.fail_next(1);
        assert!(store.write(shape.id, patch.clone()).await.is_err());
        assert!(store.write(shape.id, patch.clone()).await.is_ok());

        store.set_offline(true);
        assert!(store.delete(shape.id).await.is_err());
        store.set_offline(false);
        assert!(store.delete(shape.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let store = InMemoryStore::new();
        let subscription = store.subscribe(Arc::new(|_: ShapeSet| {}));
        assert_eq!(store.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(store.subscriber_count(), 0);
    }
}
