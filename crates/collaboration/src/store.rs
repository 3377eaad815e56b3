//! Seams to the outside world: the shared shape store, the wall clock and the
//! user notification surface.
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{ConflictKind, Result, Shape, ShapeId, ShapePatch, ShapeSet};

/// Receives the full shape collection every time the store changes
pub type SnapshotCallback = Arc<dyn Fn(ShapeSet) + Send + Sync>;

/// Handle for a snapshot subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Authoritative shape storage shared by every client.
///
/// Snapshots always carry the whole collection; there are no deltas.
#[async_trait]
pub trait Store: Send + Sync {
    fn subscribe(&self, on_snapshot: SnapshotCallback) -> Subscription;

    /// Apply a partial update to an existing shape
    async fn write(&self, id: ShapeId, patch: ShapePatch) -> Result<()>;

    async fn create(&self, shape: Shape) -> Result<ShapeId>;

    async fn delete(&self, id: ShapeId) -> Result<()>;
}

/// Source of operation timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) -> i64 {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A conflict worth telling the user about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub conflict_kind: ConflictKind,
    /// Display name of the other actor
    pub actor_name: String,
    pub severity: u8,
    pub message: String,
    pub shape_ids: Vec<ShapeId>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        if notification.severity >= 4 {
            warn!(
                kind = %notification.conflict_kind,
                actor = %notification.actor_name,
                "{}",
                notification.message
            );
        } else {
            info!(
                kind = %notification.conflict_kind,
                actor = %notification.actor_name,
                "{}",
                notification.message
            );
        }
    }
}

/// Forwards notifications to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // receiver gone: nobody is listening any more
        let _ = self.tx.send(notification);
    }
}
