//! Per-key write batching.
//!
//! Payloads for the same key arriving within the batch window are merged into
//! one; every addition restarts the window.
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::debug;

use crate::{BatchConfig, ShapePatch};

/// Payloads that can absorb a newer payload for the same key.
pub trait Coalesce {
    /// Merge `newer` into `self`; fields set in `newer` win.
    fn coalesce(&mut self, newer: Self);
}

impl Coalesce for ShapePatch {
    fn coalesce(&mut self, newer: Self) {
        self.merge(newer);
    }
}

/// Receives one merged payload per closed batch
pub type BatchSink<K, P> = Arc<dyn Fn(K, P) + Send + Sync>;

struct PendingBatch<P> {
    payload: P,
    count: usize,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Inner<K, P> {
    delay: Duration,
    sink: BatchSink<K, P>,
    pending: Mutex<HashMap<K, PendingBatch<P>>>,
    generations: AtomicU64,
}

pub struct Batcher<K, P> {
    inner: Arc<Inner<K, P>>,
}

impl<K, P> Clone for Batcher<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, P> Batcher<K, P>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    P: Coalesce + Send + 'static,
{
    pub fn new(config: &BatchConfig, sink: impl Fn(K, P) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay: config.delay(),
                sink: Arc::new(sink),
                pending: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Add a payload to the open batch for `key`, restarting its window.
    pub fn add(&self, key: K, payload: P) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut pending = self.inner.pending.lock();

        let batch = match pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let batch = entry.into_mut();
                batch.payload.coalesce(payload);
                batch.count += 1;
                batch.generation = generation;
                if let Some(timer) = batch.timer.take() {
                    timer.abort();
                }
                batch
            }
            Entry::Vacant(entry) => entry.insert(PendingBatch {
                payload,
                count: 1,
                generation,
                timer: None,
            }),
        };

        let batcher = self.clone();
        let delay = self.inner.delay;
        batch.timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            batcher.close(key, Some(generation));
        }));
    }

    /// Close the batch for `key` now. Returns false if nothing was pending.
    pub fn flush(&self, key: &K) -> bool {
        self.close(key.clone(), None)
    }

    /// Close every open batch, returning how many were handed to the sink.
    pub fn flush_all(&self) -> usize {
        let keys = self.pending_keys();
        keys.into_iter().filter(|key| self.flush(key)).count()
    }

    /// Throw away the open batch for `key` without writing it.
    pub fn discard(&self, key: &K) -> Option<P> {
        let mut batch = self.inner.pending.lock().remove(key)?;
        if let Some(timer) = batch.timer.take() {
            timer.abort();
        }
        debug!(key = %key, merged = batch.count, "batch discarded");
        Some(batch.payload)
    }

    pub fn pending_keys(&self) -> Vec<K> {
        self.inner.pending.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.lock().is_empty()
    }

    fn close(&self, key: K, generation: Option<u64>) -> bool {
        let batch = {
            let mut pending = self.inner.pending.lock();
            let current = pending.get(&key).map(|batch| batch.generation);
            match (current, generation) {
                (None, _) => None,
                // a newer addition restarted the window
                (Some(current), Some(fired)) if current != fired => None,
                _ => pending.remove(&key),
            }
        };
        let Some(mut batch) = batch else {
            return false;
        };
        if generation.is_none() {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
        }

        debug!(key = %key, merged = batch.count, "batch closed");
        (self.inner.sink)(key, batch.payload);
        true
    }
}
