//! Per-key write limiting: debounce, throttle, a rolling one-second cap and a
//! bounded FIFO queue with retries.
//!
//! The limiter owns every timer, queue and timestamp for a key; nothing else
//! writes to the store for that key while an entry exists.
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, warn};

use crate::{Coalesce, RateLimitConfig, Result};

/// Asynchronous write performed once a payload clears the limiter
pub type WriteFn<P> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Called when a write is dropped after exhausting its retries
pub type FailureHook<K, P> = Arc<dyn Fn(WriteFailure<K, P>) + Send + Sync>;

const WINDOW: Duration = Duration::from_secs(1);

/// Box an async closure into a [`WriteFn`].
pub fn write_fn<P, F, Fut>(f: F) -> WriteFn<P>
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

#[derive(Debug, Clone)]
pub struct WriteFailure<K, P> {
    pub key: K,
    pub payload: P,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

struct QueuedWrite<P> {
    payload: P,
    write: WriteFn<P>,
    attempts: u32,
}

struct KeyState<P> {
    /// Dispatch times inside the rolling window
    window: VecDeque<Instant>,
    queue: VecDeque<QueuedWrite<P>>,
    debounced: Option<QueuedWrite<P>>,
    debounce_timer: Option<JoinHandle<()>>,
    debounce_generation: u64,
    drain_timer: Option<JoinHandle<()>>,
    last_write: Option<Instant>,
    in_flight: bool,
    retry_at: Option<Instant>,
    evict_timer: Option<JoinHandle<()>>,
}

impl<P> KeyState<P> {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            queue: VecDeque::new(),
            debounced: None,
            debounce_timer: None,
            debounce_generation: 0,
            drain_timer: None,
            last_write: None,
            in_flight: false,
            retry_at: None,
            evict_timer: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn saturated(&mut self, now: Instant, max: usize) -> bool {
        self.prune(now);
        self.window.len() >= max
    }

    /// Earliest instant the next queued write may be dispatched.
    fn next_slot(&mut self, now: Instant, config: &RateLimitConfig) -> Instant {
        let mut at = now;
        if let Some(last) = self.last_write {
            at = at.max(last + config.throttle());
        }
        let max = config.max_updates_per_second;
        if self.saturated(now, max) {
            let freeing = self.window[self.window.len() - max];
            at = at.max(freeing + WINDOW);
        }
        if let Some(retry_at) = self.retry_at {
            at = at.max(retry_at);
        }
        at
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.debounce_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.drain_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.evict_timer.take() {
            timer.abort();
        }
    }

    /// No dispatch inside the window or the throttle gap still limits this key.
    fn expired(&mut self, now: Instant, throttle: Duration) -> bool {
        self.prune(now);
        self.window.is_empty()
            && self
                .last_write
                .map_or(true, |last| now.duration_since(last) >= throttle)
    }

    fn take_all(&mut self) -> Vec<QueuedWrite<P>> {
        self.cancel_timers();
        let mut items: Vec<_> = self.debounced.take().into_iter().collect();
        items.extend(self.queue.drain(..));
        items
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.debounced.is_none() && !self.in_flight
    }
}

struct Inner<K, P> {
    config: RateLimitConfig,
    keys: Mutex<HashMap<K, KeyState<P>>>,
    on_failure: Mutex<Option<FailureHook<K, P>>>,
}

/// Debounce/throttle/queue limiter keyed by `K` (usually a shape id).
///
/// Timers run as Tokio tasks, so the limiter must be used inside a runtime.
pub struct RateLimiter<K, P> {
    inner: Arc<Inner<K, P>>,
}

impl<K, P> Clone for RateLimiter<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, P> RateLimiter<K, P>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    P: Coalesce + Clone + Send + 'static,
{
    /// Zero limits are raised to one.
    pub fn new(mut config: RateLimitConfig) -> Self {
        if config.max_updates_per_second == 0 || config.max_queue_depth == 0 {
            warn!(
                max_updates_per_second = config.max_updates_per_second,
                max_queue_depth = config.max_queue_depth,
                "zero rate limit raised to 1"
            );
            config.max_updates_per_second = config.max_updates_per_second.max(1);
            config.max_queue_depth = config.max_queue_depth.max(1);
        }
        Self {
            inner: Arc::new(Inner {
                config,
                keys: Mutex::new(HashMap::new()),
                on_failure: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Register the hook that receives writes dropped after all retries.
    pub fn on_failure(&self, hook: impl Fn(WriteFailure<K, P>) + Send + Sync + 'static) {
        *self.inner.on_failure.lock() = Some(Arc::new(hook));
    }

    /// Submit a payload for `key`; `write` runs once the limiter lets it out.
    pub fn enqueue(&self, key: K, payload: P, write: WriteFn<P>) {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut keys = self.inner.keys.lock();
        let state = keys.entry(key.clone()).or_insert_with(KeyState::new);
        let item = QueuedWrite {
            payload,
            write,
            attempts: 0,
        };

        let must_queue = state.in_flight
            || !state.queue.is_empty()
            || state.saturated(now, config.max_updates_per_second);
        if must_queue {
            // An older debounced payload goes first to keep per-key order
            if let Some(older) = state.debounced.take() {
                if let Some(timer) = state.debounce_timer.take() {
                    timer.abort();
                }
                self.push_queue(&key, state, older);
            }
            self.push_queue(&key, state, item);
            self.schedule_drain(&key, state, now);
            return;
        }

        if let Some(timer) = state.debounce_timer.take() {
            timer.abort();
        }
        // a superseded payload is folded into the newer one
        let item = match state.debounced.take() {
            Some(mut older) => {
                older.payload.coalesce(item.payload);
                QueuedWrite {
                    payload: older.payload,
                    write: item.write,
                    attempts: 0,
                }
            }
            None => item,
        };
        state.debounced = Some(item);
        state.debounce_generation += 1;
        let generation = state.debounce_generation;
        let limiter = self.clone();
        let delay = config.debounce();
        state.debounce_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            limiter.fire_debounced(key, generation);
        }));
    }

    /// Drain everything pending for `key` right now through `write`,
    /// bypassing every limit.
    pub async fn flush(&self, key: &K, write: WriteFn<P>) -> FlushReport {
        let items = match self.inner.keys.lock().get_mut(key) {
            Some(state) => {
                let items = state.take_all();
                self.schedule_eviction(key, state);
                items
            }
            None => Vec::new(),
        };
        let mut report = FlushReport::default();
        for item in items {
            self.flush_item(key, item.payload, &write, &mut report).await;
        }
        report
    }

    /// Drain every key with the write functions stored alongside each payload.
    pub async fn flush_all(&self) -> FlushReport {
        let drained: Vec<(K, Vec<QueuedWrite<P>>)> = {
            let mut keys = self.inner.keys.lock();
            keys.iter_mut()
                .map(|(key, state)| (key.clone(), state.take_all()))
                .filter(|(_, items)| !items.is_empty())
                .collect()
        };
        let mut report = FlushReport::default();
        for (key, items) in drained {
            for item in items {
                self.flush_item(&key, item.payload, &item.write, &mut report)
                    .await;
            }
        }
        report
    }

    /// Cancel every timer and drop all queued work. Writes already handed to
    /// the store still complete. Returns the number of dropped payloads.
    pub fn cancel_all(&self) -> usize {
        let mut keys = self.inner.keys.lock();
        let dropped = keys
            .values_mut()
            .map(|state| state.take_all().len())
            .sum();
        keys.clear();
        if dropped > 0 {
            warn!(dropped, "rate limiter cancelled with pending writes");
        }
        dropped
    }

    /// Drop everything queued or debounced for `key`. A write already handed
    /// to the store still completes.
    pub fn cancel(&self, key: &K) -> usize {
        let dropped = match self.inner.keys.lock().get_mut(key) {
            Some(state) => {
                let dropped = state.take_all().len();
                self.schedule_eviction(key, state);
                dropped
            }
            None => 0,
        };
        if dropped > 0 {
            debug!(key = %key, dropped, "pending writes cancelled");
        }
        dropped
    }

    /// Queued payloads for `key`, excluding one waiting on its debounce timer.
    pub fn queue_depth(&self, key: &K) -> usize {
        self.inner
            .keys
            .lock()
            .get(key)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    /// Keys with limiter state. Idle keys are forgotten once their window
    /// and throttle gap have passed.
    pub fn tracked_keys(&self) -> usize {
        self.inner.keys.lock().len()
    }

    /// True when no key has queued, debounced or in-flight writes.
    pub fn is_idle(&self) -> bool {
        self.inner.keys.lock().values().all(|s| s.is_idle())
    }

    fn push_queue(&self, key: &K, state: &mut KeyState<P>, item: QueuedWrite<P>) {
        if state.queue.len() >= self.inner.config.max_queue_depth {
            state.queue.pop_front();
            warn!(
                key = %key,
                depth = self.inner.config.max_queue_depth,
                "write queue full, dropped oldest update"
            );
        }
        state.queue.push_back(item);
    }

    fn schedule_drain(&self, key: &K, state: &mut KeyState<P>, now: Instant) {
        if state.in_flight || state.queue.is_empty() || state.drain_timer.is_some() {
            return;
        }
        let at = state.next_slot(now, &self.inner.config);
        let limiter = self.clone();
        let key = key.clone();
        state.drain_timer = Some(tokio::spawn(async move {
            time::sleep_until(at).await;
            limiter.drain_one(key);
        }));
    }

    fn schedule_eviction(&self, key: &K, state: &mut KeyState<P>) {
        if !state.is_idle() {
            return;
        }
        if let Some(timer) = state.evict_timer.take() {
            timer.abort();
        }
        let limiter = self.clone();
        let key = key.clone();
        let delay = WINDOW.max(self.inner.config.throttle());
        state.evict_timer = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            limiter.evict_if_idle(key);
        }));
    }

    fn evict_if_idle(&self, key: K) {
        let now = Instant::now();
        let throttle = self.inner.config.throttle();
        let mut keys = self.inner.keys.lock();
        let Some(state) = keys.get_mut(&key) else {
            return;
        };
        state.evict_timer = None;
        if state.is_idle() && state.expired(now, throttle) {
            keys.remove(&key);
            debug!(key = %key, "idle key forgotten");
        }
    }

    fn fire_debounced(&self, key: K, generation: u64) {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut keys = self.inner.keys.lock();
        let Some(state) = keys.get_mut(&key) else {
            return;
        };
        if state.debounce_generation != generation {
            return;
        }
        state.debounce_timer = None;
        let Some(item) = state.debounced.take() else {
            return;
        };

        let throttled = state
            .last_write
            .map(|last| now.duration_since(last) < config.throttle())
            .unwrap_or(false);
        if throttled
            || state.in_flight
            || !state.queue.is_empty()
            || state.saturated(now, config.max_updates_per_second)
        {
            debug!(key = %key, "debounced write deferred to queue");
            self.push_queue(&key, state, item);
            self.schedule_drain(&key, state, now);
            return;
        }
        self.start_write(&key, state, item, now);
    }

    fn drain_one(&self, key: K) {
        let now = Instant::now();
        let mut keys = self.inner.keys.lock();
        let Some(state) = keys.get_mut(&key) else {
            return;
        };
        state.drain_timer = None;
        if state.in_flight || state.queue.is_empty() {
            return;
        }
        if state.next_slot(now, &self.inner.config) > now {
            self.schedule_drain(&key, state, now);
            return;
        }
        state.retry_at = None;
        if let Some(item) = state.queue.pop_front() {
            self.start_write(&key, state, item, now);
        }
    }

    fn start_write(&self, key: &K, state: &mut KeyState<P>, item: QueuedWrite<P>, now: Instant) {
        state.window.push_back(now);
        state.last_write = Some(now);
        state.in_flight = true;

        let limiter = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let result = (item.write)(item.payload.clone()).await;
            limiter.finish_write(key, item, result);
        });
    }

    fn finish_write(&self, key: K, mut item: QueuedWrite<P>, result: Result<()>) {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut dropped = None;
        {
            let mut keys = self.inner.keys.lock();
            // Cancelled while the write was in flight
            let Some(state) = keys.get_mut(&key) else {
                return;
            };
            state.in_flight = false;

            if let Err(e) = result {
                item.attempts += 1;
                if item.attempts <= config.max_retries {
                    warn!(
                        key = %key,
                        attempt = item.attempts,
                        error = %e,
                        "write failed, retrying"
                    );
                    state.retry_at = Some(now + config.retry_backoff());
                    state.queue.push_front(item);
                } else {
                    error!(
                        key = %key,
                        attempts = item.attempts,
                        error = %e,
                        "write failed, giving up"
                    );
                    dropped = Some(WriteFailure {
                        key: key.clone(),
                        payload: item.payload,
                        attempts: item.attempts,
                        message: e.to_string(),
                    });
                }
            }
            self.schedule_drain(&key, state, now);
            self.schedule_eviction(&key, state);
        }

        if let Some(failure) = dropped {
            self.report_failure(failure);
        }
    }

    async fn flush_item(&self, key: &K, payload: P, write: &WriteFn<P>, report: &mut FlushReport) {
        match write(payload.clone()).await {
            Ok(()) => report.written += 1,
            Err(e) => {
                error!(key = %key, error = %e, "flush write failed");
                report.failed += 1;
                self.report_failure(WriteFailure {
                    key: key.clone(),
                    payload,
                    attempts: 1,
                    message: e.to_string(),
                });
            }
        }
    }

    fn report_failure(&self, failure: WriteFailure<K, P>) {
        let hook = self.inner.on_failure.lock().clone();
        if let Some(hook) = hook {
            hook(failure);
        }
    }
}
