// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rate-limited, deduplicating, delayable work queue.
//!
//! # Semantics
//!
//! - An item added while an identical item is already pending collapses into
//!   the pending entry.
//! - An item added while it is being processed (returned by [`WorkQueue::get`]
//!   and not yet [`WorkQueue::done`]) is remembered and re-queued when the
//!   current attempt calls `done`. An item is never handed to two workers at
//!   once.
//! - [`WorkQueue::add_after`] parks the item until its delay elapses; the
//!   queue promotes due items itself, workers never sleep on behalf of an item.
//! - [`WorkQueue::add_rate_limited`] asks the [`RateLimiter`] how long the
//!   item must wait. Successful processing should call [`WorkQueue::forget`]
//!   so the item's backoff history is cleared.
//! - [`WorkQueue::shutdown`] rejects further adds and wakes every blocked
//!   `get`, which then returns `None`.
//!
//! All time measurements use [`tokio::time::Instant`] so tests can run with a
//! paused clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Longest delay an item can be parked for. Longer delays are clamped.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Decides how long an item must wait before it is retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next attempt of `item`. Records the attempt.
    fn when(&self, item: &T) -> Duration;
    /// Clear any history for `item`.
    fn forget(&self, item: &T);
    /// How many times `item` has been rate limited since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialBackoff<T> {
    /// Create a backoff limiter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all items.
///
/// Each call to `when` reserves one token; if none is available the returned
/// delay is the time until the reservation is covered.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-state.tokens / self.qps).unwrap_or(MAX_DELAY)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters, waiting for the slowest one.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    /// Combine the given limiters.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Settings for [`controller_rate_limiter`].
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// First retry delay.
    pub base_delay: Duration,
    /// Upper bound for per-item backoff.
    pub max_delay: Duration,
    /// Overall retries per second.
    pub qps: f64,
    /// Overall burst size.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Per-item exponential backoff combined with an overall token bucket.
pub fn controller_rate_limiter<T>(config: &RateLimiterConfig) -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    let limiters: Vec<Box<dyn RateLimiter<T>>> = vec![
        Box::new(ItemExponentialBackoff::new(
            config.base_delay,
            config.max_delay,
        )),
        Box::new(TokenBucket::new(config.qps, config.burst)),
    ];
    MaxOf::new(limiters)
}

struct QueueState<T> {
    /// Items ready to be handed out, in order.
    queue: VecDeque<T>,
    /// Items that need processing (queued, or re-added while processing).
    dirty: HashSet<T>,
    /// Items currently held by a worker.
    processing: HashSet<T>,
    /// Delayed items and when they become ready.
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

impl<T: Eq + Hash + Clone> QueueState<T> {
    /// Returns true when the item became visible in `queue`.
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, T)> = self
            .waiting
            .iter()
            .filter(|(_, ready_at)| **ready_at <= now)
            .map(|(item, ready_at)| (*ready_at, item.clone()))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_by_key(|(ready_at, _)| *ready_at);
        for (_, item) in due {
            self.waiting.remove(&item);
            self.insert(item);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.values().min().copied()
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    /// Items ready to be processed.
    pub depth: usize,
    /// Items parked behind a delay.
    pub waiting: usize,
    /// Items currently being processed.
    pub processing: usize,
}

/// Rate-limited, deduplicating, delayable work queue.
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Create a queue using the given rate limiter.
    pub fn new(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    /// Create a queue with [`controller_rate_limiter`] defaults.
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Box::new(controller_rate_limiter(&RateLimiterConfig::default())),
        )
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make `item` available immediately.
    pub fn add(&self, item: T) {
        let visible = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert(item)
        };
        if visible {
            self.notify.notify_one();
        }
    }

    /// Make `item` available once `delay` has elapsed.
    ///
    /// If the item is already waiting, the earlier ready time wins. Delays
    /// beyond [`MAX_DELAY`] are clamped.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if delay > MAX_DELAY {
            warn!(queue = %self.name, item = ?item, delay = ?delay, "Delay too long, clamping");
        }
        let delay = delay.min(MAX_DELAY);
        let Some(ready_at) = Instant::now().checked_add(delay) else {
            warn!(queue = %self.name, item = ?item, "Delay out of clock range, adding now");
            self.add(item);
            return;
        };
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            trace!(queue = %self.name, item = ?item, delay_ms = delay.as_millis() as u64, "Item parked");
            state
                .waiting
                .entry(item)
                .and_modify(|existing| {
                    if ready_at < *existing {
                        *existing = ready_at;
                    }
                })
                .or_insert(ready_at);
        }
        // wake a getter so it re-arms its timer for the new deadline
        self.notify.notify_one();
    }

    /// Add `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clear the rate limiter's history for `item`.
    pub fn forget(&self, item: &T) {
        self.rate_limiter.forget(item);
    }

    /// Times `item` has been rate limited since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (item, more, deadline) = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                match state.queue.pop_front() {
                    Some(item) => {
                        state.dirty.remove(&item);
                        state.processing.insert(item.clone());
                        (Some(item), !state.queue.is_empty(), None)
                    }
                    None => (None, false, state.next_deadline()),
                }
            };

            if let Some(item) = item {
                if more {
                    // pass the wake-up on so other idle workers see the rest
                    self.notify.notify_one();
                }
                return Some(item);
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `item` as no longer being processed.
    ///
    /// If it was re-added meanwhile it becomes available again.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Whether `item` is queued, parked behind a delay, or re-added while
    /// being processed.
    pub fn is_pending(&self, item: &T) -> bool {
        let state = self.lock();
        state.dirty.contains(item) || state.waiting.contains_key(item)
    }

    /// Number of items ready to be processed.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True when no item is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of queue occupancy.
    pub fn metrics(&self) -> QueueMetrics {
        let state = self.lock();
        QueueMetrics {
            depth: state.queue.len(),
            waiting: state.waiting.len(),
            processing: state.processing.len(),
        }
    }

    /// Stop accepting items and release every blocked [`get`](Self::get).
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }
        debug!(queue = %self.name, "Work queue shutting down");
        self.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
