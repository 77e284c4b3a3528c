//! Bounded Ring Buffer with Overflow Policies
//!
//! Fixed-capacity circular queue shared by any number of producers and
//! consumers. Storage, cursors and counters live behind a single mutex so an
//! overflow decision and the statistics describing it are always taken in the
//! same critical section.
//!
//! ## Overflow Policies
//!
//! - **Block**: producer waits for space (optionally bounded by `block_timeout`)
//! - **DropOldest**: evict the oldest undelivered item, then enqueue
//! - **DropNewest**: discard the incoming item, buffer unchanged, no error
//! - **Reject**: fail immediately with `BackpressureActive`
//!
//! Waiting consumers and blocked producers are parked on `tokio::sync::Notify`,
//! never on polling sleeps.

use crate::{Result, TransportError};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What happens when an item is pushed into a full buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a consumer to make room
    Block,
    /// Evict the oldest buffered item
    DropOldest,
    /// Silently discard the incoming item
    DropNewest,
    /// Fail with `BackpressureActive`
    Reject,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "Block"),
            OverflowPolicy::DropOldest => write!(f, "DropOldest"),
            OverflowPolicy::DropNewest => write!(f, "DropNewest"),
            OverflowPolicy::Reject => write!(f, "Reject"),
        }
    }
}

/// Configuration for a ring buffer
#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Maximum number of buffered items (values below 1 are raised to 1)
    pub capacity: usize,
    /// Policy applied when pushing into a full buffer
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on how long a `Block` push waits; `None` waits until space or close
    pub block_timeout: Option<Duration>,
    /// Occupancy fraction counted as a high-water hit
    pub high_water_mark: f64,
    /// Occupancy fraction that re-arms the high-water counter
    pub low_water_mark: f64,
    /// Whether counters are recorded
    pub track_metrics: bool,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            block_timeout: None,
            high_water_mark: 0.8,
            low_water_mark: 0.2,
            track_metrics: true,
        }
    }
}

impl RingBufferConfig {
    pub fn new(capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow_policy,
            ..Default::default()
        }
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = Some(timeout);
        self
    }

    pub fn with_water_marks(mut self, high: f64, low: f64) -> Self {
        self.high_water_mark = high;
        self.low_water_mark = low;
        self
    }
}

/// Point-in-time view of a ring buffer, taken under its lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RingBufferStats {
    /// Items accepted into the buffer
    pub pushed: u64,
    /// Items handed to consumers
    pub popped: u64,
    /// Items discarded by DropOldest/DropNewest
    pub dropped: u64,
    /// Pushes refused by the Reject policy
    pub rejected: u64,
    /// Pushes that had to wait for space
    pub blocked: u64,
    /// Blocked pushes that gave up at the block timeout
    pub block_timeouts: u64,
    /// Upward crossings of the high-water mark
    pub high_water_hits: u64,
    /// Largest size observed
    pub peak_size: usize,
    /// Size at snapshot time
    pub size: usize,
    /// Fixed capacity
    pub capacity: usize,
    /// When the last item was dropped, rejected or timed out
    pub last_drop_at: Option<SystemTime>,
}

impl RingBufferStats {
    /// Every push that did not end up delivering its own item
    pub fn total_lost(&self) -> u64 {
        self.dropped + self.rejected + self.block_timeouts
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.size as f64 / self.capacity as f64
        }
    }
}

/// Storage and cursors, only touched under the buffer mutex
struct Slots<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    len: usize,
    closed: bool,
    above_high_water: bool,
    stats: RingBufferStats,
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
            closed: false,
            above_high_water: false,
            stats: RingBufferStats {
                capacity,
                ..Default::default()
            },
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn push_back(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        item
    }

    fn clear(&mut self) -> usize {
        let cleared = self.len;
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
        cleared
    }

    fn record_loss(&mut self) {
        self.stats.last_drop_at = Some(SystemTime::now());
    }
}

/// Result of a single non-blocking offer
enum Offer<T> {
    Done(Result<()>),
    /// Block policy and no room; the item is handed back to the caller
    Full(T),
}

/// Which attempt of a blocking push an offer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
    /// Deadline passed; a full buffer now counts as a block timeout
    Last,
}

/// Outcome of a cancellable push that keeps the item when cancelled
#[derive(Debug)]
pub enum PushOutcome<T> {
    /// The overflow policy ran to completion
    Done(Result<()>),
    /// Cancelled while waiting for space; the item was never enqueued
    Cancelled(T),
}

impl<T> PushOutcome<T> {
    /// Collapse into a plain result, discarding a reclaimed item
    pub fn into_result(self) -> Result<()> {
        match self {
            PushOutcome::Done(result) => result,
            PushOutcome::Cancelled(_) => Err(TransportError::Cancelled),
        }
    }
}

/// Fixed-capacity concurrent circular buffer
pub struct RingBuffer<T> {
    config: RingBufferConfig,
    high_threshold: usize,
    low_threshold: usize,
    state: Mutex<Slots<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("size", &state.len)
            .field("policy", &self.config.overflow_policy)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer
    pub fn new(mut config: RingBufferConfig) -> Self {
        if config.capacity == 0 {
            tracing::warn!("Ring buffer capacity 0 requested, using 1");
            config.capacity = 1;
        }
        let capacity = config.capacity;
        let high_threshold = ((capacity as f64) * config.high_water_mark.clamp(0.0, 1.0))
            .ceil()
            .max(1.0) as usize;
        let low_threshold =
            ((capacity as f64) * config.low_water_mark.clamp(0.0, 1.0)).floor() as usize;

        Self {
            config,
            high_threshold,
            low_threshold: low_threshold.min(high_threshold.saturating_sub(1)),
            state: Mutex::new(Slots::with_capacity(capacity)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Create a buffer with the given capacity and policy, default everything else
    pub fn with_capacity(capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self::new(RingBufferConfig::new(capacity, overflow_policy))
    }

    pub fn config(&self) -> &RingBufferConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn size(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().len == 0
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> RingBufferStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.size = state.len;
        stats
    }

    /// Apply the overflow policy once, without waiting
    fn offer(&self, item: T, attempt: Attempt) -> Offer<T> {
        let track = self.config.track_metrics;
        let mut state = self.state.lock();

        if state.closed {
            return Offer::Done(Err(TransportError::BufferClosed));
        }

        if state.is_full() {
            match self.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    // Evict and enqueue in the same critical section
                    drop(state.pop_front());
                    if track {
                        state.stats.dropped += 1;
                        state.record_loss();
                    }
                }
                OverflowPolicy::DropNewest => {
                    if track {
                        state.stats.dropped += 1;
                        state.record_loss();
                    }
                    return Offer::Done(Ok(()));
                }
                OverflowPolicy::Reject => {
                    if track {
                        state.stats.rejected += 1;
                        state.record_loss();
                    }
                    return Offer::Done(Err(TransportError::BackpressureActive));
                }
                OverflowPolicy::Block => {
                    if track {
                        match attempt {
                            Attempt::First => state.stats.blocked += 1,
                            Attempt::Retry => {}
                            Attempt::Last => {
                                state.stats.block_timeouts += 1;
                                state.record_loss();
                            }
                        }
                    }
                    return Offer::Full(item);
                }
            }
        }

        state.push_back(item);
        if track {
            state.stats.pushed += 1;
            if state.len > state.stats.peak_size {
                state.stats.peak_size = state.len;
            }
            if !state.above_high_water && state.len >= self.high_threshold {
                state.above_high_water = true;
                state.stats.high_water_hits += 1;
            }
        }
        drop(state);

        self.not_empty.notify_waiters();
        Offer::Done(Ok(()))
    }

    /// Push without waiting. A full `Block` buffer yields `BufferFull`.
    pub fn try_push(&self, item: T) -> Result<()> {
        match self.offer(item, Attempt::Retry) {
            Offer::Done(result) => result,
            Offer::Full(_) => Err(TransportError::BufferFull),
        }
    }

    /// Push, waiting for space under the `Block` policy
    pub async fn push(&self, item: T) -> Result<()> {
        self.push_inner(item, None).await.into_result()
    }

    /// Push, waiting for space under the `Block` policy until cancelled
    pub async fn push_with_cancel(&self, item: T, token: &CancellationToken) -> Result<()> {
        self.push_inner(item, Some(token)).await.into_result()
    }

    /// Like [`push_with_cancel`](Self::push_with_cancel), but a cancelled push
    /// returns the item so the caller can retry it elsewhere
    pub async fn push_or_reclaim(&self, item: T, token: &CancellationToken) -> PushOutcome<T> {
        self.push_inner(item, Some(token)).await
    }

    async fn push_inner(&self, mut item: T, token: Option<&CancellationToken>) -> PushOutcome<T> {
        let deadline = self
            .config
            .block_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut attempt = Attempt::First;

        loop {
            // Register interest before checking so a pop in between is not missed
            let notified = self.not_full.notified();

            match self.offer(item, attempt) {
                Offer::Done(result) => return PushOutcome::Done(result),
                Offer::Full(returned) if attempt == Attempt::Last => {
                    drop(returned);
                    let timeout = self.config.block_timeout.unwrap_or_default();
                    tracing::debug!("Ring buffer push timed out after {:?}", timeout);
                    return PushOutcome::Done(Err(TransportError::backpressure_timeout(timeout)));
                }
                Offer::Full(returned) => item = returned,
            }

            let wait = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
                    None => {
                        notified.await;
                        true
                    }
                }
            };

            let woke = match token {
                Some(token) => tokio::select! {
                    woke = wait => woke,
                    _ = token.cancelled() => return PushOutcome::Cancelled(item),
                },
                None => wait.await,
            };

            // Deadline hit; one last attempt before giving up
            attempt = if woke { Attempt::Retry } else { Attempt::Last };
        }
    }

    /// Count an item lost outside the buffer's own overflow handling
    pub fn record_dropped(&self) {
        if !self.config.track_metrics {
            return;
        }
        let mut state = self.state.lock();
        state.stats.dropped += 1;
        state.record_loss();
    }

    /// Pop without waiting
    pub fn pop(&self) -> Result<T> {
        let mut state = self.state.lock();
        match state.pop_front() {
            Some(item) => {
                if self.config.track_metrics {
                    state.stats.popped += 1;
                }
                if state.above_high_water && state.len <= self.low_threshold {
                    state.above_high_water = false;
                }
                drop(state);
                self.not_full.notify_waiters();
                Ok(item)
            }
            None if state.closed => Err(TransportError::BufferClosed),
            None => Err(TransportError::BufferEmpty),
        }
    }

    /// Pop, waiting until an item arrives or the buffer is closed.
    ///
    /// Dropping the returned future never loses an item.
    pub async fn pop_wait(&self) -> Result<T> {
        loop {
            let notified = self.not_empty.notified();
            match self.pop() {
                Err(TransportError::BufferEmpty) => notified.await,
                other => return other,
            }
        }
    }

    /// Pop, waiting until an item arrives, the buffer is closed or `token` fires
    pub async fn pop_with_cancel(&self, token: &CancellationToken) -> Result<T> {
        tokio::select! {
            result = self.pop_wait() => result,
            _ = token.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// Pop, waiting at most `timeout`
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.pop_wait()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout("ring buffer pop", timeout)),
        }
    }

    /// Remove everything currently buffered
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut items = Vec::with_capacity(state.len);
        while let Some(item) = state.pop_front() {
            items.push(item);
        }
        if self.config.track_metrics {
            state.stats.popped += items.len() as u64;
        }
        state.above_high_water = false;
        drop(state);
        self.not_full.notify_waiters();
        items
    }

    /// Evict up to `count` of the oldest items, recording them as drops
    pub fn shed_oldest(&self, count: usize) -> usize {
        let shed = {
            let mut state = self.state.lock();
            let mut shed = 0;
            while shed < count && state.pop_front().is_some() {
                shed += 1;
            }
            if shed > 0 && self.config.track_metrics {
                state.stats.dropped += shed as u64;
                state.record_loss();
            }
            if state.above_high_water && state.len <= self.low_threshold {
                state.above_high_water = false;
            }
            shed
        };
        if shed > 0 {
            self.not_full.notify_waiters();
        }
        shed
    }

    /// Discard everything currently buffered, returning how many items were removed
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut state = self.state.lock();
            state.above_high_water = false;
            state.clear()
        };
        self.not_full.notify_waiters();
        cleared
    }

    /// Close the buffer. Pending and future pops drain what is left and then
    /// fail with `BufferClosed`; pushes fail immediately. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

/// Cloneable receiving handle over a shared ring buffer.
///
/// Every clone competes for the same items; each item is delivered to exactly
/// one receiver.
pub struct EventReceiver<T> {
    buffer: Arc<RingBuffer<T>>,
}

impl<T> Clone for EventReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<T> Debug for EventReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReceiver")
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<T> EventReceiver<T> {
    pub fn new(buffer: Arc<RingBuffer<T>>) -> Self {
        Self { buffer }
    }

    /// Wait for the next item; `None` once the buffer is closed and drained
    pub async fn recv(&self) -> Option<T> {
        self.buffer.pop_wait().await.ok()
    }

    pub fn try_recv(&self) -> Result<T> {
        self.buffer.pop()
    }

    pub async fn recv_with_cancel(&self, token: &CancellationToken) -> Result<T> {
        self.buffer.pop_with_cancel(token).await
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        self.buffer.pop_timeout(timeout).await
    }

    pub fn len(&self) -> usize {
        self.buffer.size()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }
}
