//! Backpressure Policy Layer
//!
//! Decides what happens to an inbound event when consumers lag producers.
//! The handler owns two ring buffers: the event channel, governed by the
//! configured [`BackpressureStrategy`], and an error channel that never blocks
//! and evicts its oldest entry on overflow.
//!
//! High/low water marks only feed the `high_water_mark_hits` counter. They never
//! change what the strategy does.

use crate::ring_buffer::{EventReceiver, OverflowPolicy, PushOutcome, RingBuffer, RingBufferConfig};
use crate::{Result, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BUFFER_SIZE: usize = 100;
const DEFAULT_HIGH_WATER_MARK: f64 = 0.8;
const DEFAULT_LOW_WATER_MARK: f64 = 0.2;
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Strategy applied when the event buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureStrategy {
    /// Fail immediately with `BackpressureActive`
    #[default]
    None,
    /// Evict the oldest undelivered event
    DropOldest,
    /// Discard the incoming event without reporting an error
    DropNewest,
    /// Wait up to `block_timeout` for space
    BlockWithTimeout,
}

impl BackpressureStrategy {
    pub fn overflow_policy(self) -> OverflowPolicy {
        match self {
            BackpressureStrategy::None => OverflowPolicy::Reject,
            BackpressureStrategy::DropOldest => OverflowPolicy::DropOldest,
            BackpressureStrategy::DropNewest => OverflowPolicy::DropNewest,
            BackpressureStrategy::BlockWithTimeout => OverflowPolicy::Block,
        }
    }
}

impl std::str::FromStr for BackpressureStrategy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "" | "none" => Ok(BackpressureStrategy::None),
            "dropoldest" => Ok(BackpressureStrategy::DropOldest),
            "dropnewest" => Ok(BackpressureStrategy::DropNewest),
            "blockwithtimeout" | "blocktimeout" | "block" => {
                Ok(BackpressureStrategy::BlockWithTimeout)
            }
            _ => Err(TransportError::invalid_config(format!(
                "unknown backpressure strategy '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressureStrategy::None => write!(f, "none"),
            BackpressureStrategy::DropOldest => write!(f, "drop_oldest"),
            BackpressureStrategy::DropNewest => write!(f, "drop_newest"),
            BackpressureStrategy::BlockWithTimeout => write!(f, "block_timeout"),
        }
    }
}

/// Configuration for backpressure handling
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    pub strategy: BackpressureStrategy,
    /// Capacity of the event and error buffers
    pub buffer_size: usize,
    /// Occupancy fraction counted as a high-water hit (metrics only)
    pub high_water_mark: f64,
    /// Occupancy fraction that re-arms the high-water counter (metrics only)
    pub low_water_mark: f64,
    /// How long `BlockWithTimeout` waits for space
    pub block_timeout: Duration,
    pub enable_metrics: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            strategy: BackpressureStrategy::None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            enable_metrics: true,
        }
    }
}

impl BackpressureConfig {
    pub fn new(strategy: BackpressureStrategy, buffer_size: usize) -> Self {
        Self {
            strategy,
            buffer_size,
            ..Default::default()
        }
    }

    /// Keep the freshest data under load
    pub fn lossy_latest(buffer_size: usize) -> Self {
        Self::new(BackpressureStrategy::DropOldest, buffer_size)
    }

    /// Never lose an event, slow the producer down instead
    pub fn lossless(buffer_size: usize, block_timeout: Duration) -> Self {
        Self {
            block_timeout,
            ..Self::new(BackpressureStrategy::BlockWithTimeout, buffer_size)
        }
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_water_marks(mut self, high: f64, low: f64) -> Self {
        self.high_water_mark = high;
        self.low_water_mark = low;
        self
    }

    /// Normalise out-of-range values instead of rejecting them
    pub fn sanitized(mut self) -> Self {
        if self.buffer_size == 0 {
            self.buffer_size = 1;
        }
        if !self.high_water_mark.is_finite()
            || self.high_water_mark > 1.0
            || self.high_water_mark < 0.0
        {
            self.high_water_mark = DEFAULT_HIGH_WATER_MARK;
        }
        if !self.low_water_mark.is_finite() || self.low_water_mark < 0.0 {
            self.low_water_mark = DEFAULT_LOW_WATER_MARK;
        }
        if self.low_water_mark > self.high_water_mark {
            self.high_water_mark = DEFAULT_HIGH_WATER_MARK;
            self.low_water_mark = DEFAULT_LOW_WATER_MARK;
        }
        self
    }

    fn event_buffer_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            capacity: self.buffer_size,
            overflow_policy: self.strategy.overflow_policy(),
            block_timeout: match self.strategy {
                BackpressureStrategy::BlockWithTimeout => Some(self.block_timeout),
                _ => None,
            },
            high_water_mark: self.high_water_mark,
            low_water_mark: self.low_water_mark,
            track_metrics: self.enable_metrics,
        }
    }

    fn error_buffer_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            capacity: self.buffer_size,
            overflow_policy: OverflowPolicy::DropOldest,
            block_timeout: None,
            high_water_mark: self.high_water_mark,
            low_water_mark: self.low_water_mark,
            track_metrics: self.enable_metrics,
        }
    }
}

/// Snapshot of backpressure statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackpressureMetrics {
    /// Events that never reached the buffer or were evicted from it
    pub events_dropped: u64,
    /// Sends that had to wait for space
    pub events_blocked: u64,
    pub high_water_mark_hits: u64,
    pub current_buffer_size: usize,
    pub max_buffer_size: usize,
    pub last_drop_time: Option<SystemTime>,
}

impl BackpressureMetrics {
    pub fn utilization(&self) -> f64 {
        if self.max_buffer_size == 0 {
            0.0
        } else {
            self.current_buffer_size as f64 / self.max_buffer_size as f64
        }
    }
}

/// Policy layer between an event source and its consumers
#[derive(Debug)]
pub struct BackpressureHandler<E> {
    config: BackpressureConfig,
    events: Arc<RingBuffer<E>>,
    errors: Arc<RingBuffer<TransportError>>,
    stopped: AtomicBool,
}

impl<E> BackpressureHandler<E> {
    pub fn new(config: BackpressureConfig) -> Self {
        let config = config.sanitized();
        debug!(
            "Creating backpressure handler: strategy={}, buffer_size={}",
            config.strategy, config.buffer_size
        );

        Self {
            events: Arc::new(RingBuffer::new(config.event_buffer_config())),
            errors: Arc::new(RingBuffer::new(config.error_buffer_config())),
            config,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Offer an event to the buffer according to the configured strategy.
    ///
    /// Drops under `DropOldest`/`DropNewest` return `Ok(())` and are only
    /// visible through [`metrics`](Self::metrics).
    pub async fn send_event(&self, event: E) -> Result<()> {
        if self.is_stopped() {
            return Err(TransportError::Closed);
        }
        self.events.push(event).await.map_err(Self::map_closed)
    }

    /// Same as [`send_event`](Self::send_event), abandoning a blocked send when `token` fires
    pub async fn send_event_with_cancel(&self, event: E, token: &CancellationToken) -> Result<()> {
        if self.is_stopped() {
            return Err(TransportError::Closed);
        }
        self.events
            .push_with_cancel(event, token)
            .await
            .map_err(Self::map_closed)
    }

    /// Cancellable send that hands the event back instead of losing it when
    /// `token` fires while waiting for space
    pub async fn send_event_or_reclaim(
        &self,
        event: E,
        token: &CancellationToken,
    ) -> PushOutcome<E> {
        if self.is_stopped() {
            return PushOutcome::Done(Err(TransportError::Closed));
        }
        match self.events.push_or_reclaim(event, token).await {
            PushOutcome::Done(result) => PushOutcome::Done(result.map_err(Self::map_closed)),
            cancelled => cancelled,
        }
    }

    /// Count an event abandoned before it could be buffered as a drop
    pub fn record_dropped(&self) {
        self.events.record_dropped();
    }

    /// Offer an event without ever waiting. A full `BlockWithTimeout` buffer yields `BufferFull`.
    pub fn try_send_event(&self, event: E) -> Result<()> {
        if self.is_stopped() {
            return Err(TransportError::Closed);
        }
        self.events.try_push(event).map_err(Self::map_closed)
    }

    /// Publish an error on the error channel, evicting the oldest on overflow
    pub fn send_error(&self, error: TransportError) {
        if self.errors.try_push(error).is_err() {
            debug!("Error channel closed, discarding error");
        }
    }

    pub fn event_receiver(&self) -> EventReceiver<E> {
        EventReceiver::new(Arc::clone(&self.events))
    }

    pub fn error_receiver(&self) -> EventReceiver<TransportError> {
        EventReceiver::new(Arc::clone(&self.errors))
    }

    /// Both receiving ends at once
    pub fn channels(&self) -> (EventReceiver<E>, EventReceiver<TransportError>) {
        (self.event_receiver(), self.error_receiver())
    }

    pub fn metrics(&self) -> BackpressureMetrics {
        let stats = self.events.stats();
        BackpressureMetrics {
            events_dropped: stats.total_lost(),
            events_blocked: stats.blocked,
            high_water_mark_hits: stats.high_water_hits,
            current_buffer_size: stats.size,
            max_buffer_size: stats.capacity,
            last_drop_time: stats.last_drop_at,
        }
    }

    /// Shed the older half of the event buffer when it is more than half full.
    /// Shed events count as drops. Returns how many were shed.
    pub fn shed_load(&self) -> usize {
        let size = self.events.size();
        if size <= self.events.capacity() / 2 {
            return 0;
        }
        let shed = self.events.shed_oldest(size / 2);
        if shed > 0 {
            warn!("Shed {} buffered events under memory pressure", shed);
        }
        shed
    }

    /// Close both channels. Buffered events stay readable until drained. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.events.close();
        self.errors.close();
        info!(
            "Backpressure handler stopped ({} events still buffered)",
            self.events.size()
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn map_closed(err: TransportError) -> TransportError {
        match err {
            TransportError::BufferClosed => TransportError::Closed,
            other => other,
        }
    }
}
