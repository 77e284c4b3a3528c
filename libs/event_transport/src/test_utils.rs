use crate::event::{Event, TransportEvent};
use crate::memory::{MemorySample, MemorySampler};
use crate::ring_buffer::{EventReceiver, OverflowPolicy, RingBuffer};
use crate::transport::Transport;
use crate::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// Initialize tracing for tests (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// A transport that collects sent events and lets tests inject inbound traffic
#[derive(Debug)]
pub struct MockTransport {
    /// Bounded record of sent events to prevent memory leaks
    sent: Mutex<VecDeque<TransportEvent>>,
    max_sent: usize,
    connected: AtomicBool,
    fail_on_send: AtomicBool,
    fail_on_connect: AtomicBool,
    connect_delay: Mutex<Duration>,
    send_delay: Mutex<Duration>,
    connects: AtomicU64,
    closes: AtomicU64,
    inbound: Arc<RingBuffer<TransportEvent>>,
    inbound_errors: Arc<RingBuffer<TransportError>>,
    name: String,
}

impl MockTransport {
    /// Create a new mock transport with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new mock transport keeping at most `max_sent` sent events
    pub fn with_capacity(max_sent: usize) -> Self {
        Self {
            sent: Mutex::new(VecDeque::with_capacity(max_sent.min(1024))),
            max_sent,
            connected: AtomicBool::new(false),
            fail_on_send: AtomicBool::new(false),
            fail_on_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            send_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            inbound: Arc::new(RingBuffer::with_capacity(1024, OverflowPolicy::DropOldest)),
            inbound_errors: Arc::new(RingBuffer::with_capacity(256, OverflowPolicy::DropOldest)),
            name: "mock-transport".to_string(),
        }
    }

    /// Create a new mock transport with a name
    pub fn with_name(name: impl Into<String>) -> Self {
        let mut transport = Self::new();
        transport.name = name.into();
        transport
    }

    /// Get all sent events
    pub fn sent_events(&self) -> Vec<TransportEvent> {
        self.sent.lock().iter().cloned().collect()
    }

    /// Identifiers of sent events, in send order
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent.lock().iter().map(|e| e.id().to_string()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Configure to fail on next send
    pub fn fail_next_send(&self) {
        self.fail_on_send.store(true, Ordering::Relaxed);
    }

    /// Make every connect attempt fail until reset
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_on_connect.store(fail, Ordering::Relaxed);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = delay;
    }

    /// Deliver an event as if it arrived from the network
    pub fn inject_event(&self, event: TransportEvent) {
        let _ = self.inbound.try_push(event);
    }

    /// Report an asynchronous error as if the network produced it
    pub fn inject_error(&self, error: TransportError) {
        let _ = self.inbound_errors.try_push(error);
    }

    /// End the inbound streams, as a dropped connection would
    pub fn end_stream(&self) {
        self.inbound.close();
        self.inbound_errors.close();
    }

    /// Force disconnect state without going through `close`
    pub fn force_disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport<TransportEvent> for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_connect.load(Ordering::Relaxed) {
            return Err(TransportError::connection_failed(format!(
                "{}: simulated connect failure",
                self.name
            )));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyConnected);
        }
        Ok(())
    }

    async fn send(&self, event: TransportEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        if self.fail_on_send.swap(false, Ordering::Relaxed) {
            return Err(TransportError::Other("Simulated failure".to_string()));
        }

        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // Check capacity and drop oldest if at limit
        let mut sent = self.sent.lock();
        if sent.len() >= self.max_sent {
            sent.pop_front();
        }
        sent.push_back(event);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn receive(&self) -> EventReceiver<TransportEvent> {
        EventReceiver::new(Arc::clone(&self.inbound))
    }

    fn errors(&self) -> EventReceiver<TransportError> {
        EventReceiver::new(Arc::clone(&self.inbound_errors))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A transport that never connects, for testing error conditions
#[derive(Debug)]
pub struct FailingTransport {
    name: String,
    attempts: AtomicU64,
    inbound: Arc<RingBuffer<TransportEvent>>,
    inbound_errors: Arc<RingBuffer<TransportError>>,
}

impl FailingTransport {
    pub fn new(name: impl Into<String>) -> Self {
        let inbound = Arc::new(RingBuffer::with_capacity(1, OverflowPolicy::Reject));
        let inbound_errors = Arc::new(RingBuffer::with_capacity(1, OverflowPolicy::Reject));
        inbound.close();
        inbound_errors.close();
        Self {
            name: name.into(),
            attempts: AtomicU64::new(0),
            inbound,
            inbound_errors,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Default for FailingTransport {
    fn default() -> Self {
        Self::new("failing-transport")
    }
}

#[async_trait]
impl Transport<TransportEvent> for FailingTransport {
    async fn connect(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(TransportError::connection_failed(format!(
            "{}: connection refused",
            self.name
        )))
    }

    async fn send(&self, _event: TransportEvent) -> Result<()> {
        Err(TransportError::NotConnected)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn receive(&self) -> EventReceiver<TransportEvent> {
        EventReceiver::new(Arc::clone(&self.inbound))
    }

    fn errors(&self) -> EventReceiver<TransportError> {
        EventReceiver::new(Arc::clone(&self.inbound_errors))
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Memory sampler with settable readings for simulating pressure
#[derive(Debug)]
pub struct ManualMemorySampler {
    limit: AtomicU64,
    heap_in_use: AtomicU64,
    total_allocated: AtomicU64,
}

impl ManualMemorySampler {
    /// Create a sampler reporting zero usage against `limit` bytes
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            heap_in_use: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
        }
    }

    /// Set heap usage to `percent` of the current limit
    pub fn set_usage_percent(&self, percent: f64) {
        let limit = self.limit.load(Ordering::SeqCst);
        let heap = (limit as f64 * percent / 100.0).round() as u64;
        self.set_heap_in_use(heap);
    }

    pub fn set_heap_in_use(&self, bytes: u64) {
        self.heap_in_use.store(bytes, Ordering::SeqCst);
        self.total_allocated.fetch_max(bytes, Ordering::SeqCst);
    }

    pub fn set_limit(&self, bytes: u64) {
        self.limit.store(bytes, Ordering::SeqCst);
    }
}

impl MemorySampler for ManualMemorySampler {
    fn sample(&self) -> MemorySample {
        MemorySample {
            total_allocated: self.total_allocated.load(Ordering::SeqCst),
            heap_in_use: self.heap_in_use.load(Ordering::SeqCst),
            limit: self.limit.load(Ordering::SeqCst),
        }
    }
}
