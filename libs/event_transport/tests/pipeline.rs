//! End-to-end flow through the manager with a user-defined event type

use async_trait::async_trait;
use event_transport::test_utils::{init_test_tracing, ManualMemorySampler};
use event_transport::{
    BackpressureConfig, BackpressureStrategy, Event, EventReceiver, ManagerConfig, ManagerState,
    MemoryMonitorConfig, MemoryPressureLevel, OverflowPolicy, Result, RingBuffer, Transport,
    TransportError, TransportManager,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct Quote {
    id: String,
    symbol: String,
    price: u64,
    at: SystemTime,
}

impl Quote {
    fn new(seq: u64, symbol: &str, price: u64) -> Self {
        Self {
            id: format!("q-{seq}"),
            symbol: symbol.to_string(),
            price,
            at: SystemTime::now(),
        }
    }
}

impl Event for Quote {
    fn id(&self) -> &str {
        &self.id
    }

    fn event_type(&self) -> &str {
        "quote"
    }

    fn timestamp(&self) -> SystemTime {
        self.at
    }
}

/// Loopback transport: everything sent comes straight back in
#[derive(Debug)]
struct Loopback {
    connected: AtomicBool,
    inbound: Arc<RingBuffer<Quote>>,
    errors: Arc<RingBuffer<TransportError>>,
}

impl Loopback {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            inbound: Arc::new(RingBuffer::with_capacity(4096, OverflowPolicy::Reject)),
            errors: Arc::new(RingBuffer::with_capacity(16, OverflowPolicy::DropOldest)),
        }
    }
}

#[async_trait]
impl Transport<Quote> for Loopback {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, event: Quote) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if event.price == 0 {
            self.errors
                .try_push(TransportError::Other(format!("zero price for {}", event.symbol)))?;
            return Ok(());
        }
        self.inbound.try_push(event)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.inbound.close();
        self.errors.close();
        Ok(())
    }

    fn receive(&self) -> EventReceiver<Quote> {
        EventReceiver::new(Arc::clone(&self.inbound))
    }

    fn errors(&self) -> EventReceiver<TransportError> {
        EventReceiver::new(Arc::clone(&self.errors))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

fn manager_with(
    backpressure: BackpressureConfig,
) -> (TransportManager<Quote>, Arc<ManualMemorySampler>) {
    let sampler = Arc::new(ManualMemorySampler::new(1 << 30));
    let config = ManagerConfig::default()
        .with_backpressure(backpressure)
        .with_memory(MemoryMonitorConfig {
            monitor_interval: Duration::from_millis(10),
            ..Default::default()
        });
    let manager = TransportManager::with_sampler("pipeline", config, sampler.clone())
        .expect("valid config");
    (manager, sampler)
}

#[tokio::test]
async fn loopback_round_trip_preserves_order() {
    init_test_tracing();
    let (manager, _) = manager_with(BackpressureConfig::lossless(256, Duration::from_secs(1)));
    manager.set_transport(Arc::new(Loopback::new())).await.unwrap();
    manager.start().await.unwrap();

    for seq in 0..100 {
        manager.send(Quote::new(seq, "ETH", 3000 + seq)).await.unwrap();
    }

    let events = manager.receive();
    for seq in 0..100 {
        let quote = events.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(quote.id(), format!("q-{seq}"));
        assert_eq!(quote.price, 3000 + seq);
    }

    let metrics = manager.get_metrics();
    assert_eq!(metrics.events_sent, 100);
    assert_eq!(metrics.events_received, 100);
    assert_eq!(manager.get_backpressure_metrics().events_dropped, 0);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn transport_errors_reach_the_error_channel() {
    init_test_tracing();
    let (manager, _) = manager_with(BackpressureConfig::default());
    manager.set_transport(Arc::new(Loopback::new())).await.unwrap();
    manager.start().await.unwrap();

    manager.send(Quote::new(1, "BTC", 0)).await.unwrap();

    let (_, errors) = manager.channels();
    let err = errors.recv_timeout(Duration::from_secs(1)).await.unwrap();
    assert_eq!(err, TransportError::Other("zero price for BTC".into()));
    assert_eq!(manager.get_metrics().errors_received, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn slow_consumer_keeps_latest_quotes() {
    init_test_tracing();
    let (manager, _) = manager_with(BackpressureConfig::lossy_latest(10));
    manager.set_transport(Arc::new(Loopback::new())).await.unwrap();
    manager.start().await.unwrap();

    for seq in 0..50 {
        manager.send(Quote::new(seq, "SOL", 100 + seq)).await.unwrap();
    }

    // Wait for the pump to move all 50 through the 10-slot buffer
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.get_metrics().events_received < 50
        || manager.get_backpressure_metrics().events_dropped < 40
    {
        assert!(tokio::time::Instant::now() < deadline, "pump stalled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let events = manager.receive();
    let mut kept = Vec::new();
    while let Ok(quote) = events.try_recv() {
        kept.push(quote.price);
    }
    assert_eq!(kept, (140..150).collect::<Vec<_>>());

    let bp = manager.get_backpressure_metrics();
    assert_eq!(bp.events_dropped, 40);
    assert_eq!(bp.max_buffer_size, 10);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn memory_pressure_shrinks_the_next_buffer_hint() {
    init_test_tracing();
    let (manager, sampler) = manager_with(BackpressureConfig::new(
        BackpressureStrategy::DropOldest,
        1000,
    ));
    manager.set_transport(Arc::new(Loopback::new())).await.unwrap();
    manager.start().await.unwrap();

    sampler.set_usage_percent(95.0);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.memory_monitor().current_level() != MemoryPressureLevel::Critical {
        assert!(tokio::time::Instant::now() < deadline, "monitor never sampled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        manager
            .memory_monitor()
            .get_adaptive_buffer_size("events", 1000),
        250
    );

    // Pressure never interrupts the flow
    manager.send(Quote::new(1, "ARB", 1)).await.unwrap();
    assert_eq!(manager.state(), ManagerState::Running);

    manager.stop().await.unwrap();
}
