//! Transport Manager
//!
//! Lifecycle façade over one pluggable [`Transport`]. The manager serialises
//! `start`/`stop`/`set_transport`, pumps inbound events through a
//! [`BackpressureHandler`] and hands them to application code through
//! [`TransportManager::receive`] and [`TransportManager::errors`].
//!
//! ## State Machine
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Stopped
//!            \           \
//!             `-> Error <-'   (start() from Error retries)
//! ```
//!
//! ## Hot-Swap
//!
//! `set_transport` on a running manager connects the replacement first and only
//! then publishes it. Each published transport carries a gate: sends hold it
//! shared for their whole duration, the swap takes it exclusively to wait for
//! in-flight sends before closing the old transport. A send that picked up the
//! old transport after it was retired is rejected with `NotConnected`, so an
//! event is never delivered into a half-initialized replacement.
//!
//! An inbound event the old pump was still waiting to buffer is carried over
//! and buffered first by the replacement pump.
//!
//! ## Cancellation
//!
//! `start`, `stop` and `set_transport` run on their own task. Dropping the
//! caller's future (a timeout, a `select!`) stops the wait, not the
//! transition, so the manager never stays stuck in `Starting` or mid-swap.

use crate::backpressure::{BackpressureHandler, BackpressureMetrics};
use crate::cleanup::CleanupManager;
use crate::config::ManagerConfig;
use crate::error::SendContext;
use crate::event::Event;
use crate::memory::{MemoryPressureLevel, MemoryPressureMonitor, MemorySampler, SystemMemorySampler};
use crate::metrics::{ManagerMetrics, ManagerMetricsSnapshot};
use crate::ring_buffer::{EventReceiver, PushOutcome};
use crate::state::{ConnectionState, LifecycleState, ManagerState};
use crate::transport::Transport;
use crate::{Result, TransportError};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffer name used for adaptive sizing hints
pub const EVENT_BUFFER_NAME: &str = "events";

/// A published transport together with its drain gate
struct ActiveTransport<E: Event> {
    transport: Arc<dyn Transport<E>>,
    /// Held shared by sends, exclusively by a swap draining this transport
    gate: tokio::sync::RwLock<()>,
    retired: AtomicBool,
    generation: u64,
}

impl<E: Event> ActiveTransport<E> {
    fn new(transport: Arc<dyn Transport<E>>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            transport,
            gate: tokio::sync::RwLock::new(()),
            retired: AtomicBool::new(false),
            generation,
        })
    }

    fn name(&self) -> &str {
        self.transport.name()
    }
}

struct Pump {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerInner<E: Event> {
    name: String,
    config: ManagerConfig,

    /// Serialises start/stop/set_transport
    lifecycle: tokio::sync::Mutex<()>,
    state: RwLock<LifecycleState>,
    swapping: AtomicBool,

    active: RwLock<Option<Arc<ActiveTransport<E>>>>,
    generation: AtomicU64,

    handler: Arc<BackpressureHandler<E>>,
    /// Inbound event a cancelled pump could not buffer yet
    carry: Arc<Mutex<Option<E>>>,
    metrics: ManagerMetrics,
    monitor: MemoryPressureMonitor,
    cleanup: CleanupManager,
    pump: Mutex<Option<Pump>>,
}

impl<E: Event> ManagerInner<E> {
    fn state(&self) -> ManagerState {
        self.state.read().get()
    }

    fn transition_to(&self, state: ManagerState) {
        self.state.write().transition_to(state);
    }

    fn current(&self) -> Option<Arc<ActiveTransport<E>>> {
        self.active.read().clone()
    }

    async fn connect(&self, active: &ActiveTransport<E>) -> Result<()> {
        let timeout = self.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, active.transport.connect()).await {
            Ok(Err(e)) if e.is_benign() => Ok(()),
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(
                format!("connect to '{}'", active.name()),
                timeout,
            )),
        };
        self.metrics.record_connection(result.is_ok());
        result
    }

    async fn close(&self, active: &ActiveTransport<E>) {
        let timeout = self.config.close_timeout;
        match tokio::time::timeout(timeout, active.transport.close()).await {
            Ok(Ok(())) => debug!("Closed transport '{}'", active.name()),
            Ok(Err(e)) => warn!("Closing transport '{}' failed: {}", active.name(), e),
            Err(_) => warn!(
                "Closing transport '{}' timed out after {:?}",
                active.name(),
                timeout
            ),
        }
    }

    /// Wait for in-flight sends on a retired transport, then close it
    async fn retire(&self, old: Arc<ActiveTransport<E>>) {
        old.retired.store(true, Ordering::Release);
        match tokio::time::timeout(self.config.drain_timeout, old.gate.write()).await {
            Ok(_drained) => self.close(&old).await,
            Err(_) => {
                warn!(
                    "In-flight sends on '{}' did not finish within {:?}, closing anyway",
                    old.name(),
                    self.config.drain_timeout
                );
                self.close(&old).await;
            }
        }
    }

    async fn stop_pump(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.token.cancel();
            if let Err(e) = pump.handle.await {
                if e.is_panic() {
                    error!("Event pump for '{}' panicked: {}", self.name, e);
                }
            }
        }
    }

    /// Inbound stream of the current transport ended on its own
    fn on_inbound_closed(&self, active: &Arc<ActiveTransport<E>>) {
        let is_current = self
            .active
            .read()
            .as_ref()
            .map(|current| Arc::ptr_eq(current, active))
            .unwrap_or(false);
        if !is_current || active.retired.load(Ordering::Acquire) {
            return;
        }

        {
            let mut state = self.state.write();
            if state.get() != ManagerState::Running {
                return;
            }
            state.transition_to(ManagerState::Error);
        }

        warn!(
            "Transport '{}' inbound stream ended, manager '{}' entering error state",
            active.name(),
            self.name
        );
        self.metrics.record_error();
        self.handler
            .send_error(TransportError::connection_lost(format!(
                "inbound stream of '{}' ended",
                active.name()
            )));
    }

    async fn set_transport(self: Arc<Self>, transport: Arc<dyn Transport<E>>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state.is_terminal() {
            return Err(TransportError::Closed);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let replacement = ActiveTransport::new(transport, generation);
        let running = state == ManagerState::Running;

        if running {
            self.swapping.store(true, Ordering::Release);
            debug!(
                "Connecting replacement transport '{}' for '{}'",
                replacement.name(),
                self.name
            );
            let connected = self.connect(&replacement).await;
            if let Err(e) = connected {
                self.swapping.store(false, Ordering::Release);
                error!(
                    "Replacement transport '{}' failed to connect: {}",
                    replacement.name(),
                    e
                );
                return Err(e);
            }
            self.stop_pump().await;
        }

        let previous = self.active.write().replace(Arc::clone(&replacement));

        if running {
            let pump = spawn_pump(&self, Arc::clone(&replacement));
            *self.pump.lock() = Some(pump);
        }
        self.swapping.store(false, Ordering::Release);

        if let Some(previous) = previous {
            info!(
                "Manager '{}' switching transport '{}' -> '{}'",
                self.name,
                previous.name(),
                replacement.name()
            );
            self.retire(previous).await;
            self.metrics.record_transport_switch();
        } else {
            info!(
                "Manager '{}' using transport '{}'",
                self.name,
                replacement.name()
            );
        }
        Ok(())
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        // Double-check under the lifecycle lock
        match self.state() {
            ManagerState::Running | ManagerState::Starting => {
                return Err(TransportError::AlreadyConnected)
            }
            ManagerState::Stopping | ManagerState::Stopped => return Err(TransportError::Closed),
            ManagerState::Idle | ManagerState::Error => {}
        }

        let previous_state = self.state();
        self.transition_to(ManagerState::Starting);
        self.stop_pump().await;

        if let Some(active) = self.current() {
            if let Err(e) = self.connect(&active).await {
                self.transition_to(ManagerState::Error);
                error!(
                    "Manager '{}' failed to connect '{}': {}",
                    self.name,
                    active.name(),
                    e
                );
                return Err(e);
            }
            let pump = spawn_pump(&self, active);
            *self.pump.lock() = Some(pump);
        } else {
            debug!(
                "Manager '{}' started without a transport; sends fail until one is set",
                self.name
            );
        }

        self.monitor.start();
        self.cleanup.start();
        self.transition_to(ManagerState::Running);
        info!(
            "Transport manager '{}' started (from {})",
            self.name, previous_state
        );
        Ok(())
    }

    async fn stop(self: Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ManagerState::Idle => {
                debug!("Manager '{}' stop() before start(), nothing to do", self.name);
                return Ok(());
            }
            ManagerState::Stopped => return Ok(()),
            ManagerState::Running
            | ManagerState::Error
            | ManagerState::Starting
            | ManagerState::Stopping => {}
        }

        let ran_for = self.state.read().time_in_state();
        self.transition_to(ManagerState::Stopping);
        self.stop_pump().await;

        let abandoned = self.carry.lock().take();
        if abandoned.is_some() {
            warn!(
                "Manager '{}' stopping with an inbound event still waiting for buffer space",
                self.name
            );
            self.handler.record_dropped();
        }

        let active = self.active.write().take();
        if let Some(active) = active {
            self.retire(active).await;
        }

        self.monitor.stop();
        self.cleanup.stop();
        self.handler.stop();
        self.transition_to(ManagerState::Stopped);
        info!(
            "Transport manager '{}' stopped after {:?} in its last state",
            self.name, ran_for
        );
        Ok(())
    }

    fn on_memory_pressure(&self, level: MemoryPressureLevel) {
        info!("Manager '{}' memory pressure now {}", self.name, level);
        match level {
            MemoryPressureLevel::Critical => {
                self.run_cleanup_now();
                self.handler.shed_load();
            }
            MemoryPressureLevel::High => self.run_cleanup_now(),
            MemoryPressureLevel::Low | MemoryPressureLevel::Normal => {
                let size = self.monitor.get_adaptive_buffer_size(
                    EVENT_BUFFER_NAME,
                    self.config.backpressure.buffer_size,
                );
                debug!("Adaptive event buffer size now {}", size);
            }
        }
    }

    fn run_cleanup_now(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, skipping pressure-triggered cleanup");
            return;
        };
        let cleanup = self.cleanup.clone();
        runtime.spawn(async move {
            for (task, result) in cleanup.run_all_now().await {
                match result {
                    Ok(Some(removed)) => debug!("Cleanup '{}' removed {} items", task, removed),
                    Ok(None) => debug!("Cleanup '{}' already running", task),
                    Err(e) => warn!("Cleanup '{}' failed: {}", task, e),
                }
            }
        });
    }
}

/// Buffer one inbound event. Returns false when the pump should exit.
async fn forward<E: Event>(
    handler: &BackpressureHandler<E>,
    carry: &Mutex<Option<E>>,
    event: E,
    token: &CancellationToken,
) -> bool {
    match handler.send_event_or_reclaim(event, token).await {
        PushOutcome::Done(Ok(())) => true,
        PushOutcome::Done(Err(TransportError::Closed)) => false,
        PushOutcome::Done(Err(e)) => {
            debug!("Inbound event not buffered: {}", e);
            handler.send_error(e);
            true
        }
        PushOutcome::Cancelled(event) => {
            *carry.lock() = Some(event);
            false
        }
    }
}

fn spawn_pump<E: Event>(inner: &Arc<ManagerInner<E>>, active: Arc<ActiveTransport<E>>) -> Pump {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak: Weak<ManagerInner<E>> = Arc::downgrade(inner);
    let handler = Arc::clone(&inner.handler);
    let carry = Arc::clone(&inner.carry);
    let events = active.transport.receive();
    let errors = active.transport.errors();

    let handle = tokio::spawn(async move {
        let mut errors_open = true;
        debug!(
            "Event pump started for '{}' (generation {})",
            active.name(),
            active.generation
        );

        // Left over from the previous pump; it was received first
        let carried = carry.lock().take();
        if let Some(event) = carried {
            if !forward(&handler, &carry, event, &cancelled).await {
                debug!("Event pump for '{}' exited", active.name());
                return;
            }
        }

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,

                event = events.recv() => {
                    match event {
                        Some(event) => {
                            match weak.upgrade() {
                                Some(inner) => inner.metrics.record_received(),
                                None => break,
                            }
                            if !forward(&handler, &carry, event, &cancelled).await {
                                break;
                            }
                        }
                        None => {
                            if let Some(inner) = weak.upgrade() {
                                inner.on_inbound_closed(&active);
                            }
                            break;
                        }
                    }
                }

                error = errors.recv(), if errors_open => {
                    let Some(inner) = weak.upgrade() else { break };
                    match error {
                        Some(error) => {
                            inner.metrics.record_error();
                            inner.handler.send_error(error);
                        }
                        None => errors_open = false,
                    }
                }
            }
        }

        debug!("Event pump for '{}' exited", active.name());
    });

    Pump { token, handle }
}

/// Run a lifecycle transition on its own task so that dropping the caller's
/// future cannot leave it half done
async fn run_detached<T, F>(operation: &'static str, transition: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(transition).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            Err(TransportError::callback_panicked(operation, e.into_panic()))
        }
        Err(e) => Err(TransportError::Other(format!("{operation} aborted: {e}"))),
    }
}

/// Lifecycle façade over a swappable transport
pub struct TransportManager<E: Event> {
    inner: Arc<ManagerInner<E>>,
}

impl<E: Event> Clone for TransportManager<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> std::fmt::Debug for TransportManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("transport", &self.transport_name())
            .finish_non_exhaustive()
    }
}

impl<E: Event> TransportManager<E> {
    /// Create a manager sampling real process memory
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_sampler("transport-manager", config, Arc::new(SystemMemorySampler::new()))
    }

    /// Create a manager with a name for logs and metrics
    pub fn with_name(name: impl Into<String>, config: ManagerConfig) -> Result<Self> {
        Self::with_sampler(name, config, Arc::new(SystemMemorySampler::new()))
    }

    /// Create a manager with an injected memory sampler
    pub fn with_sampler(
        name: impl Into<String>,
        config: ManagerConfig,
        sampler: Arc<dyn MemorySampler>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let name = name.into();

        let monitor = MemoryPressureMonitor::with_sampler(config.memory.clone(), sampler)?;
        monitor.check_now();
        let buffer_size =
            monitor.get_adaptive_buffer_size(EVENT_BUFFER_NAME, config.backpressure.buffer_size);
        let mut backpressure = config.backpressure.clone();
        backpressure.buffer_size = buffer_size;

        let inner = Arc::new(ManagerInner {
            handler: Arc::new(BackpressureHandler::new(backpressure)),
            carry: Arc::new(Mutex::new(None)),
            cleanup: CleanupManager::new(config.cleanup.clone()),
            monitor,
            name,
            config,
            lifecycle: tokio::sync::Mutex::new(()),
            state: RwLock::new(LifecycleState::new()),
            swapping: AtomicBool::new(false),
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            metrics: ManagerMetrics::new(),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.monitor.on_memory_pressure(move |level| {
            if let Some(inner) = weak.upgrade() {
                inner.on_memory_pressure(level);
            }
        });

        debug!(
            "Created transport manager '{}' (event buffer {})",
            inner.name, buffer_size
        );
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.state();
        if state == ManagerState::Running && self.inner.current().is_none() {
            return ConnectionState::Disconnected;
        }
        ConnectionState::from_manager(state, self.inner.swapping.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn has_transport(&self) -> bool {
        self.inner.current().is_some()
    }

    pub fn transport_name(&self) -> Option<String> {
        self.inner.current().map(|a| a.name().to_string())
    }

    /// Time since the manager last entered `Running`
    pub fn uptime(&self) -> Option<Duration> {
        self.inner.state.read().running_since().map(|t| t.elapsed())
    }

    /// Install or replace the transport.
    ///
    /// While running, the replacement is connected before it becomes visible;
    /// if that fails the current transport stays in place.
    pub async fn set_transport(&self, transport: Arc<dyn Transport<E>>) -> Result<()> {
        run_detached("set_transport", Arc::clone(&self.inner).set_transport(transport)).await
    }

    /// Connect the transport and begin pumping events.
    ///
    /// A call on a running manager returns `AlreadyConnected` (benign, see
    /// [`TransportError::is_benign`]). Concurrent calls race to exactly one
    /// connect. After `stop()` the manager cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        // Fast path: already running
        if inner.state() == ManagerState::Running {
            return Err(TransportError::AlreadyConnected);
        }

        run_detached("start", Arc::clone(inner).start()).await
    }

    /// Close the transport, stop background work and close the channels.
    ///
    /// Idempotent; a no-op before `start()`. Buffered events remain readable
    /// until drained, after which receivers yield `None`.
    pub async fn stop(&self) -> Result<()> {
        run_detached("stop", Arc::clone(&self.inner).stop()).await
    }

    /// Send an event through the active transport
    pub async fn send(&self, event: E) -> Result<()> {
        let inner = &self.inner;
        if inner.state() != ManagerState::Running {
            return Err(TransportError::NotConnected);
        }
        let active = inner.current().ok_or(TransportError::NotConnected)?;

        let _in_flight = active.gate.read().await;
        if active.retired.load(Ordering::Acquire) || !active.transport.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let context = SendContext::new(event.id(), event.event_type()).with_target(active.name());
        let started = Instant::now();
        match active.transport.send(event).await {
            Ok(()) => {
                inner.metrics.record_send(started.elapsed());
                Ok(())
            }
            Err(e) => {
                inner.metrics.record_send_failure();
                debug!("Send via '{}' failed: {}", active.name(), e);
                match e {
                    TransportError::NotConnected
                    | TransportError::Cancelled
                    | TransportError::SendFailed { .. } => Err(e),
                    other => Err(TransportError::send_failed_with_context(
                        other.to_string(),
                        context,
                    )),
                }
            }
        }
    }

    /// Send, giving up with `Cancelled` as soon as `token` fires
    pub async fn send_with_cancel(&self, event: E, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        tokio::select! {
            result = self.send(event) => result,
            _ = token.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// Inbound events, valid for the manager's lifetime
    pub fn receive(&self) -> EventReceiver<E> {
        self.inner.handler.event_receiver()
    }

    /// Transport and manager errors, valid for the manager's lifetime
    pub fn errors(&self) -> EventReceiver<TransportError> {
        self.inner.handler.error_receiver()
    }

    pub fn channels(&self) -> (EventReceiver<E>, EventReceiver<TransportError>) {
        self.inner.handler.channels()
    }

    pub fn get_metrics(&self) -> ManagerMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn get_backpressure_metrics(&self) -> BackpressureMetrics {
        self.inner.handler.metrics()
    }

    pub fn memory_monitor(&self) -> &MemoryPressureMonitor {
        &self.inner.monitor
    }

    /// Register auxiliary-store sweeps here; they run while the manager runs
    pub fn cleanup_manager(&self) -> &CleanupManager {
        &self.inner.cleanup
    }
}

impl<E: Event> Drop for ManagerInner<E> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.token.cancel();
        }
        self.monitor.stop();
        self.cleanup.stop();
        self.handler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::{BackpressureConfig, BackpressureStrategy};
    use crate::event::TransportEvent;
    use crate::test_utils::{FailingTransport, ManualMemorySampler, MockTransport};
    use std::sync::atomic::AtomicUsize;

    fn event(id: &str) -> TransportEvent {
        TransportEvent::with_id(id, "test", bytes::Bytes::new())
    }

    fn manager_with(config: ManagerConfig) -> (TransportManager<TransportEvent>, Arc<ManualMemorySampler>) {
        let sampler = Arc::new(ManualMemorySampler::new(1000));
        let manager = TransportManager::with_sampler("test", config, sampler.clone()).unwrap();
        (manager, sampler)
    }

    fn manager() -> TransportManager<TransportEvent> {
        manager_with(ManagerConfig::default()).0
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let manager = manager();
        assert!(manager.stop().await.is_ok());
        assert!(manager.stop().await.is_ok());
        assert_eq!(manager.state(), ManagerState::Idle);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_before_start_and_after_stop() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();

        assert_eq!(
            manager.send(event("a")).await,
            Err(TransportError::NotConnected)
        );

        manager.start().await.unwrap();
        manager.send(event("b")).await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(
            manager.send(event("c")).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.sent_ids(), vec!["b".to_string()]);
        assert_eq!(manager.get_metrics().events_sent, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_connects_once() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        transport.set_connect_delay(Duration::from_millis(30));
        manager.set_transport(transport.clone()).await.unwrap();

        let mut starts = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            starts.push(tokio::spawn(async move { manager.start().await }));
        }

        let mut winners = 0;
        for start in starts {
            match start.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(e.is_benign(), "unexpected error {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_is_terminal() {
        let manager = manager();
        manager.set_transport(Arc::new(MockTransport::new())).await.unwrap();
        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(manager.start().await, Err(TransportError::Closed));
        assert_eq!(
            manager.set_transport(Arc::new(MockTransport::new())).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_failed_connect_enters_error_and_retries() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        transport.set_fail_connect(true);
        manager.set_transport(transport.clone()).await.unwrap();

        assert!(manager.start().await.is_err());
        assert_eq!(manager.state(), ManagerState::Error);
        assert_eq!(manager.connection_state(), ConnectionState::Error);

        transport.set_fail_connect(false);
        manager.start().await.unwrap();
        assert!(manager.is_running());

        let metrics = manager.get_metrics();
        assert_eq!(metrics.total_connections, 2);
        assert_eq!(metrics.failed_connections, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_events_and_errors_are_pumped() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.inject_event(event("in-1"));
        transport.inject_error(TransportError::Other("remote hiccup".into()));

        let rx = manager.receive();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id(), "in-1");

        let errors = manager.errors();
        let err = tokio::time::timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, TransportError::Other("remote hiccup".into()));

        let metrics = manager.get_metrics();
        assert_eq!(metrics.events_received, 1);
        assert_eq!(metrics.errors_received, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_end_moves_to_error() {
        let manager = manager();
        let transport = Arc::new(MockTransport::with_name("flaky"));
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.end_stream();
        let err = tokio::time::timeout(Duration::from_secs(1), manager.errors().recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        assert_eq!(manager.state(), ManagerState::Error);
    }

    #[tokio::test]
    async fn test_hot_swap_routes_to_replacement() {
        let manager = manager();
        let first = Arc::new(MockTransport::with_name("first"));
        let second = Arc::new(MockTransport::with_name("second"));

        manager.set_transport(first.clone()).await.unwrap();
        manager.start().await.unwrap();
        manager.send(event("1")).await.unwrap();

        manager.set_transport(second.clone()).await.unwrap();
        manager.send(event("2")).await.unwrap();

        assert_eq!(first.sent_ids(), vec!["1".to_string()]);
        assert_eq!(second.sent_ids(), vec!["2".to_string()]);
        assert!(!first.is_connected());
        assert_eq!(manager.transport_name().as_deref(), Some("second"));

        let metrics = manager.get_metrics();
        assert_eq!(metrics.transport_switches, 1);
        assert!(metrics.last_transport_switch.is_some());

        // Inbound now comes from the replacement
        second.inject_event(event("from-second"));
        let received = tokio::time::timeout(Duration::from_secs(1), manager.receive().recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id(), "from-second");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_current() {
        let manager = manager();
        let first = Arc::new(MockTransport::with_name("first"));
        manager.set_transport(first.clone()).await.unwrap();
        manager.start().await.unwrap();

        let result = manager
            .set_transport(Arc::new(FailingTransport::new("broken")))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert_eq!(manager.transport_name().as_deref(), Some("first"));

        manager.send(event("still-first")).await.unwrap();
        assert_eq!(first.sent_count(), 1);
        assert_eq!(manager.get_metrics().transport_switches, 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_flight_send_completes_on_previous_transport() {
        let manager = manager();
        let first = Arc::new(MockTransport::with_name("first"));
        first.set_send_delay(Duration::from_millis(100));
        manager.set_transport(first.clone()).await.unwrap();
        manager.start().await.unwrap();

        let in_flight = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(event("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = Arc::new(MockTransport::with_name("second"));
        manager.set_transport(second.clone()).await.unwrap();

        assert!(in_flight.await.unwrap().is_ok());
        assert_eq!(first.sent_ids(), vec!["slow".to_string()]);
        assert_eq!(second.sent_count(), 0);
        // Old transport was only closed after the send drained
        assert_eq!(first.close_count(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_start_still_completes() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        transport.set_connect_delay(Duration::from_millis(200));
        manager.set_transport(transport.clone()).await.unwrap();

        // Caller gives up while connect is in progress
        assert!(
            tokio::time::timeout(Duration::from_millis(20), manager.start())
                .await
                .is_err()
        );

        assert_eq!(manager.start().await, Err(TransportError::AlreadyConnected));
        assert_eq!(manager.state(), ManagerState::Running);
        assert_eq!(transport.connect_count(), 1);
        manager.send(event("after")).await.unwrap();
        assert_eq!(transport.sent_ids(), vec!["after".to_string()]);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_swap_still_completes() {
        let manager = manager();
        let first = Arc::new(MockTransport::with_name("first"));
        manager.set_transport(first.clone()).await.unwrap();
        manager.start().await.unwrap();

        let second = Arc::new(MockTransport::with_name("second"));
        second.set_connect_delay(Duration::from_millis(150));
        assert!(tokio::time::timeout(
            Duration::from_millis(20),
            manager.set_transport(second.clone())
        )
        .await
        .is_err());

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.transport_name().as_deref() != Some("second")
                || manager.connection_state() != ConnectionState::Connected
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("swap never finished");

        // The replacement pump is running
        second.inject_event(event("from-second"));
        let received = manager
            .receive()
            .recv_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.id(), "from-second");

        // stop() waits for the swap to retire the old transport
        manager.stop().await.unwrap();
        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 1);
    }

    fn blocking_manager() -> TransportManager<TransportEvent> {
        manager_with(
            ManagerConfig::default()
                .with_backpressure(BackpressureConfig::lossless(1, Duration::from_secs(30))),
        )
        .0
    }

    async fn wait_for_blocked_pump(manager: &TransportManager<TransportEvent>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.get_backpressure_metrics().events_blocked == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pump never blocked");
    }

    #[tokio::test]
    async fn test_blocked_inbound_event_survives_swap() {
        let manager = blocking_manager();
        let first = Arc::new(MockTransport::with_name("first"));
        manager.set_transport(first.clone()).await.unwrap();
        manager.start().await.unwrap();

        first.inject_event(event("1"));
        first.inject_event(event("2"));
        wait_for_blocked_pump(&manager).await;

        let second = Arc::new(MockTransport::with_name("second"));
        manager.set_transport(second.clone()).await.unwrap();
        second.inject_event(event("3"));

        let rx = manager.receive();
        let mut delivered = Vec::new();
        for _ in 0..3 {
            let event = rx.recv_timeout(Duration::from_secs(1)).await.unwrap();
            delivered.push(event.id().to_string());
        }
        assert_eq!(delivered, vec!["1", "2", "3"]);

        assert_eq!(manager.get_metrics().events_received, 3);
        assert_eq!(manager.get_backpressure_metrics().events_dropped, 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_blocked_inbound_event_counted_as_drop_at_stop() {
        let manager = blocking_manager();
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.inject_event(event("1"));
        transport.inject_event(event("2"));
        wait_for_blocked_pump(&manager).await;

        manager.stop().await.unwrap();
        let metrics = manager.get_backpressure_metrics();
        assert_eq!(metrics.events_dropped, 1);
        assert!(metrics.last_drop_time.is_some());

        let rx = manager.receive();
        assert_eq!(rx.recv().await.map(|e| e.id().to_string()), Some("1".into()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_manager_releases_blocked_pump() {
        let manager = blocking_manager();
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.inject_event(event("1"));
        transport.inject_event(event("2"));
        wait_for_blocked_pump(&manager).await;

        let rx = manager.receive();
        drop(manager);

        assert_eq!(rx.try_recv().map(|e| e.id().to_string()), Ok("1".into()));
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("buffer was never closed");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_disconnected_transport_rejects_sends() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        let payload = TransportEvent::with_id("p-1", "quote", &b"bid=42"[..]);
        manager.send(payload).await.unwrap();
        let sent = transport.sent_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.as_ref(), b"bid=42");

        transport.force_disconnect();
        assert_eq!(
            manager.send(event("lost")).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.sent_count(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_with_cancel() {
        let manager = manager();
        let transport = Arc::new(MockTransport::new());
        transport.set_send_delay(Duration::from_secs(30));
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert_eq!(
            manager.send_with_cancel(event("x"), &token).await,
            Err(TransportError::Cancelled)
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_carries_context() {
        let manager = manager();
        let transport = Arc::new(MockTransport::with_name("ws"));
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.fail_next_send();
        match manager.send(event("evt-9")).await {
            Err(TransportError::SendFailed { context, .. }) => {
                assert_eq!(context.event_id, "evt-9");
                assert_eq!(context.target.as_deref(), Some("ws"));
            }
            other => panic!("expected SendFailed, got {:?}", other),
        }
        assert_eq!(manager.get_metrics().send_failures, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_then_closes_receivers() {
        let manager = manager_with(ManagerConfig::default().with_backpressure(
            BackpressureConfig::new(BackpressureStrategy::DropOldest, 8),
        ))
        .0;
        let transport = Arc::new(MockTransport::new());
        manager.set_transport(transport.clone()).await.unwrap();
        manager.start().await.unwrap();

        transport.inject_event(event("last"));
        let rx = manager.receive();
        tokio::time::timeout(Duration::from_secs(1), async {
            while rx.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(rx.recv().await.map(|e| e.id().to_string()), Some("last".into()));
        assert!(rx.recv().await.is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_critical_pressure_runs_cleanup() {
        let (manager, sampler) = manager_with(ManagerConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        manager
            .cleanup_manager()
            .register_task("pending", Duration::from_secs(3600), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
            .unwrap();

        sampler.set_usage_percent(95.0);
        assert_eq!(
            manager.memory_monitor().check_now(),
            MemoryPressureLevel::Critical
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while runs.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_buffer_sized_from_adaptive_hint() {
        let sampler = Arc::new(ManualMemorySampler::new(1000));
        sampler.set_usage_percent(75.0);
        let manager: TransportManager<TransportEvent> = TransportManager::with_sampler(
            "sized",
            ManagerConfig::default().with_backpressure(BackpressureConfig::new(
                BackpressureStrategy::None,
                100,
            )),
            sampler,
        )
        .unwrap();

        assert_eq!(manager.get_backpressure_metrics().max_buffer_size, 50);
        assert_eq!(
            manager.memory_monitor().adaptive_hint(EVENT_BUFFER_NAME),
            Some(50)
        );
    }
}
