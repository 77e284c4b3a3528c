//! Memory Pressure Monitoring
//!
//! Periodically samples process memory through a [`MemorySampler`], classifies
//! the result into a [`MemoryPressureLevel`] and notifies registered callbacks
//! once per level transition. Buffer owners ask for sizing hints through
//! [`MemoryPressureMonitor::get_adaptive_buffer_size`].
//!
//! ## Callback Discipline
//!
//! - A transition is decided under the metrics write lock and queued in that
//!   same critical section, so each one is reported exactly once and in order.
//! - One caller at a time delivers the queue. A transition decided while
//!   callbacks are running is handed to the delivering caller, so callbacks on
//!   one monitor never overlap.
//! - Callbacks run with no monitor lock held and may call back into the
//!   monitor (`metrics()`, `current_level()`, even `check_now()`).
//! - A panicking callback is recovered, logged and counted in
//!   `callback_panics`; the remaining callbacks still run.

use crate::{Result, TransportError};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coarse classification of memory usage, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MemoryPressureLevel {
    #[default]
    Normal,
    Low,
    High,
    Critical,
}

impl std::fmt::Display for MemoryPressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryPressureLevel::Normal => write!(f, "normal"),
            MemoryPressureLevel::Low => write!(f, "low"),
            MemoryPressureLevel::High => write!(f, "high"),
            MemoryPressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Configuration for the memory monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryMonitorConfig {
    /// How often the background loop re-samples
    pub monitor_interval: Duration,
    /// Usage percentage at which the level becomes `Low`
    pub low_memory_percent: f64,
    /// Usage percentage at which the level becomes `High`
    pub high_memory_percent: f64,
    /// Usage percentage at which the level becomes `Critical`
    pub critical_memory_percent: f64,
    /// Memory limit usage is measured against; `None` uses the sampler's limit
    pub memory_limit_bytes: Option<u64>,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            low_memory_percent: 50.0,
            high_memory_percent: 70.0,
            critical_memory_percent: 90.0,
            memory_limit_bytes: None,
        }
    }
}

impl MemoryMonitorConfig {
    /// Sample often and react early
    pub fn aggressive() -> Self {
        Self {
            monitor_interval: Duration::from_secs(1),
            low_memory_percent: 40.0,
            high_memory_percent: 60.0,
            critical_memory_percent: 80.0,
            memory_limit_bytes: None,
        }
    }

    /// Sample rarely, only react close to the limit
    pub fn relaxed() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            low_memory_percent: 60.0,
            high_memory_percent: 80.0,
            critical_memory_percent: 95.0,
            memory_limit_bytes: None,
        }
    }

    pub fn with_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "monitor_interval must be greater than zero",
            ));
        }
        let thresholds = [
            self.low_memory_percent,
            self.high_memory_percent,
            self.critical_memory_percent,
        ];
        if thresholds
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0 || *t > 100.0)
        {
            return Err(TransportError::invalid_config(
                "memory thresholds must be within (0, 100]",
            ));
        }
        if !(self.low_memory_percent < self.high_memory_percent
            && self.high_memory_percent < self.critical_memory_percent)
        {
            return Err(TransportError::invalid_config(
                "memory thresholds must satisfy low < high < critical",
            ));
        }
        Ok(())
    }

    /// Classify a usage percentage. Thresholds are read from one immutable config,
    /// so a comparison is never made against a mix of old and new values.
    pub fn classify(&self, usage_percent: f64) -> MemoryPressureLevel {
        if usage_percent >= self.critical_memory_percent {
            MemoryPressureLevel::Critical
        } else if usage_percent >= self.high_memory_percent {
            MemoryPressureLevel::High
        } else if usage_percent >= self.low_memory_percent {
            MemoryPressureLevel::Low
        } else {
            MemoryPressureLevel::Normal
        }
    }
}

/// One memory reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    /// Total memory reserved by the process
    pub total_allocated: u64,
    /// Memory actually in use
    pub heap_in_use: u64,
    /// Memory limit the reading is compared against; 0 when unknown
    pub limit: u64,
}

/// Source of memory readings, injectable so tests can simulate pressure
pub trait MemorySampler: Send + Sync + 'static {
    fn sample(&self) -> MemorySample;
}

/// Reads the current process' memory through `sysinfo`
pub struct SystemMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl std::fmt::Debug for SystemMemorySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemorySampler")
            .field("pid", &self.pid)
            .finish()
    }
}

impl SystemMemorySampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Unable to resolve current pid for memory sampling: {}", e);
                None
            }
        };

        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl Default for SystemMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemorySampler {
    fn sample(&self) -> MemorySample {
        let mut system = self.system.lock();
        system.refresh_memory();
        let limit = system.total_memory();

        let Some(pid) = self.pid else {
            return MemorySample {
                total_allocated: 0,
                heap_in_use: 0,
                limit,
            };
        };

        system.refresh_process(pid);
        match system.process(pid) {
            Some(process) => MemorySample {
                total_allocated: process.virtual_memory(),
                heap_in_use: process.memory(),
                limit,
            },
            None => MemorySample {
                total_allocated: 0,
                heap_in_use: 0,
                limit,
            },
        }
    }
}

/// Snapshot of monitor state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryMetrics {
    pub total_allocated: u64,
    pub heap_in_use: u64,
    pub limit: u64,
    pub usage_percent: f64,
    pub peak_heap_in_use: u64,
    pub level: MemoryPressureLevel,
    pub samples_taken: u64,
    pub level_transitions: u64,
    pub callback_panics: u64,
    pub last_sample_at: Option<SystemTime>,
}

type PressureCallback = Arc<dyn Fn(MemoryPressureLevel) + Send + Sync>;

/// Transitions waiting for their callbacks
#[derive(Default)]
struct Delivery {
    pending: VecDeque<MemoryPressureLevel>,
    delivering: bool,
}

struct MonitorInner {
    config: MemoryMonitorConfig,
    sampler: Arc<dyn MemorySampler>,
    metrics: RwLock<MemoryMetrics>,
    callbacks: RwLock<Vec<PressureCallback>>,
    delivery: Mutex<Delivery>,
    adaptive_hints: DashMap<String, usize>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl MonitorInner {
    fn check_now(&self) -> MemoryPressureLevel {
        let sample = self.sampler.sample();
        let limit = self.config.memory_limit_bytes.unwrap_or(sample.limit);
        let usage_percent = if limit == 0 {
            0.0
        } else {
            sample.heap_in_use as f64 / limit as f64 * 100.0
        };
        let level = self.config.classify(usage_percent);

        let previous = {
            let mut metrics = self.metrics.write();
            let previous = metrics.level;
            metrics.total_allocated = sample.total_allocated;
            metrics.heap_in_use = sample.heap_in_use;
            metrics.limit = limit;
            metrics.usage_percent = usage_percent;
            metrics.peak_heap_in_use = metrics.peak_heap_in_use.max(sample.heap_in_use);
            metrics.samples_taken += 1;
            metrics.last_sample_at = Some(SystemTime::now());
            if previous != level {
                metrics.level = level;
                metrics.level_transitions += 1;
                self.delivery.lock().pending.push_back(level);
            }
            previous
        };

        if previous != level {
            if level > previous {
                warn!(
                    "Memory pressure rising: {} -> {} ({:.1}% of {} bytes)",
                    previous, level, usage_percent, limit
                );
            } else {
                info!(
                    "Memory pressure easing: {} -> {} ({:.1}% of {} bytes)",
                    previous, level, usage_percent, limit
                );
            }
            self.deliver_pending();
        }

        level
    }

    /// Run callbacks for queued transitions unless another caller already is
    fn deliver_pending(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.delivering || delivery.pending.is_empty() {
                return;
            }
            delivery.delivering = true;
        }

        loop {
            let next = {
                let mut delivery = self.delivery.lock();
                match delivery.pending.pop_front() {
                    Some(level) => level,
                    None => {
                        delivery.delivering = false;
                        return;
                    }
                }
            };
            self.notify(next);
        }
    }

    fn notify(&self, level: MemoryPressureLevel) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(level))) {
                let err = TransportError::callback_panicked("memory pressure callback", payload);
                error!("{}", err);
                self.metrics.write().callback_panics += 1;
            }
        }
    }
}

/// Background sampler that classifies memory pressure
#[derive(Clone)]
pub struct MemoryPressureMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("config", &self.inner.config)
            .field("level", &self.current_level())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MemoryPressureMonitor {
    /// Monitor the current process through `sysinfo`
    pub fn new(config: MemoryMonitorConfig) -> Result<Self> {
        Self::with_sampler(config, Arc::new(SystemMemorySampler::new()))
    }

    pub fn with_sampler(config: MemoryMonitorConfig, sampler: Arc<dyn MemorySampler>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                sampler,
                metrics: RwLock::new(MemoryMetrics::default()),
                callbacks: RwLock::new(Vec::new()),
                delivery: Mutex::new(Delivery::default()),
                adaptive_hints: DashMap::new(),
                worker: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MemoryMonitorConfig {
        &self.inner.config
    }

    /// Start the background sampling loop. Must be called within a Tokio runtime.
    /// Calling it while already running does nothing.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            debug!("Memory monitor already running");
            return;
        }

        let token = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        let cancelled = token.clone();
        let interval = self.inner.config.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.check_now();
                    }
                }
            }
            debug!("Memory monitor loop exited");
        });

        *worker = Some((token, handle));
        info!("Memory monitor started (interval {:?})", interval);
    }

    /// Stop the background loop. Safe to call repeatedly or without `start`.
    pub fn stop(&self) {
        let Some((token, handle)) = self.inner.worker.lock().take() else {
            return;
        };
        token.cancel();
        drop(handle);
        info!("Memory monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Sample immediately, update metrics and fire callbacks on a transition.
    ///
    /// If another caller is already running callbacks, this transition is
    /// delivered by that caller after the ones queued before it.
    pub fn check_now(&self) -> MemoryPressureLevel {
        self.inner.check_now()
    }

    pub fn current_level(&self) -> MemoryPressureLevel {
        self.inner.metrics.read().level
    }

    pub fn metrics(&self) -> MemoryMetrics {
        self.inner.metrics.read().clone()
    }

    /// Register a callback fired once per level transition
    pub fn on_memory_pressure<F>(&self, callback: F)
    where
        F: Fn(MemoryPressureLevel) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().push(Arc::new(callback));
    }

    /// Buffer size hint for the current pressure level.
    ///
    /// `Normal` and `Low` return `base_size` unchanged, `High` halves it and
    /// `Critical` quarters it, never going below 1 for a non-zero base.
    pub fn get_adaptive_buffer_size(&self, name: &str, base_size: usize) -> usize {
        let size = match self.current_level() {
            MemoryPressureLevel::Normal | MemoryPressureLevel::Low => base_size,
            MemoryPressureLevel::High => base_size / 2,
            MemoryPressureLevel::Critical => base_size / 4,
        };
        let size = if base_size == 0 { 0 } else { size.max(1) };

        if let Some(previous) = self.inner.adaptive_hints.insert(name.to_string(), size) {
            if previous != size {
                debug!("Adaptive size for '{}' changed {} -> {}", name, previous, size);
            }
        }
        size
    }

    /// Last hint handed out for `name`
    pub fn adaptive_hint(&self, name: &str) -> Option<usize> {
        self.inner.adaptive_hints.get(name).map(|v| *v)
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        if let Some((token, _)) = self.worker.get_mut().take() {
            token.cancel();
        }
    }
}
