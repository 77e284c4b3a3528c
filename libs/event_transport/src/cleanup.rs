//! Periodic Cleanup Scheduler
//!
//! Runs registered sweep functions on independent timers to bound the growth of
//! auxiliary stores (pending-request tables, handler maps, caches).
//!
//! ## Guarantees
//!
//! - Each task has its own timer; different tasks run concurrently.
//! - A single task never overlaps with itself. A tick that fires while the
//!   previous run is still executing is skipped and counted, never queued.
//! - Sweeps run on the blocking pool. A panicking sweep is recovered and
//!   recorded against the task; the scheduler keeps going.

use crate::{Result, TransportError};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SweepFn = Arc<dyn Fn(Duration) -> Result<usize> + Send + Sync>;

/// Configuration for the cleanup manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    /// TTL attached to tasks registered without one
    pub default_ttl: Duration,
    /// Interval used for tasks registered with a zero interval
    pub check_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl CleanupConfig {
    /// Short TTLs for memory-constrained deployments
    pub fn aggressive() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// Per-task statistics
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStats {
    pub name: String,
    pub interval: Duration,
    pub ttl: Duration,
    pub runs: u64,
    pub items_removed: u64,
    pub errors: u64,
    pub panics: u64,
    pub skipped_ticks: u64,
    pub last_run_at: Option<SystemTime>,
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

/// Aggregate statistics across all registered tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupMetrics {
    pub tasks_registered: usize,
    pub total_runs: u64,
    pub total_items_removed: u64,
    pub total_errors: u64,
    pub total_panics: u64,
    pub total_skipped: u64,
}

struct TaskEntry {
    name: String,
    interval: Duration,
    ttl: Duration,
    sweep: SweepFn,
    running: AtomicBool,
    stats: Mutex<TaskStats>,
    timer: Mutex<Option<CancellationToken>>,
}

impl TaskEntry {
    fn try_acquire(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn record_skip(&self) {
        self.stats.lock().skipped_ticks += 1;
        debug!("Cleanup task '{}' still running, tick skipped", self.name);
    }

    /// Run the sweep once. Caller must hold the running flag.
    fn execute(&self) -> Result<usize> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.sweep)(self.ttl)));
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(TransportError::callback_panicked(
                format!("cleanup task '{}'", self.name),
                payload,
            )),
        };

        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.last_run_at = Some(SystemTime::now());
        stats.last_duration = Some(elapsed);
        match &result {
            Ok(removed) => {
                stats.items_removed += *removed as u64;
                stats.last_error = None;
                if *removed > 0 {
                    debug!(
                        "Cleanup task '{}' removed {} items in {:?}",
                        self.name, removed, elapsed
                    );
                }
            }
            Err(err @ TransportError::CallbackPanicked { .. }) => {
                stats.panics += 1;
                stats.last_error = Some(err.to_string());
                error!("{}", err);
            }
            Err(err) => {
                stats.errors += 1;
                stats.last_error = Some(err.to_string());
                warn!("Cleanup task '{}' failed: {}", self.name, err);
            }
        }
        result
    }
}

/// Resets the running flag when the sweep finishes, or when it never started
struct RunningGuard(Arc<TaskEntry>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Run a task once on the blocking pool. `None` means a run was already in progress.
async fn run_entry(entry: Arc<TaskEntry>) -> Option<Result<usize>> {
    if !entry.try_acquire() {
        entry.record_skip();
        return None;
    }

    let guard = RunningGuard(Arc::clone(&entry));
    let joined = tokio::task::spawn_blocking(move || {
        let guard = guard;
        guard.0.execute()
    })
    .await;

    match joined {
        Ok(result) => Some(result),
        Err(e) => Some(Err(TransportError::Other(format!(
            "cleanup task '{}' did not complete: {}",
            entry.name, e
        )))),
    }
}

fn spawn_timer(entry: Arc<TaskEntry>, token: CancellationToken) {
    *entry.timer.lock() = Some(token.clone());
    let interval = entry.interval;

    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if entry.running.load(Ordering::Acquire) {
                        entry.record_skip();
                        continue;
                    }
                    // Detached so a slow sweep shows up as skipped ticks
                    tokio::spawn(run_entry(Arc::clone(&entry)));
                }
            }
        }
        debug!("Cleanup timer for '{}' exited", entry.name);
    });
}

struct CleanupInner {
    config: CleanupConfig,
    tasks: DashMap<String, Arc<TaskEntry>>,
    /// Root token while running
    lifecycle: Mutex<Option<CancellationToken>>,
}

/// Scheduler for named periodic sweep tasks
#[derive(Clone)]
pub struct CleanupManager {
    inner: Arc<CleanupInner>,
}

impl std::fmt::Debug for CleanupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupManager")
            .field("config", &self.inner.config)
            .field("tasks", &self.task_names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self::new(CleanupConfig::default())
    }
}

impl CleanupManager {
    pub fn new(config: CleanupConfig) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                config,
                tasks: DashMap::new(),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.inner.config
    }

    /// Register a sweep that runs every `interval` with the default TTL.
    ///
    /// Names are unique; registering an existing name fails with `DuplicateTask`.
    pub fn register_task<F>(&self, name: impl Into<String>, interval: Duration, sweep: F) -> Result<()>
    where
        F: Fn() -> Result<usize> + Send + Sync + 'static,
    {
        let ttl = self.inner.config.default_ttl;
        self.register(name.into(), interval, ttl, Arc::new(move |_| sweep()))
    }

    /// Register a sweep that receives its TTL on every run
    pub fn register_task_with_ttl<F>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        ttl: Duration,
        sweep: F,
    ) -> Result<()>
    where
        F: Fn(Duration) -> Result<usize> + Send + Sync + 'static,
    {
        let ttl = if ttl.is_zero() {
            self.inner.config.default_ttl
        } else {
            ttl
        };
        self.register(name.into(), interval, ttl, Arc::new(sweep))
    }

    fn register(&self, name: String, interval: Duration, ttl: Duration, sweep: SweepFn) -> Result<()> {
        if name.trim().is_empty() {
            return Err(TransportError::invalid_config(
                "cleanup task name must not be empty",
            ));
        }
        let interval = if interval.is_zero() {
            self.inner.config.check_interval
        } else {
            interval
        };

        // Lifecycle lock first so a concurrent start/stop sees the task or not at all
        let lifecycle = self.inner.lifecycle.lock();
        let entry = match self.inner.tasks.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::DuplicateTask(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let entry = Arc::new(TaskEntry {
                    name: name.clone(),
                    interval,
                    ttl,
                    sweep,
                    running: AtomicBool::new(false),
                    stats: Mutex::new(TaskStats {
                        name: name.clone(),
                        interval,
                        ttl,
                        runs: 0,
                        items_removed: 0,
                        errors: 0,
                        panics: 0,
                        skipped_ticks: 0,
                        last_run_at: None,
                        last_duration: None,
                        last_error: None,
                    }),
                    timer: Mutex::new(None),
                });
                slot.insert(Arc::clone(&entry));
                entry
            }
        };

        if let Some(root) = lifecycle.as_ref() {
            spawn_timer(entry, root.child_token());
        }
        debug!("Registered cleanup task '{}' every {:?}", name, interval);
        Ok(())
    }

    /// Remove a task and stop its timer. A run already in progress finishes.
    pub fn unregister_task(&self, name: &str) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        let (_, entry) = self
            .inner
            .tasks
            .remove(name)
            .ok_or_else(|| TransportError::TaskNotFound(name.to_string()))?;
        if let Some(timer) = entry.timer.lock().take() {
            timer.cancel();
        }
        debug!("Unregistered cleanup task '{}'", name);
        Ok(())
    }

    /// Start every task timer. Must be called within a Tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.is_some() {
            return;
        }
        let root = CancellationToken::new();
        for task in self.inner.tasks.iter() {
            spawn_timer(Arc::clone(task.value()), root.child_token());
        }
        *lifecycle = Some(root);
        info!(
            "Cleanup manager started with {} tasks",
            self.inner.tasks.len()
        );
    }

    /// Stop every task timer. In-flight sweeps finish on their own. Idempotent.
    pub fn stop(&self) {
        let Some(root) = self.inner.lifecycle.lock().take() else {
            return;
        };
        root.cancel();
        for task in self.inner.tasks.iter() {
            task.timer.lock().take();
        }
        info!("Cleanup manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().is_some()
    }

    /// Run a task immediately, outside its schedule.
    ///
    /// Returns `Ok(None)` when the task is already running; the no-overlap
    /// guard applies to manual runs too.
    pub async fn run_task_now(&self, name: &str) -> Result<Option<usize>> {
        let entry = self
            .inner
            .tasks
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TransportError::TaskNotFound(name.to_string()))?;

        match run_entry(entry).await {
            None => Ok(None),
            Some(result) => result.map(Some),
        }
    }

    /// Run every registered task once, concurrently
    pub async fn run_all_now(&self) -> Vec<(String, Result<Option<usize>>)> {
        let entries: Vec<Arc<TaskEntry>> = self
            .inner
            .tasks
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let runs = entries.into_iter().map(|entry| {
            let name = entry.name.clone();
            let handle = tokio::spawn(run_entry(entry));
            async move {
                let result = match handle.await {
                    Ok(None) => Ok(None),
                    Ok(Some(result)) => result.map(Some),
                    Err(e) => Err(TransportError::Other(e.to_string())),
                };
                (name, result)
            }
        });
        join_all(runs).await
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tasks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn task_stats(&self, name: &str) -> Option<TaskStats> {
        self.inner.tasks.get(name).map(|e| e.stats.lock().clone())
    }

    pub fn metrics(&self) -> CleanupMetrics {
        let mut metrics = CleanupMetrics::default();
        for task in self.inner.tasks.iter() {
            let stats = task.stats.lock();
            metrics.tasks_registered += 1;
            metrics.total_runs += stats.runs;
            metrics.total_items_removed += stats.items_removed;
            metrics.total_errors += stats.errors;
            metrics.total_panics += stats.panics;
            metrics.total_skipped += stats.skipped_ticks;
        }
        metrics
    }
}

impl Drop for CleanupInner {
    fn drop(&mut self) {
        if let Some(root) = self.lifecycle.get_mut().take() {
            root.cancel();
        }
    }
}

/// Remove every entry of `map` whose timestamp is older than `now - ttl`,
/// returning the number removed
pub fn sweep_expired<K, V, F>(map: &DashMap<K, V>, timestamp: F, ttl: Duration) -> usize
where
    K: Eq + Hash,
    F: Fn(&V) -> Instant,
{
    let now = Instant::now();
    let mut removed = 0;
    map.retain(|_, value| {
        let expired = now.saturating_duration_since(timestamp(value)) > ttl;
        if expired {
            removed += 1;
        }
        !expired
    });
    removed
}

/// Build a sweep function over a shared concurrent map, suitable for
/// [`CleanupManager::register_task`]
pub fn ttl_sweeper<K, V, F>(
    map: Arc<DashMap<K, V>>,
    timestamp: F,
    ttl: Duration,
) -> impl Fn() -> Result<usize> + Send + Sync + 'static
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&V) -> Instant + Send + Sync + 'static,
{
    move || Ok(sweep_expired(&map, &timestamp, ttl))
}
