//! Metrics Collection for the Transport Manager
//!
//! Lock-free counters updated on the hot path and read as a consistent-enough
//! [`ManagerMetricsSnapshot`]. Every counter is monotonic, so a snapshot taken
//! while traffic flows may mix values from adjacent instants but never goes
//! backwards.
//!
//! ## Metrics Categories
//!
//! - **Lifecycle**: connection attempts/failures, transport switches
//! - **Throughput**: events sent and received, send failures
//! - **Latency**: average and maximum send latency
//! - **Errors**: asynchronous errors observed on the transport error channel

use crate::error::now_ns;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Live counters owned by a manager
#[derive(Debug)]
pub struct ManagerMetrics {
    start_time: Instant,
    transport_switches: AtomicU64,
    total_connections: AtomicU64,
    failed_connections: AtomicU64,
    events_sent: AtomicU64,
    events_received: AtomicU64,
    send_failures: AtomicU64,
    errors_received: AtomicU64,
    total_send_latency_ns: AtomicU64,
    max_send_latency_ns: AtomicU64,
    /// Nanoseconds since epoch, 0 when no switch happened yet
    last_transport_switch_ns: AtomicU64,
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            transport_switches: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            errors_received: AtomicU64::new(0),
            total_send_latency_ns: AtomicU64::new(0),
            max_send_latency_ns: AtomicU64::new(0),
            last_transport_switch_ns: AtomicU64::new(0),
        }
    }
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self, success: bool) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transport_switch(&self) {
        self.transport_switches.fetch_add(1, Ordering::Relaxed);
        self.last_transport_switch_ns
            .store(now_ns(), Ordering::Relaxed);
    }

    pub fn record_send(&self, latency: Duration) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        let latency_ns = latency.as_nanos() as u64;
        self.total_send_latency_ns
            .fetch_add(latency_ns, Ordering::Relaxed);
        self.max_send_latency_ns
            .fetch_max(latency_ns, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        let events_sent = self.events_sent.load(Ordering::Relaxed);
        let total_latency = self.total_send_latency_ns.load(Ordering::Relaxed);
        let switch_ns = self.last_transport_switch_ns.load(Ordering::Relaxed);

        ManagerMetricsSnapshot {
            transport_switches: self.transport_switches.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            events_sent,
            events_received: self.events_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            errors_received: self.errors_received.load(Ordering::Relaxed),
            average_send_latency_ns: if events_sent == 0 {
                0
            } else {
                total_latency / events_sent
            },
            max_send_latency_ns: self.max_send_latency_ns.load(Ordering::Relaxed),
            last_transport_switch: (switch_ns != 0)
                .then(|| UNIX_EPOCH + Duration::from_nanos(switch_ns)),
            uptime: self.start_time.elapsed(),
        }
    }
}

/// Point-in-time copy of [`ManagerMetrics`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerMetricsSnapshot {
    pub transport_switches: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub send_failures: u64,
    pub errors_received: u64,
    pub average_send_latency_ns: u64,
    pub max_send_latency_ns: u64,
    pub last_transport_switch: Option<SystemTime>,
    pub uptime: Duration,
}

/// Supported metrics export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsFormat {
    /// Prometheus text exposition format
    Prometheus,
    /// Human-readable table format
    Table,
}

impl ManagerMetricsSnapshot {
    /// Get connection success rate
    pub fn connection_success_rate(&self) -> f64 {
        if self.total_connections == 0 {
            return 1.0;
        }
        (self.total_connections - self.failed_connections) as f64 / self.total_connections as f64
    }

    /// Get send success rate
    pub fn send_success_rate(&self) -> f64 {
        let total = self.events_sent + self.send_failures;
        if total == 0 {
            return 1.0;
        }
        self.events_sent as f64 / total as f64
    }

    /// Render the snapshot for `manager`
    pub fn export(&self, manager: &str, format: MetricsFormat) -> String {
        let counters = [
            ("transport_switches_total", "Transport hot-swaps", self.transport_switches),
            ("connections_total", "Connection attempts", self.total_connections),
            ("connections_failed_total", "Failed connection attempts", self.failed_connections),
            ("events_sent_total", "Events sent through the transport", self.events_sent),
            ("events_received_total", "Events received from the transport", self.events_received),
            ("send_failures_total", "Failed sends", self.send_failures),
            ("errors_received_total", "Asynchronous transport errors", self.errors_received),
        ];

        let mut out = String::new();
        match format {
            MetricsFormat::Prometheus => {
                for (name, help, value) in counters {
                    let _ = writeln!(out, "# HELP event_transport_{} {}", name, help);
                    let _ = writeln!(out, "# TYPE event_transport_{} counter", name);
                    let _ = writeln!(
                        out,
                        "event_transport_{}{{manager=\"{}\"}} {}",
                        name, manager, value
                    );
                }
                let _ = writeln!(
                    out,
                    "# TYPE event_transport_send_latency_max_ns gauge\nevent_transport_send_latency_max_ns{{manager=\"{}\"}} {}",
                    manager, self.max_send_latency_ns
                );
            }
            MetricsFormat::Table => {
                let _ = writeln!(out, "Transport manager: {} (up {:?})", manager, self.uptime);
                for (name, _, value) in counters {
                    let _ = writeln!(out, "  {:<28} {:>12}", name, value);
                }
                let _ = writeln!(
                    out,
                    "  {:<28} {:>12}",
                    "send_latency_avg_ns", self.average_send_latency_ns
                );
                let _ = writeln!(
                    out,
                    "  {:<28} {:>12}",
                    "send_latency_max_ns", self.max_send_latency_ns
                );
            }
        }
        out
    }
}
