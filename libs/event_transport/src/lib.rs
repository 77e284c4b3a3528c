//! # Event Transport
//!
//! In-process buffering and lifecycle layer between application code and a
//! pluggable network [`Transport`].
//!
//! - [`RingBuffer`]: fixed-capacity concurrent circular buffer with overflow policies
//! - [`BackpressureHandler`]: block / drop-oldest / drop-newest / reject with metrics
//! - [`MemoryPressureMonitor`]: samples process memory, emits sizing hints and callbacks
//! - [`CleanupManager`]: periodic TTL sweeps of auxiliary stores
//! - [`TransportManager`]: lifecycle façade with safe transport hot-swap
//!
//! ```no_run
//! use event_transport::{ManagerConfig, TransportEvent, TransportManager};
//! use event_transport::test_utils::MockTransport;
//! use std::sync::Arc;
//!
//! # async fn run() -> event_transport::Result<()> {
//! let manager = TransportManager::<TransportEvent>::new(ManagerConfig::default())?;
//! manager.set_transport(Arc::new(MockTransport::new())).await?;
//! manager.start().await?;
//!
//! manager.send(TransportEvent::new("ping", &b"{}"[..])).await?;
//! if let Some(event) = manager.receive().recv().await {
//!     println!("received {:?}", event);
//! }
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod ring_buffer;
pub mod state;
pub mod test_utils;
pub mod transport;

pub use backpressure::{
    BackpressureConfig, BackpressureHandler, BackpressureMetrics, BackpressureStrategy,
};
pub use cleanup::{
    sweep_expired, ttl_sweeper, CleanupConfig, CleanupManager, CleanupMetrics, TaskStats,
};
pub use config::{BackpressureToml, CleanupToml, ManagerConfig, ManagerConfigToml, MemoryToml};
pub use error::{Result, SendContext, TransportError};
pub use event::{Event, TransportEvent};
pub use manager::{TransportManager, EVENT_BUFFER_NAME};
pub use memory::{
    MemoryMetrics, MemoryMonitorConfig, MemoryPressureLevel, MemoryPressureMonitor, MemorySample,
    MemorySampler, SystemMemorySampler,
};
pub use metrics::{ManagerMetrics, ManagerMetricsSnapshot, MetricsFormat};
pub use ring_buffer::{
    EventReceiver, OverflowPolicy, PushOutcome, RingBuffer, RingBufferConfig, RingBufferStats,
};
pub use state::{ConnectionState, ManagerState};
pub use transport::Transport;
