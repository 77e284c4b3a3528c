//! Configuration for the Transport Manager
//!
//! Programmatic configuration with presets, plus TOML loading for deployments:
//! - Backpressure strategy and buffer sizing
//! - Lifecycle timeouts (connect, close, drain)
//! - Memory monitor thresholds
//! - Cleanup scheduler defaults

use crate::backpressure::{BackpressureConfig, BackpressureStrategy};
use crate::cleanup::CleanupConfig;
use crate::memory::MemoryMonitorConfig;
use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`TransportManager`](crate::manager::TransportManager)
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Inbound buffer policy; `buffer_size` is the base for adaptive sizing
    pub backpressure: BackpressureConfig,
    /// Connection timeout per `start()`/hot-swap attempt
    pub connect_timeout: Duration,
    /// How long `close()` on a transport may take before it is abandoned
    pub close_timeout: Duration,
    /// How long a hot-swap waits for in-flight sends on the old transport
    pub drain_timeout: Duration,
    pub memory: MemoryMonitorConfig,
    pub cleanup: CleanupConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            memory: MemoryMonitorConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration optimized for fast failure detection
    pub fn fast_recovery() -> Self {
        Self {
            backpressure: BackpressureConfig::lossy_latest(1000),
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            memory: MemoryMonitorConfig::aggressive(),
            cleanup: CleanupConfig::aggressive(),
        }
    }

    /// Create a conservative configuration that never drops events silently
    pub fn conservative() -> Self {
        Self {
            backpressure: BackpressureConfig::lossless(1000, Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            memory: MemoryMonitorConfig::relaxed(),
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_memory(mut self, memory: MemoryMonitorConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Sanitize backpressure settings and reject values that cannot be fixed up
    pub fn validate(mut self) -> Result<Self> {
        self.backpressure = self.backpressure.sanitized();
        self.memory.validate()?;
        if self.connect_timeout.is_zero() {
            return Err(TransportError::invalid_config(
                "connect_timeout must be greater than zero",
            ));
        }
        if self.cleanup.check_interval.is_zero() {
            return Err(TransportError::invalid_config(
                "cleanup check_interval must be greater than zero",
            ));
        }
        Ok(self)
    }

    /// Parse from TOML; missing fields take their defaults
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let parsed: ManagerConfigToml = toml::from_str(toml_str)
            .map_err(|e| TransportError::invalid_config(format!("Failed to parse TOML: {}", e)))?;
        parsed.to_manager_config()?.validate()
    }

    /// Load from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransportError::invalid_config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }
}

/// Manager configuration in TOML format
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ManagerConfigToml {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Transport close timeout in milliseconds
    pub close_timeout_ms: Option<u64>,

    /// Hot-swap drain timeout in milliseconds
    pub drain_timeout_ms: Option<u64>,

    pub backpressure: Option<BackpressureToml>,

    pub memory: Option<MemoryToml>,

    pub cleanup: Option<CleanupToml>,
}

/// `[backpressure]` section
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BackpressureToml {
    /// One of `none`, `drop_oldest`, `drop_newest`, `block_timeout`
    pub strategy: Option<String>,
    pub buffer_size: Option<usize>,
    pub high_water_mark: Option<f64>,
    pub low_water_mark: Option<f64>,
    pub block_timeout_ms: Option<u64>,
    pub enable_metrics: Option<bool>,
}

/// `[memory]` section
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MemoryToml {
    pub monitor_interval_ms: Option<u64>,
    pub low_memory_percent: Option<f64>,
    pub high_memory_percent: Option<f64>,
    pub critical_memory_percent: Option<f64>,
    pub memory_limit_bytes: Option<u64>,
}

/// `[cleanup]` section
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CleanupToml {
    pub default_ttl_secs: Option<u64>,
    pub check_interval_secs: Option<u64>,
}

impl ManagerConfigToml {
    /// Convert TOML configuration to ManagerConfig
    pub fn to_manager_config(&self) -> Result<ManagerConfig> {
        let defaults = ManagerConfig::default();
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        let backpressure = match &self.backpressure {
            Some(bp) => {
                let base = defaults.backpressure.clone();
                BackpressureConfig {
                    strategy: match &bp.strategy {
                        Some(s) => s.parse::<BackpressureStrategy>()?,
                        None => base.strategy,
                    },
                    buffer_size: bp.buffer_size.unwrap_or(base.buffer_size),
                    high_water_mark: bp.high_water_mark.unwrap_or(base.high_water_mark),
                    low_water_mark: bp.low_water_mark.unwrap_or(base.low_water_mark),
                    block_timeout: millis(bp.block_timeout_ms, base.block_timeout),
                    enable_metrics: bp.enable_metrics.unwrap_or(base.enable_metrics),
                }
            }
            None => defaults.backpressure.clone(),
        };

        let memory = match &self.memory {
            Some(m) => {
                let base = defaults.memory.clone();
                MemoryMonitorConfig {
                    monitor_interval: millis(m.monitor_interval_ms, base.monitor_interval),
                    low_memory_percent: m.low_memory_percent.unwrap_or(base.low_memory_percent),
                    high_memory_percent: m.high_memory_percent.unwrap_or(base.high_memory_percent),
                    critical_memory_percent: m
                        .critical_memory_percent
                        .unwrap_or(base.critical_memory_percent),
                    memory_limit_bytes: m.memory_limit_bytes.or(base.memory_limit_bytes),
                }
            }
            None => defaults.memory.clone(),
        };

        let cleanup = match &self.cleanup {
            Some(c) => CleanupConfig {
                default_ttl: c
                    .default_ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cleanup.default_ttl),
                check_interval: c
                    .check_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cleanup.check_interval),
            },
            None => defaults.cleanup.clone(),
        };

        Ok(ManagerConfig {
            backpressure,
            connect_timeout: millis(self.connect_timeout_ms, defaults.connect_timeout),
            close_timeout: millis(self.close_timeout_ms, defaults.close_timeout),
            drain_timeout: millis(self.drain_timeout_ms, defaults.drain_timeout),
            memory,
            cleanup,
        })
    }
}
