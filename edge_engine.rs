//! # Edge Engine - Metric Scheduling & Collection Core
//!
//! The scheduling heart of the edge agent. It decides, across a dynamic set of
//! independently configured metrics, *when* each metric should be sampled, runs
//! the sampling work on a bounded worker pool, buffers the samples per metric
//! and hands full buffers to a delivery stage that forwards them to a remote
//! data-center component.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               EDGE ENGINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  register() → READY QUEUE → EVENT CHECKER → COLLECT QUEUE → COLLECTORS   │
//! │                   ▲                                          │     │     │
//! │                   └────────────── reschedule ────────────────┘     │     │
//! │                                                 SEND QUEUE ◄────────┘     │
//! │                                                     │                    │
//! │                                                SEND WORKER → MetricSink  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A scheduled metric is a single owned value. It is moved from queue to queue
//! and only ever touched by whichever thread popped it last, so no per-metric
//! lock exists. Liveness and counters are shared with the caller's
//! [`MetricHandle`] through an `Arc`.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::io::Write;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Crossbeam & Parking Lot
// ----------------------------------------------------------------------------
use crossbeam_channel::{
    bounded, unbounded, Receiver, SendTimeoutError, Sender, TrySendError,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounter, IntGauge, Registry as PrometheusRegistry, TextEncoder};

// ----------------------------------------------------------------------------
// System Information
// ----------------------------------------------------------------------------
use sysinfo::System;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "edge-agent-engine";
pub const ENGINE_FULL_NAME: &str = "Edge Agent Metric Engine";

// ----------------------------------------------------------------------------
// Worker Pool & Queues
// ----------------------------------------------------------------------------

/// Default number of collection workers
pub const DEFAULT_COLLECTION_WORKERS: usize = 4;

/// Maximum collection workers
pub const MAX_COLLECTION_WORKERS: usize = 256;

/// Default capacity of the bounded collection queue
pub const DEFAULT_COLLECT_QUEUE_CAPACITY: usize = 64;

/// Default stack size for engine threads (bytes)
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

/// Default sampling interval for configured metrics (milliseconds)
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 1000;

/// Scheduler tick: the longest a blocked engine thread goes without
/// re-checking its running flag (milliseconds)
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 100;

/// Default deadline for joining engine threads on terminate (milliseconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default interval between pool statistics log lines (seconds)
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Poll step used while joining threads
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Metric Limits
// ----------------------------------------------------------------------------

/// Maximum metric name length
pub const MAX_METRIC_NAME_LENGTH: usize = 256;

/// Longest accepted sampling interval (one week)
pub const MAX_SAMPLING_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Largest accepted aggregation size
pub const MAX_AGGREGATION_SIZE: usize = 65_536;

/// Upper bound on the samples pre-allocated per aggregation buffer
const BUFFER_PREALLOC_LIMIT: usize = 1024;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
///
/// Sample timestamps use wall-clock time so they mean something to the
/// receiving side; scheduling deadlines use the monotonic [`Instant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Identity
// ----------------------------------------------------------------------------

/// Engine-unique identifier handed out at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MetricId(u64);

impl MetricId {
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for MetricId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "m-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Values
// ----------------------------------------------------------------------------

/// A single sampled value. The engine never interprets it; it is carried
/// from the sampler to the sink untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    /// A monotonically increasing counter
    Counter(u64),
    /// A value that can go up and down
    Gauge(f64),
    /// An integer gauge
    GaugeInt(i64),
    /// Up/down style flags
    Boolean(bool),
    /// Free-form text (states, versions)
    Text(CompactString),
}

impl MetricValue {
    /// Get the value as a float (for numeric types)
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Counter(v) => Some(*v as f64),
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::GaugeInt(v) => Some(*v as f64),
            MetricValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            MetricValue::Text(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Counter(_) => "counter",
            MetricValue::Gauge(_) => "gauge",
            MetricValue::GaugeInt(_) => "gauge_int",
            MetricValue::Boolean(_) => "boolean",
            MetricValue::Text(_) => "text",
        }
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(v) => write!(f, "{}", v),
            MetricValue::Gauge(v) => write!(f, "{:.6}", v),
            MetricValue::GaugeInt(v) => write!(f, "{}", v),
            MetricValue::Boolean(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Counter(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::GaugeInt(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Gauge(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Gauge(v as f64)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Boolean(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v.into())
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.into())
    }
}

/// One `(timestamp, value)` pair in a metric's aggregation buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: MetricValue,
}

impl Sample {
    pub fn new(timestamp: Timestamp, value: impl Into<MetricValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Metric Info
// ----------------------------------------------------------------------------

/// Immutable identity of a registered metric, as seen by sinks.
#[derive(Debug, Clone)]
pub struct MetricInfo {
    pub id: MetricId,
    pub name: CompactString,
    /// Unit tag, never interpreted by the engine
    pub unit: Option<CompactString>,
    /// Owning resource (device, sensor, host), opaque to the engine
    pub entity: Option<CompactString>,
    pub interval: Duration,
    pub aggregation_size: usize,
}

impl MetricInfo {
    /// Interval zero marks an event-driven metric whose sampler blocks
    /// until data arrives.
    pub fn is_event_driven(&self) -> bool {
        self.interval.is_zero()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Sampling and delivery errors are contained at the worker boundary and only
// ever logged. Configuration and lifecycle errors are the only ones returned
// to callers.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid metric '{name}': {message}")]
    InvalidMetric { name: String, message: String },

    #[error("Failed to spawn thread '{name}': {message}")]
    ThreadSpawn { name: String, message: String },

    #[error("Observability error: {0}")]
    Observability(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Engine has been terminated")]
    ShuttingDown,
}

impl EngineError {
    pub fn invalid_metric(name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidMetric {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::InvalidMetric { .. } => true,
            EngineError::ThreadSpawn { .. } => false,
            EngineError::Observability(_) => false,
            EngineError::Io(_) => true,
            EngineError::Internal(_) => false,
            EngineError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::InvalidMetric { .. } => "metric",
            EngineError::ThreadSpawn { .. } => "system",
            EngineError::Observability(_) => "observability",
            EngineError::Io(_) => "io",
            EngineError::Internal(_) => "internal",
            EngineError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Sampling & Delivery Errors
// ----------------------------------------------------------------------------

/// Failure of a single sampling cycle. Never fatal for the metric.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("sampling failed: {message}")]
    Failed { message: String },

    #[error("sampler panicked: {message}")]
    Panicked { message: String },

    #[error("sampling IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SampleError {
    pub fn failed(message: impl Into<String>) -> Self {
        SampleError::Failed {
            message: message.into(),
        }
    }
}

/// Failure of a single delivery. The batch is lost; no retry at this layer.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery failed: {message}")]
    Failed { message: String },

    #[error("sink panicked: {message}")]
    Panicked { message: String },

    #[error("delivery IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    pub fn failed(message: impl Into<String>) -> Self {
        DeliveryError::Failed {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result of one sampling cycle; `Ok(None)` means "no data this cycle"
pub type SampleResult = Result<Option<MetricValue>, SampleError>;

/// Result of one delivery
pub type DeliveryResult = Result<(), DeliveryError>;

/// Extract a readable message from a caught panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file parsing with EDGE_-prefixed environment overrides, serde defaults
// for every field and validation before anything is started.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine and the agent built on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Collection worker pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Send queue behaviour
    #[serde(default)]
    pub send: SendConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Host metrics registered by the agent binary
    #[serde(default)]
    pub metrics: Vec<BuiltinMetricConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            pool: PoolConfig::default(),
            send: SendConfig::default(),
            logging: LoggingConfig::default(),
            metrics: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("EDGE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no environment overrides)
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 || self.pool.workers > MAX_COLLECTION_WORKERS {
            return Err(ConfigError::invalid_value(
                "pool.workers",
                format!("must be between 1 and {}", MAX_COLLECTION_WORKERS),
            ));
        }

        if self.pool.collect_queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "pool.collect_queue_capacity",
                "must be at least 1",
            ));
        }

        if self.send.queue_capacity == Some(0) {
            return Err(ConfigError::invalid_value(
                "send.queue_capacity",
                "must be at least 1 when set",
            ));
        }

        if self.engine.scheduler_tick_ms == 0 {
            return Err(ConfigError::invalid_value(
                "engine.scheduler_tick_ms",
                "must be greater than zero",
            ));
        }

        if self.engine.shutdown_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "engine.shutdown_timeout_ms",
                "must be greater than zero",
            ));
        }

        for (i, metric) in self.metrics.iter().enumerate() {
            if metric.name.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("metrics[{}].name", i),
                    "must not be empty",
                ));
            }
            if metric.aggregation_size == 0 || metric.aggregation_size > MAX_AGGREGATION_SIZE {
                return Err(ConfigError::invalid_value(
                    format!("metrics[{}].aggregation_size", i),
                    format!("must be between 1 and {}", MAX_AGGREGATION_SIZE),
                ));
            }
            if Duration::from_millis(metric.interval_ms) > MAX_SAMPLING_INTERVAL {
                return Err(ConfigError::invalid_value(
                    format!("metrics[{}].interval_ms", i),
                    format!("must not exceed {}", MAX_SAMPLING_INTERVAL.as_millis()),
                ));
            }
        }

        Ok(())
    }

    /// Example configuration with a couple of host metrics
    pub fn example() -> Self {
        Self {
            metrics: vec![
                BuiltinMetricConfig {
                    name: "host.heartbeat".into(),
                    kind: BuiltinMetricKind::Heartbeat,
                    interval_ms: 5_000,
                    aggregation_size: 1,
                    unit: None,
                    entity: None,
                },
                BuiltinMetricConfig {
                    name: "host.cpu.usage".into(),
                    kind: BuiltinMetricKind::CpuUsage,
                    interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
                    aggregation_size: 10,
                    unit: None,
                    entity: None,
                },
            ],
            ..Self::default()
        }
    }

    /// Render the example configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.engine.scheduler_tick_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.shutdown_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Longest a blocked engine thread waits before re-checking shutdown
    #[serde(default = "default_scheduler_tick")]
    pub scheduler_tick_ms: u64,

    /// Deadline for joining engine threads on terminate
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Interval between pool statistics log lines (agent binary)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            scheduler_tick_ms: default_scheduler_tick(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_instance_name() -> String {
    "edge-agent".into()
}

fn default_scheduler_tick() -> u64 {
    DEFAULT_SCHEDULER_TICK_MS
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Worker Pool Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of collection workers; bounds sampling concurrency
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the collection queue between the event checker and workers
    #[serde(default = "default_collect_queue")]
    pub collect_queue_capacity: usize,

    /// Thread stack size in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            collect_queue_capacity: default_collect_queue(),
            stack_size: default_stack_size(),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_COLLECTION_WORKERS
}

fn default_collect_queue() -> usize {
    DEFAULT_COLLECT_QUEUE_CAPACITY
}

fn default_stack_size() -> usize {
    DEFAULT_THREAD_STACK_SIZE
}

// ----------------------------------------------------------------------------
// 5.4 Send Queue Configuration
// ----------------------------------------------------------------------------

/// What a collector does when a bounded send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the collector until the sender catches up
    #[default]
    Block,
    /// Drop the batch that was about to be queued
    DropNewest,
    /// Evict the oldest queued batch to make room
    DropOldest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendConfig {
    /// Send queue bound; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    /// Applied only when `queue_capacity` is set
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.6 Built-in Metric Configuration
// ----------------------------------------------------------------------------

/// A host metric the agent registers at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinMetricConfig {
    pub name: String,

    pub kind: BuiltinMetricKind,

    /// Sampling interval; 0 samples back-to-back
    #[serde(default = "default_sampling_interval")]
    pub interval_ms: u64,

    /// Samples buffered before a delivery
    #[serde(default = "default_aggregation_size")]
    pub aggregation_size: usize,

    /// Unit override; the kind's default unit otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

fn default_sampling_interval() -> u64 {
    DEFAULT_SAMPLING_INTERVAL_MS
}

fn default_aggregation_size() -> usize {
    1
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// Logs go to stderr so that sinks writing to stdout stay machine-readable.
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    result.map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "edge::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: ENGINE SELF-METRICS
// ============================================================================

/// Prometheus counters describing what the engine itself is doing.
///
/// Each engine owns a private registry so several engines can live in one
/// process without name clashes.
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    pub samples_collected: IntCounter,
    pub sampling_failures: IntCounter,
    pub deliveries: IntCounter,
    pub delivery_failures: IntCounter,
    pub dead_discarded: IntCounter,
    pub deliveries_dropped: IntCounter,
    pub registered_metrics: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = PrometheusRegistry::new();

        let samples_collected = IntCounter::new(
            "edge_engine_samples_collected_total",
            "Samples appended to aggregation buffers",
        )?;
        let sampling_failures = IntCounter::new(
            "edge_engine_sampling_failures_total",
            "Sampling cycles that returned an error or panicked",
        )?;
        let deliveries = IntCounter::new(
            "edge_engine_deliveries_total",
            "Batches handed to sinks successfully",
        )?;
        let delivery_failures = IntCounter::new(
            "edge_engine_delivery_failures_total",
            "Batches whose sink returned an error or panicked",
        )?;
        let dead_discarded = IntCounter::new(
            "edge_engine_dead_discarded_total",
            "Unregistered metrics or batches dropped at a queue boundary",
        )?;
        let deliveries_dropped = IntCounter::new(
            "edge_engine_deliveries_dropped_total",
            "Batches dropped by the send queue overflow policy",
        )?;
        let registered_metrics = IntGauge::new(
            "edge_engine_registered_metrics",
            "Metrics currently registered",
        )?;

        registry.register(Box::new(samples_collected.clone()))?;
        registry.register(Box::new(sampling_failures.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(delivery_failures.clone()))?;
        registry.register(Box::new(dead_discarded.clone()))?;
        registry.register(Box::new(deliveries_dropped.clone()))?;
        registry.register(Box::new(registered_metrics.clone()))?;

        Ok(Self {
            registry,
            samples_collected,
            sampling_failures,
            deliveries,
            delivery_failures,
            dead_discarded,
            deliveries_dropped,
            registered_metrics,
        })
    }

    /// Prometheus text exposition of all engine counters
    pub fn render(&self) -> EngineResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Internal(e.to_string()))
    }
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("samples_collected", &self.samples_collected.get())
            .field("sampling_failures", &self.sampling_failures.get())
            .field("deliveries", &self.deliveries.get())
            .field("delivery_failures", &self.delivery_failures.get())
            .field("dead_discarded", &self.dead_discarded.get())
            .finish()
    }
}

// ============================================================================
// SECTION 8: CORE & CONFIG TESTS
// ============================================================================


// ============================================================================
// SECTION 9: METRIC MODEL
// ============================================================================
// A metric is split in two:
// - `MetricCore`: identity, liveness flag and counters, shared by `Arc` with
//   the caller's handle and with in-flight deliveries.
// - `ScheduledMetric`: the sampler, the deadline and the aggregation buffer,
//   owned by exactly one queue or worker at a time.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Sampler & Sink Traits
// ----------------------------------------------------------------------------

/// Produces one value per call. Called repeatedly from collection workers,
/// never concurrently for the same metric.
///
/// Event-driven metrics (interval zero) may block inside `sample` until data
/// arrives; they occupy a collection worker while doing so.
pub trait Sampler: Send {
    fn sample(&mut self) -> SampleResult;
}

impl<F> Sampler for F
where
    F: FnMut() -> SampleResult + Send,
{
    fn sample(&mut self) -> SampleResult {
        self()
    }
}

/// Delivery callback for full aggregation buffers. Implemented by transport
/// and DCC adapters; shared between every metric that publishes through it.
pub trait MetricSink: Send + Sync {
    fn deliver(&self, metric: &MetricInfo, samples: &[Sample]) -> DeliveryResult;
}

impl<F> MetricSink for F
where
    F: Fn(&MetricInfo, &[Sample]) -> DeliveryResult + Send + Sync,
{
    fn deliver(&self, metric: &MetricInfo, samples: &[Sample]) -> DeliveryResult {
        self(metric, samples)
    }
}

/// Pins a closure to the [`Sampler`] signature so its return type is inferred.
pub fn sampler_fn<F>(f: F) -> F
where
    F: FnMut() -> SampleResult + Send,
{
    f
}

/// Pins a closure to the [`MetricSink`] signature.
pub fn sink_fn<F>(f: F) -> F
where
    F: Fn(&MetricInfo, &[Sample]) -> DeliveryResult + Send + Sync,
{
    f
}

// ----------------------------------------------------------------------------
// 9.2 Metric Definition
// ----------------------------------------------------------------------------

/// Everything needed to register a metric.
pub struct MetricDefinition {
    name: CompactString,
    unit: Option<CompactString>,
    entity: Option<CompactString>,
    interval: Duration,
    aggregation_size: usize,
    sampler: Box<dyn Sampler>,
    sink: Arc<dyn MetricSink>,
}

impl MetricDefinition {
    /// New definition sampled every second and delivered sample by sample.
    pub fn new(
        name: impl Into<CompactString>,
        sampler: impl Sampler + 'static,
        sink: Arc<dyn MetricSink>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: None,
            entity: None,
            interval: Duration::from_millis(DEFAULT_SAMPLING_INTERVAL_MS),
            aggregation_size: 1,
            sampler: Box::new(sampler),
            sink,
        }
    }

    pub fn unit(mut self, unit: impl Into<CompactString>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn entity(mut self, entity: impl Into<CompactString>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Sampling period; zero marks an event-driven metric
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Samples buffered before the sink is called
    pub fn aggregation_size(mut self, size: usize) -> Self {
        self.aggregation_size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_metric(self.name.as_str(), "name must not be empty"));
        }
        if self.name.len() > MAX_METRIC_NAME_LENGTH {
            return Err(EngineError::invalid_metric(
                self.name.as_str(),
                format!("name longer than {} bytes", MAX_METRIC_NAME_LENGTH),
            ));
        }
        if self.aggregation_size == 0 || self.aggregation_size > MAX_AGGREGATION_SIZE {
            return Err(EngineError::invalid_metric(
                self.name.as_str(),
                format!("aggregation size must be between 1 and {}", MAX_AGGREGATION_SIZE),
            ));
        }
        if self.interval > MAX_SAMPLING_INTERVAL {
            return Err(EngineError::invalid_metric(
                self.name.as_str(),
                format!("interval longer than {:?}", MAX_SAMPLING_INTERVAL),
            ));
        }
        Ok(())
    }

    /// Split into the caller's handle and the schedulable value, first due
    /// at `first_run`.
    pub fn schedule(self, id: MetricId, first_run: Instant) -> (MetricHandle, ScheduledMetric) {
        let core = Arc::new(MetricCore {
            info: MetricInfo {
                id,
                name: self.name,
                unit: self.unit,
                entity: self.entity,
                interval: self.interval,
                aggregation_size: self.aggregation_size,
            },
            alive: AtomicBool::new(true),
            counters: MetricCounters::default(),
        });

        let scheduled = ScheduledMetric {
            core: core.clone(),
            sampler: self.sampler,
            sink: self.sink,
            next_run_time: first_run,
            buffer: Vec::with_capacity(self.aggregation_size.min(BUFFER_PREALLOC_LIMIT)),
        };

        (MetricHandle { core }, scheduled)
    }
}

impl Debug for MetricDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("entity", &self.entity)
            .field("interval", &self.interval)
            .field("aggregation_size", &self.aggregation_size)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 9.3 Shared Core & Counters
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MetricCounters {
    samples: AtomicU64,
    sampling_failures: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Per-metric counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricStats {
    pub samples_collected: u64,
    pub sampling_failures: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

#[derive(Debug)]
struct MetricCore {
    info: MetricInfo,
    alive: AtomicBool,
    counters: MetricCounters,
}

impl MetricCore {
    #[inline]
    fn is_alive(&self) -> bool {
        self.alive.load(AtomicOrdering::Acquire)
    }

    /// Returns whether the metric was alive before the call
    fn mark_dead(&self) -> bool {
        self.alive.swap(false, AtomicOrdering::AcqRel)
    }

    fn stats(&self) -> MetricStats {
        MetricStats {
            samples_collected: self.counters.samples.load(AtomicOrdering::Relaxed),
            sampling_failures: self.counters.sampling_failures.load(AtomicOrdering::Relaxed),
            deliveries: self.counters.deliveries.load(AtomicOrdering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.4 Metric Handle
// ----------------------------------------------------------------------------

/// Caller-side reference to a registered metric.
#[derive(Debug, Clone)]
pub struct MetricHandle {
    core: Arc<MetricCore>,
}

impl MetricHandle {
    pub fn id(&self) -> MetricId {
        self.core.info.id
    }

    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    pub fn info(&self) -> &MetricInfo {
        &self.core.info
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub fn stats(&self) -> MetricStats {
        self.core.stats()
    }
}

// ----------------------------------------------------------------------------
// 9.5 Scheduled Metric
// ----------------------------------------------------------------------------

/// The schedulable half of a metric. Moved between queues; never shared.
pub struct ScheduledMetric {
    core: Arc<MetricCore>,
    sampler: Box<dyn Sampler>,
    sink: Arc<dyn MetricSink>,
    next_run_time: Instant,
    buffer: Vec<Sample>,
}

impl ScheduledMetric {
    #[inline]
    pub fn id(&self) -> MetricId {
        self.core.info.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.core.info.name
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    #[inline]
    pub fn next_run_time(&self) -> Instant {
        self.next_run_time
    }

    pub fn buffered(&self) -> &[Sample] {
        &self.buffer
    }

    /// Run the sampler once. Panics are caught and reported as errors.
    fn run_sampler(&mut self) -> SampleResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.sampler.sample())) {
            Ok(result) => result,
            Err(payload) => Err(SampleError::Panicked {
                message: panic_message(&*payload),
            }),
        }
    }

    fn record(&mut self, sample: Sample) {
        self.buffer.push(sample);
        self.core.counters.samples.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Swap out the buffer once it holds `aggregation_size` samples.
    fn take_full_buffer(&mut self) -> Option<Delivery> {
        let size = self.core.info.aggregation_size;
        if self.buffer.len() < size {
            return None;
        }
        let samples = mem::replace(
            &mut self.buffer,
            Vec::with_capacity(size.min(BUFFER_PREALLOC_LIMIT)),
        );
        Some(Delivery {
            core: self.core.clone(),
            sink: self.sink.clone(),
            samples,
        })
    }

    /// Next deadline is `now + interval`; deadlines never move backwards.
    /// An interval past the clock's range parks the metric as far out as
    /// `MAX_SAMPLING_INTERVAL` allows.
    fn reschedule(&mut self, now: Instant) {
        let next = now
            .checked_add(self.core.info.interval)
            .or_else(|| now.checked_add(MAX_SAMPLING_INTERVAL))
            .unwrap_or(now);
        self.next_run_time = next.max(self.next_run_time);
    }
}

impl Debug for ScheduledMetric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledMetric")
            .field("id", &self.core.info.id)
            .field("name", &self.core.info.name)
            .field("alive", &self.is_alive())
            .field("next_run_time", &self.next_run_time)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 9.6 Delivery
// ----------------------------------------------------------------------------

/// A filled buffer on its way to the sink.
pub struct Delivery {
    core: Arc<MetricCore>,
    sink: Arc<dyn MetricSink>,
    samples: Vec<Sample>,
}

impl Delivery {
    pub fn metric_id(&self) -> MetricId {
        self.core.info.id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    /// Call the sink. Panics are caught and reported as errors.
    fn deliver(&self) -> DeliveryResult {
        match panic::catch_unwind(AssertUnwindSafe(|| {
            self.sink.deliver(&self.core.info, &self.samples)
        })) {
            Ok(result) => result,
            Err(payload) => Err(DeliveryError::Panicked {
                message: panic_message(&*payload),
            }),
        }
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("metric", &self.core.info.id)
            .field("samples", &self.samples.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 10: TIME-ORDERED READY QUEUE
// ============================================================================
// Min-heap on `next_run_time` behind one mutex, plus a single condition
// variable signalled only when an insertion changes the head. A consumer
// sleeps until the head's deadline; an earlier insertion wakes it so the
// timeout is recomputed. Dead heads are dropped without waiting and the
// shutdown sentinel always sorts first.
// ============================================================================

/// What the ready queue hands back to its consumer.
#[derive(Debug)]
pub enum ReadyEntry {
    /// A live metric whose deadline has passed
    Metric(ScheduledMetric),
    /// Stop consuming
    Shutdown,
}

struct HeapEntry {
    seq: u64,
    entry: ReadyEntry,
}

impl HeapEntry {
    fn is_shutdown(&self) -> bool {
        matches!(self.entry, ReadyEntry::Shutdown)
    }
}

// BinaryHeap is a max-heap: "greater" means "popped first". Shutdown beats
// everything, then earlier deadlines, then lower insertion sequence.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.entry, &other.entry) {
            (ReadyEntry::Shutdown, ReadyEntry::Shutdown) => other.seq.cmp(&self.seq),
            (ReadyEntry::Shutdown, _) => Ordering::Greater,
            (_, ReadyEntry::Shutdown) => Ordering::Less,
            (ReadyEntry::Metric(a), ReadyEntry::Metric(b)) => b
                .next_run_time
                .cmp(&a.next_run_time)
                .then_with(|| other.seq.cmp(&self.seq)),
        }
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

struct ReadyInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl ReadyInner {
    fn push(&mut self, entry: ReadyEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { seq, entry });
        seq
    }

    fn head_is(&self, seq: u64) -> bool {
        self.heap.peek().map(|head| head.seq == seq).unwrap_or(false)
    }
}

enum HeadAction {
    Idle,
    Take,
    Discard,
    WaitUntil(Instant),
}

/// Thread-safe priority queue of metrics ordered by next run time.
pub struct ReadyQueue {
    inner: Mutex<ReadyInner>,
    head_changed: Condvar,
    discarded: AtomicU64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ReadyInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            head_changed: Condvar::new(),
            discarded: AtomicU64::new(0),
        }
    }

    /// Insert a metric keyed by its current `next_run_time`.
    ///
    /// Waiters are notified only if the metric became the new head.
    pub fn put(&self, metric: ScheduledMetric) {
        let mut inner = self.inner.lock();
        let seq = inner.push(ReadyEntry::Metric(metric));
        let head_changed = inner.head_is(seq);
        drop(inner);

        if head_changed {
            self.head_changed.notify_one();
        }
    }

    /// Insert the shutdown sentinel ahead of every metric.
    pub fn put_shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.push(ReadyEntry::Shutdown);
        drop(inner);
        self.head_changed.notify_all();
    }

    /// Wake waiters so they re-examine the head, e.g. after it was marked dead.
    pub fn wake(&self) {
        self.head_changed.notify_all();
    }

    /// Block until the head is due, is the shutdown sentinel, or the queue is
    /// woken with a dead head (which is discarded and the wait resumes).
    pub fn pop_ready_when_due(&self) -> ReadyEntry {
        let mut inner = self.inner.lock();
        loop {
            let action = match inner.heap.peek() {
                None => HeadAction::Idle,
                Some(head) => match &head.entry {
                    ReadyEntry::Shutdown => HeadAction::Take,
                    ReadyEntry::Metric(metric) if !metric.is_alive() => HeadAction::Discard,
                    ReadyEntry::Metric(metric) => {
                        if metric.next_run_time <= Instant::now() {
                            HeadAction::Take
                        } else {
                            HeadAction::WaitUntil(metric.next_run_time)
                        }
                    }
                },
            };

            match action {
                HeadAction::Idle => {
                    self.head_changed.wait(&mut inner);
                }
                HeadAction::WaitUntil(deadline) => {
                    let _ = self.head_changed.wait_until(&mut inner, deadline);
                }
                HeadAction::Discard => {
                    if let Some(dead) = inner.heap.pop() {
                        self.discarded.fetch_add(1, AtomicOrdering::Relaxed);
                        if let ReadyEntry::Metric(metric) = &dead.entry {
                            trace!(
                                target: "edge::scheduler",
                                metric_id = %metric.id(),
                                metric = metric.name(),
                                "Discarded dead metric from ready queue"
                            );
                        }
                    }
                }
                HeadAction::Take => {
                    if let Some(head) = inner.heap.pop() {
                        // Hand the new head to any other waiter.
                        if !inner.heap.is_empty() && !head.is_shutdown() {
                            self.head_changed.notify_one();
                        }
                        return head.entry;
                    }
                }
            }
        }
    }

    /// Non-blocking variant: the head if it is due (or the sentinel).
    pub fn try_pop_due(&self) -> Option<ReadyEntry> {
        let mut inner = self.inner.lock();
        loop {
            let action = match inner.heap.peek() {
                None => return None,
                Some(head) => match &head.entry {
                    ReadyEntry::Shutdown => HeadAction::Take,
                    ReadyEntry::Metric(metric) if !metric.is_alive() => HeadAction::Discard,
                    ReadyEntry::Metric(metric) if metric.next_run_time <= Instant::now() => {
                        HeadAction::Take
                    }
                    ReadyEntry::Metric(_) => return None,
                },
            };

            match action {
                HeadAction::Discard => {
                    if inner.heap.pop().is_some() {
                        self.discarded.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                }
                _ => return inner.heap.pop().map(|head| head.entry),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Dead metrics dropped at the head so far
    pub fn discarded(&self) -> u64 {
        self.discarded.load(AtomicOrdering::Relaxed)
    }

    /// Deadline of the earliest metric, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().heap.peek().and_then(|head| match &head.entry {
            ReadyEntry::Metric(metric) => Some(metric.next_run_time),
            ReadyEntry::Shutdown => None,
        })
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ReadyQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("len", &self.len())
            .field("discarded", &self.discarded())
            .finish()
    }
}

// ============================================================================
// SECTION 11: COLLECTION & SEND QUEUES
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Queue Messages
// ----------------------------------------------------------------------------

/// Work item for the collection pool.
#[derive(Debug)]
pub enum CollectJob {
    Collect(ScheduledMetric),
    /// Poison pill; one per collection worker on shutdown
    Shutdown,
}

/// Work item for the send worker.
#[derive(Debug)]
pub enum SendJob {
    Deliver(Delivery),
    Shutdown,
}

// ----------------------------------------------------------------------------
// 11.2 Send Queue
// ----------------------------------------------------------------------------

/// Queue between collectors and the send worker. Unbounded unless a capacity
/// is configured, in which case the overflow policy decides what gives way.
pub struct SendQueue {
    tx: Sender<SendJob>,
    rx: Receiver<SendJob>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    tick: Duration,
    dropped: IntCounter,
}

impl SendQueue {
    pub fn new(config: &SendConfig, tick: Duration, dropped: IntCounter) -> Self {
        let (tx, rx) = match config.queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        Self {
            tx,
            rx,
            capacity: config.queue_capacity,
            policy: config.overflow,
            tick,
            dropped,
        }
    }

    /// Queue a full buffer for delivery. Returns whether it was queued.
    ///
    /// With `OverflowPolicy::Block` the caller waits for room, giving up once
    /// `stopping` is raised.
    pub fn push(&self, delivery: Delivery, stopping: &AtomicBool) -> bool {
        let job = SendJob::Deliver(delivery);
        if self.capacity.is_none() {
            return self.tx.send(job).is_ok();
        }

        match self.policy {
            OverflowPolicy::Block => self.push_blocking(job, stopping),
            OverflowPolicy::DropNewest => match self.tx.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(SendJob::Deliver(rejected))) => {
                    self.record_drop(&rejected, "newest");
                    false
                }
                Err(_) => false,
            },
            OverflowPolicy::DropOldest => self.push_evicting(job),
        }
    }

    fn push_blocking(&self, mut job: SendJob, stopping: &AtomicBool) -> bool {
        loop {
            match self.tx.send_timeout(job, self.tick) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if stopping.load(AtomicOrdering::Acquire) {
                        return false;
                    }
                    job = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn push_evicting(&self, mut job: SendJob) -> bool {
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    job = back;
                    match self.rx.try_recv() {
                        Ok(SendJob::Deliver(oldest)) => self.record_drop(&oldest, "oldest"),
                        Ok(SendJob::Shutdown) => {
                            // Shutting down: keep the sentinel, lose the batch.
                            self.push_shutdown();
                            return false;
                        }
                        Err(_) => {}
                    }
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    fn record_drop(&self, delivery: &Delivery, which: &'static str) {
        self.dropped.inc();
        warn!(
            target: "edge::collector",
            metric_id = %delivery.metric_id(),
            samples = delivery.samples().len(),
            dropped = which,
            "Send queue full, batch dropped"
        );
    }

    /// Queue the sender's shutdown sentinel. Never blocks: on a full bounded
    /// queue the oldest pending batch is evicted to make room.
    pub fn push_shutdown(&self) {
        let mut job = SendJob::Shutdown;
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    job = back;
                    if let Ok(SendJob::Deliver(evicted)) = self.rx.try_recv() {
                        self.dropped.inc();
                        trace!(
                            target: "edge::sender",
                            metric_id = %evicted.metric_id(),
                            "Pending batch evicted for shutdown"
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Block until a job is available
    pub fn recv(&self) -> Option<SendJob> {
        self.rx.recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Debug for SendQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

// ============================================================================
// SECTION 12: WORKERS
// ============================================================================
// Thread roles:
// - edge-event-checker: pops due metrics off the ready queue and blocks on
//   the bounded collect queue (backpressure for the whole scheduler).
// - edge-collector-N: samples, buffers, reschedules, hands full buffers on.
// - edge-sender: delivers buffers one at a time; errors are logged only.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Pool Statistics
// ----------------------------------------------------------------------------

/// Snapshot of the collection pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers currently inside a sampler
    pub working: usize,
    /// Workers whose thread is running
    pub alive: usize,
    /// Workers the pool was configured with
    pub configured: usize,
}

#[derive(Debug)]
struct WorkingSet {
    active: Mutex<HashMap<usize, MetricId>>,
    alive: AtomicUsize,
    configured: usize,
}

impl WorkingSet {
    fn new(configured: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::with_capacity(configured)),
            alive: AtomicUsize::new(0),
            configured,
        }
    }

    fn begin(&self, worker: usize, metric: MetricId) {
        self.active.lock().insert(worker, metric);
    }

    fn end(&self, worker: usize) {
        self.active.lock().remove(&worker);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            working: self.active.lock().len(),
            alive: self.alive.load(AtomicOrdering::Acquire),
            configured: self.configured,
        }
    }
}

/// Decrements the alive count when a collector exits, however it exits.
struct AliveGuard<'a>(&'a AtomicUsize);

impl<'a> AliveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, AtomicOrdering::AcqRel);
        Self(counter)
    }
}

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

// ----------------------------------------------------------------------------
// 12.2 Shared State
// ----------------------------------------------------------------------------

struct Shared {
    instance: String,
    tick: Duration,
    ready: ReadyQueue,
    collect_tx: Sender<CollectJob>,
    collect_rx: Receiver<CollectJob>,
    send: SendQueue,
    working: WorkingSet,
    metrics: EngineMetrics,
    registry: DashMap<MetricId, Arc<MetricCore>>,
    checker_running: AtomicBool,
    sender_running: AtomicBool,
    stopping: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn new(config: &EngineConfig) -> EngineResult<Self> {
        let metrics = EngineMetrics::new()?;
        let tick = config.scheduler_tick();
        let (collect_tx, collect_rx) = bounded(config.pool.collect_queue_capacity);
        let send = SendQueue::new(&config.send, tick, metrics.deliveries_dropped.clone());

        Ok(Self {
            instance: config.engine.instance_name.clone(),
            tick,
            ready: ReadyQueue::new(),
            collect_tx,
            collect_rx,
            send,
            working: WorkingSet::new(config.pool.workers),
            metrics,
            registry: DashMap::new(),
            checker_running: AtomicBool::new(false),
            sender_running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        })
    }

    #[inline]
    fn is_stopping(&self) -> bool {
        self.stopping.load(AtomicOrdering::Acquire)
    }

    /// Hand a due metric to the collection pool unless it died after being
    /// popped. Returns false once the event checker should stop.
    fn dispatch_due(&self, metric: ScheduledMetric) -> bool {
        if !metric.is_alive() {
            self.metrics.dead_discarded.inc();
            trace!(
                target: "edge::scheduler",
                metric_id = %metric.id(),
                "Dropped metric unregistered after pop"
            );
            return true;
        }
        trace!(
            target: "edge::scheduler",
            metric_id = %metric.id(),
            metric = metric.name(),
            "Metric due"
        );
        self.dispatch(metric)
    }

    /// Blocking put into the collect queue. Gives up once the event checker
    /// has been told to stop.
    fn dispatch(&self, metric: ScheduledMetric) -> bool {
        let mut job = CollectJob::Collect(metric);
        loop {
            match self.collect_tx.send_timeout(job, self.tick) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !self.checker_running.load(AtomicOrdering::Acquire) {
                        return false;
                    }
                    job = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    /// One collection cycle for one metric.
    fn collect(&self, worker: usize, mut metric: ScheduledMetric) {
        self.working.begin(worker, metric.id());
        let result = metric.run_sampler();
        self.working.end(worker);
        let now = Instant::now();

        match result {
            Ok(Some(value)) => {
                metric.record(Sample::new(Timestamp::now(), value));
                self.metrics.samples_collected.inc();
            }
            Ok(None) => {
                trace!(
                    target: "edge::collector",
                    metric_id = %metric.id(),
                    metric = metric.name(),
                    "No data this cycle"
                );
            }
            Err(e) => {
                metric
                    .core
                    .counters
                    .sampling_failures
                    .fetch_add(1, AtomicOrdering::Relaxed);
                self.metrics.sampling_failures.inc();
                warn!(
                    target: "edge::collector",
                    metric_id = %metric.id(),
                    metric = metric.name(),
                    error = %e,
                    "Sampling failed"
                );
            }
        }

        let batch = metric.take_full_buffer();
        metric.reschedule(now);

        if metric.is_alive() && !self.is_stopping() {
            self.ready.put(metric);
        } else {
            self.metrics.dead_discarded.inc();
            debug!(
                target: "edge::collector",
                metric_id = %metric.id(),
                metric = metric.name(),
                "Metric not rescheduled"
            );
        }

        if let Some(batch) = batch {
            self.send.push(batch, &self.stopping);
        }
    }

    /// Deliver one batch and account for the outcome.
    fn deliver(&self, delivery: Delivery) {
        if !delivery.is_alive() {
            self.metrics.dead_discarded.inc();
            trace!(
                target: "edge::sender",
                metric_id = %delivery.metric_id(),
                "Discarded batch of unregistered metric"
            );
            return;
        }

        let counters = &delivery.core.counters;
        match delivery.deliver() {
            Ok(()) => {
                counters.deliveries.fetch_add(1, AtomicOrdering::Relaxed);
                self.metrics.deliveries.inc();
                trace!(
                    target: "edge::sender",
                    metric_id = %delivery.metric_id(),
                    samples = delivery.samples().len(),
                    "Batch delivered"
                );
            }
            Err(e) => {
                counters.delivery_failures.fetch_add(1, AtomicOrdering::Relaxed);
                self.metrics.delivery_failures.inc();
                error!(
                    target: "edge::sender",
                    metric_id = %delivery.metric_id(),
                    metric = %delivery.core.info.name,
                    samples = delivery.samples().len(),
                    error = %e,
                    "Delivery failed, batch dropped"
                );
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 Worker Loops
// ----------------------------------------------------------------------------

fn event_checker_loop(shared: Arc<Shared>) {
    debug!(target: "edge::scheduler", instance = %shared.instance, "Event checker started");

    loop {
        match shared.ready.pop_ready_when_due() {
            ReadyEntry::Shutdown => break,
            ReadyEntry::Metric(metric) => {
                if !shared.checker_running.load(AtomicOrdering::Acquire) {
                    break;
                }
                if !shared.dispatch_due(metric) {
                    break;
                }
            }
        }
    }

    debug!(target: "edge::scheduler", "Event checker stopped");
}

fn collector_loop(shared: Arc<Shared>, worker: usize) {
    let _alive = AliveGuard::enter(&shared.working.alive);
    debug!(target: "edge::collector", worker, "Collector started");

    while let Ok(job) = shared.collect_rx.recv() {
        match job {
            CollectJob::Shutdown => break,
            CollectJob::Collect(metric) => {
                if shared.is_stopping() {
                    continue;
                }
                if !metric.is_alive() {
                    shared.metrics.dead_discarded.inc();
                    continue;
                }
                shared.collect(worker, metric);
            }
        }
    }

    debug!(target: "edge::collector", worker, "Collector stopped");
}

fn sender_loop(shared: Arc<Shared>) {
    debug!(target: "edge::sender", "Send worker started");

    while let Some(job) = shared.send.recv() {
        match job {
            SendJob::Shutdown => break,
            SendJob::Deliver(delivery) => {
                if !shared.sender_running.load(AtomicOrdering::Acquire) {
                    break;
                }
                shared.deliver(delivery);
            }
        }
    }

    debug!(target: "edge::sender", "Send worker stopped");
}

// ----------------------------------------------------------------------------
// 12.4 Thread Management
// ----------------------------------------------------------------------------

/// Signals thread exit to the joiner, including on unwind.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

#[derive(Debug)]
struct WorkerThread {
    name: String,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct EngineThreads {
    workers: Vec<WorkerThread>,
    exit_tx: Sender<()>,
    exit_rx: Receiver<()>,
    stack_size: usize,
}

impl EngineThreads {
    fn new(stack_size: usize) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Self {
            workers: Vec::new(),
            exit_tx,
            exit_rx,
            stack_size,
        }
    }

    fn spawn<F>(&mut self, name: String, body: F) -> EngineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let exit = ExitSignal(self.exit_tx.clone());
        let handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(self.stack_size)
            .spawn(move || {
                let _exit = exit;
                body();
            })
            .map_err(|e| EngineError::ThreadSpawn {
                name: name.clone(),
                message: e.to_string(),
            })?;

        self.workers.push(WorkerThread { name, handle });
        Ok(())
    }

    /// Join every thread that finishes before `deadline`; the rest are
    /// detached and reported as abandoned.
    fn join_until(self, deadline: Instant) -> ShutdownReport {
        let mut pending = self.workers;
        let mut joined = Vec::with_capacity(pending.len());

        loop {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|w| w.handle.is_finished());

            for worker in finished {
                if let Err(payload) = worker.handle.join() {
                    error!(
                        target: "edge::engine",
                        thread = %worker.name,
                        panic = %panic_message(&*payload),
                        "Worker thread panicked"
                    );
                }
                joined.push(worker.name);
            }

            pending = running;
            if pending.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = self.exit_rx.recv_timeout((deadline - now).min(JOIN_POLL_INTERVAL));
        }

        let abandoned: Vec<String> = pending.into_iter().map(|w| w.name).collect();
        for name in &abandoned {
            warn!(target: "edge::engine", thread = %name, "Worker did not stop in time, detached");
        }

        ShutdownReport { joined, abandoned }
    }
}

// ============================================================================
// SECTION 13: ENGINE LIFECYCLE
// ============================================================================

/// Outcome of a terminate call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Threads that exited before the deadline
    pub joined: Vec<String>,
    /// Threads still running at the deadline; detached
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Terminated,
}

impl Display for EngineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub instance: String,
    pub state: EngineState,
    pub pool: PoolStats,
    pub ready_depth: usize,
    pub collect_depth: usize,
    pub send_depth: usize,
    pub registered: usize,
    pub ready_discarded: u64,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Running(EngineThreads),
    Terminated,
}

/// The metric scheduling engine.
///
/// Owns the ready queue, the event checker, the collection pool and the send
/// worker. Threads start on the first `initialize` (or the first `register`)
/// and stop on `terminate`, which is also run on drop.
pub struct Engine {
    config: EngineConfig,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl Engine {
    /// Validate the configuration and build an idle engine.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(&config)?);

        debug!(
            target: "edge::engine",
            instance = %config.engine.instance_name,
            workers = config.pool.workers,
            collect_capacity = config.pool.collect_queue_capacity,
            send_capacity = ?config.send.queue_capacity,
            "Engine created"
        );

        Ok(Self {
            config,
            shared,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Start the event checker, the collection pool and the send worker.
    ///
    /// Idempotent while running. Fails with `ShuttingDown` once terminated.
    /// If any thread fails to spawn, the ones already started are stopped and
    /// the engine ends up terminated.
    pub fn initialize(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Terminated => return Err(EngineError::ShuttingDown),
            Lifecycle::Idle => {}
        }

        self.shared.checker_running.store(true, AtomicOrdering::Release);
        self.shared.sender_running.store(true, AtomicOrdering::Release);

        let mut threads = EngineThreads::new(self.config.pool.stack_size);
        match self.spawn_all(&mut threads) {
            Ok(()) => {
                *lifecycle = Lifecycle::Running(threads);
                info!(
                    target: "edge::engine",
                    instance = %self.shared.instance,
                    workers = self.config.pool.workers,
                    "Engine initialized"
                );
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Terminated;
                drop(lifecycle);
                error!(target: "edge::engine", error = %e, "Engine failed to start");
                let deadline = Instant::now() + self.config.shutdown_timeout();
                self.signal_stop(threads.workers.len(), deadline);
                threads.join_until(deadline);
                Err(e)
            }
        }
    }

    fn spawn_all(&self, threads: &mut EngineThreads) -> EngineResult<()> {
        let shared = self.shared.clone();
        threads.spawn("edge-sender".to_string(), move || sender_loop(shared))?;

        for worker in 0..self.config.pool.workers {
            let shared = self.shared.clone();
            threads.spawn(format!("edge-collector-{}", worker), move || {
                collector_loop(shared, worker)
            })?;
        }

        let shared = self.shared.clone();
        threads.spawn("edge-event-checker".to_string(), move || {
            event_checker_loop(shared)
        })?;

        Ok(())
    }

    /// Register a metric. It is first sampled immediately, then every
    /// `interval` after each completed sample. Starts the engine if needed.
    pub fn register(&self, definition: MetricDefinition) -> EngineResult<MetricHandle> {
        definition.validate()?;
        if self.shared.is_stopping() {
            return Err(EngineError::ShuttingDown);
        }
        self.initialize()?;

        let id = MetricId::from_raw(self.shared.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        let (handle, scheduled) = definition.schedule(id, Instant::now());

        self.track(&handle)?;
        self.shared.ready.put(scheduled);

        info!(
            target: "edge::engine",
            metric_id = %id,
            metric = handle.name(),
            interval_ms = handle.info().interval.as_millis() as u64,
            aggregation = handle.info().aggregation_size,
            "Metric registered"
        );

        Ok(handle)
    }

    /// Add a metric to the registry. Undone if terminate started meanwhile,
    /// since its registry sweep may already have run.
    fn track(&self, handle: &MetricHandle) -> EngineResult<()> {
        let id = handle.id();
        self.shared.registry.insert(id, handle.core.clone());
        self.shared.metrics.registered_metrics.inc();

        if self.shared.is_stopping() {
            handle.core.mark_dead();
            if self.shared.registry.remove(&id).is_some() {
                self.shared.metrics.registered_metrics.dec();
            }
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Mark a metric dead. It is dropped at whichever queue boundary it
    /// reaches next and its pending batches are never delivered.
    ///
    /// Returns false if it was already unregistered.
    pub fn unregister(&self, handle: &MetricHandle) -> bool {
        if !handle.core.mark_dead() {
            return false;
        }

        if self.shared.registry.remove(&handle.id()).is_some() {
            self.shared.metrics.registered_metrics.dec();
        }
        self.shared.ready.wake();

        info!(
            target: "edge::engine",
            metric_id = %handle.id(),
            metric = handle.name(),
            "Metric unregistered"
        );
        true
    }

    /// Handle of a registered metric
    pub fn metric(&self, id: MetricId) -> Option<MetricHandle> {
        self.shared
            .registry
            .get(&id)
            .map(|core| MetricHandle { core: core.value().clone() })
    }

    /// Stop all threads within the configured shutdown timeout.
    pub fn terminate(&self) -> ShutdownReport {
        self.terminate_with_timeout(self.config.shutdown_timeout())
    }

    /// Stop all threads, waiting at most `timeout` for them to exit.
    ///
    /// Queued but undelivered batches are dropped. Calling it again, or on an
    /// engine that never started, returns an empty report.
    pub fn terminate_with_timeout(&self, timeout: Duration) -> ShutdownReport {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            mem::replace(&mut *lifecycle, Lifecycle::Terminated)
        };

        let threads = match previous {
            Lifecycle::Running(threads) => threads,
            Lifecycle::Idle => {
                self.shared.stopping.store(true, AtomicOrdering::Release);
                self.release_metrics();
                return ShutdownReport::default();
            }
            Lifecycle::Terminated => return ShutdownReport::default(),
        };

        info!(target: "edge::engine", instance = %self.shared.instance, "Engine terminating");
        let started = Instant::now();
        let deadline = started + timeout;

        self.signal_stop(self.config.pool.workers, deadline);
        let report = threads.join_until(deadline);
        self.release_metrics();

        info!(
            target: "edge::engine",
            joined = report.joined.len(),
            abandoned = report.abandoned.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Engine terminated"
        );
        report
    }

    /// Raise the stop flags and post one sentinel per consumer.
    fn signal_stop(&self, collectors: usize, deadline: Instant) {
        self.shared.stopping.store(true, AtomicOrdering::Release);
        self.shared.checker_running.store(false, AtomicOrdering::Release);
        self.shared.sender_running.store(false, AtomicOrdering::Release);

        self.shared.ready.put_shutdown();
        self.shared.send.push_shutdown();

        for _ in 0..collectors {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self
                .shared
                .collect_tx
                .send_timeout(CollectJob::Shutdown, remaining)
                .is_err()
            {
                warn!(target: "edge::engine", "Collect queue still full at deadline");
                break;
            }
        }
    }

    fn release_metrics(&self) {
        let ids: Vec<MetricId> = self.shared.registry.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, core)) = self.shared.registry.remove(&id) {
                core.mark_dead();
                self.shared.metrics.registered_metrics.dec();
            }
        }
    }

    pub fn state(&self) -> EngineState {
        match *self.lifecycle.lock() {
            Lifecycle::Idle => EngineState::Idle,
            Lifecycle::Running(_) => EngineState::Running,
            Lifecycle::Terminated => EngineState::Terminated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.working.snapshot()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance: self.shared.instance.clone(),
            state: self.state(),
            pool: self.pool_stats(),
            ready_depth: self.shared.ready.len(),
            collect_depth: self.shared.collect_rx.len(),
            send_depth: self.shared.send.len(),
            registered: self.shared.registry.len(),
            ready_discarded: self.shared.ready.discarded(),
        }
    }

    /// Prometheus exposition of the engine's own counters
    pub fn render_metrics(&self) -> EngineResult<String> {
        self.shared.metrics.render()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            self.terminate();
        }
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.shared.instance)
            .field("state", &self.state())
            .field("pool", &self.pool_stats())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 14: PROCESS-WIDE ENGINE
// ============================================================================
// For agents that want a single engine reachable from anywhere. The config
// passed to the first successful `initialize` wins; later calls only make
// sure the engine is running.
// ============================================================================

static GLOBAL_ENGINE: OnceCell<Engine> = OnceCell::new();

/// Create (once) and start the process-wide engine.
pub fn initialize(config: EngineConfig) -> EngineResult<&'static Engine> {
    let engine = GLOBAL_ENGINE.get_or_try_init(|| Engine::new(config))?;
    engine.initialize()?;
    Ok(engine)
}

/// The process-wide engine, if `initialize` has been called
pub fn global() -> Option<&'static Engine> {
    GLOBAL_ENGINE.get()
}

/// Terminate the process-wide engine. `None` if it was never created.
pub fn terminate() -> Option<ShutdownReport> {
    GLOBAL_ENGINE.get().map(Engine::terminate)
}

// ============================================================================
// SECTION 15: BUILT-IN SAMPLERS & SINKS
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Host Metric Kinds
// ----------------------------------------------------------------------------

/// Host metrics the agent can sample without any plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinMetricKind {
    /// Global CPU usage in percent
    CpuUsage,
    /// Used memory in bytes
    MemoryUsed,
    /// One-minute load average
    LoadAverage,
    /// Host uptime in seconds
    Uptime,
    /// Monotonic counter proving the agent is alive
    Heartbeat,
}

impl BuiltinMetricKind {
    pub fn default_unit(&self) -> &'static str {
        match self {
            BuiltinMetricKind::CpuUsage => "percent",
            BuiltinMetricKind::MemoryUsed => "bytes",
            BuiltinMetricKind::LoadAverage => "load",
            BuiltinMetricKind::Uptime => "seconds",
            BuiltinMetricKind::Heartbeat => "count",
        }
    }

    pub fn sampler(&self) -> HostSampler {
        HostSampler::new(*self)
    }
}

impl Display for BuiltinMetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BuiltinMetricKind::CpuUsage => write!(f, "cpu_usage"),
            BuiltinMetricKind::MemoryUsed => write!(f, "memory_used"),
            BuiltinMetricKind::LoadAverage => write!(f, "load_average"),
            BuiltinMetricKind::Uptime => write!(f, "uptime"),
            BuiltinMetricKind::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

// ----------------------------------------------------------------------------
// 15.2 Host Sampler
// ----------------------------------------------------------------------------

/// Sampler backed by `sysinfo`. Keeps its own `System` so CPU usage is
/// computed against the previous refresh.
pub struct HostSampler {
    kind: BuiltinMetricKind,
    system: System,
    beats: u64,
}

impl HostSampler {
    pub fn new(kind: BuiltinMetricKind) -> Self {
        let mut system = System::new();
        if kind == BuiltinMetricKind::CpuUsage {
            // First reading needs a baseline.
            system.refresh_cpu();
        }
        Self {
            kind,
            system,
            beats: 0,
        }
    }

    pub fn kind(&self) -> BuiltinMetricKind {
        self.kind
    }
}

impl Sampler for HostSampler {
    fn sample(&mut self) -> SampleResult {
        let value = match self.kind {
            BuiltinMetricKind::CpuUsage => {
                self.system.refresh_cpu();
                MetricValue::Gauge(self.system.global_cpu_info().cpu_usage() as f64)
            }
            BuiltinMetricKind::MemoryUsed => {
                self.system.refresh_memory();
                MetricValue::Counter(self.system.used_memory())
            }
            BuiltinMetricKind::LoadAverage => MetricValue::Gauge(System::load_average().one),
            BuiltinMetricKind::Uptime => MetricValue::Counter(System::uptime()),
            BuiltinMetricKind::Heartbeat => {
                self.beats += 1;
                MetricValue::Counter(self.beats)
            }
        };
        Ok(Some(value))
    }
}

impl Debug for HostSampler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSampler")
            .field("kind", &self.kind)
            .field("beats", &self.beats)
            .finish_non_exhaustive()
    }
}

impl BuiltinMetricConfig {
    /// Definition publishing through `sink`
    pub fn to_definition(&self, sink: Arc<dyn MetricSink>) -> MetricDefinition {
        let unit = self
            .unit
            .clone()
            .unwrap_or_else(|| self.kind.default_unit().to_string());

        let mut definition = MetricDefinition::new(self.name.as_str(), self.kind.sampler(), sink)
            .unit(unit)
            .interval(Duration::from_millis(self.interval_ms))
            .aggregation_size(self.aggregation_size);

        if let Some(entity) = &self.entity {
            definition = definition.entity(entity.as_str());
        }
        definition
    }
}

// ----------------------------------------------------------------------------
// 15.3 JSON Lines Sink
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct BatchRecord<'a> {
    metric: &'a str,
    id: MetricId,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<&'a str>,
    samples: &'a [Sample],
}

/// Writes each delivered batch as one JSON object per line.
///
/// Stand-in for the data-center transport when running the agent locally.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> MetricSink for JsonLinesSink<W> {
    fn deliver(&self, metric: &MetricInfo, samples: &[Sample]) -> DeliveryResult {
        let record = BatchRecord {
            metric: &metric.name,
            id: metric.id,
            unit: metric.unit.as_deref(),
            entity: metric.entity.as_deref(),
            samples,
        };
        let line = serde_json::to_vec(&record)?;

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Debug for JsonLinesSink<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSink").finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 16: SCHEDULER TESTS
// ============================================================================


// ============================================================================
// SECTION 17: ENGINE TESTS
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;

    fn test_config(workers: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.pool.workers = workers;
        config.engine.scheduler_tick_ms = 10;
        config.engine.shutdown_timeout_ms = 2_000;
        config
    }

    fn null_sink() -> Arc<dyn MetricSink> {
        Arc::new(sink_fn(|_, _| Ok(())))
    }

    /// Sink forwarding every batch's values to a channel
    fn channel_sink() -> (Arc<dyn MetricSink>, Receiver<Vec<MetricValue>>) {
        let (tx, rx) = unbounded();
        let sink = sink_fn(move |_, samples| {
            let _ = tx.send(samples.iter().map(|s| s.value.clone()).collect());
            Ok(())
        });
        (Arc::new(sink), rx)
    }

    fn counting_sampler(counter: Arc<AtomicUsize>) -> impl Sampler + 'static {
        sampler_fn(move || {
            let n = counter.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            Ok(Some(MetricValue::Counter(n as u64)))
        })
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_aggregation_batches_in_order() {
        let engine = Engine::new(test_config(2)).unwrap();
        let (sink, batches) = channel_sink();
        let mut n = 0u64;
        let definition = MetricDefinition::new(
            "temp",
            sampler_fn(move || {
                n += 1;
                Ok(Some(MetricValue::Counter(n)))
            }),
            sink,
        )
        .interval(Duration::from_millis(20))
        .aggregation_size(2);

        engine.register(definition).unwrap();

        let first = batches.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = batches.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, vec![MetricValue::Counter(1), MetricValue::Counter(2)]);
        assert_eq!(second, vec![MetricValue::Counter(3), MetricValue::Counter(4)]);

        assert!(engine.terminate().is_clean());
    }

    #[test]
    fn test_sampling_failures_do_not_stop_metric() {
        let engine = Engine::new(test_config(1)).unwrap();
        let (sink, batches) = channel_sink();
        let mut n = 0u64;
        let definition = MetricDefinition::new(
            "flaky",
            sampler_fn(move || {
                n += 1;
                match n % 3 {
                    1 => Err(SampleError::failed("bus timeout")),
                    2 => panic!("driver crashed"),
                    _ => Ok(Some(MetricValue::Counter(n))),
                }
            }),
            sink,
        )
        .interval(Duration::from_millis(5));

        let handle = engine.register(definition).unwrap();

        assert_eq!(
            batches.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![MetricValue::Counter(3)]
        );
        assert_eq!(
            batches.recv_timeout(Duration::from_secs(2)).unwrap(),
            vec![MetricValue::Counter(6)]
        );

        let stats = handle.stats();
        assert!(stats.sampling_failures >= 4);
        assert!(stats.samples_collected >= 2);
        assert_eq!(engine.pool_stats().alive, 1);
        engine.terminate();
    }

    #[test]
    fn test_delivery_failures_are_contained() {
        let engine = Engine::new(test_config(1)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, delivered) = unbounded();

        let sink = {
            let calls = calls.clone();
            sink_fn(move |_, _| match calls.fetch_add(1, AtomicOrdering::SeqCst) {
                0 => Err(DeliveryError::failed("link down")),
                1 => panic!("transport bug"),
                _ => {
                    let _ = tx.send(());
                    Ok(())
                }
            })
        };

        let definition = MetricDefinition::new("uplink", sampler_fn(|| Ok(Some(1u64.into()))), Arc::new(sink))
            .interval(Duration::from_millis(5));
        let handle = engine.register(definition).unwrap();

        delivered.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(handle.stats().delivery_failures, 2);
        assert!(wait_for(Duration::from_secs(1), || handle.stats().deliveries >= 1));
        engine.terminate();
    }

    #[test]
    fn test_metric_never_sampled_concurrently() {
        let engine = Engine::new(test_config(4)).unwrap();
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let cycles = Arc::new(AtomicUsize::new(0));

        let sampler = {
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            let cycles = cycles.clone();
            sampler_fn(move || {
                if in_flight.swap(true, AtomicOrdering::SeqCst) {
                    overlapped.store(true, AtomicOrdering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                in_flight.store(false, AtomicOrdering::SeqCst);
                cycles.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(None)
            })
        };

        // Interval zero: rescheduled as soon as each sample completes.
        let definition = MetricDefinition::new("events", sampler, null_sink()).interval(Duration::ZERO);
        engine.register(definition).unwrap();

        assert!(wait_for(Duration::from_secs(2), || cycles.load(AtomicOrdering::SeqCst) >= 20));
        engine.terminate();
        assert!(!overlapped.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn test_unregister_stops_sampling() {
        let engine = Engine::new(test_config(2)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let definition = MetricDefinition::new("gone", counting_sampler(counter.clone()), null_sink())
            .interval(Duration::from_millis(5));

        let handle = engine.register(definition).unwrap();
        assert_eq!(engine.stats().registered, 1);
        assert!(wait_for(Duration::from_secs(2), || counter.load(AtomicOrdering::SeqCst) >= 3));

        assert!(engine.unregister(&handle));
        assert!(!engine.unregister(&handle));
        assert!(!handle.is_alive());
        assert_eq!(engine.stats().registered, 0);
        assert!(engine.metric(handle.id()).is_none());

        thread::sleep(Duration::from_millis(30));
        let settled = counter.load(AtomicOrdering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), settled);

        engine.terminate();
    }

    #[test]
    fn test_unregistered_batches_are_not_delivered() {
        let engine = Engine::new(test_config(2)).unwrap();

        // Metric A parks the send worker inside its sink until released.
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let blocking_sink = sink_fn(move |_, _| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        });
        let a = MetricDefinition::new("a", sampler_fn(|| Ok(Some(1u64.into()))), Arc::new(blocking_sink))
            .interval(Duration::from_secs(60));
        engine.register(a).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let (b_sink, b_batches) = channel_sink();
        let counter = Arc::new(AtomicUsize::new(0));
        let b = MetricDefinition::new("b", counting_sampler(counter.clone()), b_sink)
            .interval(Duration::from_millis(5));
        let handle = engine.register(b).unwrap();

        assert!(wait_for(Duration::from_secs(2), || engine.stats().send_depth >= 2));
        engine.unregister(&handle);
        release_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(b_batches.try_recv().is_err());
        assert_eq!(handle.stats().deliveries, 0);

        engine.terminate();
    }

    #[test]
    fn test_terminate_is_prompt_and_idempotent() {
        let engine = Engine::new(test_config(4)).unwrap();
        for name in ["x", "y", "z"] {
            let definition = MetricDefinition::new(name, sampler_fn(|| Ok(Some(1u64.into()))), null_sink())
                .interval(Duration::from_millis(5));
            engine.register(definition).unwrap();
        }
        assert_eq!(engine.state(), EngineState::Running);
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let report = engine.terminate();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(report.is_clean());
        assert_eq!(report.joined.len(), 6);
        assert!(report.joined.iter().any(|name| name == "edge-event-checker"));
        assert!(report.joined.iter().any(|name| name == "edge-sender"));

        assert_eq!(engine.state(), EngineState::Terminated);
        assert_eq!(engine.pool_stats().alive, 0);
        assert_eq!(engine.terminate(), ShutdownReport::default());

        let late = MetricDefinition::new("late", sampler_fn(|| Ok(None)), null_sink());
        assert!(matches!(engine.register(late), Err(EngineError::ShuttingDown)));
        assert!(matches!(engine.initialize(), Err(EngineError::ShuttingDown)));
    }

    #[test]
    fn test_terminate_abandons_stuck_sampler() {
        let engine = Engine::new(test_config(1)).unwrap();
        let (entered_tx, entered_rx) = unbounded();
        let definition = MetricDefinition::new(
            "stuck",
            sampler_fn(move || {
                let _ = entered_tx.send(());
                thread::sleep(Duration::from_millis(500));
                Ok(None)
            }),
            null_sink(),
        );
        engine.register(definition).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let report = engine.terminate_with_timeout(Duration::from_millis(50));
        assert_eq!(report.abandoned, vec!["edge-collector-0".to_string()]);
        assert_eq!(report.joined.len(), 2);
    }

    #[test]
    fn test_pool_stats_track_working_collectors() {
        let engine = Engine::new(test_config(3)).unwrap();
        assert_eq!(
            engine.pool_stats(),
            PoolStats { working: 0, alive: 0, configured: 3 }
        );

        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let definition = MetricDefinition::new(
            "slow",
            sampler_fn(move || {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok(None)
            }),
            null_sink(),
        )
        .interval(Duration::from_secs(60));
        engine.register(definition).unwrap();

        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || engine.pool_stats().alive == 3));
        assert_eq!(
            engine.pool_stats(),
            PoolStats { working: 1, alive: 3, configured: 3 }
        );

        release_tx.send(()).unwrap();
        assert!(wait_for(Duration::from_secs(2), || engine.pool_stats().working == 0));
        engine.terminate();
    }

    #[test]
    fn test_small_collect_queue_still_makes_progress() {
        let mut config = test_config(1);
        config.pool.collect_queue_capacity = 1;
        let engine = Engine::new(config).unwrap();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let definition = MetricDefinition::new(
                    format!("m{}", i),
                    sampler_fn(|| Ok(Some(1u64.into()))),
                    null_sink(),
                )
                .interval(Duration::from_millis(5));
                engine.register(definition).unwrap()
            })
            .collect();

        assert!(wait_for(Duration::from_secs(2), || handles
            .iter()
            .all(|h| h.stats().samples_collected >= 3)));
        engine.terminate();
    }

    #[test]
    fn test_event_checker_blocks_on_full_collect_queue() {
        let mut config = test_config(1);
        config.pool.collect_queue_capacity = 1;
        let engine = Engine::new(config).unwrap();

        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let blocker = MetricDefinition::new(
            "blocker",
            sampler_fn(move || {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok(None)
            }),
            null_sink(),
        )
        .interval(Duration::from_secs(60));
        engine.register(blocker).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for name in ["b", "c", "d"] {
            let definition = MetricDefinition::new(name, counting_sampler(counter.clone()), null_sink())
                .interval(Duration::from_millis(5));
            engine.register(definition).unwrap();
        }

        // One metric queued, one held by the blocked checker, one still ready.
        assert!(wait_for(Duration::from_secs(2), || {
            let stats = engine.stats();
            stats.collect_depth == 1 && stats.ready_depth == 1
        }));
        thread::sleep(Duration::from_millis(100));
        let stats = engine.stats();
        assert_eq!(stats.collect_depth, 1);
        assert_eq!(stats.ready_depth, 1);
        assert_eq!(stats.pool.working, 1);
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert!(wait_for(Duration::from_secs(2), || counter.load(AtomicOrdering::SeqCst) >= 3));
        engine.terminate();
    }

    #[test]
    fn test_metric_unregistered_in_collect_queue_is_never_sampled() {
        let mut config = test_config(1);
        config.pool.collect_queue_capacity = 2;
        let engine = Engine::new(config).unwrap();

        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let blocker = MetricDefinition::new(
            "blocker",
            sampler_fn(move || {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
                Ok(None)
            }),
            null_sink(),
        )
        .interval(Duration::from_secs(60));
        engine.register(blocker).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let doomed_calls = Arc::new(AtomicUsize::new(0));
        let doomed = engine
            .register(
                MetricDefinition::new("doomed", counting_sampler(doomed_calls.clone()), null_sink())
                    .interval(Duration::from_millis(5)),
            )
            .unwrap();

        let kept_calls = Arc::new(AtomicUsize::new(0));
        engine
            .register(
                MetricDefinition::new("kept", counting_sampler(kept_calls.clone()), null_sink())
                    .interval(Duration::from_secs(60)),
            )
            .unwrap();

        assert!(wait_for(Duration::from_secs(2), || engine.stats().collect_depth == 2));
        assert!(engine.unregister(&doomed));
        release_tx.send(()).unwrap();

        assert!(wait_for(Duration::from_secs(2), || kept_calls.load(AtomicOrdering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(doomed_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(doomed.stats().samples_collected, 0);
        engine.terminate();
    }

    #[test]
    fn test_dispatch_drops_metric_unregistered_after_pop() {
        let shared = Shared::new(&test_config(1)).unwrap();
        shared.checker_running.store(true, AtomicOrdering::SeqCst);

        let (handle, dead) = MetricDefinition::new("late", sampler_fn(|| Ok(None)), null_sink())
            .schedule(MetricId::from_raw(1), Instant::now());
        handle.core.mark_dead();
        assert!(shared.dispatch_due(dead));
        assert_eq!(shared.collect_rx.len(), 0);
        assert_eq!(shared.metrics.dead_discarded.get(), 1);

        let (_, live) = MetricDefinition::new("live", sampler_fn(|| Ok(None)), null_sink())
            .schedule(MetricId::from_raw(2), Instant::now());
        assert!(shared.dispatch_due(live));
        assert_eq!(shared.collect_rx.len(), 1);
    }

    #[test]
    fn test_registration_racing_terminate_is_rolled_back() {
        let engine = Engine::new(test_config(1)).unwrap();
        let (handle, _) = MetricDefinition::new("racer", sampler_fn(|| Ok(None)), null_sink())
            .schedule(MetricId::from_raw(42), Instant::now());

        engine.shared.stopping.store(true, AtomicOrdering::SeqCst);
        assert!(matches!(engine.track(&handle), Err(EngineError::ShuttingDown)));

        assert!(!handle.is_alive());
        assert_eq!(engine.stats().registered, 0);
        assert!(engine
            .render_metrics()
            .unwrap()
            .contains("edge_engine_registered_metrics 0"));
    }

    #[test]
    fn test_out_of_range_metric_rejected_and_pool_keeps_running() {
        let engine = Engine::new(test_config(1)).unwrap();

        let forever = MetricDefinition::new("forever", sampler_fn(|| Ok(None)), null_sink())
            .interval(Duration::MAX);
        assert!(matches!(engine.register(forever), Err(EngineError::InvalidMetric { .. })));

        let wide = MetricDefinition::new("wide", sampler_fn(|| Ok(None)), null_sink())
            .aggregation_size(usize::MAX);
        assert!(matches!(engine.register(wide), Err(EngineError::InvalidMetric { .. })));

        let counter = Arc::new(AtomicUsize::new(0));
        let definition = MetricDefinition::new("steady", counting_sampler(counter.clone()), null_sink())
            .interval(MAX_SAMPLING_INTERVAL);
        engine.register(definition).unwrap();
        let definition = MetricDefinition::new("fast", counting_sampler(counter.clone()), null_sink())
            .interval(Duration::from_millis(5));
        engine.register(definition).unwrap();

        assert!(wait_for(Duration::from_secs(2), || counter.load(AtomicOrdering::SeqCst) >= 4));
        assert_eq!(engine.pool_stats().alive, 1);
        assert!(engine.terminate().is_clean());
    }

    #[test]
    fn test_invalid_config_and_metric_rejected() {
        assert!(matches!(Engine::new(test_config(0)), Err(EngineError::Config(_))));

        let engine = Engine::new(test_config(1)).unwrap();
        let empty = MetricDefinition::new(" ", sampler_fn(|| Ok(None)), null_sink());
        assert!(matches!(engine.register(empty), Err(EngineError::InvalidMetric { .. })));

        let zero = MetricDefinition::new("zero", sampler_fn(|| Ok(None)), null_sink()).aggregation_size(0);
        assert!(matches!(engine.register(zero), Err(EngineError::InvalidMetric { .. })));

        let long = MetricDefinition::new("x".repeat(MAX_METRIC_NAME_LENGTH + 1), sampler_fn(|| Ok(None)), null_sink());
        assert!(matches!(engine.register(long), Err(EngineError::InvalidMetric { .. })));

        // Rejected registrations never start the engine.
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.terminate(), ShutdownReport::default());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = Engine::new(test_config(2)).unwrap();
        engine.initialize().unwrap();
        engine.initialize().unwrap();
        assert!(wait_for(Duration::from_secs(2), || engine.pool_stats().alive == 2));
        assert_eq!(engine.terminate().joined.len(), 4);
    }

    #[test]
    fn test_engine_counters_rendered() {
        let engine = Engine::new(test_config(1)).unwrap();
        let (sink, batches) = channel_sink();
        let definition = MetricDefinition::new("c", sampler_fn(|| Ok(Some(1u64.into()))), sink)
            .interval(Duration::from_millis(5));
        engine.register(definition).unwrap();
        batches.recv_timeout(Duration::from_secs(2)).unwrap();

        let text = engine.render_metrics().unwrap();
        assert!(text.contains("edge_engine_registered_metrics 1"));
        assert!(text.contains("edge_engine_samples_collected_total"));

        let stats = serde_json::to_value(engine.stats()).unwrap();
        assert_eq!(stats["state"], "running");
        assert_eq!(stats["pool"]["configured"], 1);
        engine.terminate();
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_batch() {
        let sink = JsonLinesSink::new(Vec::new());
        let info = MetricInfo {
            id: MetricId::from_raw(7),
            name: "room.temp".into(),
            unit: Some("celsius".into()),
            entity: None,
            interval: Duration::from_secs(1),
            aggregation_size: 2,
        };
        let samples = vec![
            Sample::new(Timestamp::from_millis(1_000), 21.5),
            Sample::new(Timestamp::from_millis(2_000), 21.75),
        ];

        sink.deliver(&info, &samples).unwrap();
        sink.deliver(&info, &samples[..1]).unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["metric"], "room.temp");
        assert_eq!(first["id"], 7);
        assert_eq!(first["unit"], "celsius");
        assert!(first.get("entity").is_none());
        assert_eq!(first["samples"].as_array().unwrap().len(), 2);
        assert_eq!(first["samples"][1]["value"]["gauge"], 21.75);
    }

    #[test]
    fn test_host_samplers() {
        let mut heartbeat = BuiltinMetricKind::Heartbeat.sampler();
        assert_eq!(heartbeat.sample().unwrap(), Some(MetricValue::Counter(1)));
        assert_eq!(heartbeat.sample().unwrap(), Some(MetricValue::Counter(2)));

        let mut memory = HostSampler::new(BuiltinMetricKind::MemoryUsed);
        assert!(matches!(memory.sample(), Ok(Some(MetricValue::Counter(_)))));

        let mut cpu = HostSampler::new(BuiltinMetricKind::CpuUsage);
        assert!(matches!(cpu.sample(), Ok(Some(MetricValue::Gauge(_)))));
    }

    #[test]
    fn test_builtin_config_builds_definition() {
        let config = BuiltinMetricConfig {
            name: "agent.heartbeat".to_string(),
            kind: BuiltinMetricKind::Heartbeat,
            interval_ms: 10,
            aggregation_size: 3,
            unit: None,
            entity: Some("gateway-1".to_string()),
        };

        let engine = Engine::new(test_config(1)).unwrap();
        let handle = engine.register(config.to_definition(null_sink())).unwrap();
        let info = handle.info();
        assert_eq!(info.unit.as_deref(), Some("count"));
        assert_eq!(info.entity.as_deref(), Some("gateway-1"));
        assert_eq!(info.aggregation_size, 3);
        assert_eq!(info.interval, Duration::from_millis(10));
        engine.terminate();
    }

    #[test]
    fn test_drop_terminates_running_engine() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let engine = Engine::new(test_config(1)).unwrap();
            let definition = MetricDefinition::new("d", counting_sampler(counter.clone()), null_sink())
                .interval(Duration::from_millis(5));
            engine.register(definition).unwrap();
            assert!(wait_for(Duration::from_secs(2), || counter.load(AtomicOrdering::SeqCst) >= 1));
        }
        let settled = counter.load(AtomicOrdering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), settled);
    }

    #[test]
    fn test_process_wide_engine() {
        let engine = initialize(test_config(1)).unwrap();
        let again = initialize(test_config(8)).unwrap();
        assert!(std::ptr::eq(engine, again));
        assert_eq!(again.config().pool.workers, 1);
        assert!(global().is_some());

        let definition = MetricDefinition::new(
            "global.heartbeat",
            BuiltinMetricKind::Heartbeat.sampler(),
            null_sink(),
        )
        .interval(Duration::from_millis(5));
        let handle = engine.register(definition).unwrap();
        assert!(wait_for(Duration::from_secs(2), || handle.stats().samples_collected >= 1));

        let report = terminate().unwrap();
        assert!(report.is_clean());
        assert!(terminate().unwrap().joined.is_empty());
    }
}
