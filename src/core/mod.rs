//! Core types shared by the agent and the collector.
//!
//! This module contains the metric data model, configuration, the
//! crate-wide error type and the bounded retry executor.

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use config::{AgentConfig, ServerConfig, SigningKey, StorageConfig};
pub use error::{MonitorError, Result};
pub use retry::{retry, retry_with_config, Failure, RetryConfig, RetryError, RetryExt};
pub use types::{check_gauge, Counter, Gauge, MetricBatch, MetricKind, MetricQuery, MetricRecord, MetricValue};
