//! Monitor - metrics agent and collector.
//!
//! The agent polls host and process metrics on a fixed cadence and reports
//! them in batches to the collector. The collector stores them in a
//! PostgreSQL database, or in a local store mirrored to a JSON file when no
//! database is reachable.
//!
//! # Architecture
//!
//! - `core`: Data model, configuration, errors and the retry executor
//! - `storage`: The metric store and its two backends
//! - `telemetry`: Poller and reporting pipeline of the agent
//! - `wire`: Payload compression and signing
//! - `server`: Collector HTTP surface
//! - `cli`: Command-line interface for both binaries
//!
//! # Example
//!
//! ```no_run
//! use monitor_lib::core::{RetryConfig, StorageConfig};
//! use monitor_lib::storage;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> monitor_lib::core::Result<()> {
//!     let store = storage::open(&StorageConfig::in_memory(), &RetryConfig::default(), CancellationToken::new()).await?;
//!     store.set_gauge("Alloc", 1024.0).await?;
//!     store.add_counter("PollCount", 5).await?;
//!     println!("{}", store.dump_gauges().await?);
//!     store.close().await
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cli;
pub mod core;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod wire;

// Re-export core types for convenience
pub use crate::core::{MonitorError, Result};
