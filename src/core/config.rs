//! Configuration for the agent and the collector.
//!
//! Both configurations can be loaded from YAML and are then overridden by
//! environment variables and CLI arguments (see [`crate::cli`]).

use crate::core::{Result, MonitorError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default bound of the delivery queue, in batches.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// HMAC key shared by agent and collector. Empty means signing is disabled.
///
/// Serialized as base64.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a base64 key; an empty string yields the disabled key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        STANDARD
            .decode(encoded.trim())
            .map(Self)
            .map_err(|e| MonitorError::config(format!("signing key is not valid base64: {}", e)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("SigningKey(disabled)")
        } else {
            write!(f, "SigningKey({} bytes)", self.0.len())
        }
    }
}

impl Serialize for SigningKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SigningKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        SigningKey::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector address, `host:port`
    pub server_address: String,
    /// Interval between two polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Interval between two reports; a multiple of the poll interval
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Key used to sign outgoing payloads
    pub sign_key: SigningKey,
    /// Number of concurrent delivery workers
    pub rate_limit: usize,
    /// Bound of the delivery queue, in batches
    pub queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_address: "localhost:8080".to_string(),
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            sign_key: SigningKey::default(),
            rate_limit: 5,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl AgentConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MonitorError::config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_address.is_empty() {
            return Err(MonitorError::config("server address must not be empty"));
        }
        if self.poll_interval.is_zero() || self.report_interval.is_zero() {
            return Err(MonitorError::config("poll and report intervals must be positive"));
        }
        if self.report_interval < self.poll_interval
            || self.report_interval.as_nanos() % self.poll_interval.as_nanos() != 0
        {
            return Err(MonitorError::config(format!(
                "report interval {:?} must be a multiple of poll interval {:?}",
                self.report_interval, self.poll_interval
            )));
        }
        if self.rate_limit == 0 {
            return Err(MonitorError::config("rate limit must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(MonitorError::config("queue capacity must be greater than 0"));
        }
        Ok(())
    }

    /// Number of polls per report.
    pub fn report_step(&self) -> usize {
        let step = self.report_interval.as_nanos() / self.poll_interval.as_nanos().max(1);
        usize::try_from(step).unwrap_or(usize::MAX).max(1)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Relational backend connection string; `None` skips the relational attempt
    pub database_dsn: Option<String>,
    /// Fallback file; `None` keeps the local store purely in memory
    pub file_storage_path: Option<PathBuf>,
    /// Period of whole-store snapshots; zero flushes on every mutation
    #[serde(with = "humantime_serde")]
    pub store_interval: Duration,
    /// Load the fallback file on start
    pub restore: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_dsn: None,
            file_storage_path: Some(PathBuf::from("/tmp/metrics-db.json")),
            store_interval: Duration::from_secs(300),
            restore: true,
        }
    }
}

impl StorageConfig {
    /// Purely in-memory local store.
    pub fn in_memory() -> Self {
        StorageConfig {
            database_dsn: None,
            file_storage_path: None,
            store_interval: Duration::ZERO,
            restore: false,
        }
    }

    pub fn is_sync_flush(&self) -> bool {
        self.store_interval.is_zero()
    }
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    pub address: String,
    /// Key used to verify requests and sign responses
    pub sign_key: SigningKey,
    /// Storage configuration
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "localhost:8080".to_string(),
            sign_key: SigningKey::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| MonitorError::config(format!("Failed to parse YAML config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(MonitorError::config("listen address must not be empty"));
        }
        if matches!(&self.storage.database_dsn, Some(dsn) if dsn.is_empty()) {
            return Err(MonitorError::config("database DSN must not be empty when set"));
        }
        Ok(())
    }
}
