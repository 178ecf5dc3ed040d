//! Command-line interface for the agent and the collector.
//!
//! Configuration precedence, highest first:
//! 1. CLI arguments
//! 2. Environment variables
//! 3. Config file (`--config`, or `~/.config/monitor/<agent|server>.yaml`)
//! 4. Defaults

use crate::core::{AgentConfig, MonitorError, Result, RetryConfig, ServerConfig, SigningKey};
use crate::telemetry::Observer;
use crate::server::Collector;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Metrics agent: polls host and process metrics and reports them to a collector.
#[derive(Parser, Debug)]
#[command(name = "monitor-agent")]
#[command(version, about, long_about = None)]
pub struct AgentCli {
    /// Collector address, host:port
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Poll interval in seconds
    #[arg(short = 'p', long, env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Report interval in seconds; a multiple of the poll interval
    #[arg(short = 'r', long, env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Base64 key used to sign payloads
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Maximum number of concurrent outgoing requests
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,

    /// Configuration file path (default: ~/.config/monitor/agent.yaml)
    #[arg(short = 'c', long, env = "MONITOR_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl AgentCli {
    pub async fn load_config(&self) -> Result<AgentConfig> {
        let config = match read_config_file(self.config.as_deref(), "agent.yaml").await? {
            Some(yaml) => AgentConfig::from_yaml(&yaml)?,
            None => AgentConfig::default(),
        };
        self.apply(config)
    }

    /// Apply CLI and environment overrides on top of `config`.
    pub fn apply(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        if let Some(address) = &self.address {
            config.server_address = address.clone();
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.report_interval {
            config.report_interval = Duration::from_secs(secs);
        }
        if let Some(key) = &self.key {
            config.sign_key = SigningKey::from_base64(key)?;
        }
        if let Some(limit) = self.rate_limit {
            config.rate_limit = limit;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Metrics collector: stores agent updates and serves them over HTTP.
#[derive(Parser, Debug)]
#[command(name = "monitor-server")]
#[command(version, about, long_about = None)]
pub struct ServerCli {
    /// Listen address, host:port
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Seconds between snapshots of the local store; 0 writes on every update
    #[arg(short = 'i', long, env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,

    /// Local store file; empty keeps metrics in memory only
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<String>,

    /// Load the local store file on start
    #[arg(short = 'r', long, env = "RESTORE", num_args = 0..=1, default_missing_value = "true")]
    pub restore: Option<bool>,

    /// PostgreSQL connection string; empty skips the database
    #[arg(short = 'd', long, env = "DATABASE_DSN", hide_env_values = true)]
    pub database_dsn: Option<String>,

    /// Base64 key used to verify requests and sign responses
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Configuration file path (default: ~/.config/monitor/server.yaml)
    #[arg(short = 'c', long, env = "MONITOR_SERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ServerCli {
    pub async fn load_config(&self) -> Result<ServerConfig> {
        let config = match read_config_file(self.config.as_deref(), "server.yaml").await? {
            Some(yaml) => ServerConfig::from_yaml(&yaml)?,
            None => ServerConfig::default(),
        };
        self.apply(config)
    }

    /// Apply CLI and environment overrides on top of `config`.
    pub fn apply(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(secs) = self.store_interval {
            config.storage.store_interval = Duration::from_secs(secs);
        }
        if let Some(path) = &self.file_storage_path {
            config.storage.file_storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(restore) = self.restore {
            config.storage.restore = restore;
        }
        if let Some(dsn) = &self.database_dsn {
            config.storage.database_dsn = (!dsn.is_empty()).then(|| dsn.clone());
        }
        if let Some(key) = &self.key {
            config.sign_key = SigningKey::from_base64(key)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Read the explicit config file, or the default one if it exists.
///
/// A missing default file is not an error; a missing explicit one is.
async fn read_config_file(explicit: Option<&Path>, file_name: &str) -> Result<Option<String>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match dirs::config_dir().map(|dir| dir.join("monitor").join(file_name)) {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            tracing::info!("Loaded configuration from: {:?}", path);
            Ok(Some(content))
        },
        Err(e) if explicit.is_some() => Err(MonitorError::config(format!(
            "Failed to read config file {:?}: {}",
            path, e
        ))),
        Err(e) => {
            tracing::debug!("Could not read {:?} ({}), using defaults", path, e);
            Ok(None)
        },
    }
}

/// Initialize logging. `RUST_LOG` wins over `level`, which defaults to `info`.
pub fn init_logging(level: Option<&str>) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .map_err(|e| MonitorError::config(format!("Invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .compact(),
        )
        .try_init()
        .map_err(|e| MonitorError::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl-C, shutting down");
        token.cancel();
    });
}

/// Run the agent until Ctrl-C.
pub async fn execute_agent(cli: AgentCli) -> Result<()> {
    init_logging(cli.log_level.as_deref())?;
    let config = cli.load_config().await?;
    tracing::info!(
        address = %config.server_address,
        poll_interval = ?config.poll_interval,
        report_interval = ?config.report_interval,
        rate_limit = config.rate_limit,
        signing = !config.sign_key.is_empty(),
        "Starting agent"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    Observer::from_config(config)?.observe(cancel).await
}

/// Run the collector until Ctrl-C, then close the store.
pub async fn execute_server(cli: ServerCli) -> Result<()> {
    init_logging(cli.log_level.as_deref())?;
    let config = cli.load_config().await?;
    tracing::info!(
        address = %config.address,
        file = ?config.storage.file_storage_path,
        store_interval = ?config.storage.store_interval,
        restore = config.storage.restore,
        database = config.storage.database_dsn.is_some(),
        "Starting collector"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let collector = Collector::open(&config.storage, &RetryConfig::default(), &cancel).await?;
    let served = collector.serve(&config.address, config.sign_key.clone(), cancel).await;

    let closed = collector.close().await;
    served?;
    closed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_flags_override_defaults() {
        let cli = AgentCli::try_parse_from(["monitor-agent", "-a", "collector:9000", "-p", "1", "-r", "3", "-l", "2"])
            .unwrap();
        let config = cli.apply(AgentConfig::default()).unwrap();
        assert_eq!(config.server_address, "collector:9000");
        assert_eq!(config.report_step(), 3);
        assert_eq!(config.rate_limit, 2);
    }

    #[test]
    fn test_agent_rejects_misaligned_intervals() {
        let cli = AgentCli::try_parse_from(["monitor-agent", "-p", "3", "-r", "10"]).unwrap();
        assert!(cli.apply(AgentConfig::default()).is_err());
    }

    #[test]
    fn test_agent_rejects_bad_key() {
        let cli = AgentCli::try_parse_from(["monitor-agent", "-k", "@@@"]).unwrap();
        assert!(cli.apply(AgentConfig::default()).is_err());
    }

    #[test]
    fn test_server_empty_values_disable_backends() {
        let cli = ServerCli::try_parse_from(["monitor-server", "-f", "", "-d", "", "-i", "0", "-r", "false"]).unwrap();
        let config = cli.apply(ServerConfig::default()).unwrap();
        assert_eq!(config.storage.file_storage_path, None);
        assert_eq!(config.storage.database_dsn, None);
        assert!(config.storage.is_sync_flush());
        assert!(!config.storage.restore);
    }

    #[test]
    fn test_server_bare_restore_flag() {
        let cli = ServerCli::try_parse_from(["monitor-server", "-r"]).unwrap();
        assert_eq!(cli.restore, Some(true));

        let cli = ServerCli::try_parse_from(["monitor-server", "-r", "-i", "5"]).unwrap();
        assert_eq!(cli.restore, Some(true));
        assert_eq!(cli.store_interval, Some(5));

        let cli = ServerCli::try_parse_from(["monitor-server", "--restore", "false"]).unwrap();
        let config = cli.apply(ServerConfig::default()).unwrap();
        assert!(!config.storage.restore);
    }

    #[test]
    fn test_server_flags_keep_file_defaults() {
        let cli = ServerCli::try_parse_from(["monitor-server", "-k", "c2VjcmV0"]).unwrap();
        let config = cli.apply(ServerConfig::default()).unwrap();
        assert_eq!(config.sign_key.as_bytes(), b"secret");
        assert_eq!(
            config.storage.file_storage_path.as_deref(),
            Some(Path::new("/tmp/metrics-db.json"))
        );
    }

    #[tokio::test]
    async fn test_missing_explicit_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(read_config_file(Some(&missing), "agent.yaml").await.is_err());
    }
}
