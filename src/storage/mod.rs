//! Metric storage.
//!
//! A store is either relational (PostgreSQL) or local (in-memory maps,
//! optionally mirrored to a JSON file). [`open`] picks the backend once at
//! startup: the relational backend is preferred when a connection string is
//! configured, and any failure to bring it up downgrades to the local
//! backend. The choice never changes afterwards.

use crate::core::{
    check_gauge, Counter, Gauge, MetricKind, MetricRecord, MetricValue, MonitorError, Result,
    RetryConfig, StorageConfig,
};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod local;
pub mod postgres;
pub mod render;

pub use local::{LocalStorage, Snapshot};
pub use postgres::PgStorage;

/// Which backend a store runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Relational,
    Local,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::Local => "local",
        }
    }
}

/// Storage capability shared by both backends.
///
/// Gauges are last-write-wins, counters accumulate deltas. A miss on
/// `get_*` is `Ok(None)`, not an error.
#[async_trait::async_trait]
pub trait MetricStorage: Send + Sync {
    /// Backend this store runs on.
    fn kind(&self) -> StoreKind;

    /// Insert or overwrite a gauge. Non-finite values are rejected.
    async fn set_gauge(&self, id: &str, value: Gauge) -> Result<()>;

    /// Insert or overwrite a batch of gauges.
    ///
    /// Every record must be a gauge. The relational backend commits the batch
    /// in one transaction; the local backend applies it under one lock hold.
    async fn set_gauge_batch(&self, batch: &[MetricRecord]) -> Result<()>;

    /// Add a delta to a counter, creating it at zero if missing.
    async fn add_counter(&self, id: &str, delta: Counter) -> Result<()>;

    /// Add a batch of counter deltas. Every record must be a counter.
    async fn add_counter_batch(&self, batch: &[MetricRecord]) -> Result<()>;

    /// Current value of a gauge.
    async fn get_gauge(&self, id: &str) -> Result<Option<Gauge>>;

    /// Current value of a counter.
    async fn get_counter(&self, id: &str) -> Result<Option<Counter>>;

    /// All gauges as a compact JSON object of id to value.
    async fn dump_gauges(&self) -> Result<String>;

    /// All counters as a compact JSON object of id to value.
    async fn dump_counters(&self) -> Result<String>;

    /// Stream an HTML rendering of all gauges.
    async fn render_all_gauges(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    /// Stream an HTML rendering of all counters.
    async fn render_all_counters(&self, sink: &mut (dyn Write + Send)) -> Result<()>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Release the backend. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Reject a batch holding a record of the wrong kind or a non-finite gauge.
/// Runs before anything is written.
pub(crate) fn check_batch(batch: &[MetricRecord], expected: MetricKind) -> Result<()> {
    for record in batch {
        if record.kind() != expected {
            return Err(MonitorError::invalid_metric(format!(
                "{} batch contains {} '{}'",
                expected,
                record.kind(),
                record.id
            )));
        }
        if let MetricValue::Gauge(value) = record.value {
            check_gauge(&record.id, value)?;
        }
    }
    Ok(())
}

/// Open the metric store described by `config`.
///
/// Only a failure to open a configured fallback file is returned as an
/// error; an unavailable relational backend is logged and skipped.
pub async fn open(
    config: &StorageConfig,
    retry: &RetryConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn MetricStorage>> {
    if let Some(dsn) = config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty()) {
        match PgStorage::connect(dsn, retry.clone(), cancel.clone()).await {
            Ok(storage) => {
                tracing::info!("Initialized relational storage");
                return Ok(Arc::new(storage));
            },
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Failed to init relational storage, falling back to local storage"
                );
            },
        }
    }

    let storage = LocalStorage::open(config, retry.clone(), cancel).await?;
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_check_batch() {
        let gauges = [MetricRecord::gauge("a", 1.0), MetricRecord::gauge("b", 2.0)];
        assert!(check_batch(&gauges, MetricKind::Gauge).is_ok());
        assert!(check_batch(&gauges, MetricKind::Counter).is_err());

        let poisoned = [MetricRecord::gauge("a", 1.0), MetricRecord::gauge("b", f64::NAN)];
        assert!(matches!(
            check_batch(&poisoned, MetricKind::Gauge),
            Err(MonitorError::InvalidMetric(_))
        ));
    }

    #[tokio::test]
    async fn test_open_without_dsn_is_local() {
        let store = open(&StorageConfig::in_memory(), &RetryConfig::none(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.kind(), StoreKind::Local);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_database_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            database_dsn: Some("host=127.0.0.1 port=1 user=nobody connect_timeout=1".to_string()),
            file_storage_path: Some(dir.path().join("metrics.json")),
            store_interval: Duration::ZERO,
            restore: false,
        };

        let store = open(&config, &RetryConfig::immediate(1), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.kind(), StoreKind::Local);

        store.set_gauge("Apple", 3.0).await.unwrap();
        assert_eq!(store.get_gauge("Apple").await.unwrap(), Some(3.0));
        store.close().await.unwrap();
    }
}
