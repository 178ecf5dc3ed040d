//! Local metric store: two maps behind one lock, optionally mirrored to a file.
//!
//! The file always holds the whole store as a single JSON object
//! (`{"DataGauge": {...}, "DataCounter": {...}}`) and is rewritten in full on
//! every flush. With a zero store interval every mutation flushes; otherwise
//! a background task snapshots the store periodically until shutdown.
//!
//! Batches are applied under a single lock hold, so concurrent writers never
//! observe half a batch. There is no rollback: a batch interrupted by a fault
//! midway stays partially applied.

use super::{check_batch, render, MetricStorage, StoreKind};
use crate::core::{
    check_gauge, retry_with_config, Counter, Failure, Gauge, MetricKind, MetricRecord, MetricValue,
    MonitorError, Result, RetryConfig, RetryExt, StorageConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Contents of the local store, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "DataGauge", default)]
    pub gauges: BTreeMap<String, Gauge>,
    #[serde(rename = "DataCounter", default)]
    pub counters: BTreeMap<String, Counter>,
}

/// Backing file of a local store.
struct FileSink {
    path: PathBuf,
    handle: tokio::sync::Mutex<Option<File>>,
    retry: RetryConfig,
}

impl FileSink {
    /// Rewrite the file with the current contents of `data`.
    ///
    /// The file lock is taken before the snapshot so that concurrent flushes
    /// land in snapshot order. Shutdown does not abort a flush.
    async fn flush(&self, data: &Mutex<Snapshot>) -> Result<()> {
        let uncancellable = CancellationToken::new();
        retry_with_config(&self.retry, &uncancellable, move || self.write_snapshot(data)).await?;
        Ok(())
    }

    async fn write_snapshot(&self, data: &Mutex<Snapshot>) -> std::result::Result<(), Failure<MonitorError>> {
        let mut handle = self.handle.lock().await;
        let Some(file) = handle.as_mut() else {
            return Ok(());
        };

        let mut encoded = serde_json::to_vec(&*data.lock()).map_err(MonitorError::from)?;
        encoded.push(b'\n');

        rewrite(file, &encoded)
            .await
            .map_err(|e| MonitorError::from(e).retriable())
    }

    /// Final flush, then release the handle.
    async fn close(&self, data: &Mutex<Snapshot>) -> Result<()> {
        self.flush(data).await?;
        if self.handle.lock().await.take().is_some() {
            tracing::info!(path = ?self.path, "Closed storage file");
        }
        Ok(())
    }
}

async fn rewrite(file: &mut File, contents: &[u8]) -> std::io::Result<()> {
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_data().await
}

/// In-process metric store.
pub struct LocalStorage {
    data: Arc<Mutex<Snapshot>>,
    file: Option<Arc<FileSink>>,
    sync_flush: bool,
    flusher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LocalStorage {
    /// A purely in-memory store with no durability.
    pub fn in_memory() -> Self {
        Self {
            data: Arc::new(Mutex::new(Snapshot::default())),
            file: None,
            sync_flush: false,
            flusher: Mutex::new(None),
        }
    }

    /// Open the local store described by `config`.
    ///
    /// Opening the file is retried; if it still fails the error is returned.
    /// A file that cannot be decoded on restore is ignored and the store
    /// starts empty.
    pub async fn open(config: &StorageConfig, retry: RetryConfig, cancel: CancellationToken) -> Result<Self> {
        let path = config
            .file_storage_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty());
        let Some(path) = path else {
            tracing::info!("Initialized in-memory storage without durability");
            return Ok(Self::in_memory());
        };

        let mut file = retry_with_config(&retry, &cancel, move || open_file(path)).await?;

        let snapshot = if config.restore {
            restore(&mut file, path).await
        } else {
            Snapshot::default()
        };

        let sink = Arc::new(FileSink {
            path: path.to_path_buf(),
            handle: tokio::sync::Mutex::new(Some(file)),
            retry,
        });

        let mut storage = Self {
            data: Arc::new(Mutex::new(snapshot)),
            file: Some(Arc::clone(&sink)),
            sync_flush: config.is_sync_flush(),
            flusher: Mutex::new(None),
        };

        if !storage.sync_flush {
            let token = cancel.child_token();
            let handle = spawn_flusher(
                Arc::clone(&storage.data),
                sink,
                config.store_interval,
                token.clone(),
            );
            storage.flusher = Mutex::new(Some((token, handle)));
        }

        tracing::info!(
            path = ?path,
            sync = storage.sync_flush,
            "Initialized local storage"
        );
        Ok(storage)
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Snapshot {
        self.data.lock().clone()
    }

    async fn after_mutation(&self) -> Result<()> {
        match &self.file {
            Some(file) if self.sync_flush => file.flush(&self.data).await,
            _ => Ok(()),
        }
    }
}

async fn open_file(path: &Path) -> std::result::Result<File, Failure<MonitorError>> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| MonitorError::from(e).retriable())
}

async fn restore(file: &mut File, path: &Path) -> Snapshot {
    let mut contents = Vec::new();
    if let Err(e) = file.read_to_end(&mut contents).await {
        tracing::warn!(path = ?path, error = %e, "Failed to read storage file, starting empty");
        return Snapshot::default();
    }
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Snapshot::default();
    }
    match serde_json::from_slice::<Snapshot>(&contents) {
        Ok(snapshot) => {
            tracing::info!(
                gauges = snapshot.gauges.len(),
                counters = snapshot.counters.len(),
                "Restored metrics from storage file"
            );
            snapshot
        },
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Failed to decode storage file, starting empty");
            Snapshot::default()
        },
    }
}

fn spawn_flusher(
    data: Arc<Mutex<Snapshot>>,
    file: Arc<FileSink>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = file.flush(&data).await {
                        tracing::warn!(error = %e, "Periodic storage flush failed");
                    }
                },
            }
        }
        tracing::debug!("Storage flusher stopped");
    })
}

#[async_trait::async_trait]
impl MetricStorage for LocalStorage {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn set_gauge(&self, id: &str, value: Gauge) -> Result<()> {
        check_gauge(id, value)?;
        self.data.lock().gauges.insert(id.to_string(), value);
        self.after_mutation().await
    }

    async fn set_gauge_batch(&self, batch: &[MetricRecord]) -> Result<()> {
        check_batch(batch, MetricKind::Gauge)?;
        {
            let mut data = self.data.lock();
            for record in batch {
                if let MetricValue::Gauge(value) = record.value {
                    data.gauges.insert(record.id.clone(), value);
                }
            }
        }
        self.after_mutation().await
    }

    async fn add_counter(&self, id: &str, delta: Counter) -> Result<()> {
        {
            let mut data = self.data.lock();
            let counter = data.counters.entry(id.to_string()).or_insert(0);
            *counter = counter.saturating_add(delta);
        }
        self.after_mutation().await
    }

    async fn add_counter_batch(&self, batch: &[MetricRecord]) -> Result<()> {
        check_batch(batch, MetricKind::Counter)?;
        {
            let mut data = self.data.lock();
            for record in batch {
                if let MetricValue::Counter(delta) = record.value {
                    let counter = data.counters.entry(record.id.clone()).or_insert(0);
                    *counter = counter.saturating_add(delta);
                }
            }
        }
        self.after_mutation().await
    }

    async fn get_gauge(&self, id: &str) -> Result<Option<Gauge>> {
        Ok(self.data.lock().gauges.get(id).copied())
    }

    async fn get_counter(&self, id: &str) -> Result<Option<Counter>> {
        Ok(self.data.lock().counters.get(id).copied())
    }

    async fn dump_gauges(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.data.lock().gauges)?)
    }

    async fn dump_counters(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.data.lock().counters)?)
    }

    async fn render_all_gauges(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let data = self.data.lock();
        render::render_entries(data.gauges.iter().map(|(k, v)| (k.as_str(), v)), sink)
    }

    async fn render_all_counters(&self, sink: &mut (dyn Write + Send)) -> Result<()> {
        let data = self.data.lock();
        render::render_entries(data.counters.iter().map(|(k, v)| (k.as_str(), v)), sink)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let flusher = self.flusher.lock().take();
        if let Some((token, handle)) = flusher {
            token.cancel();
            handle.await?;
        }
        match &self.file {
            Some(file) => file.close(&self.data).await,
            None => Ok(()),
        }
    }
}
