//! Batch delivery: the reporter seam and the worker loop feeding it.

use crate::core::{
    retry_with_config, Failure, MetricBatch, MonitorError, Result, RetryConfig, RetryExt,
    SigningKey,
};
use crate::wire::{self, SIGNATURE_HEADER, UPDATES_PATH};
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An encoded batch ready to go on the wire.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Gzip-compressed JSON array of records
    pub body: Bytes,
    /// Base64 HMAC of `body`, when signing is enabled
    pub signature: Option<String>,
}

impl Payload {
    /// Encode, compress and optionally sign a batch.
    pub fn encode(batch: &MetricBatch, key: &SigningKey) -> Result<Self> {
        let json = serde_json::to_vec(batch)?;
        let body = wire::compress(&json)?;
        let signature = (!key.is_empty()).then(|| wire::sign(key, &body));
        Ok(Self {
            body: Bytes::from(body),
            signature,
        })
    }
}

/// Sends payloads to the collector.
///
/// Implementations tag transient failures as retriable; everything else is
/// terminal and the batch is dropped.
#[async_trait::async_trait]
pub trait Reporter: Send + Sync {
    async fn deliver(&self, payload: &Payload) -> std::result::Result<(), Failure<MonitorError>>;
}

/// [`Reporter`] posting to the collector over HTTP.
pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
}

impl HttpReporter {
    pub fn new(server_address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: format!("http://{}{}", server_address, UPDATES_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Reporter for HttpReporter {
    async fn deliver(&self, payload: &Payload) -> std::result::Result<(), Failure<MonitorError>> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(payload.body.clone());
        if let Some(signature) = &payload.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                MonitorError::from(e).terminal()
            } else {
                MonitorError::from(e).retriable()
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(MonitorError::Rejected {
                status: status.as_u16(),
            }
            .terminal())
        }
    }
}

/// Queue end shared by all workers.
pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<MetricBatch>>>;

pub(crate) struct Worker {
    pub id: usize,
    pub queue: SharedQueue,
    pub reporter: Arc<dyn Reporter>,
    pub key: SigningKey,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
}

impl Worker {
    /// Deliver batches until the queue closes or shutdown is requested.
    pub async fn run(self) {
        tracing::debug!(worker = self.id, "Delivery worker started");
        loop {
            let batch = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                batch = async { self.queue.lock().await.recv().await } => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.send(&batch).await;
        }
        tracing::debug!(worker = self.id, "Delivery worker stopped");
    }

    async fn send(&self, batch: &MetricBatch) {
        let payload = match Payload::encode(batch, &self.key) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "Failed to encode batch, dropping it");
                return;
            },
        };

        let reporter = &self.reporter;
        let payload = &payload;
        match retry_with_config(&self.retry, &self.cancel, move || reporter.deliver(payload)).await {
            Ok(()) => tracing::debug!(worker = self.id, records = batch.len(), "Delivered batch"),
            Err(e) => {
                let e = MonitorError::from(e);
                if e.is_cancelled() {
                    tracing::debug!(worker = self.id, "Delivery abandoned on shutdown");
                } else {
                    tracing::warn!(
                        worker = self.id,
                        category = e.category(),
                        error = %e,
                        "Failed to deliver batch, dropping it"
                    );
                }
            },
        }
    }
}
