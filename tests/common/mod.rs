//! Common test utilities and fixtures.

#![allow(dead_code)]

use monitor_lib::core::{Failure, Gauge, MetricBatch, MetricValue, MonitorError, Result};
use monitor_lib::telemetry::{MetricSource, Payload, Reporter, Sample};
use monitor_lib::wire;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Gauge carrying the poll sequence number of a sample.
pub const SEQ: &str = "Seq";

/// Source producing one `Seq` gauge per poll and fixed host statistics.
pub struct ScriptedSource {
    polls: u64,
    assembled: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let assembled = Arc::new(AtomicUsize::new(0));
        (
            Self {
                polls: 0,
                assembled: Arc::clone(&assembled),
            },
            assembled,
        )
    }
}

impl MetricSource for ScriptedSource {
    fn sample_runtime(&mut self, sample: &mut Sample) {
        sample.insert(SEQ.to_string(), self.polls as f64);
        sample.insert("RandomValue".to_string(), 0.5);
        self.polls += 1;
    }

    fn host_stats(&mut self) -> Result<Vec<(String, Gauge)>> {
        self.assembled.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ("TotalMemory".to_string(), 8.0 * 1024.0 * 1024.0 * 1024.0),
            ("FreeMemory".to_string(), 1024.0 * 1024.0 * 1024.0),
            ("CPUutilization0".to_string(), 12.5),
        ])
    }
}

/// Decode a payload body back into its batch.
pub fn decode(payload: &Payload) -> MetricBatch {
    let json = wire::decompress(&payload.body).expect("payload should be gzip");
    serde_json::from_slice(&json).expect("payload should be a JSON batch")
}

/// Sequence numbers carried by a batch.
pub fn sequence_of(batch: &MetricBatch) -> Vec<u64> {
    batch
        .iter()
        .filter(|record| record.id == SEQ)
        .filter_map(|record| match record.value {
            MetricValue::Gauge(value) => Some(value as u64),
            MetricValue::Counter(_) => None,
        })
        .collect()
}

/// Reporter that holds every delivery until the gate is opened.
pub struct GatedReporter {
    gate: Semaphore,
    delivered: Mutex<Vec<MetricBatch>>,
}

impl GatedReporter {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn open() -> Arc<Self> {
        let reporter = Self::closed();
        reporter.release();
        reporter
    }

    pub fn release(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn delivered(&self) -> Vec<MetricBatch> {
        self.delivered.lock().clone()
    }
}

#[async_trait::async_trait]
impl Reporter for GatedReporter {
    async fn deliver(&self, payload: &Payload) -> std::result::Result<(), Failure<MonitorError>> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| MonitorError::storage("gate closed"))?;
        permit.forget();
        self.delivered.lock().push(decode(payload));
        Ok(())
    }
}
