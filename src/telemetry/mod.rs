//! Agent side: poll metrics on a timer and report them to the collector.
//!
//! The [`Observer`] run loop samples its [`MetricSource`] into a
//! [`PollBuffer`] every poll interval. Every `report_step` polls it assembles
//! a batch and pushes it onto a bounded queue drained by `rate_limit`
//! delivery workers. A full queue blocks the poll loop; batches are never
//! dropped for lack of room.

pub mod poll;
pub mod prepare;
pub mod report;

pub use poll::{MetricSource, PollBuffer, Sample, SystemSource};
pub use prepare::{assemble, POLL_COUNT};
pub use report::{HttpReporter, Payload, Reporter};

use crate::core::{AgentConfig, MetricBatch, Result, RetryConfig};
use report::Worker;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Agent run loop.
pub struct Observer {
    config: AgentConfig,
    source: Box<dyn MetricSource>,
    reporter: Arc<dyn Reporter>,
    retry: RetryConfig,
}

impl Observer {
    /// Observer over `source` delivering through `reporter`. Fails if `config`
    /// does not validate.
    pub fn new(
        config: AgentConfig,
        source: Box<dyn MetricSource>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            reporter,
            retry: RetryConfig::default(),
        })
    }

    /// Replace the delivery retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Observer wired to the real host and the collector at
    /// `config.server_address`.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let reporter = HttpReporter::new(&config.server_address)?;
        Self::new(config, Box::new(SystemSource::new()), Arc::new(reporter))
    }

    /// Poll and report until `cancel` fires.
    ///
    /// Returns once every worker has stopped. Batches still queued at that
    /// point are discarded.
    pub async fn observe(mut self, cancel: CancellationToken) -> Result<()> {
        let report_step = self.config.report_step();
        let (queue, receiver) = mpsc::channel::<MetricBatch>(self.config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = JoinSet::new();
        for id in 0..self.config.rate_limit {
            let worker = Worker {
                id,
                queue: Arc::clone(&receiver),
                reporter: Arc::clone(&self.reporter),
                key: self.config.sign_key.clone(),
                retry: self.retry.clone(),
                cancel: cancel.clone(),
            };
            workers.spawn(worker.run());
        }

        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            report_step,
            workers = self.config.rate_limit,
            "Observer started"
        );

        let mut buffer = PollBuffer::new(report_step);
        let mut poll_count: u64 = 0;
        loop {
            buffer.poll(poll_count, self.source.as_mut());
            poll_count += 1;

            if poll_count % report_step as u64 == 0 {
                match assemble(&buffer, self.source.as_mut()) {
                    Ok(batch) => {
                        let sent = tokio::select! {
                            biased;
                            () = cancel.cancelled() => false,
                            sent = queue.send(batch) => sent.is_ok(),
                        };
                        if !sent {
                            break;
                        }
                    },
                    Err(e) => tracing::warn!(error = %e, "Failed to assemble batch, skipping report"),
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }

        drop(queue);
        while let Some(joined) = workers.join_next().await {
            joined?;
        }
        tracing::info!(polls = poll_count, "Observer stopped");
        Ok(())
    }
}
