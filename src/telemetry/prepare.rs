use super::poll::{MetricSource, PollBuffer};
use crate::core::{MetricBatch, MetricRecord, Result};

/// Name of the counter reporting how many polls a batch covers.
pub const POLL_COUNT: &str = "PollCount";

/// Build the batch for one report from the buffered samples.
///
/// Samples are flattened in slot order, followed by the poll counter and the
/// host statistics. Non-finite readings are skipped, since the collector
/// rejects them. A host statistics failure drops the whole batch.
pub fn assemble(buffer: &PollBuffer, source: &mut dyn MetricSource) -> Result<MetricBatch> {
    let mut batch: MetricBatch = buffer
        .slots()
        .iter()
        .flat_map(|slot| slot.iter())
        .filter(|(_, value)| value.is_finite())
        .map(|(id, value)| MetricRecord::gauge(id.clone(), *value))
        .collect();

    let step = i64::try_from(buffer.report_step()).unwrap_or(i64::MAX);
    batch.push(MetricRecord::counter(POLL_COUNT, step));

    let host = source.host_stats()?;
    batch.extend(
        host.into_iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(id, value)| MetricRecord::gauge(id, value)),
    );
    Ok(batch)
}
