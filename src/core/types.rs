//! Metric data model shared by the agent and the collector.

use crate::core::MonitorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Point-in-time value, last write wins.
pub type Gauge = f64;

/// Accumulated value, updated by additive deltas.
pub type Counter = i64;

/// The two metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(MonitorError::invalid_metric(format!("unknown metric type '{}'", other))),
        }
    }
}

/// Payload of a record; exactly one per kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(Gauge),
    Counter(Counter),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

/// A single named metric update.
///
/// On the wire this is `{"id", "type", "delta"?, "value"?}`. Decoding rejects
/// records whose payload field does not match their type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetric", into = "WireMetric")]
pub struct MetricRecord {
    pub id: String,
    pub value: MetricValue,
}

impl MetricRecord {
    pub fn gauge(id: impl Into<String>, value: Gauge) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: Counter) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// Rejects gauges that have no JSON representation.
pub fn check_gauge(id: &str, value: Gauge) -> Result<(), MonitorError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MonitorError::invalid_metric(format!(
            "gauge '{}' must be finite, got {}",
            id, value
        )))
    }
}

/// Ordered, heterogeneous group of records sent or stored as one unit.
pub type MetricBatch = Vec<MetricRecord>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMetric {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<Counter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Gauge>,
}

impl TryFrom<WireMetric> for MetricRecord {
    type Error = MonitorError;

    fn try_from(wire: WireMetric) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(MonitorError::invalid_metric("metric id must not be empty"));
        }
        let value = match (wire.kind, wire.delta, wire.value) {
            (MetricKind::Gauge, None, Some(v)) => MetricValue::Gauge(v),
            (MetricKind::Counter, Some(d), None) => MetricValue::Counter(d),
            (kind, _, _) => {
                return Err(MonitorError::invalid_metric(format!(
                    "{} '{}' must carry exactly its own payload field",
                    kind, wire.id
                )))
            },
        };
        Ok(MetricRecord { id: wire.id, value })
    }
}

impl From<MetricRecord> for WireMetric {
    fn from(record: MetricRecord) -> Self {
        let (delta, value) = match record.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        WireMetric {
            id: record.id,
            kind: record.value.kind(),
            delta,
            value,
        }
    }
}

/// Lookup key used by the `/value/` endpoint: id and type, no payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}
