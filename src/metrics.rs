//! Metrics provider capability consumed by the idle reaper

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Instance metrics the reaper understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    CpuUtilization,
    NetworkIn,
    NetworkOut,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::CpuUtilization => "CPUUtilization",
            MetricName::NetworkIn => "NetworkIn",
            MetricName::NetworkOut => "NetworkOut",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation applied over the query window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Average,
    Sum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub metric: MetricName,
    pub instance_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub statistic: Statistic,
}

/// One aggregated value. CPU values are percentages, network values bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("{statistic:?} is not supported for {metric}")]
    UnsupportedStatistic { metric: MetricName, statistic: Statistic },
    #[error("metrics unavailable for {instance_id}: {reason}")]
    Unavailable { instance_id: String, reason: String },
}

/// Source of windowed instance metrics.
///
/// A query covering the whole window is expected to yield at most one
/// datapoint; an empty result means no data for the window.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError>;
}
