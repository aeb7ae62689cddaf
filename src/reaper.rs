//! Idle instance reaper
//!
//! One pass lists running instances of the reapable types, pulls CPU and
//! network aggregates over a trailing window for each, and stops the ones
//! below every threshold. Instances are evaluated independently: a metrics or
//! stop failure on one never prevents evaluation of the rest.

use crate::config::{ReaperConfig, MAX_REAP_WINDOW_SECS};
use crate::instance::{InstanceError, InstanceManager};
use crate::metrics::{MetricName, MetricQuery, MetricsError, MetricsProvider, Statistic};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stop thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleThresholds {
    /// CPU average (percent) above which an instance is active
    pub cpu_percent: f64,
    /// Network in or out (bytes) above which an instance is active
    pub network_bytes: f64,
}

impl IdleThresholds {
    pub fn from_config(config: &ReaperConfig) -> Self {
        Self {
            cpu_percent: config.cpu_threshold_percent,
            network_bytes: config.network_threshold_bytes,
        }
    }
}

/// Aggregates for one instance over one window. `None` means no datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleWindow {
    pub instance_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub cpu_average: Option<f64>,
    pub network_in_sum: Option<f64>,
    pub network_out_sum: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    /// No CPU datapoint: treated as possibly active
    NoCpuData,
    CpuActive,
    NetworkInActive,
    NetworkOutActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    Stop,
    Keep(KeepReason),
}

/// Apply the stop policy.
///
/// Only the CPU check treats missing data as activity; missing network
/// datapoints do not block a stop.
pub fn evaluate(window: &IdleWindow, thresholds: &IdleThresholds) -> IdleDecision {
    let Some(cpu) = window.cpu_average else {
        return IdleDecision::Keep(KeepReason::NoCpuData);
    };
    if cpu > thresholds.cpu_percent {
        return IdleDecision::Keep(KeepReason::CpuActive);
    }
    if window.network_in_sum.is_some_and(|bytes| bytes > thresholds.network_bytes) {
        return IdleDecision::Keep(KeepReason::NetworkInActive);
    }
    if window.network_out_sum.is_some_and(|bytes| bytes > thresholds.network_bytes) {
        return IdleDecision::Keep(KeepReason::NetworkOutActive);
    }
    IdleDecision::Stop
}

/// Outcome of one reaper pass
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub evaluated: usize,
    pub stopped: Vec<String>,
    pub kept: Vec<String>,
    /// Instances whose metrics or stop command failed (never stopped by this pass)
    pub failed: Vec<String>,
}

pub struct IdleReaper {
    instances: Arc<dyn InstanceManager>,
    metrics: Arc<dyn MetricsProvider>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(
        instances: Arc<dyn InstanceManager>,
        metrics: Arc<dyn MetricsProvider>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            instances,
            metrics,
            config,
        }
    }

    /// Run one pass over the window ending now
    pub async fn run_once(&self) -> Result<ReapReport, InstanceError> {
        self.run_at(Utc::now()).await
    }

    /// Run one pass over the window ending at `end`.
    ///
    /// Fails only when the running instances cannot be listed.
    pub async fn run_at(&self, end: DateTime<Utc>) -> Result<ReapReport, InstanceError> {
        let types = self.config.instance_type_set();
        let candidates = self.instances.list_running(&types).await?;

        let window = chrono::Duration::seconds(self.config.window_secs.min(MAX_REAP_WINDOW_SECS) as i64);
        let start = end - window;
        let thresholds = IdleThresholds::from_config(&self.config);

        let mut report = ReapReport::default();

        for instance_id in candidates {
            report.evaluated += 1;

            let idle = match self.fetch_window(&instance_id, start, end).await {
                Ok(idle) => idle,
                Err(e) => {
                    warn!(instance_id, error = %e, "Failed to fetch metrics, keeping instance");
                    report.failed.push(instance_id);
                    continue;
                }
            };

            let cpu = idle.cpu_average.unwrap_or(0.0);
            let network_in_kb = idle.network_in_sum.unwrap_or(0.0) / 1024.0;
            let network_out_kb = idle.network_out_sum.unwrap_or(0.0) / 1024.0;

            match evaluate(&idle, &thresholds) {
                IdleDecision::Stop => match self.instances.stop(&instance_id).await {
                    Ok(()) => {
                        info!(
                            instance_id,
                            cpu_percent = format!("{:.2}", cpu),
                            network_in_kb = format!("{:.2}", network_in_kb),
                            network_out_kb = format!("{:.2}", network_out_kb),
                            "Stopped idle instance"
                        );
                        report.stopped.push(instance_id);
                    }
                    Err(e) => {
                        error!(instance_id, error = %e, "Failed to stop idle instance");
                        report.failed.push(instance_id);
                    }
                },
                IdleDecision::Keep(reason) => {
                    info!(
                        instance_id,
                        reason = ?reason,
                        cpu_percent = format!("{:.2}", cpu),
                        network_in_kb = format!("{:.2}", network_in_kb),
                        network_out_kb = format!("{:.2}", network_out_kb),
                        "Instance is active"
                    );
                    report.kept.push(instance_id);
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            stopped = report.stopped.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "Idle check completed"
        );

        Ok(report)
    }

    async fn fetch_window(
        &self,
        instance_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<IdleWindow, MetricsError> {
        let cpu_average = self
            .first_value(instance_id, MetricName::CpuUtilization, Statistic::Average, start, end)
            .await?;
        let network_in_sum = self
            .first_value(instance_id, MetricName::NetworkIn, Statistic::Sum, start, end)
            .await?;
        let network_out_sum = self
            .first_value(instance_id, MetricName::NetworkOut, Statistic::Sum, start, end)
            .await?;

        Ok(IdleWindow {
            instance_id: instance_id.to_string(),
            start,
            end,
            cpu_average,
            network_in_sum,
            network_out_sum,
        })
    }

    async fn first_value(
        &self,
        instance_id: &str,
        metric: MetricName,
        statistic: Statistic,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>, MetricsError> {
        let query = MetricQuery {
            metric,
            instance_id: instance_id.to_string(),
            start,
            end,
            statistic,
        };
        let datapoints = self.metrics.query(&query).await?;
        Ok(datapoints.first().map(|d| d.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(cpu: Option<f64>, net_in: Option<f64>, net_out: Option<f64>) -> IdleWindow {
        let end = Utc::now();
        IdleWindow {
            instance_id: "i-1".to_string(),
            start: end - chrono::Duration::minutes(30),
            end,
            cpu_average: cpu,
            network_in_sum: net_in,
            network_out_sum: net_out,
        }
    }

    fn thresholds() -> IdleThresholds {
        IdleThresholds::from_config(&ReaperConfig::default())
    }

    #[test]
    fn test_idle_instance_is_stopped() {
        let decision = evaluate(&window(Some(5.0), Some(500_000.0), Some(500_000.0)), &thresholds());
        assert_eq!(decision, IdleDecision::Stop);
    }

    #[test]
    fn test_busy_cpu_is_kept() {
        let decision = evaluate(&window(Some(15.0), Some(500_000.0), Some(500_000.0)), &thresholds());
        assert_eq!(decision, IdleDecision::Keep(KeepReason::CpuActive));
    }

    #[test]
    fn test_missing_cpu_is_kept_regardless_of_network() {
        assert_eq!(
            evaluate(&window(None, None, None), &thresholds()),
            IdleDecision::Keep(KeepReason::NoCpuData)
        );
        assert_eq!(
            evaluate(&window(None, Some(0.0), Some(0.0)), &thresholds()),
            IdleDecision::Keep(KeepReason::NoCpuData)
        );
    }

    #[test]
    fn test_missing_network_does_not_block_stop() {
        assert_eq!(evaluate(&window(Some(1.0), None, None), &thresholds()), IdleDecision::Stop);
    }

    #[test]
    fn test_network_traffic_keeps_instance() {
        assert_eq!(
            evaluate(&window(Some(1.0), Some(2_000_000.0), None), &thresholds()),
            IdleDecision::Keep(KeepReason::NetworkInActive)
        );
        assert_eq!(
            evaluate(&window(Some(1.0), Some(10.0), Some(2_000_000.0)), &thresholds()),
            IdleDecision::Keep(KeepReason::NetworkOutActive)
        );
    }

    #[test]
    fn test_thresholds_are_exclusive() {
        let t = thresholds();
        assert_eq!(
            evaluate(&window(Some(10.0), Some(1_048_576.0), Some(1_048_576.0)), &t),
            IdleDecision::Stop
        );
    }
}
