//! Integration tests for the idle reaper

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazywake::config::{ReaperConfig, MAX_REAP_WINDOW_SECS};
use lazywake::instance::{InstanceDescription, InstanceError, InstanceManager, InstanceState};
use lazywake::metrics::{Datapoint, MetricName, MetricQuery, MetricsError, MetricsProvider, Statistic};
use lazywake::reaper::IdleReaper;
use parking_lot::Mutex;

/// Running instances with recorded stop commands
struct FakeFleet {
    running: Vec<String>,
    fail_stop: HashSet<String>,
    fail_list: bool,
    stopped: Mutex<Vec<String>>,
    listed_types: Mutex<Option<HashSet<String>>>,
}

impl FakeFleet {
    fn new(running: &[&str]) -> Self {
        Self {
            running: running.iter().map(|s| s.to_string()).collect(),
            fail_stop: HashSet::new(),
            fail_list: false,
            stopped: Mutex::new(Vec::new()),
            listed_types: Mutex::new(None),
        }
    }
}

#[async_trait]
impl InstanceManager for FakeFleet {
    async fn start(&self, _id: &str) -> Result<(), InstanceError> {
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), InstanceError> {
        if self.fail_stop.contains(id) {
            return Err(InstanceError::Backend("stop rejected".to_string()));
        }
        self.stopped.lock().push(id.to_string());
        Ok(())
    }

    async fn describe(&self, _id: &str) -> Result<InstanceDescription, InstanceError> {
        Ok(InstanceDescription {
            state: InstanceState::Running,
            public_address: None,
            private_address: Some("10.0.0.1".to_string()),
        })
    }

    async fn list_running(&self, instance_types: &HashSet<String>) -> Result<Vec<String>, InstanceError> {
        *self.listed_types.lock() = Some(instance_types.clone());
        if self.fail_list {
            return Err(InstanceError::Backend("describe-instances throttled".to_string()));
        }
        Ok(self.running.clone())
    }
}

/// Per-instance canned aggregates; instances in `broken` fail every query
#[derive(Default)]
struct FakeMetrics {
    cpu: HashMap<String, f64>,
    network_in: HashMap<String, f64>,
    network_out: HashMap<String, f64>,
    broken: HashSet<String>,
    queries: Mutex<Vec<MetricQuery>>,
}

impl FakeMetrics {
    fn with(mut self, id: &str, cpu: Option<f64>, net_in: Option<f64>, net_out: Option<f64>) -> Self {
        if let Some(v) = cpu {
            self.cpu.insert(id.to_string(), v);
        }
        if let Some(v) = net_in {
            self.network_in.insert(id.to_string(), v);
        }
        if let Some(v) = net_out {
            self.network_out.insert(id.to_string(), v);
        }
        self
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError> {
        self.queries.lock().push(query.clone());

        if self.broken.contains(&query.instance_id) {
            return Err(MetricsError::Unavailable {
                instance_id: query.instance_id.clone(),
                reason: "throttled".to_string(),
            });
        }

        let source = match query.metric {
            MetricName::CpuUtilization => &self.cpu,
            MetricName::NetworkIn => &self.network_in,
            MetricName::NetworkOut => &self.network_out,
        };

        Ok(source
            .get(&query.instance_id)
            .map(|value| Datapoint {
                timestamp: query.start,
                value: *value,
            })
            .into_iter()
            .collect())
    }
}

fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn reaper(fleet: &Arc<FakeFleet>, metrics: &Arc<FakeMetrics>) -> IdleReaper {
    IdleReaper::new(fleet.clone(), metrics.clone(), ReaperConfig::default())
}

#[tokio::test]
async fn test_idle_instance_is_stopped_and_busy_one_kept() {
    let fleet = Arc::new(FakeFleet::new(&["idle", "busy", "fresh"]));
    let metrics = Arc::new(
        FakeMetrics::default()
            .with("idle", Some(5.0), Some(500.0 * 1024.0), Some(500.0 * 1024.0))
            .with("busy", Some(15.0), Some(0.0), Some(0.0)),
    );

    let report = reaper(&fleet, &metrics).run_at(now()).await.unwrap();

    assert_eq!(report.evaluated, 3);
    assert_eq!(report.stopped, vec!["idle".to_string()]);
    assert_eq!(report.kept, vec!["busy".to_string(), "fresh".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(*fleet.stopped.lock(), vec!["idle".to_string()]);
}

#[tokio::test]
async fn test_metrics_failure_does_not_block_other_instances() {
    let fleet = Arc::new(FakeFleet::new(&["broken", "idle"]));
    let mut metrics = FakeMetrics::default().with("idle", Some(1.0), None, None);
    metrics.broken.insert("broken".to_string());
    let metrics = Arc::new(metrics);

    let report = reaper(&fleet, &metrics).run_at(now()).await.unwrap();

    assert_eq!(report.failed, vec!["broken".to_string()]);
    assert_eq!(report.stopped, vec!["idle".to_string()]);
    assert_eq!(*fleet.stopped.lock(), vec!["idle".to_string()]);
}

#[tokio::test]
async fn test_stop_failure_is_reported_and_pass_continues() {
    let mut fleet = FakeFleet::new(&["stuck", "idle"]);
    fleet.fail_stop.insert("stuck".to_string());
    let fleet = Arc::new(fleet);
    let metrics = Arc::new(
        FakeMetrics::default()
            .with("stuck", Some(0.5), Some(0.0), Some(0.0))
            .with("idle", Some(0.5), Some(0.0), Some(0.0)),
    );

    let report = reaper(&fleet, &metrics).run_at(now()).await.unwrap();

    assert_eq!(report.failed, vec!["stuck".to_string()]);
    assert_eq!(report.stopped, vec!["idle".to_string()]);
}

#[tokio::test]
async fn test_network_traffic_keeps_low_cpu_instance() {
    let fleet = Arc::new(FakeFleet::new(&["download"]));
    let metrics = Arc::new(FakeMetrics::default().with("download", Some(2.0), Some(0.0), Some(5.0 * 1024.0 * 1024.0)));

    let report = reaper(&fleet, &metrics).run_at(now()).await.unwrap();

    assert!(report.stopped.is_empty());
    assert_eq!(report.kept, vec!["download".to_string()]);
}

#[tokio::test]
async fn test_queries_cover_trailing_window() {
    let fleet = Arc::new(FakeFleet::new(&["idle"]));
    let metrics = Arc::new(FakeMetrics::default().with("idle", Some(1.0), None, None));

    reaper(&fleet, &metrics).run_at(now()).await.unwrap();

    let queries = metrics.queries.lock();
    assert_eq!(queries.len(), 3);
    for query in queries.iter() {
        assert_eq!(query.end, now());
        assert_eq!(query.start, now() - chrono::Duration::minutes(30));
    }
    assert_eq!(queries[0].metric, MetricName::CpuUtilization);
    assert_eq!(queries[0].statistic, Statistic::Average);
    assert_eq!(queries[1].statistic, Statistic::Sum);
    assert_eq!(queries[2].metric, MetricName::NetworkOut);

    let types = fleet.listed_types.lock().clone().unwrap();
    assert_eq!(types, ReaperConfig::default().instance_type_set());
}

#[tokio::test]
async fn test_list_failure_fails_the_pass() {
    let mut fleet = FakeFleet::new(&["idle"]);
    fleet.fail_list = true;
    let fleet = Arc::new(fleet);
    let metrics = Arc::new(FakeMetrics::default());

    let result = reaper(&fleet, &metrics).run_at(now()).await;

    assert!(result.is_err());
    assert!(fleet.stopped.lock().is_empty());
}

#[tokio::test]
async fn test_oversized_window_is_capped() {
    let fleet = Arc::new(FakeFleet::new(&["idle"]));
    let metrics = Arc::new(FakeMetrics::default().with("idle", Some(1.0), None, None));
    let config = ReaperConfig {
        window_secs: u64::MAX,
        ..ReaperConfig::default()
    };

    let report = IdleReaper::new(fleet.clone(), metrics.clone(), config)
        .run_at(now())
        .await
        .unwrap();

    assert_eq!(report.stopped, vec!["idle".to_string()]);
    let queries = metrics.queries.lock();
    assert_eq!(
        queries[0].start,
        now() - chrono::Duration::seconds(MAX_REAP_WINDOW_SECS as i64)
    );
}
