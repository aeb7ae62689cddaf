//! Docker-backed instance manager and metrics sampler
//!
//! Containers stand in for compute instances: the container name (or id) is
//! the instance id, the container's network address is the private address,
//! and two labels carry the instance type and an optional public address.

use crate::config::DockerConfig;
use crate::instance::{InstanceDescription, InstanceError, InstanceManager, InstanceState};
use crate::metrics::{Datapoint, MetricName, MetricQuery, MetricsError, MetricsProvider, Statistic};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Instance manager backed by the Docker daemon
pub struct DockerInstanceManager {
    client: Docker,
    config: DockerConfig,
}

impl DockerInstanceManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit `host` in the docker configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: &DockerConfig) -> anyhow::Result<Self> {
        let client = if let Some(host) = config.host.as_deref() {
            connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host,
                    e
                )
            })?
        } else {
            connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self::with_client(client, config.clone()))
    }

    pub fn with_client(client: Docker, config: DockerConfig) -> Self {
        Self { client, config }
    }

    /// Shared daemon handle, used by the metrics sampler
    pub fn client(&self) -> Docker {
        self.client.clone()
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    let mut tried_paths = Vec::new();

    for (name, path) in &socket_paths {
        if path.is_empty() || path.contains("//") {
            continue; // Skip invalid paths from empty env vars
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }
    }

    match Docker::connect_with_socket_defaults() {
        Ok(client) => Ok(client),
        Err(e) => {
            let tried_info = if tried_paths.is_empty() {
                "No Docker socket found at common locations".to_string()
            } else {
                format!("Tried:\n  - {}", tried_paths.join("\n  - "))
            };

            anyhow::bail!(
                "Cannot connect to Docker daemon. {}\n\n\
                 To fix this:\n\
                 - Start Docker Desktop, Colima, or dockerd\n\
                 - Or set DOCKER_HOST environment variable\n\
                 - Or set [docker] host in the configuration\n\n\
                 Underlying error: {}",
                tried_info,
                e
            )
        }
    }
}

fn instance_error(id: &str, e: bollard::errors::Error) -> InstanceError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            InstanceError::NotFound(id.to_string())
        }
        e => InstanceError::Backend(e.to_string()),
    }
}

fn map_state(status: Option<ContainerStateStatusEnum>) -> InstanceState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => InstanceState::Running,
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::RESTARTING) => {
            InstanceState::Pending
        }
        Some(ContainerStateStatusEnum::REMOVING) => InstanceState::Stopping,
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::PAUSED) => InstanceState::Stopped,
        _ => InstanceState::Unknown,
    }
}

/// Container address on its default network, else on the first attached network
fn private_address(info: &ContainerInspectResponse) -> Option<String> {
    let settings = info.network_settings.as_ref()?;

    if let Some(ip) = settings.ip_address.as_ref().filter(|ip| !ip.is_empty()) {
        return Some(ip.clone());
    }

    let mut networks: Vec<_> = settings.networks.as_ref()?.iter().collect();
    networks.sort_by(|a, b| a.0.cmp(b.0));
    networks
        .into_iter()
        .filter_map(|(_, endpoint)| endpoint.ip_address.clone())
        .find(|ip| !ip.is_empty())
}

/// Container name without the leading '/', resolvable on a user-defined network
fn container_name(info: &ContainerInspectResponse) -> Option<String> {
    info.name
        .as_deref()
        .map(|name| name.trim_start_matches('/'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Map an inspect response to an instance description.
///
/// A stopped container has no network IP, so its name stands in for the
/// private address. The public address comes from the label, else from the
/// configured `host_address`.
fn describe_container(info: &ContainerInspectResponse, config: &DockerConfig) -> InstanceDescription {
    let state = map_state(info.state.as_ref().and_then(|s| s.status));
    let labels = info.config.as_ref().and_then(|c| c.labels.as_ref());
    let public_address = label(labels, &config.public_address_label)
        .cloned()
        .or_else(|| config.host_address.clone().filter(|a| !a.is_empty()));

    InstanceDescription {
        state,
        public_address,
        private_address: private_address(info).or_else(|| container_name(info)),
    }
}

fn label<'a>(labels: Option<&'a HashMap<String, String>>, key: &str) -> Option<&'a String> {
    labels.and_then(|l| l.get(key)).filter(|v| !v.is_empty())
}

#[async_trait]
impl InstanceManager for DockerInstanceManager {
    async fn start(&self, id: &str) -> Result<(), InstanceError> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(instance_id = id, "Started container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(instance_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(instance_error(id, e)),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), InstanceError> {
        let options = StopContainerOptions {
            t: self.config.stop_timeout().as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(instance_id = id, "Stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(instance_id = id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(instance_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(InstanceError::Backend(format!("Failed to stop container: {}", e))),
        }
    }

    async fn describe(&self, id: &str) -> Result<InstanceDescription, InstanceError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| instance_error(id, e))?;

        Ok(describe_container(&info, &self.config))
    }

    async fn list_running(&self, instance_types: &HashSet<String>) -> Result<Vec<String>, InstanceError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters.insert("label".to_string(), vec![self.config.instance_type_label.clone()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| InstanceError::Backend(format!("Failed to list containers: {}", e)))?;

        let ids = containers
            .into_iter()
            .filter(|c| {
                label(c.labels.as_ref(), &self.config.instance_type_label)
                    .is_some_and(|t| instance_types.contains(t))
            })
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .or(c.id)
            })
            .collect();

        Ok(ids)
    }
}

/// One stats reading for a container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: DateTime<Utc>,
    /// None when the daemon had no previous reading to diff against
    pub cpu_percent: Option<f64>,
    /// Cumulative bytes received across all interfaces
    pub rx_bytes: u64,
    /// Cumulative bytes sent across all interfaces
    pub tx_bytes: u64,
}

/// CPU usage as `docker stats` reports it: share of the host, scaled by online CPUs
pub fn cpu_percent(
    total_usage: u64,
    prev_total_usage: u64,
    system_usage: Option<u64>,
    prev_system_usage: Option<u64>,
    online_cpus: u64,
) -> Option<f64> {
    let cpu_delta = total_usage.checked_sub(prev_total_usage)?;
    let system_delta = system_usage?.checked_sub(prev_system_usage?)?;
    if system_delta == 0 {
        return None;
    }
    Some(cpu_delta as f64 / system_delta as f64 * online_cpus.max(1) as f64 * 100.0)
}

/// Samples container stats on an interval and answers windowed metric
/// queries from the retained history
pub struct DockerMetrics {
    client: Docker,
    history: DashMap<String, VecDeque<Sample>>,
    retention: Duration,
}

impl DockerMetrics {
    pub fn new(client: Docker, retention: Duration) -> Self {
        Self {
            client,
            history: DashMap::new(),
            retention,
        }
    }

    /// Take one reading for each running instance of the given types and
    /// forget instances that are no longer running
    pub async fn sample_running(
        &self,
        instances: &dyn InstanceManager,
        instance_types: &HashSet<String>,
    ) -> Result<usize, InstanceError> {
        let running = instances.list_running(instance_types).await?;
        let now = Utc::now();
        let mut sampled = 0;

        for id in &running {
            match self.read_stats(id, now).await {
                Ok(sample) => {
                    self.record(id, sample);
                    sampled += 1;
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to sample container stats"),
            }
        }

        let running: HashSet<&String> = running.iter().collect();
        self.history.retain(|id, _| running.contains(id));

        debug!(sampled, tracked = self.history.len(), "Sampled container stats");
        Ok(sampled)
    }

    async fn read_stats(&self, id: &str, at: DateTime<Utc>) -> Result<Sample, MetricsError> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = Box::pin(self.client.stats(id, Some(options)));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| MetricsError::Unavailable {
                instance_id: id.to_string(),
                reason: "empty stats stream".to_string(),
            })?
            .map_err(|e| MetricsError::Unavailable {
                instance_id: id.to_string(),
                reason: e.to_string(),
            })?;

        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|p| p.len() as u64)
                .unwrap_or(1)
        });

        let (rx_bytes, tx_bytes) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(Sample {
            at,
            cpu_percent: cpu_percent(
                stats.cpu_stats.cpu_usage.total_usage,
                stats.precpu_stats.cpu_usage.total_usage,
                stats.cpu_stats.system_cpu_usage,
                stats.precpu_stats.system_cpu_usage,
                online_cpus,
            ),
            rx_bytes,
            tx_bytes,
        })
    }

    /// Append a reading, dropping history that can no longer serve as a
    /// window baseline
    pub fn record(&self, id: &str, sample: Sample) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::hours(1));
        let cutoff = sample.at - retention;

        let mut samples = self.history.entry(id.to_string()).or_default();
        samples.push_back(sample);

        // Keep the newest sample at or before the cutoff as a baseline
        while samples.len() > 1 && samples[1].at <= cutoff {
            samples.pop_front();
        }
    }

    pub fn tracked(&self) -> usize {
        self.history.len()
    }
}

/// Aggregate a sample history over `[start, end]`.
///
/// Returns None unless the history reaches back to `start`, so recently
/// started instances report no data.
pub fn aggregate(
    samples: &VecDeque<Sample>,
    metric: MetricName,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<f64> {
    let baseline = samples.iter().rposition(|s| s.at <= start)?;
    let last = samples.iter().rposition(|s| s.at <= end)?;
    if last <= baseline {
        return None;
    }
    let window = samples.range(baseline..=last);

    match metric {
        MetricName::CpuUtilization => {
            let values: Vec<f64> = window.skip(1).filter_map(|s| s.cpu_percent).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        MetricName::NetworkIn => Some(counter_delta(window.map(|s| s.rx_bytes))),
        MetricName::NetworkOut => Some(counter_delta(window.map(|s| s.tx_bytes))),
    }
}

/// Total growth of a cumulative counter, tolerating resets
fn counter_delta(values: impl Iterator<Item = u64>) -> f64 {
    let mut total = 0u64;
    let mut prev: Option<u64> = None;
    for value in values {
        if let Some(p) = prev {
            total += if value >= p { value - p } else { value };
        }
        prev = Some(value);
    }
    total as f64
}

#[async_trait]
impl MetricsProvider for DockerMetrics {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<Datapoint>, MetricsError> {
        let expected = match query.metric {
            MetricName::CpuUtilization => Statistic::Average,
            MetricName::NetworkIn | MetricName::NetworkOut => Statistic::Sum,
        };
        if query.statistic != expected {
            return Err(MetricsError::UnsupportedStatistic {
                metric: query.metric,
                statistic: query.statistic,
            });
        }

        let Some(samples) = self.history.get(&query.instance_id) else {
            return Ok(Vec::new());
        };

        Ok(aggregate(&samples, query.metric, query.start, query.end)
            .map(|value| Datapoint {
                timestamp: query.start,
                value,
            })
            .into_iter()
            .collect())
    }
}
