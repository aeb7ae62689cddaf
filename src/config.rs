use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Highest numbered backend slot scanned by the fallback resolver
pub const MAX_BACKEND_SLOTS: usize = 99;

/// Longest trailing window a reaper pass may evaluate (7 days)
pub const MAX_REAP_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Global configuration shared by the proxy and the reaper
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Route table: named prefixes, numbered slots, single default backend
    #[serde(default)]
    pub routes: RoutesConfig,

    /// Wake-up budgets and timeouts
    #[serde(default)]
    pub wake: WakeConfig,

    /// Idle reaper thresholds
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Docker instance manager settings
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutesConfig {
    /// Port used when a route does not specify one (default: 5000)
    #[serde(default = "default_backend_port")]
    pub default_port: u16,

    /// Health path used when a route does not specify one (default: /)
    #[serde(default = "default_health_path")]
    pub default_health_path: String,

    /// Prefix routes, checked in declaration order
    #[serde(default)]
    pub named: Vec<NamedRouteConfig>,

    /// Numbered fallback slots (1..=99), scanned in ascending order
    #[serde(default)]
    pub slots: Vec<SlotConfig>,

    /// Single-instance fallback
    pub default: Option<DefaultBackendConfig>,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            default_port: default_backend_port(),
            default_health_path: default_health_path(),
            named: Vec::new(),
            slots: Vec::new(),
            default: None,
        }
    }
}

/// A prefix route. An empty `backend` leaves the route unconfigured.
#[derive(Debug, Deserialize, Clone)]
pub struct NamedRouteConfig {
    pub prefix: String,
    #[serde(default)]
    pub backend: String,
    pub port: Option<u16>,
    pub health_path: Option<String>,
}

/// A numbered fallback slot
#[derive(Debug, Deserialize, Clone)]
pub struct SlotConfig {
    pub index: usize,
    #[serde(default)]
    pub backend: String,
    pub port: Option<u16>,
    pub health_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefaultBackendConfig {
    #[serde(default)]
    pub backend: String,
    pub port: Option<u16>,
    pub health_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WakeConfig {
    /// Timeout of the opportunistic probe against the current endpoint
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Seconds between running-state polls after a start command
    #[serde(default = "default_running_poll_interval")]
    pub running_poll_interval_secs: u64,

    /// Running-state polls before giving up
    #[serde(default = "default_running_max_attempts")]
    pub running_max_attempts: u32,

    /// Timeout of each post-start health probe
    #[serde(default = "default_post_start_probe_timeout")]
    pub post_start_probe_timeout_secs: u64,

    /// Seconds to sleep after an unhealthy post-start probe
    #[serde(default = "default_post_start_probe_interval")]
    pub post_start_probe_interval_secs: u64,

    /// Post-start probes before forwarding anyway
    #[serde(default = "default_post_start_probe_attempts")]
    pub post_start_probe_attempts: u32,

    /// Max time to wait for the backend's response to a forwarded request
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            running_poll_interval_secs: default_running_poll_interval(),
            running_max_attempts: default_running_max_attempts(),
            post_start_probe_timeout_secs: default_post_start_probe_timeout(),
            post_start_probe_interval_secs: default_post_start_probe_interval(),
            post_start_probe_attempts: default_post_start_probe_attempts(),
            forward_timeout_secs: default_forward_timeout(),
        }
    }
}

impl WakeConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn running_poll_interval(&self) -> Duration {
        Duration::from_secs(self.running_poll_interval_secs)
    }

    pub fn post_start_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.post_start_probe_timeout_secs)
    }

    pub fn post_start_probe_interval(&self) -> Duration {
        Duration::from_secs(self.post_start_probe_interval_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Trailing window evaluated on every pass (default: 30 minutes)
    #[serde(default = "default_reap_window")]
    pub window_secs: u64,

    /// CPU average above this percentage keeps an instance running
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold_percent: f64,

    /// Network in/out sum above this many bytes keeps an instance running
    #[serde(default = "default_network_threshold")]
    pub network_threshold_bytes: f64,

    /// Instance types eligible for reaping
    #[serde(default = "default_instance_types")]
    pub instance_types: Vec<String>,

    /// Seconds between metric samples taken by the reaper process
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Seconds between reaper passes
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            window_secs: default_reap_window(),
            cpu_threshold_percent: default_cpu_threshold(),
            network_threshold_bytes: default_network_threshold(),
            instance_types: default_instance_types(),
            sample_interval_secs: default_sample_interval(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl ReaperConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn instance_type_set(&self) -> HashSet<String> {
        self.instance_types.iter().cloned().collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST or common socket paths)
    pub host: Option<String>,

    /// Container label holding the instance type
    #[serde(default = "default_instance_type_label")]
    pub instance_type_label: String,

    /// Container label holding an externally reachable address
    #[serde(default = "default_public_address_label")]
    pub public_address_label: String,

    /// Address used for every container that has no public-address label,
    /// e.g. the Docker host when backends publish their ports
    pub host_address: Option<String>,

    /// Grace period passed to `docker stop`
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            instance_type_label: default_instance_type_label(),
            public_address_label: default_public_address_label(),
            host_address: None,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_backend_port() -> u16 {
    5000
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_running_poll_interval() -> u64 {
    15
}

fn default_running_max_attempts() -> u32 {
    20 // ~5 minutes at 15s
}

fn default_post_start_probe_timeout() -> u64 {
    5
}

fn default_post_start_probe_interval() -> u64 {
    10
}

fn default_post_start_probe_attempts() -> u32 {
    30 // ~5 minutes of application warm-up
}

fn default_forward_timeout() -> u64 {
    30
}

fn default_reap_window() -> u64 {
    1800 // 30 minutes
}

fn default_cpu_threshold() -> f64 {
    10.0
}

fn default_network_threshold() -> f64 {
    1_048_576.0 // 1 MiB
}

fn default_instance_types() -> Vec<String> {
    [
        "p3.2xlarge",
        "p3.8xlarge",
        "p3.16xlarge",
        "p4d.24xlarge",
        "g4dn.xlarge",
        "t2.micro",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sample_interval() -> u64 {
    60
}

fn default_reap_interval() -> u64 {
    300
}

fn default_instance_type_label() -> String {
    "lazywake.instance-type".to_string()
}

fn default_public_address_label() -> String {
    "lazywake.public-address".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, else build from the process environment.
    /// The flag reports whether the file was used.
    pub fn load_or_env<P: AsRef<Path>>(path: P) -> anyhow::Result<(Self, bool)> {
        if path.as_ref().exists() {
            Ok((Self::load(path)?, true))
        } else {
            Ok((Self::from_env_vars(std::env::vars())?, false))
        }
    }

    /// Build a config from `INSTANCE_ID_<n>` / `DOCKER_PORT_<n>` slot variables
    /// and the single-instance `INSTANCE_ID` / `DOCKER_PORT` pair.
    ///
    /// Only the route table comes from the environment; everything else keeps
    /// its defaults.
    pub fn from_env_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let mut config = Config::default();

        let parse_port = |key: &str| -> anyhow::Result<Option<u16>> {
            match vars.get(key) {
                Some(raw) if !raw.trim().is_empty() => raw
                    .trim()
                    .parse::<u16>()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("{}: invalid port '{}': {}", key, raw, e)),
                _ => Ok(None),
            }
        };

        for index in 1..=MAX_BACKEND_SLOTS {
            let Some(backend) = vars.get(&format!("INSTANCE_ID_{}", index)) else {
                continue;
            };
            if backend.trim().is_empty() {
                continue;
            }
            config.routes.slots.push(SlotConfig {
                index,
                backend: backend.trim().to_string(),
                port: parse_port(&format!("DOCKER_PORT_{}", index))?,
                health_path: None,
            });
        }

        if let Some(backend) = vars.get("INSTANCE_ID").filter(|b| !b.trim().is_empty()) {
            config.routes.default = Some(DefaultBackendConfig {
                backend: backend.trim().to_string(),
                port: parse_port("DOCKER_PORT")?,
                health_path: None,
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.routes.default_port == 0 {
            errors.push("routes: 'default_port' must be greater than 0".to_string());
        }
        if !self.routes.default_health_path.starts_with('/') {
            errors.push("routes: 'default_health_path' must start with '/'".to_string());
        }

        for route in &self.routes.named {
            if !route.prefix.starts_with('/') {
                errors.push(format!(
                    "Route '{}': 'prefix' must start with '/'",
                    route.prefix
                ));
            }
            validate_target(&format!("Route '{}'", route.prefix), route.port, route.health_path.as_deref(), &mut errors);
        }

        let mut seen_slots = HashSet::new();
        for slot in &self.routes.slots {
            if slot.index == 0 || slot.index > MAX_BACKEND_SLOTS {
                errors.push(format!(
                    "Slot {}: 'index' must be between 1 and {}",
                    slot.index, MAX_BACKEND_SLOTS
                ));
            }
            if !seen_slots.insert(slot.index) {
                errors.push(format!("Slot {}: declared more than once", slot.index));
            }
            validate_target(&format!("Slot {}", slot.index), slot.port, slot.health_path.as_deref(), &mut errors);
        }

        if let Some(ref default) = self.routes.default {
            validate_target("Default backend", default.port, default.health_path.as_deref(), &mut errors);
        }

        if self.wake.probe_timeout_secs == 0 {
            errors.push("wake: 'probe_timeout_secs' must be greater than 0".to_string());
        }
        if self.wake.post_start_probe_timeout_secs == 0 {
            errors.push("wake: 'post_start_probe_timeout_secs' must be greater than 0".to_string());
        }
        if self.wake.forward_timeout_secs == 0 {
            errors.push("wake: 'forward_timeout_secs' must be greater than 0".to_string());
        }
        if self.wake.running_max_attempts == 0 {
            errors.push("wake: 'running_max_attempts' must be greater than 0".to_string());
        }
        if self.wake.post_start_probe_attempts == 0 {
            errors.push("wake: 'post_start_probe_attempts' must be greater than 0".to_string());
        }

        if !self.reaper.cpu_threshold_percent.is_finite() || self.reaper.cpu_threshold_percent < 0.0 {
            errors.push("reaper: 'cpu_threshold_percent' must be a non-negative number".to_string());
        }
        if !self.reaper.network_threshold_bytes.is_finite() || self.reaper.network_threshold_bytes < 0.0 {
            errors.push("reaper: 'network_threshold_bytes' must be a non-negative number".to_string());
        }
        if self.reaper.window_secs == 0 || self.reaper.window_secs > MAX_REAP_WINDOW_SECS {
            errors.push(format!(
                "reaper: 'window_secs' must be between 1 and {}",
                MAX_REAP_WINDOW_SECS
            ));
        }
        if self.reaper.sample_interval_secs == 0 {
            errors.push("reaper: 'sample_interval_secs' must be greater than 0".to_string());
        }
        if self.reaper.reap_interval_secs == 0 {
            errors.push("reaper: 'reap_interval_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn validate_target(what: &str, port: Option<u16>, health_path: Option<&str>, errors: &mut Vec<String>) {
    if port == Some(0) {
        errors.push(format!("{}: 'port' must be greater than 0", what));
    }
    if let Some(path) = health_path {
        if !path.starts_with('/') {
            errors.push(format!("{}: 'health_path' must start with '/'", what));
        }
    }
}
