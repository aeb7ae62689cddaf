//! Instance manager capability and endpoint location
//!
//! The proxy and the reaper talk to the compute control plane only through
//! [`InstanceManager`]. Addresses change across stop/start cycles, so nothing
//! here is cached: every [`locate`] call re-queries the manager.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Running state as reported by the instance manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Point-in-time description of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
}

impl InstanceDescription {
    /// Public address if present, else private address
    pub fn reachable_address(&self) -> Option<&str> {
        self.public_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .or_else(|| self.private_address.as_deref().filter(|a| !a.is_empty()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance {0} not found")]
    NotFound(String),
    #[error("instance {id} did not reach running state after {attempts} attempts (last state: {last_state})")]
    WaitTimeout {
        id: String,
        attempts: u32,
        last_state: InstanceState,
    },
    #[error("instance manager error: {0}")]
    Backend(String),
}

/// Control-plane operations consumed by the proxy and the reaper
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Issue a start command. Starting a running instance is not an error.
    async fn start(&self, id: &str) -> Result<(), InstanceError>;

    /// Issue a stop command
    async fn stop(&self, id: &str) -> Result<(), InstanceError>;

    /// Current state and addresses
    async fn describe(&self, id: &str) -> Result<InstanceDescription, InstanceError>;

    /// Ids of running instances whose type is in `instance_types`
    async fn list_running(&self, instance_types: &HashSet<String>) -> Result<Vec<String>, InstanceError>;

    /// Poll `describe` until the instance is running, at most `max_attempts` times
    /// with `poll_interval` between polls.
    async fn wait_until_running(
        &self,
        id: &str,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Result<(), InstanceError> {
        let mut last_state = InstanceState::Unknown;

        for attempt in 1..=max_attempts {
            match self.describe(id).await {
                Ok(desc) if desc.state == InstanceState::Running => {
                    debug!(instance_id = id, attempt, "Instance is running");
                    return Ok(());
                }
                Ok(desc) => {
                    debug!(instance_id = id, attempt, state = %desc.state, "Waiting for instance to run");
                    last_state = desc.state;
                }
                Err(e @ InstanceError::NotFound(_)) => return Err(e),
                Err(e) => {
                    warn!(instance_id = id, attempt, error = %e, "Describe failed while waiting");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(poll_interval).await;
            }
        }

        Err(InstanceError::WaitTimeout {
            id: id.to_string(),
            attempts: max_attempts,
            last_state,
        })
    }
}

/// Network location of a backend, valid only for the probe/forward that used it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: "http",
            host: host.into(),
            port,
        }
    }

    /// `scheme://host:port` with IPv6 hosts bracketed
    pub fn base_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Base URL joined with an absolute path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Ask the instance manager where `backend_id` can be reached right now.
///
/// Returns `None` when the instance has no address or cannot be described.
pub async fn locate(manager: &dyn InstanceManager, backend_id: &str, port: u16) -> Option<Endpoint> {
    match manager.describe(backend_id).await {
        Ok(desc) => match desc.reachable_address() {
            Some(host) => {
                let endpoint = Endpoint::http(host, port);
                debug!(backend = backend_id, endpoint = %endpoint, state = %desc.state, "Located instance");
                Some(endpoint)
            }
            None => {
                debug!(backend = backend_id, state = %desc.state, "Instance has no address");
                None
            }
        },
        Err(e) => {
            warn!(backend = backend_id, error = %e, "Failed to describe instance");
            None
        }
    }
}
