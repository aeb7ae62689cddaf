//! Wake-route-forward controller
//!
//! For every request: resolve the route, locate the instance, and probe it.
//! A healthy instance is forwarded to immediately. Otherwise the instance is
//! started, waited on until running, located again (its address usually
//! changes), and probed until the application answers or the warm-up budget
//! runs out. The request is then forwarded exactly once.
//!
//! Nothing is cached between requests; the instance manager is the only
//! source of truth for state and addresses.

use crate::client::BackendClient;
use crate::config::{Config, WakeConfig};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{json_error_response, ErrorResponse, ProxyErrorCode};
use crate::forward::Forwarder;
use crate::healthcheck::HealthProber;
use crate::instance::{locate, Endpoint, InstanceError, InstanceManager};
use crate::routing::{Route, RouteTable};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Phases a request moves through on its way to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakePhase {
    RouteResolved,
    Locating,
    ProbingCurrent,
    Starting,
    WaitingRunning,
    Relocating,
    ProbingPostStart,
    ForwardReady,
    StartFailed,
}

/// Why a request could not be handed to the forwarder
#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    /// No address before any start attempt
    #[error("Instance not found or no IP available")]
    NoEndpoint,
    /// Start command or running-state wait failed
    #[error("Service temporarily unavailable")]
    StartFailed(#[source] InstanceError),
    /// The instance started but reports no address
    #[error("Instance started but no IP available")]
    NoEndpointAfterStart,
}

impl WakeError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            WakeError::NoEndpoint | WakeError::NoEndpointAfterStart => ProxyErrorCode::EndpointUnavailable,
            WakeError::StartFailed(_) => ProxyErrorCode::StartFailed,
        }
    }

    /// Phase the request was in when it failed
    pub fn phase(&self) -> WakePhase {
        match self {
            WakeError::NoEndpoint => WakePhase::Locating,
            WakeError::StartFailed(_) => WakePhase::StartFailed,
            WakeError::NoEndpointAfterStart => WakePhase::Relocating,
        }
    }

    /// Client-facing response. Start and wait failures share one message.
    pub fn into_envelope(self) -> ResponseEnvelope {
        json_error_response(self.code(), self.to_string())
    }
}

/// Handles proxied requests end to end
pub struct WakeController {
    routes: RouteTable,
    instances: Arc<dyn InstanceManager>,
    prober: HealthProber,
    forwarder: Forwarder,
    config: WakeConfig,
}

impl WakeController {
    pub fn new(config: &Config, instances: Arc<dyn InstanceManager>) -> Self {
        let client = BackendClient::new();
        let routes = RouteTable::from_config(&config.routes);
        if routes.is_empty() {
            warn!("No backends configured, every request will get 404");
        } else {
            debug!(backends = routes.len(), "Route table built");
        }
        Self {
            routes,
            instances,
            prober: HealthProber::new(client.clone()),
            forwarder: Forwarder::new(client, config.wake.forward_timeout()),
            config: config.wake.clone(),
        }
    }

    /// Resolve, wake if needed, and forward. Always yields a response envelope.
    pub async fn handle(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let Some(route) = self.routes.resolve(&request.path) else {
            info!(path = %request.path, "No route for path");
            return ErrorResponse::new(ProxyErrorCode::RouteNotFound, "Service not found")
                .with_path(request.path.clone())
                .into_envelope();
        };

        debug!(
            phase = ?WakePhase::RouteResolved,
            path = %request.path,
            backend = %route.backend_id,
            port = route.port,
            "Route resolved"
        );

        match self.ensure_ready(route).await {
            Ok(endpoint) => {
                debug!(phase = ?WakePhase::ForwardReady, backend = %route.backend_id, endpoint = %endpoint, "Forwarding");
                self.forwarder.forward(request, &endpoint).await
            }
            Err(e) => {
                error!(phase = ?e.phase(), backend = %route.backend_id, error = ?e, "Backend unavailable");
                e.into_envelope()
            }
        }
    }

    /// Handle one function-URL JSON event and return the response event JSON
    pub async fn handle_event(&self, event: &str) -> String {
        let response = match RequestEnvelope::from_event_json(event) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                warn!(error = %e, "Invalid request event");
                ErrorResponse::new(ProxyErrorCode::InvalidRequest, "Invalid request event")
                    .with_details(e.to_string())
                    .into_envelope()
            }
        };
        response.to_event_json()
    }

    /// Return an endpoint the request can be forwarded to, starting the
    /// instance first when its application does not answer.
    pub async fn ensure_ready(&self, route: &Route) -> Result<Endpoint, WakeError> {
        let instances = self.instances.as_ref();
        let backend = route.backend_id.as_str();

        debug!(phase = ?WakePhase::Locating, backend, "Locating instance");
        let endpoint = locate(instances, backend, route.port)
            .await
            .ok_or(WakeError::NoEndpoint)?;

        debug!(phase = ?WakePhase::ProbingCurrent, backend, endpoint = %endpoint, "Probing current endpoint");
        if self
            .prober
            .probe(&endpoint, &route.health_path, self.config.probe_timeout())
            .await
            .is_healthy()
        {
            return Ok(endpoint);
        }

        info!(phase = ?WakePhase::Starting, backend, "Backend not responding, starting instance");
        instances.start(backend).await.map_err(WakeError::StartFailed)?;

        debug!(
            phase = ?WakePhase::WaitingRunning,
            backend,
            poll_interval_secs = self.config.running_poll_interval_secs,
            max_attempts = self.config.running_max_attempts,
            "Waiting for instance to run"
        );
        instances
            .wait_until_running(
                backend,
                self.config.running_poll_interval(),
                self.config.running_max_attempts,
            )
            .await
            .map_err(WakeError::StartFailed)?;

        debug!(phase = ?WakePhase::Relocating, backend, "Instance running, locating");
        let endpoint = locate(instances, backend, route.port)
            .await
            .ok_or(WakeError::NoEndpointAfterStart)?;

        if !self.wait_for_health(route, &endpoint).await {
            warn!(
                backend,
                endpoint = %endpoint,
                attempts = self.config.post_start_probe_attempts,
                "Application did not pass health checks, forwarding anyway"
            );
        }

        Ok(endpoint)
    }

    /// Poll the health path until it passes or the attempt budget runs out
    async fn wait_for_health(&self, route: &Route, endpoint: &Endpoint) -> bool {
        let attempts = self.config.post_start_probe_attempts;

        for attempt in 1..=attempts {
            debug!(phase = ?WakePhase::ProbingPostStart, backend = %route.backend_id, attempt, "Probing started instance");
            if self
                .prober
                .probe(endpoint, &route.health_path, self.config.post_start_probe_timeout())
                .await
                .is_healthy()
            {
                info!(backend = %route.backend_id, endpoint = %endpoint, attempt, "Backend ready");
                return true;
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.post_start_probe_interval()).await;
            }
        }

        false
    }
}
