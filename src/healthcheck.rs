//! Health probes against backend applications
//!
//! A probe is a single GET with a caller-supplied timeout. It never fails:
//! every outcome folds into [`HealthStatus`].

use crate::client::BackendClient;
use crate::instance::Endpoint;
use hyper::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Outcome of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Probes `endpoint + health_path`
#[derive(Clone)]
pub struct HealthProber {
    client: BackendClient,
}

impl HealthProber {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }

    /// Healthy only on an exact 200. Other statuses, connection errors and
    /// timeouts are all Unhealthy.
    pub async fn probe(&self, endpoint: &Endpoint, health_path: &str, timeout: Duration) -> HealthStatus {
        let url = endpoint.url(health_path);

        match self.client.get_status(&url, timeout).await {
            Ok(StatusCode::OK) => {
                debug!(url, "Health check passed");
                HealthStatus::Healthy
            }
            Ok(status) => {
                debug!(url, status = status.as_u16(), "Health check failed (status)");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                debug!(url, error = %e, "Health check failed");
                HealthStatus::Unhealthy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `status_line`
    async fn canned_server(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status_line
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Unhealthy.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_ok() {
        let port = canned_server("200 OK").await;
        let prober = HealthProber::new(BackendClient::new());
        let status = prober
            .probe(&Endpoint::http("127.0.0.1", port), "/health", Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_probe_non_200_is_unhealthy() {
        let port = canned_server("204 No Content").await;
        let prober = HealthProber::new(BackendClient::new());
        let status = prober
            .probe(&Endpoint::http("127.0.0.1", port), "/", Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = HealthProber::new(BackendClient::new());
        let status = prober
            .probe(&Endpoint::http("127.0.0.1", port), "/", Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
