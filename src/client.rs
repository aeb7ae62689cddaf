//! HTTP client for backend connections
//!
//! Shared by the health prober and the forwarder. Connections are not kept
//! alive between calls: a backend's address may change after every stop/start
//! cycle, so each call dials afresh.

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::http::response::Parts;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Error type for backend calls
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error from the HTTP client (connect, protocol)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error while reading the response body
    #[error("error reading response body: {0}")]
    Body(#[from] hyper::Error),
    /// The call did not complete in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// A fully buffered backend response
#[derive(Debug)]
pub struct BufferedResponse {
    pub parts: Parts,
    pub body: Bytes,
}

/// HTTP client for backend requests
#[derive(Clone)]
pub struct BackendClient {
    /// Client for forwarded requests
    client: Client<HttpConnector, Full<Bytes>>,
    /// Client for health checks (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
}

impl BackendClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!("Backend client initialized");

        Self {
            client,
            health_client,
        }
    }

    /// Send a request and buffer the whole response within `timeout`
    pub async fn send(
        &self,
        req: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<BufferedResponse, ClientError> {
        let call = async {
            let response = self.client.request(req).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, ClientError>(BufferedResponse { parts, body })
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    /// GET `url` and return the status code within `timeout`
    pub async fn get_status(&self, url: &str, timeout: Duration) -> Result<StatusCode, ClientError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Empty::<Bytes>::new())
            .map_err(|e| ClientError::RequestBuild(e.to_string()))?;

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) => Ok(response.status()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}
