//! Request forwarding to a resolved backend endpoint

use crate::client::{BackendClient, ClientError};
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{ErrorResponse, ProxyErrorCode};
use crate::instance::Endpoint;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Request};
use std::time::Duration;
use tracing::{debug, error};

/// Inbound headers recomputed by the transport instead of being forwarded
fn is_stripped_request_header(name: &HeaderName) -> bool {
    *name == HOST || *name == CONTENT_LENGTH
}

/// Replays inbound requests against a backend and reshapes the response
#[derive(Clone)]
pub struct Forwarder {
    client: BackendClient,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(client: BackendClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Forward `request` to `endpoint`. Failures become a 502 envelope.
    pub async fn forward(&self, request: &RequestEnvelope, endpoint: &Endpoint) -> ResponseEnvelope {
        let backend_req = match build_backend_request(request, endpoint) {
            Ok(req) => req,
            Err(e) => return bad_gateway(endpoint, &e),
        };

        debug!(method = %request.method, uri = %backend_req.uri(), "Forwarding request");

        match self.client.send(backend_req, self.timeout).await {
            Ok(response) => {
                let status = response.parts.status;
                let headers = response_headers(response.parts.headers);
                debug!(status = status.as_u16(), bytes = response.body.len(), "Backend responded");
                ResponseEnvelope::from_body(status, headers, response.body)
            }
            Err(e) => bad_gateway(endpoint, &e),
        }
    }
}

/// Build the outbound request: same method, path, query and body; every
/// inbound header except `Host` and `Content-Length`.
pub fn build_backend_request(
    request: &RequestEnvelope,
    endpoint: &Endpoint,
) -> Result<Request<Full<Bytes>>, ClientError> {
    let uri = endpoint.url(&request.path_and_query());

    let mut builder = Request::builder().method(request.method.clone()).uri(&uri);

    if let Some(headers) = builder.headers_mut() {
        for (name, value) in request.headers.iter() {
            if is_stripped_request_header(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }

    builder
        .body(Full::new(request.body.clone()))
        .map_err(|e| ClientError::RequestBuild(e.to_string()))
}

/// Backend response headers minus framing headers that no longer apply once
/// the body is buffered and possibly re-encoded
fn response_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
    headers.remove("keep-alive");
    headers
}

fn bad_gateway(endpoint: &Endpoint, e: &ClientError) -> ResponseEnvelope {
    error!(endpoint = %endpoint, error = %e, "Failed to forward request");
    ErrorResponse::new(ProxyErrorCode::ForwardFailed, "Bad Gateway")
        .with_details(e.to_string())
        .into_envelope()
}
