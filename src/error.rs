//! Error handling and JSON error responses for the proxy

use crate::envelope::ResponseEnvelope;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matched the request path
    RouteNotFound,
    /// The instance manager reported no address for the instance
    EndpointUnavailable,
    /// The start command or the running-state wait failed
    StartFailed,
    /// The backend call errored, timed out or returned a malformed response
    ForwardFailed,
    /// The inbound request could not be read
    InvalidRequest,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::EndpointUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::StartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ForwardFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::EndpointUnavailable => "ENDPOINT_UNAVAILABLE",
            ProxyErrorCode::StartFailed => "START_FAILED",
            ProxyErrorCode::ForwardFailed => "FORWARD_FAILED",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub error: String,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Requested path, for route misses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Diagnostic detail, for forwarding failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, error: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            error: error.into(),
            path: None,
            details: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }

    /// Render as a JSON response envelope with CORS and X-Proxy-Error headers
    pub fn into_envelope(self) -> ResponseEnvelope {
        let mut envelope = ResponseEnvelope::json(self.code.status_code(), self.to_json());
        envelope.headers.insert(
            "x-proxy-error",
            HeaderValue::from_static(self.code.as_header_value()),
        );
        envelope
    }
}

/// Create a JSON error envelope
pub fn json_error_response(code: ProxyErrorCode, error: impl Into<String>) -> ResponseEnvelope {
    ErrorResponse::new(code, error).into_envelope()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::EndpointUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::StartFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::ForwardFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyErrorCode::InvalidRequest.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::RouteNotFound, "Service not found")
            .with_path("/missing/thing");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"ROUTE_NOT_FOUND\""));
        assert!(json.contains("\"error\":\"Service not found\""));
        assert!(json.contains("\"status\":404"));
        assert!(json.contains("\"path\":\"/missing/thing\""));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_json_error_response() {
        let envelope = ErrorResponse::new(ProxyErrorCode::ForwardFailed, "Bad Gateway")
            .with_details("connection refused")
            .into_envelope();

        assert_eq!(envelope.status, StatusCode::BAD_GATEWAY);
        assert!(!envelope.is_base64_encoded);
        assert_eq!(envelope.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(envelope.headers.get("x-proxy-error").unwrap(), "FORWARD_FAILED");
        assert_eq!(envelope.headers.get("access-control-allow-origin").unwrap(), "*");

        let body: serde_json::Value = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(body["details"], "connection refused");
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(ProxyErrorCode::StartFailed.as_header_value(), "START_FAILED");
        assert_eq!(
            ProxyErrorCode::EndpointUnavailable.as_header_value(),
            "ENDPOINT_UNAVAILABLE"
        );
    }
}
