//! Request and response envelopes
//!
//! The proxy works on these transport-neutral shapes instead of hyper types so
//! that the same controller serves both the HTTP listener and JSON events in
//! the function-URL format (`httpMethod`/`statusCode`/`isBase64Encoded`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// An inbound request, detached from the listener it arrived on
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Header names are case-insensitive
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestEnvelope {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Path plus query string, as sent to the backend
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// Parse a function-URL style JSON event
    pub fn from_event_json(json: &str) -> anyhow::Result<Self> {
        let event: RequestEvent = serde_json::from_str(json)?;

        let method = Method::from_bytes(event.http_method.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid httpMethod '{}': {}", event.http_method, e))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &event.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("Invalid header name '{}': {}", name, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("Invalid value for header '{}': {}", name, e))?;
            headers.append(name, value);
        }

        let body = match event.body {
            Some(body) if event.is_base64_encoded => Bytes::from(
                BASE64
                    .decode(body.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Invalid base64 request body: {}", e))?,
            ),
            Some(body) => Bytes::from(body),
            None => Bytes::new(),
        };

        let query = if event.query_string_parameters.is_empty() {
            None
        } else {
            Some(
                event
                    .query_string_parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&"),
            )
        };

        Ok(Self {
            method,
            path: event.path,
            query,
            headers,
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestEvent {
    #[serde(default = "default_event_method")]
    http_method: String,
    #[serde(default = "default_event_path")]
    path: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    query_string_parameters: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    is_base64_encoded: bool,
}

fn default_event_method() -> String {
    "GET".to_string()
}

fn default_event_path() -> String {
    "/".to_string()
}

/// An outbound response. Binary bodies are carried base64-encoded with
/// `is_base64_encoded` set.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    pub is_base64_encoded: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseEvent<'a> {
    status_code: u16,
    headers: BTreeMap<String, String>,
    body: &'a str,
    is_base64_encoded: bool,
}

impl ResponseEnvelope {
    /// Build an envelope from a raw body, choosing text or base64 from the content type
    pub fn from_body(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let (body, is_base64_encoded) = encode_body(content_type, body);
        let mut envelope = Self {
            status,
            headers,
            body,
            is_base64_encoded,
        };
        envelope.apply_cors();
        envelope
    }

    /// A UTF-8 JSON body
    pub fn json(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut envelope = Self {
            status,
            headers,
            body,
            is_base64_encoded: false,
        };
        envelope.apply_cors();
        envelope
    }

    /// Set the permissive CORS headers, replacing whatever the backend sent
    pub fn apply_cors(&mut self) {
        self.headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static(CORS_ALLOW_ORIGIN),
        );
        self.headers.insert(
            "access-control-allow-methods",
            HeaderValue::from_static(CORS_ALLOW_METHODS),
        );
        self.headers.insert(
            "access-control-allow-headers",
            HeaderValue::from_static(CORS_ALLOW_HEADERS),
        );
    }

    /// Raw body bytes, decoding base64 when flagged
    pub fn body_bytes(&self) -> Result<Bytes, base64::DecodeError> {
        if self.is_base64_encoded {
            BASE64.decode(self.body.as_bytes()).map(Bytes::from)
        } else {
            Ok(Bytes::from(self.body.clone()))
        }
    }

    /// Function-URL style JSON. Repeated headers are joined with ", ".
    pub fn to_event_json(&self) -> String {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let event = ResponseEvent {
            status_code: self.status.as_u16(),
            headers,
            body: &self.body,
            is_base64_encoded: self.is_base64_encoded,
        };

        serde_json::to_string(&event).unwrap_or_else(|_| {
            format!(r#"{{"statusCode":{},"body":""}}"#, self.status.as_u16())
        })
    }

    /// Convert into a hyper response for the HTTP listener
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = match self.body_bytes() {
            Ok(body) => body,
            Err(_) => Bytes::from(self.body.clone()),
        };

        let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Whether a declared content type is carried as text
pub fn is_textual_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let content_type = content_type.trim().to_ascii_lowercase();
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xml")
}

/// Encode a body for the envelope: textual types pass through as UTF-8,
/// everything else (and text that is not valid UTF-8) becomes base64.
pub fn encode_body(content_type: Option<&str>, body: Bytes) -> (String, bool) {
    if is_textual_content_type(content_type) {
        match String::from_utf8(body.to_vec()) {
            Ok(text) => return (text, false),
            Err(_) => return (BASE64.encode(&body), true),
        }
    }
    (BASE64.encode(&body), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];

    #[test]
    fn test_textual_content_types() {
        assert!(is_textual_content_type(Some("text/html; charset=utf-8")));
        assert!(is_textual_content_type(Some("application/json")));
        assert!(is_textual_content_type(Some("Application/JSON; charset=utf-8")));
        assert!(is_textual_content_type(Some("application/xml")));
        assert!(!is_textual_content_type(Some("image/png")));
        assert!(!is_textual_content_type(Some("application/octet-stream")));
        assert!(!is_textual_content_type(None));
    }

    #[test]
    fn test_png_body_is_base64() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let envelope = ResponseEnvelope::from_body(StatusCode::OK, headers, Bytes::from_static(PNG_HEADER));

        assert!(envelope.is_base64_encoded);
        assert_eq!(envelope.body_bytes().unwrap().as_ref(), PNG_HEADER);
    }

    #[test]
    fn test_json_body_is_unmodified() {
        let body = r#"{"ok":true,"items":[1,2,3]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let envelope = ResponseEnvelope::from_body(StatusCode::OK, headers, Bytes::from(body));

        assert!(!envelope.is_base64_encoded);
        assert_eq!(envelope.body, body);
    }

    #[test]
    fn test_missing_content_type_is_binary() {
        let envelope = ResponseEnvelope::from_body(StatusCode::OK, HeaderMap::new(), Bytes::from("plain"));
        assert!(envelope.is_base64_encoded);
        assert_eq!(envelope.body, BASE64.encode("plain"));
    }

    #[test]
    fn test_invalid_utf8_text_falls_back_to_base64() {
        let (body, encoded) = encode_body(Some("text/plain"), Bytes::from_static(&[0xff, 0xfe]));
        assert!(encoded);
        assert_eq!(BASE64.decode(body).unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn test_cors_overrides_backend_values() {
        let mut headers = HeaderMap::new();
        headers.insert("access-control-allow-origin", HeaderValue::from_static("https://only.example"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let envelope = ResponseEnvelope::from_body(StatusCode::OK, headers, Bytes::from("hi"));

        assert_eq!(envelope.headers.get("access-control-allow-origin").unwrap(), "*");
        assert_eq!(
            envelope.headers.get("access-control-allow-methods").unwrap(),
            CORS_ALLOW_METHODS
        );
        assert_eq!(
            envelope.headers.get("access-control-allow-headers").unwrap(),
            CORS_ALLOW_HEADERS
        );
        assert_eq!(envelope.headers.get_all("access-control-allow-origin").iter().count(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let envelope = ResponseEnvelope::from_body(StatusCode::CREATED, headers, Bytes::from_static(PNG_HEADER));

        let json: serde_json::Value = serde_json::from_str(&envelope.to_event_json()).unwrap();
        assert_eq!(json["statusCode"], 201);
        assert_eq!(json["isBase64Encoded"], true);
        assert_eq!(json["headers"]["content-type"], "image/png");
        assert_eq!(json["headers"]["access-control-allow-origin"], "*");
        assert_eq!(
            BASE64.decode(json["body"].as_str().unwrap()).unwrap(),
            PNG_HEADER
        );
    }

    #[test]
    fn test_request_event_parsing() {
        let event = r#"{
            "httpMethod": "POST",
            "path": "/app1/upload",
            "headers": {"Content-Type": "application/octet-stream", "X-Trace": "abc"},
            "queryStringParameters": {"a": "1"},
            "body": "AAEC",
            "isBase64Encoded": true
        }"#;

        let request = RequestEnvelope::from_event_json(event).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/app1/upload");
        assert_eq!(request.path_and_query(), "/app1/upload?a=1");
        assert_eq!(request.headers.get("x-trace").unwrap(), "abc");
        assert_eq!(request.body.as_ref(), &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_request_event_query_is_percent_encoded() {
        let event = r#"{"path":"/search","queryStringParameters":{"q":"a b","tag":"x&y=z"}}"#;

        let request = RequestEnvelope::from_event_json(event).unwrap();
        assert_eq!(request.path_and_query(), "/search?q=a%20b&tag=x%26y%3Dz");
        assert!(request.path_and_query().parse::<hyper::Uri>().is_ok());
    }

    #[test]
    fn test_request_event_defaults() {
        let request = RequestEnvelope::from_event_json("{}").unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/");
        assert!(request.body.is_empty());
        assert_eq!(request.path_and_query(), "/");
    }

    #[test]
    fn test_into_response_decodes_binary() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let envelope = ResponseEnvelope::from_body(StatusCode::OK, headers, Bytes::from_static(PNG_HEADER));

        let response = envelope.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
    }
}
