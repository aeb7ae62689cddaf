//! lazywake - A reverse proxy that wakes stopped instances on demand
//!
//! This library provides:
//! - Path-based routing of HTTP requests to configured backend instances
//! - Starting stopped instances when a request arrives and waiting for them
//!   to become healthy before forwarding
//! - Response envelopes with CORS headers and base64 encoding for binary bodies
//! - An idle reaper that stops instances whose CPU and network usage stayed
//!   below thresholds over a trailing window
//! - A Docker-backed instance manager and metrics sampler

pub mod client;
pub mod config;
pub mod docker;
pub mod envelope;
pub mod error;
pub mod forward;
pub mod healthcheck;
pub mod instance;
pub mod metrics;
pub mod proxy;
pub mod reaper;
pub mod routing;
pub mod wake;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
