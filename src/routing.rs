//! Path-based backend resolution
//!
//! The route table is built once from configuration. Resolution checks, in
//! order: named prefix routes, numbered fallback slots, the single default
//! backend.

use crate::config::{RoutesConfig, MAX_BACKEND_SLOTS};

/// A resolved route: which backend serves a path, and how to reach and probe it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Prefix this route was matched on (empty for fallback routes)
    pub key_prefix: String,
    /// Opaque instance identity passed to the instance manager
    pub backend_id: String,
    /// Application port on the instance
    pub port: u16,
    /// Path probed to decide whether the application is up
    pub health_path: String,
}

/// Immutable route table
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    named: Vec<Route>,
    /// Index `i` holds slot `i + 1`
    slots: Vec<Option<Route>>,
    default: Option<Route>,
}

impl RouteTable {
    pub fn from_config(config: &RoutesConfig) -> Self {
        let target = |backend: &str, port: Option<u16>, health_path: Option<&String>, prefix: &str| Route {
            key_prefix: prefix.to_string(),
            backend_id: backend.trim().to_string(),
            port: port.unwrap_or(config.default_port),
            health_path: health_path
                .cloned()
                .unwrap_or_else(|| config.default_health_path.clone()),
        };

        let named = config
            .named
            .iter()
            .map(|r| target(&r.backend, r.port, r.health_path.as_ref(), &r.prefix))
            .collect();

        let mut slots: Vec<Option<Route>> = vec![None; MAX_BACKEND_SLOTS];
        for slot in &config.slots {
            if slot.index == 0 || slot.index > MAX_BACKEND_SLOTS || slot.backend.trim().is_empty() {
                continue;
            }
            // First declaration wins if validation was skipped
            let entry = &mut slots[slot.index - 1];
            if entry.is_none() {
                *entry = Some(target(&slot.backend, slot.port, slot.health_path.as_ref(), ""));
            }
        }

        let default = config
            .default
            .as_ref()
            .filter(|d| !d.backend.trim().is_empty())
            .map(|d| target(&d.backend, d.port, d.health_path.as_ref(), ""));

        Self {
            named,
            slots,
            default,
        }
    }

    /// Select the backend for `path`, or `None` when nothing is configured for it
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.named
            .iter()
            .find(|r| !r.backend_id.is_empty() && path.starts_with(&r.key_prefix))
            .or_else(|| self.slots.iter().flatten().next())
            .or(self.default.as_ref())
    }

    /// Number of configured backends (named routes with a backend, slots, default)
    pub fn len(&self) -> usize {
        self.named.iter().filter(|r| !r.backend_id.is_empty()).count()
            + self.slots.iter().flatten().count()
            + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
