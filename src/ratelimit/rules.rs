//! Rate limit policy configuration and resolution.
//!
//! Policies are registered in an explicit table keyed by route, with optional
//! per-handler entries under each route. Resolution picks the most specific
//! entry: handler, then route, then the table default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::identity::DEFAULT_NAMESPACE;
use crate::error::{GuardError, Result};

/// Default request budget per window.
const DEFAULT_LIMIT: u64 = 100;
/// Default window length in milliseconds.
const DEFAULT_WINDOW_MS: u64 = 60_000;

/// A request budget over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum requests accepted per window (inclusive)
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Policy {
    /// The process-wide fallback: 100 requests per minute.
    pub const DEFAULT: Policy = Policy {
        limit: DEFAULT_LIMIT,
        window_ms: DEFAULT_WINDOW_MS,
    };

    /// Create a policy.
    pub const fn new(limit: u64, window_ms: u64) -> Self {
        Self { limit, window_ms }
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Whether the policy can ever admit a request.
    pub fn is_valid(&self) -> bool {
        self.limit > 0 && self.window_ms > 0
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The route and optional handler a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub route: String,
    #[serde(default)]
    pub handler: Option<String>,
}

impl Target {
    /// Target a whole route.
    pub fn route(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            handler: None,
        }
    }

    /// Narrow the target to a single handler of its route.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.handler {
            Some(handler) => write!(f, "{}#{}", self.route, handler),
            None => f.write_str(&self.route),
        }
    }
}

/// Which table level a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Handler,
    Route,
    Default,
}

/// The outcome of resolving a target against the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub policy: Policy,
    /// Namespace of the bucket key
    pub namespace: String,
    pub scope: Scope,
}

/// Per-route configuration.
///
/// `limit` and `window_ms` are both optional: a route may only group
/// handlers. A field left unset inherits from the table default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Isolated bucket namespace for this route
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

/// Per-handler configuration. Unset fields inherit from the route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub handler: String,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Merge a partial override onto a base policy.
///
/// Returns `None` when the override sets neither field, meaning the level
/// contributes no policy of its own.
fn overlay(base: Policy, limit: Option<u64>, window_ms: Option<u64>) -> Option<Policy> {
    if limit.is_none() && window_ms.is_none() {
        return None;
    }
    Some(Policy {
        limit: limit.unwrap_or(base.limit),
        window_ms: window_ms.unwrap_or(base.window_ms),
    })
}

/// The complete policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Policy applied when no route or handler entry matches
    #[serde(default)]
    pub default: Policy,
    /// Bucket namespace used when no entry names one
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            default: Policy::DEFAULT,
            namespace: default_namespace(),
            routes: Vec::new(),
        }
    }
}

impl PolicyTable {
    /// Create a table holding only the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default policy.
    pub fn with_default(mut self, policy: Policy) -> Self {
        self.default = policy;
        self
    }

    /// Register a route-level policy, replacing any previous one.
    pub fn with_route(mut self, route: &str, policy: Policy) -> Self {
        let entry = self.route_entry(route);
        entry.limit = Some(policy.limit);
        entry.window_ms = Some(policy.window_ms);
        self
    }

    /// Register a handler-level policy under `route`.
    pub fn with_handler(mut self, route: &str, handler: &str, policy: Policy) -> Self {
        let entry = self.route_entry(route);
        entry.handlers.retain(|h| h.handler != handler);
        entry.handlers.push(HandlerConfig {
            handler: handler.to_string(),
            limit: Some(policy.limit),
            window_ms: Some(policy.window_ms),
            namespace: None,
        });
        self
    }

    /// Give `route` its own bucket namespace.
    pub fn with_route_namespace(mut self, route: &str, namespace: &str) -> Self {
        self.route_entry(route).namespace = Some(namespace.to_string());
        self
    }

    fn route_entry(&mut self, route: &str) -> &mut RouteConfig {
        let index = match self.routes.iter().position(|r| r.route == route) {
            Some(index) => index,
            None => {
                self.routes.push(RouteConfig {
                    route: route.to_string(),
                    limit: None,
                    window_ms: None,
                    namespace: None,
                    handlers: Vec::new(),
                });
                self.routes.len() - 1
            }
        };
        &mut self.routes[index]
    }

    /// Load the table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load the table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    /// Resolve the nearest-scoped policy for `target`.
    ///
    /// Never fails: an unknown route or handler falls back to the default.
    pub fn resolve(&self, target: &Target) -> Resolved {
        let fallback = Resolved {
            policy: self.default,
            namespace: self.namespace.clone(),
            scope: Scope::Default,
        };

        let Some(route) = self.routes.iter().find(|r| r.route == target.route) else {
            return fallback;
        };

        let route_policy = overlay(self.default, route.limit, route.window_ms);
        let route_namespace = route.namespace.as_ref().unwrap_or(&self.namespace);

        let handler = target
            .handler
            .as_deref()
            .and_then(|name| route.handlers.iter().find(|h| h.handler == name));

        // A handler namespace applies even when the policy comes from further up.
        let namespace = handler
            .and_then(|h| h.namespace.as_ref())
            .unwrap_or(route_namespace)
            .clone();

        if let Some(handler) = handler {
            let base = route_policy.unwrap_or(self.default);
            if let Some(policy) = overlay(base, handler.limit, handler.window_ms) {
                return Resolved {
                    policy,
                    namespace,
                    scope: Scope::Handler,
                };
            }
        }

        match route_policy {
            Some(policy) => Resolved {
                policy,
                namespace,
                scope: Scope::Route,
            },
            None => Resolved {
                namespace,
                ..fallback
            },
        }
    }

    /// Every invalid policy in the table, labelled by where it is registered.
    pub fn invalid_entries(&self) -> Vec<(String, Policy)> {
        let mut invalid = Vec::new();
        if !self.default.is_valid() {
            invalid.push(("default".to_string(), self.default));
        }
        for route in &self.routes {
            let route_policy = overlay(self.default, route.limit, route.window_ms);
            if let Some(policy) = route_policy.filter(|p| !p.is_valid()) {
                invalid.push((route.route.clone(), policy));
            }
            let base = route_policy.unwrap_or(self.default);
            for handler in &route.handlers {
                if let Some(policy) =
                    overlay(base, handler.limit, handler.window_ms).filter(|p| !p.is_valid())
                {
                    invalid.push((format!("{}#{}", route.route, handler.handler), policy));
                }
            }
        }
        invalid
    }

    /// Log one warning per invalid policy.
    ///
    /// Called when a table is installed, so request handling never logs
    /// about configuration.
    pub fn report_invalid(&self) {
        for (entry, policy) in self.invalid_entries() {
            warn!(
                entry = %entry,
                limit = policy.limit,
                window_ms = policy.window_ms,
                "Invalid rate limit policy; every request it governs will be denied"
            );
        }
    }
}
