//! Resolves request paths to service names

use serde::Deserialize;
use tracing::debug;

/// A configured prefix route
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Path prefix, matched on segment boundaries
    pub path_prefix: String,
    /// Service that serves the prefix
    pub service: String,
    /// Remove the prefix from the forwarded path
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,
}

fn default_strip_prefix() -> bool {
    true
}

/// Outcome of resolving a path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub service: String,
    /// Path to forward to the backend
    pub path: String,
}

/// Router mapping request paths to services.
///
/// Configured routes are tried longest prefix first. Without a match, the
/// first path segment names the service and the rest is forwarded.
pub struct Router {
    routes: Vec<RouteRule>,
}

impl Router {
    pub fn new(mut routes: Vec<RouteRule>) -> Self {
        for route in &mut routes {
            if route.path_prefix.len() > 1 {
                let trimmed = route.path_prefix.trim_end_matches('/');
                route.path_prefix = trimmed.to_string();
            }
        }
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    pub fn routes(&self) -> &[RouteRule] {
        &self.routes
    }

    /// Resolve a request path to a service and the path to forward
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        for route in &self.routes {
            if Self::match_prefix(path, &route.path_prefix) {
                let forwarded = if route.strip_prefix && route.path_prefix != "/" {
                    normalize(&path[route.path_prefix.len()..])
                } else {
                    normalize(path)
                };
                debug!("Path {} matched route {} -> {}", path, route.path_prefix, route.service);
                return Some(ResolvedRoute {
                    service: route.service.clone(),
                    path: forwarded,
                });
            }
        }

        let trimmed = path.trim_start_matches('/');
        let (service, rest) = match trimmed.split_once('/') {
            Some((service, rest)) => (service, rest),
            None => (trimmed, ""),
        };
        if service.is_empty() {
            return None;
        }

        Some(ResolvedRoute {
            service: service.to_string(),
            path: format!("/{}", rest),
        })
    }

    /// Match a path against a prefix on segment boundaries
    pub fn match_prefix(path: &str, prefix: &str) -> bool {
        if prefix == "/" {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

fn normalize(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
