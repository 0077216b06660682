//! Host and path based route selection

use crate::registry::RouteRegistry;
use crate::route::Route;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, Span};

/// Strip a `:port` suffix from a Host header value.
///
/// Bracketed IPv6 literals lose their brackets (`[::1]:8080` becomes `::1`).
/// Values that do not split cleanly are returned unchanged.
pub fn normalize_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((addr, tail)) if tail.is_empty() || tail.starts_with(':') => addr,
            _ => host,
        };
    }

    match host.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address
        Some((name, _)) if name.contains(':') => host,
        Some((name, _)) => name,
        None => host,
    }
}

fn matches(route: &Route, host: &str, path: &str) -> bool {
    let host_matches = route.host.is_empty() || route.host.eq_ignore_ascii_case(host);
    host_matches && path.starts_with(route.path_prefix.as_str())
}

/// Order candidates so that the preferred one compares greatest: longer
/// prefix first, then exact host over wildcard, then the smaller id.
fn preference(a: &Route, b: &Route) -> Ordering {
    a.path_prefix
        .len()
        .cmp(&b.path_prefix.len())
        .then_with(|| (!a.host.is_empty()).cmp(&!b.host.is_empty()))
        .then_with(|| b.id.cmp(&a.id))
}

/// Select the best route for a request. `host` may still carry a port.
pub fn select<'a>(routes: &'a [Route], host: &str, path: &str) -> Option<&'a Route> {
    let host = normalize_host(host);
    routes
        .iter()
        .filter(|route| matches(route, host, path))
        .max_by(|a, b| preference(a, b))
}

/// Resolves requests against the registry
pub struct RouteMatcher {
    registry: Arc<RouteRegistry>,
    span: Span,
}

impl RouteMatcher {
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self {
            registry,
            span: tracing::debug_span!("matcher"),
        }
    }

    /// Use the given span for everything this matcher logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Look up the route for a host and path without recording activity
    pub fn find(&self, host: &str, path: &str) -> Option<Route> {
        let routes = self.registry.list();
        select(&routes, host, path).cloned()
    }

    /// Look up the route for an inbound request and record activity on it
    pub fn route_request(&self, host: &str, path: &str) -> Option<Route> {
        let _entered = self.span.enter();
        let route = self.find(host, path);
        match &route {
            Some(route) => {
                self.registry.update_activity(&route.id);
                debug!(host, path, route = %route.id, deployment = %route.deployment, "Request matched route");
            }
            None => debug!(host, path, "No route matched"),
        }
        route
    }
}
