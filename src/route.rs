//! Route definitions: the unit of routing and lifecycle configuration

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// A workload that must be running alongside a route's own deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Deployment name, in the route's namespace
    pub name: String,
    /// Scale this dependency to zero together with the route's deployment
    pub stop_on_idle: bool,
}

impl Dependency {
    pub fn new(name: impl Into<String>, stop_on_idle: bool) -> Self {
        Self {
            name: name.into(),
            stop_on_idle,
        }
    }
}

/// A configured mapping from (host, path prefix) to a forwarding target
/// and its scale-to-zero policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    /// Unique, stable identifier
    pub id: String,
    /// Exact host to match; empty matches any host
    pub host: String,
    /// URL path prefix to match
    pub path_prefix: String,
    pub target_service: String,
    pub target_port: u16,
    pub namespace: String,
    /// Workload whose replica count decides readiness for this route
    pub deployment: String,
    /// Additional workloads that must be running, in declared order
    pub dependencies: Vec<Dependency>,
    #[serde(rename = "idle_timeout_secs", serialize_with = "serialize_secs")]
    pub idle_timeout: Duration,
    pub last_activity: DateTime<Utc>,
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_secs())
}

impl Route {
    /// Create a route whose service name matches its deployment
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        path_prefix: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        let deployment = deployment.into();
        Self {
            id: id.into(),
            host: host.into(),
            path_prefix: path_prefix.into(),
            target_service: deployment.clone(),
            target_port: 80,
            namespace: "default".to_string(),
            deployment,
            dependencies: Vec::new(),
            idle_timeout: Duration::from_secs(1800),
            last_activity: Utc::now(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_target(mut self, service: impl Into<String>, port: u16) -> Self {
        self.target_service = service.into();
        self.target_port = port;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, stop_on_idle: bool) -> Self {
        self.dependencies.push(Dependency::new(name, stop_on_idle));
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = at;
        self
    }

    /// The workloads checked for readiness: the deployment first, then
    /// every dependency in declared order
    pub fn workloads(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.deployment.as_str())
            .chain(self.dependencies.iter().map(|d| d.name.as_str()))
    }

    /// `host:port` of the in-cluster service this route forwards to
    pub fn upstream_authority(&self, cluster_domain: &str) -> String {
        format!(
            "{}.{}.svc.{}:{}",
            self.target_service, self.namespace, cluster_domain, self.target_port
        )
    }

    /// Whether the route has been idle longer than its timeout at `now`
    pub fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_activity);
        match idle.to_std() {
            Ok(idle) => idle > self.idle_timeout,
            // last_activity lies in the future
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workloads_lists_deployment_then_dependencies() {
        let route = Route::new("r", "", "/", "web")
            .with_dependency("db", true)
            .with_dependency("cache", false);

        let names: Vec<&str> = route.workloads().collect();
        assert_eq!(names, vec!["web", "db", "cache"]);
    }

    #[test]
    fn test_upstream_authority() {
        let route = Route::new("r", "", "/", "web")
            .with_namespace("shop")
            .with_target("web-svc", 8080);

        assert_eq!(
            route.upstream_authority("cluster.local"),
            "web-svc.shop.svc.cluster.local:8080"
        );
    }

    #[test]
    fn test_is_idle_at() {
        let now = Utc::now();
        let route = Route::new("r", "", "/", "web")
            .with_idle_timeout(Duration::from_secs(30 * 60))
            .with_last_activity(now - chrono::Duration::minutes(40));

        assert!(route.is_idle_at(now));
        assert!(!route.is_idle_at(now - chrono::Duration::minutes(20)));
    }

    #[test]
    fn test_future_activity_is_not_idle() {
        let now = Utc::now();
        let route = Route::new("r", "", "/", "web")
            .with_idle_timeout(Duration::from_secs(1))
            .with_last_activity(now + chrono::Duration::minutes(5));

        assert!(!route.is_idle_at(now));
    }

    #[test]
    fn test_serializes_idle_timeout_as_seconds() {
        let route = Route::new("r", "", "/", "web").with_idle_timeout(Duration::from_secs(90));
        let json = serde_json::to_value(&route).unwrap();

        assert_eq!(json["idle_timeout_secs"], 90);
        assert_eq!(json["deployment"], "web");
    }
}
