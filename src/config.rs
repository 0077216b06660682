use crate::route::Route;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Idle reaper settings
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Global default settings for routes
    #[serde(default)]
    pub defaults: RouteDefaults,

    /// Cluster API access
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Route definitions keyed by route id
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, bound to localhost
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path answered with readiness JSON for the waiting page
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// DNS suffix of in-cluster services
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    /// Forward every route to this `host:port` instead of its cluster
    /// service (local development)
    pub upstream_override: Option<String>,

    /// Maximum time to wait for an upstream response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            status_path: default_status_path(),
            cluster_domain: default_cluster_domain(),
            upstream_override: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Seconds between idle scans
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteDefaults {
    /// Namespace for routes that do not name one. When unset, the namespace
    /// is detected from the environment.
    pub namespace: Option<String>,

    /// Default idle timeout in seconds before scaling to zero
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Default service port
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            namespace: None,
            idle_timeout_secs: default_idle_timeout(),
            target_port: default_target_port(),
        }
    }
}

/// Which control plane implementation to use
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneKind {
    /// Kubernetes API server (default)
    #[default]
    Kubernetes,
    /// In-memory workloads that become ready instantly (demo mode)
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub kind: ControlPlaneKind,

    /// API server URL; the in-cluster environment is used when unset
    pub api_url: Option<String>,

    /// Static bearer token
    pub token: Option<String>,

    /// File holding the bearer token, re-read on every call
    pub token_file: Option<String>,

    /// PEM bundle used to verify the API server
    pub ca_file: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Timeout for each API call in seconds
    #[serde(default = "default_control_plane_timeout")]
    pub timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            kind: ControlPlaneKind::default(),
            api_url: None,
            token: None,
            token_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
            timeout_secs: default_control_plane_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DependencyConfig {
    pub name: String,

    /// Scale to zero together with the route (default: false)
    #[serde(default)]
    pub stop_on_idle: bool,
}

/// Configuration for a single route
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    /// Exact host to match; empty or absent matches any host
    #[serde(default)]
    pub host: String,

    /// Path prefix to match (default: "/")
    #[serde(default = "default_path")]
    pub path: String,

    /// Deployment that serves this route
    pub deployment: String,

    /// Service to forward to (defaults to the deployment name)
    pub target_service: Option<String>,

    /// Service port (overrides default)
    pub target_port: Option<u16>,

    /// Namespace (overrides default)
    pub namespace: Option<String>,

    /// Idle timeout in seconds (overrides default)
    pub idle_timeout_secs: Option<u64>,

    /// Workloads that must run alongside the deployment
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

impl RouteConfig {
    pub fn new(host: &str, path: &str, deployment: &str) -> Self {
        Self {
            host: host.to_string(),
            path: path.to_string(),
            deployment: deployment.to_string(),
            target_service: None,
            target_port: None,
            namespace: None,
            idle_timeout_secs: None,
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency (builder pattern)
    pub fn with_dependency(mut self, name: &str, stop_on_idle: bool) -> Self {
        self.dependencies.push(DependencyConfig {
            name: name.to_string(),
            stop_on_idle,
        });
        self
    }

    pub fn target_port(&self, defaults: &RouteDefaults) -> u16 {
        self.target_port.unwrap_or(defaults.target_port)
    }

    pub fn idle_timeout(&self, defaults: &RouteDefaults) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs))
    }

    /// Build the runtime route. `fallback_namespace` applies when neither
    /// the route nor the defaults name a namespace.
    pub fn to_route(&self, id: &str, defaults: &RouteDefaults, fallback_namespace: &str) -> Route {
        let namespace = self
            .namespace
            .as_deref()
            .or(defaults.namespace.as_deref())
            .unwrap_or(fallback_namespace);
        let service = self
            .target_service
            .as_deref()
            .unwrap_or(&self.deployment);

        let mut route = Route::new(id, self.host.to_ascii_lowercase(), &self.path, &self.deployment)
            .with_namespace(namespace)
            .with_target(service, self.target_port(defaults))
            .with_idle_timeout(self.idle_timeout(defaults));
        for dep in &self.dependencies {
            route = route.with_dependency(&dep.name, dep.stop_on_idle);
        }
        route
    }

    /// Validate the route configuration
    pub fn validate(&self, id: &str, defaults: &RouteDefaults) -> Vec<String> {
        let mut errors = Vec::new();

        if self.deployment.trim().is_empty() {
            errors.push(format!("Route '{}': 'deployment' must not be empty", id));
        }

        if self.host.contains([':', '[', ']', '/']) {
            errors.push(format!(
                "Route '{}': 'host' must be a bare hostname without port, brackets or path (got '{}')",
                id, self.host
            ));
        }

        if !self.path.starts_with('/') {
            errors.push(format!("Route '{}': 'path' must start with '/'", id));
        }

        if self.target_port(defaults) == 0 {
            errors.push(format!(
                "Route '{}': 'target_port' must be greater than 0",
                id
            ));
        }

        if self.idle_timeout(defaults).is_zero() {
            errors.push(format!(
                "Route '{}': 'idle_timeout_secs' must be greater than 0",
                id
            ));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                errors.push(format!("Route '{}': dependency name must not be empty", id));
            } else if dep.name == self.deployment {
                errors.push(format!(
                    "Route '{}': dependency '{}' is the route's own deployment",
                    id, dep.name
                ));
            } else if !seen.insert(dep.name.as_str()) {
                errors.push(format!(
                    "Route '{}': dependency '{}' is listed twice",
                    id, dep.name
                ));
            }
        }

        errors
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8081
}

fn default_status_path() -> String {
    "/__wakegate/status".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for upstream to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_target_port() -> u16 {
    80
}

fn default_control_plane_timeout() -> u64 {
    10
}

fn default_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.reaper.interval_secs == 0 {
            errors.push("Reaper: 'interval_secs' must be greater than 0".to_string());
        }

        if !self.server.status_path.starts_with('/') {
            errors.push("Server: 'status_path' must start with '/'".to_string());
        }

        for (id, route) in &self.routes {
            errors.extend(route.validate(id, &self.defaults));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Runtime routes, ordered by id
    pub fn routes(&self, fallback_namespace: &str) -> Vec<Route> {
        self.routes
            .iter()
            .map(|(id, route)| route.to_route(id, &self.defaults, fallback_namespace))
            .collect()
    }
}
