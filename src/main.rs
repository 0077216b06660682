use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wakegate::admin::{AdminServer, PKG_NAME, VERSION};
use wakegate::config::{Config, ControlPlaneKind};
use wakegate::control_plane::{InMemoryControlPlane, SharedControlPlane};
use wakegate::kube::{self, KubeClient};
use wakegate::pool::PoolConfig;
use wakegate::proxy::{ProxyServer, ProxySettings};
use wakegate::reaper::IdleReaper;
use wakegate::registry::RouteRegistry;
use wakegate::route::Route;
use wakegate::stats::ProxyStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let cancel = CancellationToken::new();
    let fallback_namespace = kube::detect_namespace();
    let routes = config.routes(&fallback_namespace);

    // Demo workloads are kept so reloads can seed new routes
    let (control_plane, demo): (SharedControlPlane, Option<Arc<InMemoryControlPlane>>) =
        match config.control_plane.kind {
            ControlPlaneKind::Kubernetes => {
                let client = KubeClient::from_config(&config.control_plane)?;
                info!(api_url = client.api_url(), "Using Kubernetes control plane");
                (Arc::new(client) as SharedControlPlane, None)
            }
            ControlPlaneKind::Memory => {
                warn!("Using in-memory control plane (demo mode, no cluster changes)");
                let demo = Arc::new(InMemoryControlPlane::instant_ready());
                seed_demo_workloads(&demo, &routes);
                (demo.clone() as SharedControlPlane, Some(demo))
            }
        };

    let registry = Arc::new(RouteRegistry::with_routes(routes));
    info!(routes = registry.len(), namespace = %fallback_namespace, "Routes loaded");

    let stats = Arc::new(ProxyStats::new());

    // Spawn idle reaper
    let reaper = Arc::new(
        IdleReaper::new(
            Arc::clone(&registry),
            Arc::clone(&control_plane),
            config.reaper.interval(),
        )
        .with_span(tracing::info_span!("reaper")),
    );
    let reaper_task = {
        let reaper = Arc::clone(&reaper);
        let cancel = cancel.clone();
        tokio::spawn(async move { reaper.run(cancel).await })
    };

    // Spawn proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let proxy = ProxyServer::new(
        proxy_addr,
        Arc::clone(&registry),
        Arc::clone(&control_plane),
        ProxySettings::from_config(&config.server),
        cancel.clone(),
    )
    .with_pool_config(pool_config)
    .with_stats(Arc::clone(&stats));

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server binds to localhost only
    let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        warn!(token = %token, "No admin_token configured, generated a random token");
        token
    });

    let admin = AdminServer::new(
        admin_addr,
        Arc::clone(&registry),
        Arc::clone(&control_plane),
        Arc::clone(&reaper),
        cancel.clone(),
        admin_token,
    )
    .with_stats(Arc::clone(&stats));

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or route reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading routes...");
                    reload_routes(&config_path, &registry, &fallback_namespace, demo.as_deref());
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    cancel.cancel();

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        let _ = reaper_task.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Re-read the route table. Server settings are not reloaded, and a file
/// that fails to load leaves the current routes in place.
fn reload_routes(
    path: &Path,
    registry: &RouteRegistry,
    fallback_namespace: &str,
    demo: Option<&InMemoryControlPlane>,
) {
    match Config::load(path) {
        Ok(config) => {
            let routes = config.routes(fallback_namespace);
            if let Some(demo) = demo {
                seed_demo_workloads(demo, &routes);
            }
            let result = registry.apply(routes);
            if !result.added.is_empty() {
                info!(routes = ?result.added, "New routes available");
            }
            if !result.removed.is_empty() {
                info!(routes = ?result.removed, "Routes removed");
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to reload configuration, keeping current routes");
        }
    }
}

/// Register every workload the routes mention, asleep, unless already known
fn seed_demo_workloads(demo: &InMemoryControlPlane, routes: &[Route]) {
    for route in routes {
        for name in route.workloads() {
            if demo.workload(&route.namespace, name).is_none() {
                demo.set_workload(&route.namespace, name, 0, 0);
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        status_path = %config.server.status_path,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        cluster_domain = %config.server.cluster_domain,
        upstream_override = ?config.server.upstream_override,
        request_timeout_secs = config.server.request_timeout_secs,
        "Request handling settings"
    );
    info!(
        reaper_interval_secs = config.reaper.interval_secs,
        idle_timeout_secs = config.defaults.idle_timeout_secs,
        "Scale-to-zero settings"
    );
    info!(
        kind = ?config.control_plane.kind,
        routes = config.routes.len(),
        "Control plane configuration"
    );
}
