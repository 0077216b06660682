//! Periodic scale-to-zero of idle routes

use crate::control_plane::SharedControlPlane;
use crate::registry::RouteRegistry;
use crate::route::Route;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

/// Outcome of one idle scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Routes found idle past their timeout
    pub idle_routes: usize,
    /// Successful scale-to-zero calls
    pub scaled_down: usize,
    /// Failed status queries and scale calls
    pub errors: usize,
}

/// Outcome of a manual stop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

/// Scales routes that have seen no traffic for their idle timeout to zero,
/// together with their `stop_on_idle` dependencies
pub struct IdleReaper {
    registry: Arc<RouteRegistry>,
    control_plane: SharedControlPlane,
    interval: Duration,
    span: Span,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<RouteRegistry>,
        control_plane: SharedControlPlane,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            control_plane,
            interval,
            span: tracing::info_span!("reaper"),
        }
    }

    /// Use the given span for everything this reaper logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run one scan against the current time
    pub async fn tick(&self) -> ReapSummary {
        self.scan_at(Utc::now()).await
    }

    /// Scan a snapshot of the registry, treating `now` as the current time
    pub async fn scan_at(&self, now: DateTime<Utc>) -> ReapSummary {
        let mut summary = ReapSummary::default();

        async {
            for route in self.registry.list() {
                if !route.is_idle_at(now) {
                    continue;
                }

                let idle_secs = now.signed_duration_since(route.last_activity).num_seconds();
                info!(route = %route.id, idle_secs, "Route idle timeout reached");
                summary.idle_routes += 1;

                self.reap_deployment(&route, &mut summary).await;
                self.reap_dependencies(&route, &mut summary).await;
            }

            if summary.idle_routes > 0 {
                debug!(
                    idle_routes = summary.idle_routes,
                    scaled_down = summary.scaled_down,
                    errors = summary.errors,
                    "Idle scan complete"
                );
            }
        }
        .instrument(self.span.clone())
        .await;

        summary
    }

    async fn reap_deployment(&self, route: &Route, summary: &mut ReapSummary) {
        let status = match self
            .control_plane
            .get_status(&route.namespace, &route.deployment)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(route = %route.id, namespace = %route.namespace, workload = %route.deployment, error = %e, "Failed to query idle workload");
                summary.errors += 1;
                return;
            }
        };

        if status.desired_replicas <= 0 {
            return;
        }

        if self.scale_down(route, &route.deployment).await {
            summary.scaled_down += 1;
        } else {
            summary.errors += 1;
        }
    }

    async fn reap_dependencies(&self, route: &Route, summary: &mut ReapSummary) {
        for dep in route.dependencies.iter().filter(|d| d.stop_on_idle) {
            if self.scale_down(route, &dep.name).await {
                summary.scaled_down += 1;
            } else {
                summary.errors += 1;
            }
        }
    }

    async fn scale_down(&self, route: &Route, name: &str) -> bool {
        match self.control_plane.scale(&route.namespace, name, 0).await {
            Ok(()) => {
                info!(route = %route.id, namespace = %route.namespace, workload = name, "Scaled workload to zero");
                true
            }
            Err(e) => {
                warn!(route = %route.id, namespace = %route.namespace, workload = name, error = %e, "Failed to scale workload to zero");
                false
            }
        }
    }

    /// Scale a route's deployment and its `stop_on_idle` dependencies to zero
    /// regardless of activity
    pub async fn stop_route(&self, route: &Route) -> StopReport {
        let mut report = StopReport::default();

        async {
            info!(route = %route.id, "Stopping route");
            let names = std::iter::once(route.deployment.as_str()).chain(
                route
                    .dependencies
                    .iter()
                    .filter(|d| d.stop_on_idle)
                    .map(|d| d.name.as_str()),
            );
            for name in names {
                if self.scale_down(route, name).await {
                    report.stopped.push(name.to_string());
                } else {
                    report.failed.push(name.to_string());
                }
            }
        }
        .instrument(self.span.clone())
        .await;

        report
    }

    /// Scan every `interval` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Idle reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = cancel.cancelled() => {
                    info!("Idle reaper stopped");
                    break;
                }
            }
        }
    }
}
