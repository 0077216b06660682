//! Dependency-aware readiness checks with on-demand wake-up

use crate::control_plane::{SharedControlPlane, WorkloadStatus};
use crate::route::Route;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument, Span};

/// Readiness of a single workload in a route's check list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Readiness {
    /// Every desired replica is ready
    Ready,
    /// Replicas are requested but not all are ready yet
    Scaling,
    /// Scaled to zero
    Sleep,
    /// The control plane could not be queried
    Error,
    /// The workload could not be evaluated
    Unknown,
}

impl Readiness {
    fn classify(status: WorkloadStatus) -> Self {
        if status.desired_replicas <= 0 {
            Readiness::Sleep
        } else if status.ready_replicas < status.desired_replicas {
            Readiness::Scaling
        } else {
            Readiness::Ready
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Readiness::Ready => "Ready",
            Readiness::Scaling => "Scaling",
            Readiness::Sleep => "Sleep",
            Readiness::Error => "Error",
            Readiness::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a readiness report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadReadiness {
    pub name: String,
    pub status: Readiness,
}

/// Aggregate readiness of a route's deployment and dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    /// True only when every entry is [`Readiness::Ready`]
    pub all_ready: bool,
    /// Deployment first, then dependencies in declared order
    pub details: Vec<WorkloadReadiness>,
}

impl ReadinessReport {
    /// Body of the status poll endpoint
    pub fn to_poll_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.all_ready { "ready" } else { "waiting" },
            "details": self.details,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakePolicy {
    Wake,
    Observe,
}

/// Decides whether a matched route may receive traffic, waking anything
/// that is asleep along the way.
///
/// Entries are evaluated one after another, but a sleeping dependency does
/// not hold back the wake-up of the entries after it.
pub struct ReadinessOrchestrator {
    control_plane: SharedControlPlane,
    span: Span,
}

impl ReadinessOrchestrator {
    pub fn new(control_plane: SharedControlPlane) -> Self {
        Self {
            control_plane,
            span: tracing::info_span!("readiness"),
        }
    }

    /// Use the given span for everything this orchestrator logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Check every workload of the route and issue a wake-up for each one
    /// that is scaled to zero. Wake-ups are not awaited.
    pub async fn check(&self, route: &Route) -> ReadinessReport {
        self.evaluate(route, WakePolicy::Wake)
            .instrument(self.span.clone())
            .await
    }

    /// Classify every workload of the route without changing anything
    pub async fn observe(&self, route: &Route) -> ReadinessReport {
        self.evaluate(route, WakePolicy::Observe)
            .instrument(self.span.clone())
            .await
    }

    async fn evaluate(&self, route: &Route, policy: WakePolicy) -> ReadinessReport {
        let mut details = Vec::with_capacity(route.dependencies.len() + 1);

        for name in route.workloads() {
            let status = if name.is_empty() {
                Readiness::Unknown
            } else {
                match self.control_plane.get_status(&route.namespace, name).await {
                    Ok(status) => Readiness::classify(status),
                    Err(e) => {
                        warn!(route = %route.id, namespace = %route.namespace, workload = name, error = %e, "Failed to query workload status");
                        Readiness::Error
                    }
                }
            };

            match status {
                Readiness::Sleep if policy == WakePolicy::Wake => {
                    info!(route = %route.id, namespace = %route.namespace, workload = name, "Workload is sleeping, waking up");
                    self.wake(&route.namespace, name);
                }
                Readiness::Scaling => {
                    debug!(route = %route.id, workload = name, "Workload is scaling up");
                }
                _ => {}
            }

            details.push(WorkloadReadiness {
                name: name.to_string(),
                status,
            });
        }

        let all_ready = details.iter().all(|d| d.status == Readiness::Ready);
        ReadinessReport { all_ready, details }
    }

    fn wake(&self, namespace: &str, name: &str) {
        let control_plane = Arc::clone(&self.control_plane);
        let namespace = namespace.to_string();
        let name = name.to_string();

        tokio::spawn(
            async move {
                if let Err(e) = control_plane.scale(&namespace, &name, 1).await {
                    warn!(namespace, workload = name, error = %e, "Failed to wake workload");
                }
            }
            .instrument(self.span.clone()),
        );
    }
}
