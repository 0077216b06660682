//! Integration tests for the scale-to-zero lifecycle
//!
//! Drives the registry, matcher, readiness orchestrator and idle reaper
//! together against the in-memory control plane.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use wakegate::control_plane::InMemoryControlPlane;
use wakegate::matcher::RouteMatcher;
use wakegate::readiness::{Readiness, ReadinessOrchestrator, ReadinessReport};
use wakegate::reaper::IdleReaper;
use wakegate::registry::RouteRegistry;
use wakegate::route::Route;

struct Fixture {
    registry: Arc<RouteRegistry>,
    control_plane: Arc<InMemoryControlPlane>,
    matcher: RouteMatcher,
    readiness: ReadinessOrchestrator,
    reaper: IdleReaper,
}

fn fixture(routes: Vec<Route>, control_plane: InMemoryControlPlane) -> Fixture {
    let registry = Arc::new(RouteRegistry::with_routes(routes));
    let control_plane = Arc::new(control_plane);
    Fixture {
        matcher: RouteMatcher::new(Arc::clone(&registry)),
        readiness: ReadinessOrchestrator::new(control_plane.clone()),
        reaper: IdleReaper::new(
            Arc::clone(&registry),
            control_plane.clone(),
            Duration::from_secs(30),
        ),
        registry,
        control_plane,
    }
}

fn shop_route() -> Route {
    Route::new("shop", "shop.example.com", "/", "shop-web")
        .with_dependency("shop-db", true)
        .with_dependency("shared-cache", false)
        .with_idle_timeout(Duration::from_secs(600))
}

fn status_of(report: &ReadinessReport, name: &str) -> Option<Readiness> {
    report
        .details
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.status)
}

/// Let spawned wake-ups reach the control plane
async fn settle() {
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// ============================================================================
// Wake-up Tests
// ============================================================================

mod wake_tests {
    use super::*;

    #[tokio::test]
    async fn test_cold_request_wakes_then_becomes_ready() {
        let f = fixture(vec![shop_route()], InMemoryControlPlane::instant_ready());
        f.control_plane.set_workload("default", "shop-web", 0, 0);
        f.control_plane.set_workload("default", "shop-db", 0, 0);
        f.control_plane.set_workload("default", "shared-cache", 1, 1);

        let route = f
            .matcher
            .route_request("shop.example.com:8080", "/checkout")
            .unwrap();
        let report = f.readiness.check(&route).await;

        assert!(!report.all_ready);
        assert_eq!(status_of(&report, "shop-web"), Some(Readiness::Sleep));
        assert_eq!(status_of(&report, "shop-db"), Some(Readiness::Sleep));
        assert_eq!(status_of(&report, "shared-cache"), Some(Readiness::Ready));

        settle().await;
        assert_eq!(f.control_plane.scale_calls().len(), 2);

        let report = f.readiness.check(&route).await;
        assert!(report.all_ready);
        assert_eq!(report.to_poll_json()["status"], "ready");
    }

    #[tokio::test]
    async fn test_repeated_checks_while_scaling_do_not_rescale() {
        let f = fixture(vec![shop_route()], InMemoryControlPlane::new());
        f.control_plane.set_workload("default", "shop-web", 0, 0);
        f.control_plane.set_workload("default", "shop-db", 1, 1);
        f.control_plane.set_workload("default", "shared-cache", 1, 1);
        let route = f.registry.get("shop").unwrap();

        f.readiness.check(&route).await;
        settle().await;

        // The wake request raised desired replicas; nothing is ready yet
        for _ in 0..3 {
            let report = f.readiness.check(&route).await;
            assert_eq!(status_of(&report, "shop-web"), Some(Readiness::Scaling));
        }
        settle().await;

        assert_eq!(f.control_plane.scale_calls_for("shop-web").len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_workload_blocks_readiness() {
        let f = fixture(vec![shop_route()], InMemoryControlPlane::new());
        f.control_plane.set_workload("default", "shop-web", 1, 1);
        f.control_plane.set_workload("default", "shop-db", 1, 1);
        f.control_plane.set_workload("default", "shared-cache", 1, 1);
        f.control_plane.fail_workload("default", "shared-cache");
        let route = f.registry.get("shop").unwrap();

        let report = f.readiness.check(&route).await;

        assert!(!report.all_ready);
        assert_eq!(status_of(&report, "shared-cache"), Some(Readiness::Error));
        assert_eq!(report.to_poll_json()["status"], "waiting");
    }

    #[tokio::test]
    async fn test_matching_a_route_records_activity() {
        let past = Utc::now() - ChronoDuration::hours(2);
        let f = fixture(
            vec![shop_route().with_last_activity(past)],
            InMemoryControlPlane::new(),
        );

        assert!(f.matcher.find("shop.example.com", "/").is_some());
        assert_eq!(f.registry.get("shop").unwrap().last_activity, past);

        assert!(f.matcher.route_request("SHOP.example.com", "/").is_some());
        assert!(f.registry.get("shop").unwrap().last_activity > past);
    }
}

// ============================================================================
// Idle Reaping Tests
// ============================================================================

mod reap_tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_route_is_scaled_down_with_owned_dependencies() {
        let past = Utc::now() - ChronoDuration::minutes(11);
        let f = fixture(
            vec![shop_route().with_last_activity(past)],
            InMemoryControlPlane::new(),
        );
        f.control_plane.set_workload("default", "shop-web", 2, 2);
        f.control_plane.set_workload("default", "shop-db", 1, 1);
        f.control_plane.set_workload("default", "shared-cache", 1, 1);

        let summary = f.reaper.tick().await;

        assert_eq!(summary.idle_routes, 1);
        assert_eq!(summary.scaled_down, 2);
        assert_eq!(summary.errors, 0);
        assert_eq!(f.control_plane.workload("default", "shop-web").unwrap().desired_replicas, 0);
        assert_eq!(f.control_plane.workload("default", "shop-db").unwrap().desired_replicas, 0);
        assert_eq!(f.control_plane.workload("default", "shared-cache").unwrap().desired_replicas, 1);
    }

    #[tokio::test]
    async fn test_recent_activity_keeps_route_running() {
        let f = fixture(vec![shop_route()], InMemoryControlPlane::new());
        f.control_plane.set_workload("default", "shop-web", 1, 1);

        let later = Utc::now() + ChronoDuration::minutes(9);
        let summary = f.reaper.scan_at(later).await;

        assert_eq!(summary.idle_routes, 0);
        assert!(f.control_plane.scale_calls().is_empty());
    }

    #[tokio::test]
    async fn test_request_after_idle_period_resets_clock() {
        let past = Utc::now() - ChronoDuration::minutes(30);
        let f = fixture(
            vec![shop_route().with_last_activity(past)],
            InMemoryControlPlane::new(),
        );
        f.control_plane.set_workload("default", "shop-web", 1, 1);

        f.matcher.route_request("shop.example.com", "/").unwrap();
        let summary = f.reaper.tick().await;

        assert_eq!(summary.idle_routes, 0);
        assert!(f.control_plane.scale_calls().is_empty());
    }

    #[tokio::test]
    async fn test_sleeping_deployment_is_not_rescaled() {
        let past = Utc::now() - ChronoDuration::hours(1);
        let route = Route::new("docs", "docs.example.com", "/", "docs")
            .with_idle_timeout(Duration::from_secs(60))
            .with_last_activity(past);
        let f = fixture(vec![route], InMemoryControlPlane::new());
        f.control_plane.set_workload("default", "docs", 0, 0);

        let summary = f.reaper.tick().await;

        assert_eq!(summary.idle_routes, 1);
        assert_eq!(summary.scaled_down, 0);
        assert!(f.control_plane.scale_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_still_stops_dependencies_and_other_routes() {
        let past = Utc::now() - ChronoDuration::hours(1);
        let broken = shop_route().with_last_activity(past);
        let other = Route::new("blog", "blog.example.com", "/", "blog")
            .with_idle_timeout(Duration::from_secs(60))
            .with_last_activity(past);
        let f = fixture(vec![broken, other], InMemoryControlPlane::new());
        f.control_plane.fail_workload("default", "shop-web");
        f.control_plane.set_workload("default", "shop-db", 1, 1);
        f.control_plane.set_workload("default", "blog", 1, 1);

        let summary = f.reaper.tick().await;

        assert_eq!(summary.idle_routes, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.scaled_down, 2);
        assert_eq!(f.control_plane.workload("default", "shop-db").unwrap().desired_replicas, 0);
        assert_eq!(f.control_plane.workload("default", "blog").unwrap().desired_replicas, 0);
    }

    #[tokio::test]
    async fn test_reaped_route_wakes_on_next_request() {
        let past = Utc::now() - ChronoDuration::hours(1);
        let f = fixture(
            vec![shop_route().with_last_activity(past)],
            InMemoryControlPlane::instant_ready(),
        );
        f.control_plane.set_workload("default", "shop-web", 1, 1);
        f.control_plane.set_workload("default", "shop-db", 1, 1);
        f.control_plane.set_workload("default", "shared-cache", 1, 1);

        f.reaper.tick().await;
        let route = f.matcher.route_request("shop.example.com", "/").unwrap();
        let report = f.readiness.check(&route).await;
        assert!(!report.all_ready);

        settle().await;
        assert!(f.readiness.check(&route).await.all_ready);
    }
}

// ============================================================================
// Reload Tests
// ============================================================================

mod reload_tests {
    use super::*;

    #[tokio::test]
    async fn test_reload_keeps_activity_of_surviving_routes() {
        let past = Utc::now() - ChronoDuration::hours(1);
        let f = fixture(
            vec![shop_route().with_last_activity(past)],
            InMemoryControlPlane::new(),
        );
        f.control_plane.set_workload("default", "shop-web", 1, 1);
        f.control_plane.set_workload("default", "shop-db", 1, 1);

        let result = f.registry.apply(vec![
            shop_route(),
            Route::new("blog", "blog.example.com", "/", "blog"),
        ]);

        assert_eq!(result.added, vec!["blog".to_string()]);
        assert_eq!(result.updated, vec!["shop".to_string()]);
        assert_eq!(f.registry.get("shop").unwrap().last_activity, past);

        // Still idle after the reload, so the reaper acts on it
        let summary = f.reaper.tick().await;
        assert_eq!(summary.idle_routes, 1);
    }

    #[tokio::test]
    async fn test_removed_route_stops_matching() {
        let f = fixture(vec![shop_route()], InMemoryControlPlane::new());

        let result = f.registry.apply(Vec::new());

        assert_eq!(result.removed, vec!["shop".to_string()]);
        assert!(f.matcher.route_request("shop.example.com", "/").is_none());
    }
}
