//! Request counters for the proxy

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-route request counters
#[derive(Debug, Default)]
pub struct RouteCounters {
    /// Requests forwarded upstream
    pub forwarded: AtomicU64,
    /// Requests answered with the waiting page
    pub waiting: AtomicU64,
    /// Upstream connection failures and timeouts
    pub upstream_errors: AtomicU64,
}

/// Statistics shared by the proxy and admin servers
#[derive(Debug, Default)]
pub struct ProxyStats {
    total_forwarded: AtomicU64,
    unmatched: AtomicU64,
    routes: DashMap<String, RouteCounters>,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_forwarded(&self, route_id: &str) {
        self.total_forwarded.fetch_add(1, Ordering::Relaxed);
        self.routes
            .entry(route_id.to_string())
            .or_default()
            .forwarded
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_waiting(&self, route_id: &str) {
        self.routes
            .entry(route_id.to_string())
            .or_default()
            .waiting
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self, route_id: &str) {
        self.routes
            .entry(route_id.to_string())
            .or_default()
            .upstream_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_forwarded(&self) -> u64 {
        self.total_forwarded.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let routes = self
            .routes
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    RouteStatsSnapshot {
                        forwarded: c.forwarded.load(Ordering::Relaxed),
                        waiting: c.waiting.load(Ordering::Relaxed),
                        upstream_errors: c.upstream_errors.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        StatsSnapshot {
            total_forwarded: self.total_forwarded(),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            routes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteStatsSnapshot {
    pub forwarded: u64,
    pub waiting: u64,
    pub upstream_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_forwarded: u64,
    pub unmatched: u64,
    pub routes: BTreeMap<String, RouteStatsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ProxyStats::new();
        assert_eq!(stats.total_forwarded(), 0);

        stats.record_forwarded("shop");
        stats.record_forwarded("shop");
        stats.record_forwarded("blog");
        stats.record_waiting("shop");
        stats.record_upstream_error("blog");
        stats.record_unmatched();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_forwarded, 3);
        assert_eq!(snapshot.unmatched, 1);
        assert_eq!(
            snapshot.routes["shop"],
            RouteStatsSnapshot {
                forwarded: 2,
                waiting: 1,
                upstream_errors: 0
            }
        );
        assert_eq!(snapshot.routes["blog"].upstream_errors, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ProxyStats::new();
        stats.record_forwarded("shop");

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total_forwarded"], 1);
        assert_eq!(json["routes"]["shop"]["forwarded"], 1);
    }
}
