//! In-memory route table shared by request handling and the idle reaper

use crate::route::Route;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

/// Thread-safe registry owning every route definition, keyed by id.
///
/// Readers always receive clones, so a long scan over a snapshot is never
/// affected by concurrent activity updates.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, Route>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a bulk load of routes
    pub fn with_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let registry = Self::new();
        registry.load(routes);
        registry
    }

    /// Snapshot of every route, ordered by id
    pub fn list(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        routes
    }

    pub fn get(&self, id: &str) -> Option<Route> {
        self.routes.read().get(id).cloned()
    }

    /// Record activity on a route. Unknown ids are ignored and the clock
    /// never moves backwards.
    pub fn update_activity(&self, id: &str) {
        let now = Utc::now();
        if let Some(route) = self.routes.write().get_mut(id) {
            if now > route.last_activity {
                route.last_activity = now;
            }
        }
    }

    /// Insert or replace a single route
    pub fn insert(&self, route: Route) {
        self.routes.write().insert(route.id.clone(), route);
    }

    pub fn remove(&self, id: &str) -> Option<Route> {
        self.routes.write().remove(id)
    }

    /// Replace the whole table. Every loaded route starts its activity
    /// clock now.
    pub fn load(&self, routes: impl IntoIterator<Item = Route>) {
        let now = Utc::now();
        let table = routes
            .into_iter()
            .map(|mut route| {
                route.last_activity = now;
                (route.id.clone(), route)
            })
            .collect();
        *self.routes.write() = table;
    }

    /// Apply a reloaded route set. Routes that survive the reload keep their
    /// activity clock; new routes start it now.
    pub fn apply(&self, routes: impl IntoIterator<Item = Route>) -> ReloadResult {
        let now = Utc::now();
        let mut result = ReloadResult::default();
        let mut table = self.routes.write();

        let mut next = HashMap::new();
        for mut route in routes {
            match table.get(&route.id) {
                Some(existing) => {
                    route.last_activity = existing.last_activity;
                    result.updated.push(route.id.clone());
                }
                None => {
                    route.last_activity = now;
                    result.added.push(route.id.clone());
                }
            }
            next.insert(route.id.clone(), route);
        }

        result.removed = table
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        result.added.sort();
        result.removed.sort();
        result.updated.sort();
        *table = next;

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "Route table reloaded"
        );

        result
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Result of applying a reloaded route set
#[derive(Debug, Clone, Default)]
pub struct ReloadResult {
    /// Routes that did not exist before
    pub added: Vec<String>,
    /// Routes that no longer exist
    pub removed: Vec<String>,
    /// Routes replaced in place (activity clock kept)
    pub updated: Vec<String>,
}
