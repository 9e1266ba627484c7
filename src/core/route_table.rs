//! Hot-reloadable keyed store of routes.
//!
//! Readers take a lock-free snapshot (`ArcSwap::load`); every write operation
//! (upsert, remove, reload) serializes through one async mutex and publishes
//! a freshly built map in a single atomic store, so a concurrent reader sees
//! either the pre- or post-write table, never a partial one.
use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use crate::{
    core::{
        error::{GatewayError, GatewayResult},
        route::{Route, RouteView},
    },
    ports::config_provider::ConfigProvider,
};

type RouteMap = HashMap<String, Arc<Route>>;

/// Concurrent route table keyed by `route_id`.
pub struct RouteTable {
    routes: ArcSwap<RouteMap>,
    write_lock: Mutex<()>,
    provider: Arc<dyn ConfigProvider>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable").finish_non_exhaustive()
    }
}

impl RouteTable {
    /// Build a table from an initial route set. Duplicate route ids are a
    /// conflict: the configuration must not declare the same route twice.
    pub fn new(provider: Arc<dyn ConfigProvider>, initial: Vec<Route>) -> GatewayResult<Self> {
        let map = Self::index(initial)?;
        Ok(Self {
            routes: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
            provider,
        })
    }

    fn index(routes: Vec<Route>) -> GatewayResult<RouteMap> {
        let mut map = RouteMap::with_capacity(routes.len());
        for route in routes {
            let id = route.route_id().to_string();
            if map.insert(id.clone(), Arc::new(route)).is_some() {
                return Err(GatewayError::conflict(
                    "RouteTable.DuplicateId",
                    format!("route id '{id}' declared more than once"),
                ));
            }
        }
        Ok(map)
    }

    /// Snapshot of all routes ordered by ascending priority (route id breaks
    /// ties for determinism). Reflects only completed mutations.
    pub fn get_all(&self) -> Vec<Arc<Route>> {
        let snapshot = self.routes.load();
        let mut routes: Vec<Arc<Route>> = snapshot.values().cloned().collect();
        routes.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.route_id().cmp(b.route_id()))
        });
        routes
    }

    /// Single route lookup by id.
    pub fn get(&self, route_id: &str) -> GatewayResult<Arc<Route>> {
        self.routes.load().get(route_id).cloned().ok_or_else(|| {
            GatewayError::not_found(
                "RouteTable.NotFound",
                format!("no route with id '{route_id}'"),
            )
            .with_metadata("route_id", route_id)
        })
    }

    /// Insert or replace a route by id.
    pub async fn upsert(&self, route: Route) -> GatewayResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map: RouteMap = (**self.routes.load()).clone();
        let id = route.route_id().to_string();
        let replaced = map.insert(id.clone(), Arc::new(route)).is_some();
        self.routes.store(Arc::new(map));
        tracing::info!(route_id = %id, replaced, "route upserted");
        Ok(())
    }

    /// Remove a route by id; not-found when absent.
    pub async fn remove(&self, route_id: &str) -> GatewayResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map: RouteMap = (**self.routes.load()).clone();
        if map.remove(route_id).is_none() {
            return Err(GatewayError::not_found(
                "RouteTable.NotFound",
                format!("no route with id '{route_id}'"),
            )
            .with_metadata("route_id", route_id));
        }
        self.routes.store(Arc::new(map));
        tracing::info!(route_id, "route removed");
        Ok(())
    }

    /// Re-read the external configuration source and swap the whole table
    /// atomically. A load or validation failure leaves the current table
    /// untouched.
    pub async fn reload(&self) -> GatewayResult<usize> {
        let _guard = self.write_lock.lock().await;
        let config = self.provider.load_config().await.map_err(|e| {
            GatewayError::failure(
                "RouteTable.ReloadFailed",
                format!("failed to load configuration: {e}"),
            )
        })?;
        let routes = config.build_routes()?;
        let map = Self::index(routes)?;
        let count = map.len();
        self.routes.store(Arc::new(map));
        tracing::info!(routes = count, "route table reloaded");
        Ok(count)
    }

    /// Data-plane lookup: among routes whose prefix matches the path, the
    /// lowest priority wins; the longest prefix breaks priority ties.
    pub fn match_route(&self, path: &str) -> Option<Arc<Route>> {
        let snapshot = self.routes.load();
        snapshot
            .values()
            .filter(|route| route.matches(path))
            .min_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then_with(|| b.route_prefix().len().cmp(&a.route_prefix().len()))
                    .then_with(|| a.route_id().cmp(b.route_id()))
            })
            .cloned()
    }

    /// All distinct destination URLs across the table, sorted. The health
    /// monitor probes this set each cycle.
    pub fn destinations(&self) -> Vec<String> {
        let snapshot = self.routes.load();
        let mut destinations: Vec<String> = snapshot
            .values()
            .flat_map(|route| route.destinations().iter().cloned())
            .collect();
        destinations.sort();
        destinations.dedup();
        destinations
    }

    /// Admin-facing route views, ordered like [`RouteTable::get_all`].
    pub fn route_views(&self) -> Vec<RouteView> {
        self.get_all().iter().map(|route| route.view()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.load().is_empty()
    }
}
