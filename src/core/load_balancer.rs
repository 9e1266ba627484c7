//! Destination selection with live connection accounting.
//!
//! The balancer filters a route's destinations down to the ones whose health
//! flag is up, applies the route's strategy to that candidate set, and bumps
//! the chosen destination's active-connection gauge. Callers own the
//! obligation to report completion exactly once per successful selection.
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use rand::Rng;

use crate::core::{
    error::{GatewayError, GatewayResult},
    health::HealthRegistry,
    route::{LoadBalancingStrategy, Route},
};

/// Active-request gauge for one destination. Never negative: a decrement
/// racing past zero clamps instead of wrapping.
#[derive(Debug, Default)]
pub struct ConnectionCounter(AtomicU64);

impl ConnectionCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// CAS loop via `fetch_update`; `checked_sub` refuses to go below zero.
    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Health-aware destination selector. Per-route round-robin counters and
/// per-destination connection gauges are created on first use and never
/// removed during the process lifetime.
pub struct LoadBalancer {
    registry: Arc<HealthRegistry>,
    round_robin: scc::HashMap<String, Arc<AtomicUsize>>,
    connections: scc::HashMap<String, Arc<ConnectionCounter>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self {
            registry,
            round_robin: scc::HashMap::new(),
            connections: scc::HashMap::new(),
        }
    }

    /// Select a destination for the route and increment its gauge. Falls
    /// back to the full destination list when every destination is flagged
    /// unhealthy, so a blown-up set is still attempted rather than refusing
    /// all traffic.
    pub fn select(&self, route: &Route) -> GatewayResult<String> {
        self.select_with(route, route.policy().load_balancing)
    }

    /// Select the first (healthy-preferred) destination without applying a
    /// rotation strategy. Used when load balancing is globally disabled.
    pub fn select_first(&self, route: &Route) -> GatewayResult<String> {
        let candidates = self.candidates(route)?;
        let destination = candidates[0].clone();
        self.connection_gauge(&destination).increment();
        Ok(destination)
    }

    fn select_with(&self, route: &Route, strategy: LoadBalancingStrategy) -> GatewayResult<String> {
        let candidates = self.candidates(route)?;

        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin_index(route, candidates.len()),
            LoadBalancingStrategy::WeightedRoundRobin => {
                tracing::warn!(
                    route_id = route.route_id(),
                    "weighted_round_robin is not implemented, falling back to round_robin"
                );
                self.round_robin_index(route, candidates.len())
            }
            LoadBalancingStrategy::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalancingStrategy::LeastConnections => self.least_connections_index(&candidates),
            LoadBalancingStrategy::PowerOfTwoChoices => self.power_of_two_index(&candidates),
        };

        let destination = candidates[index].clone();
        self.connection_gauge(&destination).increment();
        Ok(destination)
    }

    /// Report that a request selected earlier has finished, on success and
    /// error paths alike.
    pub fn record_completion(&self, destination: &str) {
        self.connection_gauge(destination).decrement();
    }

    /// Current active-connection gauge for a destination.
    pub fn active_connections(&self, destination: &str) -> u64 {
        self.connections
            .read_sync(destination, |_, counter| counter.get())
            .unwrap_or(0)
    }

    fn candidates(&self, route: &Route) -> GatewayResult<Vec<String>> {
        let all = route.destinations();
        if all.is_empty() {
            return Err(GatewayError::not_found(
                "LoadBalancer.NoDestinations",
                format!("route '{}' has no destinations", route.route_id()),
            )
            .with_metadata("route_id", route.route_id()));
        }

        let healthy: Vec<String> = all
            .iter()
            .filter(|d| self.registry.is_flagged_healthy(d))
            .cloned()
            .collect();

        if healthy.is_empty() {
            Ok(all.to_vec())
        } else {
            Ok(healthy)
        }
    }

    fn round_robin_index(&self, route: &Route, len: usize) -> usize {
        let counter = self.counter_for(route.route_id());
        // The counter advances even when a reload shrinks the candidate set;
        // the modulo keeps the index in range for the list observed here.
        counter.fetch_add(1, Ordering::Relaxed) % len
    }

    fn least_connections_index(&self, candidates: &[String]) -> usize {
        let mut best = 0;
        let mut best_count = u64::MAX;
        for (i, destination) in candidates.iter().enumerate() {
            let count = self.active_connections(destination);
            // Strict less-than: the first occurrence wins ties.
            if count < best_count {
                best_count = count;
                best = i;
            }
        }
        best
    }

    fn power_of_two_index(&self, candidates: &[String]) -> usize {
        let mut rng = rand::rng();
        let first = rng.random_range(0..candidates.len());
        let second = rng.random_range(0..candidates.len());
        // Ties go to the first pick.
        if self.active_connections(&candidates[second])
            < self.active_connections(&candidates[first])
        {
            second
        } else {
            first
        }
    }

    fn counter_for(&self, route_id: &str) -> Arc<AtomicUsize> {
        if let Some(counter) = self.round_robin.read_sync(route_id, |_, c| c.clone()) {
            return counter;
        }
        let fresh = Arc::new(AtomicUsize::new(0));
        match self.round_robin.insert_sync(route_id.to_string(), fresh.clone()) {
            Ok(()) => fresh,
            Err(_) => self
                .round_robin
                .read_sync(route_id, |_, c| c.clone())
                .unwrap_or(fresh),
        }
    }

    fn connection_gauge(&self, destination: &str) -> Arc<ConnectionCounter> {
        if let Some(gauge) = self.connections.read_sync(destination, |_, g| g.clone()) {
            return gauge;
        }
        let fresh = Arc::new(ConnectionCounter::new());
        match self
            .connections
            .insert_sync(destination.to_string(), fresh.clone())
        {
            Ok(()) => fresh,
            Err(_) => self
                .connections
                .read_sync(destination, |_, g| g.clone())
                .unwrap_or(fresh),
        }
    }
}
