//! Route and policy domain types.
//!
//! A [`Route`] maps an inbound path prefix onto an ordered list of upstream
//! destinations plus a [`Policy`] of per-route tuning knobs. Construction via
//! [`Route::new`] is the sole validation chokepoint: every component further
//! down (table lookup, selection, transforms) assumes a `Route` it receives
//! is valid and performs no revalidation.
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};

/// Selection strategy applied by the load balancer for one route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    /// Declared but not implemented; selection falls back to round-robin.
    WeightedRoundRobin,
    PowerOfTwoChoices,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancingStrategy::PowerOfTwoChoices => "power_of_two_choices",
        }
    }
}

/// Per-route tuning knobs. Owned by a [`Route`] after construction and never
/// shared between routes.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub load_balancing: LoadBalancingStrategy,
    pub enable_rate_limiting: bool,
    pub rate_limit_permits: u32,
    pub rate_limit_window_seconds: u64,
    pub enable_circuit_breaker: bool,
    pub enable_caching: bool,
    pub cache_duration_seconds: u64,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancingStrategy::RoundRobin,
            enable_rate_limiting: false,
            rate_limit_permits: 100,
            rate_limit_window_seconds: 60,
            enable_circuit_breaker: true,
            enable_caching: false,
            cache_duration_seconds: 0,
            timeout_seconds: 30,
            max_retries: 0,
        }
    }
}

impl Policy {
    fn validate(&self) -> GatewayResult<()> {
        if !(1..=300).contains(&self.timeout_seconds) {
            return Err(GatewayError::validation(
                "Policy.InvalidTimeout",
                format!(
                    "timeout_seconds must be within 1..=300, got {}",
                    self.timeout_seconds
                ),
            ));
        }
        if self.rate_limit_permits == 0 {
            return Err(GatewayError::validation(
                "Policy.InvalidRateLimit",
                "rate_limit_permits must be greater than 0",
            ));
        }
        if self.rate_limit_window_seconds == 0 {
            return Err(GatewayError::validation(
                "Policy.InvalidRateLimit",
                "rate_limit_window_seconds must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// A validated, immutable route. Identity (equality, hashing) is defined by
/// `(route_id, route_prefix)` only: two routes with the same identity but
/// different policies are the same route for indexing purposes.
#[derive(Debug, Clone)]
pub struct Route {
    route_id: String,
    route_prefix: String,
    destinations: Vec<String>,
    policy: Policy,
    priority: u32,
    requires_authentication: bool,
    allowed_roles: Option<Vec<String>>,
}

impl Route {
    /// Validating factory. Fails with a `Validation` error when the id or
    /// prefix is empty/whitespace, the prefix does not start with `/`, the
    /// destination list is empty, any destination is not an absolute
    /// http/https URL, or a policy knob is out of range.
    pub fn new(
        route_id: impl Into<String>,
        route_prefix: impl Into<String>,
        destinations: Vec<String>,
        policy: Policy,
        priority: u32,
        requires_authentication: bool,
        allowed_roles: Option<Vec<String>>,
    ) -> GatewayResult<Self> {
        let route_id = route_id.into();
        let route_prefix = route_prefix.into();

        if route_id.trim().is_empty() {
            return Err(GatewayError::validation(
                "Route.EmptyId",
                "route id must not be empty",
            ));
        }
        if route_prefix.trim().is_empty() {
            return Err(GatewayError::validation(
                "Route.EmptyPrefix",
                "route prefix must not be empty",
            ));
        }
        if !route_prefix.starts_with('/') {
            return Err(GatewayError::validation(
                "Route.InvalidPrefix",
                format!("route prefix must start with '/', got '{route_prefix}'"),
            )
            .with_metadata("route_id", route_id));
        }
        if destinations.is_empty() {
            return Err(GatewayError::validation(
                "Route.NoDestinations",
                "route must declare at least one destination",
            )
            .with_metadata("route_id", route_id));
        }
        for destination in &destinations {
            let parsed = Url::parse(destination).map_err(|e| {
                GatewayError::validation(
                    "Route.InvalidDestination",
                    format!("destination '{destination}' is not an absolute URL: {e}"),
                )
                .with_metadata("route_id", route_id.clone())
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(GatewayError::validation(
                    "Route.InvalidDestination",
                    format!("destination '{destination}' must use http or https"),
                )
                .with_metadata("route_id", route_id));
            }
        }
        policy.validate()?;

        Ok(Self {
            route_id,
            route_prefix,
            destinations,
            policy,
            priority,
            requires_authentication,
            allowed_roles,
        })
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn requires_authentication(&self) -> bool {
        self.requires_authentication
    }

    pub fn allowed_roles(&self) -> Option<&[String]> {
        self.allowed_roles.as_deref()
    }

    /// Whether this route's prefix matches the request path.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.route_prefix)
    }

    /// Admin-facing view of this route.
    pub fn view(&self) -> RouteView {
        RouteView {
            route_id: self.route_id.clone(),
            route_prefix: self.route_prefix.clone(),
            destinations: self.destinations.clone(),
            priority: self.priority,
            requires_authentication: self.requires_authentication,
            allowed_roles: self.allowed_roles.clone(),
            policy: PolicyView {
                load_balancing: self.policy.load_balancing.as_str().to_string(),
                enable_rate_limiting: self.policy.enable_rate_limiting,
                rate_limit_permits: self.policy.rate_limit_permits,
                enable_circuit_breaker: self.policy.enable_circuit_breaker,
                enable_caching: self.policy.enable_caching,
                timeout_seconds: self.policy.timeout_seconds,
            },
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.route_id == other.route_id && self.route_prefix == other.route_prefix
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.route_id.hash(state);
        self.route_prefix.hash(state);
    }
}

/// Serialized shape handed to the management surface, field for field.
#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    pub route_id: String,
    pub route_prefix: String,
    pub destinations: Vec<String>,
    pub priority: u32,
    pub requires_authentication: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    pub policy: PolicyView,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyView {
    pub load_balancing: String,
    pub enable_rate_limiting: bool,
    pub rate_limit_permits: u32,
    pub enable_circuit_breaker: bool,
    pub enable_caching: bool,
    pub timeout_seconds: u64,
}
