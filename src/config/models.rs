//! Configuration data structures for Portico.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! They are intentionally serde-friendly and carry defaults so that minimal
//! configs remain concise. Route definitions are plain data: they only
//! become [`Route`](crate::core::route::Route) values by passing the
//! validating factory.
use serde::{Deserialize, Serialize};

use crate::core::{
    error::GatewayResult,
    route::{LoadBalancingStrategy, Policy, Route},
};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_rate_limit_permits() -> u32 {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_queue_length() -> usize {
    10
}

fn default_break_duration() -> u64 {
    30
}

fn default_minimum_throughput() -> u64 {
    10
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

/// Top-level configuration file shape.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub gateway: GatewayOptions,
    #[serde(default)]
    pub monitor: MonitorOptions,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            gateway: GatewayOptions::default(),
            monitor: MonitorOptions::default(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Construct validated routes from every definition. Fails on the first
    /// invalid definition; duplicate ids are caught by the route table.
    pub fn build_routes(&self) -> GatewayResult<Vec<Route>> {
        self.routes
            .iter()
            .map(|definition| definition.build(&self.gateway))
            .collect()
    }
}

/// The `gateway` options block. Read-only from the core's perspective;
/// updates arrive through a configuration reload.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayOptions {
    pub enable_rate_limiting: bool,
    pub enable_circuit_breaker: bool,
    pub enable_caching: bool,
    pub enable_load_balancing: bool,
    pub enable_authentication_forwarding: bool,
    /// Fallback request timeout, range 1..=300.
    pub default_timeout_seconds: u64,
    /// Global in-flight request cap, range 1..=10000.
    pub max_concurrent_requests: usize,
    pub rate_limit: RateLimitOptions,
    pub circuit_breaker: CircuitBreakerOptions,
    pub cache: CacheOptions,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            enable_rate_limiting: true,
            enable_circuit_breaker: true,
            enable_caching: false,
            enable_load_balancing: true,
            enable_authentication_forwarding: true,
            default_timeout_seconds: default_timeout_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
            rate_limit: RateLimitOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            cache: CacheOptions::default(),
        }
    }
}

/// Global fixed-window admission knobs.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitOptions {
    pub permits: u32,
    pub window_seconds: u64,
    /// Wait-queue depth for requests that miss the window.
    pub queue_length: usize,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            permits: default_rate_limit_permits(),
            window_seconds: default_rate_limit_window(),
            queue_length: default_queue_length(),
        }
    }
}

/// Circuit breaker tuning shared by every destination.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    /// How long an open circuit sheds traffic before a half-open probe.
    pub break_duration_seconds: u64,
    /// Observations required before the breaker may open.
    pub minimum_throughput: u64,
    /// Success rate below which a failing destination opens the circuit.
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            break_duration_seconds: default_break_duration(),
            minimum_throughput: default_minimum_throughput(),
            failure_rate_threshold: default_failure_rate_threshold(),
        }
    }
}

/// Carried for the external caching collaborator; no cache layer exists in
/// the core.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CacheOptions {
    pub duration_seconds: u64,
}

/// Health monitor cadence.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorOptions {
    pub enabled: bool,
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// One route as written in the configuration file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RouteDefinition {
    pub route_id: String,
    pub route_prefix: String,
    pub destinations: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub requires_authentication: bool,
    #[serde(default)]
    pub allowed_roles: Option<Vec<String>>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl RouteDefinition {
    /// Run this definition through the validating route factory, filling the
    /// timeout from the gateway default when the route does not set one.
    pub fn build(&self, options: &GatewayOptions) -> GatewayResult<Route> {
        let policy = Policy {
            load_balancing: self.policy.load_balancing,
            enable_rate_limiting: self.policy.enable_rate_limiting,
            rate_limit_permits: self.policy.rate_limit_permits,
            rate_limit_window_seconds: self.policy.rate_limit_window_seconds,
            enable_circuit_breaker: self.policy.enable_circuit_breaker,
            enable_caching: self.policy.enable_caching,
            cache_duration_seconds: self.policy.cache_duration_seconds,
            timeout_seconds: self
                .policy
                .timeout_seconds
                .unwrap_or(options.default_timeout_seconds),
            max_retries: self.policy.max_retries,
        };
        Route::new(
            self.route_id.clone(),
            self.route_prefix.clone(),
            self.destinations.clone(),
            policy,
            self.priority,
            self.requires_authentication,
            self.allowed_roles.clone(),
        )
    }
}

/// Per-route policy knobs as written in configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PolicyConfig {
    pub load_balancing: LoadBalancingStrategy,
    pub enable_rate_limiting: bool,
    pub rate_limit_permits: u32,
    pub rate_limit_window_seconds: u64,
    pub enable_circuit_breaker: bool,
    pub enable_caching: bool,
    pub cache_duration_seconds: u64,
    /// Absent means "use the gateway default".
    pub timeout_seconds: Option<u64>,
    pub max_retries: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancingStrategy::default(),
            enable_rate_limiting: false,
            rate_limit_permits: default_rate_limit_permits(),
            rate_limit_window_seconds: default_rate_limit_window(),
            enable_circuit_breaker: true,
            enable_caching: false,
            cache_duration_seconds: 0,
            timeout_seconds: None,
            max_retries: 0,
        }
    }
}
