//! Portico - a smart HTTP reverse-proxy gateway.
//!
//! Portico is the single ingress point in front of a fleet of backend
//! microservices. It accepts client HTTP requests on configured URL
//! prefixes, selects a healthy upstream destination per request according to
//! a per-route policy, forwards the request while propagating trust context,
//! and tracks per-destination health so failing upstreams are temporarily
//! excluded from selection. The library exposes the core building blocks so
//! you can embed the gateway or compose parts of it inside your own
//! application.
//!
//! # Features
//! - Hot-reloadable route table keyed by a stable route identifier
//! - Pluggable load balancing (round-robin, least-connections, random,
//!   power-of-two-choices) with live connection accounting
//! - Per-destination health monitoring with an integrated three-state
//!   circuit breaker
//! - Correlation-id propagation and identity claim forwarding
//! - Fixed-window rate-limit admission with a bounded wait queue
//! - Per-route timeout enforcement with RFC 7807 problem responses
//! - Metrics (Prometheus style) & structured tracing via `tracing`
//! - Graceful shutdown
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{adapters::FileConfigProvider, config, core::RouteTable};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = config::loader::load_config("gateway.toml")?;
//! let provider = Arc::new(FileConfigProvider::new("gateway.toml")?);
//! let routes = cfg.build_routes()?;
//! let table = Arc::new(RouteTable::new(provider, routes)?);
//! // Wire the table into the ProxyHandler adapter (see the binary crate).
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. End users
//! should prefer the re-exports documented below instead of reaching into
//! internal modules directly.
//!
//! # Error Handling
//! Core operations return [`core::GatewayError`] values carrying a stable
//! code, a message, and a kind; application-level fallible paths return
//! `eyre::Result<T>` with context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Shared mutable maps use `scc::HashMap`; snapshot-swapped state (the route
//! table, the live configuration) uses `arc_swap`; counters are plain
//! atomics. The circuit breaker's `(state, last_state_change)` pair sits
//! behind a single mutex so readers always observe a consistent pair.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileConfigProvider, HealthMonitor, HttpClientAdapter, Principal, ProxyHandler},
    core::{AdmissionController, HealthRegistry, LoadBalancer, RouteTable},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
