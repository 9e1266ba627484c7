pub mod config_providers;
pub mod health_monitor;
pub mod http_client;
pub mod middleware;
pub mod proxy;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use health_monitor::HealthMonitor;
pub use http_client::HttpClientAdapter;
pub use middleware::{correlation_middleware, request_timing_middleware, CorrelationId};
pub use proxy::{Principal, ProxyHandler};
