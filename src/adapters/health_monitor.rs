//! Destination health monitoring.
//!
//! The monitor glues the pure circuit/stats state in
//! [`HealthRegistry`](crate::core::health::HealthRegistry) to probe I/O: it
//! gates each probe on the circuit (an open circuit within its break is
//! skipped outright), issues the GET against `<destination>/health`, and
//! feeds the outcome back into the registry. The same registry entries are
//! updated by the proxy's completion hooks, so probes and live traffic share
//! one view of every destination.
use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    config::models::MonitorOptions,
    core::{
        health::{DestinationHealthView, HealthRegistry, HealthSnapshot, ProbeDecision},
        route_table::RouteTable,
    },
    ports::http_client::HttpClient,
    tracing_setup,
};

/// Per-destination prober + circuit driver.
pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    http_client: Arc<dyn HttpClient>,
    options: MonitorOptions,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<HealthRegistry>,
        http_client: Arc<dyn HttpClient>,
        options: MonitorOptions,
    ) -> Self {
        Self {
            registry,
            http_client,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Probe one destination and update its state.
    ///
    /// An open circuit inside its break duration short-circuits to `false`
    /// without any network traffic; past the break the circuit half-opens
    /// and the probe decides what happens next. The probe deadline is linked
    /// with the caller's cancellation.
    pub async fn is_healthy(&self, destination: &str, cancel: &CancellationToken) -> bool {
        if self.registry.probe_decision(destination) == ProbeDecision::Skip {
            tracing::debug!(destination, "circuit open, skipping probe");
            return false;
        }

        let url = format!("{}/health", destination.trim_end_matches('/'));
        let deadline = Duration::from_secs(self.options.probe_timeout_secs);
        let span = tracing_setup::create_probe_span(destination);
        let _enter = span.enter();

        match self.http_client.probe(&url, deadline, cancel).await {
            Ok(true) => {
                tracing::Span::current().record("healthy", true);
                self.registry.record_success(destination);
                true
            }
            Ok(false) => {
                tracing::Span::current().record("healthy", false);
                tracing::debug!(destination, "probe returned non-success status");
                self.registry.record_failure(destination);
                false
            }
            Err(err) => {
                tracing::Span::current().record("healthy", false);
                tracing::debug!(destination, error = %err, "probe transport failure");
                self.registry.record_failure(destination);
                false
            }
        }
    }

    /// Completion hook: the proxy reports a successfully forwarded request.
    pub fn record_success(&self, destination: &str) {
        self.registry.record_success(destination);
    }

    /// Completion hook: the proxy reports a transport-level failure.
    pub fn record_failure(&self, destination: &str) {
        self.registry.record_failure(destination);
    }

    /// Read-only stats snapshot for a destination.
    pub fn get_stats(&self, destination: &str) -> HealthSnapshot {
        self.registry.snapshot(destination)
    }

    /// Admin view across all tracked destinations.
    pub fn destination_health_views(&self) -> Vec<DestinationHealthView> {
        self.registry.views()
    }

    /// Periodic probe loop over the current route-table snapshot. Runs until
    /// the shutdown token fires. Probing is independent of request flow; it
    /// feeds the same per-destination stats the proxy updates.
    pub async fn run(&self, route_table: Arc<RouteTable>, shutdown: CancellationToken) {
        if !self.options.enabled {
            tracing::info!("Health monitoring is disabled");
            return;
        }

        let interval = Duration::from_secs(self.options.interval_secs);
        tracing::info!(
            interval_secs = self.options.interval_secs,
            probe_timeout_secs = self.options.probe_timeout_secs,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Health monitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let destinations = route_table.destinations();
            tracing::debug!(count = destinations.len(), "running health probe cycle");

            for destination in destinations {
                if shutdown.is_cancelled() {
                    return;
                }
                let healthy = self.is_healthy(&destination, &shutdown).await;
                tracing::debug!(destination = %destination, healthy, "probe cycle result");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{Duration as ChronoDuration, Utc};
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        core::health::CircuitState,
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Scripted probe client: answers according to `mode` and counts calls.
    struct MockHttpClient {
        mode: ProbeMode,
        probes: AtomicUsize,
    }

    enum ProbeMode {
        Healthy,
        UnhealthyStatus,
        TransportError,
    }

    impl MockHttpClient {
        fn new(mode: ProbeMode) -> Self {
            Self {
                mode,
                probes: AtomicUsize::new(0),
            }
        }

        fn probe_count(&self) -> usize {
            self.probes.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::Connection("not used in probe tests".to_string()))
        }

        async fn probe(
            &self,
            _url: &str,
            _deadline: Duration,
            _cancel: &CancellationToken,
        ) -> HttpClientResult<bool> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            match self.mode {
                ProbeMode::Healthy => Ok(true),
                ProbeMode::UnhealthyStatus => Ok(false),
                ProbeMode::TransportError => {
                    Err(HttpClientError::Connection("refused".to_string()))
                }
            }
        }
    }

    const DEST: &str = "http://upstream:3000";

    fn monitor(mode: ProbeMode) -> (HealthMonitor, Arc<MockHttpClient>) {
        let client = Arc::new(MockHttpClient::new(mode));
        let monitor = HealthMonitor::new(
            Arc::new(HealthRegistry::default()),
            client.clone(),
            MonitorOptions::default(),
        );
        (monitor, client)
    }

    #[tokio::test]
    async fn test_healthy_probe_records_success() {
        let (monitor, client) = monitor(ProbeMode::Healthy);
        let cancel = CancellationToken::new();

        assert!(monitor.is_healthy(DEST, &cancel).await);
        assert_eq!(client.probe_count(), 1);

        let stats = monitor.get_stats(DEST);
        assert_eq!(stats.successful_requests, 1);
        assert!(stats.is_healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_status_records_failure() {
        let (monitor, client) = monitor(ProbeMode::UnhealthyStatus);
        let cancel = CancellationToken::new();

        assert!(!monitor.is_healthy(DEST, &cancel).await);
        assert_eq!(client.probe_count(), 1);
        assert_eq!(monitor.get_stats(DEST).failed_requests, 1);
    }

    #[tokio::test]
    async fn test_transport_error_records_failure() {
        let (monitor, _client) = monitor(ProbeMode::TransportError);
        let cancel = CancellationToken::new();

        assert!(!monitor.is_healthy(DEST, &cancel).await);
        assert_eq!(monitor.get_stats(DEST).failed_requests, 1);
    }

    #[tokio::test]
    async fn test_failure_storm_opens_circuit() {
        let (monitor, _client) = monitor(ProbeMode::TransportError);

        for _ in 0..10 {
            monitor.record_failure(DEST);
        }
        let (state, _) = monitor.registry().circuit(DEST);
        assert_eq!(state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_probe_within_break() {
        let (monitor, client) = monitor(ProbeMode::Healthy);
        let cancel = CancellationToken::new();

        monitor
            .registry()
            .force_circuit(DEST, CircuitState::Open, Utc::now());

        assert!(!monitor.is_healthy(DEST, &cancel).await);
        // No network traffic while the break holds.
        assert_eq!(client.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_probes_after_break() {
        let (monitor, client) = monitor(ProbeMode::Healthy);
        let cancel = CancellationToken::new();

        monitor.registry().force_circuit(
            DEST,
            CircuitState::Open,
            Utc::now() - ChronoDuration::seconds(31),
        );

        // Break elapsed: half-opens, probes, and the 2xx closes it.
        assert!(monitor.is_healthy(DEST, &cancel).await);
        assert_eq!(client.probe_count(), 1);

        let (state, _) = monitor.registry().circuit(DEST);
        assert_eq!(state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_throughput() {
        let (monitor, client) = monitor(ProbeMode::TransportError);
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            monitor.record_failure(DEST);
        }
        monitor.registry().force_circuit(
            DEST,
            CircuitState::Open,
            Utc::now() - ChronoDuration::seconds(31),
        );

        assert!(!monitor.is_healthy(DEST, &cancel).await);
        assert_eq!(client.probe_count(), 1);

        let (state, _) = monitor.registry().circuit(DEST);
        assert_eq!(state, CircuitState::Open);
    }
}
