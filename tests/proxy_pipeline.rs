//! End-to-end pipeline scenarios driven through the public API with a
//! scripted upstream client.
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Uri};
use portico::{
    adapters::{correlation_middleware, HealthMonitor, ProxyHandler},
    config::models::{GatewayConfig, PolicyConfig, RouteDefinition},
    core::{
        AdmissionController, HealthRegistry, LoadBalancer, LoadBalancingStrategy, RouteTable,
    },
    ports::{
        config_provider::ConfigProvider,
        http_client::{HttpClient, HttpClientError, HttpClientResult},
    },
};
use tokio_util::sync::CancellationToken;

/// Upstream double: answers 200 after an optional delay and records the
/// URIs it was asked to reach.
struct FakeUpstream {
    delay: Duration,
    requests: Mutex<Vec<Uri>>,
    probes: AtomicUsize,
}

impl FakeUpstream {
    fn immediate() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            requests: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        })
    }

    fn seen_authorities(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|uri| {
                format!(
                    "{}://{}",
                    uri.scheme_str().unwrap_or("http"),
                    uri.authority().map(|a| a.as_str()).unwrap_or("")
                )
            })
            .collect()
    }

    fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HttpClient for FakeUpstream {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.requests.lock().unwrap().push(req.uri().clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("ok"))
            .expect("static response"))
    }

    async fn probe(
        &self,
        _url: &str,
        _deadline: Duration,
        _cancel: &CancellationToken,
    ) -> HttpClientResult<bool> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        Err(HttpClientError::Connection("probe refused".to_string()))
    }
}

struct StaticProvider(GatewayConfig);

#[async_trait]
impl ConfigProvider for StaticProvider {
    async fn load_config(&self) -> eyre::Result<GatewayConfig> {
        Ok(self.0.clone())
    }

    fn watch(&self) -> tokio::sync::mpsc::Receiver<()> {
        let (_tx, rx) = tokio::sync::mpsc::channel(1);
        rx
    }
}

struct Gateway {
    handler: Arc<ProxyHandler>,
    load_balancer: Arc<LoadBalancer>,
    monitor: Arc<HealthMonitor>,
    registry: Arc<HealthRegistry>,
}

fn gateway(client: Arc<FakeUpstream>, routes: Vec<RouteDefinition>) -> Gateway {
    let mut config = GatewayConfig::default();
    config.routes = routes;
    config.gateway.enable_rate_limiting = false;

    let registry = Arc::new(HealthRegistry::default());
    let load_balancer = Arc::new(LoadBalancer::new(registry.clone()));
    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        client.clone(),
        config.monitor.clone(),
    ));
    let admission = Arc::new(AdmissionController::new(&config.gateway.rate_limit).unwrap());

    let routes = config.build_routes().unwrap();
    let route_table = Arc::new(
        RouteTable::new(Arc::new(StaticProvider(config.clone())), routes).unwrap(),
    );

    let handler = Arc::new(ProxyHandler::new(
        route_table,
        load_balancer.clone(),
        monitor.clone(),
        admission,
        client,
        Arc::new(ArcSwap::from_pointee(config)),
    ));

    Gateway {
        handler,
        load_balancer,
        monitor,
        registry,
    }
}

fn route(
    id: &str,
    prefix: &str,
    destinations: &[&str],
    strategy: LoadBalancingStrategy,
    timeout_seconds: Option<u64>,
) -> RouteDefinition {
    RouteDefinition {
        route_id: id.to_string(),
        route_prefix: prefix.to_string(),
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
        policy: PolicyConfig {
            load_balancing: strategy,
            timeout_seconds,
            ..PolicyConfig::default()
        },
        ..RouteDefinition::default()
    }
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn round_robin_walks_three_destinations_in_order() {
    let upstream = FakeUpstream::immediate();
    let gw = gateway(
        upstream.clone(),
        vec![route(
            "r",
            "/a",
            &["http://x", "http://y", "http://z"],
            LoadBalancingStrategy::RoundRobin,
            None,
        )],
    );

    for _ in 0..6 {
        let response = gw.handler.handle_request(get("/a"), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(
        upstream.seen_authorities(),
        vec![
            "http://x", "http://y", "http://z", "http://x", "http://y", "http://z"
        ]
    );
}

#[tokio::test]
async fn least_connections_breaks_ties_by_first() {
    let gw = gateway(FakeUpstream::immediate(), vec![]);

    let route = portico::core::Route::new(
        "lc",
        "/lc",
        vec!["http://first".to_string(), "http://second".to_string()],
        portico::core::Policy {
            load_balancing: LoadBalancingStrategy::LeastConnections,
            ..portico::core::Policy::default()
        },
        0,
        false,
        None,
    )
    .unwrap();

    // Both counters zero: the first destination wins the tie.
    assert_eq!(gw.load_balancer.select(&route).unwrap(), "http://first");
    // Counters are now (1, 0): the second is selected.
    assert_eq!(gw.load_balancer.select(&route).unwrap(), "http://second");
}

#[tokio::test]
async fn all_unhealthy_destinations_still_attempted() {
    let gw = gateway(FakeUpstream::immediate(), vec![]);

    let route = portico::core::Route::new(
        "fallback",
        "/f",
        vec!["http://bad-a".to_string(), "http://bad-b".to_string()],
        portico::core::Policy::default(),
        0,
        false,
        None,
    )
    .unwrap();

    for destination in ["http://bad-a", "http://bad-b"] {
        gw.registry.record_failure(destination);
        gw.registry.record_failure(destination);
        assert!(!gw.registry.is_flagged_healthy(destination));
    }

    let selected = gw.load_balancer.select(&route).expect("fallback must select");
    assert!(selected == "http://bad-a" || selected == "http://bad-b");
    assert_eq!(gw.load_balancer.active_connections(&selected), 1);
}

#[tokio::test]
async fn timeout_produces_problem_json_with_correlation() {
    let upstream = FakeUpstream::with_delay(Duration::from_secs(2));
    let gw = gateway(
        upstream,
        vec![route(
            "slow",
            "/slow",
            &["http://sleepy:3000"],
            LoadBalancingStrategy::RoundRobin,
            Some(1),
        )],
    );

    let mut req = get("/slow/endpoint");
    req.headers_mut()
        .insert("x-correlation-id", "corr-timeout".parse().unwrap());

    let response = gw.handler.handle_request(req, None).await.unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "corr-timeout"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let problem: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(problem["type"], "https://httpstatuses.com/504");
    assert_eq!(problem["status"], 504);
    assert_eq!(problem["timeout"], 1);
    assert!(problem["timestamp"].is_string());
    assert!(problem["detail"].as_str().unwrap().contains('1'));
}

#[tokio::test]
async fn timeout_still_accounts_completion() {
    let upstream = FakeUpstream::with_delay(Duration::from_secs(2));
    let gw = gateway(
        upstream,
        vec![route(
            "slow",
            "/slow",
            &["http://sleepy:3000"],
            LoadBalancingStrategy::RoundRobin,
            Some(1),
        )],
    );

    gw.handler.handle_request(get("/slow"), None).await.unwrap();

    // The forward future was cancelled by the deadline; the drop guard must
    // have released the connection and recorded the failure.
    assert_eq!(gw.load_balancer.active_connections("http://sleepy:3000"), 0);
    let stats = gw.monitor.get_stats("http://sleepy:3000");
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn failure_storm_opens_circuit_and_skips_probe() {
    let upstream = FakeUpstream::immediate();
    let gw = gateway(upstream.clone(), vec![]);

    for _ in 0..10 {
        gw.monitor.record_failure("http://flaky:3000");
    }

    let cancel = CancellationToken::new();
    // The circuit opened at the 10th failure; within the 30s break the
    // monitor reports unhealthy without touching the network.
    assert!(!gw.monitor.is_healthy("http://flaky:3000", &cancel).await);
    assert_eq!(upstream.probe_count(), 0);
}

#[tokio::test]
async fn correlation_round_trips_through_router() {
    use axum::{middleware, routing::any, Router};
    use tower::ServiceExt;

    let upstream = FakeUpstream::immediate();
    let gw = gateway(
        upstream,
        vec![route(
            "api",
            "/api",
            &["http://backend:3000"],
            LoadBalancingStrategy::RoundRobin,
            None,
        )],
    );

    let handler = gw.handler.clone();
    let app: Router = Router::new()
        .route(
            "/{*path}",
            any(move |req: Request<Body>| {
                let handler = handler.clone();
                async move {
                    handler
                        .handle_request(req, None::<SocketAddr>)
                        .await
                        .unwrap_or_else(|_| {
                            Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::empty())
                                .unwrap()
                        })
                }
            }),
        )
        .layer(middleware::from_fn(correlation_middleware));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/ping")
                .header("x-correlation-id", "corr-e2e")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "corr-e2e"
    );
}
