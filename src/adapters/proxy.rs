//! The proxy hot path.
//!
//! For each inbound request: correlation, rate-limit admission, route match,
//! timeout enforcement, identity forwarding, destination selection, forward,
//! and completion accounting. Completion accounting is drop-guarded so a
//! timeout or client disconnect that cancels the forward future can never
//! skip it.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    http::{header, HeaderValue, Method, StatusCode},
};
use eyre::{Result, WrapErr};
use http_body::Body as _;
use hyper::{Request, Response, Uri};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    adapters::middleware::{CorrelationId, CORRELATION_HEADER},
    adapters::health_monitor::HealthMonitor,
    config::models::{GatewayConfig, GatewayOptions},
    core::{
        error::{GatewayError, GatewayResult},
        load_balancer::LoadBalancer,
        rate_limiter::{AdmissionController, AdmissionError},
        route::Route,
        route_table::RouteTable,
    },
    metrics,
    ports::http_client::HttpClient,
    tracing_setup,
};

/// Upstream trust headers derived from the authenticated principal.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// Already-authenticated identity injected into request extensions by the
/// outer authentication layer. The gateway only forwards these claims; it
/// never verifies tokens or makes authorization decisions.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    /// `NameIdentifier` claim; takes precedence over `subject` for the
    /// forwarded user id.
    pub name_identifier: Option<String>,
    /// `sub` claim.
    pub subject: Option<String>,
    pub tenant_id: Option<String>,
    pub email: Option<String>,
    /// Role claims in order of occurrence.
    pub roles: Vec<String>,
}

impl Principal {
    pub fn user_id(&self) -> Option<&str> {
        self.name_identifier.as_deref().or(self.subject.as_deref())
    }
}

/// Pairs every successful selection with exactly one completion report.
/// Dropping the guard without `succeed()` counts as a failure, which covers
/// transport errors and cancelled forward futures alike.
struct CompletionGuard {
    load_balancer: Arc<LoadBalancer>,
    monitor: Arc<HealthMonitor>,
    destination: String,
    armed: bool,
}

impl CompletionGuard {
    fn new(
        load_balancer: Arc<LoadBalancer>,
        monitor: Arc<HealthMonitor>,
        destination: String,
    ) -> Self {
        Self {
            load_balancer,
            monitor,
            destination,
            armed: true,
        }
    }

    fn succeed(mut self) {
        self.armed = false;
        self.load_balancer.record_completion(&self.destination);
        self.monitor.record_success(&self.destination);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.load_balancer.record_completion(&self.destination);
            self.monitor.record_failure(&self.destination);
        }
    }
}

/// HTTP handler for the Portico data plane.
pub struct ProxyHandler {
    route_table: Arc<RouteTable>,
    load_balancer: Arc<LoadBalancer>,
    health_monitor: Arc<HealthMonitor>,
    admission: Arc<AdmissionController>,
    http_client: Arc<dyn HttpClient>,
    config: Arc<ArcSwap<GatewayConfig>>,
}

impl ProxyHandler {
    pub fn new(
        route_table: Arc<RouteTable>,
        load_balancer: Arc<LoadBalancer>,
        health_monitor: Arc<HealthMonitor>,
        admission: Arc<AdmissionController>,
        http_client: Arc<dyn HttpClient>,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Self {
        Self {
            route_table,
            load_balancer,
            health_monitor,
            admission,
            http_client,
            config,
        }
    }

    /// Main entry point: spans, metrics, and correlation echo around the
    /// pipeline itself.
    pub async fn handle_request(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // The correlation middleware normally set this; fall back for
        // callers that drive the handler directly.
        let correlation = req
            .extensions()
            .get::<CorrelationId>()
            .cloned()
            .unwrap_or_else(|| CorrelationId::from_request(&req));

        let span = tracing_setup::create_request_span(method.as_str(), &path, correlation.as_str());
        if let Some(principal) = req.extensions().get::<Principal>() {
            if let Some(user_id) = principal.user_id() {
                span.record("user_id", user_id);
            }
            if let Some(tenant_id) = principal.tenant_id.as_deref() {
                span.record("tenant_id", tenant_id);
            }
        }
        if let Some(addr) = client_addr {
            tracing::debug!(client = %addr, "accepted request");
        }

        let _timer = metrics::RequestTimer::new(&path, method.as_str());
        let start = std::time::Instant::now();

        let result = self
            .dispatch(req, &correlation)
            .instrument(span.clone())
            .await;

        let duration = start.elapsed();
        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                span.record("duration_ms", duration.as_millis() as u64);
                metrics::increment_request_total(&path, method.as_str(), response.status().as_u16());
            }
            Err(e) => {
                span.record("http.status_code", 500u16);
                span.record("duration_ms", duration.as_millis() as u64);
                metrics::increment_request_total(&path, method.as_str(), 500);
                tracing::error!(error = %e, "request failed");
            }
        }

        result.map(|mut response| {
            if let Ok(value) = HeaderValue::from_str(correlation.as_str()) {
                response.headers_mut().insert(CORRELATION_HEADER, value);
            }
            response
        })
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        correlation: &CorrelationId,
    ) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();

        // Gateway self-endpoints sit in a reserved namespace so proxied
        // routes for paths like `/health` still forward.
        match path.as_str() {
            "/__portico/health" => return self.handle_self_health(),
            "/__portico/status" => return self.handle_self_status(),
            _ => {}
        }

        let config = self.config.load_full();
        let options = &config.gateway;

        // A dropped handler future (client disconnect) cancels everything
        // linked to this token.
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        if options.enable_rate_limiting {
            match self.admission.admit(correlation.as_str(), &cancel).await {
                Ok(()) => {}
                Err(AdmissionError::Rejected { retry_after }) => {
                    metrics::increment_rate_limit_rejection();
                    tracing::warn!(retry_after, "request rejected by rate limiter");
                    return rate_limited_response(retry_after);
                }
                Err(AdmissionError::Cancelled) => {
                    return Response::builder()
                        .status(StatusCode::REQUEST_TIMEOUT)
                        .body(Body::empty())
                        .wrap_err("Failed to build cancellation response");
                }
            }
        }

        let Some(route) = self.route_table.match_route(&path) else {
            tracing::warn!(path = %path, "no route match");
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Route not found"))
                .wrap_err("Failed to build 404 response");
        };
        tracing::debug!(
            route_id = route.route_id(),
            prefix = route.route_prefix(),
            "route matched"
        );

        let mut req = req;
        self.apply_identity_headers(&mut req, options.enable_authentication_forwarding);
        if let Ok(value) = HeaderValue::from_str(correlation.as_str()) {
            req.headers_mut().insert(CORRELATION_HEADER, value);
        }

        let timeout_seconds = route.policy().timeout_seconds;
        let deadline = Duration::from_secs(timeout_seconds);

        match tokio::time::timeout(deadline, self.forward(req, &route, options)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => upstream_error_response(&err),
            Err(_) => {
                // The client is still connected (a disconnect would have
                // dropped this future), so report the timeout explicitly.
                tracing::warn!(
                    route_id = route.route_id(),
                    timeout_seconds,
                    "request timed out"
                );
                timeout_response(timeout_seconds)
            }
        }
    }

    /// Select, forward, account. Transport failures on idempotent requests
    /// with no body retry against a fresh selection with exponential
    /// backoff, up to the route's `max_retries`.
    async fn forward(
        &self,
        req: Request<Body>,
        route: &Route,
        options: &GatewayOptions,
    ) -> GatewayResult<Response<Body>> {
        let (parts, body) = req.into_parts();

        // A streamed body cannot be replayed; only retry when the inbound
        // body was already complete (GET & friends in practice).
        let replayable = body.is_end_stream();
        let max_retries = if replayable && is_idempotent(&parts.method) {
            route.policy().max_retries
        } else {
            0
        };

        let mut body_slot = Some(body);
        let mut attempt: u32 = 0;

        loop {
            let destination = if options.enable_load_balancing {
                self.load_balancer.select(route)?
            } else {
                self.load_balancer.select_first(route)?
            };
            let guard = CompletionGuard::new(
                self.load_balancer.clone(),
                self.health_monitor.clone(),
                destination.clone(),
            );

            let uri = upstream_uri(&destination, &parts.uri)?;
            let mut upstream_req = Request::builder()
                .method(parts.method.clone())
                .uri(uri)
                .body(body_slot.take().unwrap_or_else(Body::empty))
                .map_err(|e| {
                    GatewayError::failure(
                        "Proxy.InvalidUpstreamRequest",
                        format!("failed to build upstream request: {e}"),
                    )
                })?;
            *upstream_req.headers_mut() = parts.headers.clone();

            let timer = metrics::UpstreamRequestTimer::new(&destination, parts.method.as_str());
            match self.http_client.send_request(upstream_req).await {
                Ok(response) => {
                    metrics::increment_upstream_request_total(
                        &destination,
                        parts.method.as_str(),
                        response.status().as_u16(),
                    );
                    guard.succeed();
                    return Ok(response);
                }
                Err(err) => {
                    drop(timer);
                    // Guard drop records the completion and the failure.
                    drop(guard);
                    metrics::increment_upstream_request_total(
                        &destination,
                        parts.method.as_str(),
                        StatusCode::BAD_GATEWAY.as_u16(),
                    );

                    if attempt >= max_retries {
                        return Err(GatewayError::failure(
                            "Proxy.UpstreamUnavailable",
                            format!("upstream request failed: {err}"),
                        )
                        .with_metadata("destination", destination));
                    }
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(100 * (1u64 << (attempt - 1).min(4)));
                    tracing::warn!(
                        destination = %destination,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "upstream transport failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Overwrite (never append) the trust headers from the principal's
    /// claims. Inbound copies are stripped first so absent claims yield
    /// absent headers and clients cannot smuggle identity.
    fn apply_identity_headers(&self, req: &mut Request<Body>, enabled: bool) {
        if !enabled {
            return;
        }
        for name in [
            USER_ID_HEADER,
            TENANT_ID_HEADER,
            USER_EMAIL_HEADER,
            USER_ROLES_HEADER,
        ] {
            req.headers_mut().remove(name);
        }

        let Some(principal) = req.extensions().get::<Principal>().cloned() else {
            return;
        };

        let headers = req.headers_mut();
        if let Some(user_id) = principal.user_id() {
            if let Ok(value) = HeaderValue::from_str(user_id) {
                headers.insert(USER_ID_HEADER, value);
            }
        }
        if let Some(tenant_id) = principal.tenant_id.as_deref() {
            if let Ok(value) = HeaderValue::from_str(tenant_id) {
                headers.insert(TENANT_ID_HEADER, value);
            }
        }
        if let Some(email) = principal.email.as_deref() {
            if let Ok(value) = HeaderValue::from_str(email) {
                headers.insert(USER_EMAIL_HEADER, value);
            }
        }
        if !principal.roles.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&principal.roles.join(",")) {
                headers.insert(USER_ROLES_HEADER, value);
            }
        }
    }

    fn handle_self_health(&self) -> Result<Response<Body>> {
        let views = self.health_monitor.destination_health_views();
        let healthy = views.iter().filter(|v| v.stats.is_healthy).count();

        let body = serde_json::json!({
            "status": "ok",
            "routes": self.route_table.len(),
            "destinations": {
                "tracked": views.len(),
                "healthy": healthy,
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .wrap_err("Failed to build self-health response")
    }

    fn handle_self_status(&self) -> Result<Response<Body>> {
        let body = serde_json::json!({
            "service": "Portico Gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "routes": self.route_table.route_views(),
            "destinations": self.health_monitor.destination_health_views(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .wrap_err("Failed to build self-status response")
    }
}

fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::OPTIONS
        || *method == Method::TRACE
}

fn upstream_uri(destination: &str, original: &Uri) -> GatewayResult<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let joined = format!("{}{}", destination.trim_end_matches('/'), path_and_query);
    joined.parse::<Uri>().map_err(|e| {
        GatewayError::failure(
            "Proxy.InvalidUpstreamUri",
            format!("failed to build upstream uri from '{joined}': {e}"),
        )
    })
}

fn rate_limited_response(retry_after: Option<u64>) -> Result<Response<Body>> {
    let mut body = serde_json::json!({
        "error": "Too Many Requests",
        "message": "Rate limit exceeded. Try again later.",
    });
    if let Some(seconds) = retry_after {
        body["retryAfter"] = seconds.into();
    }

    let mut builder = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(seconds) = retry_after {
        builder = builder.header(header::RETRY_AFTER, seconds.to_string());
    }
    builder
        .body(Body::from(body.to_string()))
        .wrap_err("Failed to build 429 response")
}

fn timeout_response(timeout_seconds: u64) -> Result<Response<Body>> {
    let body = serde_json::json!({
        "type": "https://httpstatuses.com/504",
        "title": "Gateway Timeout",
        "status": 504,
        "detail": format!(
            "The request did not complete within the configured timeout of {timeout_seconds} seconds."
        ),
        "timeout": timeout_seconds,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .header(header::CONTENT_TYPE, "application/problem+json")
        .body(Body::from(body.to_string()))
        .wrap_err("Failed to build 504 response")
}

fn upstream_error_response(err: &GatewayError) -> Result<Response<Body>> {
    let body = serde_json::json!({
        "type": "https://httpstatuses.com/502",
        "title": "Bad Gateway",
        "status": 502,
        "detail": err.message,
        "code": err.code,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/problem+json")
        .body(Body::from(body.to_string()))
        .wrap_err("Failed to build upstream error response")
}
