use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{header, header::HeaderValue, Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upstream HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Responsibilities:
/// * Streams request and response bodies without buffering
/// * Fixes up the Host header for the rewritten upstream URI
/// * Issues GET-based liveness probes under a deadline linked to the
///   caller's cancellation
///
/// Retry and circuit-breaking concerns are layered above this adapter by the
/// proxy pipeline and health monitor.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self { client })
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new().expect("Failed to create HTTP client")
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        let client = self.client.clone();

        let destination = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let request_method = req.method().to_string();

        let span = tracing::info_span!(
            "upstream_request",
            destination = %destination,
            http.method = %request_method,
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );
        let _enter = span.enter();

        // Host must reflect the rewritten upstream authority.
        if let Some(host_str) = req.uri().host() {
            let host_header_val = if let Some(port) = req.uri().port() {
                HeaderValue::from_str(&format!("{host_str}:{}", port.as_u16()))
                    .unwrap_or_else(|_| HeaderValue::from_static(""))
            } else {
                HeaderValue::from_str(host_str).unwrap_or_else(|_| HeaderValue::from_static(""))
            };
            if !host_header_val.is_empty() {
                req.headers_mut().insert(header::HOST, host_header_val);
            }
        } else {
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        // Force HTTP/1.1 on the wire request; ALPN negotiates h2 when the
        // upstream supports it.
        parts.version = Version::HTTP_11;
        let outgoing_request = Request::from_parts(parts, body);

        let method_for_error = outgoing_request.method().clone();
        let uri_for_error = outgoing_request.uri().clone();

        match client.request(outgoing_request).await {
            Ok(response) => {
                tracing::Span::current().record("http.status_code", response.status().as_u16());

                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the server side; stale
                // Transfer-Encoding would confuse it.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(hyper_body)))
            }
            Err(e) => {
                tracing::warn!(
                    "Error forwarding to {} ({} {}): {}",
                    destination,
                    method_for_error,
                    uri_for_error,
                    e
                );
                Err(HttpClientError::Connection(format!(
                    "Request to {method_for_error} {uri_for_error} failed: {e}"
                )))
            }
        }
    }

    async fn probe(
        &self,
        url: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> HttpClientResult<bool> {
        let client = self.client.clone();

        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Body::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Probing URL: {}", url);

        tokio::select! {
            _ = cancel.cancelled() => Err(HttpClientError::Cancelled),
            result = timeout(deadline, client.request(request)) => match result {
                Ok(Ok(response)) => {
                    let is_healthy = response.status().is_success();
                    // Drain the body so the connection can be reused.
                    let _ = response.into_body().collect().await;
                    tracing::debug!("Probe for {} result: {}", url, is_healthy);
                    Ok(is_healthy)
                }
                Ok(Err(err)) => Err(HttpClientError::Connection(err.to_string())),
                Err(_) => Err(HttpClientError::Timeout(deadline)),
            },
        }
    }
}
