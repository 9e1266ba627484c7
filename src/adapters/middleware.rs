//! Axum middleware for the data plane.
//!
//! The correlation layer runs before everything else in the pipeline: it
//! adopts the caller's `X-Correlation-Id` or generates one, exposes it to
//! downstream handlers through a request extension, and mirrors it onto the
//! response before headers are flushed.
use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

/// Header carrying the end-to-end correlation identifier.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Correlation identifier attached to every request as an extension.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Adopt the inbound header value, or mint a fresh identifier.
    pub fn from_request<B>(req: &hyper::Request<B>) -> Self {
        let adopted = req
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self(adopted.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Adopt-or-generate the correlation id, stash it in request extensions, and
/// echo it on the response.
pub async fn correlation_middleware(mut req: Request, next: Next) -> Response {
    let correlation = CorrelationId::from_request(&req);
    req.extensions_mut().insert(correlation.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = HeaderValue::from_str(correlation.as_str()) {
        response
            .headers_mut()
            .insert(CORRELATION_HEADER, header_value);
    }

    response
}

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    tracing::debug!("Started processing {} {}", method, uri);

    let response = next.run(req).await;
    let duration = start.elapsed();

    tracing::info!(
        "Completed {} {} - {} in {:?}",
        method,
        uri,
        response.status(),
        duration
    );

    response
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt; // for oneshot

    use super::*;

    fn echo_app() -> Router {
        Router::new()
            .route(
                "/",
                get(|req: Request| async move {
                    // Hand the extension value back so the test can compare.
                    let id = req
                        .extensions()
                        .get::<CorrelationId>()
                        .map(|c| c.0.clone())
                        .unwrap_or_default();
                    axum::response::Response::builder()
                        .status(StatusCode::OK)
                        .header("x-seen-correlation", id)
                        .body(Body::empty())
                        .unwrap()
                }),
            )
            .layer(middleware::from_fn(correlation_middleware))
    }

    #[tokio::test]
    async fn test_inbound_correlation_id_is_adopted() {
        let response = echo_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(CORRELATION_HEADER, "corr-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(CORRELATION_HEADER).unwrap(),
            "corr-42"
        );
        assert_eq!(
            response.headers().get("x-seen-correlation").unwrap(),
            "corr-42"
        );
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_generated() {
        let response = echo_app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let echoed = response
            .headers()
            .get(CORRELATION_HEADER)
            .expect("response should carry a correlation id")
            .to_str()
            .unwrap();
        assert!(uuid::Uuid::parse_str(echoed).is_ok());
        // The handler saw the same value that was echoed to the client.
        assert_eq!(
            response.headers().get("x-seen-correlation").unwrap(),
            echoed
        );
    }

    #[tokio::test]
    async fn test_empty_header_value_regenerated() {
        let response = echo_app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(CORRELATION_HEADER, "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let echoed = response
            .headers()
            .get(CORRELATION_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(!echoed.is_empty());
        assert!(uuid::Uuid::parse_str(echoed).is_ok());
    }
}
