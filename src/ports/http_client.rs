use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the upstream HTTP client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Transport-level failure reaching the upstream.
    #[error("connection error: {0}")]
    Connection(String),

    /// The deadline elapsed before the upstream answered.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The request could not be constructed or sent as-is.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Port for talking to upstream destinations.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward a request to an upstream, streaming both bodies.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Issue a liveness probe (HTTP GET) against `url` under `deadline`,
    /// linked with the caller's cancellation.
    ///
    /// Returns `Ok(true)` for a 2xx response, `Ok(false)` for any other
    /// status; transport errors, timeouts and cancellation are `Err`.
    async fn probe(
        &self,
        url: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> HttpClientResult<bool>;
}
