//! Gateway error values.
//!
//! Errors crossing component boundaries carry a stable `code`, a human
//! readable `message`, a coarse `kind` used by callers to map onto transport
//! status codes, and optional string metadata. Validation errors never reach
//! the hot path: a `Route` that fails construction simply does not exist.
use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Failure,
    Unauthorized,
    Forbidden,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Failure => "Failure",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
        };
        write!(f, "{name}")
    }
}

/// First-class error value used throughout the gateway core.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[{kind}] {code}: {message}")]
pub struct GatewayError {
    /// Stable machine-readable code, e.g. `Route.InvalidPrefix`.
    pub code: String,
    pub message: String,
    pub kind: ErrorKind,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Result alias for core operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind,
            metadata: None,
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failure, code, message)
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, code, message)
    }

    /// Attach a metadata entry, creating the map on first use.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}
