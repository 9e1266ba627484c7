use std::net::SocketAddr;

use crate::config::models::GatewayConfig;

/// Validation result type alias.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Route '{route_id}' is invalid: {message}")]
    InvalidRoute { route_id: String, message: String },

    #[error("Duplicate route id '{route_id}'")]
    DuplicateRoute { route_id: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Whole-configuration validator, used by the `validate` CLI subcommand and
/// before applying an initial configuration.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, aggregating every failure.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        errors.extend(Self::validate_options(config));
        errors.extend(Self::validate_routes(config));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_options(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let options = &config.gateway;

        if !(1..=300).contains(&options.default_timeout_seconds) {
            errors.push(ValidationError::InvalidField {
                field: "gateway.default_timeout_seconds".to_string(),
                message: format!(
                    "must be within 1..=300, got {}",
                    options.default_timeout_seconds
                ),
            });
        }
        if !(1..=10_000).contains(&options.max_concurrent_requests) {
            errors.push(ValidationError::InvalidField {
                field: "gateway.max_concurrent_requests".to_string(),
                message: format!(
                    "must be within 1..=10000, got {}",
                    options.max_concurrent_requests
                ),
            });
        }
        if options.rate_limit.permits == 0 {
            errors.push(ValidationError::InvalidField {
                field: "gateway.rate_limit.permits".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if options.rate_limit.window_seconds == 0 {
            errors.push(ValidationError::InvalidField {
                field: "gateway.rate_limit.window_seconds".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&options.circuit_breaker.failure_rate_threshold) {
            errors.push(ValidationError::InvalidField {
                field: "gateway.circuit_breaker.failure_rate_threshold".to_string(),
                message: format!(
                    "must be within 0.0..=1.0, got {}",
                    options.circuit_breaker.failure_rate_threshold
                ),
            });
        }
        if config.monitor.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "monitor.interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        errors
    }

    fn validate_routes(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for definition in &config.routes {
            if !seen.insert(definition.route_id.clone()) {
                errors.push(ValidationError::DuplicateRoute {
                    route_id: definition.route_id.clone(),
                });
            }
            if let Err(e) = definition.build(&config.gateway) {
                errors.push(ValidationError::InvalidRoute {
                    route_id: definition.route_id.clone(),
                    message: e.to_string(),
                });
            }
        }

        errors
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut message = format!("{} error(s) found:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
