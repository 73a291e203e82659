//! Error types for the resilience primitives

use thiserror::Error;

/// Errors raised by the resilience primitives themselves.
///
/// Failures of the protected operation are never wrapped in this type; they
/// reach the caller unchanged. Decorated calls fold these rejections into the
/// caller's own error type through `From<ResilienceError>`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// Circuit breaker refused the call
    #[error("CircuitBreaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted { name: String, state: String },

    /// Bulkhead had no free permit within its wait budget
    #[error("Bulkhead '{name}' is full and does not permit further calls (max {max_concurrent_calls})")]
    BulkheadFull {
        name: String,
        max_concurrent_calls: usize,
    },

    /// Rate limiter could not admit the call within its timeout
    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A named shared configuration does not exist
    #[error("Unknown configuration '{0}'")]
    UnknownConfiguration(String),

    /// Shared configurations reference each other in a loop
    #[error("Configuration cycle detected: {}", .0.join(" -> "))]
    ConfigurationCycle(Vec<String>),

    /// Ring buffer changed structurally while it was being iterated
    #[error("Concurrent modification detected during iteration")]
    ConcurrentModification,
}

impl ResilienceError {
    /// Check if this error is an admission rejection (circuit open, bulkhead
    /// full, rate limited). Rejections are reported, never retried internally.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CallNotPermitted { .. }
                | ResilienceError::BulkheadFull { .. }
                | ResilienceError::RequestNotPermitted { .. }
        )
    }

    /// Check if this error is a configuration problem (fails fast at construction)
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ResilienceError::InvalidConfig(_)
                | ResilienceError::UnknownConfiguration(_)
                | ResilienceError::ConfigurationCycle(_)
        )
    }
}
