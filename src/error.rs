use thiserror::Error;

use crate::execution::gateway::GatewayError;
use crate::resilience::Dependency;

/// Error taxonomy of the trading core
#[derive(Error, Debug)]
pub enum BotError {
    // Recovered locally: the cycle is skipped
    #[error("Insufficient history for {symbol}: need {needed} bars, have {available}")]
    DataGap {
        symbol: String,
        needed: usize,
        available: usize,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    // Dependency failures surfaced by the resilience layer
    #[error("{dependency} {operation} failed after {attempts} attempts: {source}")]
    TransientDependency {
        dependency: Dependency,
        operation: String,
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("{dependency} {operation} failed: {source}")]
    DependencyFailure {
        dependency: Dependency,
        operation: String,
        #[source]
        source: GatewayError,
    },

    #[error("{dependency} unavailable: circuit open")]
    DependencyUnavailable { dependency: Dependency },

    #[error("Critical failure on {dependency} (error {error_id}): {reason}")]
    Critical {
        dependency: Dependency,
        error_id: uuid::Uuid,
        reason: String,
    },

    #[error("{dependency} halted pending manual intervention")]
    Halted { dependency: Dependency },

    // Configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Worker for {0} is not running")]
    WorkerUnavailable(String),
}

impl BotError {
    /// Errors that only skip the current cycle
    pub fn is_local(&self) -> bool {
        matches!(self, BotError::DataGap { .. } | BotError::Validation(_))
    }
}

/// Result type alias for BotError
pub type Result<T> = std::result::Result<T, BotError>;
