use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::TradeSide;

/// Failures reported by an external dependency
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("venue error: {0}")]
    Venue(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not authorized: {0}")]
    Authorization(String),
}

impl GatewayError {
    /// Whether repeating the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_)
                | GatewayError::Connection(_)
                | GatewayError::RateLimited(_)
                | GatewayError::Venue(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            GatewayError::Authentication(_) | GatewayError::Authorization(_)
        )
    }
}

/// Market order with attached stop and target
///
/// `client_order_id` stays the same across retries so the venue can
/// deduplicate a resubmitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: Uuid,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: f64,
    pub price: f64,
    pub stop: f64,
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub accepted: bool,
    pub order_id: String,
    pub filled_price: f64,
}

/// Execution venue
///
/// Implementations are shared between instrument workers and must be
/// safe to call concurrently.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn account_equity(&self) -> Result<f64, GatewayError>;

    /// Move the protective stop of an open order
    async fn modify_stop(&self, order_id: &str, new_stop: f64) -> Result<bool, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(GatewayError::Connection("reset".into()).is_transient());
        assert!(!GatewayError::Rejected("invalid stops".into()).is_transient());
        assert!(!GatewayError::Authentication("expired".into()).is_transient());
        assert!(GatewayError::Authorization("revoked".into()).is_auth());
    }
}
