//! Failure isolation for external dependencies
//!
//! Every gateway and data-feed call goes through the [`ResilienceSupervisor`]:
//! a circuit breaker per dependency, retries with capped exponential
//! backoff, and a severity-driven recovery playbook.

pub mod audit;
pub mod circuit_breaker;
pub mod retry;
pub mod supervisor;

pub use audit::{AuditTrail, ErrorKind, ErrorRecord};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;
pub use supervisor::ResilienceSupervisor;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::execution::gateway::GatewayError;

/// External systems the core depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    ExecutionGateway,
    MarketData,
}

impl Dependency {
    pub const ALL: [Dependency; 2] = [Dependency::ExecutionGateway, Dependency::MarketData];
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::ExecutionGateway => write!(f, "execution-gateway"),
            Dependency::MarketData => write!(f, "market-data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryAction {
    Retry,
    Fallback,
    CircuitBreak,
    Restart,
    Notify,
    EmergencyStop,
    ManualIntervention,
}

/// Ordered recovery actions per severity
#[derive(Debug, Clone)]
pub struct RecoveryPlaybook {
    actions: HashMap<ErrorSeverity, Vec<RecoveryAction>>,
}

impl RecoveryPlaybook {
    pub fn new(actions: HashMap<ErrorSeverity, Vec<RecoveryAction>>) -> Self {
        Self { actions }
    }

    pub fn actions(&self, severity: ErrorSeverity) -> &[RecoveryAction] {
        self.actions
            .get(&severity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for RecoveryPlaybook {
    fn default() -> Self {
        use RecoveryAction::*;

        let mut actions = HashMap::new();
        actions.insert(ErrorSeverity::Low, vec![Retry]);
        actions.insert(ErrorSeverity::Medium, vec![Retry, Fallback]);
        actions.insert(
            ErrorSeverity::High,
            vec![Retry, Fallback, CircuitBreak, Restart, Notify],
        );
        actions.insert(
            ErrorSeverity::Critical,
            vec![Notify, EmergencyStop, ManualIntervention],
        );
        Self { actions }
    }
}

/// Severity of a dependency failure
///
/// Losing order-routing connectivity is worse than losing a data poll, and
/// credential failures are always critical.
pub fn classify(error: &GatewayError, dependency: Dependency) -> ErrorSeverity {
    match error {
        GatewayError::Authentication(_) | GatewayError::Authorization(_) => {
            ErrorSeverity::Critical
        }
        GatewayError::Timeout(_) | GatewayError::Connection(_) => match dependency {
            Dependency::ExecutionGateway => ErrorSeverity::High,
            Dependency::MarketData => ErrorSeverity::Medium,
        },
        GatewayError::RateLimited(_) => ErrorSeverity::Low,
        GatewayError::Venue(_) | GatewayError::Rejected(_) | GatewayError::UnknownOrder(_) => {
            ErrorSeverity::Medium
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    /// Upper bound on any single dependency call
    pub call_timeout_ms: u64,
    /// Error records kept in the audit ring
    pub audit_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout_ms: 5_000,
            audit_capacity: 1_000,
        }
    }
}
