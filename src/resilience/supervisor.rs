use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{
    classify, AuditTrail, CircuitBreaker, CircuitState, Dependency, ErrorKind, ErrorRecord,
    ErrorSeverity, RecoveryAction, RecoveryPlaybook, ResilienceConfig, RetryPolicy,
};
use crate::error::{BotError, Result};
use crate::events::{BotEvent, EventBus};
use crate::execution::gateway::GatewayError;

/// Wraps every external call with timeout, retry, circuit breaking and
/// severity-based escalation
///
/// Shared by all instrument workers through an `Arc`. Breaker state and the
/// audit trail are the only shared mutable state in the core.
pub struct ResilienceSupervisor {
    retry: RetryPolicy,
    call_timeout: Duration,
    playbook: RecoveryPlaybook,
    breakers: HashMap<Dependency, CircuitBreaker>,
    halted: HashMap<Dependency, AtomicBool>,
    audit: Mutex<AuditTrail>,
    events: EventBus,
}

impl ResilienceSupervisor {
    pub fn new(config: ResilienceConfig, events: EventBus) -> Self {
        Self::with_playbook(config, RecoveryPlaybook::default(), events)
    }

    pub fn with_playbook(
        config: ResilienceConfig,
        playbook: RecoveryPlaybook,
        events: EventBus,
    ) -> Self {
        let breakers = Dependency::ALL
            .iter()
            .map(|&dep| (dep, CircuitBreaker::new(dep, config.breaker.clone())))
            .collect();
        let halted = Dependency::ALL
            .iter()
            .map(|&dep| (dep, AtomicBool::new(false)))
            .collect();

        Self {
            retry: config.retry,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            playbook,
            breakers,
            halted,
            audit: Mutex::new(AuditTrail::new(config.audit_capacity)),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn breaker(&self, dependency: Dependency) -> &CircuitBreaker {
        // Every dependency gets a breaker in the constructor
        &self.breakers[&dependency]
    }

    pub fn circuit_state(&self, dependency: Dependency) -> CircuitState {
        self.breaker(dependency).snapshot()
    }

    pub fn is_halted(&self, dependency: Dependency) -> bool {
        self.halted[&dependency].load(Ordering::SeqCst)
    }

    /// Resume a dependency after manual intervention
    pub fn clear_halt(&self, dependency: Dependency) {
        if self.halted[&dependency].swap(false, Ordering::SeqCst) {
            tracing::warn!(dependency = %dependency, "Emergency stop cleared");
            self.breaker(dependency).reset();
        }
    }

    fn audit_trail(&self) -> MutexGuard<'_, AuditTrail> {
        self.audit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record to the audit trail, returning its id
    pub fn record(&self, record: ErrorRecord) -> Uuid {
        let id = record.id;
        self.audit_trail().append(record);
        id
    }

    pub fn audit_records(&self) -> Vec<ErrorRecord> {
        self.audit_trail().records()
    }

    pub fn audit_count(&self, kind: ErrorKind) -> usize {
        self.audit_trail().count_kind(kind)
    }

    /// Call a dependency without a fallback value
    pub async fn call<T, F, Fut>(&self, dependency: Dependency, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, GatewayError>>,
    {
        self.call_with_fallback(dependency, operation, call, || None)
            .await
    }

    /// Call a dependency; `fallback` is consulted when the playbook allows it
    pub async fn call_with_fallback<T, F, Fut, Fb>(
        &self,
        dependency: Dependency,
        operation: &str,
        mut call: F,
        fallback: Fb,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, GatewayError>>,
        Fb: FnOnce() -> Option<T>,
    {
        if self.is_halted(dependency) {
            return Err(BotError::Halted { dependency });
        }

        let breaker = self.breaker(dependency);
        let mut fallback = Some(fallback);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let Some(permit) = breaker.try_acquire() else {
                self.record(ErrorRecord::new(
                    dependency.to_string(),
                    operation,
                    ErrorSeverity::Medium,
                    ErrorKind::DependencyUnavailable,
                    "circuit open, call not attempted",
                ));
                tracing::debug!(dependency = %dependency, operation, "Circuit open, failing fast");
                return Err(BotError::DependencyUnavailable { dependency });
            };

            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(self.call_timeout)),
            };

            let error = match outcome {
                Ok(value) => {
                    permit.succeed();
                    if attempt > 1 {
                        tracing::info!(dependency = %dependency, operation, attempt, "Call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if permit.fail() {
                self.events.publish(BotEvent::CircuitOpened {
                    component: dependency,
                });
            }

            let severity = classify(&error, dependency);
            let actions = self.playbook.actions(severity);
            let kind = if severity == ErrorSeverity::Critical {
                ErrorKind::CriticalFailure
            } else if error.is_transient() {
                ErrorKind::TransientDependencyFailure
            } else {
                ErrorKind::DependencyFailure
            };
            let error_id = self.record(ErrorRecord::new(
                dependency.to_string(),
                operation,
                severity,
                kind,
                format!("attempt {}: {}", attempt, error),
            ));

            if actions.contains(&RecoveryAction::Retry)
                && error.is_transient()
                && self.retry.allows_retry(attempt)
            {
                let delay = self.retry.delay_for(attempt);
                tracing::warn!(
                    dependency = %dependency,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Dependency call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            for action in actions {
                match action {
                    RecoveryAction::Retry => {}
                    RecoveryAction::Fallback => {
                        if let Some(value) = fallback.take().and_then(|fb| fb()) {
                            tracing::warn!(
                                dependency = %dependency,
                                operation,
                                error = %error,
                                "Using fallback value"
                            );
                            return Ok(value);
                        }
                    }
                    RecoveryAction::CircuitBreak => {
                        if breaker.force_open() {
                            self.events.publish(BotEvent::CircuitOpened {
                                component: dependency,
                            });
                        }
                    }
                    RecoveryAction::Restart => {
                        self.events.publish(BotEvent::RestartRequested {
                            component: dependency,
                        });
                    }
                    RecoveryAction::Notify => {
                        tracing::error!(
                            dependency = %dependency,
                            operation,
                            severity = ?severity,
                            error_id = %error_id,
                            error = %error,
                            "Dependency failure escalated"
                        );
                    }
                    RecoveryAction::EmergencyStop => {
                        self.halted[&dependency].store(true, Ordering::SeqCst);
                        tracing::error!(dependency = %dependency, "Emergency stop: new calls halted");
                    }
                    RecoveryAction::ManualIntervention => {
                        self.events.publish(BotEvent::ManualInterventionRequired {
                            component: dependency,
                            error_id,
                        });
                    }
                }
            }

            return Err(match kind {
                ErrorKind::CriticalFailure => BotError::Critical {
                    dependency,
                    error_id,
                    reason: error.to_string(),
                },
                ErrorKind::TransientDependencyFailure => BotError::TransientDependency {
                    dependency,
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: error,
                },
                _ => BotError::DependencyFailure {
                    dependency,
                    operation: operation.to_string(),
                    source: error,
                },
            });
        }
    }
}
