//! Retrying, deadline-bounded work-unit executor.
//!
//! Every attempt runs under its own `tokio::time::timeout`. Timeouts and
//! transient failures are retried with exponential backoff; permanent
//! failures are returned immediately. Each attempt, retries included, leaves
//! an audit record: a `unit_invoked` event on the bus and a tracing record on
//! the `pipewright::audit` target.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipewright_types::event::EngineEvent;
use pipewright_types::tenant::TenantId;
use tokio::time::Instant;

use super::registry::UnitRegistry;
use super::retry::RetryPolicy;
use super::work_unit::{UnitFailure, UnitOutput, UnitRequest};
use crate::event::bus::EventBus;

/// Successful execution, after any retries.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub output: serde_json::Value,
    pub attempts: u32,
    /// Resources consumed across all attempts.
    pub consumed: f64,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("unknown work unit '{0}'")]
    UnknownUnit(String),

    #[error("work unit '{unit}' failed after {attempts} attempt(s): {message}")]
    Transient {
        unit: String,
        attempts: u32,
        message: String,
        consumed: f64,
    },

    #[error("work unit '{unit}' failed ({failure_kind}): {message}")]
    Permanent {
        unit: String,
        failure_kind: String,
        message: String,
        consumed: f64,
    },
}

impl ExecutionError {
    /// Resources spent on the failed attempts.
    pub fn consumed(&self) -> f64 {
        match self {
            ExecutionError::UnknownUnit(_) => 0.0,
            ExecutionError::Transient { consumed, .. } | ExecutionError::Permanent { consumed, .. } => *consumed,
        }
    }
}

/// Executes registered work units. Cheap to clone.
#[derive(Clone)]
pub struct UnitExecutor {
    registry: Arc<UnitRegistry>,
    events: EventBus,
    default_cost: f64,
}

impl UnitExecutor {
    pub fn new(registry: Arc<UnitRegistry>, events: EventBus, default_cost: f64) -> Self {
        Self {
            registry,
            events,
            default_cost,
        }
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Per-attempt deadline: the step's own setting, else the unit's
    /// registered timeout, else the tenant default.
    pub fn timeout_for(&self, unit: &str, step_override: Option<u64>, default: Duration) -> Duration {
        step_override
            .map(Duration::from_secs)
            .or_else(|| self.registry.timeout_for(unit))
            .unwrap_or(default)
    }

    pub async fn execute(
        &self,
        tenant: &TenantId,
        unit: &str,
        input: serde_json::Value,
        timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<UnitReport, ExecutionError> {
        let target = self
            .registry
            .get(unit)
            .ok_or_else(|| ExecutionError::UnknownUnit(unit.to_string()))?;

        let started = Instant::now();
        let mut consumed = 0.0;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let request = UnitRequest {
                tenant_id: tenant.clone(),
                unit: unit.to_string(),
                input: input.clone(),
                attempt,
                timeout,
            };

            let attempt_started = Instant::now();
            let result = match tokio::time::timeout(timeout, target.execute(&request)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(UnitFailure::transient(
                    "timeout",
                    format!("no response within {} ms", timeout.as_millis()),
                )),
            };
            let duration_ms = attempt_started.elapsed().as_millis() as u64;
            self.audit(tenant, unit, attempt, duration_ms, &result);

            match result {
                Ok(UnitOutput { output, usage }) => {
                    consumed += usage.unwrap_or(self.default_cost);
                    return Ok(UnitReport {
                        output,
                        attempts: attempt,
                        consumed,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(failure) => {
                    consumed += self.default_cost;

                    if !failure.retryable {
                        return Err(ExecutionError::Permanent {
                            unit: unit.to_string(),
                            failure_kind: failure.failure_kind,
                            message: failure.message,
                            consumed,
                        });
                    }

                    if !retry.should_retry(attempt) {
                        tracing::error!(
                            tenant = %tenant,
                            unit,
                            attempts = attempt,
                            error = %failure,
                            "work unit retries exhausted"
                        );
                        return Err(ExecutionError::Transient {
                            unit: unit.to_string(),
                            attempts: attempt,
                            message: failure.to_string(),
                            consumed,
                        });
                    }

                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        tenant = %tenant,
                        unit,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "work unit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn audit(
        &self,
        tenant: &TenantId,
        unit: &str,
        attempt: u32,
        duration_ms: u64,
        result: &Result<UnitOutput, UnitFailure>,
    ) {
        let failure_kind = result.as_ref().err().map(|f| f.failure_kind.clone());
        tracing::info!(
            target: "pipewright::audit",
            tenant = %tenant,
            unit,
            attempt,
            duration_ms,
            success = result.is_ok(),
            failure_kind = failure_kind.as_deref().unwrap_or(""),
            "unit invoked"
        );
        self.events.publish(EngineEvent::UnitInvoked {
            tenant_id: tenant.clone(),
            unit: unit.to_string(),
            attempt,
            duration_ms,
            success: result.is_ok(),
            failure_kind,
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for UnitExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitExecutor")
            .field("registry", &self.registry)
            .field("default_cost", &self.default_cost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::builtin::{EchoUnit, FnUnit};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    fn executor(registry: UnitRegistry, bus: &EventBus) -> UnitExecutor {
        UnitExecutor::new(Arc::new(registry), bus.clone(), 1.0)
    }

    /// Fails transiently `failures` times, then succeeds.
    fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>) -> FnUnit {
        FnUnit::new(name, move |req: UnitRequest| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(UnitFailure::transient("network", "connection reset"))
                } else {
                    Ok(UnitOutput::new(req.input).with_usage(2.0))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = UnitRegistry::new();
        registry.register(flaky("flaky", 2, Arc::clone(&calls)));
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let report = executor(registry, &bus)
            .execute(&tenant(), "flaky", json!({"x": 1}), Duration::from_secs(5), &policy(3))
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.output, json!({"x": 1}));
        // Two failed attempts at the default cost plus the reported usage.
        assert!((report.consumed - 4.0).abs() < 1e-9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut audit = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::UnitInvoked { attempt, success, .. } = event {
                audit.push((attempt, success));
            }
        }
        assert_eq!(audit, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = UnitRegistry::new();
        registry.register(flaky("down", u32::MAX, Arc::clone(&calls)));
        let bus = EventBus::new(16);

        let err = executor(registry, &bus)
            .execute(&tenant(), "down", json!(null), Duration::from_secs(5), &policy(3))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Transient { attempts: 3, .. }));
        assert!((err.consumed() - 3.0).abs() < 1e-9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = UnitRegistry::new();
        registry.register(FnUnit::new("strict", move |_req: UnitRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(UnitFailure::permanent("invalid_input", "missing field"))
            }
        }));
        let bus = EventBus::new(16);

        let err = executor(registry, &bus)
            .execute(&tenant(), "strict", json!({}), Duration::from_secs(5), &policy(5))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Permanent { ref failure_kind, .. } if failure_kind == "invalid_input"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_and_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = UnitRegistry::new();
        registry.register(FnUnit::new("sleepy", move |req: UnitRequest| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(UnitOutput::new(req.input))
            }
        }));
        let bus = EventBus::new(16);

        let report = executor(registry, &bus)
            .execute(&tenant(), "sleepy", json!(7), Duration::from_secs(1), &policy(2))
            .await
            .unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.output, json!(7));
    }

    #[tokio::test]
    async fn unknown_unit_is_rejected() {
        let bus = EventBus::new(4);
        let err = executor(UnitRegistry::new(), &bus)
            .execute(&tenant(), "ghost", json!(null), Duration::from_secs(1), &policy(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownUnit(_)));
    }

    #[test]
    fn timeout_resolution_order() {
        let mut registry = UnitRegistry::new();
        registry.register_with_timeout(EchoUnit::new("slow"), Duration::from_secs(30));
        registry.register(EchoUnit::new("fast"));
        let exec = executor(registry, &EventBus::new(4));
        let default = Duration::from_secs(120);

        assert_eq!(exec.timeout_for("slow", Some(5), default), Duration::from_secs(5));
        assert_eq!(exec.timeout_for("slow", None, default), Duration::from_secs(30));
        assert_eq!(exec.timeout_for("fast", None, default), default);
    }
}
