//! Engine error taxonomy.
//!
//! Component errors (`ExecutionError`, `FanOutError`, `ControllerError`,
//! `GraphError`, `CheckpointError`, `RepositoryError`) convert into
//! [`EngineError`], which is what the graph engine and orchestrator speak.

use chrono::Utc;
use pipewright_types::error::RepositoryError;
use pipewright_types::event::EscalationPayload;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::WorkflowId;
use uuid::Uuid;

use crate::checkpoint::CheckpointError;
use crate::fanout::FanOutError;
use crate::graph::GraphError;
use crate::quality::ControllerError;
use crate::unit::ExecutionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Retries exhausted on a timeout or transient failure.
    #[error("work unit '{unit}' failed after {attempts} attempt(s): {message}")]
    TransientExecution {
        unit: String,
        attempts: u32,
        message: String,
    },

    /// The work unit reported a failure that retrying cannot fix.
    #[error("work unit '{unit}' failed ({failure_kind}): {message}")]
    UnitFailed {
        unit: String,
        failure_kind: String,
        message: String,
    },

    /// Malformed graph or task set (cycles, unknown units, bad definitions).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Recorded as the reason of an escalation; never surfaced as a failure.
    #[error("quality score {score:.1} is below threshold {threshold:.1}")]
    QualityThresholdNotMet { score: f64, threshold: f64 },

    #[error("tenant '{tenant}' has exhausted its resource budget (remaining {remaining:.2})")]
    ResourceBudgetExceeded { tenant: String, remaining: f64 },

    #[error("tenant '{caller}' may not access {resource} owned by another tenant")]
    TenantIsolationViolation {
        caller: String,
        owner: String,
        resource: String,
    },

    #[error("checkpoint {checkpoint_id} is corrupt: {reason}")]
    CheckpointCorruption { checkpoint_id: Uuid, reason: String },

    #[error("invalid resume: {reason}")]
    InvalidResume {
        expected: Option<String>,
        received: String,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    /// Another writer advanced the workflow first.
    #[error("stale checkpoint write: expected active {expected}, found {actual}")]
    StaleWrite { expected: String, actual: String },

    #[error("workflow was cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
}

impl EngineError {
    /// Stable snake_case identifier used in payloads and API error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::TransientExecution { .. } => "transient_execution",
            EngineError::UnitFailed { .. } => "unit_failed",
            EngineError::Validation(_) => "validation",
            EngineError::QualityThresholdNotMet { .. } => "quality_threshold_not_met",
            EngineError::ResourceBudgetExceeded { .. } => "resource_budget_exceeded",
            EngineError::TenantIsolationViolation { .. } => "tenant_isolation_violation",
            EngineError::CheckpointCorruption { .. } => "checkpoint_corruption",
            EngineError::InvalidResume { .. } => "invalid_resume",
            EngineError::Storage(_) => "storage",
            EngineError::StaleWrite { .. } => "stale_write",
            EngineError::Cancelled => "cancelled",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unrecoverable(_) => "unrecoverable",
        }
    }

    /// Errors that end the workflow as Failed.
    ///
    /// Everything else either rejects the request and leaves the workflow
    /// untouched (invalid resume, not found, conflict) or leaves it Running so
    /// `recover` can continue it (storage, stale write).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::TransientExecution { .. }
                | EngineError::UnitFailed { .. }
                | EngineError::Validation(_)
                | EngineError::ResourceBudgetExceeded { .. }
                | EngineError::TenantIsolationViolation { .. }
                | EngineError::CheckpointCorruption { .. }
                | EngineError::Unrecoverable(_)
        )
    }

    /// Structured account of a fatal path, for humans and notifiers.
    pub fn escalation_payload(&self, tenant: &TenantId, workflow: &WorkflowId) -> EscalationPayload {
        let details = match self {
            EngineError::TransientExecution { unit, .. } => Some(format!(
                "check that work unit '{unit}' is reachable, then start the workflow again"
            )),
            EngineError::ResourceBudgetExceeded { .. } => {
                Some("raise the tenant budget before starting further work".to_string())
            }
            EngineError::TenantIsolationViolation { .. } => {
                Some("the request was aborted and no data was returned".to_string())
            }
            EngineError::CheckpointCorruption { checkpoint_id, .. } => Some(format!(
                "checkpoint {checkpoint_id} failed verification; manual intervention is required"
            )),
            EngineError::Validation(_) => Some("no task of the failing stage was executed".to_string()),
            _ => None,
        };

        EscalationPayload {
            workflow_id: workflow.clone(),
            tenant_id: tenant.clone(),
            kind: self.kind().to_string(),
            summary: self.to_string(),
            details,
            iteration_history: Vec::new(),
            outstanding_gaps: Vec::new(),
            raised_at: Utc::now(),
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::TenantIsolation {
                caller,
                owner,
                resource,
            } => EngineError::TenantIsolationViolation {
                caller,
                owner,
                resource,
            },
            RepositoryError::StaleWrite { expected, actual } => EngineError::StaleWrite { expected, actual },
            RepositoryError::NotFound => EngineError::NotFound("record".to_string()),
            RepositoryError::Conflict(msg) => EngineError::Conflict(msg),
            RepositoryError::Connection => EngineError::Storage("database connection error".to_string()),
            RepositoryError::Query(msg) => EngineError::Storage(msg),
        }
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Repository(e) => e.into(),
            CheckpointError::Corrupt { checkpoint_id, source } => EngineError::CheckpointCorruption {
                checkpoint_id,
                reason: source.to_string(),
            },
        }
    }
}

impl From<ExecutionError> for EngineError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::UnknownUnit(name) => EngineError::Validation(format!("unknown work unit '{name}'")),
            ExecutionError::Transient {
                unit,
                attempts,
                message,
                ..
            } => EngineError::TransientExecution {
                unit,
                attempts,
                message,
            },
            ExecutionError::Permanent {
                unit,
                failure_kind,
                message,
                ..
            } => EngineError::UnitFailed {
                unit,
                failure_kind,
                message,
            },
        }
    }
}

impl From<FanOutError> for EngineError {
    fn from(err: FanOutError) -> Self {
        match err {
            FanOutError::Validation(msg) => EngineError::Validation(msg),
            FanOutError::Cancelled => EngineError::Cancelled,
            FanOutError::Aborted(inner) => *inner,
        }
    }
}

impl From<ControllerError> for EngineError {
    fn from(err: ControllerError) -> Self {
        EngineError::Unrecoverable(err.to_string())
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        EngineError::Validation(err.to_string())
    }
}
