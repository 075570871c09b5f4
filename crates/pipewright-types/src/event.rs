//! Engine events published on the event bus.
//!
//! Consumers (notification collaborators, the audit log, the CLI) subscribe
//! to these; the engine never waits on or depends on a subscriber.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::{Decision, Gap, QualityEvaluation};
use crate::tenant::TenantId;
use crate::workflow::{WorkflowId, WorkflowStatus};

/// Structured, human-readable account of a fatal path or an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    /// Stable error kind (e.g. `resource_budget_exceeded`, `quality_escalation`).
    pub kind: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration_history: Vec<QualityEvaluation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outstanding_gaps: Vec<Gap>,
    pub raised_at: DateTime<Utc>,
}

impl fmt::Display for EscalationPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Workflow {} (tenant {}) needs attention: {}",
            self.workflow_id, self.tenant_id, self.summary
        )?;
        writeln!(f, "  kind: {}", self.kind)?;
        if let Some(details) = &self.details {
            writeln!(f, "  details: {details}")?;
        }
        for eval in &self.iteration_history {
            writeln!(
                f,
                "  iteration {}: score {:.1} -> {}",
                eval.iteration, eval.overall_score, eval.decision
            )?;
        }
        for gap in &self.outstanding_gaps {
            write!(f, "  gap [{:?}] {}: {}", gap.severity, gap.id, gap.description)?;
            match &gap.suggested_fix {
                Some(fix) => writeln!(f, " (fix: {fix})")?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        graph: String,
    },
    StepCompleted {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        graph: String,
        step: String,
        sequence: u64,
        duration_ms: u64,
    },
    StepSkipped {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        graph: String,
        step: String,
        sequence: u64,
    },
    WorkflowSuspended {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        step: String,
        reason: String,
        resume_type: String,
    },
    WorkflowResumed {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        step: String,
        resume_type: String,
        event_id: Uuid,
    },
    GraphCompleted {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        graph: String,
        next_graph: Option<String>,
    },
    WorkflowCompleted {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
    },
    WorkflowFailed {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        payload: EscalationPayload,
    },
    WorkflowCancelled {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
    },
    /// Audit record for one work-unit attempt (retries included).
    UnitInvoked {
        tenant_id: TenantId,
        unit: String,
        attempt: u32,
        duration_ms: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_kind: Option<String>,
        at: DateTime<Utc>,
    },
    WaveCompleted {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        step: String,
        wave: usize,
        succeeded: usize,
        failed: usize,
    },
    IterationDecided {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        step: String,
        iteration: u32,
        score: f64,
        decision: Decision,
    },
    EscalationRaised {
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        iteration_history: Vec<QualityEvaluation>,
        outstanding_gaps: Vec<Gap>,
    },
    BudgetWarning {
        tenant_id: TenantId,
        consumed: f64,
        remaining: f64,
    },
    TenantViolation {
        caller: TenantId,
        owner: TenantId,
        resource: String,
    },
}

impl EngineEvent {
    /// Workflow the event concerns, if any.
    pub fn workflow_id(&self) -> Option<&WorkflowId> {
        match self {
            EngineEvent::WorkflowStarted { workflow_id, .. }
            | EngineEvent::StepCompleted { workflow_id, .. }
            | EngineEvent::StepSkipped { workflow_id, .. }
            | EngineEvent::WorkflowSuspended { workflow_id, .. }
            | EngineEvent::WorkflowResumed { workflow_id, .. }
            | EngineEvent::GraphCompleted { workflow_id, .. }
            | EngineEvent::WorkflowCompleted { workflow_id, .. }
            | EngineEvent::WorkflowFailed { workflow_id, .. }
            | EngineEvent::WorkflowCancelled { workflow_id, .. }
            | EngineEvent::WaveCompleted { workflow_id, .. }
            | EngineEvent::IterationDecided { workflow_id, .. }
            | EngineEvent::EscalationRaised { workflow_id, .. } => Some(workflow_id),
            EngineEvent::UnitInvoked { .. }
            | EngineEvent::BudgetWarning { .. }
            | EngineEvent::TenantViolation { .. } => None,
        }
    }

    /// Status the workflow reached, for events that end a run segment.
    pub fn resulting_status(&self) -> Option<WorkflowStatus> {
        match self {
            EngineEvent::WorkflowSuspended { .. } => Some(WorkflowStatus::Suspended),
            EngineEvent::WorkflowCompleted { .. } => Some(WorkflowStatus::Completed),
            EngineEvent::WorkflowFailed { .. } => Some(WorkflowStatus::Failed),
            EngineEvent::WorkflowCancelled { .. } => Some(WorkflowStatus::Cancelled),
            EngineEvent::EscalationRaised { .. } => Some(WorkflowStatus::Escalated),
            _ => None,
        }
    }
}
