//! Workflow domain types.
//!
//! A `WorkflowInstance` is one pipeline run for one external trigger. It moves
//! through a tenant-configured sequence of graphs; each `GraphDefinition` is an
//! ordered list of steps. Graph definitions are authored as YAML and parsed in
//! `pipewright-core::graph::definition`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;

/// Resume type that restarts an escalated step with a fresh iteration budget.
pub const RESUME_RETRY: &str = "retry";

/// Resume type that accepts the last attempt of an escalated step as approved.
pub const RESUME_FORCE_APPROVE: &str = "force-approve";

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

/// External workflow key (e.g. a ticket number). Unique only within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("workflow id must not be empty".to_string());
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Suspended,
    Escalated,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Completed, Failed and Cancelled instances never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Suspended => write!(f, "suspended"),
            WorkflowStatus::Escalated => write!(f, "escalated"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(WorkflowStatus::Running),
            "suspended" => Ok(WorkflowStatus::Suspended),
            "escalated" => Ok(WorkflowStatus::Escalated),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

/// One running pipeline for one external trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub tenant_id: TenantId,
    /// Name of the graph currently owning the instance.
    pub graph: String,
    /// Position of `graph` in the tenant's graph sequence.
    pub graph_index: usize,
    pub status: WorkflowStatus,
    /// Trigger payload the first graph started from.
    pub input: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        id: WorkflowId,
        tenant_id: TenantId,
        graph: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id,
            graph: graph.into(),
            graph_index: 0,
            status: WorkflowStatus::Running,
            input,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Graph definition
// ---------------------------------------------------------------------------

/// An ordered, optionally conditional, sequence of steps for one workflow phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl GraphDefinition {
    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }
}

/// A single named step in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the graph; also the key for the step's output.
    pub name: String,
    /// Optional JEXL expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A single work-unit invocation.
    Unit {
        unit: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// Decompose the input into tasks, run them in waves, merge the results.
    FanOut { decompose: Decompose, unit: String },
    /// Repeat an attempt until the quality gate approves or escalates.
    Iterate {
        attempt: Attempt,
        /// Unit returning `{dimensions, gaps}`; built-in measurement when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scorer: Option<String>,
    },
    /// Suspend until an external event of `resume_type` arrives.
    Await { resume_type: String, reason: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Unit { .. } => "unit",
            StepKind::FanOut { .. } => "fan_out",
            StepKind::Iterate { .. } => "iterate",
            StepKind::Await { .. } => "await",
        }
    }
}

/// How a fan-out stage obtains its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Decompose {
    /// Read the `tasks` array from the work item.
    Static,
    /// Ask a planner unit; its output must contain a `tasks` array.
    Unit { unit: String },
}

/// The body of an iteration-controlled stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attempt {
    Unit { unit: String },
    FanOut { decompose: Decompose, unit: String },
}

// ---------------------------------------------------------------------------
// Resume events
// ---------------------------------------------------------------------------

/// Inbound external event addressed to a suspended or escalated workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeEvent {
    /// Delivery id; a second delivery with the same id is a no-op.
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub resume_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResumeEvent {
    pub fn new(workflow_id: WorkflowId, resume_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            resume_type: resume_type.into(),
            payload,
        }
    }

    /// True for the human actions addressed to escalated workflows.
    pub fn is_escalation_action(&self) -> bool {
        self.resume_type == RESUME_RETRY || self.resume_type == RESUME_FORCE_APPROVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_status_round_trips_through_str() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Suspended,
            WorkflowStatus::Escalated,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<WorkflowStatus>().unwrap(), status);
        }
        assert!("paused".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Suspended.is_terminal());
        assert!(!WorkflowStatus::Escalated.is_terminal());
    }

    #[test]
    fn step_kind_deserializes_flattened() {
        let step: StepDefinition = serde_json::from_value(json!({
            "name": "plan",
            "type": "fan_out",
            "decompose": { "strategy": "unit", "unit": "planner" },
            "unit": "coder"
        }))
        .unwrap();
        assert_eq!(step.name, "plan");
        assert_eq!(
            step.kind,
            StepKind::FanOut {
                decompose: Decompose::Unit {
                    unit: "planner".to_string()
                },
                unit: "coder".to_string(),
            }
        );
    }

    #[test]
    fn await_step_with_condition() {
        let step: StepDefinition = serde_json::from_value(json!({
            "name": "clarify",
            "when": "last.questions|length > 0",
            "type": "await",
            "resume_type": "answer",
            "reason": "awaiting_answer"
        }))
        .unwrap();
        assert_eq!(step.kind.label(), "await");
        assert_eq!(step.when.as_deref(), Some("last.questions|length > 0"));
    }

    #[test]
    fn escalation_actions_are_recognised() {
        let wf = WorkflowId::new("W1").unwrap();
        assert!(ResumeEvent::new(wf.clone(), "retry", json!(null)).is_escalation_action());
        assert!(ResumeEvent::new(wf.clone(), "force-approve", json!(null)).is_escalation_action());
        assert!(!ResumeEvent::new(wf, "answer", json!(null)).is_escalation_action());
    }
}
