//! Checkpoint types.
//!
//! A `Checkpoint` is the immutable snapshot written after each step. The
//! persisted form, `CheckpointRecord`, carries the execution state as an
//! encoded, versioned blob plus its digest; decoding lives in
//! `pipewright-core::checkpoint::codec`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::QualityEvaluation;
use crate::tenant::TenantId;
use crate::workflow::WorkflowId;

/// Checkpoint lifecycle. Exactly one checkpoint per workflow is Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// The current resumption point.
    Active,
    /// Consumed by a resume event.
    Resumed,
    /// Superseded by the next step's checkpoint.
    Expired,
    /// Final checkpoint of a cancelled workflow.
    Cancelled,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointStatus::Active => write!(f, "active"),
            CheckpointStatus::Resumed => write!(f, "resumed"),
            CheckpointStatus::Expired => write!(f, "expired"),
            CheckpointStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CheckpointStatus::Active),
            "resumed" => Ok(CheckpointStatus::Resumed),
            "expired" => Ok(CheckpointStatus::Expired),
            "cancelled" => Ok(CheckpointStatus::Cancelled),
            other => Err(format!("invalid checkpoint status: '{other}'")),
        }
    }
}

/// Why a workflow is waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspensionKind {
    /// Waiting for an external event of the given type.
    AwaitingInput { resume_type: String },
    /// The quality gate escalated; waiting for `retry` or `force-approve`.
    Escalated,
}

/// Marker stored in the checkpoint of a suspended step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub step: String,
    pub reason: String,
    #[serde(flatten)]
    pub kind: SuspensionKind,
}

impl Suspension {
    /// The resume type that releases an awaiting-input suspension.
    pub fn expected_resume_type(&self) -> Option<&str> {
        match &self.kind {
            SuspensionKind::AwaitingInput { resume_type } => Some(resume_type),
            SuspensionKind::Escalated => None,
        }
    }
}

/// Progress of an iteration-controlled step, kept when it escalates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationLedger {
    /// Number of attempts scored so far.
    pub iteration: u32,
    pub history: Vec<QualityEvaluation>,
    /// Output of the most recent attempt.
    #[serde(default)]
    pub last_attempt: serde_json::Value,
}

/// Everything needed to continue a graph from a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub graph: String,
    /// Index of the next step to run.
    pub next_step: usize,
    /// Input the graph started with.
    pub input: serde_json::Value,
    /// Output of the most recent step (input of the next one).
    pub last_output: serde_json::Value,
    /// Outputs keyed by step name.
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationLedger>,
    /// Resources consumed by this workflow so far.
    #[serde(default)]
    pub consumed: f64,
}

impl ExecutionState {
    pub fn new(graph: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            graph: graph.into(),
            next_step: 0,
            last_output: input.clone(),
            input,
            outputs: BTreeMap::new(),
            suspension: None,
            iteration: None,
            consumed: 0.0,
        }
    }
}

/// Decoded checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub graph: String,
    pub step: String,
    pub step_index: usize,
    /// Monotonic and gapless per (tenant, workflow), starting at 1.
    pub sequence: u64,
    pub status: CheckpointStatus,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    /// Id of the resume event that consumed this checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_by: Option<Uuid>,
}

impl Checkpoint {
    pub fn is_suspended(&self) -> bool {
        self.state.suspension.is_some()
    }
}

/// Persisted checkpoint: metadata plus the encoded state blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub graph: String,
    pub step: String,
    pub step_index: usize,
    pub sequence: u64,
    pub status: CheckpointStatus,
    pub schema_version: u32,
    /// Encoded `ExecutionState` envelope.
    pub state: String,
    /// Hex SHA-256 of `state`.
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub resumed_by: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkpoint_status_parses() {
        assert_eq!("active".parse::<CheckpointStatus>().unwrap(), CheckpointStatus::Active);
        assert_eq!(CheckpointStatus::Resumed.to_string(), "resumed");
        assert!("Active".parse::<CheckpointStatus>().is_err());
    }

    #[test]
    fn suspension_exposes_expected_type() {
        let s = Suspension {
            step: "clarify".to_string(),
            reason: "awaiting_answer".to_string(),
            kind: SuspensionKind::AwaitingInput {
                resume_type: "answer".to_string(),
            },
        };
        assert_eq!(s.expected_resume_type(), Some("answer"));

        let encoded = serde_json::to_value(&s).unwrap();
        assert_eq!(encoded["kind"], "awaiting_input");
        assert_eq!(encoded["resume_type"], "answer");
    }

    #[test]
    fn new_state_feeds_input_to_first_step() {
        let state = ExecutionState::new("intake", json!({"ticket": 7}));
        assert_eq!(state.next_step, 0);
        assert_eq!(state.last_output, json!({"ticket": 7}));
        assert!(state.suspension.is_none());
    }
}
