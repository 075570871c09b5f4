//! In-flight state of one graph segment.

use pipewright_types::checkpoint::{Checkpoint, ExecutionState};
use pipewright_types::quality::{Gap, QualityEvaluation};
use pipewright_types::workflow::WorkflowId;
use serde_json::Value;
use uuid::Uuid;

/// Execution state plus what the next checkpoint write must reference.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRun {
    pub workflow_id: WorkflowId,
    pub state: ExecutionState,
    /// Currently Active checkpoint; the next write must name it.
    pub active: Option<Uuid>,
    pub next_sequence: u64,
    /// Resume event applied to `state` but not yet made durable. The next
    /// write supersedes `active` as Resumed by this id.
    pub pending_resume: Option<Uuid>,
}

impl GraphRun {
    /// First graph of a fresh workflow.
    pub fn start(workflow_id: WorkflowId, graph: &str, input: Value) -> Self {
        Self {
            workflow_id,
            state: ExecutionState::new(graph, input),
            active: None,
            next_sequence: 1,
            pending_resume: None,
        }
    }

    /// Continue from a persisted checkpoint.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            workflow_id: checkpoint.workflow_id.clone(),
            state: checkpoint.state.clone(),
            active: Some(checkpoint.id),
            next_sequence: checkpoint.sequence + 1,
            pending_resume: None,
        }
    }

    /// Next graph of the sequence. The previous graph's output becomes the
    /// input; sequence numbering and the Active pointer carry over.
    pub fn chain(self, graph: &str, input: Value) -> Self {
        Self {
            state: ExecutionState {
                consumed: self.state.consumed,
                ..ExecutionState::new(graph, input)
            },
            ..self
        }
    }

    pub fn graph(&self) -> &str {
        &self.state.graph
    }
}

/// How a graph segment ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOutcome {
    /// Every step ran; `output` is the last step's output.
    Completed { output: Value },
    /// Waiting for an external event.
    Suspended {
        step: String,
        reason: String,
        resume_type: String,
    },
    /// The quality gate escalated; waiting for `retry` or `force-approve`.
    Escalated {
        step: String,
        history: Vec<QualityEvaluation>,
        gaps: Vec<Gap>,
    },
    /// The resume event was already applied; nothing ran.
    Duplicate,
}
