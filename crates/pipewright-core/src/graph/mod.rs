//! Graph engine: checkpointed execution of an ordered list of steps with
//! suspend/resume.

pub mod catalog;
pub mod condition;
pub mod definition;
pub mod engine;
pub mod run;

pub use catalog::GraphCatalog;
pub use condition::ConditionEvaluator;
pub use definition::{parse_graph_yaml, serialize_graph_yaml, validate_graph};
pub use engine::{GraphEngine, halted_outcome};
pub use run::{GraphOutcome, GraphRun};

use thiserror::Error;

/// Errors in graph definitions and their evaluation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid graph: {0}")]
    Invalid(String),

    #[error("unknown graph '{0}'")]
    UnknownGraph(String),

    #[error("condition on step '{step}' failed: {message}")]
    Condition { step: String, message: String },
}
