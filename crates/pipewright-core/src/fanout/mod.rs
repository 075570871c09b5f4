//! Fan-out/fan-in: decompose a work item into dependent tasks, run them in
//! bounded-concurrency waves, and merge their results.

pub mod coordinator;
pub mod decompose;
pub mod merge;
pub mod waves;

pub use coordinator::{Coordinator, GuardedInvoker, StageContext, TaskInvoker, WaveOptions};
pub use decompose::{Decomposer, StaticDecomposer, UnitDecomposer, parse_tasks};
pub use merge::merge;
pub use waves::{plan_waves, validate_tasks};

use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum FanOutError {
    /// Malformed or cyclic task set; nothing was executed.
    #[error("invalid task set: {0}")]
    Validation(String),

    #[error("fan-out stage was cancelled")]
    Cancelled,

    /// A sequencing error (budget, tenant isolation) stopped the whole stage.
    #[error("fan-out stage aborted: {0}")]
    Aborted(Box<EngineError>),
}
