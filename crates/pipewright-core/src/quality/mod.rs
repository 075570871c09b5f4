//! Quality gate: scoring attempts, deciding approve / iterate / escalate, and
//! building feedback for the next attempt.

pub mod controller;
pub mod feedback;
pub mod measure;
pub mod scorer;

pub use controller::{ControllerError, ControllerState, IterationController, decide};
pub use feedback::{attempt_input, build_feedback, prioritize};
pub use measure::{combine, measure_merged, measure_unit_output, parse_measurement};
pub use scorer::QualityScorer;
