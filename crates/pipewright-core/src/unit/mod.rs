//! Work units: the capability trait, its registry and the retrying executor.

pub mod box_unit;
pub mod builtin;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod work_unit;

pub use box_unit::BoxWorkUnit;
pub use builtin::{EchoUnit, FnUnit};
pub use executor::{ExecutionError, UnitExecutor, UnitReport};
pub use registry::UnitRegistry;
pub use retry::RetryPolicy;
pub use work_unit::{UnitFailure, UnitOutput, UnitRequest, WorkUnit};
