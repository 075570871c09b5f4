//! Decomposition of a work item into tasks.
//!
//! A decomposer produces tasks with dependency sets and validates them before
//! returning, so a cyclic or malformed set never reaches the coordinator.

use std::time::Duration;

use pipewright_types::task::Task;
use serde_json::Value;

use super::FanOutError;
use super::waves::validate_tasks;
use crate::error::EngineError;
use crate::guard::TenantGuard;
use crate::repository::EngineStore;
use crate::unit::UnitExecutor;

/// Produces the task set of a fan-out stage.
pub trait Decomposer: Send + Sync {
    fn decompose(&self, work_item: &Value) -> impl std::future::Future<Output = Result<Vec<Task>, EngineError>> + Send;
}

/// Read the `tasks` array from a work item.
///
/// Accepted shapes: `{"tasks": [...]}`, a bare array, or the iteration
/// wrapper `{"work_item": {"tasks": [...]}, ...}`.
pub fn parse_tasks(work_item: &Value) -> Result<Vec<Task>, FanOutError> {
    let tasks = work_item
        .get("tasks")
        .or_else(|| work_item.get("work_item").and_then(|w| w.get("tasks")))
        .or_else(|| work_item.is_array().then_some(work_item))
        .ok_or_else(|| FanOutError::Validation("work item has no 'tasks' array".to_string()))?;

    let tasks: Vec<Task> =
        serde_json::from_value(tasks.clone()).map_err(|e| FanOutError::Validation(format!("malformed tasks: {e}")))?;
    if tasks.is_empty() {
        return Err(FanOutError::Validation("decomposition produced no tasks".to_string()));
    }
    validate_tasks(&tasks)?;
    Ok(tasks)
}

/// Tasks come with the work item.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDecomposer;

impl Decomposer for StaticDecomposer {
    async fn decompose(&self, work_item: &Value) -> Result<Vec<Task>, EngineError> {
        Ok(parse_tasks(work_item)?)
    }
}

/// Tasks come from a planner work unit whose output carries a `tasks` array.
pub struct UnitDecomposer<'a, S> {
    pub guard: &'a TenantGuard<S>,
    pub executor: &'a UnitExecutor,
    pub unit: &'a str,
    pub timeout: Duration,
}

impl<S: EngineStore> Decomposer for UnitDecomposer<'_, S> {
    async fn decompose(&self, work_item: &Value) -> Result<Vec<Task>, EngineError> {
        let report = self
            .guard
            .execute(self.executor, self.unit, work_item.clone(), self.timeout)
            .await?;
        tracing::debug!(unit = self.unit, attempts = report.attempts, "planner produced decomposition");
        Ok(parse_tasks(&report.output)?)
    }
}
