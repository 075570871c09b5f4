//! Fan-out task types: decomposed tasks, execution waves, per-task outcomes
//! and the merged stage result.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Execution status of a decomposed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of work inside a fan-out stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Ids of tasks (in the same decomposition) that must complete first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Opaque per-task input handed to the work unit.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: BTreeSet::new(),
            input: serde_json::Value::Null,
            status: TaskStatus::Pending,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// A wave: task ids with no dependency edges among them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub index: usize,
    pub task_ids: Vec<String>,
}

/// Result of running (or refusing to run) one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TaskOutcome {
    pub fn completed(task_id: impl Into<String>, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// A change a task made to a named resource.
///
/// `start_line`/`end_line` bound an inclusive line range; when both are absent
/// the edit replaces the whole resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEdit {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    pub content: String,
    /// Task that produced the edit; filled in by the merger.
    #[serde(default)]
    pub task_id: String,
}

impl ResourceEdit {
    /// Inclusive line range, or `None` for a whole-resource write.
    pub fn range(&self) -> Option<(u32, u32)> {
        match (self.start_line, self.end_line) {
            (Some(start), Some(end)) => Some((start.min(end), start.max(end))),
            (Some(line), None) | (None, Some(line)) => Some((line, line)),
            (None, None) => None,
        }
    }
}

/// Edits to one resource that could not be combined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub resource: String,
    pub task_ids: Vec<String>,
    pub reason: String,
    /// Every edit involved, so nothing is lost when the conflict is reported.
    pub edits: Vec<ResourceEdit>,
}

/// Fan-in result of a fan-out stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub succeeded: Vec<TaskOutcome>,
    pub failed: Vec<TaskOutcome>,
    /// Merged edits per resource, sorted by start line.
    pub artifacts: BTreeMap<String, Vec<ResourceEdit>>,
    pub conflicts: Vec<MergeConflict>,
    pub conflicted: bool,
}

impl MergedResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Task outputs keyed by task id.
    pub fn outputs(&self) -> BTreeMap<String, serde_json::Value> {
        self.succeeded
            .iter()
            .filter_map(|o| o.output.clone().map(|v| (o.task_id.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_deserializes_with_defaults() {
        let task: Task = serde_json::from_value(json!({
            "id": "b",
            "depends_on": ["a"]
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.depends_on.contains("a"));
        assert!(task.input.is_null());
    }

    #[test]
    fn edit_range_normalises_bounds() {
        let edit = ResourceEdit {
            resource: "src/lib.rs".to_string(),
            start_line: Some(9),
            end_line: Some(3),
            content: String::new(),
            task_id: String::new(),
        };
        assert_eq!(edit.range(), Some((3, 9)));
        let whole = ResourceEdit {
            start_line: None,
            end_line: None,
            ..edit
        };
        assert_eq!(whole.range(), None);
    }

    #[test]
    fn merged_result_outputs_only_successes() {
        let merged = MergedResult {
            succeeded: vec![TaskOutcome::completed("a", json!(1), 3)],
            failed: vec![TaskOutcome::failed("b", "boom", 1)],
            ..Default::default()
        };
        assert_eq!(merged.total(), 2);
        assert_eq!(merged.outputs().len(), 1);
        assert_eq!(merged.outputs()["a"], json!(1));
    }
}
