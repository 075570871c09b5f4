//! Measurements of attempt results.

use pipewright_types::quality::{Gap, Measurement, Severity};
use pipewright_types::task::MergedResult;
use serde_json::Value;

/// Built-in measurement of a fan-out attempt.
///
/// `completeness` is the share of tasks that succeeded, `consistency` is 100
/// unless the merge left conflicts. Each failed task and each conflict becomes
/// a retryable gap.
pub fn measure_merged(merged: &MergedResult) -> Measurement {
    let total = merged.total();
    let completeness = if total == 0 {
        None
    } else {
        Some(100.0 * merged.succeeded.len() as f64 / total as f64)
    };
    let consistency = if merged.conflicted { 0.0 } else { 100.0 };

    let mut gaps = Vec::new();
    for failed in &merged.failed {
        let reason = failed.error.as_deref().unwrap_or("unknown failure");
        gaps.push(
            Gap::new(
                format!("task-failed:{}", failed.task_id),
                Severity::High,
                format!("task '{}' failed: {reason}", failed.task_id),
            )
            .with_fix(format!("re-run task '{}' and address: {reason}", failed.task_id)),
        );
    }
    for conflict in &merged.conflicts {
        gaps.push(
            Gap::new(
                format!("merge-conflict:{}", conflict.resource),
                Severity::High,
                format!(
                    "tasks {} made conflicting changes to '{}': {}",
                    conflict.task_ids.join(", "),
                    conflict.resource,
                    conflict.reason
                ),
            )
            .with_fix(format!("coordinate edits to '{}' so they do not overlap", conflict.resource)),
        );
    }

    Measurement {
        dimensions: [
            ("completeness".to_string(), completeness),
            ("consistency".to_string(), Some(consistency)),
        ]
        .into_iter()
        .collect(),
        gaps,
    }
}

/// Built-in measurement of a single-unit attempt: the unit either reported a
/// measurement alongside its output or is treated as fully complete. A
/// reported measurement that does not parse is an error.
pub fn measure_unit_output(output: &Value) -> Result<Measurement, serde_json::Error> {
    if let Some(reported) = output.get("measurement") {
        return parse_measurement(reported);
    }
    Ok(Measurement {
        dimensions: [
            ("completeness".to_string(), Some(100.0)),
            ("consistency".to_string(), Some(100.0)),
        ]
        .into_iter()
        .collect(),
        gaps: Vec::new(),
    })
}

/// Parse a scorer unit's `{dimensions, gaps}` output.
pub fn parse_measurement(value: &Value) -> Result<Measurement, serde_json::Error> {
    serde_json::from_value(value.clone())
}

/// Overlay a scorer's measurement on the built-in one: the scorer's
/// dimensions win, its gaps are appended.
pub fn combine(mut base: Measurement, scorer: Measurement) -> Measurement {
    base.dimensions.extend(scorer.dimensions);
    base.gaps.extend(scorer.gaps);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::merge;
    use pipewright_types::task::TaskOutcome;
    use serde_json::json;

    #[test]
    fn one_failure_in_five_lowers_completeness() {
        let mut outcomes: Vec<TaskOutcome> = (1..=4)
            .map(|i| TaskOutcome::completed(format!("t{i}"), json!("ok"), 1))
            .collect();
        outcomes.push(TaskOutcome::failed("t5", "wave timed out", 1));
        let m = measure_merged(&merge(outcomes));

        assert_eq!(m.dimensions["completeness"], Some(80.0));
        assert_eq!(m.dimensions["consistency"], Some(100.0));
        assert_eq!(m.gaps.len(), 1);
        assert_eq!(m.gaps[0].id, "task-failed:t5");
        assert!(m.gaps[0].retryable);
    }

    #[test]
    fn conflicts_zero_consistency() {
        let merged = merge(vec![
            TaskOutcome::completed("a", json!({"changes": [{"resource": "f", "content": "x"}]}), 1),
            TaskOutcome::completed("b", json!({"changes": [{"resource": "f", "content": "y"}]}), 1),
        ]);
        let m = measure_merged(&merged);
        assert_eq!(m.dimensions["consistency"], Some(0.0));
        assert!(m.gaps.iter().any(|g| g.id == "merge-conflict:f"));
    }

    #[test]
    fn scorer_output_overrides_dimensions_and_adds_gaps() {
        let base = measure_merged(&merge(vec![TaskOutcome::completed("a", json!(1), 1)]));
        let reported = parse_measurement(&json!({
            "dimensions": {"completeness": 55.0, "coverage": null},
            "gaps": [{"id": "docs", "severity": "low", "description": "no docs"}]
        }))
        .unwrap();
        let m = combine(base, reported);
        assert_eq!(m.dimensions["completeness"], Some(55.0));
        assert_eq!(m.dimensions["coverage"], None);
        assert_eq!(m.gaps.len(), 1);
    }

    #[test]
    fn unit_output_may_carry_its_own_measurement() {
        let m = measure_unit_output(&json!({
            "text": "draft",
            "measurement": {"dimensions": {"completeness": 30.0}}
        }))
        .unwrap();
        assert_eq!(m.dimensions["completeness"], Some(30.0));
        let plain = measure_unit_output(&json!("plain")).unwrap();
        assert_eq!(plain.dimensions["completeness"], Some(100.0));
    }

    #[test]
    fn malformed_reported_measurement_is_rejected() {
        let output = json!({"measurement": {"dimensions": {"completeness": "ten"}}});
        assert!(measure_unit_output(&output).is_err());
    }
}
