//! Fan-in: merge per-task outcomes into one result.
//!
//! Task outputs may carry `changes: [ResourceEdit]`. Edits are grouped by
//! resource; identical edits collapse, disjoint line ranges are unioned, and
//! anything overlapping is reported as a conflict with every edit involved.

use std::collections::{BTreeMap, BTreeSet};

use pipewright_types::task::{MergeConflict, MergedResult, ResourceEdit, TaskOutcome};

/// Merge task outcomes. Outcomes keep their input order.
pub fn merge(outcomes: Vec<TaskOutcome>) -> MergedResult {
    let mut result = MergedResult::default();
    let mut by_resource: BTreeMap<String, Vec<ResourceEdit>> = BTreeMap::new();

    for outcome in outcomes {
        if !outcome.is_success() {
            result.failed.push(outcome);
            continue;
        }
        for edit in extract_edits(&outcome) {
            by_resource.entry(edit.resource.clone()).or_default().push(edit);
        }
        result.succeeded.push(outcome);
    }

    for (resource, edits) in by_resource {
        let (merged, conflict) = merge_resource(&resource, edits);
        if !merged.is_empty() {
            result.artifacts.insert(resource, merged);
        }
        if let Some(conflict) = conflict {
            result.conflicts.push(conflict);
        }
    }

    result.conflicted = !result.conflicts.is_empty();
    result
}

fn extract_edits(outcome: &TaskOutcome) -> Vec<ResourceEdit> {
    let Some(changes) = outcome
        .output
        .as_ref()
        .and_then(|o| o.get("changes"))
        .and_then(|c| c.as_array())
    else {
        return Vec::new();
    };

    changes
        .iter()
        .filter_map(|raw| match serde_json::from_value::<ResourceEdit>(raw.clone()) {
            Ok(mut edit) => {
                edit.task_id = outcome.task_id.clone();
                Some(edit)
            }
            Err(e) => {
                tracing::warn!(task = %outcome.task_id, error = %e, "ignoring malformed change entry");
                None
            }
        })
        .collect()
}

fn same_change(a: &ResourceEdit, b: &ResourceEdit) -> bool {
    a.range() == b.range() && a.content == b.content
}

/// Why two distinct edits cannot both apply, if they cannot.
fn clash(a: &ResourceEdit, b: &ResourceEdit) -> Option<&'static str> {
    match (a.range(), b.range()) {
        (None, _) | (_, None) => Some("whole-resource write competes with another edit"),
        (Some((a_start, a_end)), Some((b_start, b_end))) if a_start <= b_end && b_start <= a_end => {
            Some("overlapping line ranges")
        }
        _ => None,
    }
}

fn merge_resource(resource: &str, edits: Vec<ResourceEdit>) -> (Vec<ResourceEdit>, Option<MergeConflict>) {
    let mut unique: Vec<ResourceEdit> = Vec::new();
    for edit in edits {
        if !unique.iter().any(|u| same_change(u, &edit)) {
            unique.push(edit);
        }
    }

    let mut conflicting: BTreeSet<usize> = BTreeSet::new();
    let mut reason = None;
    for i in 0..unique.len() {
        for j in (i + 1)..unique.len() {
            if let Some(why) = clash(&unique[i], &unique[j]) {
                conflicting.insert(i);
                conflicting.insert(j);
                reason.get_or_insert(why);
            }
        }
    }

    let mut merged = Vec::new();
    let mut involved = Vec::new();
    for (idx, edit) in unique.into_iter().enumerate() {
        if conflicting.contains(&idx) {
            involved.push(edit);
        } else {
            merged.push(edit);
        }
    }
    merged.sort_by_key(|e| e.range().map(|(start, _)| start).unwrap_or(0));

    let conflict = reason.map(|why| {
        let task_ids: BTreeSet<String> = involved.iter().map(|e| e.task_id.clone()).collect();
        tracing::warn!(resource, tasks = ?task_ids, reason = why, "unresolved merge conflict");
        MergeConflict {
            resource: resource.to_string(),
            task_ids: task_ids.into_iter().collect(),
            reason: why.to_string(),
            edits: involved,
        }
    });

    (merged, conflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit(resource: &str, range: Option<(u32, u32)>, content: &str) -> serde_json::Value {
        match range {
            Some((start, end)) => json!({
                "resource": resource, "start_line": start, "end_line": end, "content": content
            }),
            None => json!({"resource": resource, "content": content}),
        }
    }

    fn done(id: &str, changes: Vec<serde_json::Value>) -> TaskOutcome {
        TaskOutcome::completed(id, json!({ "changes": changes }), 1)
    }

    #[test]
    fn disjoint_edits_union_in_line_order() {
        let merged = merge(vec![
            done("b", vec![edit("src/lib.rs", Some((20, 25)), "two")]),
            done("a", vec![edit("src/lib.rs", Some((1, 5)), "one")]),
        ]);
        assert!(!merged.conflicted);
        let edits = &merged.artifacts["src/lib.rs"];
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].task_id, "a");
        assert_eq!(edits[1].task_id, "b");
    }

    #[test]
    fn identical_edits_collapse() {
        let merged = merge(vec![
            done("a", vec![edit("README.md", Some((3, 3)), "same")]),
            done("b", vec![edit("README.md", Some((3, 3)), "same")]),
        ]);
        assert!(!merged.conflicted);
        assert_eq!(merged.artifacts["README.md"].len(), 1);
    }

    #[test]
    fn overlapping_edits_conflict_and_are_kept() {
        let merged = merge(vec![
            done("a", vec![edit("src/main.rs", Some((10, 20)), "mine")]),
            done("b", vec![edit("src/main.rs", Some((15, 30)), "theirs")]),
            done("c", vec![edit("src/main.rs", Some((40, 41)), "elsewhere")]),
        ]);
        assert!(merged.conflicted);
        assert_eq!(merged.conflicts.len(), 1);
        let conflict = &merged.conflicts[0];
        assert_eq!(conflict.task_ids, vec!["a", "b"]);
        assert_eq!(conflict.edits.len(), 2);
        assert_eq!(merged.artifacts["src/main.rs"].len(), 1);
        assert_eq!(merged.artifacts["src/main.rs"][0].task_id, "c");
    }

    #[test]
    fn whole_resource_write_conflicts_with_any_other_edit() {
        let merged = merge(vec![
            done("a", vec![edit("Cargo.toml", None, "rewrite")]),
            done("b", vec![edit("Cargo.toml", Some((1, 1)), "tweak")]),
        ]);
        assert!(merged.conflicted);
        assert!(merged.artifacts.get("Cargo.toml").is_none());
        assert_eq!(merged.conflicts[0].reason, "whole-resource write competes with another edit");
    }

    #[test]
    fn failures_are_listed_not_merged() {
        let merged = merge(vec![
            done("a", vec![]),
            TaskOutcome::failed("b", "unit timed out", 5),
        ]);
        assert_eq!(merged.succeeded.len(), 1);
        assert_eq!(merged.failed.len(), 1);
        assert_eq!(merged.failed[0].task_id, "b");
        assert!(merged.artifacts.is_empty());
    }

    #[test]
    fn outputs_without_changes_merge_cleanly() {
        let merged = merge(vec![TaskOutcome::completed("a", json!("plain text"), 1)]);
        assert!(!merged.conflicted);
        assert_eq!(merged.outputs()["a"], json!("plain text"));
    }
}
