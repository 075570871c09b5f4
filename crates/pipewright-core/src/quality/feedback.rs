//! Feedback handed to the next attempt after an `Iterate` decision.

use pipewright_types::checkpoint::IterationLedger;
use pipewright_types::quality::{Feedback, FeedbackMode, Gap, QualityEvaluation};
use serde_json::{Value, json};

/// Most severe first, then non-retryable before retryable, then by id.
pub fn prioritize(mut gaps: Vec<Gap>) -> Vec<Gap> {
    gaps.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.retryable.cmp(&b.retryable))
            .then_with(|| a.id.cmp(&b.id))
    });
    gaps
}

pub fn build_feedback(evaluation: &QualityEvaluation, threshold: f64) -> Feedback {
    Feedback {
        iteration: evaluation.iteration,
        overall_score: evaluation.overall_score,
        threshold,
        gaps: prioritize(evaluation.gaps.clone()),
    }
}

/// Input of the next attempt.
///
/// `Replace` hands the unit only the original work item and the new feedback.
/// `Augment` also carries the previous attempt's output and the scored
/// history.
pub fn attempt_input(mode: FeedbackMode, work_item: &Value, ledger: &IterationLedger, feedback: &Feedback) -> Value {
    match mode {
        FeedbackMode::Replace => json!({
            "work_item": work_item,
            "feedback": feedback,
        }),
        FeedbackMode::Augment => json!({
            "work_item": work_item,
            "previous_output": ledger.last_attempt,
            "feedback": feedback,
            "history": ledger.history,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::quality::{Decision, Severity};
    use std::collections::BTreeMap;

    fn evaluation(gaps: Vec<Gap>) -> QualityEvaluation {
        QualityEvaluation {
            iteration: 1,
            overall_score: 80.0,
            dimensions: BTreeMap::new(),
            weights: BTreeMap::new(),
            excluded: vec![],
            gaps,
            decision: Decision::Iterate,
        }
    }

    #[test]
    fn gaps_are_prioritised() {
        let ordered = prioritize(vec![
            Gap::new("b-low", Severity::Low, ""),
            Gap::new("z-high", Severity::High, ""),
            Gap::new("a-high", Severity::High, ""),
            Gap::new("m-high-blocking", Severity::High, "").non_retryable(),
            Gap::new("crit", Severity::Critical, ""),
        ]);
        let ids: Vec<_> = ordered.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["crit", "m-high-blocking", "a-high", "z-high", "b-low"]);
    }

    #[test]
    fn feedback_lists_the_failed_task() {
        let fb = build_feedback(
            &evaluation(vec![Gap::new("task-failed:t5", Severity::High, "task 't5' failed")]),
            90.0,
        );
        assert_eq!(fb.iteration, 1);
        assert_eq!(fb.threshold, 90.0);
        assert_eq!(fb.gaps[0].id, "task-failed:t5");
    }

    #[test]
    fn modes_shape_the_next_input() {
        let work_item = json!({"tasks": [{"id": "a"}]});
        let ledger = IterationLedger {
            iteration: 1,
            history: vec![evaluation(vec![])],
            last_attempt: json!({"draft": 1}),
        };
        let fb = build_feedback(&ledger.history[0], 90.0);

        let replaced = attempt_input(FeedbackMode::Replace, &work_item, &ledger, &fb);
        assert_eq!(replaced["work_item"], work_item);
        assert!(replaced.get("previous_output").is_none());

        let augmented = attempt_input(FeedbackMode::Augment, &work_item, &ledger, &fb);
        assert_eq!(augmented["previous_output"], json!({"draft": 1}));
        assert_eq!(augmented["history"].as_array().unwrap().len(), 1);
    }
}
