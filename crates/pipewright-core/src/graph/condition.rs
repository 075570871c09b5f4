//! JEXL evaluation of step `when` clauses.
//!
//! The context is `{input, last, outputs}`: the graph input, the previous
//! step's output and every recorded step output by name. Payloads are always
//! passed as context, never spliced into the expression.

use pipewright_types::checkpoint::ExecutionState;
use serde_json::{Value, json};

use super::GraphError;

/// Evaluates step conditions against execution state.
///
/// The JEXL evaluator is built per call and never held across an await.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn context(state: &ExecutionState) -> Value {
        json!({
            "input": state.input,
            "last": state.last_output,
            "outputs": state.outputs,
        })
    }

    /// Truthiness of `expression` for the given state.
    pub fn evaluate(&self, step: &str, expression: &str, state: &ExecutionState) -> Result<bool, GraphError> {
        let result = evaluator()
            .eval_in_context(expression, Self::context(state))
            .map_err(|e| GraphError::Condition {
                step: step.to_string(),
                message: e.to_string(),
            })?;
        let truthy = is_truthy(&result);
        tracing::debug!(step, expression, result = truthy, "condition evaluated");
        Ok(truthy)
    }
}

fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("contains", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.contains(search)))
        })
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ExecutionState {
        let mut state = ExecutionState::new("g", json!({"priority": "high", "labels": ["bug"]}));
        state.last_output = json!({"approved": false, "files": 3});
        state.outputs.insert("plan".to_string(), json!({"tasks": [1, 2]}));
        state
    }

    #[test]
    fn reads_input_last_and_outputs() {
        let eval = ConditionEvaluator::new();
        let s = state();
        assert!(eval.evaluate("s", "input.priority == 'high'", &s).unwrap());
        assert!(!eval.evaluate("s", "last.approved", &s).unwrap());
        assert!(eval.evaluate("s", "last.files > 2", &s).unwrap());
        assert!(eval.evaluate("s", "outputs.plan.tasks|length == 2", &s).unwrap());
    }

    #[test]
    fn missing_fields_are_falsy() {
        assert!(!ConditionEvaluator::new().evaluate("s", "last.nothing", &state()).unwrap());
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let err = ConditionEvaluator::new().evaluate("s", "last.files >", &state()).unwrap_err();
        assert!(matches!(err, GraphError::Condition { .. }));
    }
}
