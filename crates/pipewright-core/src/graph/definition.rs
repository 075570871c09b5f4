//! Graph definition parsing and validation.
//!
//! Graphs are authored as YAML:
//!
//! ```yaml
//! name: implement
//! steps:
//!   - name: plan
//!     type: unit
//!     unit: planner
//!   - name: build
//!     type: iterate
//!     attempt:
//!       type: fan_out
//!       decompose: { strategy: static }
//!       unit: coder
//!   - name: review
//!     type: await
//!     resume_type: approval
//!     reason: awaiting_review
//! ```

use std::collections::HashSet;

use pipewright_types::workflow::{
    Attempt, Decompose, GraphDefinition, RESUME_FORCE_APPROVE, RESUME_RETRY, StepKind,
};

use super::GraphError;

/// Parse a YAML string into a validated `GraphDefinition`.
pub fn parse_graph_yaml(yaml: &str) -> Result<GraphDefinition, GraphError> {
    let graph: GraphDefinition = serde_yaml_ng::from_str(yaml).map_err(|e| GraphError::Parse(e.to_string()))?;
    validate_graph(&graph)?;
    Ok(graph)
}

pub fn serialize_graph_yaml(graph: &GraphDefinition) -> Result<String, GraphError> {
    serde_yaml_ng::to_string(graph).map_err(|e| GraphError::Parse(e.to_string()))
}

/// Validate structural constraints on a `GraphDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one step exists
/// - Step names are non-empty and unique
/// - Every referenced unit name is non-empty
/// - `await` steps use a non-reserved, non-empty resume type
pub fn validate_graph(graph: &GraphDefinition) -> Result<(), GraphError> {
    if graph.name.is_empty() {
        return Err(GraphError::Invalid("graph name must not be empty".to_string()));
    }
    if !graph.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(GraphError::Invalid(format!(
            "graph name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            graph.name
        )));
    }
    if graph.steps.is_empty() {
        return Err(GraphError::Invalid(format!("graph '{}' has no steps", graph.name)));
    }

    let mut seen = HashSet::new();
    for step in &graph.steps {
        if step.name.trim().is_empty() {
            return Err(GraphError::Invalid(format!("graph '{}' has a step without a name", graph.name)));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(GraphError::Invalid(format!("duplicate step name '{}'", step.name)));
        }
        if let Some(when) = &step.when {
            if when.trim().is_empty() {
                return Err(GraphError::Invalid(format!("step '{}' has an empty condition", step.name)));
            }
        }

        for unit in referenced_units(&step.kind) {
            if unit.trim().is_empty() {
                return Err(GraphError::Invalid(format!("step '{}' names an empty unit", step.name)));
            }
        }

        if let StepKind::Await { resume_type, .. } = &step.kind {
            if resume_type.trim().is_empty() {
                return Err(GraphError::Invalid(format!("step '{}' has an empty resume_type", step.name)));
            }
            if resume_type == RESUME_RETRY || resume_type == RESUME_FORCE_APPROVE {
                return Err(GraphError::Invalid(format!(
                    "step '{}' uses reserved resume_type '{resume_type}'",
                    step.name
                )));
            }
        }
    }

    Ok(())
}

/// Every unit name a step may invoke.
pub fn referenced_units(kind: &StepKind) -> Vec<&str> {
    fn decompose_units(decompose: &Decompose) -> Option<&str> {
        match decompose {
            Decompose::Static => None,
            Decompose::Unit { unit } => Some(unit),
        }
    }

    match kind {
        StepKind::Unit { unit, .. } => vec![unit],
        StepKind::FanOut { decompose, unit } => decompose_units(decompose).into_iter().chain([unit.as_str()]).collect(),
        StepKind::Iterate { attempt, scorer } => {
            let mut units: Vec<&str> = match attempt {
                Attempt::Unit { unit } => vec![unit],
                Attempt::FanOut { decompose, unit } => {
                    decompose_units(decompose).into_iter().chain([unit.as_str()]).collect()
                }
            };
            units.extend(scorer.as_deref());
            units
        }
        StepKind::Await { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
name: linear
steps:
  - name: one
    type: unit
    unit: echo
  - name: two
    type: unit
    unit: echo
    timeout_secs: 5
  - name: three
    type: unit
    unit: echo
    when: "last.ok == true"
"#;

    #[test]
    fn parses_linear_graph() {
        let graph = parse_graph_yaml(LINEAR).unwrap();
        assert_eq!(graph.steps.len(), 3);
        assert_eq!(graph.steps[2].when.as_deref(), Some("last.ok == true"));
        assert!(matches!(
            graph.steps[1].kind,
            StepKind::Unit {
                timeout_secs: Some(5),
                ..
            }
        ));
    }

    #[test]
    fn parses_every_step_kind() {
        let graph = parse_graph_yaml(
            r#"
name: full-pipeline
steps:
  - name: plan
    type: fan_out
    decompose: { strategy: unit, unit: planner }
    unit: coder
  - name: build
    type: iterate
    attempt:
      type: fan_out
      decompose: { strategy: static }
      unit: coder
    scorer: reviewer
  - name: clarify
    type: await
    resume_type: answer
    reason: awaiting_answer
"#,
        )
        .unwrap();
        assert_eq!(referenced_units(&graph.steps[0].kind), vec!["planner", "coder"]);
        assert_eq!(referenced_units(&graph.steps[1].kind), vec!["coder", "reviewer"]);
        assert!(referenced_units(&graph.steps[2].kind).is_empty());
    }

    #[test]
    fn rejects_bad_names_and_duplicates() {
        assert!(parse_graph_yaml("name: 'bad name'\nsteps: [{name: a, type: unit, unit: x}]").is_err());
        assert!(parse_graph_yaml("name: empty\nsteps: []").is_err());
        let dup = "name: dup\nsteps:\n  - {name: a, type: unit, unit: x}\n  - {name: a, type: unit, unit: y}";
        assert!(matches!(parse_graph_yaml(dup), Err(GraphError::Invalid(_))));
    }

    #[test]
    fn rejects_reserved_resume_types() {
        let yaml = "name: g\nsteps:\n  - {name: wait, type: await, resume_type: retry, reason: r}";
        let err = parse_graph_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn yaml_round_trip() {
        let graph = parse_graph_yaml(LINEAR).unwrap();
        let again = parse_graph_yaml(&serialize_graph_yaml(&graph).unwrap()).unwrap();
        assert_eq!(graph, again);
    }
}
