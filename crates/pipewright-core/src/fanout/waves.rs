//! Task validation, cycle detection and wave planning.
//!
//! Uses `petgraph` to model task dependencies as a directed graph. A
//! topological sort rejects cycles before anything runs; greedy leveling then
//! puts each task in the earliest wave after all of its dependencies.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use pipewright_types::task::{ExecutionGroup, Task};

use super::FanOutError;

/// Check ids, dependency references and acyclicity.
pub fn validate_tasks(tasks: &[Task]) -> Result<(), FanOutError> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            return Err(FanOutError::Validation("task id must not be empty".to_string()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(FanOutError::Validation(format!("duplicate task id '{}'", task.id)));
        }
    }

    let id_to_idx: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = tasks.iter().map(|t| graph.add_node(t.id.as_str())).collect();

    for (to_idx, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                FanOutError::Validation(format!("task '{}' depends on unknown task '{dep}'", task.id))
            })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        FanOutError::Validation(format!("cycle detected involving task '{node_id}'"))
    })?;

    Ok(())
}

/// Validate `tasks` and group them into execution waves.
///
/// Wave of a task = 1 + the highest wave among its dependencies; ids are
/// sorted within each wave so the plan is deterministic.
pub fn plan_waves(tasks: &[Task]) -> Result<Vec<ExecutionGroup>, FanOutError> {
    validate_tasks(tasks)?;

    // Acyclic, so every pass assigns at least one task.
    let mut levels: HashMap<&str, usize> = HashMap::new();
    while levels.len() < tasks.len() {
        for task in tasks {
            if levels.contains_key(task.id.as_str()) {
                continue;
            }
            let deps: Option<Vec<usize>> = task
                .depends_on
                .iter()
                .map(|dep| levels.get(dep.as_str()).copied())
                .collect();
            if let Some(deps) = deps {
                let level = deps.into_iter().map(|l| l + 1).max().unwrap_or(0);
                levels.insert(task.id.as_str(), level);
            }
        }
    }

    let mut waves: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (id, level) in levels {
        waves.entry(level).or_default().push(id.to_string());
    }

    Ok(waves
        .into_values()
        .enumerate()
        .map(|(index, mut task_ids)| {
            task_ids.sort();
            ExecutionGroup { index, task_ids }
        })
        .collect())
}
