//! Graph commands: list loaded graphs and validate graph files.

use std::path::Path;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use pipewright_core::graph::definition::referenced_units;
use pipewright_core::unit::UnitRegistry;
use pipewright_infra::config::graphs_dir;
use pipewright_infra::graphs::load_graph_file;
use pipewright_types::workflow::GraphDefinition;

use crate::state::AppState;

/// `pwr graph list`
pub fn list_graphs(state: &AppState, json: bool) -> Result<()> {
    let catalog = state.orchestrator.catalog();
    let graphs: Vec<_> = catalog
        .names()
        .into_iter()
        .filter_map(|name| catalog.get(name).ok())
        .collect();

    if json {
        let out: Vec<_> = graphs
            .iter()
            .map(|g| {
                serde_json::json!({
                    "name": g.name,
                    "description": g.description,
                    "steps": g.steps.iter().map(|s| serde_json::json!({
                        "name": s.name,
                        "type": s.kind.label(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if graphs.is_empty() {
        println!();
        println!(
            "  {} No graphs loaded. Add YAML files under {}",
            style("i").blue().bold(),
            style(graphs_dir(&state.data_dir, &state.config).display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Name").fg(Color::White),
        Cell::new("Steps").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);
    for graph in &graphs {
        let steps = graph
            .steps
            .iter()
            .map(|s| format!("{} ({})", s.name, s.kind.label()))
            .collect::<Vec<_>>()
            .join(" → ");
        table.add_row(vec![
            Cell::new(&graph.name).fg(Color::Cyan),
            Cell::new(steps),
            Cell::new(graph.description.as_deref().unwrap_or("")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// `pwr graph validate <file>`
pub fn validate_graph_file(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let graph = load_graph_file(file)?;
    let missing = missing_units(&graph, &state.units);

    if json {
        let out = serde_json::json!({
            "name": graph.name,
            "steps": graph.steps.len(),
            "valid": missing.is_empty(),
            "missing_units": missing,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        if missing.is_empty() {
            println!(
                "  {} Graph '{}' is valid ({} steps)",
                style("✓").green(),
                style(&graph.name).cyan(),
                graph.steps.len()
            );
        } else {
            println!(
                "  {} Graph '{}' references unregistered work units: {}",
                style("✗").red(),
                style(&graph.name).cyan(),
                missing.join(", ")
            );
        }
        println!();
    }

    if !missing.is_empty() {
        bail!("graph '{}' references {} unregistered work unit(s)", graph.name, missing.len());
    }
    Ok(())
}

/// Units a graph names that the registry does not know, deduplicated in
/// first-use order.
fn missing_units(graph: &GraphDefinition, registry: &UnitRegistry) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for step in &graph.steps {
        for unit in referenced_units(&step.kind) {
            if !registry.contains(unit) && !missing.iter().any(|m| m == unit) {
                missing.push(unit.to_string());
            }
        }
    }
    missing
}
