//! Workflow commands: run, resume, status, list, checkpoints, cancel and
//! recover.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use pipewright_core::orchestrator::WorkflowReport;
use pipewright_types::checkpoint::{CheckpointRecord, CheckpointStatus, Suspension};
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{ResumeEvent, WorkflowId, WorkflowInstance, WorkflowStatus};

use super::input::parse_json_arg;
use crate::state::AppState;

/// `pwr run <workflow>`
pub async fn run_workflow(
    state: &AppState,
    tenant: &TenantId,
    workflow: WorkflowId,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let input = parse_json_arg(input)?;
    let report = state.orchestrator.start(tenant, workflow, input).await?;
    print_report(state, tenant, &report, json).await
}

/// `pwr resume <workflow> --type <type>`
pub async fn resume_workflow(
    state: &AppState,
    tenant: &TenantId,
    workflow: WorkflowId,
    resume_type: String,
    payload: Option<&str>,
    event_id: Option<uuid::Uuid>,
    json: bool,
) -> Result<()> {
    let payload = parse_json_arg(payload)?;
    let mut event = ResumeEvent::new(workflow, resume_type, payload);
    if let Some(id) = event_id {
        event.id = id;
    }
    let report = state.orchestrator.handle_event(tenant, event).await?;
    print_report(state, tenant, &report, json).await
}

/// `pwr status <workflow>`
pub async fn show_status(state: &AppState, tenant: &TenantId, workflow: &WorkflowId, json: bool) -> Result<()> {
    let instance = state.orchestrator.status(tenant, workflow).await?;
    let suspension = waiting_on(state, tenant, &instance).await?;

    if json {
        let out = serde_json::json!({
            "instance": instance,
            "suspension": suspension,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    print_instance(&instance);
    if let Some(s) = &suspension {
        print_suspension(s);
    }
    println!();
    Ok(())
}

/// `pwr list`
pub async fn list_workflows(
    state: &AppState,
    tenant: &TenantId,
    status: Option<WorkflowStatus>,
    json: bool,
) -> Result<()> {
    let instances = state.orchestrator.list(tenant, status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!(
            "  {} No workflows found. Start one with: {}",
            style("i").blue().bold(),
            style("pwr run <workflow>").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Graph").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Started").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for instance in &instances {
        table.add_row(vec![
            Cell::new(&instance.id).fg(Color::Cyan),
            Cell::new(&instance.graph),
            status_cell(instance.status),
            Cell::new(instance.created_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
            Cell::new(instance.updated_at.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} workflow{}",
        style(instances.len()).bold(),
        if instances.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// `pwr checkpoints <workflow>`
pub async fn list_checkpoints(
    state: &AppState,
    tenant: &TenantId,
    workflow: &WorkflowId,
    json: bool,
) -> Result<()> {
    let records = state.orchestrator.checkpoints(tenant, workflow).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No checkpoints recorded for '{}' yet.", style(workflow).cyan());
        println!();
        return Ok(());
    }

    println!();
    println!("{}", checkpoint_table(&records));
    println!();
    Ok(())
}

/// `pwr cancel <workflow>`
pub async fn cancel_workflow(state: &AppState, tenant: &TenantId, workflow: &WorkflowId, json: bool) -> Result<()> {
    let instance = state.orchestrator.cancel(tenant, workflow).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
    } else {
        println!();
        println!(
            "  {} Cancelled workflow '{}'",
            style("*").yellow().bold(),
            style(&instance.id).cyan()
        );
        println!();
    }
    Ok(())
}

/// `pwr recover`
pub async fn recover_workflows(state: &AppState, tenant: &TenantId, json: bool) -> Result<()> {
    let reports = state.orchestrator.recover(tenant).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!();
    if reports.is_empty() {
        println!("  Nothing to recover for tenant '{}'.", style(tenant).cyan());
    } else {
        for report in &reports {
            println!(
                "  {} {} -> {}",
                style("*").green().bold(),
                style(&report.instance.id).cyan(),
                report.instance.status
            );
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

async fn print_report(state: &AppState, tenant: &TenantId, report: &WorkflowReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!();
    if report.duplicate {
        println!(
            "  {} Event already applied to '{}'; nothing ran.",
            style("i").blue().bold(),
            style(&report.instance.id).cyan()
        );
    }
    print_instance(&report.instance);

    if let Some(output) = &report.output {
        println!("  Output:");
        for line in serde_json::to_string_pretty(output)?.lines() {
            println!("    {line}");
        }
    }
    if let Some(suspension) = waiting_on(state, tenant, &report.instance).await? {
        print_suspension(&suspension);
    }
    if let Some(escalation) = &report.escalation {
        println!();
        for line in escalation.to_string().lines() {
            println!("  {}", style(line).red());
        }
    }
    println!();
    Ok(())
}

fn print_instance(instance: &WorkflowInstance) {
    println!(
        "  {} Workflow '{}' is {}",
        style("*").green().bold(),
        style(&instance.id).cyan(),
        styled_status(instance.status)
    );
    println!("  Tenant: {}", instance.tenant_id);
    println!("  Graph:  {} (#{})", instance.graph, instance.graph_index + 1);
}

fn print_suspension(suspension: &Suspension) {
    println!(
        "  Waiting at step '{}': {}",
        style(&suspension.step).cyan(),
        suspension.reason
    );
    match suspension.expected_resume_type() {
        Some(kind) => println!(
            "  Resume with: {}",
            style(format!("pwr resume <workflow> --type {kind}")).dim()
        ),
        None => println!(
            "  Resume with: {}",
            style("pwr resume <workflow> --type retry|force-approve").dim()
        ),
    }
}

/// The suspension marker of a waiting instance, if any.
async fn waiting_on(state: &AppState, tenant: &TenantId, instance: &WorkflowInstance) -> Result<Option<Suspension>> {
    if !matches!(instance.status, WorkflowStatus::Suspended | WorkflowStatus::Escalated) {
        return Ok(None);
    }
    let guard = state.orchestrator.guard(tenant).await?;
    Ok(guard
        .load_active(&instance.id)
        .await?
        .and_then(|checkpoint| checkpoint.state.suspension))
}

fn checkpoint_table(records: &[CheckpointRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Seq").fg(Color::White),
        Cell::new("Graph").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Created").fg(Color::White),
        Cell::new("Resumed By").fg(Color::White),
    ]);

    for record in records {
        let status = match record.status {
            CheckpointStatus::Active => Cell::new("● active").fg(Color::Green),
            CheckpointStatus::Resumed => Cell::new("↻ resumed").fg(Color::Cyan),
            CheckpointStatus::Expired => Cell::new("○ expired").fg(Color::DarkGrey),
            CheckpointStatus::Cancelled => Cell::new("✗ cancelled").fg(Color::Yellow),
        };
        let resumed_by = record
            .resumed_by
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(record.sequence),
            Cell::new(&record.graph),
            Cell::new(&record.step).fg(Color::Cyan),
            status,
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S%.3f")).fg(Color::DarkGrey),
            Cell::new(resumed_by).fg(Color::DarkGrey),
        ]);
    }
    table
}

fn status_cell(status: WorkflowStatus) -> Cell {
    match status {
        WorkflowStatus::Running => Cell::new("▶ running").fg(Color::Blue),
        WorkflowStatus::Suspended => Cell::new("⏸ suspended").fg(Color::Yellow),
        WorkflowStatus::Escalated => Cell::new("! escalated").fg(Color::Magenta),
        WorkflowStatus::Completed => Cell::new("● completed").fg(Color::Green),
        WorkflowStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
        WorkflowStatus::Cancelled => Cell::new("○ cancelled").fg(Color::DarkGrey),
    }
}

fn styled_status(status: WorkflowStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => style(text).green(),
        WorkflowStatus::Failed => style(text).red(),
        WorkflowStatus::Suspended => style(text).yellow(),
        WorkflowStatus::Escalated => style(text).magenta(),
        WorkflowStatus::Running => style(text).blue(),
        WorkflowStatus::Cancelled => style(text).dim(),
    }
}
