//! Tenant commands: show the tenant record and adjust its budget.

use anyhow::{Result, bail};
use console::style;
use pipewright_core::repository::TenantRepository;
use pipewright_types::tenant::{Tenant, TenantId};

use crate::state::AppState;

/// `pwr tenant show`
pub async fn show_tenant(state: &AppState, tenant_id: &TenantId, json: bool) -> Result<()> {
    let config = state.orchestrator.directory().config_for(tenant_id);
    let tenant = state
        .orchestrator
        .store()
        .ensure_tenant(tenant_id, config.resource_budget)
        .await?;
    let recent = state.audit.recent(tenant_id, 5).await?;

    if json {
        let out = serde_json::json!({
            "tenant": tenant,
            "config": config.as_ref(),
            "recent_invocations": recent,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    print_tenant(&tenant);
    println!();
    println!("  {}", style("── Settings ──").dim());
    println!("  Graph sequence:    {}", config.graph_sequence.join(" → "));
    println!("  Quality threshold: {:.1}", config.quality_threshold);
    println!("  Max iterations:    {}", config.max_iterations);
    println!("  Parallel tasks:    {}", config.max_parallel_tasks);
    println!("  On task failure:   {:?}", config.on_task_failure);

    if !recent.is_empty() {
        println!();
        println!("  {}", style("── Recent work units ──").dim());
        for inv in &recent {
            let mark = if inv.success {
                style("✓").green()
            } else {
                style("✗").red()
            };
            println!(
                "  {} {} attempt {} ({} ms){}",
                mark,
                style(&inv.unit).cyan(),
                inv.attempt,
                inv.duration_ms,
                inv.failure_kind
                    .as_deref()
                    .map(|k| format!(" {k}"))
                    .unwrap_or_default()
            );
        }
    }
    println!();
    Ok(())
}

/// `pwr tenant set-budget <amount>`
pub async fn set_budget(state: &AppState, tenant_id: &TenantId, amount: f64, json: bool) -> Result<()> {
    if !amount.is_finite() {
        bail!("budget must be a finite number");
    }
    let store = state.orchestrator.store();
    let config = state.orchestrator.directory().config_for(tenant_id);
    store.ensure_tenant(tenant_id, config.resource_budget).await?;
    let tenant = store.set_budget(tenant_id, amount).await?;
    tracing::info!(tenant = %tenant_id, budget = amount, "tenant budget overwritten");

    if json {
        println!("{}", serde_json::to_string_pretty(&tenant)?);
    } else {
        println!();
        print_tenant(&tenant);
        println!();
    }
    Ok(())
}

fn print_tenant(tenant: &Tenant) {
    let budget = if tenant.is_exhausted() {
        style(format!("{:.2}", tenant.budget_remaining)).red()
    } else {
        style(format!("{:.2}", tenant.budget_remaining)).green()
    };
    println!("  {} Tenant '{}'", style("*").green().bold(), style(&tenant.id).cyan());
    println!("  Budget remaining: {budget}");
    println!("  Created: {}", tenant.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", tenant.updated_at.format("%Y-%m-%d %H:%M:%S"));
}
