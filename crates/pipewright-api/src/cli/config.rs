//! Config commands: validate, schema, show.

use anyhow::Result;
use console::style;
use pipewright_infra::config::{config_path, read_config};
use pipewright_types::config::EngineConfig;

use crate::state::AppState;

/// `pwr config validate`
///
/// Re-reads the file strictly; state initialization already fell back to
/// defaults if it was broken.
pub async fn validate_config(state: &AppState, json: bool) -> Result<()> {
    let path = config_path(&state.data_dir);
    let result = read_config(&state.data_dir).await;

    if json {
        let out = match &result {
            Ok(config) => serde_json::json!({
                "path": path.display().to_string(),
                "valid": true,
                "tenants": config.tenants.keys().collect::<Vec<_>>(),
                "units": config.units.len(),
            }),
            Err(e) => serde_json::json!({
                "path": path.display().to_string(),
                "valid": false,
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        match &result {
            Ok(config) => {
                println!(
                    "  {} {} is valid",
                    style("✓").green(),
                    style(path.display()).cyan()
                );
                println!(
                    "  Tenant tables: {}  Work units: {}",
                    config.tenants.len(),
                    config.units.len()
                );
            }
            Err(e) => {
                println!("  {} {}", style("✗").red(), e);
            }
        }
        println!();
    }

    result?;
    Ok(())
}

/// `pwr config schema`
pub fn print_schema() -> Result<()> {
    let schema = schemars::schema_for!(EngineConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// `pwr config show`
pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state.config.as_ref())?);
    } else {
        print!("{}", toml::to_string_pretty(state.config.as_ref())?);
    }
    Ok(())
}
