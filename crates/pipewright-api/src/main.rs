//! Pipewright CLI and REST API entry point.
//!
//! Binary name: `pwr`
//!
//! Parses CLI arguments, initializes the database and engine, then dispatches
//! to the appropriate command handler or starts the REST API server.

use clap::Parser;
use clap_complete::generate;
use pipewright_api::cli::{self, Cli, Commands, ConfigCommand, GraphCommand, TenantCommand};
use pipewright_api::http;
use pipewright_api::state::AppState;
use pipewright_observe::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::for_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        tracing_options.default_filter = "error".to_string();
    }
    if let Commands::Serve { log_json, otel, .. } = &cli.command {
        tracing_options.json = *log_json;
        tracing_options.otel = *otel;
        if cli.verbose == 0 && !cli.quiet {
            tracing_options.default_filter = "info".to_string();
        }
    }
    if let Err(e) = init_tracing(&tracing_options) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions and the config schema don't need app state
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "pwr", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Config {
            action: ConfigCommand::Schema,
        } => return cli::config::print_schema(),
        _ => {}
    }

    let state = AppState::init().await?;
    let tenant = cli.tenant;
    let json = cli.json;

    match cli.command {
        Commands::Run { workflow, input } => {
            cli::workflow::run_workflow(&state, &tenant, workflow, input.as_deref(), json).await?;
        }

        Commands::Resume {
            workflow,
            resume_type,
            payload,
            event_id,
        } => {
            cli::workflow::resume_workflow(&state, &tenant, workflow, resume_type, payload.as_deref(), event_id, json)
                .await?;
        }

        Commands::Status { workflow } => {
            cli::workflow::show_status(&state, &tenant, &workflow, json).await?;
        }

        Commands::List { status } => {
            cli::workflow::list_workflows(&state, &tenant, status, json).await?;
        }

        Commands::Checkpoints { workflow } => {
            cli::workflow::list_checkpoints(&state, &tenant, &workflow, json).await?;
        }

        Commands::Cancel { workflow } => {
            cli::workflow::cancel_workflow(&state, &tenant, &workflow, json).await?;
        }

        Commands::Recover => {
            cli::workflow::recover_workflows(&state, &tenant, json).await?;
        }

        Commands::Graph { action } => match action {
            GraphCommand::List => cli::graph::list_graphs(&state, json)?,
            GraphCommand::Validate { file } => cli::graph::validate_graph_file(&state, &file, json)?,
        },

        Commands::Tenant { action } => match action {
            TenantCommand::Show => cli::tenant::show_tenant(&state, &tenant, json).await?,
            TenantCommand::SetBudget { amount } => cli::tenant::set_budget(&state, &tenant, amount, json).await?,
        },

        Commands::Config { action } => match action {
            ConfigCommand::Validate => cli::config::validate_config(&state, json).await?,
            ConfigCommand::Show => cli::config::show_config(&state, json)?,
            ConfigCommand::Schema => cli::config::print_schema()?,
        },

        Commands::Serve { port, host, .. } => {
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            if !cli.quiet {
                println!(
                    "  {} Pipewright API listening on {}",
                    console::style("⚡").bold(),
                    console::style(format!("http://{addr}/api/v1")).cyan()
                );
                println!("  {}", console::style("Press Ctrl+C to stop").dim());
            }
            tracing::info!(%addr, "api server started");

            let router = http::router::build_router(state);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            if !cli.quiet {
                println!("\n  Server stopped.");
            }
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
