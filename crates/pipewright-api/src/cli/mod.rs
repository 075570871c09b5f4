//! CLI command definitions for the `pwr` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow verbs sit at the
//! top level (`pwr run`, `pwr resume`); everything else is noun-verb
//! (`pwr graph list`, `pwr tenant show`).

pub mod config;
pub mod graph;
pub mod input;
pub mod tenant;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{WorkflowId, WorkflowStatus};

/// Run durable multi-tenant workflows.
#[derive(Parser)]
#[command(name = "pwr", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Tenant every command acts for.
    #[arg(long, global = true, env = "PIPEWRIGHT_TENANT", default_value = "default")]
    pub tenant: TenantId,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow and run it until it completes or waits.
    Run {
        /// Workflow id, unique within the tenant.
        workflow: WorkflowId,

        /// Trigger payload as JSON, or @path to read it from a file.
        #[arg(long, short)]
        input: Option<String>,
    },

    /// Deliver an event to a suspended or escalated workflow.
    Resume {
        workflow: WorkflowId,

        /// Resume type the waiting step expects (`retry` and `force-approve`
        /// for escalations).
        #[arg(long = "type", short = 't')]
        resume_type: String,

        /// Event payload as JSON, or @path to read it from a file.
        #[arg(long, short)]
        payload: Option<String>,

        /// Reuse an event id so redelivery is detected as a duplicate.
        #[arg(long)]
        event_id: Option<uuid::Uuid>,
    },

    /// Show one workflow.
    Status { workflow: WorkflowId },

    /// List the tenant's workflows.
    #[command(alias = "ls")]
    List {
        /// Filter by status (running, suspended, escalated, completed, failed, cancelled).
        #[arg(long, short)]
        status: Option<WorkflowStatus>,
    },

    /// Show a workflow's checkpoint history.
    Checkpoints { workflow: WorkflowId },

    /// Cancel a workflow.
    Cancel { workflow: WorkflowId },

    /// Continue every running workflow of the tenant after a restart.
    Recover,

    /// Inspect graph definitions.
    Graph {
        #[command(subcommand)]
        action: GraphCommand,
    },

    /// Inspect or adjust the tenant record.
    Tenant {
        #[command(subcommand)]
        action: TenantCommand,
    },

    /// Inspect engine configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Start the REST API server.
    Serve {
        /// Port to listen on.
        #[arg(long, short, default_value_t = 3000)]
        port: u16,

        /// Host to bind to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,

        /// Export spans through OpenTelemetry (stdout exporter).
        #[arg(long)]
        otel: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum GraphCommand {
    /// List the graphs loaded from the graphs directory.
    #[command(alias = "ls")]
    List,

    /// Validate a graph file and check that its work units are registered.
    Validate {
        /// Path to the graph YAML file.
        file: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
pub enum TenantCommand {
    /// Show the tenant's budget and effective settings.
    Show,

    /// Overwrite the tenant's remaining budget.
    SetBudget {
        /// New remaining budget.
        amount: f64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Load pipewright.toml and validate every table.
    Validate,

    /// Print the JSON Schema of pipewright.toml.
    Schema,

    /// Print the effective configuration as TOML.
    Show,
}
