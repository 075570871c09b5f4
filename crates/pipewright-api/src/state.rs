//! Application state wiring the engine together.
//!
//! AppState holds the orchestrator pinned to the SQLite store, used by both
//! CLI commands and REST API handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pipewright_core::event::bus::EventBus;
use pipewright_core::graph::GraphEngine;
use pipewright_core::guard::TenantDirectory;
use pipewright_core::orchestrator::Orchestrator;
use pipewright_core::unit::{UnitExecutor, UnitRegistry};
use pipewright_infra::config::{graphs_dir, load_config};
use pipewright_infra::graphs::load_catalog;
use pipewright_infra::sqlite::audit::SqliteAuditLog;
use pipewright_infra::sqlite::pool::{DatabasePool, database_url_in, default_data_dir, default_database_url};
use pipewright_infra::sqlite::store::SqliteStore;
use pipewright_infra::unit::build_registry;
use pipewright_types::config::EngineConfig;

pub type ConcreteOrchestrator = Orchestrator<SqliteStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub units: Arc<UnitRegistry>,
    pub audit: SqliteAuditLog,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize from the default data directory and database URL.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        Self::open(&data_dir, &default_database_url()).await
    }

    /// Initialize against an explicit data directory, with the database file
    /// inside it.
    pub async fn open_in(data_dir: &Path) -> anyhow::Result<Self> {
        Self::open(data_dir, &database_url_in(data_dir)).await
    }

    async fn open(data_dir: &Path, database_url: &str) -> anyhow::Result<Self> {
        let config = load_config(data_dir).await;

        let db_pool = DatabasePool::new(database_url)
            .await
            .with_context(|| format!("failed to open database at {database_url}"))?;

        let units = Arc::new(build_registry(&config)?);
        let catalog = load_catalog(&graphs_dir(data_dir, &config))?;
        let directory = TenantDirectory::from_config(&config);

        let events = EventBus::new(config.engine.event_capacity);
        let audit = SqliteAuditLog::new(db_pool.clone());
        tokio::spawn(audit.clone().forward(events.subscribe()));

        let executor = UnitExecutor::new(Arc::clone(&units), events.clone(), config.engine.default_unit_cost);
        let engine = GraphEngine::new(
            executor,
            events.clone(),
            Duration::from_millis(config.engine.cancel_grace_ms),
        );
        let store = Arc::new(SqliteStore::new(db_pool.clone()));
        let orchestrator = Orchestrator::new(store, engine, catalog, directory, events);

        tracing::debug!(
            data_dir = %data_dir.display(),
            graphs = orchestrator.catalog().len(),
            units = units.len(),
            "application state ready"
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            units,
            audit,
            config: Arc::new(config),
            data_dir: data_dir.to_path_buf(),
            db_pool,
        })
    }
}
