//! Engine runs on the SQLite store: atomic saves, restarts and tenant
//! isolation against a real database file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipewright_core::error::EngineError;
use pipewright_core::event::bus::EventBus;
use pipewright_core::graph::{GraphCatalog, GraphEngine, parse_graph_yaml};
use pipewright_core::guard::TenantDirectory;
use pipewright_core::orchestrator::Orchestrator;
use pipewright_core::repository::{CheckpointStore, CheckpointWrite, Supersede, TenantRepository};
use pipewright_core::unit::{EchoUnit, UnitExecutor, UnitRegistry};
use pipewright_infra::sqlite::pool::{DatabasePool, database_url_in};
use pipewright_infra::sqlite::store::SqliteStore;
use pipewright_types::checkpoint::{CheckpointRecord, CheckpointStatus};
use pipewright_types::config::TenantConfig;
use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{ResumeEvent, WorkflowId, WorkflowStatus};
use serde_json::json;
use uuid::Uuid;

const LINEAR: &str = r#"
name: linear
steps:
  - { name: one, type: unit, unit: echo }
  - { name: two, type: unit, unit: echo }
  - { name: three, type: unit, unit: echo }
"#;

const CLARIFY: &str = r#"
name: clarify
steps:
  - { name: ask, type: unit, unit: echo }
  - { name: clarify, type: await, resume_type: answer, reason: awaiting_answer }
  - { name: record, type: unit, unit: echo }
"#;

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

fn wf(id: &str) -> WorkflowId {
    WorkflowId::new(id).unwrap()
}

async fn open(dir: &Path) -> SqliteStore {
    SqliteStore::new(DatabasePool::new(&database_url_in(dir)).await.unwrap())
}

fn orchestrator(store: SqliteStore, graphs: &[&str]) -> Orchestrator<SqliteStore> {
    let bus = EventBus::new(256);
    let mut registry = UnitRegistry::new();
    registry.register(EchoUnit::new("echo"));
    let executor = UnitExecutor::new(Arc::new(registry), bus.clone(), 1.0);
    let engine = GraphEngine::new(executor, bus.clone(), Duration::from_millis(100));
    let catalog = GraphCatalog::new()
        .with(parse_graph_yaml(LINEAR).unwrap())
        .unwrap()
        .with(parse_graph_yaml(CLARIFY).unwrap())
        .unwrap();
    let directory = TenantDirectory::new(TenantConfig {
        graph_sequence: graphs.iter().map(|g| g.to_string()).collect(),
        resource_budget: 100.0,
        ..TenantConfig::default()
    });
    Orchestrator::new(Arc::new(store), engine, catalog, directory, bus)
}

#[tokio::test]
async fn linear_run_persists_checkpoints_and_charges_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    let o = orchestrator(store.clone(), &["linear"]);
    let acme = tenant("acme");

    let report = o.start(&acme, wf("W1"), json!({"n": 1})).await.unwrap();
    assert_eq!(report.instance.status, WorkflowStatus::Completed);

    let records = o.checkpoints(&acme, &wf("W1")).await.unwrap();
    let statuses: Vec<CheckpointStatus> = records.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![CheckpointStatus::Expired, CheckpointStatus::Expired, CheckpointStatus::Active]
    );

    let t = store.get_tenant(&acme).await.unwrap().unwrap();
    assert_eq!(t.budget_remaining, 97.0);
}

#[tokio::test]
async fn suspended_workflow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let acme = tenant("acme");

    {
        let o = orchestrator(open(dir.path()).await, &["clarify"]);
        let report = o.start(&acme, wf("W1"), json!({"q": "which db?"})).await.unwrap();
        assert_eq!(report.instance.status, WorkflowStatus::Suspended);
    }

    // A fresh process over the same database file.
    let o = orchestrator(open(dir.path()).await, &["clarify"]);
    let answer = ResumeEvent::new(wf("W1"), "answer", json!({"text": "sqlite"}));
    let report = o.handle_event(&acme, answer.clone()).await.unwrap();
    assert_eq!(report.instance.status, WorkflowStatus::Completed);
    assert_eq!(report.output, Some(json!({"text": "sqlite"})));

    let records = o.checkpoints(&acme, &wf("W1")).await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].status, CheckpointStatus::Resumed);
    assert_eq!(records[1].resumed_by, Some(answer.id));

    let again = o.handle_event(&acme, answer).await.unwrap();
    assert!(again.duplicate);
    assert_eq!(o.checkpoints(&acme, &wf("W1")).await.unwrap().len(), 3);
}

#[tokio::test]
async fn colliding_workflow_ids_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(open(dir.path()).await, &["clarify"]);
    let acme = tenant("acme");
    let beta = tenant("beta");

    o.start(&acme, wf("TICKET-1"), json!({"from": "acme"})).await.unwrap();
    o.start(&beta, wf("TICKET-1"), json!({"from": "beta"})).await.unwrap();

    let acme_records = o.checkpoints(&acme, &wf("TICKET-1")).await.unwrap();
    let beta_records = o.checkpoints(&beta, &wf("TICKET-1")).await.unwrap();
    assert_eq!(acme_records.len(), 2);
    assert_eq!(beta_records.len(), 2);
    assert!(acme_records.iter().all(|r| r.tenant_id == acme));

    let err = o.checkpoint(&beta, &acme_records[0].id).await.unwrap_err();
    assert!(matches!(err, EngineError::TenantIsolationViolation { .. }));
    assert!(!err.to_string().contains("acme"));

    // Resuming one tenant's workflow leaves the other suspended.
    o.handle_event(&beta, ResumeEvent::new(wf("TICKET-1"), "answer", json!({})))
        .await
        .unwrap();
    assert_eq!(
        o.status(&acme, &wf("TICKET-1")).await.unwrap().status,
        WorkflowStatus::Suspended
    );
}

#[tokio::test]
async fn racing_writers_cannot_both_supersede() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    let o = orchestrator(store.clone(), &["clarify"]);
    let acme = tenant("acme");
    o.start(&acme, wf("W1"), json!({})).await.unwrap();

    let active = store.load_active(&acme, &wf("W1")).await.unwrap().unwrap();
    let next = |step: &str| CheckpointWrite {
        record: CheckpointRecord {
            id: Uuid::now_v7(),
            step: step.to_string(),
            sequence: active.sequence + 1,
            created_at: Utc::now(),
            ..active.clone()
        },
        expected_active: Some(active.id),
        supersede: Supersede::Expire,
        charge: 1.0,
    };
    let (a, b) = (next("left"), next("right"));
    let budget_before = store.get_tenant(&acme).await.unwrap().unwrap().budget_remaining;

    let (ra, rb) = tokio::join!(store.save(&a), store.save(&b));
    let outcomes = [ra.is_ok(), rb.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
    assert!(matches!(loser, RepositoryError::StaleWrite { .. }));

    let records = store.list(&acme, &wf("W1")).await.unwrap();
    assert_eq!(records.iter().filter(|r| r.status == CheckpointStatus::Active).count(), 1);
    let budget_after = store.get_tenant(&acme).await.unwrap().unwrap().budget_remaining;
    assert_eq!(budget_before - budget_after, 1.0);
}
