//! SQLite implementation of the engine storage ports.
//!
//! Implements `CheckpointStore`, `InstanceRepository` and `TenantRepository`
//! from `pipewright-core` on one `DatabasePool`. Checkpoint saves run in a
//! single write transaction, so a crash mid-save leaves the previous Active
//! checkpoint and the tenant budget untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use pipewright_core::repository::{
    CheckpointStore, CheckpointWrite, InstanceRepository, Supersede, TenantRepository,
};
use pipewright_types::checkpoint::{CheckpointRecord, CheckpointStatus};
use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::{Tenant, TenantId};
use pipewright_types::workflow::{WorkflowId, WorkflowInstance, WorkflowStatus};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed store for checkpoints, workflow instances and tenants.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    async fn fetch_checkpoint(&self, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    /// The checkpoint if `tenant` owns it, or the isolation error if another
    /// tenant does.
    async fn owned_checkpoint(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        match self.fetch_checkpoint(id).await? {
            Some(record) if &record.tenant_id != tenant => Err(RepositoryError::TenantIsolation {
                caller: tenant.to_string(),
                owner: record.tenant_id.to_string(),
                resource: format!("checkpoint {id}"),
            }),
            other => Ok(other),
        }
    }

    /// Fails unless `tenant` owns `id` and it is still Active.
    async fn require_active(&self, tenant: &TenantId, id: &Uuid) -> Result<(), RepositoryError> {
        let record = self
            .owned_checkpoint(tenant, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if record.status != CheckpointStatus::Active {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {id} is {}, not active",
                record.status
            )));
        }
        Ok(())
    }

    async fn query_checkpoints(
        &self,
        sql: &str,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(sql)
            .bind(tenant.as_str())
            .bind(workflow.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                CheckpointRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_record()
            })
            .collect()
    }

    async fn fetch_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = TenantRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_tenant()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    id: String,
    tenant_id: String,
    workflow_id: String,
    graph: String,
    step: String,
    step_index: i64,
    sequence: i64,
    status: String,
    schema_version: i64,
    state: String,
    digest: String,
    created_at: String,
    resumed_at: Option<String>,
    resumed_by: Option<String>,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            workflow_id: row.try_get("workflow_id")?,
            graph: row.try_get("graph")?,
            step: row.try_get("step")?,
            step_index: row.try_get("step_index")?,
            sequence: row.try_get("sequence")?,
            status: row.try_get("status")?,
            schema_version: row.try_get("schema_version")?,
            state: row.try_get("state")?,
            digest: row.try_get("digest")?,
            created_at: row.try_get("created_at")?,
            resumed_at: row.try_get("resumed_at")?,
            resumed_by: row.try_get("resumed_by")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let status: CheckpointStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(CheckpointRecord {
            id: parse_uuid(&self.id)?,
            workflow_id: WorkflowId::new(self.workflow_id).map_err(RepositoryError::Query)?,
            tenant_id: TenantId::new(self.tenant_id).map_err(RepositoryError::Query)?,
            graph: self.graph,
            step: self.step,
            step_index: to_unsigned(self.step_index, "step_index")? as usize,
            sequence: to_unsigned(self.sequence, "sequence")?,
            status,
            schema_version: to_unsigned(self.schema_version, "schema_version")? as u32,
            state: self.state,
            digest: self.digest,
            created_at: parse_datetime(&self.created_at)?,
            resumed_at: self.resumed_at.as_deref().map(parse_datetime).transpose()?,
            resumed_by: self.resumed_by.as_deref().map(parse_uuid).transpose()?,
        })
    }
}

struct InstanceRow {
    tenant_id: String,
    id: String,
    graph: String,
    graph_index: i64,
    status: String,
    input: String,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            id: row.try_get("id")?,
            graph: row.try_get("graph")?,
            graph_index: row.try_get("graph_index")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let input: serde_json::Value = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;

        Ok(WorkflowInstance {
            id: WorkflowId::new(self.id).map_err(RepositoryError::Query)?,
            tenant_id: TenantId::new(self.tenant_id).map_err(RepositoryError::Query)?,
            graph: self.graph,
            graph_index: to_unsigned(self.graph_index, "graph_index")? as usize,
            status,
            input,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct TenantRow {
    id: String,
    budget_remaining: f64,
    created_at: String,
    updated_at: String,
}

impl TenantRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            budget_remaining: row.try_get("budget_remaining")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_tenant(self) -> Result<Tenant, RepositoryError> {
        Ok(Tenant {
            id: TenantId::new(self.id).map_err(RepositoryError::Query)?,
            budget_remaining: self.budget_remaining,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed width, so ORDER BY on the text column is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn to_unsigned(value: i64, column: &str) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| RepositoryError::Query(format!("negative {column}: {value}")))
}

fn to_signed(value: u64, column: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Query(format!("{column} out of range: {value}")))
}

fn is_constraint(e: &sqlx::Error, needle: &str) -> bool {
    match e {
        sqlx::Error::Database(db_err) => db_err.message().contains(needle),
        _ => false,
    }
}

/// A guarded UPDATE that matched nothing lost a race with another writer.
fn ensure_changed(rows: u64, id: &Uuid) -> Result<(), RepositoryError> {
    if rows == 0 {
        return Err(RepositoryError::Conflict(format!("checkpoint {id} changed concurrently")));
    }
    Ok(())
}

fn describe(id: Option<&str>) -> String {
    id.unwrap_or("none").to_string()
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteStore {
    async fn save(&self, write: &CheckpointWrite) -> Result<Uuid, RepositoryError> {
        let record = &write.record;
        let tenant = record.tenant_id.as_str();
        let workflow = record.workflow_id.as_str();
        let now = format_datetime(&Utc::now());

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let active: Option<String> = sqlx::query_scalar(
            "SELECT id FROM checkpoints WHERE tenant_id = ? AND workflow_id = ? AND status = 'active'",
        )
        .bind(tenant)
        .bind(workflow)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let expected = write.expected_active.map(|id| id.to_string());
        if active != expected {
            return Err(RepositoryError::StaleWrite {
                expected: describe(expected.as_deref()),
                actual: describe(active.as_deref()),
            });
        }

        let latest: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM checkpoints WHERE tenant_id = ? AND workflow_id = ?",
        )
        .bind(tenant)
        .bind(workflow)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let sequence = to_signed(record.sequence, "sequence")?;
        if sequence != latest + 1 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint sequence {sequence} does not follow {latest}"
            )));
        }

        if let Some(previous) = &active {
            let query = match write.supersede {
                Supersede::Expire => {
                    sqlx::query("UPDATE checkpoints SET status = 'expired' WHERE id = ?").bind(previous)
                }
                Supersede::Resume { resume_id } => sqlx::query(
                    "UPDATE checkpoints SET status = 'resumed', resumed_at = ?, resumed_by = ? WHERE id = ?",
                )
                .bind(&now)
                .bind(resume_id.to_string())
                .bind(previous),
            };
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, tenant_id, workflow_id, graph, step, step_index, sequence, status,
                schema_version, state, digest, created_at, resumed_at, resumed_by)
               VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, NULL, NULL)"#,
        )
        .bind(record.id.to_string())
        .bind(tenant)
        .bind(workflow)
        .bind(&record.graph)
        .bind(&record.step)
        .bind(to_signed(record.step_index as u64, "step_index")?)
        .bind(sequence)
        .bind(i64::from(record.schema_version))
        .bind(&record.state)
        .bind(&record.digest)
        .bind(format_datetime(&record.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_constraint(&e, "UNIQUE") {
                RepositoryError::Conflict(format!("checkpoint {} already exists", record.id))
            } else if is_constraint(&e, "FOREIGN KEY") {
                RepositoryError::NotFound
            } else {
                RepositoryError::Query(e.to_string())
            }
        })?;

        let charged = sqlx::query(
            "UPDATE tenants SET budget_remaining = budget_remaining - ?, updated_at = ? WHERE id = ?",
        )
        .bind(write.charge)
        .bind(&now)
        .bind(tenant)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if charged.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            tenant = %record.tenant_id,
            workflow = %record.workflow_id,
            sequence = record.sequence,
            charge = write.charge,
            "checkpoint saved"
        );
        Ok(record.id)
    }

    async fn load_active(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let mut records = self
            .query_checkpoints(
                "SELECT * FROM checkpoints WHERE tenant_id = ? AND workflow_id = ? AND status = 'active'",
                tenant,
                workflow,
            )
            .await?;
        Ok(records.pop())
    }

    async fn load(&self, tenant: &TenantId, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        self.owned_checkpoint(tenant, id).await
    }

    async fn latest(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let mut records = self
            .query_checkpoints(
                "SELECT * FROM checkpoints WHERE tenant_id = ? AND workflow_id = ? ORDER BY sequence DESC LIMIT 1",
                tenant,
                workflow,
            )
            .await?;
        Ok(records.pop())
    }

    async fn mark_resumed(&self, tenant: &TenantId, id: &Uuid, resume_id: &Uuid) -> Result<(), RepositoryError> {
        self.require_active(tenant, id).await?;
        let update = sqlx::query(
            "UPDATE checkpoints SET status = 'resumed', resumed_at = ?, resumed_by = ?
             WHERE id = ? AND tenant_id = ? AND status = 'active'",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(resume_id.to_string())
        .bind(id.to_string())
        .bind(tenant.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        ensure_changed(update.rows_affected(), id)
    }

    async fn mark_cancelled(&self, tenant: &TenantId, id: &Uuid) -> Result<(), RepositoryError> {
        self.require_active(tenant, id).await?;
        let update = sqlx::query(
            "UPDATE checkpoints SET status = 'cancelled' WHERE id = ? AND tenant_id = ? AND status = 'active'",
        )
        .bind(id.to_string())
        .bind(tenant.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        ensure_changed(update.rows_affected(), id)
    }

    async fn find_resumed_by(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
        resume_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE tenant_id = ? AND workflow_id = ? AND resumed_by = ?",
        )
        .bind(tenant.as_str())
        .bind(workflow.as_str())
        .bind(resume_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, tenant: &TenantId, workflow: &WorkflowId) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        self.query_checkpoints(
            "SELECT * FROM checkpoints WHERE tenant_id = ? AND workflow_id = ? ORDER BY sequence ASC",
            tenant,
            workflow,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// InstanceRepository impl
// ---------------------------------------------------------------------------

impl InstanceRepository for SqliteStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let input = serde_json::to_string(&instance.input)
            .map_err(|e| RepositoryError::Query(format!("serialize input: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (tenant_id, id, graph, graph_index, status, input, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.tenant_id.as_str())
        .bind(instance.id.as_str())
        .bind(&instance.graph)
        .bind(to_signed(instance.graph_index as u64, "graph_index")?)
        .bind(instance.status.to_string())
        .bind(&input)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_constraint(&e, "UNIQUE") {
                RepositoryError::Conflict(format!("workflow '{}' already exists", instance.id))
            } else if is_constraint(&e, "FOREIGN KEY") {
                RepositoryError::NotFound
            } else {
                RepositoryError::Query(e.to_string())
            }
        })?;

        Ok(())
    }

    async fn get_instance(
        &self,
        tenant: &TenantId,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE tenant_id = ? AND id = ?")
            .bind(tenant.as_str())
            .bind(id.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances
               SET graph = ?, graph_index = ?, status = ?, updated_at = ?
               WHERE tenant_id = ? AND id = ?"#,
        )
        .bind(&instance.graph)
        .bind(to_signed(instance.graph_index as u64, "graph_index")?)
        .bind(instance.status.to_string())
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.tenant_id.as_str())
        .bind(instance.id.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        tenant: &TenantId,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM workflow_instances WHERE tenant_id = ? AND status = ? ORDER BY created_at DESC",
                )
                .bind(tenant.as_str())
                .bind(status.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_instances WHERE tenant_id = ? ORDER BY created_at DESC")
                    .bind(tenant.as_str())
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                InstanceRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_instance()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TenantRepository impl
// ---------------------------------------------------------------------------

impl TenantRepository for SqliteStore {
    async fn ensure_tenant(&self, id: &TenantId, initial_budget: f64) -> Result<Tenant, RepositoryError> {
        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO tenants (id, budget_remaining, created_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(id.as_str())
        .bind(initial_budget)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        self.fetch_tenant(id).await?.ok_or(RepositoryError::NotFound)
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        self.fetch_tenant(id).await
    }

    async fn set_budget(&self, id: &TenantId, remaining: f64) -> Result<Tenant, RepositoryError> {
        let result = sqlx::query("UPDATE tenants SET budget_remaining = ?, updated_at = ? WHERE id = ?")
            .bind(remaining)
            .bind(format_datetime(&Utc::now()))
            .bind(id.as_str())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        self.fetch_tenant(id).await?.ok_or(RepositoryError::NotFound)
    }
}
