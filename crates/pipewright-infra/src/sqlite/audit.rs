//! SQLite work-unit audit log.
//!
//! Persists every `unit_invoked` event from the engine bus into
//! `unit_invocations`, one row per attempt.

use chrono::{DateTime, SecondsFormat, Utc};
use pipewright_types::error::RepositoryError;
use pipewright_types::event::EngineEvent;
use pipewright_types::tenant::TenantId;
use serde::Serialize;
use sqlx::Row;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::pool::DatabasePool;

/// One recorded work-unit attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitInvocation {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub unit: String,
    pub attempt: u32,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    pub invoked_at: DateTime<Utc>,
}

/// SQLite-backed audit log of work-unit attempts.
#[derive(Debug, Clone)]
pub struct SqliteAuditLog {
    pool: DatabasePool,
}

impl SqliteAuditLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Persist an event if it is a `unit_invoked` record. Returns whether a
    /// row was written.
    pub async fn record(&self, event: &EngineEvent) -> Result<bool, RepositoryError> {
        let EngineEvent::UnitInvoked {
            tenant_id,
            unit,
            attempt,
            duration_ms,
            success,
            failure_kind,
            at,
        } = event
        else {
            return Ok(false);
        };

        sqlx::query(
            r#"INSERT INTO unit_invocations
               (id, tenant_id, unit, attempt, duration_ms, success, failure_kind, invoked_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(tenant_id.as_str())
        .bind(unit)
        .bind(i64::from(*attempt))
        .bind(i64::try_from(*duration_ms).unwrap_or(i64::MAX))
        .bind(*success)
        .bind(failure_kind)
        .bind(format_datetime(at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(true)
    }

    /// Most recent attempts for a tenant, newest first.
    pub async fn recent(&self, tenant: &TenantId, limit: i64) -> Result<Vec<UnitInvocation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM unit_invocations WHERE tenant_id = ? ORDER BY invoked_at DESC, id DESC LIMIT ?",
        )
        .bind(tenant.as_str())
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                InvocationRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_invocation()
            })
            .collect()
    }

    /// Drain `events` into the log until the bus closes.
    ///
    /// A lagging receiver logs how many events it skipped and keeps going.
    pub async fn forward(self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.record(&event).await {
                        tracing::warn!(error = %e, "failed to persist unit invocation");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "audit forwarder lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("audit forwarder stopped");
    }
}

struct InvocationRow {
    id: String,
    tenant_id: String,
    unit: String,
    attempt: i64,
    duration_ms: i64,
    success: bool,
    failure_kind: Option<String>,
    invoked_at: String,
}

impl InvocationRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            unit: row.try_get("unit")?,
            attempt: row.try_get("attempt")?,
            duration_ms: row.try_get("duration_ms")?,
            success: row.try_get("success")?,
            failure_kind: row.try_get("failure_kind")?,
            invoked_at: row.try_get("invoked_at")?,
        })
    }

    fn into_invocation(self) -> Result<UnitInvocation, RepositoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| RepositoryError::Query(format!("invalid invocation id: {e}")))?;
        let invoked_at = DateTime::parse_from_rfc3339(&self.invoked_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| RepositoryError::Query(format!("invalid invoked_at: {e}")))?;

        Ok(UnitInvocation {
            id,
            tenant_id: TenantId::new(self.tenant_id).map_err(RepositoryError::Query)?,
            unit: self.unit,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
            success: self.success,
            failure_kind: self.failure_kind,
            invoked_at,
        })
    }
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::database_url_in;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url_in(dir.path());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn invoked(tenant: &str, attempt: u32, success: bool) -> EngineEvent {
        EngineEvent::UnitInvoked {
            tenant_id: TenantId::new(tenant).unwrap(),
            unit: "coder".to_string(),
            attempt,
            duration_ms: 12,
            success,
            failure_kind: (!success).then(|| "timeout".to_string()),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_only_unit_invocations() {
        let pool = test_pool().await;
        let log = SqliteAuditLog::new(pool);

        assert!(log.record(&invoked("acme", 1, false)).await.unwrap());
        assert!(log.record(&invoked("acme", 2, true)).await.unwrap());
        let other = EngineEvent::WorkflowCompleted {
            tenant_id: TenantId::new("acme").unwrap(),
            workflow_id: pipewright_types::workflow::WorkflowId::new("W1").unwrap(),
        };
        assert!(!log.record(&other).await.unwrap());

        let rows = log.recent(&TenantId::new("acme").unwrap(), 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].attempt, 2);
        assert!(rows[0].success);
        assert_eq!(rows[1].failure_kind.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn recent_is_tenant_scoped() {
        let log = SqliteAuditLog::new(test_pool().await);

        log.record(&invoked("acme", 1, true)).await.unwrap();
        log.record(&invoked("beta", 1, true)).await.unwrap();

        let rows = log.recent(&TenantId::new("beta").unwrap(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id.as_str(), "beta");
    }

    #[tokio::test]
    async fn forwarder_stops_when_bus_closes() {
        let pool = test_pool().await;
        let log = SqliteAuditLog::new(pool);
        let (tx, rx) = broadcast::channel(8);
        let handle = tokio::spawn(log.clone().forward(rx));

        tx.send(invoked("acme", 1, true)).unwrap();
        drop(tx);
        handle.await.unwrap();

        let rows = log.recent(&TenantId::new("acme").unwrap(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
