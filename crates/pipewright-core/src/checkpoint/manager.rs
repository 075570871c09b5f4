//! Durable checkpoint manager for graph execution state.
//!
//! Wraps `CheckpointStore` with the codec: callers hand in typed
//! [`ExecutionState`] and get decoded [`Checkpoint`]s back, while the store
//! only ever sees encoded, digested records.

use std::sync::Arc;

use chrono::Utc;
use pipewright_types::checkpoint::{Checkpoint, CheckpointRecord, CheckpointStatus, ExecutionState};
use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::WorkflowId;
use uuid::Uuid;

use super::codec::{self, CodecError};
use crate::repository::checkpoint::{CheckpointStore, CheckpointWrite, Supersede};

/// Everything about a new checkpoint except what the store assigns.
#[derive(Debug, Clone)]
pub struct CheckpointDraft {
    pub workflow_id: WorkflowId,
    pub tenant_id: TenantId,
    pub graph: String,
    pub step: String,
    pub step_index: usize,
    pub sequence: u64,
    pub state: ExecutionState,
}

/// Errors from checkpoint management.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("checkpoint {checkpoint_id} is corrupt: {source}")]
    Corrupt {
        checkpoint_id: Uuid,
        #[source]
        source: CodecError,
    },
}

/// Manages durable execution checkpoints for workflows.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory). Every state transition is persisted before the engine
/// moves forward.
pub struct CheckpointManager<S> {
    store: Arc<S>,
}

impl<S> Clone for CheckpointManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Encode and persist a checkpoint as the workflow's new Active one.
    pub async fn save(
        &self,
        draft: CheckpointDraft,
        expected_active: Option<Uuid>,
        supersede: Supersede,
        charge: f64,
    ) -> Result<Checkpoint, CheckpointError> {
        let id = Uuid::now_v7();
        let encoded = codec::encode(&draft.state).map_err(|source| CheckpointError::Corrupt {
            checkpoint_id: id,
            source,
        })?;
        let created_at = Utc::now();

        let record = CheckpointRecord {
            id,
            workflow_id: draft.workflow_id.clone(),
            tenant_id: draft.tenant_id.clone(),
            graph: draft.graph.clone(),
            step: draft.step.clone(),
            step_index: draft.step_index,
            sequence: draft.sequence,
            status: CheckpointStatus::Active,
            schema_version: encoded.schema_version,
            state: encoded.body,
            digest: encoded.digest,
            created_at,
            resumed_at: None,
            resumed_by: None,
        };

        self.store
            .save(&CheckpointWrite {
                record,
                expected_active,
                supersede,
                charge,
            })
            .await?;

        tracing::debug!(
            tenant = %draft.tenant_id,
            workflow = %draft.workflow_id,
            step = %draft.step,
            sequence = draft.sequence,
            checkpoint_id = %id,
            "checkpoint saved"
        );

        Ok(Checkpoint {
            id,
            workflow_id: draft.workflow_id,
            tenant_id: draft.tenant_id,
            graph: draft.graph,
            step: draft.step,
            step_index: draft.step_index,
            sequence: draft.sequence,
            status: CheckpointStatus::Active,
            state: draft.state,
            created_at,
            resumed_at: None,
            resumed_by: None,
        })
    }

    pub async fn load_active(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.store.load_active(tenant, workflow).await? {
            Some(record) => Ok(Some(decode_record(record)?)),
            None => Ok(None),
        }
    }

    pub async fn load(&self, tenant: &TenantId, id: &Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.store.load(tenant, id).await? {
            Some(record) => Ok(Some(decode_record(record)?)),
            None => Ok(None),
        }
    }

    /// Undecoded latest record: sequence numbering must keep working even when
    /// the blob is unreadable.
    pub async fn latest(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.store.latest(tenant, workflow).await?)
    }

    /// Checkpoint metadata for a workflow, ordered by sequence.
    pub async fn list(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self.store.list(tenant, workflow).await?)
    }

    pub async fn find_resumed_by(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
        resume_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.store.find_resumed_by(tenant, workflow, resume_id).await?)
    }

    pub async fn mark_resumed(&self, tenant: &TenantId, id: &Uuid, resume_id: &Uuid) -> Result<(), CheckpointError> {
        self.store.mark_resumed(tenant, id, resume_id).await?;
        tracing::debug!(tenant = %tenant, checkpoint_id = %id, resume_id = %resume_id, "checkpoint resumed");
        Ok(())
    }

    pub async fn mark_cancelled(&self, tenant: &TenantId, id: &Uuid) -> Result<(), CheckpointError> {
        self.store.mark_cancelled(tenant, id).await?;
        tracing::debug!(tenant = %tenant, checkpoint_id = %id, "checkpoint cancelled");
        Ok(())
    }
}

/// Decode a persisted record into a typed checkpoint.
pub fn decode_record(record: CheckpointRecord) -> Result<Checkpoint, CheckpointError> {
    let state = codec::decode(&record.state, &record.digest).map_err(|source| CheckpointError::Corrupt {
        checkpoint_id: record.id,
        source,
    })?;
    Ok(Checkpoint {
        id: record.id,
        workflow_id: record.workflow_id,
        tenant_id: record.tenant_id,
        graph: record.graph,
        step: record.step,
        step_index: record.step_index,
        sequence: record.sequence,
        status: record.status,
        state,
        created_at: record.created_at,
        resumed_at: record.resumed_at,
        resumed_by: record.resumed_by,
    })
}
