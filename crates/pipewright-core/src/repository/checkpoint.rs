//! Checkpoint store trait definition.

use pipewright_types::checkpoint::CheckpointRecord;
use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::WorkflowId;
use uuid::Uuid;

/// What happens to the previously Active checkpoint when a new one is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supersede {
    /// Ordinary progress: the previous checkpoint becomes Expired.
    Expire,
    /// The previous checkpoint was consumed by the given resume event.
    Resume { resume_id: Uuid },
}

/// A checkpoint write, applied atomically.
///
/// A save either fully happens or not at all: the stale check, the sequence
/// check, superseding the prior Active checkpoint, inserting the new record as
/// Active and charging the tenant budget are one transaction.
#[derive(Debug, Clone)]
pub struct CheckpointWrite {
    /// The new record. Its status is ignored; it is stored as Active.
    pub record: CheckpointRecord,
    /// Id of the checkpoint the writer believes is currently Active.
    pub expected_active: Option<Uuid>,
    pub supersede: Supersede,
    /// Resources consumed since the previous checkpoint, deducted from the
    /// tenant's remaining budget in the same transaction.
    pub charge: f64,
}

/// Storage port for checkpoints.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint. Fails with `StaleWrite` when `expected_active`
    /// does not name the current Active checkpoint, and with `Conflict` when
    /// the record's sequence is not exactly one past the latest.
    fn save(
        &self,
        write: &CheckpointWrite,
    ) -> impl std::future::Future<Output = Result<Uuid, RepositoryError>> + Send;

    /// The Active checkpoint of a workflow, if any.
    fn load_active(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// A checkpoint by id.
    fn load(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// The checkpoint with the highest sequence, whatever its status.
    fn latest(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Mark an Active checkpoint as consumed by a resume event.
    fn mark_resumed(
        &self,
        tenant: &TenantId,
        id: &Uuid,
        resume_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark an Active checkpoint as Cancelled.
    fn mark_cancelled(
        &self,
        tenant: &TenantId,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The checkpoint already consumed by the given resume event, if any.
    fn find_resumed_by(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
        resume_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// All checkpoints of a workflow ordered by sequence ascending.
    fn list(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;
}
