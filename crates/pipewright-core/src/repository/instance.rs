//! Workflow instance repository trait definition.

use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{WorkflowId, WorkflowInstance, WorkflowStatus};

/// Repository trait for workflow instances.
pub trait InstanceRepository: Send + Sync {
    /// Create a new instance. Fails with `Conflict` if the id is taken
    /// within the tenant.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        tenant: &TenantId,
        id: &WorkflowId,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Persist status, current graph and timestamps.
    fn update_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Instances of a tenant, newest first, optionally filtered by status.
    fn list_instances(
        &self,
        tenant: &TenantId,
        status: Option<WorkflowStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}
