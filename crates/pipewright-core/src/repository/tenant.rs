//! Tenant repository trait definition.

use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::{Tenant, TenantId};

/// Repository trait for tenants and their resource budgets.
pub trait TenantRepository: Send + Sync {
    /// Return the tenant, creating it with `initial_budget` if absent.
    fn ensure_tenant(
        &self,
        id: &TenantId,
        initial_budget: f64,
    ) -> impl std::future::Future<Output = Result<Tenant, RepositoryError>> + Send;

    fn get_tenant(
        &self,
        id: &TenantId,
    ) -> impl std::future::Future<Output = Result<Option<Tenant>, RepositoryError>> + Send;

    /// Overwrite the remaining budget. Fails with `NotFound` for an unknown tenant.
    fn set_budget(
        &self,
        id: &TenantId,
        remaining: f64,
    ) -> impl std::future::Future<Output = Result<Tenant, RepositoryError>> + Send;
}
