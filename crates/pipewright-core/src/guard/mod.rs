//! Tenant & resource guard.
//!
//! [`TenantGuard`] stands between the engine and both the store and the work
//! units. It injects the tenant id into every call, verifies the tenant of
//! every record it hands back, refuses work once the tenant's budget is
//! negative, and routes consumption through a [`ResourceMeter`] whose pending
//! amount is charged in the same transaction as the next checkpoint.

pub mod context;
pub mod meter;

pub use context::{TenantContext, TenantDirectory};
pub use meter::{BudgetStatus, ResourceMeter};

use std::sync::Arc;
use std::time::Duration;

use pipewright_types::checkpoint::{Checkpoint, CheckpointRecord};
use pipewright_types::config::TenantConfig;
use pipewright_types::error::RepositoryError;
use pipewright_types::event::EngineEvent;
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{WorkflowId, WorkflowInstance};
use uuid::Uuid;

use crate::checkpoint::{CheckpointDraft, CheckpointError, CheckpointManager};
use crate::error::EngineError;
use crate::event::bus::EventBus;
use crate::repository::{EngineStore, Supersede};
use crate::unit::{RetryPolicy, UnitExecutor, UnitReport};

/// Guarded access to storage and work units for one tenant.
pub struct TenantGuard<S> {
    ctx: TenantContext,
    store: Arc<S>,
    checkpoints: CheckpointManager<S>,
    meter: ResourceMeter,
    retry: RetryPolicy,
    events: EventBus,
}

impl<S> Clone for TenantGuard<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            store: Arc::clone(&self.store),
            checkpoints: self.checkpoints.clone(),
            meter: self.meter.clone(),
            retry: self.retry.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: EngineStore> TenantGuard<S> {
    /// Open a guard for a run segment, creating the tenant record with its
    /// configured budget on first use.
    pub async fn open(ctx: TenantContext, store: Arc<S>, events: EventBus) -> Result<Self, EngineError> {
        let tenant = store
            .ensure_tenant(&ctx.tenant_id, ctx.config.resource_budget)
            .await?;
        let retry = RetryPolicy::from(&ctx.config.retry);
        Ok(Self {
            checkpoints: CheckpointManager::new(Arc::clone(&store)),
            meter: ResourceMeter::new(tenant.budget_remaining),
            ctx,
            store,
            retry,
            events,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.ctx.tenant_id
    }

    pub fn config(&self) -> &TenantConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.meter
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Isolation
    // -----------------------------------------------------------------------

    /// Fail with a logged violation unless `owner` is the caller's tenant.
    pub fn verify(&self, owner: &TenantId, resource: &str) -> Result<(), EngineError> {
        if owner == &self.ctx.tenant_id {
            return Ok(());
        }
        Err(self.violation(owner.to_string(), resource.to_string()))
    }

    fn violation(&self, owner: String, resource: String) -> EngineError {
        tracing::error!(
            target: "pipewright::security",
            caller = %self.ctx.tenant_id,
            owner = %owner,
            resource = %resource,
            "tenant isolation violation"
        );
        if let Ok(owner_id) = TenantId::new(owner.clone()) {
            self.events.publish(EngineEvent::TenantViolation {
                caller: self.ctx.tenant_id.clone(),
                owner: owner_id,
                resource: resource.clone(),
            });
        }
        EngineError::TenantIsolationViolation {
            caller: self.ctx.tenant_id.to_string(),
            owner,
            resource,
        }
    }

    /// Convert a storage error, reporting isolation failures as security events.
    fn storage(&self, err: RepositoryError) -> EngineError {
        match err {
            RepositoryError::TenantIsolation { owner, resource, .. } => self.violation(owner, resource),
            other => other.into(),
        }
    }

    fn checkpoint(&self, err: CheckpointError) -> EngineError {
        match err {
            CheckpointError::Repository(e) => self.storage(e),
            corrupt => corrupt.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Budget
    // -----------------------------------------------------------------------

    /// Stored remaining budget, failing once it has gone negative.
    pub async fn remaining(&self) -> Result<f64, EngineError> {
        let tenant = self
            .store
            .get_tenant(&self.ctx.tenant_id)
            .await
            .map_err(|e| self.storage(e))?
            .ok_or_else(|| EngineError::NotFound(format!("tenant '{}'", self.ctx.tenant_id)))?;
        if tenant.is_exhausted() {
            return Err(EngineError::ResourceBudgetExceeded {
                tenant: self.ctx.tenant_id.to_string(),
                remaining: tenant.budget_remaining,
            });
        }
        Ok(tenant.budget_remaining)
    }

    /// Refuse work when the remaining budget, less what this segment has
    /// consumed but not yet charged, is negative.
    pub async fn check_budget(&self) -> Result<(), EngineError> {
        let projected = self.remaining().await? - self.meter.pending();
        if projected < 0.0 {
            tracing::warn!(tenant = %self.ctx.tenant_id, projected, "resource budget exhausted");
            return Err(EngineError::ResourceBudgetExceeded {
                tenant: self.ctx.tenant_id.to_string(),
                remaining: projected,
            });
        }
        Ok(())
    }

    fn record(&self, consumed: f64) {
        if self.meter.record(consumed) == BudgetStatus::Warning {
            let spent = self.meter.total();
            let remaining = self.meter.baseline() - spent;
            tracing::warn!(
                tenant = %self.ctx.tenant_id,
                consumed = spent,
                remaining,
                "resource budget 80% consumed"
            );
            self.events.publish(EngineEvent::BudgetWarning {
                tenant_id: self.ctx.tenant_id.clone(),
                consumed: spent,
                remaining,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Work units
    // -----------------------------------------------------------------------

    /// Execute a work unit for this tenant. Consumption, including that of
    /// failed attempts, is metered either way.
    pub async fn execute(
        &self,
        executor: &UnitExecutor,
        unit: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<UnitReport, EngineError> {
        self.check_budget().await?;
        match executor
            .execute(&self.ctx.tenant_id, unit, input, timeout, &self.retry)
            .await
        {
            Ok(report) => {
                self.record(report.consumed);
                Ok(report)
            }
            Err(err) => {
                self.record(err.consumed());
                Err(err.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn verify_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        self.verify(&checkpoint.tenant_id, &format!("checkpoint {}", checkpoint.id))
    }

    fn verify_record(&self, record: &CheckpointRecord) -> Result<(), EngineError> {
        self.verify(&record.tenant_id, &format!("checkpoint {}", record.id))
    }

    pub async fn load_active(&self, workflow: &WorkflowId) -> Result<Option<Checkpoint>, EngineError> {
        let checkpoint = self
            .checkpoints
            .load_active(&self.ctx.tenant_id, workflow)
            .await
            .map_err(|e| self.checkpoint(e))?;
        if let Some(cp) = &checkpoint {
            self.verify_checkpoint(cp)?;
        }
        Ok(checkpoint)
    }

    pub async fn load(&self, id: &Uuid) -> Result<Option<Checkpoint>, EngineError> {
        let checkpoint = self
            .checkpoints
            .load(&self.ctx.tenant_id, id)
            .await
            .map_err(|e| self.checkpoint(e))?;
        if let Some(cp) = &checkpoint {
            self.verify_checkpoint(cp)?;
        }
        Ok(checkpoint)
    }

    pub async fn latest(&self, workflow: &WorkflowId) -> Result<Option<CheckpointRecord>, EngineError> {
        let record = self
            .checkpoints
            .latest(&self.ctx.tenant_id, workflow)
            .await
            .map_err(|e| self.checkpoint(e))?;
        if let Some(r) = &record {
            self.verify_record(r)?;
        }
        Ok(record)
    }

    pub async fn list(&self, workflow: &WorkflowId) -> Result<Vec<CheckpointRecord>, EngineError> {
        let records = self
            .checkpoints
            .list(&self.ctx.tenant_id, workflow)
            .await
            .map_err(|e| self.checkpoint(e))?;
        for record in &records {
            self.verify_record(record)?;
        }
        Ok(records)
    }

    pub async fn find_resumed_by(
        &self,
        workflow: &WorkflowId,
        resume_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, EngineError> {
        let record = self
            .checkpoints
            .find_resumed_by(&self.ctx.tenant_id, workflow, resume_id)
            .await
            .map_err(|e| self.checkpoint(e))?;
        if let Some(r) = &record {
            self.verify_record(r)?;
        }
        Ok(record)
    }

    /// Persist a step's checkpoint and charge the metered consumption in the
    /// same write. On failure nothing is charged and the amount stays pending.
    pub async fn commit(
        &self,
        mut draft: CheckpointDraft,
        expected_active: Option<Uuid>,
        supersede: Supersede,
    ) -> Result<Checkpoint, EngineError> {
        self.verify(&draft.tenant_id, &format!("workflow {}", draft.workflow_id))?;
        self.remaining().await?;

        let charge = self.meter.take();
        draft.state.consumed += charge;
        match self.checkpoints.save(draft, expected_active, supersede, charge).await {
            Ok(checkpoint) => Ok(checkpoint),
            Err(err) => {
                self.meter.restore(charge);
                Err(self.checkpoint(err))
            }
        }
    }

    pub async fn mark_resumed(&self, id: &Uuid, resume_id: &Uuid) -> Result<(), EngineError> {
        self.checkpoints
            .mark_resumed(&self.ctx.tenant_id, id, resume_id)
            .await
            .map_err(|e| self.checkpoint(e))
    }

    pub async fn mark_cancelled(&self, id: &Uuid) -> Result<(), EngineError> {
        self.checkpoints
            .mark_cancelled(&self.ctx.tenant_id, id)
            .await
            .map_err(|e| self.checkpoint(e))
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub async fn instance(&self, workflow: &WorkflowId) -> Result<Option<WorkflowInstance>, EngineError> {
        let instance = self
            .store
            .get_instance(&self.ctx.tenant_id, workflow)
            .await
            .map_err(|e| self.storage(e))?;
        if let Some(i) = &instance {
            self.verify(&i.tenant_id, &format!("workflow {}", i.id))?;
        }
        Ok(instance)
    }

    pub async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        self.verify(&instance.tenant_id, &format!("workflow {}", instance.id))?;
        self.store
            .create_instance(instance)
            .await
            .map_err(|e| self.storage(e))
    }

    pub async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), EngineError> {
        self.verify(&instance.tenant_id, &format!("workflow {}", instance.id))?;
        self.store
            .update_instance(instance)
            .await
            .map_err(|e| self.storage(e))
    }
}
