//! In-memory implementation of every storage port.
//!
//! Used by engine tests and as the reference for the SQLite store's
//! semantics. All state sits behind one mutex, so each operation is atomic.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use pipewright_types::checkpoint::{CheckpointRecord, CheckpointStatus};
use pipewright_types::error::RepositoryError;
use pipewright_types::tenant::{Tenant, TenantId};
use pipewright_types::workflow::{WorkflowId, WorkflowInstance, WorkflowStatus};
use uuid::Uuid;

use super::checkpoint::{CheckpointStore, CheckpointWrite, Supersede};
use super::instance::InstanceRepository;
use super::tenant::TenantRepository;

#[derive(Default)]
struct Inner {
    tenants: BTreeMap<TenantId, Tenant>,
    instances: BTreeMap<(TenantId, WorkflowId), WorkflowInstance>,
    checkpoints: Vec<CheckpointRecord>,
    fail_next_save: bool,
}

impl Inner {
    fn active(&self, tenant: &TenantId, workflow: &WorkflowId) -> Option<usize> {
        self.checkpoints.iter().position(|c| {
            &c.tenant_id == tenant && &c.workflow_id == workflow && c.status == CheckpointStatus::Active
        })
    }

    fn latest_sequence(&self, tenant: &TenantId, workflow: &WorkflowId) -> u64 {
        self.checkpoints
            .iter()
            .filter(|c| &c.tenant_id == tenant && &c.workflow_id == workflow)
            .map(|c| c.sequence)
            .max()
            .unwrap_or(0)
    }

    /// Index of an owned checkpoint, or the isolation error for a foreign one.
    fn owned(&self, tenant: &TenantId, id: &Uuid) -> Result<Option<usize>, RepositoryError> {
        match self.checkpoints.iter().position(|c| &c.id == id) {
            None => Ok(None),
            Some(idx) if &self.checkpoints[idx].tenant_id == tenant => Ok(Some(idx)),
            Some(idx) => Err(RepositoryError::TenantIsolation {
                caller: tenant.to_string(),
                owner: self.checkpoints[idx].tenant_id.to_string(),
                resource: format!("checkpoint {id}"),
            }),
        }
    }
}

/// Thread-safe in-memory store. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save` fail without writing anything, as a crash
    /// between executing a step and persisting it would.
    pub fn arm_save_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next_save = true;
        }
    }

    /// Overwrite the stored state blob of a checkpoint (for corruption tests).
    pub fn tamper_state(&self, id: &Uuid, state: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(record) = inner.checkpoints.iter_mut().find(|c| &c.id == id) {
                record.state = state.into();
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        self.inner.lock().map_err(|_| RepositoryError::Connection)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl CheckpointStore for InMemoryStore {
    async fn save(&self, write: &CheckpointWrite) -> Result<Uuid, RepositoryError> {
        let mut inner = self.lock()?;
        let record = &write.record;

        let active = inner.active(&record.tenant_id, &record.workflow_id);
        let active_id = active.map(|idx| inner.checkpoints[idx].id);
        if active_id != write.expected_active {
            return Err(RepositoryError::StaleWrite {
                expected: describe(write.expected_active),
                actual: describe(active_id),
            });
        }

        let latest = inner.latest_sequence(&record.tenant_id, &record.workflow_id);
        if record.sequence != latest + 1 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint sequence {} does not follow {latest}",
                record.sequence
            )));
        }

        if !inner.tenants.contains_key(&record.tenant_id) {
            return Err(RepositoryError::NotFound);
        }

        if inner.fail_next_save {
            inner.fail_next_save = false;
            return Err(RepositoryError::Query("simulated write failure".to_string()));
        }

        let now = Utc::now();
        if let Some(idx) = active {
            let previous = &mut inner.checkpoints[idx];
            match write.supersede {
                Supersede::Expire => previous.status = CheckpointStatus::Expired,
                Supersede::Resume { resume_id } => {
                    previous.status = CheckpointStatus::Resumed;
                    previous.resumed_at = Some(now);
                    previous.resumed_by = Some(resume_id);
                }
            }
        }

        let mut stored = record.clone();
        stored.status = CheckpointStatus::Active;
        stored.resumed_at = None;
        stored.resumed_by = None;
        inner.checkpoints.push(stored);

        if let Some(tenant) = inner.tenants.get_mut(&record.tenant_id) {
            tenant.budget_remaining -= write.charge;
            tenant.updated_at = now;
        }

        Ok(record.id)
    }

    async fn load_active(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .active(tenant, workflow)
            .map(|idx| inner.checkpoints[idx].clone()))
    }

    async fn load(&self, tenant: &TenantId, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner.owned(tenant, id)?.map(|idx| inner.checkpoints[idx].clone()))
    }

    async fn latest(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .iter()
            .filter(|c| &c.tenant_id == tenant && &c.workflow_id == workflow)
            .max_by_key(|c| c.sequence)
            .cloned())
    }

    async fn mark_resumed(&self, tenant: &TenantId, id: &Uuid, resume_id: &Uuid) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let idx = inner.owned(tenant, id)?.ok_or(RepositoryError::NotFound)?;
        let record = &mut inner.checkpoints[idx];
        if record.status != CheckpointStatus::Active {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {id} is {}, not active",
                record.status
            )));
        }
        record.status = CheckpointStatus::Resumed;
        record.resumed_at = Some(Utc::now());
        record.resumed_by = Some(*resume_id);
        Ok(())
    }

    async fn mark_cancelled(&self, tenant: &TenantId, id: &Uuid) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let idx = inner.owned(tenant, id)?.ok_or(RepositoryError::NotFound)?;
        let record = &mut inner.checkpoints[idx];
        if record.status != CheckpointStatus::Active {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {id} is {}, not active",
                record.status
            )));
        }
        record.status = CheckpointStatus::Cancelled;
        Ok(())
    }

    async fn find_resumed_by(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
        resume_id: &Uuid,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .checkpoints
            .iter()
            .find(|c| {
                &c.tenant_id == tenant && &c.workflow_id == workflow && c.resumed_by.as_ref() == Some(resume_id)
            })
            .cloned())
    }

    async fn list(&self, tenant: &TenantId, workflow: &WorkflowId) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        let mut records: Vec<_> = inner
            .checkpoints
            .iter()
            .filter(|c| &c.tenant_id == tenant && &c.workflow_id == workflow)
            .cloned()
            .collect();
        records.sort_by_key(|c| c.sequence);
        Ok(records)
    }
}

impl InstanceRepository for InMemoryStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let key = (instance.tenant_id.clone(), instance.id.clone());
        if inner.instances.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "workflow '{}' already exists",
                instance.id
            )));
        }
        inner.instances.insert(key, instance.clone());
        Ok(())
    }

    async fn get_instance(
        &self,
        tenant: &TenantId,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner.instances.get(&(tenant.clone(), id.clone())).cloned())
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let key = (instance.tenant_id.clone(), instance.id.clone());
        match inner.instances.get_mut(&key) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_instances(
        &self,
        tenant: &TenantId,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let inner = self.lock()?;
        let mut instances: Vec<_> = inner
            .instances
            .values()
            .filter(|i| &i.tenant_id == tenant)
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(instances)
    }
}

impl TenantRepository for InMemoryStore {
    async fn ensure_tenant(&self, id: &TenantId, initial_budget: f64) -> Result<Tenant, RepositoryError> {
        let mut inner = self.lock()?;
        let tenant = inner
            .tenants
            .entry(id.clone())
            .or_insert_with(|| Tenant::new(id.clone(), initial_budget));
        Ok(tenant.clone())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner.tenants.get(id).cloned())
    }

    async fn set_budget(&self, id: &TenantId, remaining: f64) -> Result<Tenant, RepositoryError> {
        let mut inner = self.lock()?;
        let tenant = inner.tenants.get_mut(id).ok_or(RepositoryError::NotFound)?;
        tenant.budget_remaining = remaining;
        tenant.updated_at = Utc::now();
        Ok(tenant.clone())
    }
}

fn describe(id: Option<Uuid>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn wf(id: &str) -> WorkflowId {
        WorkflowId::new(id).unwrap()
    }

    fn record(tenant_id: &TenantId, workflow_id: &WorkflowId, sequence: u64) -> CheckpointRecord {
        CheckpointRecord {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.clone(),
            tenant_id: tenant_id.clone(),
            graph: "intake".to_string(),
            step: format!("step-{sequence}"),
            step_index: sequence as usize - 1,
            sequence,
            status: CheckpointStatus::Active,
            schema_version: 2,
            state: "{}".to_string(),
            digest: String::new(),
            created_at: Utc::now(),
            resumed_at: None,
            resumed_by: None,
        }
    }

    fn write(record: CheckpointRecord, expected_active: Option<Uuid>, charge: f64) -> CheckpointWrite {
        CheckpointWrite {
            record,
            expected_active,
            supersede: Supersede::Expire,
            charge,
        }
    }

    #[tokio::test]
    async fn save_supersedes_previous_and_charges_budget() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let w1 = wf("W1");
        store.ensure_tenant(&acme, 10.0).await.unwrap();

        let first = store.save(&write(record(&acme, &w1, 1), None, 1.5)).await.unwrap();
        let second = store.save(&write(record(&acme, &w1, 2), Some(first), 2.0)).await.unwrap();

        let all = store.list(&acme, &w1).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, CheckpointStatus::Expired);
        assert_eq!(all[1].status, CheckpointStatus::Active);
        assert_eq!(store.load_active(&acme, &w1).await.unwrap().unwrap().id, second);

        let t = store.get_tenant(&acme).await.unwrap().unwrap();
        assert!((t.budget_remaining - 6.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stale_write_is_rejected_without_side_effects() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let w1 = wf("W1");
        store.ensure_tenant(&acme, 10.0).await.unwrap();
        store.save(&write(record(&acme, &w1, 1), None, 1.0)).await.unwrap();

        let err = store
            .save(&write(record(&acme, &w1, 2), Some(Uuid::now_v7()), 5.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::StaleWrite { .. }));

        assert_eq!(store.list(&acme, &w1).await.unwrap().len(), 1);
        let t = store.get_tenant(&acme).await.unwrap().unwrap();
        assert!((t.budget_remaining - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sequence_gap_is_a_conflict() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let w1 = wf("W1");
        store.ensure_tenant(&acme, 10.0).await.unwrap();

        let err = store.save(&write(record(&acme, &w1, 2), None, 0.0)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn armed_failure_writes_nothing() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let w1 = wf("W1");
        store.ensure_tenant(&acme, 10.0).await.unwrap();
        store.arm_save_failure();

        assert!(store.save(&write(record(&acme, &w1, 1), None, 3.0)).await.is_err());
        assert!(store.load_active(&acme, &w1).await.unwrap().is_none());
        let t = store.get_tenant(&acme).await.unwrap().unwrap();
        assert!((t.budget_remaining - 10.0).abs() < 1e-9);

        // Only the next save fails.
        assert!(store.save(&write(record(&acme, &w1, 1), None, 3.0)).await.is_ok());
    }

    #[tokio::test]
    async fn colliding_workflow_ids_stay_separate() {
        let store = InMemoryStore::new();
        let (x, y) = (tenant("x"), tenant("y"));
        let w1 = wf("W1");
        store.ensure_tenant(&x, 10.0).await.unwrap();
        store.ensure_tenant(&y, 10.0).await.unwrap();

        let xs = store.save(&write(record(&x, &w1, 1), None, 0.0)).await.unwrap();
        assert!(store.load_active(&y, &w1).await.unwrap().is_none());

        let ys = store.save(&write(record(&y, &w1, 1), None, 0.0)).await.unwrap();
        assert_eq!(store.load_active(&y, &w1).await.unwrap().unwrap().id, ys);
        assert_eq!(store.load_active(&x, &w1).await.unwrap().unwrap().id, xs);
    }

    #[tokio::test]
    async fn foreign_checkpoint_load_is_an_isolation_error() {
        let store = InMemoryStore::new();
        let (x, y) = (tenant("x"), tenant("y"));
        let w1 = wf("W1");
        store.ensure_tenant(&x, 10.0).await.unwrap();
        let id = store.save(&write(record(&x, &w1, 1), None, 0.0)).await.unwrap();

        let err = store.load(&y, &id).await.unwrap_err();
        assert!(matches!(err, RepositoryError::TenantIsolation { .. }));
        let err = store.mark_resumed(&y, &id, &Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::TenantIsolation { .. }));
    }

    #[tokio::test]
    async fn mark_resumed_records_the_event_once() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let w1 = wf("W1");
        store.ensure_tenant(&acme, 10.0).await.unwrap();
        let id = store.save(&write(record(&acme, &w1, 1), None, 0.0)).await.unwrap();
        let resume_id = Uuid::now_v7();

        store.mark_resumed(&acme, &id, &resume_id).await.unwrap();
        let found = store.find_resumed_by(&acme, &w1, &resume_id).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, CheckpointStatus::Resumed);

        let again = store.mark_resumed(&acme, &id, &resume_id).await.unwrap_err();
        assert!(matches!(again, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_instance_is_a_conflict() {
        let store = InMemoryStore::new();
        let acme = tenant("acme");
        let instance = WorkflowInstance::new(wf("W1"), acme.clone(), "intake", serde_json::Value::Null);
        store.create_instance(&instance).await.unwrap();
        let err = store.create_instance(&instance).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let listed = store.list_instances(&acme, Some(WorkflowStatus::Running)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_instances(&acme, Some(WorkflowStatus::Failed)).await.unwrap().is_empty());
    }
}
