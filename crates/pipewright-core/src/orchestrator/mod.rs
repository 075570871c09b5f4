//! Workflow orchestrator: routes each instance through its tenant's graph
//! sequence.
//!
//! Every operation on an instance holds that instance's lock, so at most one
//! step of a workflow is in flight at a time. Instances of different tenants,
//! or different workflows of one tenant, proceed independently.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use pipewright_types::checkpoint::{Checkpoint, CheckpointRecord, CheckpointStatus};
use pipewright_types::event::{EngineEvent, EscalationPayload};
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::{
    RESUME_FORCE_APPROVE, RESUME_RETRY, ResumeEvent, WorkflowId, WorkflowInstance, WorkflowStatus,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::decode_record;
use crate::error::EngineError;
use crate::event::bus::EventBus;
use crate::graph::{GraphCatalog, GraphEngine, GraphOutcome, GraphRun, halted_outcome};
use crate::guard::{TenantDirectory, TenantGuard};
use crate::repository::{EngineStore, InstanceRepository};

type InstanceKey = (TenantId, WorkflowId);

/// Where an instance stands after an orchestrator call returned.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub instance: WorkflowInstance,
    /// Output of the final graph, once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Set when the instance failed or escalated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationPayload>,
    /// The resume event had already been applied; nothing ran.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl WorkflowReport {
    fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            output: None,
            escalation: None,
            duplicate: false,
        }
    }
}

pub struct Orchestrator<S: EngineStore> {
    store: Arc<S>,
    engine: GraphEngine,
    catalog: GraphCatalog,
    directory: TenantDirectory,
    events: EventBus,
    locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
    inflight: DashMap<InstanceKey, CancellationToken>,
}

impl<S: EngineStore> Orchestrator<S> {
    pub fn new(
        store: Arc<S>,
        engine: GraphEngine,
        catalog: GraphCatalog,
        directory: TenantDirectory,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            engine,
            catalog,
            directory,
            events,
            locks: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn catalog(&self) -> &GraphCatalog {
        &self.catalog
    }

    pub fn directory(&self) -> &TenantDirectory {
        &self.directory
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Open a guard for `tenant` with its configured settings.
    pub async fn guard(&self, tenant: &TenantId) -> Result<TenantGuard<S>, EngineError> {
        TenantGuard::open(self.directory.context(tenant), Arc::clone(&self.store), self.events.clone()).await
    }

    fn lock(&self, tenant: &TenantId, workflow: &WorkflowId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry((tenant.clone(), workflow.clone()))
                .or_default()
                .value(),
        )
    }

    /// Forget the lock of an instance that reached a terminal status.
    fn release(&self, instance: &WorkflowInstance) {
        if instance.status.is_terminal() {
            self.locks.remove(&(instance.tenant_id.clone(), instance.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Register a new instance on the first graph of the tenant's sequence
    /// without running anything.
    pub async fn admit(
        &self,
        tenant: &TenantId,
        workflow: WorkflowId,
        input: Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let guard = self.guard(tenant).await?;
        let first = self.first_graph(&guard)?;

        let lock = self.lock(tenant, &workflow);
        let _held = lock.lock().await;

        let instance = WorkflowInstance::new(workflow, tenant.clone(), first.clone(), input);
        guard.create_instance(&instance).await?;

        tracing::info!(tenant = %tenant, workflow = %instance.id, graph = %first, "workflow started");
        self.events.publish(EngineEvent::WorkflowStarted {
            tenant_id: tenant.clone(),
            workflow_id: instance.id.clone(),
            graph: first,
        });
        Ok(instance)
    }

    /// Start a workflow and run it until it completes, suspends, escalates or
    /// fails.
    pub async fn start(
        &self,
        tenant: &TenantId,
        workflow: WorkflowId,
        input: Value,
    ) -> Result<WorkflowReport, EngineError> {
        let instance = self.admit(tenant, workflow, input).await?;
        self.run(tenant, &instance.id).await
    }

    /// Run an admitted or interrupted instance from wherever its checkpoints
    /// say it is.
    pub async fn run(&self, tenant: &TenantId, workflow: &WorkflowId) -> Result<WorkflowReport, EngineError> {
        let guard = self.guard(tenant).await?;
        let lock = self.lock(tenant, workflow);
        let _held = lock.lock().await;

        let instance = guard
            .instance(workflow)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow}'")))?;
        if instance.status != WorkflowStatus::Running {
            self.release(&instance);
            return Ok(WorkflowReport::new(instance));
        }
        self.continue_instance(&guard, instance).await
    }

    /// Deliver an external event to a suspended or escalated workflow.
    pub async fn handle_event(&self, tenant: &TenantId, event: ResumeEvent) -> Result<WorkflowReport, EngineError> {
        let guard = self.guard(tenant).await?;
        let lock = self.lock(tenant, &event.workflow_id);
        let _held = lock.lock().await;

        let mut instance = guard
            .instance(&event.workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}'", event.workflow_id)))?;

        if guard.find_resumed_by(&event.workflow_id, &event.id).await?.is_some() {
            tracing::info!(tenant = %tenant, workflow = %instance.id, event_id = %event.id, "duplicate event ignored");
            self.release(&instance);
            return Ok(WorkflowReport {
                duplicate: true,
                ..WorkflowReport::new(instance)
            });
        }

        match instance.status {
            WorkflowStatus::Suspended => {}
            WorkflowStatus::Escalated => {
                if event.resume_type != RESUME_RETRY && event.resume_type != RESUME_FORCE_APPROVE {
                    return Err(EngineError::InvalidResume {
                        expected: Some(format!("{RESUME_RETRY} | {RESUME_FORCE_APPROVE}")),
                        received: event.resume_type.clone(),
                        reason: "workflow is escalated".to_string(),
                    });
                }
            }
            status => {
                self.release(&instance);
                return Err(EngineError::Conflict(format!(
                    "workflow '{}' is {status} and cannot accept events",
                    instance.id
                )));
            }
        }

        let run = match self.engine.prepare_resume(&guard, &event).await {
            Ok(Some(run)) => run,
            Ok(None) => return self.settle(&guard, instance, Ok(GraphOutcome::Duplicate)).await,
            Err(e) if e.is_fatal() => return self.settle(&guard, instance, Err(e)).await,
            Err(e) => return Err(e),
        };

        transition(&mut instance, WorkflowStatus::Running);
        guard.update_instance(&instance).await?;
        self.advance(&guard, instance, run).await
    }

    /// Cancel a workflow. An in-flight segment is signalled and given the
    /// configured grace period; a waiting one is cancelled directly.
    pub async fn cancel(&self, tenant: &TenantId, workflow: &WorkflowId) -> Result<WorkflowInstance, EngineError> {
        let key = (tenant.clone(), workflow.clone());
        let signalled = match self.inflight.get(&key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };

        let guard = self.guard(tenant).await?;
        let lock = self.lock(tenant, workflow);
        let _held = lock.lock().await;

        let mut instance = guard
            .instance(workflow)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow}'")))?;
        if instance.status == WorkflowStatus::Cancelled && signalled {
            self.release(&instance);
            return Ok(instance);
        }
        if instance.status.is_terminal() {
            self.release(&instance);
            return Err(EngineError::Conflict(format!(
                "workflow '{workflow}' is already {}",
                instance.status
            )));
        }

        self.engine.cancel(&guard, workflow).await?;
        transition(&mut instance, WorkflowStatus::Cancelled);
        guard.update_instance(&instance).await?;
        self.publish_cancelled(&instance);
        self.release(&instance);
        Ok(instance)
    }

    pub async fn status(&self, tenant: &TenantId, workflow: &WorkflowId) -> Result<WorkflowInstance, EngineError> {
        self.guard(tenant)
            .await?
            .instance(workflow)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{workflow}'")))
    }

    /// Checkpoint history of a workflow, oldest first.
    pub async fn checkpoints(
        &self,
        tenant: &TenantId,
        workflow: &WorkflowId,
    ) -> Result<Vec<CheckpointRecord>, EngineError> {
        self.guard(tenant).await?.list(workflow).await
    }

    /// One decoded checkpoint by id.
    pub async fn checkpoint(&self, tenant: &TenantId, id: &uuid::Uuid) -> Result<Checkpoint, EngineError> {
        self.guard(tenant)
            .await?
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("checkpoint {id}")))
    }

    pub async fn list(
        &self,
        tenant: &TenantId,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.store.list_instances(tenant, status).await?)
    }

    /// Continue every Running instance of a tenant after a restart.
    ///
    /// Instances that fail to recover are logged and skipped.
    pub async fn recover(&self, tenant: &TenantId) -> Result<Vec<WorkflowReport>, EngineError> {
        let running = self.list(tenant, Some(WorkflowStatus::Running)).await?;
        tracing::info!(tenant = %tenant, instances = running.len(), "recovering running workflows");

        let mut reports = Vec::with_capacity(running.len());
        for instance in running {
            match self.run(tenant, &instance.id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, workflow = %instance.id, error = %e, "recovery deferred");
                }
            }
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    fn first_graph(&self, guard: &TenantGuard<S>) -> Result<String, EngineError> {
        let sequence = &guard.config().graph_sequence;
        self.catalog.validate_sequence(sequence)?;
        sequence
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Validation("graph sequence is empty".to_string()))
    }

    /// Rebuild a Running instance's position from its checkpoints and go on.
    async fn continue_instance(
        &self,
        guard: &TenantGuard<S>,
        instance: WorkflowInstance,
    ) -> Result<WorkflowReport, EngineError> {
        let active = match self.engine.recover(guard, &instance.id).await {
            Ok(active) => active,
            Err(e) => return self.settle(guard, instance, Err(e)).await,
        };

        if let Some(run) = active {
            if let Some(outcome) = halted_outcome(&run.state) {
                return self.settle(guard, instance, Ok(outcome)).await;
            }
            return self.advance(guard, instance, run).await;
        }

        let Some(latest) = guard.latest(&instance.id).await? else {
            let graph = guard
                .config()
                .graph_sequence
                .get(instance.graph_index)
                .cloned()
                .unwrap_or_else(|| instance.graph.clone());
            let run = GraphRun::start(instance.id.clone(), &graph, instance.input.clone());
            return self.advance(guard, instance, run).await;
        };

        // No Active checkpoint left: the workflow ended before its instance
        // record caught up.
        let status = latest.status;
        let outcome = match status {
            CheckpointStatus::Resumed => match decode_record(latest) {
                Ok(cp) => Ok(GraphOutcome::Completed {
                    output: cp.state.last_output,
                }),
                Err(e) => Err(e.into()),
            },
            CheckpointStatus::Cancelled => Err(EngineError::Cancelled),
            _ => Err(EngineError::Unrecoverable(format!(
                "latest checkpoint {} is {status} with no active successor",
                latest.id
            ))),
        };
        self.settle(guard, instance, outcome).await
    }

    async fn advance(
        &self,
        guard: &TenantGuard<S>,
        mut instance: WorkflowInstance,
        run: GraphRun,
    ) -> Result<WorkflowReport, EngineError> {
        let key = (instance.tenant_id.clone(), instance.id.clone());
        let token = CancellationToken::new();
        self.inflight.insert(key.clone(), token.clone());

        let result = self.drive_sequence(guard, &mut instance, run, &token).await;

        self.inflight.remove(&key);
        self.settle(guard, instance, result).await
    }

    /// Drive graphs of the tenant's sequence, chaining each completed graph's
    /// output into the next, until one halts or the last completes.
    async fn drive_sequence(
        &self,
        guard: &TenantGuard<S>,
        instance: &mut WorkflowInstance,
        mut run: GraphRun,
        cancel: &CancellationToken,
    ) -> Result<GraphOutcome, EngineError> {
        let sequence = guard.config().graph_sequence.clone();
        loop {
            let graph = self.catalog.get(run.graph())?;
            let index = sequence.iter().position(|name| name == &graph.name).ok_or_else(|| {
                EngineError::Validation(format!("graph '{}' is not in the tenant's sequence", graph.name))
            })?;

            if instance.graph != graph.name || instance.graph_index != index {
                instance.graph = graph.name.clone();
                instance.graph_index = index;
                instance.updated_at = Utc::now();
                guard.update_instance(instance).await?;
            }

            let output = match self.engine.drive(guard, &graph, &mut run, cancel).await? {
                GraphOutcome::Completed { output } => output,
                halted => return Ok(halted),
            };

            let next = sequence.get(index + 1).cloned();
            tracing::info!(
                tenant = %guard.tenant(),
                workflow = %instance.id,
                graph = %graph.name,
                next = next.as_deref().unwrap_or("-"),
                "graph completed"
            );
            self.events.publish(EngineEvent::GraphCompleted {
                tenant_id: guard.tenant().clone(),
                workflow_id: instance.id.clone(),
                graph: graph.name.clone(),
                next_graph: next.clone(),
            });

            match next {
                Some(next) => run = run.chain(&next, output),
                None => {
                    self.engine.finish(guard, &mut run).await?;
                    return Ok(GraphOutcome::Completed { output });
                }
            }
        }
    }

    /// Record where a segment ended on the instance and publish it.
    ///
    /// Non-fatal errors leave the instance as it is and are returned; fatal
    /// ones fail the instance and are reported.
    async fn settle(
        &self,
        guard: &TenantGuard<S>,
        mut instance: WorkflowInstance,
        result: Result<GraphOutcome, EngineError>,
    ) -> Result<WorkflowReport, EngineError> {
        let tenant = guard.tenant().clone();
        match result {
            Ok(GraphOutcome::Completed { output }) => {
                transition(&mut instance, WorkflowStatus::Completed);
                guard.update_instance(&instance).await?;
                tracing::info!(tenant = %tenant, workflow = %instance.id, "workflow completed");
                self.events.publish(EngineEvent::WorkflowCompleted {
                    tenant_id: tenant,
                    workflow_id: instance.id.clone(),
                });
                self.release(&instance);
                Ok(WorkflowReport {
                    output: Some(output),
                    ..WorkflowReport::new(instance)
                })
            }
            Ok(GraphOutcome::Suspended { .. }) => {
                transition(&mut instance, WorkflowStatus::Suspended);
                guard.update_instance(&instance).await?;
                Ok(WorkflowReport::new(instance))
            }
            Ok(GraphOutcome::Escalated { step, history, gaps }) => {
                transition(&mut instance, WorkflowStatus::Escalated);
                guard.update_instance(&instance).await?;
                tracing::warn!(
                    tenant = %tenant,
                    workflow = %instance.id,
                    step = %step,
                    iterations = history.len(),
                    "workflow escalated"
                );
                self.events.publish(EngineEvent::EscalationRaised {
                    tenant_id: tenant.clone(),
                    workflow_id: instance.id.clone(),
                    iteration_history: history.clone(),
                    outstanding_gaps: gaps.clone(),
                });
                let payload = EscalationPayload {
                    workflow_id: instance.id.clone(),
                    tenant_id: tenant,
                    kind: "quality_escalation".to_string(),
                    summary: format!(
                        "step '{step}' stayed below the quality threshold after {} iteration(s)",
                        history.len()
                    ),
                    details: Some(format!("resume with '{RESUME_RETRY}' or '{RESUME_FORCE_APPROVE}'")),
                    iteration_history: history,
                    outstanding_gaps: gaps,
                    raised_at: Utc::now(),
                };
                Ok(WorkflowReport {
                    escalation: Some(payload),
                    ..WorkflowReport::new(instance)
                })
            }
            Ok(GraphOutcome::Duplicate) => Ok(WorkflowReport {
                duplicate: true,
                ..WorkflowReport::new(instance)
            }),
            Err(EngineError::Cancelled) => {
                self.engine.cancel(guard, &instance.id).await?;
                transition(&mut instance, WorkflowStatus::Cancelled);
                guard.update_instance(&instance).await?;
                self.publish_cancelled(&instance);
                self.release(&instance);
                Ok(WorkflowReport::new(instance))
            }
            Err(e) if e.is_fatal() => {
                let payload = e.escalation_payload(&tenant, &instance.id);
                tracing::error!(
                    tenant = %tenant,
                    workflow = %instance.id,
                    kind = e.kind(),
                    error = %e,
                    "workflow failed"
                );
                transition(&mut instance, WorkflowStatus::Failed);
                if let Err(update) = guard.update_instance(&instance).await {
                    tracing::error!(workflow = %instance.id, error = %update, "failed to record workflow failure");
                }
                self.events.publish(EngineEvent::WorkflowFailed {
                    tenant_id: tenant,
                    workflow_id: instance.id.clone(),
                    payload: payload.clone(),
                });
                self.release(&instance);
                Ok(WorkflowReport {
                    escalation: Some(payload),
                    ..WorkflowReport::new(instance)
                })
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    workflow = %instance.id,
                    kind = e.kind(),
                    error = %e,
                    "workflow segment interrupted"
                );
                Err(e)
            }
        }
    }

    fn publish_cancelled(&self, instance: &WorkflowInstance) {
        tracing::info!(tenant = %instance.tenant_id, workflow = %instance.id, "workflow cancelled");
        self.events.publish(EngineEvent::WorkflowCancelled {
            tenant_id: instance.tenant_id.clone(),
            workflow_id: instance.id.clone(),
        });
    }
}

fn transition(instance: &mut WorkflowInstance, status: WorkflowStatus) {
    instance.status = status;
    instance.updated_at = Utc::now();
}
