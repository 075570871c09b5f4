//! Checkpointed step execution.
//!
//! Every step that runs, is skipped, suspends or escalates ends with exactly
//! one checkpoint write, and the write carries the step's metered consumption.
//! A resume is applied to the in-memory run and made durable by the next
//! write, which supersedes the suspended checkpoint as Resumed.

use std::time::Duration;

use pipewright_types::checkpoint::{
    Checkpoint, CheckpointStatus, ExecutionState, IterationLedger, Suspension, SuspensionKind,
};
use pipewright_types::config::TenantConfig;
use pipewright_types::event::EngineEvent;
use pipewright_types::quality::{Decision, Feedback};
use pipewright_types::task::MergedResult;
use pipewright_types::workflow::{
    Attempt, Decompose, GraphDefinition, RESUME_FORCE_APPROVE, RESUME_RETRY, ResumeEvent, StepDefinition, StepKind,
    WorkflowId,
};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::condition::ConditionEvaluator;
use super::run::{GraphOutcome, GraphRun};
use crate::checkpoint::CheckpointDraft;
use crate::error::EngineError;
use crate::event::bus::EventBus;
use crate::fanout::{
    Coordinator, Decomposer, GuardedInvoker, StageContext, StaticDecomposer, UnitDecomposer, WaveOptions,
};
use crate::guard::TenantGuard;
use crate::quality::{
    ControllerError, IterationController, QualityScorer, attempt_input, build_feedback, combine, measure_merged, measure_unit_output,
    parse_measurement,
};
use crate::repository::{EngineStore, Supersede};
use crate::unit::UnitExecutor;

/// Result of an iteration-controlled stage.
enum Verdict {
    Approved(Value),
    Escalated { ledger: IterationLedger, reason: String },
}

/// Runs graphs for any tenant. Tenant scope arrives with each call as a
/// [`TenantGuard`].
#[derive(Debug, Clone)]
pub struct GraphEngine {
    executor: UnitExecutor,
    coordinator: Coordinator,
    conditions: ConditionEvaluator,
    events: EventBus,
    cancel_grace: Duration,
}

impl GraphEngine {
    pub fn new(executor: UnitExecutor, events: EventBus, cancel_grace: Duration) -> Self {
        Self {
            coordinator: Coordinator::new(events.clone()),
            conditions: ConditionEvaluator::new(),
            executor,
            events,
            cancel_grace,
        }
    }

    pub fn executor(&self) -> &UnitExecutor {
        &self.executor
    }

    /// Run steps until the graph completes, suspends or escalates.
    pub async fn drive<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        run: &mut GraphRun,
        cancel: &CancellationToken,
    ) -> Result<GraphOutcome, EngineError> {
        if let Some(outcome) = halted_outcome(&run.state) {
            return Ok(outcome);
        }

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(step) = graph.step(run.state.next_step) else {
                tracing::info!(
                    tenant = %guard.tenant(),
                    workflow = %run.workflow_id,
                    graph = %graph.name,
                    "graph completed"
                );
                return Ok(GraphOutcome::Completed {
                    output: run.state.last_output.clone(),
                });
            };
            if let Some(outcome) = self.execute_step(guard, graph, run, step, cancel).await? {
                return Ok(outcome);
            }
        }
    }

    /// Run the next step and checkpoint it. Returns an outcome when the step
    /// suspended or escalated the graph.
    pub async fn execute_step<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        run: &mut GraphRun,
        step: &StepDefinition,
        cancel: &CancellationToken,
    ) -> Result<Option<GraphOutcome>, EngineError> {
        let index = run.state.next_step;
        let started = Instant::now();

        if let Some(when) = &step.when {
            if !self.conditions.evaluate(&step.name, when, &run.state)? {
                run.state.next_step += 1;
                let checkpoint = self.commit(guard, graph, run, step, index).await?;
                tracing::info!(
                    tenant = %guard.tenant(),
                    workflow = %run.workflow_id,
                    step = %step.name,
                    sequence = checkpoint.sequence,
                    "step skipped"
                );
                self.events.publish(EngineEvent::StepSkipped {
                    tenant_id: guard.tenant().clone(),
                    workflow_id: run.workflow_id.clone(),
                    graph: graph.name.clone(),
                    step: step.name.clone(),
                    sequence: checkpoint.sequence,
                });
                return Ok(None);
            }
        }

        let output = match &step.kind {
            StepKind::Unit { unit, timeout_secs } => {
                self.run_unit(guard, unit, *timeout_secs, run.state.last_output.clone(), cancel)
                    .await?
            }
            StepKind::FanOut { decompose, unit } => {
                let merged = self
                    .fan_out(
                        guard,
                        &run.workflow_id,
                        &step.name,
                        decompose,
                        unit,
                        &run.state.last_output,
                        None,
                        cancel,
                    )
                    .await?;
                merged_output(&merged)?
            }
            StepKind::Iterate { attempt, scorer } => {
                let ledger = run.state.iteration.clone().unwrap_or_default();
                let verdict = self
                    .iterate(
                        guard,
                        &run.workflow_id,
                        step,
                        attempt,
                        scorer.as_deref(),
                        &run.state.last_output,
                        ledger,
                        cancel,
                    )
                    .await?;
                match verdict {
                    Verdict::Approved(output) => output,
                    Verdict::Escalated { ledger, reason } => {
                        return self.escalate(guard, graph, run, step, ledger, reason).await.map(Some);
                    }
                }
            }
            StepKind::Await { resume_type, reason } => {
                return self
                    .suspend(guard, graph, run, step, reason, resume_type)
                    .await
                    .map(Some);
            }
        };

        run.state.outputs.insert(step.name.clone(), output.clone());
        run.state.last_output = output;
        run.state.iteration = None;
        run.state.next_step += 1;
        let checkpoint = self.commit(guard, graph, run, step, index).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            tenant = %guard.tenant(),
            workflow = %run.workflow_id,
            step = %step.name,
            kind = step.kind.label(),
            sequence = checkpoint.sequence,
            duration_ms,
            "step completed"
        );
        self.events.publish(EngineEvent::StepCompleted {
            tenant_id: guard.tenant().clone(),
            workflow_id: run.workflow_id.clone(),
            graph: graph.name.clone(),
            step: step.name.clone(),
            sequence: checkpoint.sequence,
            duration_ms,
        });
        Ok(None)
    }

    /// Checkpoint the current step as waiting for `resume_type`.
    pub async fn suspend<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        run: &mut GraphRun,
        step: &StepDefinition,
        reason: &str,
        resume_type: &str,
    ) -> Result<GraphOutcome, EngineError> {
        let index = run.state.next_step;
        run.state.suspension = Some(Suspension {
            step: step.name.clone(),
            reason: reason.to_string(),
            kind: SuspensionKind::AwaitingInput {
                resume_type: resume_type.to_string(),
            },
        });
        let checkpoint = self.commit(guard, graph, run, step, index).await?;

        tracing::info!(
            tenant = %guard.tenant(),
            workflow = %run.workflow_id,
            step = %step.name,
            reason,
            resume_type,
            sequence = checkpoint.sequence,
            "workflow suspended"
        );
        self.events.publish(EngineEvent::WorkflowSuspended {
            tenant_id: guard.tenant().clone(),
            workflow_id: run.workflow_id.clone(),
            step: step.name.clone(),
            reason: reason.to_string(),
            resume_type: resume_type.to_string(),
        });

        Ok(GraphOutcome::Suspended {
            step: step.name.clone(),
            reason: reason.to_string(),
            resume_type: resume_type.to_string(),
        })
    }

    /// Validate a resume event against the Active checkpoint and apply it to a
    /// fresh run. `None` means the event was already applied.
    pub async fn prepare_resume<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        event: &ResumeEvent,
    ) -> Result<Option<GraphRun>, EngineError> {
        if let Some(record) = guard.find_resumed_by(&event.workflow_id, &event.id).await? {
            tracing::info!(
                tenant = %guard.tenant(),
                workflow = %event.workflow_id,
                event_id = %event.id,
                checkpoint = %record.id,
                "duplicate resume ignored"
            );
            return Ok(None);
        }

        let not_suspended = |reason: &str| EngineError::InvalidResume {
            expected: None,
            received: event.resume_type.clone(),
            reason: reason.to_string(),
        };
        let checkpoint = guard
            .load_active(&event.workflow_id)
            .await?
            .ok_or_else(|| not_suspended("workflow has no active checkpoint"))?;
        let suspension = checkpoint
            .state
            .suspension
            .clone()
            .ok_or_else(|| not_suspended("workflow is not suspended"))?;

        let mut run = GraphRun::from_checkpoint(&checkpoint);
        run.state.suspension = None;

        match &suspension.kind {
            SuspensionKind::AwaitingInput { resume_type } => {
                if &event.resume_type != resume_type {
                    tracing::warn!(
                        tenant = %guard.tenant(),
                        workflow = %event.workflow_id,
                        expected = %resume_type,
                        received = %event.resume_type,
                        "resume type mismatch"
                    );
                    return Err(EngineError::InvalidResume {
                        expected: Some(resume_type.clone()),
                        received: event.resume_type.clone(),
                        reason: format!("step '{}' is waiting for '{resume_type}'", suspension.step),
                    });
                }
                advance_with(&mut run.state, &suspension.step, event.payload.clone());
            }
            SuspensionKind::Escalated => {
                let mut ledger = run.state.iteration.take().unwrap_or_default();
                let mut controller = controller_for(guard.config(), &ledger);
                let rejected = |e: ControllerError| EngineError::InvalidResume {
                    expected: None,
                    received: event.resume_type.clone(),
                    reason: e.to_string(),
                };
                match event.resume_type.as_str() {
                    RESUME_RETRY => {
                        controller.reset().map_err(rejected)?;
                        ledger.iteration = controller.iteration();
                        run.state.iteration = Some(ledger);
                    }
                    RESUME_FORCE_APPROVE => {
                        controller.force_approve().map_err(rejected)?;
                        advance_with(&mut run.state, &suspension.step, ledger.last_attempt);
                    }
                    other => {
                        return Err(EngineError::InvalidResume {
                            expected: Some(format!("{RESUME_RETRY} | {RESUME_FORCE_APPROVE}")),
                            received: other.to_string(),
                            reason: format!("step '{}' is escalated", suspension.step),
                        });
                    }
                }
            }
        }

        run.pending_resume = Some(event.id);
        tracing::info!(
            tenant = %guard.tenant(),
            workflow = %event.workflow_id,
            step = %suspension.step,
            resume_type = %event.resume_type,
            "workflow resumed"
        );
        self.events.publish(EngineEvent::WorkflowResumed {
            tenant_id: guard.tenant().clone(),
            workflow_id: event.workflow_id.clone(),
            step: suspension.step.clone(),
            resume_type: event.resume_type.clone(),
            event_id: event.id,
        });
        Ok(Some(run))
    }

    /// Resume a suspended or escalated graph and drive it to its next halt.
    pub async fn resume<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        event: &ResumeEvent,
        cancel: &CancellationToken,
    ) -> Result<GraphOutcome, EngineError> {
        let Some(mut run) = self.prepare_resume(guard, event).await? else {
            return Ok(GraphOutcome::Duplicate);
        };
        if run.graph() != graph.name {
            return Err(EngineError::Conflict(format!(
                "checkpoint belongs to graph '{}', not '{}'",
                run.graph(),
                graph.name
            )));
        }
        let outcome = self.drive(guard, graph, &mut run, cancel).await?;
        if matches!(outcome, GraphOutcome::Completed { .. }) {
            self.finish(guard, &mut run).await?;
        }
        Ok(outcome)
    }

    /// Make a resume durable when no step ran after it.
    pub async fn finish<S: EngineStore>(&self, guard: &TenantGuard<S>, run: &mut GraphRun) -> Result<(), EngineError> {
        if let (Some(active), Some(resume_id)) = (run.active, run.pending_resume) {
            guard.mark_resumed(&active, &resume_id).await?;
            run.pending_resume = None;
        }
        Ok(())
    }

    /// Rebuild a run from the workflow's Active checkpoint.
    pub async fn recover<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        workflow: &WorkflowId,
    ) -> Result<Option<GraphRun>, EngineError> {
        let checkpoint = guard.load_active(workflow).await?;
        if let Some(cp) = &checkpoint {
            tracing::info!(
                tenant = %guard.tenant(),
                workflow = %workflow,
                graph = %cp.graph,
                step = %cp.step,
                sequence = cp.sequence,
                "recovering from checkpoint"
            );
        }
        Ok(checkpoint.as_ref().map(GraphRun::from_checkpoint))
    }

    /// Mark the Active checkpoint Cancelled. Returns its id, if there was one.
    pub async fn cancel<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        workflow: &WorkflowId,
    ) -> Result<Option<Uuid>, EngineError> {
        match guard.latest(workflow).await? {
            Some(record) if record.status == CheckpointStatus::Active => {
                guard.mark_cancelled(&record.id).await?;
                Ok(Some(record.id))
            }
            _ => Ok(None),
        }
    }

    async fn commit<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        run: &mut GraphRun,
        step: &StepDefinition,
        index: usize,
    ) -> Result<Checkpoint, EngineError> {
        let supersede = match run.pending_resume {
            Some(resume_id) => Supersede::Resume { resume_id },
            None => Supersede::Expire,
        };
        let draft = CheckpointDraft {
            workflow_id: run.workflow_id.clone(),
            tenant_id: guard.tenant().clone(),
            graph: graph.name.clone(),
            step: step.name.clone(),
            step_index: index,
            sequence: run.next_sequence,
            state: run.state.clone(),
        };
        let checkpoint = guard.commit(draft, run.active, supersede).await?;
        run.active = Some(checkpoint.id);
        run.next_sequence = checkpoint.sequence + 1;
        run.pending_resume = None;
        run.state.consumed = checkpoint.state.consumed;
        Ok(checkpoint)
    }

    async fn run_unit<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        unit: &str,
        timeout_secs: Option<u64>,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let default = Duration::from_secs(guard.config().unit_timeout_secs);
        let timeout = self.executor.timeout_for(unit, timeout_secs, default);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            report = guard.execute(&self.executor, unit, input, timeout) => Ok(report?.output),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fan_out<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        workflow: &WorkflowId,
        step: &str,
        decompose: &Decompose,
        unit: &str,
        work_item: &Value,
        feedback: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<MergedResult, EngineError> {
        let config = guard.config();
        let default = Duration::from_secs(config.unit_timeout_secs);

        let tasks = match decompose {
            Decompose::Static => StaticDecomposer.decompose(work_item).await?,
            Decompose::Unit { unit: planner } => {
                UnitDecomposer {
                    guard,
                    executor: &self.executor,
                    unit: planner,
                    timeout: self.executor.timeout_for(planner, None, default),
                }
                .decompose(work_item)
                .await?
            }
        };

        let invoker = GuardedInvoker::new(
            guard.clone(),
            self.executor.clone(),
            self.executor.timeout_for(unit, None, default),
        );
        let stage = StageContext {
            tenant_id: guard.tenant().clone(),
            workflow_id: workflow.clone(),
            step: step.to_string(),
        };
        let options = WaveOptions {
            concurrency_cap: config.max_parallel_tasks,
            wave_timeout: Duration::from_secs(config.wave_timeout_secs),
            cancel_grace: self.cancel_grace,
            on_failure: config.on_task_failure,
            feedback,
        };

        Ok(self
            .coordinator
            .execute(&invoker, unit, tasks, &stage, &options, cancel)
            .await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn iterate<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        workflow: &WorkflowId,
        step: &StepDefinition,
        attempt: &Attempt,
        scorer: Option<&str>,
        work_item: &Value,
        mut ledger: IterationLedger,
        cancel: &CancellationToken,
    ) -> Result<Verdict, EngineError> {
        let config = guard.config();
        let mut controller = controller_for(config, &ledger);
        let threshold = controller.threshold();
        let mut feedback: Option<Feedback> = ledger.history.last().map(|e| build_feedback(e, threshold));

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let input = match &feedback {
                Some(fb) => attempt_input(config.feedback_mode, work_item, &ledger, fb),
                None => work_item.clone(),
            };

            let (output, measurement) = match attempt {
                Attempt::Unit { unit } => {
                    let output = self.run_unit(guard, unit, None, input, cancel).await?;
                    let measurement = measure_unit_output(&output).map_err(|e| {
                        EngineError::Validation(format!("unit '{unit}' reported a malformed measurement: {e}"))
                    })?;
                    (output, measurement)
                }
                Attempt::FanOut { decompose, unit } => {
                    let task_feedback = feedback.as_ref().map(|fb| json!(fb));
                    let merged = self
                        .fan_out(guard, workflow, &step.name, decompose, unit, &input, task_feedback, cancel)
                        .await?;
                    (merged_output(&merged)?, measure_merged(&merged))
                }
            };

            let measurement = match scorer {
                Some(scorer) => {
                    let scored = self
                        .run_unit(
                            guard,
                            scorer,
                            None,
                            json!({ "work_item": work_item, "output": output }),
                            cancel,
                        )
                        .await?;
                    let reported = parse_measurement(&scored).map_err(|e| {
                        EngineError::Validation(format!("scorer '{scorer}' returned a malformed measurement: {e}"))
                    })?;
                    combine(measurement, reported)
                }
                None => measurement,
            };

            let evaluation = controller.evaluate(&measurement)?;
            ledger.iteration = controller.iteration();
            ledger.history = controller.history().to_vec();
            ledger.last_attempt = output.clone();

            self.events.publish(EngineEvent::IterationDecided {
                tenant_id: guard.tenant().clone(),
                workflow_id: workflow.clone(),
                step: step.name.clone(),
                iteration: evaluation.iteration,
                score: evaluation.overall_score,
                decision: evaluation.decision,
            });

            match evaluation.decision {
                Decision::Approve => return Ok(Verdict::Approved(output)),
                Decision::Escalate => {
                    let shortfall = EngineError::QualityThresholdNotMet {
                        score: evaluation.overall_score,
                        threshold,
                    };
                    tracing::warn!(
                        tenant = %guard.tenant(),
                        workflow = %workflow,
                        step = %step.name,
                        kind = shortfall.kind(),
                        outstanding_gaps = controller.outstanding_gaps().len(),
                        "{shortfall}"
                    );
                    return Ok(Verdict::Escalated {
                        ledger,
                        reason: shortfall.to_string(),
                    });
                }
                Decision::Iterate => {
                    tracing::info!(
                        tenant = %guard.tenant(),
                        workflow = %workflow,
                        step = %step.name,
                        iteration = evaluation.iteration,
                        gaps = evaluation.gaps.len(),
                        "retrying with feedback"
                    );
                    feedback = Some(build_feedback(&evaluation, threshold));
                }
            }
        }
    }

    async fn escalate<S: EngineStore>(
        &self,
        guard: &TenantGuard<S>,
        graph: &GraphDefinition,
        run: &mut GraphRun,
        step: &StepDefinition,
        ledger: IterationLedger,
        reason: String,
    ) -> Result<GraphOutcome, EngineError> {
        let index = run.state.next_step;
        run.state.iteration = Some(ledger);
        run.state.suspension = Some(Suspension {
            step: step.name.clone(),
            reason,
            kind: SuspensionKind::Escalated,
        });
        let checkpoint = self.commit(guard, graph, run, step, index).await?;

        tracing::warn!(
            tenant = %guard.tenant(),
            workflow = %run.workflow_id,
            step = %step.name,
            sequence = checkpoint.sequence,
            "step escalated to a human"
        );
        halted_outcome(&run.state).ok_or_else(|| EngineError::Unrecoverable("escalation was not recorded".to_string()))
    }
}

/// Outcome for a state that is waiting on a suspension, if it is.
pub fn halted_outcome(state: &ExecutionState) -> Option<GraphOutcome> {
    let suspension = state.suspension.as_ref()?;
    Some(match &suspension.kind {
        SuspensionKind::AwaitingInput { resume_type } => GraphOutcome::Suspended {
            step: suspension.step.clone(),
            reason: suspension.reason.clone(),
            resume_type: resume_type.clone(),
        },
        SuspensionKind::Escalated => {
            let history = state.iteration.as_ref().map(|l| l.history.clone()).unwrap_or_default();
            let gaps = history.last().map(|e| e.gaps.clone()).unwrap_or_default();
            GraphOutcome::Escalated {
                step: suspension.step.clone(),
                history,
                gaps,
            }
        }
    })
}

/// Iteration controller for a tenant, restored from the step's ledger.
fn controller_for(config: &TenantConfig, ledger: &IterationLedger) -> IterationController {
    IterationController::new(
        QualityScorer::new(config.dimension_weights.clone()),
        config.max_iterations,
        config.quality_threshold,
    )
    .resume(ledger.iteration, ledger.history.clone())
}

fn advance_with(state: &mut ExecutionState, step: &str, output: Value) {
    state.outputs.insert(step.to_string(), output.clone());
    state.last_output = output;
    state.next_step += 1;
}

fn merged_output(merged: &MergedResult) -> Result<Value, EngineError> {
    serde_json::to_value(merged).map_err(|e| EngineError::Unrecoverable(format!("unserialisable merge result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use pipewright_types::config::TenantConfig;
    use pipewright_types::tenant::TenantId;

    use crate::graph::parse_graph_yaml;
    use crate::guard::TenantContext;
    use crate::repository::memory::InMemoryStore;
    use crate::unit::{EchoUnit, FnUnit, UnitFailure, UnitOutput, UnitRegistry, UnitRequest};

    struct Harness {
        guard: TenantGuard<InMemoryStore>,
        engine: GraphEngine,
        bus: EventBus,
        coder_calls: Arc<AtomicUsize>,
        fixed: Arc<AtomicBool>,
    }

    fn wf() -> WorkflowId {
        WorkflowId::new("W1").unwrap()
    }

    /// `coder` fails task `t5` until `fixed` is set.
    async fn harness(config: TenantConfig) -> Harness {
        let coder_calls = Arc::new(AtomicUsize::new(0));
        let fixed = Arc::new(AtomicBool::new(false));

        let mut registry = UnitRegistry::new();
        registry.register(EchoUnit::new("echo"));
        let calls = Arc::clone(&coder_calls);
        let flag = Arc::clone(&fixed);
        registry.register(FnUnit::new("coder", move |req: UnitRequest| {
            let calls = Arc::clone(&calls);
            let flag = Arc::clone(&flag);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = req.input["task"]["id"].as_str().unwrap_or_default().to_string();
                if id == "t5" && !flag.load(Ordering::SeqCst) {
                    return Err(UnitFailure::permanent("build_failed", "t5 does not compile"));
                }
                Ok(UnitOutput::new(json!({ "built": id })))
            }
        }));

        let bus = EventBus::new(256);
        let executor = UnitExecutor::new(Arc::new(registry), bus.clone(), 1.0);
        let ctx = TenantContext::new(TenantId::new("acme").unwrap(), Arc::new(config));
        let guard = TenantGuard::open(ctx, Arc::new(InMemoryStore::new()), bus.clone())
            .await
            .unwrap();
        Harness {
            guard,
            engine: GraphEngine::new(executor, bus.clone(), Duration::from_millis(50)),
            bus,
            coder_calls,
            fixed,
        }
    }

    fn five_tasks() -> Value {
        json!({ "tasks": (1..=5).map(|i| json!({"id": format!("t{i}")})).collect::<Vec<_>>() })
    }

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

    const BUILD: &str = r#"
name: build
steps:
  - name: build
    type: iterate
    attempt:
      type: fan_out
      decompose: { strategy: static }
      unit: coder
"#;

    #[tokio::test]
    async fn linear_graph_checkpoints_every_step() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(LINEAR).unwrap();
        let mut run = GraphRun::start(wf(), "linear", json!({"n": 1}));

        let outcome = h
            .engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, GraphOutcome::Completed { output: json!({"n": 1}) });
        let records = h.guard.list(&wf()).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(
            records.iter().filter(|r| r.status == CheckpointStatus::Active).count(),
            1
        );
        assert_eq!(run.state.consumed, 3.0);
    }

    #[tokio::test]
    async fn false_condition_skips_but_checkpoints() {
        let h = harness(TenantConfig::default()).await;
        let mut rx = h.bus.subscribe();
        let graph = parse_graph_yaml(
            r#"
name: conditional
steps:
  - { name: one, type: unit, unit: echo }
  - { name: only-urgent, type: unit, unit: echo, when: "input.urgent == true" }
"#,
        )
        .unwrap();
        let mut run = GraphRun::start(wf(), "conditional", json!({"urgent": false}));

        h.engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.guard.list(&wf()).await.unwrap().len(), 2);
        assert!(!run.state.outputs.contains_key("only-urgent"));
        let mut skipped = false;
        while let Ok(event) = rx.try_recv() {
            skipped |= matches!(event, EngineEvent::StepSkipped { ref step, .. } if step == "only-urgent");
        }
        assert!(skipped);
    }

    #[tokio::test]
    async fn suspend_then_resume_with_matching_type() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(CLARIFY).unwrap();
        let cancel = CancellationToken::new();
        let mut run = GraphRun::start(wf(), "clarify", json!({"question": "which db?"}));

        let outcome = h.engine.drive(&h.guard, &graph, &mut run, &cancel).await.unwrap();
        assert!(matches!(outcome, GraphOutcome::Suspended { ref resume_type, .. } if resume_type == "answer"));
        let suspended = h.guard.load_active(&wf()).await.unwrap().unwrap();
        assert!(suspended.is_suspended());
        assert_eq!(suspended.sequence, 2);

        // Wrong type is rejected and nothing changes.
        let wrong = ResumeEvent::new(wf(), "approval", json!({}));
        let err = h.engine.resume(&h.guard, &graph, &wrong, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidResume { .. }));
        assert_eq!(h.guard.load_active(&wf()).await.unwrap().unwrap().id, suspended.id);

        let answer = ResumeEvent::new(wf(), "answer", json!({"text": "ok"}));
        let outcome = h.engine.resume(&h.guard, &graph, &answer, &cancel).await.unwrap();
        assert_eq!(outcome, GraphOutcome::Completed { output: json!({"text": "ok"}) });

        let records = h.guard.list(&wf()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].status, CheckpointStatus::Resumed);
        assert_eq!(records[1].resumed_by, Some(answer.id));

        // Second delivery is a no-op.
        let again = h.engine.resume(&h.guard, &graph, &answer, &cancel).await.unwrap();
        assert_eq!(again, GraphOutcome::Duplicate);
        assert_eq!(h.guard.list(&wf()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_fan_out_escalates_after_max_iterations() {
        let h = harness(TenantConfig::default()).await;
        let mut rx = h.bus.subscribe();
        let graph = parse_graph_yaml(BUILD).unwrap();
        let mut run = GraphRun::start(wf(), "build", five_tasks());

        let outcome = h
            .engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap();

        let GraphOutcome::Escalated { history, gaps, .. } = outcome else {
            panic!("expected escalation");
        };
        assert_eq!(history.len(), 3);
        let decisions: Vec<Decision> = history.iter().map(|e| e.decision).collect();
        assert_eq!(decisions, vec![Decision::Iterate, Decision::Iterate, Decision::Escalate]);
        assert!(history.iter().all(|e| (e.overall_score - 86.0).abs() < 1e-9));
        assert!(gaps.iter().any(|g| g.id == "task-failed:t5"));
        assert_eq!(h.coder_calls.load(Ordering::SeqCst), 15);

        // One checkpoint for the escalated step.
        let records = h.guard.list(&wf()).await.unwrap();
        assert_eq!(records.len(), 1);

        let mut decided = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::IterationDecided { .. }) {
                decided += 1;
            }
        }
        assert_eq!(decided, 3);
    }

    #[tokio::test]
    async fn retry_after_escalation_runs_a_fresh_round() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(BUILD).unwrap();
        let cancel = CancellationToken::new();
        let mut run = GraphRun::start(wf(), "build", five_tasks());
        h.engine.drive(&h.guard, &graph, &mut run, &cancel).await.unwrap();

        h.fixed.store(true, Ordering::SeqCst);
        let retry = ResumeEvent::new(wf(), RESUME_RETRY, Value::Null);
        let outcome = h.engine.resume(&h.guard, &graph, &retry, &cancel).await.unwrap();

        let GraphOutcome::Completed { output } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["succeeded"].as_array().unwrap().len(), 5);
        let records = h.guard.list(&wf()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, CheckpointStatus::Resumed);
    }

    #[tokio::test]
    async fn force_approve_takes_the_last_attempt() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(BUILD).unwrap();
        let cancel = CancellationToken::new();
        let mut run = GraphRun::start(wf(), "build", five_tasks());
        h.engine.drive(&h.guard, &graph, &mut run, &cancel).await.unwrap();
        let calls_before = h.coder_calls.load(Ordering::SeqCst);

        let approve = ResumeEvent::new(wf(), RESUME_FORCE_APPROVE, Value::Null);
        let outcome = h.engine.resume(&h.guard, &graph, &approve, &cancel).await.unwrap();

        let GraphOutcome::Completed { output } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["failed"].as_array().unwrap().len(), 1);
        assert_eq!(h.coder_calls.load(Ordering::SeqCst), calls_before);

        let records = h.guard.list(&wf()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CheckpointStatus::Resumed);
        assert_eq!(records[0].resumed_by, Some(approve.id));
    }

    #[tokio::test]
    async fn malformed_unit_measurement_fails_the_step() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(
            r#"
name: draft
steps:
  - name: draft
    type: iterate
    attempt: { type: unit, unit: echo }
"#,
        )
        .unwrap();
        let input = json!({"measurement": {"dimensions": {"completeness": "ten"}}});
        let mut run = GraphRun::start(wf(), "draft", input);

        let err = h
            .engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref msg) if msg.contains("malformed measurement")));
        assert!(h.guard.list(&wf()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalation_records_the_threshold_shortfall() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(BUILD).unwrap();
        let mut run = GraphRun::start(wf(), "build", five_tasks());
        h.engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap();

        let active = h.guard.load_active(&wf()).await.unwrap().unwrap();
        let suspension = active.state.suspension.unwrap();
        assert_eq!(suspension.reason, "quality score 86.0 is below threshold 90.0");
    }

    #[tokio::test]
    async fn escalated_step_rejects_other_resume_types() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(BUILD).unwrap();
        let cancel = CancellationToken::new();
        let mut run = GraphRun::start(wf(), "build", five_tasks());
        h.engine.drive(&h.guard, &graph, &mut run, &cancel).await.unwrap();

        let answer = ResumeEvent::new(wf(), "answer", json!({}));
        assert!(matches!(
            h.engine.resume(&h.guard, &graph, &answer, &cancel).await,
            Err(EngineError::InvalidResume { .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_budget_stops_before_the_next_unit() {
        let config = TenantConfig {
            resource_budget: 1.5,
            ..TenantConfig::default()
        };
        let h = harness(config).await;
        let graph = parse_graph_yaml(LINEAR).unwrap();
        let mut run = GraphRun::start(wf(), "linear", json!(1));

        let err = h
            .engine
            .drive(&h.guard, &graph, &mut run, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ResourceBudgetExceeded { .. }));
        // Two steps ran and were charged with their checkpoints.
        assert_eq!(h.guard.list(&wf()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_graph() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(LINEAR).unwrap();
        let mut run = GraphRun::start(wf(), "linear", json!(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.engine.drive(&h.guard, &graph, &mut run, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(h.guard.list(&wf()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_continues_from_the_active_checkpoint() {
        let h = harness(TenantConfig::default()).await;
        let graph = parse_graph_yaml(LINEAR).unwrap();
        let mut run = GraphRun::start(wf(), "linear", json!("x"));
        let step = graph.step(0).unwrap();
        h.engine
            .execute_step(&h.guard, &graph, &mut run, step, &CancellationToken::new())
            .await
            .unwrap();

        let mut recovered = h.engine.recover(&h.guard, &wf()).await.unwrap().unwrap();
        assert_eq!(recovered.state.next_step, 1);
        assert_eq!(recovered.next_sequence, 2);
        h.engine
            .drive(&h.guard, &graph, &mut recovered, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.guard.list(&wf()).await.unwrap().len(), 3);

        let cancelled = h.engine.cancel(&h.guard, &wf()).await.unwrap();
        assert!(cancelled.is_some());
        assert!(h.guard.load_active(&wf()).await.unwrap().is_none());
    }
}
