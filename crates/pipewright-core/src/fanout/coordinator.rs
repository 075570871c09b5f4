//! Wave execution with bounded concurrency.
//!
//! Waves run strictly in order. Within a wave each task is spawned into a
//! `JoinSet` and acquires a permit from a stage-wide `Semaphore` before it
//! invokes its work unit, so at most `concurrency_cap` tasks run at once.
//! Completion is observed through `join_next` under the wave deadline; there
//! is no polling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use pipewright_types::config::WaveFailurePolicy;
use pipewright_types::event::EngineEvent;
use pipewright_types::task::{ExecutionGroup, MergedResult, Task, TaskOutcome};
use pipewright_types::tenant::TenantId;
use pipewright_types::workflow::WorkflowId;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::FanOutError;
use super::merge::merge;
use super::waves::plan_waves;
use crate::error::EngineError;
use crate::event::bus::EventBus;
use crate::guard::TenantGuard;
use crate::repository::EngineStore;
use crate::unit::UnitExecutor;

/// Runs one task's work unit.
pub trait TaskInvoker: Clone + Send + Sync + 'static {
    fn invoke(&self, unit: &str, input: Value) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;
}

/// Invokes work units through the tenant guard.
pub struct GuardedInvoker<S> {
    guard: TenantGuard<S>,
    executor: UnitExecutor,
    timeout: Duration,
}

impl<S> GuardedInvoker<S> {
    pub fn new(guard: TenantGuard<S>, executor: UnitExecutor, timeout: Duration) -> Self {
        Self {
            guard,
            executor,
            timeout,
        }
    }
}

impl<S> Clone for GuardedInvoker<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            executor: self.executor.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: EngineStore> TaskInvoker for GuardedInvoker<S> {
    async fn invoke(&self, unit: &str, input: Value) -> Result<Value, EngineError> {
        self.guard
            .execute(&self.executor, unit, input, self.timeout)
            .await
            .map(|report| report.output)
    }
}

/// Knobs for one fan-out stage.
#[derive(Debug, Clone)]
pub struct WaveOptions {
    pub concurrency_cap: usize,
    pub wave_timeout: Duration,
    pub cancel_grace: Duration,
    pub on_failure: WaveFailurePolicy,
    /// Feedback from the previous iteration, handed to every task.
    pub feedback: Option<Value>,
}

/// Identifies the stage in events and logs.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    pub step: String,
}

/// Sequencing errors stop the whole stage rather than one task.
fn aborts_stage(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::ResourceBudgetExceeded { .. }
            | EngineError::TenantIsolationViolation { .. }
            | EngineError::CheckpointCorruption { .. }
            | EngineError::Validation(_)
            | EngineError::Cancelled
    )
}

type TaskResult = (String, Result<Value, EngineError>, u64);

#[derive(Debug, Clone)]
pub struct Coordinator {
    events: EventBus,
}

impl Coordinator {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Plan and run `tasks`, then merge the outcomes.
    ///
    /// Nothing is invoked when the task set fails validation. Task failures
    /// are recorded in the result; only sequencing errors and cancellation
    /// end the stage with an error.
    pub async fn execute<I: TaskInvoker>(
        &self,
        invoker: &I,
        unit: &str,
        tasks: Vec<Task>,
        stage: &StageContext,
        options: &WaveOptions,
        cancel: &CancellationToken,
    ) -> Result<MergedResult, FanOutError> {
        let waves = plan_waves(&tasks)?;
        let order: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let tasks: BTreeMap<String, Task> = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        tracing::debug!(
            tenant = %stage.tenant_id,
            workflow = %stage.workflow_id,
            step = %stage.step,
            tasks = tasks.len(),
            waves = waves.len(),
            cap = options.concurrency_cap,
            "fan-out planned"
        );

        let semaphore = Arc::new(Semaphore::new(options.concurrency_cap.max(1)));
        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut halted_at: Option<usize> = None;

        for wave in &waves {
            if let Some(failed_wave) = halted_at {
                for id in &wave.task_ids {
                    outcomes.insert(
                        id.clone(),
                        TaskOutcome::failed(id, format!("halted after failure in wave {}", failed_wave + 1), 0),
                    );
                }
                self.publish_wave(stage, wave, &outcomes);
                continue;
            }

            let mut runnable = Vec::new();
            for id in &wave.task_ids {
                let Some(task) = tasks.get(id) else { continue };
                match blocked_by(task, &outcomes) {
                    Some(dep) => {
                        outcomes.insert(id.clone(), TaskOutcome::failed(id, format!("dependency '{dep}' failed"), 0));
                    }
                    None => runnable.push(task),
                }
            }

            self.run_wave(invoker, unit, &runnable, &outputs, &semaphore, options, cancel, &mut outcomes)
                .await?;

            let mut wave_failed = false;
            for id in &wave.task_ids {
                if let Some(outcome) = outcomes.get(id) {
                    match (&outcome.output, outcome.is_success()) {
                        (Some(output), true) => {
                            outputs.insert(id.clone(), output.clone());
                        }
                        _ => wave_failed = true,
                    }
                }
            }

            self.publish_wave(stage, wave, &outcomes);

            if wave_failed && options.on_failure == WaveFailurePolicy::Halt {
                tracing::warn!(step = %stage.step, wave = wave.index, "task failed, halting remaining waves");
                halted_at = Some(wave.index);
            }
        }

        let ordered: Vec<TaskOutcome> = order.iter().filter_map(|id| outcomes.remove(id)).collect();
        Ok(merge(ordered))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_wave<I: TaskInvoker>(
        &self,
        invoker: &I,
        unit: &str,
        runnable: &[&Task],
        outputs: &BTreeMap<String, Value>,
        semaphore: &Arc<Semaphore>,
        options: &WaveOptions,
        cancel: &CancellationToken,
        outcomes: &mut BTreeMap<String, TaskOutcome>,
    ) -> Result<(), FanOutError> {
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for task in runnable {
            let input = task_input(task, outputs, options.feedback.as_ref());
            let invoker = invoker.clone();
            let unit = unit.to_string();
            let semaphore = Arc::clone(semaphore);
            let id = task.id.clone();
            pending.insert(id.clone());

            join_set.spawn(async move {
                let started = Instant::now();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => invoker.invoke(&unit, input).await,
                    Err(_) => Err(EngineError::Cancelled),
                };
                (id, result, started.elapsed().as_millis() as u64)
            });
        }

        let deadline = Instant::now() + options.wave_timeout;
        let mut timed_out = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let grace = Instant::now() + options.cancel_grace;
                    while let Ok(Some(_)) = tokio::time::timeout_at(grace, join_set.join_next()).await {}
                    let abandoned = join_set.len();
                    join_set.detach_all();
                    tracing::warn!(abandoned, "fan-out cancelled");
                    return Err(FanOutError::Cancelled);
                }
                next = tokio::time::timeout_at(deadline, join_set.join_next()) => match next {
                    Ok(Some(Ok((id, result, duration_ms)))) => {
                        pending.remove(&id);
                        match result {
                            Ok(output) => {
                                tracing::debug!(task = %id, duration_ms, "task completed");
                                outcomes.insert(id.clone(), TaskOutcome::completed(id, output, duration_ms));
                            }
                            Err(err) if aborts_stage(&err) => {
                                join_set.abort_all();
                                return Err(FanOutError::Aborted(Box::new(err)));
                            }
                            Err(err) => {
                                tracing::warn!(task = %id, error = %err, "task failed");
                                outcomes.insert(id.clone(), TaskOutcome::failed(id, err.to_string(), duration_ms));
                            }
                        }
                    }
                    Ok(Some(Err(join_err))) => {
                        tracing::error!(error = %join_err, "fan-out task did not finish");
                    }
                    Ok(None) => break,
                    Err(_elapsed) => {
                        join_set.abort_all();
                        timed_out = true;
                        break;
                    }
                },
            }
        }

        let reason = if timed_out { "wave timed out" } else { "task aborted" };
        for id in pending {
            outcomes.insert(id.clone(), TaskOutcome::failed(id, reason, options.wave_timeout.as_millis() as u64));
        }
        Ok(())
    }

    fn publish_wave(&self, stage: &StageContext, wave: &ExecutionGroup, outcomes: &BTreeMap<String, TaskOutcome>) {
        let (succeeded, failed) = wave
            .task_ids
            .iter()
            .filter_map(|id| outcomes.get(id))
            .fold((0, 0), |(ok, bad), o| if o.is_success() { (ok + 1, bad) } else { (ok, bad + 1) });
        tracing::debug!(step = %stage.step, wave = wave.index, succeeded, failed, "wave completed");
        self.events.publish(EngineEvent::WaveCompleted {
            tenant_id: stage.tenant_id.clone(),
            workflow_id: stage.workflow_id.clone(),
            step: stage.step.clone(),
            wave: wave.index,
            succeeded,
            failed,
        });
    }
}

/// First dependency (by id) that did not complete.
fn blocked_by<'a>(task: &'a Task, outcomes: &BTreeMap<String, TaskOutcome>) -> Option<&'a str> {
    task.depends_on
        .iter()
        .find(|dep| outcomes.get(dep.as_str()).is_none_or(|o| !o.is_success()))
        .map(String::as_str)
}

fn task_input(task: &Task, outputs: &BTreeMap<String, Value>, feedback: Option<&Value>) -> Value {
    let dependencies: BTreeMap<&str, &Value> = task
        .depends_on
        .iter()
        .filter_map(|dep| outputs.get(dep).map(|v| (dep.as_str(), v)))
        .collect();
    json!({
        "task": {
            "id": task.id,
            "description": task.description,
            "input": task.input,
        },
        "dependencies": dependencies,
        "feedback": feedback.cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted invoker: fails the listed task ids, sleeps `delay` per call and
    /// tracks the highest number of concurrent calls.
    #[derive(Clone, Default)]
    struct Scripted {
        fail: Arc<BTreeSet<String>>,
        delay: Duration,
        running: Arc<AtomicUsize>,
        high_water: Arc<AtomicUsize>,
        calls: Arc<Mutex<Vec<String>>>,
        abort_with_budget: bool,
    }

    impl Scripted {
        fn failing(ids: &[&str]) -> Self {
            Self {
                fail: Arc::new(ids.iter().map(|s| s.to_string()).collect()),
                delay: Duration::from_millis(10),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskInvoker for Scripted {
        async fn invoke(&self, _unit: &str, input: Value) -> Result<Value, EngineError> {
            let id = input["task"]["id"].as_str().unwrap_or_default().to_string();
            self.calls.lock().unwrap().push(id.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.abort_with_budget {
                return Err(EngineError::ResourceBudgetExceeded {
                    tenant: "acme".to_string(),
                    remaining: -1.0,
                });
            }
            if self.fail.contains(&id) {
                return Err(EngineError::TransientExecution {
                    unit: "coder".to_string(),
                    attempts: 3,
                    message: "timed out".to_string(),
                });
            }
            Ok(json!({ "done": id, "deps": input["dependencies"].clone() }))
        }
    }

    fn stage() -> StageContext {
        StageContext {
            tenant_id: TenantId::new("acme").unwrap(),
            workflow_id: WorkflowId::new("W1").unwrap(),
            step: "build".to_string(),
        }
    }

    fn options(cap: usize, on_failure: WaveFailurePolicy) -> WaveOptions {
        WaveOptions {
            concurrency_cap: cap,
            wave_timeout: Duration::from_secs(60),
            cancel_grace: Duration::from_millis(50),
            on_failure,
            feedback: None,
        }
    }

    fn independent(n: usize) -> Vec<Task> {
        (1..=n).map(|i| Task::new(format!("t{i}"), format!("task {i}"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn cap_bounds_concurrency_and_failure_is_isolated() {
        let invoker = Scripted::failing(&["t3"]);
        let coordinator = Coordinator::new(EventBus::new(16));

        let merged = coordinator
            .execute(
                &invoker,
                "coder",
                independent(5),
                &stage(),
                &options(2, WaveFailurePolicy::Continue),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(merged.succeeded.len(), 4);
        assert_eq!(merged.failed.len(), 1);
        assert_eq!(merged.failed[0].task_id, "t3");
        assert_eq!(invoker.high_water.load(Ordering::SeqCst), 2);
        assert_eq!(invoker.calls().len(), 5);
    }

    #[tokio::test]
    async fn cycle_runs_nothing() {
        let invoker = Scripted::default();
        let coordinator = Coordinator::new(EventBus::new(4));
        let tasks = vec![
            Task::new("a", "").depends_on(["b"]),
            Task::new("b", "").depends_on(["a"]),
        ];

        let err = coordinator
            .execute(
                &invoker,
                "coder",
                tasks,
                &stage(),
                &options(2, WaveFailurePolicy::Continue),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FanOutError::Validation(_)));
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn continue_policy_skips_only_dependents_of_failures() {
        let invoker = Scripted::failing(&["a"]);
        let coordinator = Coordinator::new(EventBus::new(16));
        let tasks = vec![
            Task::new("a", ""),
            Task::new("b", ""),
            Task::new("needs-a", "").depends_on(["a"]),
            Task::new("needs-b", "").depends_on(["b"]),
        ];

        let merged = coordinator
            .execute(
                &invoker,
                "coder",
                tasks,
                &stage(),
                &options(4, WaveFailurePolicy::Continue),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let failed: Vec<_> = merged.failed.iter().map(|o| o.task_id.as_str()).collect();
        assert_eq!(failed, vec!["a", "needs-a"]);
        assert_eq!(merged.failed[1].error.as_deref(), Some("dependency 'a' failed"));
        assert!(!invoker.calls().contains(&"needs-a".to_string()));

        // Dependency outputs are handed to dependents.
        let needs_b = merged.succeeded.iter().find(|o| o.task_id == "needs-b").unwrap();
        assert_eq!(needs_b.output.as_ref().unwrap()["deps"]["b"]["done"], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn halt_policy_fails_later_waves() {
        let invoker = Scripted::failing(&["a"]);
        let coordinator = Coordinator::new(EventBus::new(16));
        let tasks = vec![
            Task::new("a", ""),
            Task::new("b", ""),
            Task::new("later", "").depends_on(["b"]),
        ];

        let merged = coordinator
            .execute(
                &invoker,
                "coder",
                tasks,
                &stage(),
                &options(4, WaveFailurePolicy::Halt),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let later = merged.failed.iter().find(|o| o.task_id == "later").unwrap();
        assert_eq!(later.error.as_deref(), Some("halted after failure in wave 1"));
        assert_eq!(invoker.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wave_deadline_fails_slow_tasks() {
        let invoker = Scripted {
            delay: Duration::from_secs(120),
            ..Default::default()
        };
        let coordinator = Coordinator::new(EventBus::new(16));
        let mut opts = options(2, WaveFailurePolicy::Continue);
        opts.wave_timeout = Duration::from_secs(5);

        let merged = coordinator
            .execute(&invoker, "coder", independent(2), &stage(), &opts, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(merged.failed.len(), 2);
        assert!(merged.failed.iter().all(|o| o.error.as_deref() == Some("wave timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_stage() {
        let invoker = Scripted {
            delay: Duration::from_secs(30),
            ..Default::default()
        };
        let coordinator = Coordinator::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = coordinator
            .execute(
                &invoker,
                "coder",
                independent(3),
                &stage(),
                &options(3, WaveFailurePolicy::Continue),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FanOutError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_error_aborts_the_stage() {
        let invoker = Scripted {
            abort_with_budget: true,
            ..Default::default()
        };
        let coordinator = Coordinator::new(EventBus::new(16));

        let err = coordinator
            .execute(
                &invoker,
                "coder",
                independent(3),
                &stage(),
                &options(1, WaveFailurePolicy::Continue),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            FanOutError::Aborted(inner) => {
                assert!(matches!(*inner, EngineError::ResourceBudgetExceeded { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wave_events_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let coordinator = Coordinator::new(bus);
        let tasks = vec![Task::new("a", ""), Task::new("b", "").depends_on(["a"])];

        coordinator
            .execute(
                &Scripted::default(),
                "coder",
                tasks,
                &stage(),
                &options(2, WaveFailurePolicy::Continue),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut waves = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::WaveCompleted { wave, succeeded, .. } = event {
                waves.push((wave, succeeded));
            }
        }
        assert_eq!(waves, vec![(0, 1), (1, 1)]);
    }
}
