//! Dependency-aware workflow execution.
//!
//! The engine validates a workflow document into a task DAG, then drives
//! it: ready tasks dispatch to agents picked by registry scoring, bounded
//! by `maxConcurrency`; completion and failure events published by the
//! agents move the graph forward. Retry and failure policies, per-task
//! and workflow-level deadlines, and cancellation are all handled here.

mod document;
mod expansion;
mod validation;

pub use document::{AgentDeclaration, SettingsDeclaration, TaskDeclaration, WorkflowDocument};
pub use expansion::expand_input;
pub use validation::validate;

use crate::events::{EventBus, EventTopic};
use crate::models::{FailurePolicy, RetryPolicy, TaskStatus, WorkflowRecord, WorkflowStatus};
use crate::registry::{Namespace, Registry};
use crate::{constants, Result, StrandError};
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine tunables; the retry shape backs the `exponential` policy.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(constants::RETRY_BASE_MS),
            retry_cap: Duration::from_millis(constants::RETRY_CAP_MS),
        }
    }
}

/// Fallback per-task deadline when a task declares none.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Scheduler wake period for deadline checks and deferred retries.
const TICK: Duration = Duration::from_millis(50);

enum TaskOutcome {
    Completed { task_id: String, payload: Value },
    Failed { task_id: String, payload: Value },
    TimedOut { task_id: String },
}

#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Registry,
    bus: EventBus,
    settings: EngineSettings,
    running: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl WorkflowEngine {
    pub fn new(registry: Registry, bus: EventBus, settings: EngineSettings) -> Self {
        Self {
            registry,
            bus,
            settings,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate a document and persist it as a pending workflow.
    pub async fn submit(&self, doc: WorkflowDocument) -> Result<String> {
        let issues = validate(&doc);
        if !issues.is_empty() {
            return Err(StrandError::InvalidArgument(issues.join("; ")));
        }

        let workflow = doc.into_record();
        let workflow_id = workflow.id.clone();
        self.persist_workflow(&workflow).await?;

        for task in &workflow.tasks {
            self.bus
                .publish(
                    EventTopic::TaskCreated,
                    json!({"workflowId": workflow_id, "taskId": task.id}),
                )
                .await;
        }

        info!(
            "workflow {} ({}) submitted with {} task(s)",
            workflow.name,
            workflow_id,
            workflow.tasks.len()
        );
        Ok(workflow_id)
    }

    /// Parse, validate, and persist a JSON workflow document.
    pub async fn submit_json(&self, raw: &str) -> Result<String> {
        self.submit(WorkflowDocument::from_json(raw)?).await
    }

    /// Request cancellation of a running workflow.
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        let running = self.running.read().await;
        match running.get(workflow_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(StrandError::NotFound(format!(
                "running workflow {workflow_id}"
            ))),
        }
    }

    pub async fn workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>> {
        match self.registry.get(Namespace::Workflows, workflow_id).await? {
            Some(stored) => Ok(Some(serde_json::from_value(stored.payload)?)),
            None => Ok(None),
        }
    }

    /// Execute a submitted workflow to a terminal status.
    pub async fn execute(&self, workflow_id: &str) -> Result<WorkflowRecord> {
        let mut workflow = self
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| StrandError::NotFound(format!("workflow {workflow_id}")))?;

        if workflow.status != WorkflowStatus::Pending {
            return Err(StrandError::InvalidArgument(format!(
                "workflow {workflow_id} is not pending"
            )));
        }

        let cancel = CancellationToken::new();
        {
            let mut running = self.running.write().await;
            running.insert(workflow_id.to_string(), cancel.clone());
        }

        let result = self.drive(&mut workflow, cancel).await;

        {
            let mut running = self.running.write().await;
            running.remove(workflow_id);
        }

        result?;
        Ok(workflow)
    }

    /// The scheduling loop.
    async fn drive(&self, workflow: &mut WorkflowRecord, cancel: CancellationToken) -> Result<()> {
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        self.persist_workflow(workflow).await?;
        self.bus
            .publish(
                EventTopic::WorkflowStarted,
                json!({"workflowId": workflow.id, "name": workflow.name}),
            )
            .await;

        let deadline = workflow
            .settings
            .timeout
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let max_concurrency = workflow
            .settings
            .max_concurrency
            .unwrap_or(constants::DEFAULT_MAX_CONCURRENCY)
            .max(1);

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<TaskOutcome>();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut defer_until: HashMap<String, Instant> = HashMap::new();
        let mut in_flight: usize = 0;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!("workflow {} crossed its deadline", workflow.id);
                    self.fail_workflow(workflow, "workflow timeout").await?;
                    return Ok(());
                }
            }
            if cancel.is_cancelled() {
                self.stop_workflow(workflow).await?;
                return Ok(());
            }

            self.mark_ready(workflow, &defer_until);

            // Dispatch the ready set, highest priority first, original
            // order as the tie-break.
            let mut ready: Vec<(usize, String, i32)> = workflow
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Ready)
                .map(|(index, t)| (index, t.id.clone(), t.priority))
                .collect();
            ready.sort_by_key(|(index, _, priority)| (-*priority, *index));

            for (_, task_id, _) in ready {
                if in_flight >= max_concurrency {
                    break;
                }
                if self
                    .dispatch(workflow, &task_id, &outputs, &outcome_tx)
                    .await?
                {
                    attempts.entry(task_id).and_modify(|a| *a += 1).or_insert(0);
                    in_flight += 1;
                }
            }

            if in_flight == 0 && self.settled(workflow) {
                self.finish_workflow(workflow).await?;
                return Ok(());
            }

            // Wait for the next outcome, a deferred retry, or cancellation.
            let outcome = tokio::select! {
                outcome = outcome_rx.recv() => outcome,
                _ = tokio::time::sleep(TICK) => continue,
                _ = cancel.cancelled() => {
                    self.stop_workflow(workflow).await?;
                    return Ok(());
                }
            };
            let Some(outcome) = outcome else { continue };
            in_flight -= 1;

            match outcome {
                TaskOutcome::Completed { task_id, payload } => {
                    let output = payload.get("output").cloned().unwrap_or(Value::Null);
                    outputs.insert(task_id.clone(), output.clone());
                    if let Some(task) = workflow.task_mut(&task_id) {
                        task.status = TaskStatus::Completed;
                        task.output = Some(output);
                        task.completed_at = Some(Utc::now());
                    }
                    workflow.progress.completed += 1;
                    defer_until.remove(&task_id);
                    self.checkpoint(workflow, &task_id).await?;
                    debug!("workflow {}: task {task_id} completed", workflow.id);
                }
                TaskOutcome::Failed { task_id, payload } => {
                    let error = payload.get("error").cloned().unwrap_or(Value::Null);
                    self.handle_failure(
                        workflow,
                        &task_id,
                        error,
                        &mut attempts,
                        &mut defer_until,
                    )
                    .await?;
                    if workflow.status != WorkflowStatus::Running {
                        return Ok(());
                    }
                }
                TaskOutcome::TimedOut { task_id } => {
                    // Synthesize the failure the agent never reported and
                    // ask it to abort, freeing the agent's slot.
                    let agent_id = workflow
                        .task(&task_id)
                        .and_then(|t| t.assigned_agent.clone());
                    self.bus
                        .publish(
                            EventTopic::TaskFailed,
                            json!({
                                "workflowId": workflow.id,
                                "taskId": task_id,
                                "agentId": agent_id,
                                "error": {"kind": "timeout"},
                            }),
                        )
                        .await;
                    if let Some(agent_id) = &agent_id {
                        self.bus
                            .publish(
                                EventTopic::TaskCancel,
                                json!({"agentId": agent_id, "taskId": task_id}),
                            )
                            .await;
                    }
                    self.handle_failure(
                        workflow,
                        &task_id,
                        json!({"kind": "timeout"}),
                        &mut attempts,
                        &mut defer_until,
                    )
                    .await?;
                    if workflow.status != WorkflowStatus::Running {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Promote pending tasks whose dependencies are satisfied; under the
    /// `continue` policy, tasks whose dependencies can no longer succeed
    /// are skipped.
    fn mark_ready(&self, workflow: &mut WorkflowRecord, defer_until: &HashMap<String, Instant>) {
        let policy = workflow.settings.failure_policy;
        let statuses: HashMap<String, TaskStatus> = workflow
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect();

        let mut skipped = Vec::new();
        for task in workflow.tasks.iter_mut() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            if let Some(due) = defer_until.get(&task.id) {
                if Instant::now() < *due {
                    continue;
                }
            }

            let mut satisfied = true;
            let mut doomed = false;
            for dep in &task.dependencies {
                match statuses.get(dep) {
                    Some(TaskStatus::Completed) => {}
                    // Ignore treats a settled dependency as satisfied.
                    Some(status) if policy == FailurePolicy::Ignore && status.is_terminal() => {}
                    Some(status) if status.is_terminal() => {
                        doomed = true;
                        break;
                    }
                    _ => {
                        satisfied = false;
                        break;
                    }
                }
            }

            if doomed && policy == FailurePolicy::Continue {
                task.status = TaskStatus::Skipped;
                task.completed_at = Some(Utc::now());
                skipped.push(task.id.clone());
            } else if satisfied && !doomed {
                task.status = TaskStatus::Ready;
            }
        }

        if !skipped.is_empty() {
            let bus = self.bus.clone();
            let workflow_id = workflow.id.clone();
            tokio::spawn(async move {
                for task_id in skipped {
                    bus.publish(
                        EventTopic::TaskSkipped,
                        json!({"workflowId": workflow_id, "taskId": task_id}),
                    )
                    .await;
                }
            });
        }
    }

    /// Every task has reached a terminal status. Pending tasks awaiting a
    /// deferred retry and ready tasks still hunting for an agent are not
    /// terminal, so the loop keeps driving them.
    fn settled(&self, workflow: &WorkflowRecord) -> bool {
        workflow.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Assign one ready task to the best-scoring agent. Returns false when
    /// no candidate exists; the task stays ready and is revisited after
    /// the next completion.
    async fn dispatch(
        &self,
        workflow: &mut WorkflowRecord,
        task_id: &str,
        outputs: &HashMap<String, Value>,
        outcome_tx: &mpsc::UnboundedSender<TaskOutcome>,
    ) -> Result<bool> {
        let (required, assign_to, input, timeout_ms) = {
            let task = workflow
                .task(task_id)
                .ok_or_else(|| StrandError::NotFound(format!("task {task_id}")))?;
            (
                task.required_capabilities.clone(),
                task.assign_to.clone(),
                task.input.clone(),
                task.timeout_ms,
            )
        };

        let candidate = self
            .registry
            .select_agent(&required, assign_to.as_deref())
            .await?;
        let Some(agent) = candidate else {
            debug!(
                "workflow {}: no candidate agent for task {task_id}; deferring",
                workflow.id
            );
            return Ok(false);
        };

        let expanded = expand_input(&input, &workflow.variables, outputs);
        {
            let task = workflow.task_mut(task_id).expect("task exists");
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent.id.clone());
            task.started_at = Some(Utc::now());
        }

        // Arm both outcome watches before the assignment is visible.
        let completed = {
            let task_id = task_id.to_string();
            self.bus
                .watch(EventTopic::TaskCompleted, move |payload| {
                    payload["taskId"] == task_id.as_str()
                })
                .await
        };
        let failed = {
            let task_id = task_id.to_string();
            self.bus
                .watch(EventTopic::TaskFailed, move |payload| {
                    payload["taskId"] == task_id.as_str()
                })
                .await
        };

        self.bus
            .publish(
                EventTopic::TaskAssigned,
                json!({
                    "workflowId": workflow.id,
                    "taskId": task_id,
                    "agentId": agent.id,
                    "input": expanded,
                }),
            )
            .await;

        {
            let task = workflow.task_mut(task_id).expect("task exists");
            task.status = TaskStatus::Running;
        }
        self.persist_task(workflow, task_id).await?;
        debug!(
            "workflow {}: task {task_id} dispatched to agent {}",
            workflow.id, agent.id
        );

        let bus = self.bus.clone();
        let tx = outcome_tx.clone();
        let task_id = task_id.to_string();
        let task_timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TASK_TIMEOUT);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = bus.wait(completed, task_timeout) => match result {
                    Ok(payload) => TaskOutcome::Completed { task_id, payload },
                    Err(_) => TaskOutcome::TimedOut { task_id },
                },
                result = bus.wait(failed, task_timeout) => match result {
                    Ok(payload) => TaskOutcome::Failed { task_id, payload },
                    Err(_) => TaskOutcome::TimedOut { task_id },
                },
            };
            let _ = tx.send(outcome);
        });

        Ok(true)
    }

    /// Apply the retry policy, then the failure policy, to a failed task.
    async fn handle_failure(
        &self,
        workflow: &mut WorkflowRecord,
        task_id: &str,
        error: Value,
        attempts: &mut HashMap<String, u32>,
        defer_until: &mut HashMap<String, Instant>,
    ) -> Result<()> {
        let retry_policy = workflow.settings.retry_policy;
        let retries_left = workflow
            .task(task_id)
            .map(|t| t.retries_left)
            .unwrap_or(0);

        if retry_policy != RetryPolicy::None && retries_left > 0 {
            let attempt = attempts.get(task_id).copied().unwrap_or(0);
            let delay = match retry_policy {
                RetryPolicy::Immediate => Duration::ZERO,
                RetryPolicy::Exponential => self.retry_delay(attempt),
                RetryPolicy::None => unreachable!(),
            };
            if let Some(task) = workflow.task_mut(task_id) {
                task.retries_left -= 1;
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.started_at = None;
            }
            if !delay.is_zero() {
                defer_until.insert(task_id.to_string(), Instant::now() + delay);
            } else {
                defer_until.remove(task_id);
            }
            info!(
                "workflow {}: task {task_id} failed, retrying in {delay:?} ({} retr{} left)",
                workflow.id,
                retries_left - 1,
                if retries_left - 1 == 1 { "y" } else { "ies" }
            );
            return Ok(());
        }

        if let Some(task) = workflow.task_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some(error);
            task.completed_at = Some(Utc::now());
        }
        workflow.progress.failed += 1;
        defer_until.remove(task_id);
        self.checkpoint(workflow, task_id).await?;
        warn!("workflow {}: task {task_id} failed terminally", workflow.id);

        match workflow.settings.failure_policy {
            FailurePolicy::FailFast => {
                self.fail_workflow(workflow, "task failed").await?;
            }
            FailurePolicy::Continue => {
                // Doomed descendants are skipped by the next mark_ready pass.
            }
            FailurePolicy::Ignore => {
                // Descendants proceed; their output bindings resolve to null.
            }
        }
        Ok(())
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base.as_millis() as f64;
        let cap = self.settings.retry_cap.as_millis() as f64;
        let raw = (base * 2f64.powi(attempt.min(20) as i32)).min(cap);
        let jitter = rand::thread_rng()
            .gen_range(-constants::REGISTRY_BACKOFF_JITTER..=constants::REGISTRY_BACKOFF_JITTER);
        Duration::from_millis((raw * (1.0 + jitter)).max(0.0) as u64)
    }

    /// Fail-fast teardown: cancel what has not run, ask agents to abort
    /// what is running, grant a grace period, then mark the workflow
    /// failed.
    async fn fail_workflow(&self, workflow: &mut WorkflowRecord, reason: &str) -> Result<()> {
        self.cancel_open_tasks(workflow).await;

        workflow.status = WorkflowStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        self.persist_workflow(workflow).await?;
        self.emit_progress(workflow).await;
        self.bus
            .publish(
                EventTopic::WorkflowFailed,
                json!({"workflowId": workflow.id, "reason": reason}),
            )
            .await;
        warn!("workflow {} failed: {reason}", workflow.id);
        Ok(())
    }

    /// User-requested stop; same teardown, different terminal status.
    async fn stop_workflow(&self, workflow: &mut WorkflowRecord) -> Result<()> {
        self.cancel_open_tasks(workflow).await;

        workflow.status = WorkflowStatus::Stopped;
        workflow.completed_at = Some(Utc::now());
        self.persist_workflow(workflow).await?;
        self.emit_progress(workflow).await;
        self.bus
            .publish(
                EventTopic::WorkflowStopped,
                json!({"workflowId": workflow.id}),
            )
            .await;
        info!("workflow {} stopped", workflow.id);
        Ok(())
    }

    async fn finish_workflow(&self, workflow: &mut WorkflowRecord) -> Result<()> {
        workflow.status = WorkflowStatus::Completed;
        workflow.completed_at = Some(Utc::now());
        self.persist_workflow(workflow).await?;
        self.emit_progress(workflow).await;
        self.bus
            .publish(
                EventTopic::WorkflowCompleted,
                json!({
                    "workflowId": workflow.id,
                    "completed": workflow.progress.completed,
                    "failed": workflow.progress.failed,
                }),
            )
            .await;
        info!("workflow {} completed", workflow.id);
        Ok(())
    }

    /// Cancel every non-terminal task. Running tasks get a `task:cancel`
    /// request to their agent and a short grace period.
    async fn cancel_open_tasks(&self, workflow: &mut WorkflowRecord) {
        let mut aborting = Vec::new();
        let mut cancelled = Vec::new();

        for task in workflow.tasks.iter_mut() {
            match task.status {
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Assigned => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    cancelled.push(task.id.clone());
                }
                TaskStatus::Running => {
                    aborting.push((task.id.clone(), task.assigned_agent.clone()));
                }
                _ => {}
            }
        }

        for task_id in &cancelled {
            self.bus
                .publish(
                    EventTopic::TaskCancelled,
                    json!({"workflowId": workflow.id, "taskId": task_id}),
                )
                .await;
        }

        if !aborting.is_empty() {
            for (task_id, agent_id) in &aborting {
                self.bus
                    .publish(
                        EventTopic::TaskCancel,
                        json!({"agentId": agent_id, "taskId": task_id}),
                    )
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(constants::FAIL_FAST_GRACE_MS)).await;
            for (task_id, _) in aborting {
                if let Some(task) = workflow.task_mut(&task_id) {
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Cancelled;
                        task.completed_at = Some(Utc::now());
                        self.bus
                            .publish(
                                EventTopic::TaskCancelled,
                                json!({"workflowId": workflow.id, "taskId": task_id}),
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Persist the workflow and the touched task, then report progress.
    async fn checkpoint(&self, workflow: &WorkflowRecord, task_id: &str) -> Result<()> {
        self.persist_workflow(workflow).await?;
        self.persist_task(workflow, task_id).await?;
        self.emit_progress(workflow).await;
        Ok(())
    }

    async fn emit_progress(&self, workflow: &WorkflowRecord) {
        self.bus
            .publish(
                EventTopic::WorkflowProgress,
                json!({
                    "workflowId": workflow.id,
                    "total": workflow.progress.total,
                    "completed": workflow.progress.completed,
                    "failed": workflow.progress.failed,
                }),
            )
            .await;
    }

    async fn persist_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        self.registry
            .put(
                Namespace::Workflows,
                &workflow.id,
                "workflow",
                serde_json::to_value(workflow)?,
                vec![format!("name:{}", workflow.name)],
            )
            .await
    }

    async fn persist_task(&self, workflow: &WorkflowRecord, task_id: &str) -> Result<()> {
        let Some(task) = workflow.task(task_id) else {
            return Ok(());
        };
        self.registry
            .put(
                Namespace::Tasks,
                &task.id,
                "task",
                serde_json::to_value(task)?,
                vec![format!("workflow:{}", workflow.id)],
            )
            .await
    }
}
