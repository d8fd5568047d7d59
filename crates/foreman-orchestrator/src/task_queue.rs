use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::store::{TaskStatusChange, TaskStore};
use crate::types::{BackgroundTask, Checkpoint, Priority, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{EventSink, ForemanError, ForemanResult, OrchestratorEvent};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options for [`TaskQueue::enqueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to `QueueConfig::default_max_retries`.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            max_retries: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Executable unit bound to a task name.
///
/// Returning `Err` routes the task through the retry policy. Cancellation is
/// cooperative: long handlers should check [`TaskContext::should_abort`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> ForemanResult<serde_json::Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = ForemanResult<serde_json::Value>> + Send,
{
    async fn run(&self, ctx: TaskContext) -> ForemanResult<serde_json::Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn fn_handler<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForemanResult<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Per-execution view handed to a [`TaskHandler`].
#[derive(Clone)]
pub struct TaskContext {
    task: BackgroundTask,
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    abort: CancellationToken,
}

impl TaskContext {
    /// Snapshot of the task as it was when this execution started.
    pub fn task(&self) -> &BackgroundTask {
        &self.task
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.task.payload
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.task.retry_count + 1
    }

    /// Record progress (clamped to 100) and emit a progress signal.
    pub async fn report_progress(&self, progress: u8, message: Option<&str>) -> ForemanResult<()> {
        let progress = progress.min(100);
        self.store
            .update_progress(
                self.task.id,
                progress,
                message.map(str::to_string),
                self.clock.now(),
            )
            .await?;
        self.events.emit(OrchestratorEvent::TaskProgress {
            task_id: self.task.id,
            progress,
            message: message.map(str::to_string),
        });
        Ok(())
    }

    /// Persist a resumable snapshot. Ignored once the execution was aborted,
    /// since the task has already left `running`.
    pub async fn save_checkpoint(
        &self,
        step: u32,
        total_steps: u32,
        state: serde_json::Value,
    ) -> ForemanResult<()> {
        if self.should_abort() {
            debug!(task_id = %self.task.id, "checkpoint skipped after abort");
            return Ok(());
        }
        self.store
            .save_checkpoint(&Checkpoint {
                task_id: self.task.id,
                step,
                total_steps,
                state,
                saved_at: self.clock.now(),
            })
            .await
    }

    pub async fn get_checkpoint(&self) -> ForemanResult<Option<Checkpoint>> {
        self.store.get_checkpoint(self.task.id).await
    }

    /// True once the task was cancelled, paused, or timed out.
    pub fn should_abort(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves when the execution is aborted.
    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }
}

/// Result of one task execution as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// Failed and went back to `queued`.
    Retried { retry_count: u32 },
    /// Failed with no retries left.
    Failed,
    /// The task left `running` while the handler was still working
    /// (cancel, pause, timeout); the handler's result was discarded.
    Superseded,
}

/// Count of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
}

struct Execution {
    run_id: Uuid,
    abort: CancellationToken,
}

/// Background task queue with admission control, polling dispatch, retries,
/// timeout detection, checkpointing and cooperative cancellation.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    config: QueueConfig,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    executions: Mutex<HashMap<Uuid, Execution>>,
    admission: tokio::sync::Mutex<()>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: QueueConfig,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            handlers: RwLock::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
            events,
            clock,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Bind a handler to a task name, replacing any earlier binding. Tasks
    /// whose name has no handler stay queued.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        info!(handler = %name, "Task handler registered");
        self.handlers.write().insert(name, handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Admit a new task, or reject it when `max_queue_size` tasks are
    /// already queued.
    pub async fn enqueue(&self, options: EnqueueOptions) -> ForemanResult<BackgroundTask> {
        let _admission = self.admission.lock().await;

        let queued = self.store.count_by_status(TaskStatus::Queued).await?;
        if queued >= self.config.max_queue_size {
            warn!(task = %options.name, queued, "Task queue full, rejecting enqueue");
            return Err(ForemanError::Capacity(format!(
                "task queue is full ({queued}/{} queued)",
                self.config.max_queue_size
            )));
        }

        let task = BackgroundTask::new(
            options.name,
            options.payload,
            options.priority,
            options
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            self.clock.now(),
        );
        self.store.save(&task).await?;

        info!(task_id = %task.id, task = %task.name, priority = %task.priority, "Task queued");
        self.events.emit(OrchestratorEvent::TaskQueued {
            task_id: task.id,
            name: task.name.clone(),
            priority: task.priority.to_string(),
        });
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> ForemanResult<BackgroundTask> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ForemanError::not_found("task", id))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> ForemanResult<Vec<BackgroundTask>> {
        match status {
            Some(status) => self.store.get_by_status(status).await,
            None => self.store.get_all().await,
        }
    }

    pub async fn get_checkpoint(&self, task_id: Uuid) -> ForemanResult<Option<Checkpoint>> {
        self.store.get_checkpoint(task_id).await
    }

    pub async fn stats(&self) -> ForemanResult<QueueStats> {
        Ok(QueueStats {
            queued: self.store.count_by_status(TaskStatus::Queued).await?,
            running: self.store.count_by_status(TaskStatus::Running).await?,
            completed: self.store.count_by_status(TaskStatus::Completed).await?,
            failed: self.store.count_by_status(TaskStatus::Failed).await?,
            cancelled: self.store.count_by_status(TaskStatus::Cancelled).await?,
            paused: self.store.count_by_status(TaskStatus::Paused).await?,
        })
    }

    /// Number of handler executions currently in flight.
    pub fn running_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// One scheduling step, awaited inline: timeout sweep, then run at most
    /// one queued task that has a handler. Returns the task that ran.
    pub async fn process_next(&self) -> ForemanResult<Option<(Uuid, ExecutionOutcome)>> {
        self.check_timeouts().await?;
        match self.claim_next().await? {
            Some((task, handler)) => {
                let id = task.id;
                let outcome = self.execute(task, handler).await?;
                Ok(Some((id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Claim the first queued task with a registered handler.
    async fn claim_next(&self) -> ForemanResult<Option<(BackgroundTask, Arc<dyn TaskHandler>)>> {
        for candidate in self.store.get_queued_tasks().await? {
            let Some(handler) = self.handler_for(&candidate.name) else {
                continue;
            };
            if let Some(task) = self.store.claim(candidate.id, self.clock.now()).await? {
                return Ok(Some((task, handler)));
            }
        }
        Ok(None)
    }

    /// Run a claimed task's handler and settle its status. Handler errors and
    /// panics are normalized into the failure path; nothing escapes except
    /// store errors.
    async fn execute(
        &self,
        task: BackgroundTask,
        handler: Arc<dyn TaskHandler>,
    ) -> ForemanResult<ExecutionOutcome> {
        let run_id = task.run_id.unwrap_or_else(Uuid::new_v4);
        let abort = CancellationToken::new();
        self.executions.lock().insert(
            task.id,
            Execution {
                run_id,
                abort: abort.clone(),
            },
        );

        info!(task_id = %task.id, task = %task.name, attempt = task.retry_count + 1, "Task started");
        self.events.emit(OrchestratorEvent::TaskStarted {
            task_id: task.id,
            name: task.name.clone(),
            attempt: task.retry_count + 1,
        });

        let ctx = TaskContext {
            task: task.clone(),
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            abort,
        };
        let result = match tokio::spawn(async move { handler.run(ctx).await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(join_err) => Err(format!("handler panicked: {join_err}")),
        };

        if !self.finish_execution(task.id, run_id) {
            debug!(task_id = %task.id, "Execution superseded, discarding handler result");
            return Ok(ExecutionOutcome::Superseded);
        }

        match result {
            Ok(value) => self.complete(&task, value).await,
            Err(error) => self.fail(&task, error).await,
        }
    }

    /// Drop the execution entry if it still belongs to `run_id`.
    fn finish_execution(&self, task_id: Uuid, run_id: Uuid) -> bool {
        let mut executions = self.executions.lock();
        match executions.get(&task_id) {
            Some(current) if current.run_id == run_id => {
                executions.remove(&task_id);
                true
            }
            _ => false,
        }
    }

    /// Abort the execution of one specific run. A newer run of the same task
    /// is left alone.
    fn abort_run(&self, task_id: Uuid, run_id: Option<Uuid>) {
        let mut executions = self.executions.lock();
        let current = executions.get(&task_id).map(|e| e.run_id);
        if current.is_none() || (run_id.is_some() && current != run_id) {
            return;
        }
        if let Some(execution) = executions.remove(&task_id) {
            execution.abort.cancel();
        }
    }

    /// Signal the in-flight execution of a task to stop and forget it.
    fn abort_execution(&self, task_id: Uuid) -> bool {
        match self.executions.lock().remove(&task_id) {
            Some(execution) => {
                execution.abort.cancel();
                true
            }
            None => false,
        }
    }

    async fn complete(
        &self,
        task: &BackgroundTask,
        value: serde_json::Value,
    ) -> ForemanResult<ExecutionOutcome> {
        let now = self.clock.now();
        let change = TaskStatusChange::to(TaskStatus::Completed, now)
            .expecting(TaskStatus::Running)
            .expecting_run(task.run_id)
            .with_result(value);
        let Some(done) = self.store.update_status(task.id, change).await? else {
            return Ok(ExecutionOutcome::Superseded);
        };
        self.store.delete_checkpoint(task.id).await?;

        let duration_ms = done
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        info!(task_id = %task.id, task = %task.name, duration_ms, "Task completed");
        self.events.emit(OrchestratorEvent::TaskCompleted {
            task_id: task.id,
            name: task.name.clone(),
            duration_ms,
        });
        Ok(ExecutionOutcome::Completed)
    }

    /// Retry policy: requeue while retries remain, otherwise fail for good.
    /// `task` is the snapshot taken when the run was claimed; the write only
    /// lands while that run is still the current one.
    async fn fail(&self, task: &BackgroundTask, error: String) -> ForemanResult<ExecutionOutcome> {
        let now = self.clock.now();

        if self.config.retry_failed_tasks && task.has_retries_left() {
            let change = TaskStatusChange::to(TaskStatus::Queued, now)
                .expecting(TaskStatus::Running)
                .expecting_run(task.run_id)
                .counting_retry()
                .with_error(error.clone());
            let Some(requeued) = self.store.update_status(task.id, change).await? else {
                return Ok(ExecutionOutcome::Superseded);
            };
            self.store.delete_checkpoint(task.id).await?;
            let retry_count = requeued.retry_count;
            warn!(
                task_id = %task.id,
                task = %task.name,
                retry_count,
                max_retries = task.max_retries,
                error = %error,
                "Task failed, requeued for retry"
            );
            self.events.emit(OrchestratorEvent::TaskRetried {
                task_id: task.id,
                name: task.name.clone(),
                error,
                retry_count,
            });
            return Ok(ExecutionOutcome::Retried { retry_count });
        }

        let change = TaskStatusChange::to(TaskStatus::Failed, now)
            .expecting(TaskStatus::Running)
            .expecting_run(task.run_id)
            .with_error(error.clone());
        if self.store.update_status(task.id, change).await?.is_none() {
            return Ok(ExecutionOutcome::Superseded);
        }
        self.store.delete_checkpoint(task.id).await?;
        error!(
            task_id = %task.id,
            task = %task.name,
            retry_count = task.retry_count,
            error = %error,
            "Task failed permanently"
        );
        self.events.emit(OrchestratorEvent::TaskFailed {
            task_id: task.id,
            name: task.name.clone(),
            error,
            retry_count: task.retry_count,
        });
        Ok(ExecutionOutcome::Failed)
    }

    /// Route every running task past `task_timeout_minutes` through the
    /// failure path and abort its handler. A listed run that was already
    /// settled or replaced by the time the write lands is skipped. Returns
    /// how many tasks timed out.
    pub async fn check_timeouts(&self) -> ForemanResult<usize> {
        let now = self.clock.now();
        let cutoff = now - self.config.task_timeout();
        let listed = self.store.get_timed_out_tasks(cutoff).await?;
        self.expire(&listed, now).await
    }

    async fn expire(&self, listed: &[BackgroundTask], now: DateTime<Utc>) -> ForemanResult<usize> {
        let mut timed_out = 0;
        for task in listed {
            let error = format!(
                "Task timed out after {} minutes",
                self.config.task_timeout_minutes
            );
            if self.fail(task, error).await? == ExecutionOutcome::Superseded {
                debug!(task_id = %task.id, "Timed-out run already settled");
                continue;
            }
            self.abort_run(task.id, task.run_id);
            timed_out += 1;

            let running_ms = task
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
                .unwrap_or_default();
            warn!(task_id = %task.id, task = %task.name, running_ms, "Task timed out");
            self.events.emit(OrchestratorEvent::TaskTimeout {
                task_id: task.id,
                running_ms,
            });
        }
        Ok(timed_out)
    }

    /// Move a task to a new status with a compare-and-set against its
    /// current one.
    async fn transition(&self, id: Uuid, to: TaskStatus) -> ForemanResult<BackgroundTask> {
        let task = self.get_task(id).await?;
        if !task.status.can_transition_to(to) {
            return Err(ForemanError::invalid_transition(id, task.status, to));
        }
        let change = TaskStatusChange::to(to, self.clock.now()).expecting(task.status);
        self.store
            .update_status(id, change)
            .await?
            .ok_or_else(|| ForemanError::invalid_transition(id, task.status, to))
    }

    /// Cancel a queued, running or paused task. Terminal.
    pub async fn cancel_task(&self, id: Uuid) -> ForemanResult<BackgroundTask> {
        let task = self.transition(id, TaskStatus::Cancelled).await?;
        self.abort_execution(id);
        self.store.delete_checkpoint(id).await?;
        info!(task_id = %id, task = %task.name, "Task cancelled");
        self.events.emit(OrchestratorEvent::TaskCancelled { task_id: id });
        Ok(task)
    }

    /// Pause a queued or running task. A running handler is only asked to
    /// stop; its in-flight work and checkpoint are dropped and the task
    /// restarts from scratch on resume.
    pub async fn pause_task(&self, id: Uuid) -> ForemanResult<BackgroundTask> {
        let task = self.transition(id, TaskStatus::Paused).await?;
        self.abort_execution(id);
        self.store.delete_checkpoint(id).await?;
        info!(task_id = %id, task = %task.name, "Task paused");
        self.events.emit(OrchestratorEvent::TaskPaused { task_id: id });
        Ok(task)
    }

    /// Put a paused task back in the queue.
    pub async fn resume_task(&self, id: Uuid) -> ForemanResult<BackgroundTask> {
        let task = self.transition(id, TaskStatus::Queued).await?;
        info!(task_id = %id, task = %task.name, "Task resumed");
        self.events.emit(OrchestratorEvent::TaskResumed { task_id: id });
        Ok(task)
    }

    /// Spawn the polling dispatch loop and the timeout sweep loop. Each
    /// dispatch tick claims at most one task and runs it on its own tokio
    /// task, so a slow handler does not hold up the next tick.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let dispatch = {
            let queue = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(queue.config.poll_interval());
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    if let Err(e) = Arc::clone(&queue).dispatch_once().await {
                        error!(error = %e, "Task dispatch tick failed");
                    }
                }
                info!("Task dispatch loop stopped");
            })
        };

        let sweep = {
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(queue.config.timeout_check_interval());
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    if let Err(e) = queue.check_timeouts().await {
                        error!(error = %e, "Timeout sweep failed");
                    }
                }
            })
        };

        vec![dispatch, sweep]
    }

    async fn dispatch_once(self: Arc<Self>) -> ForemanResult<Option<Uuid>> {
        self.check_timeouts().await?;
        let Some((task, handler)) = self.claim_next().await? else {
            return Ok(None);
        };
        let id = task.id;
        tokio::spawn(async move {
            if let Err(e) = self.execute(task, handler).await {
                error!(task_id = %id, error = %e, "Failed to settle task execution");
            }
        });
        Ok(Some(id))
    }
}
