use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::factory::SubAgentFactory;
use crate::lifecycle::{AgentLifecycleManager, WorkTracker};
use crate::persona::{InMemoryPersonaRegistry, Persona, PersonaRegistry};
use crate::planner::{GoalInput, GoalPlanner, PlanningLlm, ToolDescriptor};
use crate::scheduler::Scheduler;
use crate::store::{AgentStore, InMemoryAgentStore, InMemoryTaskStore, TaskStore};
use crate::task_queue::{EnqueueOptions, TaskHandler, TaskQueue};
use crate::types::{Goal, OrchestratedAgent, Plan, PlanStatus, PlanStep, TaskStatus};
use async_trait::async_trait;
use foreman_core::{EventBus, EventSink, ForemanError, ForemanResult, OrchestratorEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Task name used for plan steps that carry no tool.
pub const PLAN_STEP_TASK: &str = "plan-step";

/// Reports pending work while the agent's `current_task` names a task that
/// is still queued, running or paused.
pub struct QueueWorkTracker {
    queue: Arc<TaskQueue>,
}

impl QueueWorkTracker {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl WorkTracker for QueueWorkTracker {
    async fn has_pending_work(&self, agent: &OrchestratedAgent) -> ForemanResult<bool> {
        let Some(task_id) = agent
            .current_task
            .as_deref()
            .and_then(|t| Uuid::parse_str(t).ok())
        else {
            return Ok(false);
        };
        match self.queue.get_task(task_id).await {
            Ok(task) => Ok(matches!(
                task.status,
                TaskStatus::Queued | TaskStatus::Running | TaskStatus::Paused
            )),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Payload attached to tasks that execute plan steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTaskPayload {
    pub goal_id: Uuid,
    pub plan_id: Uuid,
    pub step_id: Uuid,
    pub description: String,
    #[serde(default)]
    pub arguments: Option<serde_json::Value>,
}

impl StepTaskPayload {
    /// Recover the step reference from a task payload, if it has one.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// How a step task left the queue.
enum Settlement {
    Completed,
    Failed(String),
    Cancelled,
}

/// Builder for [`Orchestrator`]. Every collaborator defaults to its
/// in-process implementation.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    task_store: Option<Arc<dyn TaskStore>>,
    agent_store: Option<Arc<dyn AgentStore>>,
    personas: Option<Arc<dyn PersonaRegistry>>,
    llm: Option<Arc<dyn PlanningLlm>>,
    clock: Option<Arc<dyn Clock>>,
    event_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn agent_store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.agent_store = Some(store);
        self
    }

    pub fn personas(mut self, personas: Arc<dyn PersonaRegistry>) -> Self {
        self.personas = Some(personas);
        self
    }

    pub fn planning_llm(mut self, llm: Arc<dyn PlanningLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> ForemanResult<Orchestrator> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bus = Arc::new(EventBus::new(self.event_capacity));
        let events: Arc<dyn EventSink> = bus.clone();

        let queue = Arc::new(TaskQueue::new(
            self.task_store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            self.config.queue.clone(),
            Arc::clone(&events),
            Arc::clone(&clock),
        ));
        let lifecycle = Arc::new(
            AgentLifecycleManager::new(
                self.agent_store
                    .unwrap_or_else(|| Arc::new(InMemoryAgentStore::new())),
                self.config.lifecycle.clone(),
                Arc::clone(&events),
                Arc::clone(&clock),
            )
            .with_work_tracker(Arc::new(QueueWorkTracker::new(Arc::clone(&queue)))),
        );
        let personas = self.personas.unwrap_or_else(|| {
            let registry = InMemoryPersonaRegistry::new();
            let default_type = &self.config.factory.default_persona_type;
            registry.register(Persona::new(default_type.clone(), default_type.clone()));
            Arc::new(registry)
        });
        let factory = Arc::new(SubAgentFactory::new(
            Arc::clone(&lifecycle),
            personas,
            self.config.factory.clone(),
            Arc::clone(&events),
        ));
        let mut planner = GoalPlanner::new(
            self.config.planner.clone(),
            Arc::clone(&events),
            Arc::clone(&clock),
        );
        if let Some(llm) = self.llm {
            planner = planner.with_llm(llm);
        }

        Ok(Orchestrator {
            config: self.config,
            bus,
            queue,
            lifecycle,
            factory,
            planner: Arc::new(planner),
            advance: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        })
    }
}

/// The engine context. Owns every component; nothing lives in globals.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    lifecycle: Arc<AgentLifecycleManager>,
    factory: Arc<SubAgentFactory>,
    planner: Arc<GoalPlanner>,
    /// Serializes step hand-off and step settlement, so a step is never
    /// enqueued twice and never settled while its hand-off is in flight.
    advance: tokio::sync::Mutex<()>,
    /// Replaced on `start` once cancelled, so the engine can be restarted.
    shutdown: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            task_store: None,
            agent_store: None,
            personas: None,
            llm: None,
            clock: None,
            event_capacity: 1024,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    pub fn factory(&self) -> &Arc<SubAgentFactory> {
        &self.factory
    }

    pub fn planner(&self) -> &Arc<GoalPlanner> {
        &self.planner
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.queue.register_handler(name, handler);
    }

    /// Make a tool available to the planner. Steps using it run as tasks
    /// named after the tool, so a handler is usually registered alongside.
    pub fn register_tool(&self, tool: ToolDescriptor) {
        self.planner.register_tool(tool);
    }

    /// Create and plan a goal, then enqueue its first ready steps.
    pub async fn submit_goal(&self, input: GoalInput) -> ForemanResult<(Goal, Plan)> {
        let goal = self.planner.create_goal(input);
        let plan = self.planner.generate_plan(goal.id).await?;
        self.advance_plan(plan.id).await?;
        Ok((self.planner.get_goal(goal.id)?, self.planner.get_plan(plan.id)?))
    }

    fn step_task(goal: &Goal, plan_id: Uuid, step: &PlanStep) -> ForemanResult<EnqueueOptions> {
        let payload = StepTaskPayload {
            goal_id: goal.id,
            plan_id,
            step_id: step.id,
            description: step.description.clone(),
            arguments: step.tool_arguments.clone(),
        };
        Ok(EnqueueOptions::new(
            step.tool_name.clone().unwrap_or_else(|| PLAN_STEP_TASK.to_string()),
        )
        .with_payload(serde_json::to_value(payload)?)
        .with_priority(goal.priority)
        .with_max_retries(0))
    }

    /// Enqueue every ready step of a plan. Steps retry through the planner,
    /// so their tasks carry no queue retries. A full queue leaves the
    /// remaining steps pending for the next pass.
    pub async fn advance_plan(&self, plan_id: Uuid) -> ForemanResult<usize> {
        let _advance = self.advance.lock().await;
        self.advance_plan_locked(plan_id).await
    }

    /// Caller holds `advance`. A step is marked running before its task is
    /// saved, so the task can never settle against a pending step.
    async fn advance_plan_locked(&self, plan_id: Uuid) -> ForemanResult<usize> {
        let plan = self.planner.get_plan(plan_id)?;
        if !matches!(plan.status, PlanStatus::Ready | PlanStatus::Executing) {
            return Ok(0);
        }
        let goal = self.planner.get_goal(plan.goal_id)?;
        if goal.status.is_terminal() {
            return Ok(0);
        }

        let mut enqueued = 0;
        for step in self.planner.ready_steps(plan_id)? {
            let options = Self::step_task(&goal, plan_id, &step)?;
            self.planner.start_step(plan_id, step.id)?;
            match self.queue.enqueue(options).await {
                Ok(task) => {
                    debug!(plan_id = %plan_id, step_id = %step.id, task_id = %task.id, "Plan step enqueued");
                    enqueued += 1;
                }
                Err(e) => {
                    self.planner.release_step(plan_id, step.id)?;
                    if e.is_capacity() {
                        warn!(plan_id = %plan_id, step_id = %step.id, "Queue full, deferring plan step");
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(enqueued)
    }

    /// Advance every plan that still has work to hand off.
    pub async fn advance_all_plans(&self) -> ForemanResult<usize> {
        let mut enqueued = 0;
        for status in [PlanStatus::Ready, PlanStatus::Executing] {
            for plan in self.planner.list_plans(Some(status)) {
                enqueued += self.advance_plan(plan.id).await?;
            }
        }
        Ok(enqueued)
    }

    /// Feed a settled step task back into its plan. A cancelled task fails
    /// its step outright; a failed one goes through the step's retries.
    pub async fn handle_event(&self, event: &OrchestratorEvent) -> ForemanResult<()> {
        let (task_id, settlement) = match event {
            OrchestratorEvent::TaskCompleted { task_id, .. } => (*task_id, Settlement::Completed),
            OrchestratorEvent::TaskFailed { task_id, error, .. } => {
                (*task_id, Settlement::Failed(error.clone()))
            }
            OrchestratorEvent::TaskCancelled { task_id } => (*task_id, Settlement::Cancelled),
            _ => return Ok(()),
        };

        let task = self.queue.get_task(task_id).await?;
        let Some(step) = StepTaskPayload::from_payload(&task.payload) else {
            return Ok(());
        };

        let _advance = self.advance.lock().await;
        let settled = match settlement {
            Settlement::Completed => self.planner.record_step_result(
                step.plan_id,
                step.step_id,
                Ok(task.result.unwrap_or(serde_json::Value::Null)),
            ),
            Settlement::Failed(error) => {
                self.planner
                    .record_step_result(step.plan_id, step.step_id, Err(error))
            }
            Settlement::Cancelled => {
                self.planner
                    .abandon_step(step.plan_id, step.step_id, "Task cancelled")
            }
        };
        let plan = match settled {
            Ok(plan) => plan,
            Err(ForemanError::InvalidTransition { .. }) => {
                debug!(task_id = %task_id, step_id = %step.step_id, "Step already settled, ignoring task signal");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.advance_plan_locked(plan.id).await?;
        Ok(())
    }

    /// Start every background loop: dispatch and timeout sweep, idle
    /// supervision, the cron scheduler and plan progress.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Orchestrator already started");
            return;
        }
        let shutdown = {
            let mut token = self.shutdown.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        handles.extend(Arc::clone(&self.queue).start(shutdown.child_token()));
        handles.push(Arc::clone(&self.lifecycle).start(shutdown.child_token()));
        if !self.config.schedule.is_empty() {
            handles.push(
                Scheduler::new(self.config.schedule.clone())
                    .start(Arc::clone(&self.queue), shutdown.child_token()),
            );
        }
        handles.push(self.spawn_plan_progress(shutdown.child_token()));

        info!(loops = handles.len(), "Orchestrator started");
    }

    fn spawn_plan_progress(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(engine.config.queue.poll_interval());
            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(envelope) => engine.handle_event(&envelope.event).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Plan progress lagged behind signals");
                            Ok(())
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sweep.tick() => engine.advance_all_plans().await.map(|_| ()),
                };
                if let Err(e) = result {
                    error!(error = %e, "Plan progress update failed");
                }
            }
        })
    }

    /// Stop every background loop and wait for them to finish. Handlers
    /// already running are left to complete on their own. A later `start`
    /// brings the loops back.
    pub async fn shutdown(&self) {
        self.shutdown.lock().cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop ended abnormally");
            }
        }
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task_queue::{fn_handler, TaskContext};
    use crate::types::{AgentStatus, GoalStatus, Priority, StepStatus};
    use crate::lifecycle::AgentOptions;
    use crate::config::LifecycleConfig;
    use crate::store::TaskStatusChange;
    use crate::task_queue::ExecutionOutcome;
    use crate::types::{BackgroundTask, Checkpoint};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;
    use tokio::sync::Notify;

    fn engine() -> Orchestrator {
        Orchestrator::builder(OrchestratorConfig::default())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = OrchestratorConfig::default();
        config.queue.max_queue_size = 0;
        assert!(Orchestrator::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_submit_goal_enqueues_first_step() {
        let engine = engine();
        let (goal, plan) = engine
            .submit_goal(GoalInput {
                description: "Summarize document X".into(),
                priority: Priority::High,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(goal.status, GoalStatus::Active);
        assert_eq!(plan.status, PlanStatus::Executing);
        assert_eq!(plan.steps[0].status, StepStatus::Running);

        let tasks = engine.queue().list_tasks(None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, PLAN_STEP_TASK);
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].max_retries, 0);
        let payload = StepTaskPayload::from_payload(&tasks[0].payload).unwrap();
        assert_eq!(payload.goal_id, goal.id);
        assert_eq!(payload.step_id, plan.steps[0].id);
        assert!(payload.description.contains("Summarize document X"));

        // Nothing new to hand off.
        assert_eq!(engine.advance_all_plans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completed_step_task_completes_goal() {
        let engine = engine();
        engine.register_handler(
            PLAN_STEP_TASK,
            fn_handler(|ctx: TaskContext| async move {
                Ok(serde_json::json!({ "done": ctx.payload()["description"] }))
            }),
        );
        let (goal, plan) = engine
            .submit_goal(GoalInput::new("Summarize document X"))
            .await
            .unwrap();

        let (task_id, _) = engine.queue().process_next().await.unwrap().unwrap();
        let task = engine.queue().get_task(task_id).await.unwrap();
        engine
            .handle_event(&OrchestratorEvent::TaskCompleted {
                task_id,
                name: task.name,
                duration_ms: 0,
            })
            .await
            .unwrap();

        let plan = engine.planner().get_plan(plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(plan.steps[0].result.is_some());
        assert_eq!(
            engine.planner().get_goal(goal.id).unwrap().status,
            GoalStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_failed_step_task_is_retried_through_plan() {
        let engine = engine();
        engine.register_handler(
            PLAN_STEP_TASK,
            fn_handler(|_ctx: TaskContext| async move {
                Err(ForemanError::Handler("tool offline".into()))
            }),
        );
        let (goal, plan) = engine.submit_goal(GoalInput::new("flaky work")).await.unwrap();
        let step_retries = engine.config().planner.step_max_retries;

        for _ in 0..=step_retries {
            let (task_id, outcome) = engine.queue().process_next().await.unwrap().unwrap();
            assert_eq!(outcome, ExecutionOutcome::Failed);
            let task = engine.queue().get_task(task_id).await.unwrap();
            engine
                .handle_event(&OrchestratorEvent::TaskFailed {
                    task_id,
                    name: task.name,
                    error: task.error.unwrap_or_default(),
                    retry_count: task.retry_count,
                })
                .await
                .unwrap();
        }

        let plan = engine.planner().get_plan(plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.steps[0].retry_count, step_retries);
        assert_eq!(plan.steps[0].error.as_deref(), Some("Handler error: tool offline"));
        assert_eq!(
            engine.planner().get_goal(goal.id).unwrap().status,
            GoalStatus::Failed
        );
        assert!(engine
            .queue()
            .list_tasks(Some(TaskStatus::Queued))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_step_task_fails_goal_without_retry() {
        let engine = engine();
        let (goal, plan) = engine.submit_goal(GoalInput::new("long crawl")).await.unwrap();

        let tasks = engine.queue().list_tasks(Some(TaskStatus::Queued)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        engine.queue().cancel_task(tasks[0].id).await.unwrap();
        engine
            .handle_event(&OrchestratorEvent::TaskCancelled {
                task_id: tasks[0].id,
            })
            .await
            .unwrap();

        let plan = engine.planner().get_plan(plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.steps[0].status, StepStatus::Failed);
        assert_eq!(plan.steps[0].retry_count, 0);
        assert_eq!(
            engine.planner().get_goal(goal.id).unwrap().status,
            GoalStatus::Failed
        );
        assert!(engine
            .queue()
            .list_tasks(Some(TaskStatus::Queued))
            .await
            .unwrap()
            .is_empty());

        // A repeated signal for the settled step is ignored.
        engine
            .handle_event(&OrchestratorEvent::TaskCancelled {
                task_id: tasks[0].id,
            })
            .await
            .unwrap();
    }

    /// Task store whose first save stalls after the task is already visible,
    /// until the test releases it.
    struct StallingStore {
        inner: InMemoryTaskStore,
        stall: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl TaskStore for StallingStore {
        async fn save(&self, task: &BackgroundTask) -> ForemanResult<()> {
            self.inner.save(task).await?;
            if self.stall.swap(false, Ordering::SeqCst) {
                self.release.notified().await;
            }
            Ok(())
        }
        async fn get(&self, id: Uuid) -> ForemanResult<Option<BackgroundTask>> {
            self.inner.get(id).await
        }
        async fn get_all(&self) -> ForemanResult<Vec<BackgroundTask>> {
            self.inner.get_all().await
        }
        async fn get_by_status(&self, status: TaskStatus) -> ForemanResult<Vec<BackgroundTask>> {
            self.inner.get_by_status(status).await
        }
        async fn get_queued_tasks(&self) -> ForemanResult<Vec<BackgroundTask>> {
            self.inner.get_queued_tasks().await
        }
        async fn count_by_status(&self, status: TaskStatus) -> ForemanResult<usize> {
            self.inner.count_by_status(status).await
        }
        async fn update_status(
            &self,
            id: Uuid,
            change: TaskStatusChange,
        ) -> ForemanResult<Option<BackgroundTask>> {
            self.inner.update_status(id, change).await
        }
        async fn update_progress(
            &self,
            id: Uuid,
            progress: u8,
            message: Option<String>,
            at: DateTime<Utc>,
        ) -> ForemanResult<bool> {
            self.inner.update_progress(id, progress, message, at).await
        }
        async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ForemanResult<()> {
            self.inner.save_checkpoint(checkpoint).await
        }
        async fn get_checkpoint(&self, task_id: Uuid) -> ForemanResult<Option<Checkpoint>> {
            self.inner.get_checkpoint(task_id).await
        }
        async fn delete_checkpoint(&self, task_id: Uuid) -> ForemanResult<()> {
            self.inner.delete_checkpoint(task_id).await
        }
        async fn get_timed_out_tasks(
            &self,
            started_before: DateTime<Utc>,
        ) -> ForemanResult<Vec<BackgroundTask>> {
            self.inner.get_timed_out_tasks(started_before).await
        }
    }

    #[tokio::test]
    async fn test_step_that_fails_before_enqueue_returns_still_settles() {
        let store = Arc::new(StallingStore {
            inner: InMemoryTaskStore::new(),
            stall: AtomicBool::new(true),
            release: Notify::new(),
        });
        let mut config = OrchestratorConfig::default();
        config.queue.poll_interval_ms = 5;
        let engine = Arc::new(
            Orchestrator::builder(config)
                .task_store(store.clone())
                .build()
                .unwrap(),
        );
        engine.register_handler(
            PLAN_STEP_TASK,
            fn_handler(|_ctx: TaskContext| async move {
                Err(ForemanError::Handler("tool offline".into()))
            }),
        );
        engine.start();

        let submit = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.submit_goal(GoalInput::new("flaky work")).await })
        };

        // The dispatcher runs the step task and it fails while the
        // submitting call is still inside the save.
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while engine
                .queue()
                .list_tasks(Some(TaskStatus::Failed))
                .await
                .unwrap()
                .is_empty()
            {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        store.release.notify_one();
        let (goal, plan) = submit.await.unwrap().unwrap();

        let status = tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                let goal = engine.planner().get_goal(goal.id).unwrap();
                if goal.status.is_terminal() {
                    return goal.status;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status, GoalStatus::Failed);

        let plan = engine.planner().get_plan(plan.id).unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(
            plan.steps[0].retry_count,
            engine.config().planner.step_max_retries
        );
        assert!(plan.steps.iter().all(|s| s.status != StepStatus::Running));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_step_tasks_are_ignored() {
        let engine = engine();
        let task = engine
            .queue()
            .enqueue(EnqueueOptions::new("send-report"))
            .await
            .unwrap();
        engine
            .handle_event(&OrchestratorEvent::TaskCancelled { task_id: task.id })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_work_tracker() {
        let engine = engine();
        let tracker = QueueWorkTracker::new(Arc::clone(engine.queue()));
        let agent = engine
            .lifecycle()
            .create_agent("a1", Persona::new("general", "general"), AgentOptions::default())
            .await
            .unwrap();
        assert!(!tracker.has_pending_work(&agent).await.unwrap());

        let task = engine
            .queue()
            .enqueue(EnqueueOptions::new("send-report"))
            .await
            .unwrap();
        let mut busy = agent.clone();
        busy.current_task = Some(task.id.to_string());
        assert!(tracker.has_pending_work(&busy).await.unwrap());

        engine.queue().cancel_task(task.id).await.unwrap();
        assert!(!tracker.has_pending_work(&busy).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_terminate_waits_for_assigned_task() {
        let mut config = OrchestratorConfig::default();
        config.lifecycle = LifecycleConfig {
            auto_terminate_on_idle: true,
            ..Default::default()
        };
        let engine = Orchestrator::builder(config).build().unwrap();
        let lifecycle = engine.lifecycle();
        lifecycle
            .create_agent("a1", Persona::new("general", "general"), AgentOptions::default())
            .await
            .unwrap();
        let task = engine
            .queue()
            .enqueue(EnqueueOptions::new("send-report"))
            .await
            .unwrap();

        lifecycle
            .update_status("a1", AgentStatus::Working, Some(task.id.to_string()))
            .await
            .unwrap();
        let agent = lifecycle
            .update_status("a1", AgentStatus::Idle, None)
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);

        engine.queue().cancel_task(task.id).await.unwrap();
        lifecycle
            .update_status("a1", AgentStatus::Working, Some(task.id.to_string()))
            .await
            .unwrap();
        let agent = lifecycle
            .update_status("a1", AgentStatus::Idle, None)
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = Arc::new(engine());
        engine.start();
        engine.start();
        engine.shutdown().await;
        assert!(engine.handles.lock().is_empty());
        assert!(engine.shutdown.lock().is_cancelled());

        engine.start();
        assert!(!engine.handles.lock().is_empty());
        assert!(!engine.shutdown.lock().is_cancelled());
        engine.shutdown().await;
    }
}
