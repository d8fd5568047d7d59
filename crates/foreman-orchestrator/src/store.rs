use crate::types::{
    AgentMetrics, AgentStatus, BackgroundTask, Checkpoint, OrchestratedAgent, TaskStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::ForemanResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// A single status write against a task.
///
/// When `expected` is set the write only applies if the stored status still
/// matches, which makes every transition a compare-and-set. `expected_run`
/// narrows the match to one specific run of the task.
#[derive(Debug, Clone)]
pub struct TaskStatusChange {
    pub status: TaskStatus,
    pub expected: Option<TaskStatus>,
    pub expected_run: Option<Uuid>,
    /// Run id recorded when the task moves to `running`.
    pub run_id: Option<Uuid>,
    pub count_retry: bool,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl TaskStatusChange {
    pub fn to(status: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            expected: None,
            expected_run: None,
            run_id: None,
            count_retry: false,
            error: None,
            result: None,
            at,
        }
    }

    pub fn expecting(mut self, expected: TaskStatus) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Only apply while the task is still on run `run_id`. `None` matches any
    /// run.
    pub fn expecting_run(mut self, run_id: Option<Uuid>) -> Self {
        self.expected_run = run_id;
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Bump `retry_count` in the same write.
    pub fn counting_retry(mut self) -> Self {
        self.count_retry = true;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Apply to a task, returning false when `expected` or `expected_run`
    /// does not match.
    pub fn apply(&self, task: &mut BackgroundTask) -> bool {
        if let Some(expected) = self.expected {
            if task.status != expected {
                return false;
            }
        }
        if let Some(run_id) = self.expected_run {
            if task.run_id != Some(run_id) {
                return false;
            }
        }
        task.status = self.status;
        task.updated_at = self.at;
        match self.status {
            TaskStatus::Running => {
                task.started_at = Some(self.at);
                if self.run_id.is_some() {
                    task.run_id = self.run_id;
                }
            }
            TaskStatus::Queued => task.started_at = None,
            TaskStatus::Completed => {
                task.progress = 100;
                task.completed_at = Some(self.at);
            }
            TaskStatus::Failed | TaskStatus::Cancelled => task.completed_at = Some(self.at),
            TaskStatus::Paused => {}
        }
        if self.count_retry {
            task.retry_count += 1;
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        true
    }
}

/// Durable task state. Implementations must make each status change atomic
/// per task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: &BackgroundTask) -> ForemanResult<()>;
    async fn get(&self, id: Uuid) -> ForemanResult<Option<BackgroundTask>>;
    async fn get_all(&self) -> ForemanResult<Vec<BackgroundTask>>;
    async fn get_by_status(&self, status: TaskStatus) -> ForemanResult<Vec<BackgroundTask>>;
    /// Queued tasks in dispatch order: highest priority first, then oldest.
    async fn get_queued_tasks(&self) -> ForemanResult<Vec<BackgroundTask>>;
    async fn count_by_status(&self, status: TaskStatus) -> ForemanResult<usize>;
    /// Returns the updated task, or `None` when the task is missing or the
    /// expected status or run did not match. Retry counting rides along via
    /// [`TaskStatusChange::counting_retry`].
    async fn update_status(
        &self,
        id: Uuid,
        change: TaskStatusChange,
    ) -> ForemanResult<Option<BackgroundTask>>;
    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> ForemanResult<bool>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ForemanResult<()>;
    async fn get_checkpoint(&self, task_id: Uuid) -> ForemanResult<Option<Checkpoint>>;
    async fn delete_checkpoint(&self, task_id: Uuid) -> ForemanResult<()>;
    /// Running tasks that started before `started_before`.
    async fn get_timed_out_tasks(
        &self,
        started_before: DateTime<Utc>,
    ) -> ForemanResult<Vec<BackgroundTask>>;

    /// Atomically move a queued task to running under a fresh run id.
    async fn claim(&self, id: Uuid, at: DateTime<Utc>) -> ForemanResult<Option<BackgroundTask>> {
        self.update_status(
            id,
            TaskStatusChange::to(TaskStatus::Running, at)
                .expecting(TaskStatus::Queued)
                .with_run(Uuid::new_v4()),
        )
        .await
    }
}

/// Durable agent state.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn save(&self, agent: &OrchestratedAgent) -> ForemanResult<()>;
    async fn get(&self, id: &str) -> ForemanResult<Option<OrchestratedAgent>>;
    async fn get_all(&self) -> ForemanResult<Vec<OrchestratedAgent>>;
    async fn get_sub_agents(&self, parent_id: &str) -> ForemanResult<Vec<OrchestratedAgent>>;
    /// Idle agents whose last activity is older than `idle_before`.
    async fn get_idle_agents(
        &self,
        idle_before: DateTime<Utc>,
    ) -> ForemanResult<Vec<OrchestratedAgent>>;
    /// Set status and current task, refreshing `last_active_at`.
    async fn update_status(
        &self,
        id: &str,
        status: AgentStatus,
        current_task: Option<String>,
        at: DateTime<Utc>,
    ) -> ForemanResult<Option<OrchestratedAgent>>;
    async fn update_metrics(&self, id: &str, metrics: &AgentMetrics) -> ForemanResult<bool>;
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> ForemanResult<bool>;
    /// Append `child_id` to the parent's ordered sub-agent list.
    async fn add_sub_agent(&self, parent_id: &str, child_id: &str) -> ForemanResult<bool>;
    async fn remove_sub_agent(&self, parent_id: &str, child_id: &str) -> ForemanResult<bool>;
    async fn delete(&self, id: &str) -> ForemanResult<bool>;
}

// --- In-memory implementations ---

/// Process-local [`TaskStore`].
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, BackgroundTask>>,
    checkpoints: RwLock<HashMap<Uuid, Checkpoint>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn by_creation(mut tasks: Vec<BackgroundTask>) -> Vec<BackgroundTask> {
    tasks.sort_by_key(|t| t.created_at);
    tasks
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &BackgroundTask) -> ForemanResult<()> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ForemanResult<Option<BackgroundTask>> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn get_all(&self) -> ForemanResult<Vec<BackgroundTask>> {
        Ok(by_creation(self.tasks.read().values().cloned().collect()))
    }

    async fn get_by_status(&self, status: TaskStatus) -> ForemanResult<Vec<BackgroundTask>> {
        Ok(by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| t.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn get_queued_tasks(&self) -> ForemanResult<Vec<BackgroundTask>> {
        let mut queued = self.get_by_status(TaskStatus::Queued).await?;
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(queued)
    }

    async fn count_by_status(&self, status: TaskStatus) -> ForemanResult<usize> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .count())
    }

    async fn update_status(
        &self,
        id: Uuid,
        change: TaskStatusChange,
    ) -> ForemanResult<Option<BackgroundTask>> {
        let mut tasks = self.tasks.write();
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        if change.apply(task) {
            Ok(Some(task.clone()))
        } else {
            Ok(None)
        }
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> ForemanResult<bool> {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(&id) {
            Some(task) => {
                task.progress = progress.min(100);
                if message.is_some() {
                    task.progress_message = message;
                }
                task.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> ForemanResult<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.task_id, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, task_id: Uuid) -> ForemanResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().get(&task_id).cloned())
    }

    async fn delete_checkpoint(&self, task_id: Uuid) -> ForemanResult<()> {
        self.checkpoints.write().remove(&task_id);
        Ok(())
    }

    async fn get_timed_out_tasks(
        &self,
        started_before: DateTime<Utc>,
    ) -> ForemanResult<Vec<BackgroundTask>> {
        Ok(by_creation(
            self.tasks
                .read()
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Running
                        && t.started_at.is_some_and(|s| s < started_before)
                })
                .cloned()
                .collect(),
        ))
    }
}

/// Process-local [`AgentStore`].
#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<String, OrchestratedAgent>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn save(&self, agent: &OrchestratedAgent) -> ForemanResult<()> {
        self.agents.write().insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> ForemanResult<Option<OrchestratedAgent>> {
        Ok(self.agents.read().get(id).cloned())
    }

    async fn get_all(&self) -> ForemanResult<Vec<OrchestratedAgent>> {
        let mut agents: Vec<OrchestratedAgent> = self.agents.read().values().cloned().collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn get_sub_agents(&self, parent_id: &str) -> ForemanResult<Vec<OrchestratedAgent>> {
        let agents = self.agents.read();
        let Some(parent) = agents.get(parent_id) else {
            return Ok(Vec::new());
        };
        Ok(parent
            .sub_agent_ids
            .iter()
            .filter_map(|id| agents.get(id).cloned())
            .collect())
    }

    async fn get_idle_agents(
        &self,
        idle_before: DateTime<Utc>,
    ) -> ForemanResult<Vec<OrchestratedAgent>> {
        Ok(self
            .agents
            .read()
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.last_active_at < idle_before)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: AgentStatus,
        current_task: Option<String>,
        at: DateTime<Utc>,
    ) -> ForemanResult<Option<OrchestratedAgent>> {
        let mut agents = self.agents.write();
        Ok(agents.get_mut(id).map(|agent| {
            agent.status = status;
            agent.current_task = current_task;
            agent.last_active_at = at;
            agent.clone()
        }))
    }

    async fn update_metrics(&self, id: &str, metrics: &AgentMetrics) -> ForemanResult<bool> {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(agent) => {
                agent.metrics = metrics.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> ForemanResult<bool> {
        let mut agents = self.agents.write();
        match agents.get_mut(id) {
            Some(agent) => {
                agent.last_active_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_sub_agent(&self, parent_id: &str, child_id: &str) -> ForemanResult<bool> {
        let mut agents = self.agents.write();
        match agents.get_mut(parent_id) {
            Some(parent) => {
                if !parent.sub_agent_ids.iter().any(|id| id == child_id) {
                    parent.sub_agent_ids.push(child_id.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_sub_agent(&self, parent_id: &str, child_id: &str) -> ForemanResult<bool> {
        let mut agents = self.agents.write();
        match agents.get_mut(parent_id) {
            Some(parent) => {
                let before = parent.sub_agent_ids.len();
                parent.sub_agent_ids.retain(|id| id != child_id);
                Ok(parent.sub_agent_ids.len() != before)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &str) -> ForemanResult<bool> {
        Ok(self.agents.write().remove(id).is_some())
    }
}
