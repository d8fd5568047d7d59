use crate::persona::Persona;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Scheduling priority shared by tasks and goals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

// --- Tasks ---

/// Status of a background task.
///
/// `queued → running → {completed, failed, cancelled, paused}`; a failing run
/// goes back to `queued` while retries remain, `paused` resumes to `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never run again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the queue state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Paused)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Queued)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Paused => write!(f, "paused"),
        }
    }
}

/// A unit of background work with its own retry, timeout and checkpoint state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: Uuid,
    /// Handler name the task is dispatched to.
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Percent complete, 0-100.
    pub progress: u8,
    #[serde(default)]
    pub progress_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Last error text; kept after the task fails permanently.
    #[serde(default)]
    pub error: Option<String>,
    /// Value returned by the handler on success.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Identifies the current run. A fresh id is assigned on every claim.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundTask {
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            status: TaskStatus::Queued,
            priority,
            progress: 0,
            progress_message: None,
            retry_count: 0,
            max_retries,
            error: None,
            result: None,
            created_at: now,
            started_at: None,
            run_id: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Whether another failed attempt would still be retried.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Resumable snapshot of a task's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Uuid,
    pub step: u32,
    pub total_steps: u32,
    /// Opaque handler state.
    pub state: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

// --- Agents ---

/// Status of an orchestrated agent.
///
/// `idle ⇄ working ⇄ waiting`, any live status may fall into `error`, `error`
/// recovers to `idle`, and every status may end in `terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Waiting,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminated(self) -> bool {
        self == AgentStatus::Terminated
    }

    /// Whether the lifecycle state machine allows moving from `self` to `next`.
    /// Re-entering the current live status is allowed and acts as a refresh.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) | (_, Error) => true,
            (a, b) if a == b => true,
            (Idle, Working) | (Working, Idle) => true,
            (Working, Waiting) | (Waiting, Working) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Working => write!(f, "working"),
            AgentStatus::Waiting => write!(f, "waiting"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Counters tracked per agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Running mean over every recorded task.
    pub average_response_time_ms: f64,
}

impl AgentMetrics {
    /// Record one finished task and fold its duration into the running mean.
    pub fn record_task(&mut self, success: bool, duration_ms: u64) {
        let old_total = self.total_tasks as f64;
        self.total_tasks += 1;
        if success {
            self.successful_tasks += 1;
        } else {
            self.failed_tasks += 1;
        }
        self.average_response_time_ms = (self.average_response_time_ms * old_total
            + duration_ms as f64)
            / self.total_tasks as f64;
    }

    /// Add another agent's counters to these, weighting the mean by task count.
    pub fn absorb(&mut self, other: &AgentMetrics) {
        let total = self.total_tasks + other.total_tasks;
        if total > 0 {
            self.average_response_time_ms = (self.average_response_time_ms
                * self.total_tasks as f64
                + other.average_response_time_ms * other.total_tasks as f64)
                / total as f64;
        }
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
        self.total_tasks = total;
        self.successful_tasks += other.successful_tasks;
        self.failed_tasks += other.failed_tasks;
    }
}

/// A lifecycle-managed logical worker. Agents are bookkeeping entities; they
/// own no thread of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratedAgent {
    pub id: String,
    pub persona_id: String,
    /// Derived persona snapshot the agent was created with.
    pub persona: Persona,
    pub status: AgentStatus,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    /// Children in creation order.
    #[serde(default)]
    pub sub_agent_ids: Vec<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub metrics: AgentMetrics,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub termination_reason: Option<String>,
}

// --- Goals and plans ---

/// Status of a goal. Re-planning never reopens a goal; it links a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Pending,
    Planning,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl GoalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Cancelled
        )
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoalStatus::Pending => write!(f, "pending"),
            GoalStatus::Planning => write!(f, "planning"),
            GoalStatus::Active => write!(f, "active"),
            GoalStatus::Completed => write!(f, "completed"),
            GoalStatus::Failed => write!(f, "failed"),
            GoalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A high-level desired outcome submitted for decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub status: GoalStatus,
    /// Set only on goals produced by re-planning.
    #[serde(default)]
    pub parent_goal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Ready,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Ready => write!(f, "ready"),
            PlanStatus::Executing => write!(f, "executing"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One step of a plan. `depends_on` only ever names earlier steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub order: usize,
    pub description: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_arguments: Option<serde_json::Value>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(order: usize, description: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order,
            description: description.into(),
            tool_name: None,
            tool_arguments: None,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries,
            result: None,
            error: None,
        }
    }

    /// Pending and every dependency completed.
    pub fn is_ready(&self, completed_ids: &[Uuid]) -> bool {
        self.status == StepStatus::Pending
            && self
                .depends_on
                .iter()
                .all(|dep| completed_ids.contains(dep))
    }
}

/// An ordered, dependency-annotated sequence of steps for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub current_step_index: usize,
    pub estimated_duration_minutes: u32,
    /// Heuristic score, 1-10.
    pub complexity: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn completed_step_ids(&self) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id)
            .collect()
    }

    pub fn step(&self, step_id: Uuid) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}
