use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A lifecycle signal published by the task queue, the agent lifecycle
/// manager, the sub-agent factory, or the goal planner.
///
/// Statuses are carried as their wire strings so consumers do not need the
/// orchestrator's types to interpret a payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskQueued {
        task_id: Uuid,
        name: String,
        priority: String,
    },
    TaskStarted {
        task_id: Uuid,
        name: String,
        attempt: u32,
    },
    TaskProgress {
        task_id: Uuid,
        progress: u8,
        message: Option<String>,
    },
    TaskCompleted {
        task_id: Uuid,
        name: String,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: Uuid,
        name: String,
        error: String,
        retry_count: u32,
    },
    TaskRetried {
        task_id: Uuid,
        name: String,
        error: String,
        retry_count: u32,
    },
    TaskCancelled {
        task_id: Uuid,
    },
    TaskPaused {
        task_id: Uuid,
    },
    TaskResumed {
        task_id: Uuid,
    },
    TaskTimeout {
        task_id: Uuid,
        running_ms: u64,
    },
    AgentSpawned {
        agent_id: String,
        persona_id: String,
        parent_agent_id: Option<String>,
    },
    AgentStatusChanged {
        agent_id: String,
        from: String,
        to: String,
    },
    AgentTerminated {
        agent_id: String,
        reason: String,
    },
    AgentError {
        agent_id: String,
        error: String,
    },
    SubAgentCreated {
        parent_agent_id: String,
        sub_agent_id: String,
        persona_id: String,
    },
    SubAgentCompleted {
        parent_agent_id: Option<String>,
        sub_agent_id: String,
        duration_ms: u64,
    },
    SubAgentFailed {
        parent_agent_id: Option<String>,
        sub_agent_id: String,
        error: String,
    },
    GoalCreated {
        goal_id: Uuid,
        parent_goal_id: Option<Uuid>,
    },
    GoalUpdated {
        goal_id: Uuid,
        status: String,
    },
    PlanCreated {
        plan_id: Uuid,
        goal_id: Uuid,
        steps: usize,
    },
    PlanReplanned {
        previous_plan_id: Uuid,
        plan_id: Uuid,
        goal_id: Uuid,
    },
}

impl OrchestratorEvent {
    /// The signal name, e.g. `task:queued` or `subagent:created`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskQueued { .. } => "task:queued",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskProgress { .. } => "task:progress",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskRetried { .. } => "task:retried",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::TaskPaused { .. } => "task:paused",
            Self::TaskResumed { .. } => "task:resumed",
            Self::TaskTimeout { .. } => "task:timeout",
            Self::AgentSpawned { .. } => "agent:spawned",
            Self::AgentStatusChanged { .. } => "agent:status_changed",
            Self::AgentTerminated { .. } => "agent:terminated",
            Self::AgentError { .. } => "agent:error",
            Self::SubAgentCreated { .. } => "subagent:created",
            Self::SubAgentCompleted { .. } => "subagent:completed",
            Self::SubAgentFailed { .. } => "subagent:failed",
            Self::GoalCreated { .. } => "goal:created",
            Self::GoalUpdated { .. } => "goal:updated",
            Self::PlanCreated { .. } => "plan:created",
            Self::PlanReplanned { .. } => "plan:replanned",
        }
    }

    /// The signal payload as JSON.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Abstract publish contract. Consumers of the signals live outside the
/// engine; components only ever emit.
pub trait EventSink: Send + Sync {
    /// Publish a signal. Must not block and must not fail the caller.
    fn emit(&self, event: OrchestratorEvent);
}

/// A sink that drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// A timestamped signal as delivered to [`EventBus`] subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub name: &'static str,
    pub emitted_at: DateTime<Utc>,
    pub event: OrchestratorEvent,
}

/// Fan-out signal bus backed by a tokio broadcast channel.
///
/// Emitting with no subscribers is fine; the signal is logged at debug level
/// and dropped. Slow subscribers lag and lose the oldest signals.
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` signals per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every signal emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: OrchestratorEvent) {
        let name = event.name();
        debug!(signal = name, "emit");
        let _ = self.tx.send(Envelope {
            name,
            emitted_at: Utc::now(),
            event,
        });
    }
}
