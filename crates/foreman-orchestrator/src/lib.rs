//! Multi-agent orchestration engine: background task queue, agent lifecycle
//! management, sub-agent factory and goal planner.
//!
//! Every component is constructed explicitly and shared by handle; the
//! [`Orchestrator`] context object wires them together and owns the
//! background loops.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Engine context: owns the components, runs the loops, drives plans.
//! - [`TaskQueue`]: Admission-controlled queue with retries, timeouts and checkpoints.
//! - [`AgentLifecycleManager`]: Agent state machine, cascade termination, idle supervision.
//! - [`SubAgentFactory`]: Bounded, persona-derived child agent creation.
//! - [`GoalPlanner`]: Goal decomposition with a model-assisted path and a heuristic fallback.
//! - [`Scheduler`]: Cron-based producer of recurring tasks.

/// Time source seam.
pub mod clock;
/// TOML-backed engine configuration.
pub mod config;
/// Time-ordered per-key deadlines.
pub mod deadline;
/// Engine context and plan progress.
pub mod engine;
/// Sub-agent creation and completion.
pub mod factory;
/// Agent lifecycle and idle supervision.
pub mod lifecycle;
/// Persona templates, overrides and registry.
pub mod persona;
/// Goal planning and plan bookkeeping.
pub mod planner;
/// Cron-based job scheduler.
pub mod scheduler;
/// Store collaborators and in-memory implementations.
pub mod store;
/// Background task queue.
pub mod task_queue;
/// Shared data model.
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    FactoryConfig, LifecycleConfig, OrchestratorConfig, PlannerConfig, QueueConfig,
};
pub use engine::{
    Orchestrator, OrchestratorBuilder, QueueWorkTracker, StepTaskPayload, PLAN_STEP_TASK,
};
pub use factory::{SubAgentFactory, SubAgentRequest, SubAgentResult};
pub use lifecycle::{
    AgentLifecycleManager, AgentOptions, MessageDirection, NoPendingWork, WorkTracker,
    IDLE_TIMEOUT_REASON,
};
pub use persona::{
    merge_persona, InMemoryPersonaRegistry, ModelConfig, ModelConfigOverride, Persona,
    PersonaOverride, PersonaRegistry,
};
pub use planner::{
    parse_plan_response, GoalInput, GoalPlanner, PlanParseError, PlanningLlm, RawStep,
    ReplanFeedback, ToolDescriptor,
};
pub use scheduler::{ScheduledJob, Scheduler};
pub use store::{AgentStore, InMemoryAgentStore, InMemoryTaskStore, TaskStatusChange, TaskStore};
pub use task_queue::{
    fn_handler, EnqueueOptions, ExecutionOutcome, QueueStats, TaskContext, TaskHandler, TaskQueue,
};
pub use types::{
    AgentMetrics, AgentStatus, BackgroundTask, Checkpoint, Goal, GoalStatus, OrchestratedAgent,
    Plan, PlanStatus, PlanStep, Priority, StepStatus, TaskStatus,
};
