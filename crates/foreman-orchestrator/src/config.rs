use crate::scheduler::ScheduledJob;
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Task queue admission, dispatch, retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_check_interval_ms")]
    pub timeout_check_interval_ms: u64,
    #[serde(default = "default_task_timeout_minutes")]
    pub task_timeout_minutes: u64,
    #[serde(default = "default_true")]
    pub retry_failed_tasks: bool,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl QueueConfig {
    pub fn task_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.task_timeout_minutes as i64)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_check_interval_ms: default_timeout_check_interval_ms(),
            task_timeout_minutes: default_task_timeout_minutes(),
            retry_failed_tasks: true,
            default_max_retries: default_max_retries(),
        }
    }
}

/// Agent idle supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    /// How often the per-agent deadline heap is drained.
    #[serde(default = "default_deadline_tick_ms")]
    pub deadline_tick_ms: u64,
    /// Terminate an agent that goes back to idle from working with no
    /// outstanding work.
    #[serde(default)]
    pub auto_terminate_on_idle: bool,
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.idle_timeout_ms as i64)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            deadline_tick_ms: default_deadline_tick_ms(),
            auto_terminate_on_idle: false,
        }
    }
}

/// Sub-agent fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    #[serde(default = "default_max_sub_agents")]
    pub max_sub_agents_per_parent: usize,
    #[serde(default = "default_persona_type")]
    pub default_persona_type: String,
    #[serde(default = "default_true")]
    pub auto_terminate_on_complete: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_sub_agents_per_parent: default_max_sub_agents(),
            default_persona_type: default_persona_type(),
            auto_terminate_on_complete: true,
        }
    }
}

/// Goal planning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_true")]
    pub use_llm: bool,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_minutes_per_step")]
    pub minutes_per_step: u32,
    /// Responses longer than this are treated as unparsable.
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
    #[serde(default = "default_step_max_retries")]
    pub step_max_retries: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            max_steps: default_max_steps(),
            minutes_per_step: default_minutes_per_step(),
            max_response_chars: default_max_response_chars(),
            step_max_retries: default_step_max_retries(),
        }
    }
}

/// Top-level engine configuration, usually read from `foreman.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub schedule: Vec<ScheduledJob>,
}

impl OrchestratorConfig {
    pub fn from_toml_str(input: &str) -> ForemanResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| ForemanError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> ForemanResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ForemanError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings that would stall or disable the engine.
    pub fn validate(&self) -> ForemanResult<()> {
        let checks: [(&str, bool); 8] = [
            ("queue.max_queue_size", self.queue.max_queue_size > 0),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms > 0),
            (
                "queue.timeout_check_interval_ms",
                self.queue.timeout_check_interval_ms > 0,
            ),
            (
                "queue.task_timeout_minutes",
                self.queue.task_timeout_minutes > 0,
            ),
            (
                "lifecycle.idle_check_interval_ms",
                self.lifecycle.idle_check_interval_ms > 0,
            ),
            (
                "lifecycle.deadline_tick_ms",
                self.lifecycle.deadline_tick_ms > 0,
            ),
            (
                "factory.max_sub_agents_per_parent",
                self.factory.max_sub_agents_per_parent > 0,
            ),
            ("planner.max_steps", self.planner.max_steps > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(ForemanError::Config(format!("{field} must be greater than 0")));
            }
        }
        for job in &self.schedule {
            crate::scheduler::Scheduler::parse_cron(&job.cron_expression)?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_queue_size() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_timeout_check_interval_ms() -> u64 {
    30_000
}
fn default_task_timeout_minutes() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}
fn default_idle_check_interval_ms() -> u64 {
    60_000
}
fn default_deadline_tick_ms() -> u64 {
    1000
}
fn default_max_sub_agents() -> usize {
    5
}
fn default_persona_type() -> String {
    "general".to_string()
}
fn default_max_steps() -> usize {
    10
}
fn default_minutes_per_step() -> u32 {
    5
}
fn default_max_response_chars() -> usize {
    20_000
}
fn default_step_max_retries() -> u32 {
    2
}
