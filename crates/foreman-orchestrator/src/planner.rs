use crate::clock::Clock;
use crate::config::PlannerConfig;
use crate::types::{Goal, GoalStatus, Plan, PlanStatus, PlanStep, Priority, StepStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::{EventSink, ForemanError, ForemanResult, OrchestratorEvent};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Language model used to draft plans. Output is untrusted text.
#[async_trait]
pub trait PlanningLlm: Send + Sync {
    async fn generate_plan(&self, prompt: &str) -> ForemanResult<String>;
}

/// A tool the planner may assign to steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Input for [`GoalPlanner::create_goal`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalInput {
    pub description: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl GoalInput {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }
}

/// Why a plan has to be redone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplanFeedback {
    pub failure_reason: String,
    #[serde(default)]
    pub additional_context: Option<String>,
}

/// Step descriptor as drafted by the model, before identifiers exist.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawStep {
    pub description: String,
    #[serde(default, alias = "tool_name")]
    pub tool: Option<String>,
    #[serde(default, alias = "tool_arguments")]
    pub arguments: Option<serde_json::Value>,
    /// 0-based positions of earlier steps.
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanParseError {
    #[error("response exceeds {limit} characters")]
    TooLong { limit: usize },
    #[error("response contains no JSON array")]
    NoArray,
    #[error("invalid step list: {0}")]
    Invalid(String),
    #[error("response contains no usable steps")]
    Empty,
}

enum StepOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
    /// Failed without a retry.
    Abandoned(String),
}

#[allow(clippy::expect_used)]
static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("fence regex should compile")
});

/// Strictly parse a model response into at most `max_steps` step
/// descriptors. Markdown fences and prose around the outermost JSON array
/// are ignored; steps with a blank description are dropped.
pub fn parse_plan_response(
    raw: &str,
    max_steps: usize,
    max_chars: usize,
) -> Result<Vec<RawStep>, PlanParseError> {
    if raw.chars().count() > max_chars {
        return Err(PlanParseError::TooLong { limit: max_chars });
    }

    let body = FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map_or(raw, |m| m.as_str());

    let (Some(start), Some(end)) = (body.find('['), body.rfind(']')) else {
        return Err(PlanParseError::NoArray);
    };
    if end < start {
        return Err(PlanParseError::NoArray);
    }

    let steps: Vec<RawStep> = serde_json::from_str(&body[start..=end])
        .map_err(|e| PlanParseError::Invalid(e.to_string()))?;
    let mut steps: Vec<RawStep> = steps
        .into_iter()
        .filter(|s| !s.description.trim().is_empty())
        .collect();
    if steps.is_empty() {
        return Err(PlanParseError::Empty);
    }
    steps.truncate(max_steps);
    Ok(steps)
}

/// Planning heuristic: flat time budget per step.
pub fn estimate_duration(steps: &[PlanStep], minutes_per_step: u32) -> u32 {
    (steps.len() as u32).saturating_mul(minutes_per_step)
}

/// Planning heuristic: 1-10 score blending step count and the share of
/// steps that carry dependencies.
pub fn estimate_complexity(steps: &[PlanStep]) -> u8 {
    if steps.is_empty() {
        return 1;
    }
    let with_deps = steps.iter().filter(|s| !s.depends_on.is_empty()).count();
    let ratio = with_deps as f64 / steps.len() as f64;
    let score = (steps.len() as f64 * 0.5 + ratio * 4.0).ceil();
    score.clamp(1.0, 10.0) as u8
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

enum DraftOutcome {
    Disabled,
    Parsed(Vec<RawStep>),
    Rejected(String),
}

/// Decomposes goals into dependency-annotated plans and tracks their
/// execution. Planning never hard-fails: any model or parse problem falls
/// back to the single-step heuristic plan.
pub struct GoalPlanner {
    config: PlannerConfig,
    llm: Option<Arc<dyn PlanningLlm>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    goals: RwLock<HashMap<Uuid, Goal>>,
    plans: RwLock<HashMap<Uuid, Plan>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl GoalPlanner {
    pub fn new(config: PlannerConfig, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            llm: None,
            tools: RwLock::new(Vec::new()),
            goals: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            events,
            clock,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn PlanningLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Register or replace a tool under its name.
    pub fn register_tool(&self, tool: ToolDescriptor) {
        let mut tools = self.tools.write();
        match tools.iter_mut().find(|t| t.name == tool.name) {
            Some(existing) => *existing = tool,
            None => tools.push(tool),
        }
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    // --- Goals ---

    pub fn create_goal(&self, input: GoalInput) -> Goal {
        self.insert_goal(input, None)
    }

    fn insert_goal(&self, input: GoalInput, parent_goal_id: Option<Uuid>) -> Goal {
        let now = self.clock.now();
        let goal = Goal {
            id: Uuid::new_v4(),
            description: input.description,
            constraints: input.constraints,
            success_criteria: input.success_criteria,
            priority: input.priority,
            deadline: input.deadline,
            status: GoalStatus::Pending,
            parent_goal_id,
            created_at: now,
            updated_at: now,
        };
        self.goals.write().insert(goal.id, goal.clone());

        info!(goal_id = %goal.id, parent = ?parent_goal_id, "Goal created");
        self.events.emit(OrchestratorEvent::GoalCreated {
            goal_id: goal.id,
            parent_goal_id,
        });
        goal
    }

    pub fn get_goal(&self, id: Uuid) -> ForemanResult<Goal> {
        self.goals
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForemanError::not_found("goal", id))
    }

    pub fn list_goals(&self) -> Vec<Goal> {
        let mut goals: Vec<Goal> = self.goals.read().values().cloned().collect();
        goals.sort_by_key(|g| g.created_at);
        goals
    }

    /// Set a goal's status. Terminal goals only accept their own status.
    pub fn update_goal_status(&self, id: Uuid, status: GoalStatus) -> ForemanResult<Goal> {
        let goal = {
            let mut goals = self.goals.write();
            let goal = goals
                .get_mut(&id)
                .ok_or_else(|| ForemanError::not_found("goal", id))?;
            if goal.status == status {
                return Ok(goal.clone());
            }
            if goal.status.is_terminal() {
                return Err(ForemanError::invalid_transition(id, goal.status, status));
            }
            goal.status = status;
            goal.updated_at = self.clock.now();
            goal.clone()
        };
        debug!(goal_id = %id, status = %status, "Goal updated");
        self.events.emit(OrchestratorEvent::GoalUpdated {
            goal_id: id,
            status: status.to_string(),
        });
        Ok(goal)
    }

    // --- Planning ---

    fn build_prompt(&self, goal: &Goal) -> String {
        let mut prompt = format!(
            "Break the following goal into at most {} concrete steps.\n\nGoal: {}\n",
            self.config.max_steps, goal.description
        );
        if !goal.constraints.is_empty() {
            prompt.push_str("\nConstraints:\n");
            for c in &goal.constraints {
                prompt.push_str(&format!("- {c}\n"));
            }
        }
        if !goal.success_criteria.is_empty() {
            prompt.push_str("\nSuccess criteria:\n");
            for c in &goal.success_criteria {
                prompt.push_str(&format!("- {c}\n"));
            }
        }
        let tools = self.tools.read();
        if !tools.is_empty() {
            prompt.push_str("\nAvailable tools:\n");
            for (i, tool) in tools.iter().enumerate() {
                prompt.push_str(&format!("{}. {}: {}\n", i + 1, tool.name, tool.description));
            }
        }
        prompt.push_str(
            "\nRespond with only a JSON array. Each element is an object with \
             \"description\" (string), \"tool\" (tool name or null), \"arguments\" \
             (object or null) and \"depends_on\" (0-based indices of earlier steps).",
        );
        prompt
    }

    async fn draft_with_llm(&self, goal: &Goal) -> DraftOutcome {
        let llm = match (&self.llm, self.config.use_llm) {
            (Some(llm), true) => Arc::clone(llm),
            _ => return DraftOutcome::Disabled,
        };
        let prompt = self.build_prompt(goal);
        match llm.generate_plan(&prompt).await {
            Ok(raw) => match parse_plan_response(
                &raw,
                self.config.max_steps,
                self.config.max_response_chars,
            ) {
                Ok(steps) => DraftOutcome::Parsed(steps),
                Err(e) => DraftOutcome::Rejected(e.to_string()),
            },
            Err(e) => DraftOutcome::Rejected(e.to_string()),
        }
    }

    /// Give every drafted step an id and resolve positional dependencies
    /// against earlier steps; anything else is dropped.
    fn materialize(&self, drafted: Vec<RawStep>) -> Vec<PlanStep> {
        let known_tools: HashSet<String> =
            self.tools.read().iter().map(|t| t.name.clone()).collect();
        let mut steps: Vec<PlanStep> = Vec::with_capacity(drafted.len());

        for (order, raw) in drafted.into_iter().enumerate() {
            let mut step = PlanStep::new(order, raw.description.trim(), self.config.step_max_retries);
            step.tool_name = raw.tool.filter(|name| {
                let known = known_tools.contains(name);
                if !known {
                    debug!(tool = %name, "Dropping unknown tool from drafted step");
                }
                known
            });
            step.tool_arguments = raw.arguments;

            let mut depends_on = Vec::new();
            for position in raw.depends_on {
                match steps.get(position) {
                    Some(dep) if position < order && !depends_on.contains(&dep.id) => {
                        depends_on.push(dep.id)
                    }
                    _ => debug!(step = order, position, "Dropping unresolvable dependency"),
                }
            }
            step.depends_on = depends_on;
            steps.push(step);
        }
        steps
    }

    /// Best registered tool by token overlap with `text`, if any overlaps.
    fn match_tool(&self, text: &str) -> Option<String> {
        let wanted = tokens(text);
        let tools = self.tools.read();
        let mut best: Option<(&ToolDescriptor, usize)> = None;
        for tool in tools.iter() {
            let mut offered = tokens(&tool.name);
            offered.extend(tokens(&tool.description));
            let score = wanted.intersection(&offered).count();
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((tool, score));
            }
        }
        best.map(|(tool, _)| tool.name.clone())
    }

    fn assemble(&self, goal_id: Uuid, steps: Vec<PlanStep>) -> Plan {
        let now = self.clock.now();
        Plan {
            id: Uuid::new_v4(),
            goal_id,
            estimated_duration_minutes: estimate_duration(&steps, self.config.minutes_per_step),
            complexity: estimate_complexity(&steps),
            steps,
            status: PlanStatus::Ready,
            current_step_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Heuristic plan: one step holding the goal text, with a tool picked by
    /// token overlap. Not stored.
    pub fn generate_simple_plan(&self, goal: &Goal) -> Plan {
        let mut step = PlanStep::new(0, goal.description.clone(), self.config.step_max_retries);
        step.tool_name = self.match_tool(&goal.description);
        self.assemble(goal.id, vec![step])
    }

    /// Plan a goal, using the model when enabled and configured, otherwise
    /// (or on any model or parse failure) the heuristic plan.
    pub async fn generate_plan(&self, goal_id: Uuid) -> ForemanResult<Plan> {
        let goal = self.update_goal_status(goal_id, GoalStatus::Planning)?;

        let plan = match self.draft_with_llm(&goal).await {
            DraftOutcome::Parsed(drafted) => {
                let steps = self.materialize(drafted);
                self.assemble(goal.id, steps)
            }
            DraftOutcome::Disabled => self.generate_simple_plan(&goal),
            DraftOutcome::Rejected(reason) => {
                warn!(goal_id = %goal.id, reason = %reason, "Model plan rejected, using simple plan");
                self.generate_simple_plan(&goal)
            }
        };

        self.plans.write().insert(plan.id, plan.clone());
        self.update_goal_status(goal_id, GoalStatus::Active)?;

        info!(
            goal_id = %goal_id,
            plan_id = %plan.id,
            steps = plan.steps.len(),
            complexity = plan.complexity,
            "Plan created"
        );
        self.events.emit(OrchestratorEvent::PlanCreated {
            plan_id: plan.id,
            goal_id,
            steps: plan.steps.len(),
        });
        Ok(plan)
    }

    pub fn get_plan(&self, id: Uuid) -> ForemanResult<Plan> {
        self.plans
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ForemanError::not_found("plan", id))
    }

    pub fn list_plans(&self, status: Option<PlanStatus>) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .read()
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Plans generated for a goal, oldest first.
    pub fn plans_for_goal(&self, goal_id: Uuid) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .read()
            .values()
            .filter(|p| p.goal_id == goal_id)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Plan a new goal derived from `goal_id` and the failed `plan_id`. The
    /// originals are left untouched.
    pub async fn replan(
        &self,
        goal_id: Uuid,
        plan_id: Uuid,
        feedback: ReplanFeedback,
    ) -> ForemanResult<(Goal, Plan)> {
        let goal = self.get_goal(goal_id)?;
        let plan = self.get_plan(plan_id)?;
        if plan.goal_id != goal_id {
            return Err(ForemanError::Conflict(format!(
                "plan {plan_id} does not belong to goal {goal_id}"
            )));
        }

        let mut description = goal.description.clone();
        let completed: Vec<&PlanStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .collect();
        if !completed.is_empty() {
            description.push_str("\n\nAlready completed:");
            for step in completed {
                description.push_str(&format!("\n- {}", step.description));
            }
        }
        description.push_str(&format!(
            "\n\nPrevious attempt failed: {}",
            feedback.failure_reason
        ));
        if let Some(context) = &feedback.additional_context {
            description.push_str(&format!("\n\nAdditional context: {context}"));
        }

        let derived = self.insert_goal(
            GoalInput {
                description,
                constraints: goal.constraints.clone(),
                success_criteria: goal.success_criteria.clone(),
                priority: goal.priority,
                deadline: goal.deadline,
            },
            Some(goal.id),
        );
        let new_plan = self.generate_plan(derived.id).await?;
        let derived = self.get_goal(derived.id)?;

        info!(
            goal_id = %goal_id,
            new_goal_id = %derived.id,
            plan_id = %new_plan.id,
            "Goal replanned"
        );
        self.events.emit(OrchestratorEvent::PlanReplanned {
            previous_plan_id: plan_id,
            plan_id: new_plan.id,
            goal_id: derived.id,
        });
        Ok((derived, new_plan))
    }

    // --- Execution bookkeeping ---

    /// Pending steps whose dependencies have all completed.
    pub fn ready_steps(&self, plan_id: Uuid) -> ForemanResult<Vec<PlanStep>> {
        let plan = self.get_plan(plan_id)?;
        let completed = plan.completed_step_ids();
        Ok(plan
            .steps
            .into_iter()
            .filter(|s| s.is_ready(&completed))
            .collect())
    }

    /// Mark a pending step as handed off for execution.
    pub fn start_step(&self, plan_id: Uuid, step_id: Uuid) -> ForemanResult<PlanStep> {
        let mut plans = self.plans.write();
        let plan = plans
            .get_mut(&plan_id)
            .ok_or_else(|| ForemanError::not_found("plan", plan_id))?;
        let step = plan
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| ForemanError::not_found("step", step_id))?;
        if step.status != StepStatus::Pending {
            return Err(ForemanError::invalid_transition(
                step_id,
                format!("{:?}", step.status).to_lowercase(),
                "running",
            ));
        }
        step.status = StepStatus::Running;
        let step = step.clone();
        plan.status = PlanStatus::Executing;
        plan.updated_at = self.clock.now();
        Ok(step)
    }

    /// Hand a running step back to pending without charging a retry, for
    /// when its task could not be queued.
    pub fn release_step(&self, plan_id: Uuid, step_id: Uuid) -> ForemanResult<PlanStep> {
        let mut plans = self.plans.write();
        let plan = plans
            .get_mut(&plan_id)
            .ok_or_else(|| ForemanError::not_found("plan", plan_id))?;
        let step = plan
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| ForemanError::not_found("step", step_id))?;
        if step.status != StepStatus::Running {
            return Err(ForemanError::invalid_transition(
                step_id,
                format!("{:?}", step.status).to_lowercase(),
                "pending",
            ));
        }
        step.status = StepStatus::Pending;
        plan.updated_at = self.clock.now();
        Ok(step.clone())
    }

    /// Settle one step's outcome. A failed step goes back to pending while it
    /// has retries left; otherwise the plan fails and pending steps are
    /// skipped. The goal follows the plan into `completed` or `failed`.
    pub fn record_step_result(
        &self,
        plan_id: Uuid,
        step_id: Uuid,
        outcome: Result<serde_json::Value, String>,
    ) -> ForemanResult<Plan> {
        let outcome = match outcome {
            Ok(value) => StepOutcome::Succeeded(value),
            Err(error) => StepOutcome::Failed(error),
        };
        self.settle_step(plan_id, step_id, outcome)
    }

    /// Fail a running step for good, bypassing its retries. Used when the
    /// step's task was cancelled.
    pub fn abandon_step(
        &self,
        plan_id: Uuid,
        step_id: Uuid,
        reason: impl Into<String>,
    ) -> ForemanResult<Plan> {
        self.settle_step(plan_id, step_id, StepOutcome::Abandoned(reason.into()))
    }

    fn settle_step(&self, plan_id: Uuid, step_id: Uuid, outcome: StepOutcome) -> ForemanResult<Plan> {
        let plan = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| ForemanError::not_found("plan", plan_id))?;
            let step = plan
                .steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .ok_or_else(|| ForemanError::not_found("step", step_id))?;
            if step.status != StepStatus::Running {
                return Err(ForemanError::invalid_transition(
                    step_id,
                    format!("{:?}", step.status).to_lowercase(),
                    "settled",
                ));
            }

            match outcome {
                StepOutcome::Succeeded(value) => {
                    step.status = StepStatus::Completed;
                    step.result = Some(value);
                    step.error = None;
                }
                StepOutcome::Failed(error) if step.retry_count < step.max_retries => {
                    step.retry_count += 1;
                    step.status = StepStatus::Pending;
                    step.error = Some(error);
                }
                StepOutcome::Failed(error) | StepOutcome::Abandoned(error) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(error);
                }
            }

            if plan.steps.iter().any(|s| s.status == StepStatus::Failed) {
                plan.status = PlanStatus::Failed;
                for s in plan.steps.iter_mut() {
                    if s.status == StepStatus::Pending {
                        s.status = StepStatus::Skipped;
                    }
                }
            } else if plan.steps.iter().all(|s| s.status == StepStatus::Completed) {
                plan.status = PlanStatus::Completed;
            } else {
                plan.status = PlanStatus::Executing;
            }
            plan.current_step_index = plan
                .steps
                .iter()
                .position(|s| s.status != StepStatus::Completed)
                .unwrap_or(plan.steps.len());
            plan.updated_at = self.clock.now();
            plan.clone()
        };

        let settled = match plan.status {
            PlanStatus::Completed => {
                info!(plan_id = %plan_id, goal_id = %plan.goal_id, "Plan completed");
                Some(GoalStatus::Completed)
            }
            PlanStatus::Failed => {
                warn!(plan_id = %plan_id, goal_id = %plan.goal_id, "Plan failed");
                Some(GoalStatus::Failed)
            }
            _ => None,
        };
        if let Some(status) = settled {
            // A goal cancelled meanwhile keeps its status.
            if !self.get_goal(plan.goal_id)?.status.is_terminal() {
                self.update_goal_status(plan.goal_id, status)?;
            }
        }
        Ok(plan)
    }
}
