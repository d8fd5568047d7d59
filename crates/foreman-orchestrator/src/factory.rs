use crate::config::FactoryConfig;
use crate::lifecycle::{AgentLifecycleManager, AgentOptions};
use crate::persona::{merge_persona, Persona, PersonaOverride, PersonaRegistry};
use crate::types::OrchestratedAgent;
use foreman_core::{EventSink, ForemanError, ForemanResult, OrchestratorEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A request to spawn one child agent under an existing parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubAgentRequest {
    pub parent_id: String,
    /// Explicit persona id; takes precedence over `persona_type`.
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub persona_type: Option<String>,
    #[serde(default)]
    pub overrides: Option<PersonaOverride>,
    /// Description of the delegated work, stored as `task` metadata.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubAgentRequest {
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            ..Default::default()
        }
    }

    pub fn with_persona_id(mut self, id: impl Into<String>) -> Self {
        self.persona_id = Some(id.into());
        self
    }

    pub fn with_persona_type(mut self, persona_type: impl Into<String>) -> Self {
        self.persona_type = Some(persona_type.into());
        self
    }

    pub fn with_overrides(mut self, overrides: PersonaOverride) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// Outcome reported back by whoever ran the sub-agent's work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubAgentResult {
    pub fn success(duration_ms: u64, output: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            duration_ms,
            output,
            error: None,
        }
    }

    pub fn failure(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Creates bounded, persona-derived child agents and feeds their results
/// back into lifecycle bookkeeping.
pub struct SubAgentFactory {
    lifecycle: Arc<AgentLifecycleManager>,
    personas: Arc<dyn PersonaRegistry>,
    config: FactoryConfig,
    admission: tokio::sync::Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl SubAgentFactory {
    pub fn new(
        lifecycle: Arc<AgentLifecycleManager>,
        personas: Arc<dyn PersonaRegistry>,
        config: FactoryConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            lifecycle,
            personas,
            config,
            admission: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Free sub-agent slots on a parent.
    pub async fn remaining_capacity(&self, parent_id: &str) -> ForemanResult<usize> {
        let parent = self.live_parent(parent_id).await?;
        Ok(self
            .config
            .max_sub_agents_per_parent
            .saturating_sub(parent.sub_agent_ids.len()))
    }

    async fn live_parent(&self, parent_id: &str) -> ForemanResult<OrchestratedAgent> {
        let parent = self.lifecycle.get_agent(parent_id).await?;
        if parent.status.is_terminated() {
            return Err(ForemanError::Conflict(format!(
                "parent agent {parent_id} is terminated"
            )));
        }
        Ok(parent)
    }

    /// Resolve by explicit id, then by requested type, then by the configured
    /// default type. A lookup that misses falls through to the next one.
    fn resolve_persona(&self, request: &SubAgentRequest) -> ForemanResult<Persona> {
        if let Some(id) = &request.persona_id {
            match self.personas.get(id) {
                Some(persona) => return Ok(persona),
                None => warn!(persona_id = %id, "Persona not registered, trying type lookup"),
            }
        }
        if let Some(persona_type) = &request.persona_type {
            match self.personas.get_by_type(persona_type) {
                Some(persona) => return Ok(persona),
                None => warn!(persona_type = %persona_type, "No persona of type, using default"),
            }
        }
        self.personas
            .get_by_type(&self.config.default_persona_type)
            .ok_or_else(|| ForemanError::not_found("persona", &self.config.default_persona_type))
    }

    fn derive_persona(&self, request: &SubAgentRequest) -> ForemanResult<Persona> {
        let base = self.resolve_persona(request)?;
        Ok(match &request.overrides {
            Some(overrides) => merge_persona(&base, overrides),
            None => base,
        })
    }

    async fn spawn_child(
        &self,
        parent_id: &str,
        persona: Persona,
        request: SubAgentRequest,
    ) -> ForemanResult<OrchestratedAgent> {
        let child_id = format!("sub-{}", Uuid::new_v4());
        let mut metadata = request.metadata;
        if let Some(task) = request.task {
            metadata.insert("task".to_string(), serde_json::Value::String(task));
        }

        let child = self
            .lifecycle
            .create_agent(
                child_id.clone(),
                persona,
                AgentOptions {
                    parent_agent_id: Some(parent_id.to_string()),
                    channel_id: request.channel_id,
                    metadata,
                },
            )
            .await?;
        self.lifecycle.attach_sub_agent(parent_id, &child_id).await?;

        info!(
            parent_id = %parent_id,
            sub_agent_id = %child_id,
            persona = %child.persona_id,
            "Sub-agent created"
        );
        self.events.emit(OrchestratorEvent::SubAgentCreated {
            parent_agent_id: parent_id.to_string(),
            sub_agent_id: child_id,
            persona_id: child.persona_id.clone(),
        });
        Ok(child)
    }

    /// Spawn one child under `request.parent_id`, rejecting with a capacity
    /// error when the parent already has `max_sub_agents_per_parent`
    /// children.
    pub async fn create_sub_agent(&self, request: SubAgentRequest) -> ForemanResult<OrchestratedAgent> {
        let _admission = self.admission.lock().await;

        let parent = self.live_parent(&request.parent_id).await?;
        if parent.sub_agent_ids.len() >= self.config.max_sub_agents_per_parent {
            warn!(parent_id = %parent.id, "Sub-agent limit reached");
            return Err(ForemanError::Capacity(format!(
                "parent {} already has the maximum of {} sub-agents",
                parent.id, self.config.max_sub_agents_per_parent
            )));
        }

        let persona = self.derive_persona(&request)?;
        self.spawn_child(&parent.id, persona, request).await
    }

    /// Spawn a batch of children all-or-nothing: the whole batch is rejected
    /// up front if it does not fit in the remaining capacity or any persona
    /// fails to resolve. Each request's `parent_id` is replaced by
    /// `parent_id`.
    pub async fn create_sub_agents(
        &self,
        parent_id: &str,
        tasks: Vec<SubAgentRequest>,
    ) -> ForemanResult<Vec<OrchestratedAgent>> {
        let _admission = self.admission.lock().await;

        let parent = self.live_parent(parent_id).await?;
        let remaining = self
            .config
            .max_sub_agents_per_parent
            .saturating_sub(parent.sub_agent_ids.len());
        if tasks.len() > remaining {
            warn!(parent_id = %parent_id, requested = tasks.len(), remaining, "Sub-agent batch rejected");
            return Err(ForemanError::Capacity(format!(
                "parent {parent_id} has {remaining} free sub-agent slots, batch needs {}",
                tasks.len()
            )));
        }

        let prepared = tasks
            .into_iter()
            .map(|mut request| {
                request.parent_id = parent_id.to_string();
                self.derive_persona(&request).map(|persona| (persona, request))
            })
            .collect::<ForemanResult<Vec<_>>>()?;

        let mut children = Vec::with_capacity(prepared.len());
        for (persona, request) in prepared {
            children.push(self.spawn_child(parent_id, persona, request).await?);
        }
        Ok(children)
    }

    /// Record a sub-agent's outcome, signal it, and terminate the sub-agent
    /// when `auto_terminate_on_complete` is set.
    pub async fn complete_sub_agent(
        &self,
        sub_agent_id: &str,
        result: SubAgentResult,
    ) -> ForemanResult<OrchestratedAgent> {
        let agent = self.lifecycle.get_agent(sub_agent_id).await?;
        self.lifecycle
            .record_task_completion(sub_agent_id, result.success, result.duration_ms)
            .await?;

        if result.success {
            info!(sub_agent_id = %sub_agent_id, duration_ms = result.duration_ms, "Sub-agent completed");
            self.events.emit(OrchestratorEvent::SubAgentCompleted {
                parent_agent_id: agent.parent_agent_id.clone(),
                sub_agent_id: sub_agent_id.to_string(),
                duration_ms: result.duration_ms,
            });
        } else {
            let error = result.error.unwrap_or_else(|| "unknown error".to_string());
            warn!(sub_agent_id = %sub_agent_id, error = %error, "Sub-agent failed");
            self.events.emit(OrchestratorEvent::SubAgentFailed {
                parent_agent_id: agent.parent_agent_id.clone(),
                sub_agent_id: sub_agent_id.to_string(),
                error,
            });
        }

        if self.config.auto_terminate_on_complete {
            let reason = if result.success {
                "Task completed"
            } else {
                "Task failed"
            };
            self.lifecycle.terminate(sub_agent_id, reason).await?;
        }
        self.lifecycle.get_agent(sub_agent_id).await
    }

    /// Terminate every child of `parent_id`; the parent itself stays alive.
    /// Returns how many children were terminated by this call.
    pub async fn terminate_all_sub_agents(&self, parent_id: &str, reason: &str) -> ForemanResult<usize> {
        let mut terminated = 0;
        for child in self.lifecycle.get_sub_agents(parent_id).await? {
            if self.lifecycle.terminate(&child.id, reason).await? {
                terminated += 1;
            }
        }
        info!(parent_id = %parent_id, terminated, reason, "Sub-agents terminated");
        Ok(terminated)
    }
}
