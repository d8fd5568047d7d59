use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::deadline::DeadlineQueue;
use crate::persona::Persona;
use crate::store::AgentStore;
use crate::types::{AgentMetrics, AgentStatus, OrchestratedAgent};
use async_trait::async_trait;
use foreman_core::{EventSink, ForemanError, ForemanResult, OrchestratorEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Termination reason recorded by idle supervision.
pub const IDLE_TIMEOUT_REASON: &str = "Idle timeout";

/// Answers whether an agent still has assigned work. Gates auto-termination
/// when an agent drops back to idle; it sees the agent as it was while
/// working, `current_task` included.
#[async_trait]
pub trait WorkTracker: Send + Sync {
    async fn has_pending_work(&self, agent: &OrchestratedAgent) -> ForemanResult<bool>;
}

/// Tracker that never reports pending work, so auto-termination fires as
/// soon as it is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPendingWork;

#[async_trait]
impl WorkTracker for NoPendingWork {
    async fn has_pending_work(&self, _agent: &OrchestratedAgent) -> ForemanResult<bool> {
        Ok(false)
    }
}

/// Options for [`AgentLifecycleManager::create_agent`].
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub parent_agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Sent,
    Received,
}

type CascadeFuture<'a> = Pin<Box<dyn Future<Output = ForemanResult<bool>> + Send + 'a>>;

/// Owns agent creation, status transitions, cascade termination, metrics and
/// idle supervision.
///
/// Idle supervision has two independent triggers: a periodic sweep over the
/// store, and a per-agent deadline kept in a single [`DeadlineQueue`].
/// Either one may terminate an agent; the second one is a no-op.
pub struct AgentLifecycleManager {
    store: Arc<dyn AgentStore>,
    config: LifecycleConfig,
    deadlines: Mutex<DeadlineQueue<String>>,
    work: Arc<dyn WorkTracker>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl AgentLifecycleManager {
    pub fn new(
        store: Arc<dyn AgentStore>,
        config: LifecycleConfig,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            deadlines: Mutex::new(DeadlineQueue::new()),
            work: Arc::new(NoPendingWork),
            events,
            clock,
        }
    }

    /// Replace the [`NoPendingWork`] default.
    pub fn with_work_tracker(mut self, work: Arc<dyn WorkTracker>) -> Self {
        self.work = work;
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn arm_idle_deadline(&self, id: &str) {
        let at = self.clock.now() + self.config.idle_timeout();
        self.deadlines.lock().schedule(id.to_string(), at);
    }

    fn disarm_idle_deadline(&self, id: &str) {
        self.deadlines.lock().cancel(&id.to_string());
    }

    /// Whether an idle deadline is currently armed for the agent.
    pub fn has_idle_deadline(&self, id: &str) -> bool {
        self.deadlines.lock().is_armed(&id.to_string())
    }

    /// Create an agent in `idle` and arm its idle deadline.
    pub async fn create_agent(
        &self,
        id: impl Into<String>,
        persona: Persona,
        options: AgentOptions,
    ) -> ForemanResult<OrchestratedAgent> {
        let id = id.into();
        if self.store.get(&id).await?.is_some() {
            return Err(ForemanError::Conflict(format!("agent {id} already exists")));
        }

        let now = self.clock.now();
        let agent = OrchestratedAgent {
            id: id.clone(),
            persona_id: persona.id.clone(),
            persona,
            status: AgentStatus::Idle,
            parent_agent_id: options.parent_agent_id,
            sub_agent_ids: Vec::new(),
            channel_id: options.channel_id,
            current_task: None,
            metrics: AgentMetrics::default(),
            metadata: options.metadata,
            created_at: now,
            last_active_at: now,
            terminated_at: None,
            termination_reason: None,
        };
        self.store.save(&agent).await?;
        self.arm_idle_deadline(&id);

        info!(
            agent_id = %id,
            persona = %agent.persona_id,
            parent = ?agent.parent_agent_id,
            "Agent spawned"
        );
        self.events.emit(OrchestratorEvent::AgentSpawned {
            agent_id: id,
            persona_id: agent.persona_id.clone(),
            parent_agent_id: agent.parent_agent_id.clone(),
        });
        Ok(agent)
    }

    pub async fn get_agent(&self, id: &str) -> ForemanResult<OrchestratedAgent> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ForemanError::not_found("agent", id))
    }

    pub async fn list_agents(
        &self,
        status: Option<AgentStatus>,
    ) -> ForemanResult<Vec<OrchestratedAgent>> {
        let agents = self.store.get_all().await?;
        Ok(match status {
            Some(status) => agents.into_iter().filter(|a| a.status == status).collect(),
            None => agents,
        })
    }

    pub async fn get_sub_agents(&self, parent_id: &str) -> ForemanResult<Vec<OrchestratedAgent>> {
        self.get_agent(parent_id).await?;
        self.store.get_sub_agents(parent_id).await
    }

    /// Append `child_id` to the parent's sub-agent list.
    pub async fn attach_sub_agent(&self, parent_id: &str, child_id: &str) -> ForemanResult<()> {
        if self.store.add_sub_agent(parent_id, child_id).await? {
            Ok(())
        } else {
            Err(ForemanError::not_found("agent", parent_id))
        }
    }

    /// The single status transition entry point.
    ///
    /// Entering `idle` re-arms the idle deadline (and may auto-terminate),
    /// any other live status disarms it, `terminated` routes to
    /// [`terminate`](Self::terminate).
    pub async fn update_status(
        &self,
        id: &str,
        status: AgentStatus,
        current_task: Option<String>,
    ) -> ForemanResult<OrchestratedAgent> {
        let agent = self.get_agent(id).await?;
        if status == AgentStatus::Terminated {
            self.terminate(id, "Terminated by status update").await?;
            return self.get_agent(id).await;
        }
        if !agent.status.can_transition_to(status) {
            return Err(ForemanError::invalid_transition(id, agent.status, status));
        }

        let previous = agent.status;
        let updated = self
            .store
            .update_status(id, status, current_task, self.clock.now())
            .await?
            .ok_or_else(|| ForemanError::not_found("agent", id))?;

        debug!(agent_id = %id, from = %previous, to = %status, "Agent status changed");
        self.events.emit(OrchestratorEvent::AgentStatusChanged {
            agent_id: id.to_string(),
            from: previous.to_string(),
            to: status.to_string(),
        });

        match status {
            AgentStatus::Idle => {
                self.arm_idle_deadline(id);
                if self.config.auto_terminate_on_idle
                    && previous == AgentStatus::Working
                    && !self.work.has_pending_work(&agent).await?
                {
                    self.terminate(id, "Task completed").await?;
                    return self.get_agent(id).await;
                }
            }
            AgentStatus::Error => {
                self.disarm_idle_deadline(id);
                warn!(agent_id = %id, from = %previous, "Agent entered error state");
                self.events.emit(OrchestratorEvent::AgentError {
                    agent_id: id.to_string(),
                    error: format!("agent entered error state from {previous}"),
                });
            }
            _ => self.disarm_idle_deadline(id),
        }
        Ok(updated)
    }

    /// Terminate an agent and, depth first, all of its descendants.
    ///
    /// Returns `false` when the agent was already terminated.
    pub async fn terminate(&self, id: &str, reason: &str) -> ForemanResult<bool> {
        self.terminate_cascade(id, reason).await
    }

    fn terminate_cascade<'a>(&'a self, id: &'a str, reason: &'a str) -> CascadeFuture<'a> {
        Box::pin(async move {
            let agent = self.get_agent(id).await?;
            if agent.status.is_terminated() {
                return Ok(false);
            }

            for child in &agent.sub_agent_ids {
                match self.terminate_cascade(child, reason).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {
                        // Force-deleted child; drop the dangling reference.
                        self.store.remove_sub_agent(id, child).await?;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(parent) = &agent.parent_agent_id {
                self.store.remove_sub_agent(parent, id).await?;
            }
            self.disarm_idle_deadline(id);

            // Re-read: children removed themselves from our list.
            let mut agent = self.get_agent(id).await?;
            let previous = agent.status;
            let now = self.clock.now();
            agent.status = AgentStatus::Terminated;
            agent.current_task = None;
            agent.terminated_at = Some(now);
            agent.last_active_at = now;
            agent.termination_reason = Some(reason.to_string());
            self.store.save(&agent).await?;

            info!(agent_id = %id, reason, "Agent terminated");
            self.events.emit(OrchestratorEvent::AgentStatusChanged {
                agent_id: id.to_string(),
                from: previous.to_string(),
                to: AgentStatus::Terminated.to_string(),
            });
            self.events.emit(OrchestratorEvent::AgentTerminated {
                agent_id: id.to_string(),
                reason: reason.to_string(),
            });
            Ok(true)
        })
    }

    /// Delete the agent record outright, skipping cascade bookkeeping. Meant
    /// for orphan cleanup.
    pub async fn force_terminate(&self, id: &str) -> ForemanResult<bool> {
        self.disarm_idle_deadline(id);
        let deleted = self.store.delete(id).await?;
        if deleted {
            warn!(agent_id = %id, "Agent force terminated");
            self.events.emit(OrchestratorEvent::AgentTerminated {
                agent_id: id.to_string(),
                reason: "Force terminated".to_string(),
            });
        }
        Ok(deleted)
    }

    /// Fold one finished task into the agent's metrics.
    pub async fn record_task_completion(
        &self,
        id: &str,
        success: bool,
        duration_ms: u64,
    ) -> ForemanResult<AgentMetrics> {
        let mut agent = self.get_agent(id).await?;
        agent.metrics.record_task(success, duration_ms);
        self.store.update_metrics(id, &agent.metrics).await?;
        self.touch(id).await?;
        Ok(agent.metrics)
    }

    pub async fn record_message(&self, id: &str, direction: MessageDirection) -> ForemanResult<()> {
        let mut agent = self.get_agent(id).await?;
        match direction {
            MessageDirection::Sent => agent.metrics.messages_sent += 1,
            MessageDirection::Received => agent.metrics.messages_received += 1,
        }
        self.store.update_metrics(id, &agent.metrics).await?;
        self.touch(id).await
    }

    /// Refresh the agent's activity. An idle agent's deadline restarts.
    pub async fn touch(&self, id: &str) -> ForemanResult<()> {
        if !self.store.touch(id, self.clock.now()).await? {
            return Err(ForemanError::not_found("agent", id));
        }
        if self.get_agent(id).await?.status == AgentStatus::Idle {
            self.arm_idle_deadline(id);
        }
        Ok(())
    }

    /// Metrics summed across every known agent.
    pub async fn aggregate_metrics(&self) -> ForemanResult<AgentMetrics> {
        let mut total = AgentMetrics::default();
        for agent in self.store.get_all().await? {
            total.absorb(&agent.metrics);
        }
        Ok(total)
    }

    /// Terminate with [`IDLE_TIMEOUT_REASON`], tolerating agents that are
    /// gone or already terminated.
    async fn expire(&self, id: &str) -> ForemanResult<bool> {
        match self.terminate(id, IDLE_TIMEOUT_REASON).await {
            Ok(terminated) => Ok(terminated),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Store sweep: terminate idle agents inactive for longer than
    /// `idle_timeout_ms`.
    pub async fn sweep_idle_agents(&self) -> ForemanResult<usize> {
        let cutoff = self.clock.now() - self.config.idle_timeout();
        let mut terminated = 0;
        for agent in self.store.get_idle_agents(cutoff).await? {
            if self.expire(&agent.id).await? {
                terminated += 1;
            }
        }
        Ok(terminated)
    }

    /// Deadline drain: terminate agents whose idle deadline has passed and
    /// that are still idle.
    pub async fn fire_idle_deadlines(&self) -> ForemanResult<usize> {
        let expired = self.deadlines.lock().drain_expired(self.clock.now());
        let mut terminated = 0;
        for id in expired {
            match self.store.get(&id).await? {
                Some(agent) if agent.status == AgentStatus::Idle => {
                    if self.expire(&id).await? {
                        terminated += 1;
                    }
                }
                _ => debug!(agent_id = %id, "Stale idle deadline ignored"),
            }
        }
        Ok(terminated)
    }

    /// Spawn the supervision loop running both idle triggers until
    /// `shutdown` fires.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep =
                tokio::time::interval(Duration::from_millis(self.config.idle_check_interval_ms));
            let mut deadlines =
                tokio::time::interval(Duration::from_millis(self.config.deadline_tick_ms));
            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep.tick() => self.sweep_idle_agents().await,
                    _ = deadlines.tick() => self.fire_idle_deadlines().await,
                };
                match result {
                    Ok(0) => {}
                    Ok(n) => info!(terminated = n, "Idle agents terminated"),
                    Err(e) => warn!(error = %e, "Idle supervision tick failed"),
                }
            }
            info!("Agent supervision loop stopped");
        })
    }
}
