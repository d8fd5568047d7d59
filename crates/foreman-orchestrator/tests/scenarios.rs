#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end scenarios for foreman-orchestrator.
//!
//! Each scenario wires the engine through [`Orchestrator::builder`] with a
//! [`ManualClock`] so retry, timeout and idle paths run deterministically.

use async_trait::async_trait;
use chrono::Utc;
use foreman_core::{ForemanError, ForemanResult, OrchestratorEvent};
use foreman_orchestrator::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine_with(config: OrchestratorConfig) -> (Orchestrator, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = Orchestrator::builder(config)
        .clock(clock.clone())
        .build()
        .unwrap();
    (engine, clock)
}

fn engine() -> (Orchestrator, Arc<ManualClock>) {
    engine_with(OrchestratorConfig::default())
}

struct ScriptedLlm {
    response: ForemanResult<String>,
}

impl ScriptedLlm {
    fn replying(text: &str) -> Arc<dyn PlanningLlm> {
        Arc::new(Self {
            response: Ok(text.to_string()),
        })
    }

    fn failing() -> Arc<dyn PlanningLlm> {
        Arc::new(Self {
            response: Err(ForemanError::Planning("model unavailable".into())),
        })
    }
}

#[async_trait]
impl PlanningLlm for ScriptedLlm {
    async fn generate_plan(&self, _prompt: &str) -> ForemanResult<String> {
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(ForemanError::Planning(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// 1. Task queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_report_is_retried_then_fails_permanently() {
    let (engine, _clock) = engine();
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    engine.register_handler(
        "send-report",
        fn_handler(move |_ctx: TaskContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(ForemanError::Handler("smtp unreachable".into()))
            }
        }),
    );
    let mut rx = engine.events().subscribe();

    let task = engine
        .queue()
        .enqueue(
            EnqueueOptions::new("send-report")
                .with_payload(json!({ "to": "ops@example.com" }))
                .with_max_retries(2),
        )
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some((id, outcome)) = engine.queue().process_next().await.unwrap() {
        assert_eq!(id, task.id);
        outcomes.push(outcome);
    }
    assert_eq!(
        outcomes,
        vec![
            ExecutionOutcome::Retried { retry_count: 1 },
            ExecutionOutcome::Retried { retry_count: 2 },
            ExecutionOutcome::Failed,
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let task = engine.queue().get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.error.unwrap().contains("smtp unreachable"));

    let mut names = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        names.push(envelope.name);
    }
    assert_eq!(names.iter().filter(|n| **n == "task:retried").count(), 2);
    assert_eq!(names.last(), Some(&"task:failed"));
}

#[tokio::test]
async fn full_queue_rejects_enqueue() {
    let mut config = OrchestratorConfig::default();
    config.queue.max_queue_size = 2;
    let (engine, _clock) = engine_with(config);

    engine.queue().enqueue(EnqueueOptions::new("a")).await.unwrap();
    engine.queue().enqueue(EnqueueOptions::new("b")).await.unwrap();
    let err = engine
        .queue()
        .enqueue(EnqueueOptions::new("c"))
        .await
        .unwrap_err();
    assert!(err.is_capacity());
    assert_eq!(engine.queue().stats().await.unwrap().queued, 2);
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let (engine, _clock) = engine();
    engine.register_handler("work", fn_handler(|ctx: TaskContext| async move { Ok(ctx.payload().clone()) }));

    let low = engine
        .queue()
        .enqueue(EnqueueOptions::new("work").with_priority(Priority::Low))
        .await
        .unwrap();
    let urgent = engine
        .queue()
        .enqueue(EnqueueOptions::new("work").with_priority(Priority::Critical))
        .await
        .unwrap();

    let (first, _) = engine.queue().process_next().await.unwrap().unwrap();
    let (second, _) = engine.queue().process_next().await.unwrap().unwrap();
    assert_eq!(first, urgent.id);
    assert_eq!(second, low.id);
}

#[tokio::test]
async fn checkpoint_does_not_outlive_the_run() {
    let (engine, _clock) = engine();
    engine.register_handler(
        "import",
        fn_handler(|ctx: TaskContext| async move {
            let resumed = ctx.get_checkpoint().await?.map(|c| c.step);
            if ctx.attempt() == 1 {
                ctx.save_checkpoint(3, 10, json!({ "cursor": "row-300" })).await?;
                let saved = ctx.get_checkpoint().await?.map(|c| c.step);
                assert_eq!(saved, Some(3));
                return Err(ForemanError::Handler("connection reset".into()));
            }
            Ok(json!({ "resumed_at": resumed }))
        }),
    );

    let task = engine
        .queue()
        .enqueue(EnqueueOptions::new("import").with_max_retries(1))
        .await
        .unwrap();
    let (_, outcome) = engine.queue().process_next().await.unwrap().unwrap();
    assert_eq!(outcome, ExecutionOutcome::Retried { retry_count: 1 });
    assert!(engine.queue().get_checkpoint(task.id).await.unwrap().is_none());

    let (_, outcome) = engine.queue().process_next().await.unwrap().unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    let task = engine.queue().get_task(task.id).await.unwrap();
    assert_eq!(task.result, Some(json!({ "resumed_at": null })));
    assert!(engine.queue().get_checkpoint(task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn hung_task_times_out_under_running_engine() {
    let mut config = OrchestratorConfig::default();
    config.queue.poll_interval_ms = 5;
    config.queue.timeout_check_interval_ms = 5;
    config.queue.task_timeout_minutes = 30;
    let (engine, clock) = engine_with(config);
    let engine = Arc::new(engine);

    engine.register_handler(
        "hang",
        fn_handler(|ctx: TaskContext| async move {
            ctx.aborted().await;
            Err(ForemanError::Handler("aborted".into()))
        }),
    );
    let task = engine
        .queue()
        .enqueue(EnqueueOptions::new("hang").with_max_retries(0))
        .await
        .unwrap();
    engine.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.queue().get_task(task.id).await.unwrap().status != TaskStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    clock.advance_ms(31 * 60 * 1000);

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = engine.queue().get_task(task.id).await.unwrap();
            if task.status == TaskStatus::Failed {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        failed.error.as_deref(),
        Some("Task timed out after 30 minutes")
    );

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Agent lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_agent_expires_at_deadline() {
    let (engine, clock) = engine();
    let lifecycle = engine.lifecycle();
    lifecycle
        .create_agent("scout", Persona::new("general", "general"), AgentOptions::default())
        .await
        .unwrap();

    clock.advance_ms(299_999);
    assert_eq!(lifecycle.fire_idle_deadlines().await.unwrap(), 0);

    clock.advance_ms(1);
    assert_eq!(lifecycle.fire_idle_deadlines().await.unwrap(), 1);
    let agent = lifecycle.get_agent("scout").await.unwrap();
    assert_eq!(agent.status, AgentStatus::Terminated);
    assert_eq!(agent.termination_reason.as_deref(), Some(IDLE_TIMEOUT_REASON));

    // The store sweep finds nothing left to do.
    clock.advance_ms(600_000);
    assert_eq!(lifecycle.sweep_idle_agents().await.unwrap(), 0);
}

#[tokio::test]
async fn working_agent_is_not_expired() {
    let (engine, clock) = engine();
    let lifecycle = engine.lifecycle();
    lifecycle
        .create_agent("builder", Persona::new("general", "general"), AgentOptions::default())
        .await
        .unwrap();
    lifecycle
        .update_status("builder", AgentStatus::Working, Some("t-1".into()))
        .await
        .unwrap();

    clock.advance_ms(900_000);
    assert_eq!(lifecycle.fire_idle_deadlines().await.unwrap(), 0);
    assert_eq!(lifecycle.sweep_idle_agents().await.unwrap(), 0);
    assert_eq!(
        lifecycle.get_agent("builder").await.unwrap().status,
        AgentStatus::Working
    );
}

#[tokio::test]
async fn terminating_a_parent_cascades_to_every_descendant() {
    let (engine, _clock) = engine();
    let lifecycle = engine.lifecycle();
    let factory = engine.factory();
    lifecycle
        .create_agent("root", Persona::new("general", "general"), AgentOptions::default())
        .await
        .unwrap();

    let child = factory
        .create_sub_agent(SubAgentRequest::new("root").with_task("collect sources"))
        .await
        .unwrap();
    let grandchild = factory
        .create_sub_agent(SubAgentRequest::new(child.id.clone()).with_task("fetch page"))
        .await
        .unwrap();

    assert!(lifecycle.terminate("root", "Shutdown").await.unwrap());

    for id in ["root", child.id.as_str(), grandchild.id.as_str()] {
        let agent = lifecycle.get_agent(id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated, "{id} still alive");
        assert!(agent.terminated_at.is_some());
    }
    assert!(lifecycle.get_agent("root").await.unwrap().sub_agent_ids.is_empty());

    // Terminating twice is a no-op.
    assert!(!lifecycle.terminate("root", "Shutdown").await.unwrap());
}

// ---------------------------------------------------------------------------
// 3. Sub-agent factory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sub_agent_capacity_is_enforced() {
    let mut config = OrchestratorConfig::default();
    config.factory.max_sub_agents_per_parent = 2;
    let (engine, _clock) = engine_with(config);
    engine
        .lifecycle()
        .create_agent("lead", Persona::new("general", "general"), AgentOptions::default())
        .await
        .unwrap();
    let factory = engine.factory();

    // A batch bigger than the free slots creates nothing.
    let batch = vec![
        SubAgentRequest::new("lead").with_task("one"),
        SubAgentRequest::new("lead").with_task("two"),
        SubAgentRequest::new("lead").with_task("three"),
    ];
    assert!(factory.create_sub_agents("lead", batch).await.unwrap_err().is_capacity());
    assert_eq!(factory.remaining_capacity("lead").await.unwrap(), 2);

    let created = factory
        .create_sub_agents(
            "lead",
            vec![
                SubAgentRequest::new("ignored").with_task("one"),
                SubAgentRequest::new("ignored").with_task("two"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    assert!(created
        .iter()
        .all(|c| c.parent_agent_id.as_deref() == Some("lead")));

    let err = factory
        .create_sub_agent(SubAgentRequest::new("lead").with_task("three"))
        .await
        .unwrap_err();
    assert!(err.is_capacity());
}

#[tokio::test]
async fn completed_sub_agent_is_recorded_and_retired() {
    let (engine, _clock) = engine();
    engine
        .lifecycle()
        .create_agent("lead", Persona::new("general", "general"), AgentOptions::default())
        .await
        .unwrap();
    let child = engine
        .factory()
        .create_sub_agent(SubAgentRequest::new("lead").with_task("draft summary"))
        .await
        .unwrap();
    let mut rx = engine.events().subscribe();

    engine
        .factory()
        .complete_sub_agent(&child.id, SubAgentResult::success(1200, Some(json!("ok"))))
        .await
        .unwrap();

    let child = engine.lifecycle().get_agent(&child.id).await.unwrap();
    assert_eq!(child.status, AgentStatus::Terminated);
    assert_eq!(child.termination_reason.as_deref(), Some("Task completed"));
    assert_eq!(child.metrics.successful_tasks, 1);

    let mut saw_completed = false;
    while let Ok(envelope) = rx.try_recv() {
        if let OrchestratorEvent::SubAgentCompleted {
            parent_agent_id,
            duration_ms,
            ..
        } = envelope.event
        {
            assert_eq!(parent_agent_id.as_deref(), Some("lead"));
            assert_eq!(duration_ms, 1200);
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

// ---------------------------------------------------------------------------
// 4. Goal planner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn plain_goal_yields_a_single_step_plan() {
    let (engine, _clock) = engine();
    let (goal, plan) = engine
        .submit_goal(GoalInput::new("Summarize document X"))
        .await
        .unwrap();

    assert_eq!(plan.goal_id, goal.id);
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].description, "Summarize document X");
    assert!(plan.steps[0].depends_on.is_empty());
    assert_eq!(plan.estimated_duration_minutes, 5);
    assert!((1..=10).contains(&plan.complexity));
}

#[tokio::test]
async fn model_failure_falls_back_to_the_simple_plan() {
    let disabled = Orchestrator::builder(OrchestratorConfig::default())
        .build()
        .unwrap();
    let broken = Orchestrator::builder(OrchestratorConfig::default())
        .planning_llm(ScriptedLlm::failing())
        .build()
        .unwrap();
    let rambling = Orchestrator::builder(OrchestratorConfig::default())
        .planning_llm(ScriptedLlm::replying("Sure! Here is how I would approach it."))
        .build()
        .unwrap();

    let mut shapes = Vec::new();
    for engine in [&disabled, &broken, &rambling] {
        engine.register_tool(ToolDescriptor::new("web_search", "Search the web for pages"));
        let goal = engine
            .planner()
            .create_goal(GoalInput::new("Search the web for rust release notes"));
        let plan = engine.planner().generate_plan(goal.id).await.unwrap();
        shapes.push(
            plan.steps
                .iter()
                .map(|s| (s.description.clone(), s.tool_name.clone()))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(shapes[0], shapes[1]);
    assert_eq!(shapes[0], shapes[2]);
    assert_eq!(shapes[0][0].1.as_deref(), Some("web_search"));
}

#[tokio::test]
async fn model_plan_is_parsed_and_run_in_dependency_order() {
    let response = r#"Here you go:
```json
[
  {"description": "Search for sources", "tool": "web_search", "arguments": {"q": "tokio"}},
  {"description": "Write the summary", "depends_on": [0]},
  {"description": "   "},
  {"description": "Send it", "tool": "teleport", "depends_on": [1, 7]}
]
```"#;
    let (engine, _clock) = {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Orchestrator::builder(OrchestratorConfig::default())
            .planning_llm(ScriptedLlm::replying(response))
            .clock(clock.clone())
            .build()
            .unwrap();
        (engine, clock)
    };
    engine.register_tool(ToolDescriptor::new("web_search", "Search the web"));
    engine.register_handler(
        "web_search",
        fn_handler(|_ctx: TaskContext| async move { Ok(json!(["https://tokio.rs"])) }),
    );
    engine.register_handler(
        PLAN_STEP_TASK,
        fn_handler(|_ctx: TaskContext| async move { Ok(json!("done")) }),
    );

    let (goal, plan) = engine
        .submit_goal(GoalInput::new("Summarize tokio"))
        .await
        .unwrap();
    assert_eq!(plan.steps.len(), 3);
    assert_eq!(plan.steps[0].tool_name.as_deref(), Some("web_search"));
    assert_eq!(plan.steps[1].depends_on, vec![plan.steps[0].id]);
    assert_eq!(plan.steps[2].tool_name, None);
    assert_eq!(plan.steps[2].depends_on, vec![plan.steps[1].id]);

    // Only the first step is ready; drive each settled task back into the plan.
    for expected in 0..3 {
        let queued = engine
            .queue()
            .list_tasks(Some(TaskStatus::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1, "step {expected} should be the only queued task");
        let payload = StepTaskPayload::from_payload(&queued[0].payload).unwrap();
        assert_eq!(payload.step_id, plan.steps[expected].id);

        let (task_id, outcome) = engine.queue().process_next().await.unwrap().unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        let task = engine.queue().get_task(task_id).await.unwrap();
        engine
            .handle_event(&OrchestratorEvent::TaskCompleted {
                task_id,
                name: task.name,
                duration_ms: 0,
            })
            .await
            .unwrap();
    }

    let plan = engine.planner().get_plan(plan.id).unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(
        engine.planner().get_goal(goal.id).unwrap().status,
        GoalStatus::Completed
    );
}

#[tokio::test]
async fn replanning_leaves_the_original_untouched() {
    let (engine, _clock) = engine();
    let planner = engine.planner();
    let goal = planner.create_goal(GoalInput {
        description: "Publish the weekly report".into(),
        constraints: vec!["no weekend sends".into()],
        priority: Priority::High,
        ..Default::default()
    });
    let plan = planner.generate_plan(goal.id).await.unwrap();
    let before_goal = planner.get_goal(goal.id).unwrap();
    let before_plan = planner.get_plan(plan.id).unwrap();

    let (derived, new_plan) = planner
        .replan(
            goal.id,
            plan.id,
            ReplanFeedback {
                failure_reason: "mail server down".into(),
                additional_context: Some("use the backup relay".into()),
            },
        )
        .await
        .unwrap();

    assert_ne!(derived.id, goal.id);
    assert_eq!(derived.parent_goal_id, Some(goal.id));
    assert_eq!(derived.priority, Priority::High);
    assert_eq!(derived.constraints, vec!["no weekend sends".to_string()]);
    assert!(derived
        .description
        .contains("Previous attempt failed: mail server down"));
    assert!(derived
        .description
        .contains("Additional context: use the backup relay"));
    assert_eq!(new_plan.goal_id, derived.id);

    let after_goal = planner.get_goal(goal.id).unwrap();
    let after_plan = planner.get_plan(plan.id).unwrap();
    assert_eq!(after_goal.description, before_goal.description);
    assert_eq!(after_goal.status, before_goal.status);
    assert_eq!(after_plan.status, before_plan.status);
    assert_eq!(after_plan.steps.len(), before_plan.steps.len());
    assert_eq!(planner.plans_for_goal(goal.id).len(), 1);
}

// ---------------------------------------------------------------------------
// 5. Running engine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_engine_completes_a_submitted_goal() {
    let mut config = OrchestratorConfig::default();
    config.queue.poll_interval_ms = 5;
    let engine = Arc::new(Orchestrator::builder(config).build().unwrap());
    engine.register_handler(
        PLAN_STEP_TASK,
        fn_handler(|ctx: TaskContext| async move {
            ctx.report_progress(50, Some("halfway")).await?;
            Ok(json!({ "summary": ctx.payload()["description"] }))
        }),
    );
    engine.start();
    // A second start is ignored.
    engine.start();

    let (goal, _plan) = engine
        .submit_goal(GoalInput::new("Summarize document X"))
        .await
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let goal = engine.planner().get_goal(goal.id).unwrap();
            if goal.status.is_terminal() {
                return goal.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status, GoalStatus::Completed);

    engine.shutdown().await;
    assert_eq!(engine.queue().stats().await.unwrap().completed, 1);
}

#[tokio::test]
async fn engine_restarts_after_shutdown() {
    let mut config = OrchestratorConfig::default();
    config.queue.poll_interval_ms = 5;
    let engine = Arc::new(Orchestrator::builder(config).build().unwrap());
    engine.register_handler(
        PLAN_STEP_TASK,
        fn_handler(|ctx: TaskContext| async move { Ok(ctx.payload()["description"].clone()) }),
    );

    engine.start();
    engine.shutdown().await;
    engine.start();

    let (goal, _plan) = engine
        .submit_goal(GoalInput::new("Summarize document X"))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let goal = engine.planner().get_goal(goal.id).unwrap();
            if goal.status.is_terminal() {
                return goal.status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status, GoalStatus::Completed);

    engine.shutdown().await;
}
