#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_core::*;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Custom sinks behind the trait object
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    names: Mutex<Vec<&'static str>>,
}

impl EventSink for Recorder {
    fn emit(&self, event: OrchestratorEvent) {
        self.names.lock().unwrap().push(event.name());
    }
}

#[test]
fn custom_sink_receives_signals_through_trait_object() {
    let recorder = Arc::new(Recorder::default());
    let sink: Arc<dyn EventSink> = recorder.clone();

    let task_id = Uuid::new_v4();
    sink.emit(OrchestratorEvent::TaskPaused { task_id });
    sink.emit(OrchestratorEvent::TaskResumed { task_id });
    sink.emit(OrchestratorEvent::GoalUpdated {
        goal_id: Uuid::new_v4(),
        status: "active".into(),
    });

    assert_eq!(
        *recorder.names.lock().unwrap(),
        vec!["task:paused", "task:resumed", "goal:updated"]
    );
}

#[test]
fn null_sink_accepts_everything() {
    let sink: Arc<dyn EventSink> = Arc::new(NullSink);
    sink.emit(OrchestratorEvent::AgentError {
        agent_id: "a1".into(),
        error: "boom".into(),
    });
}

// ---------------------------------------------------------------------------
// 2. Broadcast bus fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_subscriber_sees_every_signal() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    bus.emit(OrchestratorEvent::PlanCreated {
        plan_id: Uuid::new_v4(),
        goal_id: Uuid::new_v4(),
        steps: 3,
    });

    for rx in [&mut first, &mut second] {
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.name, "plan:created");
        assert_eq!(envelope.event.payload()["steps"], 3);
    }
}

#[test]
fn emitting_without_subscribers_is_harmless() {
    let bus = EventBus::default();
    assert_eq!(bus.subscriber_count(), 0);
    bus.emit(OrchestratorEvent::TaskCancelled {
        task_id: Uuid::new_v4(),
    });

    let mut late = bus.subscribe();
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn slow_subscriber_lags_instead_of_blocking() {
    let bus = EventBus::new(2);
    let mut rx = bus.subscribe();
    for _ in 0..5 {
        bus.emit(OrchestratorEvent::TaskCancelled {
            task_id: Uuid::new_v4(),
        });
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(3))));
    assert!(rx.try_recv().is_ok());
}

// ---------------------------------------------------------------------------
// 3. Error conversions
// ---------------------------------------------------------------------------

fn read_missing() -> ForemanResult<String> {
    Ok(std::fs::read_to_string("/definitely/not/here.toml")?)
}

#[test]
fn io_errors_convert_with_question_mark() {
    let err = read_missing().unwrap_err();
    assert!(matches!(err, ForemanError::Io(_)));
    assert!(err.to_string().starts_with("IO error"));
}

#[test]
fn capacity_and_not_found_are_distinguishable() {
    let full = ForemanError::Capacity("task queue is full (100/100 queued)".into());
    assert!(full.is_capacity());
    assert!(!full.is_not_found());
    assert_eq!(
        full.to_string(),
        "Capacity error: task queue is full (100/100 queued)"
    );

    let missing = ForemanError::not_found("plan", Uuid::nil());
    assert!(missing.is_not_found());
    assert_eq!(
        missing.to_string(),
        "plan not found: 00000000-0000-0000-0000-000000000000"
    );
}
