//! Replay determinism and optimistic concurrency
//!
//! These tests drive the executor and store directly, without a worker.

mod common;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use common::*;
use waypoint_durable::engine::{ReplayEngine, ReplayError};
use waypoint_durable::persistence::NewInstance;
use waypoint_durable::prelude::*;

/// Version 1 of a workflow: schedules `reserve`
struct BookingV1;

impl Workflow for BookingV1 {
    const TYPE: &'static str = "booking";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "reserve",
            "reserve",
            Value::Null,
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        result: Value,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result)])
    }
}

/// Version 2 under the same type name: schedules `charge` first
struct BookingV2;

impl Workflow for BookingV2 {
    const TYPE: &'static str = "booking";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "charge",
            "charge",
            Value::Null,
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        result: Value,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(result)])
    }
}

fn executor_for<W: Workflow>(store: &Arc<Store>) -> WorkflowExecutor<Store> {
    let mut registry = WorkflowRegistry::new();
    registry.register::<W>();
    WorkflowExecutor::new(store.clone(), Arc::new(registry))
}

async fn start(store: &Arc<Store>, workflow_id: &str, workflow_type: &str) -> InstanceRef {
    let new = NewInstance::new(workflow_id, workflow_type, "default", Value::Null);
    let instance = new.id.clone();
    store.create_instance(new).await.unwrap();
    instance
}

// =========================================================================
// Replay
// =========================================================================

#[test_log::test(tokio::test)]
async fn test_replay_of_completed_history_is_idempotent() {
    let (store, worker) = new_worker();
    worker.register_workflow::<Doubler>();
    register_flaky_double(&worker);
    worker.start().await.unwrap();

    let client = worker.client();
    let run_id = client
        .start::<Doubler>("replayed", 21, WorkflowOptions::default())
        .await
        .unwrap();
    client
        .get_workflow_result("replayed", RESULT_WAIT)
        .await
        .unwrap();
    worker.shutdown().await.unwrap();

    let instance = InstanceRef::new("replayed", run_id);
    let history = store.read_events(&instance, 0).await.unwrap();
    let mut registry = WorkflowRegistry::new();
    registry.register::<Doubler>();
    let engine = ReplayEngine::new();

    let first = assert_ok!(engine.replay(&registry, &instance, &history));
    let second = assert_ok!(engine.replay(&registry, &instance, &history));
    assert!(first.closed && second.closed);
    assert!(first.new_commands.is_empty() && second.new_commands.is_empty());
    assert_eq!(first.last_event_id, second.last_event_id);

    // Replaying only WorkflowStarted reproduces the first decision
    let opening = engine.replay(&registry, &instance, &history[..1]).unwrap();
    assert_eq!(opening.new_commands.len(), 1);
    assert!(matches!(
        &opening.new_commands[0],
        WorkflowAction::ScheduleActivity { activity_id, .. } if activity_id == "double"
    ));
}

#[test_log::test(tokio::test)]
async fn test_changed_workflow_code_is_non_deterministic() {
    let store = Arc::new(Store::new());
    let instance = start(&store, "booking-1", BookingV1::TYPE).await;

    executor_for::<BookingV1>(&store)
        .process_workflow_task(&instance)
        .await
        .unwrap();
    let recorded = store.history_version(&instance).await.unwrap();

    let err = assert_err!(
        executor_for::<BookingV2>(&store)
            .process_workflow_task(&instance)
            .await
    );
    assert!(err.is_non_determinism());

    // History is untouched and the run stays open
    assert_eq!(store.history_version(&instance).await.unwrap(), recorded);
    let run = store.get_instance(&instance).await.unwrap();
    assert_eq!(run.status, WorkflowStatus::Running);

    let history = store.read_events(&instance, 0).await.unwrap();
    let mut registry = WorkflowRegistry::new();
    registry.register::<BookingV2>();
    let replayed = ReplayEngine::new().replay(&registry, &instance, &history);
    assert!(matches!(replayed, Err(ReplayError::NonDeterminism { .. })));
}

#[test_log::test(tokio::test)]
async fn test_reprocessing_decided_task_writes_nothing() {
    let store = Arc::new(Store::new());
    let instance = start(&store, "booking-2", BookingV1::TYPE).await;
    let executor = executor_for::<BookingV1>(&store);

    let first = executor.process_workflow_task(&instance).await.unwrap();
    assert_eq!(first.events_written, 1);

    let again = executor.process_workflow_task(&instance).await.unwrap();
    assert_eq!(again.events_written, 0);
    assert_eq!(store.history_version(&instance).await.unwrap(), 2);
}

// =========================================================================
// Optimistic concurrency
// =========================================================================

#[test_log::test(tokio::test)]
async fn test_racing_appends_have_one_winner() {
    let store = Arc::new(Store::new());
    let instance = start(&store, "race", "race").await;
    let version = store.history_version(&instance).await.unwrap();

    let signal = |name: &str| {
        vec![WorkflowEvent::SignalReceived {
            signal: WorkflowSignal::new(name, json!(name)),
        }]
    };
    let (left, right) = tokio::join!(
        store.append_events(&instance, version, signal("left")),
        store.append_events(&instance, version, signal("right")),
    );

    let winners = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if left.is_err() { left } else { right };
    assert!(loser.unwrap_err().is_conflict());
    assert_eq!(store.history_version(&instance).await.unwrap(), version + 1);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_signals_all_recorded() {
    let store = Arc::new(Store::new());
    let instance = start(&store, "signals", BookingV1::TYPE).await;
    let executor = Arc::new(executor_for::<BookingV1>(&store));

    let sends = (0..8).map(|i| {
        let executor = executor.clone();
        let instance = instance.clone();
        tokio::spawn(async move {
            executor
                .signal(&instance, WorkflowSignal::new("ping", json!(i)))
                .await
        })
    });
    for send in futures::future::join_all(sends).await {
        send.unwrap().unwrap();
    }

    let history = store.read_events(&instance, 0).await.unwrap();
    let signals = history
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::SignalReceived { .. }))
        .count();
    assert_eq!(signals, 8);
}

#[test_log::test(tokio::test)]
async fn test_append_to_closed_run_rejected() {
    let store = Arc::new(Store::new());
    let instance = start(&store, "closed", BookingV1::TYPE).await;
    executor_for::<BookingV1>(&store)
        .terminate(&instance, "done")
        .await
        .unwrap();

    let version = store.history_version(&instance).await.unwrap();
    let err = store
        .append_events(
            &instance,
            version,
            vec![WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("late", Value::Null),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InstanceClosed(_)));
}
