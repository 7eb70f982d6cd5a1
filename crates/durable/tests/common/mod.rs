//! Shared workflows and worker setup for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use waypoint_durable::prelude::*;
use waypoint_durable::timer::TimerServiceConfig;
use waypoint_durable::worker::PollerConfig;

pub type Store = InMemoryWorkflowEventStore;

pub const RESULT_WAIT: Duration = Duration::from_secs(10);

/// Worker settings tuned for fast tests
pub fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_long_poll_timeout(Duration::from_millis(50))
        .with_poller(PollerConfig::new().with_max_interval(Duration::from_millis(10)))
        .with_workflow_task_retry_delay(Duration::from_millis(20))
        .with_timer_config(TimerServiceConfig::default().with_tick_interval(Duration::from_millis(5)))
        .with_shutdown_timeout(Duration::from_secs(5))
}

pub fn new_worker() -> (Arc<Store>, Worker<Store>) {
    let store = Arc::new(Store::new());
    let worker = Worker::new(store.clone(), fast_config());
    (store, worker)
}

pub fn fast_retries(maximum_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_millis(10), maximum_attempts)
}

// =========================================================================
// Workflows
// =========================================================================

/// Runs one `double` activity and completes with its result
pub struct Doubler {
    input: i64,
}

impl Workflow for Doubler {
    const TYPE: &'static str = "doubler";
    type Input = i64;
    type Output = i64;

    fn new(input: i64) -> Self {
        Self { input }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity_with(
            "double",
            "double",
            json!(self.input),
            ActivityOptions::default().with_retry_policy(fast_retries(3)),
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

/// Waits for an `approve` signal for one second
pub struct Approval {
    decided: Option<&'static str>,
}

impl Workflow for Approval {
    const TYPE: &'static str = "approval";
    type Input = Value;
    type Output = String;

    fn new(_input: Value) -> Self {
        Self { decided: None }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![
            WorkflowAction::await_signal("approve"),
            WorkflowAction::timer("approval-timeout", Duration::from_secs(1)),
        ])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }

    fn on_signal(&mut self, _ctx: &WorkflowContext, _signal: &WorkflowSignal) -> WorkflowStep {
        if self.decided.is_some() {
            return Ok(vec![]);
        }
        self.decided = Some("approved");
        Ok(vec![
            WorkflowAction::cancel_timer("approval-timeout"),
            WorkflowAction::complete(json!("approved")),
        ])
    }

    fn on_timer_fired(&mut self, _ctx: &WorkflowContext, _timer_id: &str) -> WorkflowStep {
        if self.decided.is_some() {
            return Ok(vec![]);
        }
        self.decided = Some("timed_out");
        Ok(vec![WorkflowAction::complete(json!("timed_out"))])
    }
}

/// Runs a slow activity, then waits for `approve`
pub struct PrepareThenApprove;

impl Workflow for PrepareThenApprove {
    const TYPE: &'static str = "prepare_then_approve";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::schedule_activity(
            "prepare",
            "sleep",
            json!({ "ms": 100, "branch": "prepare" }),
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::await_signal("approve")])
    }

    fn on_signal(&mut self, _ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(signal.payload.clone())])
    }
}

/// Fans out `sleep` activities and joins them in submission order
pub struct FanOut {
    delays: Vec<u64>,
    join: FanIn,
}

impl Workflow for FanOut {
    const TYPE: &'static str = "fan_out";
    type Input = Vec<u64>;
    type Output = Vec<Value>;

    fn new(delays: Vec<u64>) -> Self {
        Self {
            delays,
            join: FanIn::new(),
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        let delays = self.delays.clone();
        Ok(delays
            .into_iter()
            .enumerate()
            .map(|(i, ms)| {
                let id = self.join.add(format!("branch-{}", i));
                WorkflowAction::schedule_activity(id, "sleep", json!({ "ms": ms, "branch": i }))
            })
            .collect())
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowStep {
        self.join.record(activity_id, result);
        match self.join.results() {
            Some(results) => Ok(vec![WorkflowAction::complete(json!(results))]),
            None => Ok(vec![]),
        }
    }
}

/// Starts a `Doubler` child and completes with its result
pub struct Parent {
    input: i64,
}

impl Workflow for Parent {
    const TYPE: &'static str = "parent";
    type Input = i64;
    type Output = Value;

    fn new(input: i64) -> Self {
        Self { input }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::start_child(
            format!("{}-child", ctx.workflow_id()),
            Doubler::TYPE,
            json!(self.input),
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }

    fn on_child_completed(
        &mut self,
        _ctx: &WorkflowContext,
        workflow_id: &str,
        result: Value,
    ) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(json!({
            "child": workflow_id,
            "result": result,
        }))])
    }
}

/// Waits for a signal that never comes
pub struct Idle;

impl Workflow for Idle {
    const TYPE: &'static str = "idle";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::await_signal("never")])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }
}

/// Starts an `Idle` child and waits on it
pub struct IdleParent;

impl Workflow for IdleParent {
    const TYPE: &'static str = "idle_parent";
    type Input = Value;
    type Output = Value;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::start_child(
            format!("{}-child", ctx.workflow_id()),
            Idle::TYPE,
            Value::Null,
        )])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }
}

/// Sums `add` signals until `finish`; answers the `total` query
pub struct Accumulator {
    total: i64,
}

impl Workflow for Accumulator {
    const TYPE: &'static str = "accumulator";
    type Input = i64;
    type Output = i64;

    fn new(start: i64) -> Self {
        Self { total: start }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }

    fn handles_signal(&self, signal_name: &str) -> bool {
        matches!(signal_name, "add" | "finish")
    }

    fn on_signal(&mut self, _ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep {
        match signal.name.as_str() {
            "add" => {
                self.total += signal.payload.as_i64().unwrap_or(0);
                Ok(vec![])
            }
            _ => Ok(vec![WorkflowAction::complete(json!(self.total))]),
        }
    }

    fn query(&self, query_name: &str, _args: &Value) -> Result<Value, WorkflowError> {
        match query_name {
            "total" => Ok(json!(self.total)),
            other => Err(WorkflowError::new(format!("unknown query: {}", other))),
        }
    }
}

/// Fails retryably on its first run attempt, then completes with the attempt number
pub struct FlakyRun;

impl Workflow for FlakyRun {
    const TYPE: &'static str = "flaky_run";
    type Input = Value;
    type Output = u32;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep {
        if ctx.attempt() == 1 {
            return Err(WorkflowError::retryable("first run always fails"));
        }
        Ok(vec![WorkflowAction::complete(json!(ctx.attempt()))])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }
}

/// Completes immediately with the time of the event it started from
pub struct Tick;

impl Workflow for Tick {
    const TYPE: &'static str = "tick";
    type Input = Value;
    type Output = String;

    fn new(_input: Value) -> Self {
        Self
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep {
        Ok(vec![WorkflowAction::complete(json!(ctx.now().to_rfc3339()))])
    }

    fn on_activity_completed(
        &mut self,
        _ctx: &WorkflowContext,
        _activity_id: &str,
        _result: Value,
    ) -> WorkflowStep {
        Ok(vec![])
    }
}

// =========================================================================
// Activities
// =========================================================================

/// Doubles its input; the first attempt fails with a transient error
pub fn register_flaky_double(worker: &Worker<Store>) {
    worker.register_activity_fn("double", |ctx: Arc<ActivityContext>, input: Value| async move {
        if ctx.attempt == 1 {
            return Err(ActivityError::retryable("transient failure"));
        }
        Ok(json!(input.as_i64().unwrap_or(0) * 2))
    });
}

/// Sleeps `ms` milliseconds and echoes `branch`
pub fn register_sleep(worker: &Worker<Store>) {
    worker.register_activity_fn("sleep", |_ctx, input: Value| async move {
        let ms = input["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok::<Value, ActivityError>(json!({ "branch": input["branch"] }))
    });
}
