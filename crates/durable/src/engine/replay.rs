//! Deterministic replay of workflow history
//!
//! The replay engine rebuilds a workflow from its event log by feeding each
//! event to the matching handler. Commands returned by handlers are queued
//! in order; every recorded command event must match the head of that queue.
//! Whatever is still queued when history runs out is the set of new commands
//! for the current workflow task.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::activity::ActivityError;
use crate::persistence::InstanceRef;
use crate::workflow::{
    CommandKey, ConditionOutcome, HistoryEvent, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowEvent, WorkflowSignal, WorkflowStep, CONDITION_TIMER_PREFIX,
};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Errors that abort a replay
///
/// None of these close the workflow: the workflow task fails and is retried,
/// so a deployment that restores the old code can resume the run.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Workflow code produced different commands than history recorded
    #[error("non-determinism at event {event_id}: expected {expected}, history has {found}")]
    NonDeterminism {
        event_id: u64,
        expected: String,
        found: String,
    },

    /// A workflow handler panicked
    #[error("workflow handler panicked at event {event_id}: {message}")]
    HandlerPanicked { event_id: u64, message: String },

    /// History does not begin with WorkflowStarted
    #[error("history of {0} does not start with WorkflowStarted")]
    MissingStart(InstanceRef),

    /// Workflow type could not be instantiated
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of replaying a history
pub struct ReplayOutcome {
    /// Workflow state after applying every event
    pub workflow: Box<dyn AnyWorkflow>,

    /// Commands not yet recorded in history, truncated after the first terminal command
    pub new_commands: Vec<WorkflowAction>,

    /// History contains a close event
    pub closed: bool,

    /// Id of the last applied event
    pub last_event_id: u64,
}

impl std::fmt::Debug for ReplayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOutcome")
            .field("workflow_type", &self.workflow.workflow_type())
            .field("new_commands", &self.new_commands)
            .field("closed", &self.closed)
            .field("last_event_id", &self.last_event_id)
            .finish()
    }
}

/// An `AwaitCondition` still waiting
struct ActiveCondition {
    id: String,
    has_timer: bool,
}

/// Mutable state of one replay pass
struct Replayer<'a> {
    instance: &'a InstanceRef,
    workflow_type: String,
    attempt: u32,
    /// Events with ids below this were already decided by an earlier workflow task
    replay_horizon: u64,
    workflow: Box<dyn AnyWorkflow>,
    pending: VecDeque<WorkflowAction>,
    /// Pending commands started matching recorded events
    draining: bool,
    terminal_pending: bool,
    awaited_signals: Vec<String>,
    inbox: VecDeque<WorkflowSignal>,
    conditions: Vec<ActiveCondition>,
    started_timers: HashSet<String>,
    cancelled_timers: HashSet<String>,
    cancelled_activities: HashSet<String>,
    cancel_requested: bool,
    closed: bool,
}

/// Rebuilds workflows from history
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayEngine;

impl ReplayEngine {
    pub fn new() -> Self {
        Self
    }

    /// Replay `history` for `instance`
    pub fn replay(
        &self,
        registry: &WorkflowRegistry,
        instance: &InstanceRef,
        history: &[HistoryEvent],
    ) -> Result<ReplayOutcome, ReplayError> {
        let first = history
            .first()
            .ok_or_else(|| ReplayError::MissingStart(instance.clone()))?;
        let (workflow_type, input, attempt) = match &first.event {
            WorkflowEvent::WorkflowStarted {
                workflow_type,
                input,
                attempt,
                ..
            } => (workflow_type.clone(), input.clone(), *attempt),
            _ => return Err(ReplayError::MissingStart(instance.clone())),
        };

        let workflow = registry.create(&workflow_type, input)?;
        let replay_horizon = history
            .iter()
            .rev()
            .find(|e| e.event.command_key().is_some())
            .map(|e| e.event_id)
            .unwrap_or(0);

        let mut replayer = Replayer {
            instance,
            workflow_type,
            attempt,
            replay_horizon,
            workflow,
            pending: VecDeque::new(),
            draining: false,
            terminal_pending: false,
            awaited_signals: Vec::new(),
            inbox: VecDeque::new(),
            conditions: Vec::new(),
            started_timers: HashSet::new(),
            cancelled_timers: HashSet::new(),
            cancelled_activities: HashSet::new(),
            cancel_requested: false,
            closed: false,
        };

        for event in history {
            replayer.apply(event)?;
            if replayer.closed {
                break;
            }
        }

        let last_event_id = history.last().map(|e| e.event_id).unwrap_or(0);
        if !replayer.closed && replayer.draining && !replayer.pending.is_empty() {
            return Err(replayer.mismatch(last_event_id, "end of history".to_string()));
        }

        let new_commands = if replayer.closed {
            Vec::new()
        } else {
            replayer.pending.into_iter().collect()
        };
        debug!(
            instance = %instance,
            events = history.len(),
            new_commands = new_commands.len(),
            closed = replayer.closed,
            "replayed workflow history"
        );

        Ok(ReplayOutcome {
            workflow: replayer.workflow,
            new_commands,
            closed: replayer.closed,
            last_event_id,
        })
    }
}

impl Replayer<'_> {
    fn apply(&mut self, history_event: &HistoryEvent) -> Result<(), ReplayError> {
        let event_id = history_event.event_id;

        if let Some(found) = history_event.event.command_key() {
            return self.match_command(history_event, found);
        }

        match &history_event.event {
            // Progress reports and intermediate attempts never reach workflow code
            WorkflowEvent::ActivityStarted { .. }
            | WorkflowEvent::ActivityHeartbeat { .. }
            | WorkflowEvent::ActivityFailed {
                will_retry: true, ..
            }
            | WorkflowEvent::ActivityTimedOut {
                will_retry: true, ..
            } => return Ok(()),

            WorkflowEvent::WorkflowTimedOut | WorkflowEvent::WorkflowTerminated { .. } => {
                self.closed = true;
                return Ok(());
            }
            _ => {}
        }

        if self.draining && !self.pending.is_empty() {
            return Err(self.mismatch(event_id, history_event.event.name().to_string()));
        }

        match &history_event.event {
            WorkflowEvent::WorkflowStarted { .. } => {
                self.dispatch(history_event, |w, ctx| w.on_start(ctx))?;
            }

            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } => {
                if !self.cancelled_activities.contains(activity_id) {
                    self.dispatch(history_event, |w, ctx| {
                        w.on_activity_completed(ctx, activity_id, result.clone())
                    })?;
                }
            }

            WorkflowEvent::ActivityFailed {
                activity_id, error, ..
            } => {
                if !self.cancelled_activities.contains(activity_id) {
                    self.dispatch(history_event, |w, ctx| {
                        w.on_activity_failed(ctx, activity_id, error)
                    })?;
                }
            }

            WorkflowEvent::ActivityTimedOut {
                activity_id,
                timeout_type,
                ..
            } => {
                if !self.cancelled_activities.contains(activity_id) {
                    let error = ActivityError::timeout(timeout_type.as_str());
                    self.dispatch(history_event, |w, ctx| {
                        w.on_activity_failed(ctx, activity_id, &error)
                    })?;
                }
            }

            WorkflowEvent::TimerFired { timer_id } => {
                self.timer_fired(history_event, timer_id)?;
            }

            WorkflowEvent::SignalReceived { signal } => {
                self.inbox.push_back(signal.clone());
            }

            WorkflowEvent::ChildWorkflowCompleted {
                workflow_id,
                result,
                ..
            } => {
                self.dispatch(history_event, |w, ctx| {
                    w.on_child_completed(ctx, workflow_id, result.clone())
                })?;
            }

            WorkflowEvent::ChildWorkflowFailed {
                workflow_id, error, ..
            } => {
                self.dispatch(history_event, |w, ctx| {
                    w.on_child_failed(ctx, workflow_id, error)
                })?;
            }

            WorkflowEvent::CancellationRequested { reason } => {
                if !self.cancel_requested {
                    self.cancel_requested = true;
                    self.dispatch(history_event, |w, ctx| w.on_cancel_requested(ctx, reason))?;
                }
            }

            other => {
                warn!(event = other.name(), event_id, "unexpected event during replay");
            }
        }

        self.settle(history_event)
    }

    fn match_command(
        &mut self,
        history_event: &HistoryEvent,
        found: CommandKey,
    ) -> Result<(), ReplayError> {
        let event_id = history_event.event_id;
        let expected = match self.pending.pop_front() {
            Some(action) => action,
            None => {
                return Err(ReplayError::NonDeterminism {
                    event_id,
                    expected: "no command".to_string(),
                    found: found.to_string(),
                })
            }
        };

        let expected_key = expected.command_key();
        if expected_key.as_ref() != Some(&found) {
            return Err(ReplayError::NonDeterminism {
                event_id,
                expected: expected_key
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "no command".to_string()),
                found: found.to_string(),
            });
        }
        self.draining = !self.pending.is_empty();

        match &history_event.event {
            WorkflowEvent::TimerStarted { timer_id, .. } => {
                self.started_timers.insert(timer_id.clone());
            }
            WorkflowEvent::TimerCancelled { timer_id } => {
                self.cancelled_timers.insert(timer_id.clone());
            }
            WorkflowEvent::ActivityCancelled { activity_id } => {
                self.cancelled_activities.insert(activity_id.clone());
            }
            event if event.is_terminal() => {
                self.closed = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn mismatch(&self, event_id: u64, found: String) -> ReplayError {
        ReplayError::NonDeterminism {
            event_id,
            expected: self
                .pending
                .front()
                .and_then(|a| a.command_key())
                .map(|k| k.to_string())
                .unwrap_or_else(|| "no command".to_string()),
            found,
        }
    }

    fn timer_fired(&mut self, history_event: &HistoryEvent, timer_id: &str) -> Result<(), ReplayError> {
        if self.cancelled_timers.contains(timer_id) || !self.started_timers.contains(timer_id) {
            debug!(timer_id, "ignoring fired timer that is cancelled or unknown");
            return Ok(());
        }

        if let Some(condition_id) = timer_id.strip_prefix(CONDITION_TIMER_PREFIX) {
            let position = self.conditions.iter().position(|c| c.id == condition_id);
            if let Some(position) = position {
                let condition = self.conditions.remove(position);
                self.dispatch(history_event, |w, ctx| {
                    w.on_condition(ctx, &condition.id, ConditionOutcome::TimedOut)
                })?;
            }
            return Ok(());
        }

        self.dispatch(history_event, |w, ctx| w.on_timer_fired(ctx, timer_id))
    }

    /// Deliver buffered signals and resolve satisfied conditions until nothing changes
    fn settle(&mut self, history_event: &HistoryEvent) -> Result<(), ReplayError> {
        loop {
            if self.closed || self.terminal_pending {
                return Ok(());
            }

            let deliverable = self.inbox.iter().position(|signal| {
                self.awaited_signals.iter().any(|n| n == &signal.name)
                    || self.workflow.handles_signal(&signal.name)
            });
            if let Some(index) = deliverable {
                let Some(signal) = self.inbox.remove(index) else {
                    return Ok(());
                };
                if let Some(awaited) = self.awaited_signals.iter().position(|n| n == &signal.name) {
                    self.awaited_signals.remove(awaited);
                }
                self.dispatch(history_event, |w, ctx| w.on_signal(ctx, &signal))?;
                continue;
            }

            let satisfied = self
                .conditions
                .iter()
                .position(|c| self.workflow.check_condition(&c.id));
            if let Some(index) = satisfied {
                let condition = self.conditions.remove(index);
                if condition.has_timer {
                    self.accept(Ok(vec![WorkflowAction::cancel_timer(format!(
                        "{}{}",
                        CONDITION_TIMER_PREFIX, condition.id
                    ))]));
                }
                self.dispatch(history_event, |w, ctx| {
                    w.on_condition(ctx, &condition.id, ConditionOutcome::Satisfied)
                })?;
                continue;
            }

            return Ok(());
        }
    }

    /// Run one handler under a fresh context and queue its commands
    fn dispatch<F>(&mut self, history_event: &HistoryEvent, handler: F) -> Result<(), ReplayError>
    where
        F: FnOnce(&mut dyn AnyWorkflow, &WorkflowContext) -> WorkflowStep,
    {
        if self.terminal_pending || self.closed {
            return Ok(());
        }

        let ctx = WorkflowContext::new(
            self.instance.clone(),
            self.workflow_type.clone(),
            self.attempt,
            history_event.event_id,
            history_event.timestamp,
            history_event.event_id < self.replay_horizon,
        );

        let workflow = &mut *self.workflow;
        let step = panic::catch_unwind(AssertUnwindSafe(|| handler(workflow, &ctx))).map_err(
            |payload| ReplayError::HandlerPanicked {
                event_id: history_event.event_id,
                message: panic_message(payload.as_ref()),
            },
        )?;

        self.accept(step);
        Ok(())
    }

    fn accept(&mut self, step: Result<Vec<WorkflowAction>, WorkflowError>) {
        let actions = match step {
            Ok(actions) => actions,
            Err(error) => vec![WorkflowAction::fail(error)],
        };

        for action in actions {
            if self.terminal_pending {
                break;
            }
            match action {
                WorkflowAction::AwaitSignal { signal_name } => {
                    self.awaited_signals.push(signal_name);
                }
                WorkflowAction::AwaitCondition {
                    condition_id,
                    timeout,
                } => {
                    if let Some(timeout) = timeout {
                        self.pending.push_back(WorkflowAction::timer(
                            format!("{}{}", CONDITION_TIMER_PREFIX, condition_id),
                            timeout,
                        ));
                    }
                    self.conditions.push(ActiveCondition {
                        id: condition_id,
                        has_timer: timeout.is_some(),
                    });
                }
                action => {
                    self.terminal_pending = action.is_terminal();
                    self.pending.push_back(action);
                }
            }
        }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{TimeoutType, Workflow, WorkflowOptions};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::time::Duration;
    use uuid::Uuid;

    /// Schedules `count` activities up front, completes with their sum
    struct SumWorkflow {
        count: u32,
        received: Vec<i64>,
    }

    impl Workflow for SumWorkflow {
        const TYPE: &'static str = "sum";
        type Input = u32;
        type Output = i64;

        fn new(input: u32) -> Self {
            Self {
                count: input,
                received: vec![],
            }
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
            Ok((0..self.count)
                .map(|i| WorkflowAction::schedule_activity(format!("a{}", i), "add", json!(i)))
                .collect())
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &WorkflowContext,
            _activity_id: &str,
            result: Value,
        ) -> WorkflowStep {
            self.received.push(result.as_i64().unwrap_or(0));
            if self.received.len() as u32 == self.count {
                Ok(vec![WorkflowAction::complete(json!(self.received.iter().sum::<i64>()))])
            } else {
                Ok(vec![])
            }
        }
    }

    /// Waits for an "approve" signal, with a timer as fallback
    struct ApprovalWorkflow {
        approved: Option<bool>,
    }

    impl Workflow for ApprovalWorkflow {
        const TYPE: &'static str = "approval";
        type Input = ();
        type Output = bool;

        fn new(_input: ()) -> Self {
            Self { approved: None }
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
            Ok(vec![WorkflowAction::await_condition(
                "decided",
                Some(Duration::from_secs(1)),
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

        fn handles_signal(&self, signal_name: &str) -> bool {
            signal_name == "approve"
        }

        fn on_signal(&mut self, _ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep {
            self.approved = signal.payload.as_bool();
            Ok(vec![])
        }

        fn check_condition(&self, _condition_id: &str) -> bool {
            self.approved.is_some()
        }

        fn on_condition(
            &mut self,
            _ctx: &WorkflowContext,
            _condition_id: &str,
            outcome: ConditionOutcome,
        ) -> WorkflowStep {
            match outcome {
                ConditionOutcome::Satisfied => {
                    Ok(vec![WorkflowAction::complete(json!(self.approved))])
                }
                ConditionOutcome::TimedOut => Ok(vec![WorkflowAction::complete(json!("timeout"))]),
            }
        }
    }

    struct PanicWorkflow;

    impl Workflow for PanicWorkflow {
        const TYPE: &'static str = "panics";
        type Input = ();
        type Output = ();

        fn new(_input: ()) -> Self {
            Self
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
            panic!("boom")
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

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<SumWorkflow>();
        registry.register::<ApprovalWorkflow>();
        registry.register::<PanicWorkflow>();
        registry
    }

    struct History {
        events: Vec<HistoryEvent>,
    }

    impl History {
        fn start(workflow_type: &str, input: Value) -> Self {
            let mut history = Self { events: vec![] };
            history.push(WorkflowEvent::WorkflowStarted {
                workflow_type: workflow_type.into(),
                input,
                task_queue: "default".into(),
                attempt: 1,
                parent: None,
                options: WorkflowOptions::default(),
            });
            history
        }

        fn push(&mut self, event: WorkflowEvent) -> &mut Self {
            let id = self.events.len() as u64 + 1;
            self.events.push(HistoryEvent::new(id, Utc::now(), event));
            self
        }

        fn scheduled(&mut self, activity_id: &str) -> &mut Self {
            self.push(WorkflowEvent::ActivityScheduled {
                activity_id: activity_id.into(),
                activity_type: "add".into(),
                input: json!(0),
                task_queue: "default".into(),
                options: Default::default(),
            })
        }

        fn completed(&mut self, activity_id: &str, result: Value) -> &mut Self {
            self.push(WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.into(),
                attempt: 1,
                result,
            })
        }
    }

    fn instance() -> InstanceRef {
        InstanceRef::new("wf", Uuid::now_v7())
    }

    #[test]
    fn test_fresh_start_yields_commands() {
        let history = History::start("sum", json!(2));
        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();

        assert_eq!(outcome.new_commands.len(), 2);
        assert!(!outcome.closed);
    }

    #[test]
    fn test_recorded_commands_are_not_reissued() {
        let mut history = History::start("sum", json!(2));
        history.scheduled("a0").scheduled("a1");

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert!(outcome.new_commands.is_empty());
    }

    #[test]
    fn test_completion_after_all_results() {
        let mut history = History::start("sum", json!(2));
        history
            .scheduled("a0")
            .scheduled("a1")
            .completed("a1", json!(5))
            .completed("a0", json!(7));

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert_eq!(outcome.new_commands, vec![WorkflowAction::complete(json!(12))]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut history = History::start("sum", json!(2));
        history.scheduled("a0").scheduled("a1").completed("a0", json!(1));

        let engine = ReplayEngine::new();
        let registry = registry();
        let instance = instance();
        let first = engine.replay(&registry, &instance, &history.events).unwrap();
        let second = engine.replay(&registry, &instance, &history.events).unwrap();
        assert_eq!(first.new_commands, second.new_commands);
    }

    #[test]
    fn test_mismatched_command_is_non_determinism() {
        let mut history = History::start("sum", json!(1));
        history.push(WorkflowEvent::TimerStarted {
            timer_id: "t".into(),
            fire_at: Utc::now(),
            duration: Duration::from_secs(1),
        });

        let result = ReplayEngine::new().replay(&registry(), &instance(), &history.events);
        match result {
            Err(ReplayError::NonDeterminism { event_id, .. }) => assert_eq!(event_id, 2),
            other => panic!("expected non-determinism, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_command_is_non_determinism() {
        // History recorded two activities, code now schedules three
        let mut history = History::start("sum", json!(3));
        history.scheduled("a0").scheduled("a1").completed("a0", json!(1));

        let result = ReplayEngine::new().replay(&registry(), &instance(), &history.events);
        assert!(matches!(result, Err(ReplayError::NonDeterminism { .. })));
    }

    #[test]
    fn test_retrying_attempts_are_invisible() {
        let mut history = History::start("sum", json!(1));
        history
            .scheduled("a0")
            .push(WorkflowEvent::ActivityStarted {
                activity_id: "a0".into(),
                attempt: 1,
                worker_id: "w".into(),
            })
            .push(WorkflowEvent::ActivityTimedOut {
                activity_id: "a0".into(),
                attempt: 1,
                timeout_type: TimeoutType::StartToClose,
                will_retry: true,
                attempts_exhausted: false,
            });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert!(outcome.new_commands.is_empty());
    }

    #[test]
    fn test_terminal_failure_reaches_workflow() {
        let mut history = History::start("sum", json!(1));
        history.scheduled("a0").push(WorkflowEvent::ActivityFailed {
            activity_id: "a0".into(),
            attempt: 3,
            error: ActivityError::retryable("down"),
            will_retry: false,
            attempts_exhausted: true,
        });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert!(matches!(
            outcome.new_commands.as_slice(),
            [WorkflowAction::FailWorkflow { .. }]
        ));
    }

    #[test]
    fn test_condition_satisfied_by_signal_cancels_timer() {
        let mut history = History::start("approval", Value::Null);
        history
            .push(WorkflowEvent::TimerStarted {
                timer_id: "condition:decided".into(),
                fire_at: Utc::now(),
                duration: Duration::from_secs(1),
            })
            .push(WorkflowEvent::SignalReceived {
                signal: WorkflowSignal::new("approve", json!(true)),
            });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert_eq!(
            outcome.new_commands,
            vec![
                WorkflowAction::cancel_timer("condition:decided"),
                WorkflowAction::complete(json!(true)),
            ]
        );
    }

    #[test]
    fn test_condition_timeout() {
        let mut history = History::start("approval", Value::Null);
        history
            .push(WorkflowEvent::TimerStarted {
                timer_id: "condition:decided".into(),
                fire_at: Utc::now(),
                duration: Duration::from_secs(1),
            })
            .push(WorkflowEvent::TimerFired {
                timer_id: "condition:decided".into(),
            });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert_eq!(outcome.new_commands, vec![WorkflowAction::complete(json!("timeout"))]);
    }

    #[test]
    fn test_signal_before_first_task_is_buffered() {
        // The signal landed before the start commands were recorded
        let mut history = History::start("approval", Value::Null);
        history.push(WorkflowEvent::SignalReceived {
            signal: WorkflowSignal::new("approve", json!(false)),
        });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert_eq!(
            outcome.new_commands,
            vec![
                WorkflowAction::timer("condition:decided", Duration::from_secs(1)),
                WorkflowAction::cancel_timer("condition:decided"),
                WorkflowAction::complete(json!(false)),
            ]
        );
    }

    #[test]
    fn test_closed_history_has_no_new_commands() {
        let mut history = History::start("sum", json!(1));
        history
            .scheduled("a0")
            .push(WorkflowEvent::WorkflowTerminated {
                reason: "operator".into(),
            });

        let outcome = ReplayEngine::new()
            .replay(&registry(), &instance(), &history.events)
            .unwrap();
        assert!(outcome.closed);
        assert!(outcome.new_commands.is_empty());
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let history = History::start("panics", Value::Null);
        let result = ReplayEngine::new().replay(&registry(), &instance(), &history.events);
        match result {
            Err(ReplayError::HandlerPanicked { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("expected panic error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_start() {
        let result = ReplayEngine::new().replay(&registry(), &instance(), &[]);
        assert!(matches!(result, Err(ReplayError::MissingStart(_))));
    }

    #[test]
    fn test_unknown_workflow_type() {
        let history = History::start("nope", Value::Null);
        let result = ReplayEngine::new().replay(&registry(), &instance(), &history.events);
        assert!(matches!(result, Err(ReplayError::Registry(_))));
    }
}
