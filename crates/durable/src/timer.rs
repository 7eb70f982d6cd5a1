//! Durable timer service
//!
//! A background ticker that pops due timers from the store's timer heap and
//! turns each into history: `TimerFired` for workflow timers, activity
//! timeouts for attempt deadlines, and `WorkflowTimedOut` for runs past
//! their execution timeout.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::duration;
use crate::engine::{
    attempt_outcome_commit, workflow_task, AttemptOutcome, ExecutorError, WorkflowExecutor,
};
use crate::persistence::{Commit, StoreError, TimerEntry, TimerPurpose, WorkflowEventStore};
use crate::workflow::{TimeoutType, WorkflowEvent};

/// Timer service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerServiceConfig {
    /// How often the heap is checked for due timers
    #[serde(with = "crate::duration::millis")]
    pub tick_interval: Duration,

    /// Maximum timers popped per store call
    pub batch_size: usize,

    /// Delay before a timer whose handling failed is tried again
    #[serde(with = "crate::duration::millis")]
    pub retry_delay: Duration,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            batch_size: 100,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl TimerServiceConfig {
    /// Create configuration from environment variables
    ///
    /// - `TIMER_TICK_INTERVAL_MS`: heap check interval (default: 50)
    /// - `TIMER_BATCH_SIZE`: timers popped per call (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tick_interval: std::env::var("TIMER_TICK_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            batch_size: std::env::var("TIMER_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
            ..defaults
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Fires durable timers
pub struct TimerService<S: WorkflowEventStore> {
    executor: WorkflowExecutor<S>,
    config: TimerServiceConfig,
}

impl<S: WorkflowEventStore> TimerService<S> {
    pub fn new(executor: WorkflowExecutor<S>, config: TimerServiceConfig) -> Self {
        Self { executor, config }
    }

    /// Tick until shutdown is signaled
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(tick_ms = self.config.tick_interval.as_millis() as u64, "timer service started");
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.fire_due().await {
                        warn!(error = %e, "timer tick failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender means the owning worker is gone
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("timer service stopped");
    }

    /// Fire every timer due now; returns how many were popped
    pub async fn fire_due(&self) -> Result<usize, StoreError> {
        let mut fired = 0;
        loop {
            let due = self
                .executor
                .store()
                .pop_due_timers(Utc::now(), self.config.batch_size)
                .await?;
            let batch = due.len();
            for timer in due {
                self.fire_or_reschedule(timer).await?;
            }
            fired += batch;
            if batch < self.config.batch_size {
                return Ok(fired);
            }
        }
    }

    async fn fire_or_reschedule(&self, timer: TimerEntry) -> Result<(), StoreError> {
        match self.fire(&timer).await {
            Ok(()) => Ok(()),
            Err(ExecutorError::WorkflowClosed(_))
            | Err(ExecutorError::Store(StoreError::InstanceNotFound(_))) => {
                debug!(instance = %timer.instance, "timer for closed run dropped");
                Ok(())
            }
            Err(e) => {
                warn!(
                    instance = %timer.instance,
                    purpose = ?timer.purpose,
                    error = %e,
                    "failed to fire timer, rescheduling"
                );
                let retry = TimerEntry {
                    fire_at: duration::add(Utc::now(), self.config.retry_delay),
                    ..timer
                };
                self.executor.store().schedule_timer(retry).await
            }
        }
    }

    async fn fire(&self, timer: &TimerEntry) -> Result<(), ExecutorError> {
        let instance = &timer.instance;
        match &timer.purpose {
            TimerPurpose::WorkflowTimer { timer_id } => {
                let written = self
                    .executor
                    .update(instance, |info, view| {
                        if !view.is_timer_pending(timer_id) {
                            return Ok(None);
                        }
                        let mut commit = Commit::events(vec![WorkflowEvent::TimerFired {
                            timer_id: timer_id.clone(),
                        }]);
                        commit.tasks.push(workflow_task(info));
                        Ok(Some(commit))
                    })
                    .await?;
                if written.is_some() {
                    debug!(%instance, %timer_id, "timer fired");
                }
            }

            TimerPurpose::ActivityScheduleToStart { activity_id } => {
                self.executor
                    .update(instance, |info, view| {
                        let Some(state) = view.activity(activity_id) else {
                            return Ok(None);
                        };
                        if state.closed || state.started {
                            return Ok(None);
                        }
                        warn!(%activity_id, "activity was not picked up in time");
                        let mut commit = Commit::events(vec![WorkflowEvent::ActivityTimedOut {
                            activity_id: activity_id.clone(),
                            attempt: state.attempt,
                            timeout_type: TimeoutType::ScheduleToStart,
                            will_retry: false,
                            attempts_exhausted: false,
                        }]);
                        commit.tasks.push(workflow_task(info));
                        commit.cancelled_activities.push(activity_id.clone());
                        Ok(Some(commit))
                    })
                    .await?;
            }

            TimerPurpose::ActivityStartToClose {
                activity_id,
                attempt,
            } => {
                let outcome = AttemptOutcome::TimedOut(TimeoutType::StartToClose);
                self.executor
                    .update(instance, |info, view| {
                        Ok(attempt_outcome_commit(info, view, activity_id, *attempt, &outcome))
                    })
                    .await?;
            }

            TimerPurpose::ActivityHeartbeat {
                activity_id,
                attempt,
            } => {
                let outcome = AttemptOutcome::TimedOut(TimeoutType::Heartbeat);
                self.executor
                    .update(instance, |info, view| {
                        Ok(attempt_outcome_commit(info, view, activity_id, *attempt, &outcome))
                    })
                    .await?;
            }

            TimerPurpose::WorkflowExecutionTimeout => {
                self.executor.time_out(instance).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowRegistry;
    use crate::persistence::{
        InMemoryWorkflowEventStore, InstanceRef, NewInstance, NewTask, TaskPayload, WorkflowStatus,
    };
    use crate::workflow::{ActivityOptions, WorkflowOptions};
    use serde_json::Value;
    use std::sync::Arc;

    fn service() -> TimerService<InMemoryWorkflowEventStore> {
        let executor = WorkflowExecutor::new(
            Arc::new(InMemoryWorkflowEventStore::new()),
            Arc::new(WorkflowRegistry::new()),
        );
        TimerService::new(executor, TimerServiceConfig::default().with_batch_size(2))
    }

    async fn start(service: &TimerService<InMemoryWorkflowEventStore>, options: WorkflowOptions) -> InstanceRef {
        service
            .executor
            .start_workflow(NewInstance::new("wf", "order", "default", Value::Null).with_options(options))
            .await
            .unwrap()
    }

    async fn append(
        service: &TimerService<InMemoryWorkflowEventStore>,
        instance: &InstanceRef,
        commit: Commit,
    ) {
        let store = service.executor.store();
        let version = store.history_version(instance).await.unwrap();
        store.commit(instance, version, commit).await.unwrap();
    }

    async fn last_event(
        service: &TimerService<InMemoryWorkflowEventStore>,
        instance: &InstanceRef,
    ) -> WorkflowEvent {
        let events = service.executor.store().read_events(instance, 0).await.unwrap();
        events.last().unwrap().event.clone()
    }

    #[test]
    fn test_config_defaults() {
        let config = TimerServiceConfig::default();
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.batch_size, 100);
        assert_eq!(TimerServiceConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[tokio::test]
    async fn test_workflow_timer_fires_once() {
        let service = service();
        let run = start(&service, WorkflowOptions::default()).await;

        let now = Utc::now();
        let mut commit = Commit::default();
        for id in ["t1", "t2", "t3"] {
            commit.events.push(WorkflowEvent::TimerStarted {
                timer_id: id.into(),
                fire_at: now,
                duration: Duration::ZERO,
            });
            commit.timers.push(TimerEntry::new(
                run.clone(),
                now,
                TimerPurpose::WorkflowTimer { timer_id: id.into() },
            ));
        }
        append(&service, &run, commit).await;

        // Batches of two until the heap is drained
        assert_eq!(service.fire_due().await.unwrap(), 3);
        assert_eq!(service.fire_due().await.unwrap(), 0);

        let events = service.executor.store().read_events(&run, 0).await.unwrap();
        let fired = events
            .iter()
            .filter(|e| matches!(e.event, WorkflowEvent::TimerFired { .. }))
            .count();
        assert_eq!(fired, 3);
    }

    #[tokio::test]
    async fn test_cancelled_timer_does_not_fire() {
        let service = service();
        let run = start(&service, WorkflowOptions::default()).await;

        append(
            &service,
            &run,
            Commit::events(vec![
                WorkflowEvent::TimerStarted {
                    timer_id: "t".into(),
                    fire_at: Utc::now(),
                    duration: Duration::ZERO,
                },
                WorkflowEvent::TimerCancelled { timer_id: "t".into() },
            ]),
        )
        .await;
        // Racing entry that escaped cancellation
        service
            .executor
            .store()
            .schedule_timer(TimerEntry::new(
                run.clone(),
                Utc::now(),
                TimerPurpose::WorkflowTimer { timer_id: "t".into() },
            ))
            .await
            .unwrap();

        service.fire_due().await.unwrap();
        assert!(matches!(last_event(&service, &run).await, WorkflowEvent::TimerCancelled { .. }));
    }

    #[tokio::test]
    async fn test_schedule_to_start_timeout_is_terminal() {
        let service = service();
        let run = start(&service, WorkflowOptions::default()).await;

        let mut commit = Commit::events(vec![WorkflowEvent::ActivityScheduled {
            activity_id: "a".into(),
            activity_type: "charge".into(),
            input: Value::Null,
            task_queue: "nobody-listens".into(),
            options: ActivityOptions::default(),
        }]);
        commit.tasks.push(NewTask {
            task_queue: "nobody-listens".into(),
            payload: TaskPayload::Activity {
                instance: run.clone(),
                activity_id: "a".into(),
                activity_type: "charge".into(),
                input: Value::Null,
                options: ActivityOptions::default(),
                attempt: 1,
            },
            delay: Duration::ZERO,
        });
        commit.timers.push(TimerEntry::new(
            run.clone(),
            Utc::now(),
            TimerPurpose::ActivityScheduleToStart {
                activity_id: "a".into(),
            },
        ));
        append(&service, &run, commit).await;
        let before = service.executor.store().pending_task_count();

        service.fire_due().await.unwrap();
        assert!(matches!(
            last_event(&service, &run).await,
            WorkflowEvent::ActivityTimedOut {
                timeout_type: TimeoutType::ScheduleToStart,
                will_retry: false,
                ..
            }
        ));
        // The queued activity task is gone; the workflow task was deduplicated
        assert_eq!(service.executor.store().pending_task_count(), before - 1);
    }

    #[tokio::test]
    async fn test_execution_timeout_closes_run() {
        let service = service();
        let run = start(
            &service,
            WorkflowOptions::default().with_execution_timeout(Duration::from_millis(1)),
        )
        .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        service.fire_due().await.unwrap();

        let info = service.executor.store().get_instance(&run).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::TimedOut);
        assert!(matches!(last_event(&service, &run).await, WorkflowEvent::WorkflowTimedOut));
    }

    #[tokio::test]
    async fn test_timer_for_closed_run_is_dropped() {
        let service = service();
        let run = start(&service, WorkflowOptions::default()).await;
        service.executor.terminate(&run, "done").await.unwrap();

        service
            .executor
            .store()
            .schedule_timer(TimerEntry::new(
                run.clone(),
                Utc::now(),
                TimerPurpose::WorkflowExecutionTimeout,
            ))
            .await
            .unwrap();
        assert_eq!(service.fire_due().await.unwrap(), 1);
        assert_eq!(service.executor.store().timer_count(), 0);
    }
}
