//! In-memory implementation of WorkflowEventStore

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use uuid::Uuid;

use super::store::*;
use crate::duration;
use crate::workflow::{HistoryEvent, WorkflowEvent};

struct InstanceRecord {
    info: WorkflowInstance,
    events: Vec<HistoryEvent>,
}

struct Lease {
    token: Uuid,
    worker_id: String,
    expires_at: DateTime<Utc>,
}

struct TaskRecord {
    task_id: Uuid,
    task_queue: String,
    payload: TaskPayload,
    visible_at: DateTime<Utc>,
    lease: Option<Lease>,
    delivery_count: u32,
    cancel_requested: bool,
    last_error: Option<String>,
}

impl TaskRecord {
    fn available_at(&self) -> DateTime<Utc> {
        match &self.lease {
            Some(lease) => lease.expires_at,
            None => self.visible_at,
        }
    }

    fn is_pending_workflow_task_for(&self, instance: &InstanceRef) -> bool {
        self.lease.is_none()
            && matches!(&self.payload, TaskPayload::Workflow { instance: i, .. } if i == instance)
    }
}

#[derive(Default)]
struct Inner {
    instances: HashMap<InstanceRef, InstanceRecord>,
    current_runs: HashMap<String, Uuid>,
    /// Tasks in enqueue order
    tasks: BTreeMap<u64, TaskRecord>,
    task_index: HashMap<Uuid, u64>,
    next_task_seq: u64,
    /// Min-heap of (fire_at, seq); entries missing from `timer_entries` are tombstones
    timer_heap: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    timer_entries: HashMap<u64, TimerEntry>,
    timer_keys: HashMap<(InstanceRef, TimerPurpose), u64>,
    next_timer_seq: u64,
}

impl Inner {
    fn record(&self, instance: &InstanceRef) -> Result<&InstanceRecord, StoreError> {
        self.instances
            .get(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.clone()))
    }

    fn check_can_start(
        &self,
        new: &NewInstance,
        closing: Option<&InstanceRef>,
    ) -> Result<(), StoreError> {
        if let Some(run_id) = self.current_runs.get(&new.id.workflow_id) {
            let current = InstanceRef::new(new.id.workflow_id.clone(), *run_id);
            let running = self
                .instances
                .get(&current)
                .map(|r| !r.info.status.is_terminal())
                .unwrap_or(false);
            if running && closing != Some(&current) {
                return Err(StoreError::AlreadyStarted {
                    workflow_id: current.workflow_id,
                    run_id: current.run_id,
                });
            }
        }
        Ok(())
    }

    fn create(&mut self, new: NewInstance, now: DateTime<Utc>) {
        let started = HistoryEvent::new(1, now, new.started_event());
        let info = WorkflowInstance {
            id: new.id.clone(),
            workflow_type: new.workflow_type.clone(),
            task_queue: new.task_queue.clone(),
            status: WorkflowStatus::Running,
            input: new.input.clone(),
            result: None,
            error: None,
            attempt: new.attempt,
            parent: new.parent.clone(),
            options: new.options.clone(),
            start_time: now,
            close_time: None,
            history_length: 1,
            next_run_id: None,
        };

        if let Some(previous) = self.current_runs.insert(new.id.workflow_id.clone(), new.id.run_id) {
            let previous = InstanceRef::new(new.id.workflow_id.clone(), previous);
            if let Some(record) = self.instances.get_mut(&previous) {
                record.info.next_run_id = Some(new.id.run_id);
            }
        }
        self.instances.insert(
            new.id.clone(),
            InstanceRecord {
                info,
                events: vec![started],
            },
        );

        self.enqueue(
            NewTask::workflow(&new.task_queue, new.id.clone(), &new.workflow_type)
                .with_delay(new.first_task_delay),
            now,
        );
        if let Some(timeout) = new.options.execution_timeout {
            let fire_at = duration::add(duration::add(now, new.first_task_delay), timeout);
            self.schedule_timer(TimerEntry::new(
                new.id,
                fire_at,
                TimerPurpose::WorkflowExecutionTimeout,
            ));
        }
    }

    fn append(&mut self, instance: &InstanceRef, events: Vec<WorkflowEvent>, now: DateTime<Utc>) {
        if let Some(record) = self.instances.get_mut(instance) {
            for event in events {
                let event_id = record.events.len() as u64 + 1;
                record.events.push(HistoryEvent::new(event_id, now, event));
            }
            record.info.history_length = record.events.len() as u64;
        }
    }

    fn commit(
        &mut self,
        instance: &InstanceRef,
        expected_version: u64,
        commit: Commit,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let record = self.record(instance)?;
        if record.info.status.is_terminal() {
            return Err(StoreError::InstanceClosed(instance.clone()));
        }
        let actual = record.events.len() as u64;
        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual,
            });
        }
        let closing = commit.close.as_ref().map(|_| instance);
        for new in &commit.new_instances {
            self.check_can_start(new, closing)?;
        }

        let Commit {
            events,
            tasks,
            timers,
            cancelled_timers,
            cancelled_activities,
            new_instances,
            notifications,
            close,
        } = commit;

        self.append(instance, events, now);
        let closed = close.is_some();
        if let Some(close) = close {
            if let Some(record) = self.instances.get_mut(instance) {
                record.info.status = close.status;
                record.info.result = close.result;
                record.info.error = close.error;
                record.info.close_time = Some(now);
            }
        }

        for task in tasks {
            self.enqueue(task, now);
        }
        for timer in timers {
            self.schedule_timer(timer);
        }
        for purpose in cancelled_timers {
            self.cancel_timer(instance, purpose);
        }
        for activity_id in cancelled_activities {
            self.cancel_activity(instance, &activity_id);
        }
        if closed {
            self.purge(instance);
        }
        for new in new_instances {
            self.create(new, now);
        }
        for notification in notifications {
            self.notify(notification, now);
        }

        Ok(self
            .instances
            .get(instance)
            .map(|r| r.events.len() as u64)
            .unwrap_or(actual))
    }

    fn notify(&mut self, notification: Notification, now: DateTime<Utc>) {
        let Notification { target, event } = notification;
        let (task_queue, workflow_type) = match self.instances.get(&target) {
            Some(record) if !record.info.status.is_terminal() => (
                record.info.task_queue.clone(),
                record.info.workflow_type.clone(),
            ),
            _ => return,
        };
        self.append(&target, vec![event], now);
        self.enqueue(NewTask::workflow(task_queue, target, workflow_type), now);
    }

    fn enqueue(&mut self, task: NewTask, now: DateTime<Utc>) -> Option<Uuid> {
        let visible_at = duration::add(now, task.delay);

        if let TaskPayload::Workflow { instance, .. } = &task.payload {
            if let Some(existing) = self
                .tasks
                .values_mut()
                .find(|t| t.is_pending_workflow_task_for(instance))
            {
                existing.visible_at = existing.visible_at.min(visible_at);
                return None;
            }
        }

        let task_id = Uuid::now_v7();
        let seq = self.next_task_seq;
        self.next_task_seq += 1;
        self.tasks.insert(
            seq,
            TaskRecord {
                task_id,
                task_queue: task.task_queue,
                payload: task.payload,
                visible_at,
                lease: None,
                delivery_count: 0,
                cancel_requested: false,
                last_error: None,
            },
        );
        self.task_index.insert(task_id, seq);
        Some(task_id)
    }

    fn remove_task(&mut self, seq: u64) {
        if let Some(task) = self.tasks.remove(&seq) {
            self.task_index.remove(&task.task_id);
        }
    }

    /// Claim the oldest matching task, or report when one next becomes available
    fn try_claim(
        &mut self,
        request: &PollRequest,
        now: DateTime<Utc>,
    ) -> Result<LeasedTask, Option<DateTime<Utc>>> {
        let mut next_available: Option<DateTime<Utc>> = None;
        let mut chosen = None;

        for (seq, task) in self.tasks.iter() {
            if task.task_queue != request.task_queue || task.payload.kind() != request.kind {
                continue;
            }
            if !request.types.is_empty()
                && !request.types.iter().any(|t| t == task.payload.type_name())
            {
                continue;
            }
            let available_at = task.available_at();
            if available_at <= now {
                chosen = Some(*seq);
                break;
            }
            next_available = Some(next_available.map_or(available_at, |n| n.min(available_at)));
        }

        let task = match chosen.and_then(|seq| self.tasks.get_mut(&seq)) {
            Some(task) => task,
            None => return Err(next_available),
        };

        let lease = Lease {
            token: Uuid::now_v7(),
            worker_id: request.worker_id.clone(),
            expires_at: duration::add(now, request.lease_duration),
        };
        task.delivery_count += 1;
        let leased = LeasedTask {
            task_id: task.task_id,
            lease_token: lease.token,
            task_queue: task.task_queue.clone(),
            payload: task.payload.clone(),
            delivery_count: task.delivery_count,
            lease_expires_at: lease.expires_at,
        };
        task.lease = Some(lease);
        Ok(leased)
    }

    fn leased_task_mut(&mut self, task_id: Uuid, token: Uuid) -> Result<(u64, &mut TaskRecord), StoreError> {
        let seq = *self
            .task_index
            .get(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let task = self
            .tasks
            .get_mut(&seq)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        match &task.lease {
            Some(lease) if lease.token == token => Ok((seq, task)),
            _ => Err(StoreError::LeaseLost(task_id)),
        }
    }

    fn cancel_activity(&mut self, instance: &InstanceRef, activity_id: &str) {
        let matching: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| {
                matches!(&t.payload, TaskPayload::Activity { instance: i, activity_id: a, .. }
                    if i == instance && a == activity_id)
            })
            .map(|(seq, _)| *seq)
            .collect();
        self.drop_or_flag(matching);
    }

    /// Remove queued work and timers of a closed run
    fn purge(&mut self, instance: &InstanceRef) {
        let matching: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.payload.instance() == instance)
            .map(|(seq, _)| *seq)
            .collect();
        self.drop_or_flag(matching);

        let keys: Vec<(InstanceRef, TimerPurpose)> = self
            .timer_keys
            .keys()
            .filter(|(i, _)| i == instance)
            .cloned()
            .collect();
        for (i, purpose) in keys {
            self.cancel_timer(&i, purpose);
        }
    }

    /// Unleased tasks are removed; leased ones are told to cancel via heartbeat
    fn drop_or_flag(&mut self, seqs: Vec<u64>) {
        for seq in seqs {
            let leased = match self.tasks.get_mut(&seq) {
                Some(task) if task.lease.is_some() => {
                    task.cancel_requested = true;
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if !leased {
                self.remove_task(seq);
            }
        }
    }

    fn schedule_timer(&mut self, timer: TimerEntry) {
        let key = (timer.instance.clone(), timer.purpose.clone());
        if let Some(old) = self.timer_keys.remove(&key) {
            self.timer_entries.remove(&old);
        }
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.timer_heap.push(Reverse((timer.fire_at, seq)));
        self.timer_entries.insert(seq, timer);
        self.timer_keys.insert(key, seq);
    }

    fn cancel_timer(&mut self, instance: &InstanceRef, purpose: TimerPurpose) {
        if let Some(seq) = self.timer_keys.remove(&(instance.clone(), purpose)) {
            self.timer_entries.remove(&seq);
        }
    }

    fn pop_due_timers(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while due.len() < limit {
            let Some(Reverse((fire_at, seq))) = self.timer_heap.peek().copied() else {
                break;
            };
            if !self.timer_entries.contains_key(&seq) {
                self.timer_heap.pop();
                continue;
            }
            if fire_at > now {
                break;
            }
            self.timer_heap.pop();
            if let Some(entry) = self.timer_entries.remove(&seq) {
                self.timer_keys
                    .remove(&(entry.instance.clone(), entry.purpose.clone()));
                due.push(entry);
            }
        }
        due
    }

    fn next_timer_at(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((fire_at, seq))) = self.timer_heap.peek().copied() {
            if self.timer_entries.contains_key(&seq) {
                return Some(fire_at);
            }
            self.timer_heap.pop();
        }
        None
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// All state lives behind a single lock, which makes every commit atomic
/// and linearizable. Long polls park on a [`Notify`] that is woken on every
/// enqueue or release.
///
/// # Example
///
/// ```
/// use waypoint_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    inner: RwLock<Inner>,
    task_notify: Notify,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            task_notify: Notify::new(),
        }
    }

    /// Get the number of workflow runs
    pub fn workflow_count(&self) -> usize {
        self.inner.read().instances.len()
    }

    /// Get the number of tasks not currently leased
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.lease.is_none())
            .count()
    }

    /// Get the number of live timers
    pub fn timer_count(&self) -> usize {
        self.inner.read().timer_entries.len()
    }

    /// Clear all data
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            inner.check_can_start(&instance, None)?;
            inner.create(instance, Utc::now());
        }
        self.task_notify.notify_waiters();
        Ok(())
    }

    async fn get_instance(&self, instance: &InstanceRef) -> Result<WorkflowInstance, StoreError> {
        Ok(self.inner.read().record(instance)?.info.clone())
    }

    async fn current_run(&self, workflow_id: &str) -> Result<WorkflowInstance, StoreError> {
        let inner = self.inner.read();
        let run_id = inner
            .current_runs
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        Ok(inner
            .record(&InstanceRef::new(workflow_id, *run_id))?
            .info
            .clone())
    }

    async fn read_events(
        &self,
        instance: &InstanceRef,
        from_version: u64,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let inner = self.inner.read();
        let record = inner.record(instance)?;
        let start = (from_version as usize).min(record.events.len());
        Ok(record.events[start..].to_vec())
    }

    async fn history_version(&self, instance: &InstanceRef) -> Result<u64, StoreError> {
        Ok(self.inner.read().record(instance)?.events.len() as u64)
    }

    async fn commit(
        &self,
        instance: &InstanceRef,
        expected_version: u64,
        commit: Commit,
    ) -> Result<u64, StoreError> {
        let version = self
            .inner
            .write()
            .commit(instance, expected_version, commit, Utc::now())?;
        self.task_notify.notify_waiters();
        Ok(version)
    }

    async fn enqueue_task(&self, task: NewTask) -> Result<Option<Uuid>, StoreError> {
        let task_id = self.inner.write().enqueue(task, Utc::now());
        self.task_notify.notify_waiters();
        Ok(task_id)
    }

    async fn poll_task(&self, request: &PollRequest) -> Result<Option<LeasedTask>, StoreError> {
        let deadline = tokio::time::Instant::now() + request.long_poll_timeout;

        loop {
            let notified = self.task_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_available = match self.inner.write().try_claim(request, Utc::now()) {
                Ok(task) => return Ok(Some(task)),
                Err(next) => next,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(at) = next_available {
                let until = duration::until(at, Utc::now()).max(Duration::from_millis(1));
                wait = wait.min(until);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn complete_task(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let (seq, _) = inner.leased_task_mut(task_id, lease_token)?;
        inner.remove_task(seq);
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        reason: &str,
        retry_after: Duration,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.inner.write();
            let inner = &mut *guard;
            let now = Utc::now();
            let (seq, task) = inner.leased_task_mut(task_id, lease_token)?;
            task.lease = None;
            task.visible_at = duration::add(now, retry_after);
            task.last_error = Some(reason.to_string());
            let workflow_instance = match &task.payload {
                TaskPayload::Workflow { instance, .. } => Some(instance.clone()),
                TaskPayload::Activity { .. } => None,
            };

            // Another pending workflow task for the run already covers this one
            if let Some(instance) = workflow_instance {
                let duplicate = inner
                    .tasks
                    .iter()
                    .any(|(s, t)| *s != seq && t.is_pending_workflow_task_for(&instance));
                if duplicate {
                    inner.remove_task(seq);
                }
            }
        }
        self.task_notify.notify_waiters();
        Ok(())
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut inner = self.inner.write();
        let (_, task) = inner.leased_task_mut(task_id, lease_token)?;
        let should_cancel = task.cancel_requested;
        if let Some(lease) = task.lease.as_mut() {
            lease.expires_at = duration::add(Utc::now(), extension);
        }
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel,
        })
    }

    async fn pop_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerEntry>, StoreError> {
        Ok(self.inner.write().pop_due_timers(now, limit))
    }

    async fn schedule_timer(&self, timer: TimerEntry) -> Result<(), StoreError> {
        self.inner.write().schedule_timer(timer);
        Ok(())
    }

    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.write().next_timer_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn poll(queue: &str, kind: TaskKind) -> PollRequest {
        PollRequest {
            task_queue: queue.to_string(),
            kind,
            types: vec![],
            worker_id: "worker-1".to_string(),
            lease_duration: Duration::from_secs(30),
            long_poll_timeout: Duration::ZERO,
        }
    }

    async fn start(store: &InMemoryWorkflowEventStore, workflow_id: &str) -> InstanceRef {
        let new = NewInstance::new(workflow_id, "order", "default", serde_json::json!({"n": 1}));
        let id = new.id.clone();
        store.create_instance(new).await.unwrap();
        id
    }

    fn activity_task(instance: &InstanceRef, activity_id: &str) -> NewTask {
        NewTask {
            task_queue: "default".into(),
            payload: TaskPayload::Activity {
                instance: instance.clone(),
                activity_id: activity_id.into(),
                activity_type: "charge".into(),
                input: serde_json::json!({}),
                options: Default::default(),
                attempt: 1,
            },
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "order-1").await;

        let info = store.get_instance(&id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(info.history_length, 1);

        let current = store.current_run("order-1").await.unwrap();
        assert_eq!(current.id, id);

        let events = store.read_events(&id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, 1);
        assert!(matches!(events[0].event, WorkflowEvent::WorkflowStarted { .. }));

        // First workflow task is queued
        let task = store.poll_task(&poll("default", TaskKind::Workflow)).await.unwrap();
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        start(&store, "order-1").await;

        let again = NewInstance::new("order-1", "order", "default", serde_json::json!({}));
        let result = store.create_instance(again).await;
        assert!(matches!(result, Err(StoreError::AlreadyStarted { .. })));
    }

    #[tokio::test]
    async fn test_append_and_read_events() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;

        let version = store
            .append_events(
                &id,
                1,
                vec![
                    WorkflowEvent::TimerFired {
                        timer_id: "a".into(),
                    },
                    WorkflowEvent::TimerFired {
                        timer_id: "b".into(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(version, 3);

        let tail = store.read_events(&id, 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_id, 3);
        assert_eq!(store.history_version(&id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;

        let result = store
            .append_events(
                &id,
                0,
                vec![WorkflowEvent::TimerFired {
                    timer_id: "t".into(),
                }],
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_racing_appends_exactly_one_wins() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let id = start(&store, "wf").await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_events(
                        &id,
                        1,
                        vec![WorkflowEvent::TimerFired {
                            timer_id: format!("t{}", i),
                        }],
                    )
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(store.history_version(&id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_appends() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;

        let commit = Commit {
            events: vec![WorkflowEvent::WorkflowCompleted {
                result: serde_json::json!(1),
            }],
            close: Some(CloseRecord {
                status: WorkflowStatus::Completed,
                result: Some(serde_json::json!(1)),
                error: None,
            }),
            ..Default::default()
        };
        store.commit(&id, 1, commit).await.unwrap();

        let info = store.get_instance(&id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert!(info.close_time.is_some());

        let result = store
            .append_events(&id, 2, vec![WorkflowEvent::WorkflowTimedOut])
            .await;
        assert!(matches!(result, Err(StoreError::InstanceClosed(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        start(&store, "child").await;

        let commit = Commit {
            events: vec![WorkflowEvent::TimerFired {
                timer_id: "t".into(),
            }],
            tasks: vec![activity_task(&id, "a")],
            new_instances: vec![NewInstance::new(
                "child",
                "order",
                "default",
                serde_json::json!({}),
            )],
            ..Default::default()
        };
        let result = store.commit(&id, 1, commit).await;
        assert!(matches!(result, Err(StoreError::AlreadyStarted { .. })));
        assert_eq!(store.history_version(&id).await.unwrap(), 1);
        assert!(store
            .poll_task(&poll("default", TaskKind::Activity))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();

        let task = store
            .poll_task(&poll("default", TaskKind::Activity))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.delivery_count, 1);

        // Leased tasks are invisible to other pollers
        assert!(store
            .poll_task(&poll("default", TaskKind::Activity))
            .await
            .unwrap()
            .is_none());

        let hb = store
            .heartbeat_task(task.task_id, task.lease_token, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(hb.accepted);
        assert!(!hb.should_cancel);

        store
            .complete_task(task.task_id, task.lease_token)
            .await
            .unwrap();
        let again = store.complete_task(task.task_id, task.lease_token).await;
        assert!(matches!(again, Err(StoreError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_type_filter() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();

        let mut request = poll("default", TaskKind::Activity);
        request.types = vec!["refund".into()];
        assert!(store.poll_task(&request).await.unwrap().is_none());

        request.types = vec!["charge".into()];
        assert!(store.poll_task(&request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();

        let mut request = poll("default", TaskKind::Activity);
        request.lease_duration = Duration::from_millis(20);
        let first = store.poll_task(&request).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = store.poll_task(&request).await.unwrap().unwrap();
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(second.delivery_count, 2);

        // The stale holder lost its lease
        let result = store.complete_task(first.task_id, first.lease_token).await;
        assert!(matches!(result, Err(StoreError::LeaseLost(_))));
        store
            .complete_task(second.task_id, second.lease_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fail_task_delays_redelivery() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();

        let request = poll("default", TaskKind::Activity);
        let task = store.poll_task(&request).await.unwrap().unwrap();
        store
            .fail_task(task.task_id, task.lease_token, "boom", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.poll_task(&request).await.unwrap().is_none());
        assert_eq!(store.pending_task_count(), 2);
    }

    #[tokio::test]
    async fn test_pending_workflow_task_dedupe() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;

        let again = store
            .enqueue_task(NewTask::workflow("default", id.clone(), "order"))
            .await
            .unwrap();
        assert!(again.is_none());

        // Once claimed, a new pending task may be queued
        store
            .poll_task(&poll("default", TaskKind::Workflow))
            .await
            .unwrap()
            .unwrap();
        let next = store
            .enqueue_task(NewTask::workflow("default", id, "order"))
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let id = start(&store, "wf").await;

        let poller = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut request = poll("default", TaskKind::Activity);
                request.long_poll_timeout = Duration::from_secs(5);
                store.poll_task(&request).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();

        let task = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(task.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_activity_flags_lease() {
        let store = InMemoryWorkflowEventStore::new();
        let id = start(&store, "wf").await;
        store.enqueue_task(activity_task(&id, "a")).await.unwrap();
        let task = store
            .poll_task(&poll("default", TaskKind::Activity))
            .await
            .unwrap()
            .unwrap();

        let commit = Commit {
            events: vec![WorkflowEvent::ActivityCancelled {
                activity_id: "a".into(),
            }],
            cancelled_activities: vec!["a".into()],
            ..Default::default()
        };
        store.commit(&id, 1, commit).await.unwrap();

        let hb = store
            .heartbeat_task(task.task_id, task.lease_token, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(hb.should_cancel);
    }

    #[tokio::test]
    async fn test_notification_reaches_running_target() {
        let store = InMemoryWorkflowEventStore::new();
        let parent = start(&store, "parent").await;
        let child = start(&store, "child").await;

        let commit = Commit {
            notifications: vec![Notification {
                target: parent.clone(),
                event: WorkflowEvent::ChildWorkflowCompleted {
                    workflow_id: "child".into(),
                    run_id: child.run_id,
                    result: serde_json::json!(42),
                },
            }],
            ..Default::default()
        };
        store.commit(&child, 1, commit).await.unwrap();

        let events = store.read_events(&parent, 1).await.unwrap();
        assert!(matches!(
            events[0].event,
            WorkflowEvent::ChildWorkflowCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_timer_heap_order_and_cancel() {
        let store = InMemoryWorkflowEventStore::new();
        let id = InstanceRef::new("wf", Uuid::now_v7());
        let now = Utc::now();

        for (secs, name) in [(3, "c"), (1, "a"), (2, "b")] {
            store
                .schedule_timer(TimerEntry::new(
                    id.clone(),
                    now + chrono::Duration::seconds(secs),
                    TimerPurpose::WorkflowTimer {
                        timer_id: name.into(),
                    },
                ))
                .await
                .unwrap();
        }
        {
            store.inner.write().cancel_timer(
                &id,
                TimerPurpose::WorkflowTimer {
                    timer_id: "b".into(),
                },
            );
        }

        assert_eq!(
            store.next_timer_at().await.unwrap(),
            Some(now + chrono::Duration::seconds(1))
        );

        let due = store
            .pop_due_timers(now + chrono::Duration::seconds(10), 10)
            .await
            .unwrap();
        let names: Vec<_> = due
            .iter()
            .map(|t| match &t.purpose {
                TimerPurpose::WorkflowTimer { timer_id } => timer_id.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(store.timer_count(), 0);
        assert_eq!(store.next_timer_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_execution_timeout_timer_armed() {
        let store = InMemoryWorkflowEventStore::new();
        let new = NewInstance::new("wf", "order", "default", serde_json::json!({})).with_options(
            crate::workflow::WorkflowOptions::default()
                .with_execution_timeout(Duration::from_secs(60)),
        );
        store.create_instance(new).await.unwrap();
        assert_eq!(store.timer_count(), 1);
    }
}
