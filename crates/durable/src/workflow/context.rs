//! Deterministic context handed to workflow handlers

use std::cell::Cell;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::InstanceRef;

/// Read-only view of the run a handler is executing in
///
/// Everything here is derived from history, so replays observe the same
/// values as the original execution.
#[derive(Debug)]
pub struct WorkflowContext {
    instance: InstanceRef,
    workflow_type: String,
    attempt: u32,
    event_id: u64,
    now: DateTime<Utc>,
    replaying: bool,
    uuid_seq: Cell<u64>,
}

impl WorkflowContext {
    pub(crate) fn new(
        instance: InstanceRef,
        workflow_type: impl Into<String>,
        attempt: u32,
        event_id: u64,
        now: DateTime<Utc>,
        replaying: bool,
    ) -> Self {
        Self {
            instance,
            workflow_type: workflow_type.into(),
            attempt,
            event_id,
            now,
            replaying,
            uuid_seq: Cell::new(0),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.instance.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.instance.run_id
    }

    pub fn instance(&self) -> &InstanceRef {
        &self.instance
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Run attempt (1 for the first run, incremented by workflow retries)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Id of the history event being applied
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Timestamp of the history event being applied
    ///
    /// Use this instead of the system clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True while re-applying events that an earlier workflow task already decided on
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Deterministic UUID, stable across replays
    pub fn new_uuid(&self) -> Uuid {
        let seq = self.uuid_seq.get();
        self.uuid_seq.set(seq + 1);
        let name = format!("{}:{}", self.event_id, seq);
        Uuid::new_v5(&self.instance.run_id, name.as_bytes())
    }
}
