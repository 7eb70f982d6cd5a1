//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External message delivered into a running workflow
///
/// Signals are appended to history as soon as they are sent, whether or not
/// the workflow is waiting for them, and are handed to `on_signal` in the
/// order they were recorded. The history `event_id` of the `SignalReceived`
/// event is the signal's delivery order.
///
/// # Example
///
/// ```ignore
/// client
///     .signal_workflow("order-42", "approve", json!({ "by": "alice" }))
///     .await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name
    pub name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed value
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
