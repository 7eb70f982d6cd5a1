//! Activity execution context

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::persistence::InstanceRef;

/// Payload sent with heartbeats
#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    /// Optional progress details
    pub details: Option<serde_json::Value>,
}

/// Error from heartbeat operations
#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Heartbeat channel closed (attempt already finished or timed out)
    #[error("heartbeat channel closed")]
    ChannelClosed,

    /// Activity was cancelled
    #[error("activity was cancelled")]
    Cancelled,
}

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - Heartbeat functionality for long-running activities
/// - Cancellation detection
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     for i in 0..100 {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::cancelled());
///         }
///
///         do_work(i).await?;
///
///         ctx.heartbeat(Some(json!({"progress": i}))).await?;
///     }
///
///     Ok(Output { ... })
/// }
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed (0 = unlimited)
    pub max_attempts: u32,

    /// Workflow run that owns this activity
    pub instance: InstanceRef,

    /// Activity ID within the workflow
    pub activity_id: String,

    /// Heartbeat sender
    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(instance: InstanceRef, activity_id: String, attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            instance,
            activity_id,
            heartbeat_tx: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Create a context with heartbeat support
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Share an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.instance.workflow_id
    }

    /// Token that is cancelled when the workflow cancels this activity
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Record a heartbeat
    ///
    /// Heartbeats keep the attempt alive past `heartbeat_timeout` and are
    /// recorded in workflow history with their progress details.
    ///
    /// # Errors
    ///
    /// Returns an error if the activity has been cancelled or the
    /// heartbeat channel is closed.
    pub async fn heartbeat(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }

        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details })
                .await
                .map_err(|_| HeartbeatError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => return Err(ActivityError::cancelled()),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(attempt: u32, max_attempts: u32) -> ActivityContext {
        ActivityContext::new(
            InstanceRef::new("wf-1", Uuid::now_v7()),
            "step-1".to_string(),
            attempt,
            max_attempts,
        )
    }

    #[test]
    fn test_activity_context_creation() {
        let ctx = context(1, 3);

        assert_eq!(ctx.workflow_id(), "wf-1");
        assert_eq!(ctx.activity_id, "step-1");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        assert!(context(3, 3).is_last_attempt());
        assert!(!context(2, 3).is_last_attempt());
        assert!(!context(50, 0).is_last_attempt());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let ctx = context(1, 3);
        let token = ctx.cancellation_token();

        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());

        // Resolves immediately once cancelled
        ctx.cancelled().await;

        let result = ctx.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::Cancelled)));
    }

    #[tokio::test]
    async fn test_heartbeat_with_channel() {
        let (tx, mut rx) = mpsc::channel(10);
        let ctx = context(1, 3).with_heartbeat(tx);

        ctx.heartbeat(Some(serde_json::json!({"progress": 50})))
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(payload.details.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_after_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ctx = context(1, 3).with_heartbeat(tx);

        let result = ctx.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::ChannelClosed)));
    }
}
