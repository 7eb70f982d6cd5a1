//! Activity registry mapping activity types to handlers

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Boxed future returned by an activity handler
pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send>>;

/// Type-erased activity handler working on JSON input and output
pub type ActivityHandler = Arc<dyn Fn(Arc<ActivityContext>, Value) -> ActivityFuture + Send + Sync>;

/// Registry of activity handlers
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed activity
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(
            move |ctx: Arc<ActivityContext>, input: Value| -> ActivityFuture {
                let activity = activity.clone();
                Box::pin(async move {
                    let input: A::Input = serde_json::from_value(input)?;
                    let output = activity.execute(&ctx, input).await?;
                    Ok::<Value, ActivityError>(serde_json::to_value(output)?)
                })
            },
        );
        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    /// Register a JSON closure under `activity_type`
    ///
    /// ```ignore
    /// registry.register_fn("double", |_ctx, input| async move {
    ///     let n = input.as_i64().unwrap_or(0);
    ///     Ok(json!(n * 2))
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, f: F)
    where
        F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler =
            Arc::new(move |ctx: Arc<ActivityContext>, input: Value| -> ActivityFuture {
                Box::pin(f(ctx, input))
            });
        self.handlers.insert(activity_type.into(), handler);
    }

    /// Look up the handler for `activity_type`
    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    /// Get the number of registered activity types
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered activity types, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}
