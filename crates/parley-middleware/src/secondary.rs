//! Secondary lookup dispatch.
//!
//! Some turns resolve to a structured task for an external service (find an
//! object, query an inventory API) rather than speech. The dialogue engine
//! emits a [`LookupTask`] naming the API; this module routes it to the
//! registered handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use parley_types::LookupTask;

use crate::media::MediaError;

/// One secondary lookup backend.
#[async_trait]
pub trait SecondaryLookup: Send + Sync {
    /// Execute the task and return a human-readable result for the user.
    async fn perform(&self, task: &LookupTask) -> Result<String, MediaError>;
}

/// Handlers keyed by the `api_name` a task carries.
#[derive(Default)]
pub struct LookupRegistry {
    handlers: HashMap<String, Arc<dyn SecondaryLookup>>,
}

impl LookupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an API name, replacing any previous one.
    pub fn register(&mut self, api_name: impl Into<String>, handler: Arc<dyn SecondaryLookup>) {
        self.handlers.insert(api_name.into(), handler);
    }

    /// Route a task to its handler.
    pub async fn dispatch(&self, task: &LookupTask) -> Result<String, MediaError> {
        match self.handlers.get(&task.api_name) {
            Some(handler) => handler.perform(task).await,
            None => {
                warn!(api = %task.api_name, "no handler for lookup task");
                Err(MediaError::Provider(format!(
                    "no handler registered for api '{}'",
                    task.api_name
                )))
            }
        }
    }
}
