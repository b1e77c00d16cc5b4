//! The seam between the trigger and the workflow host.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{DecodedMessage, TriggerError};

/// Key-value store scoped to one workflow, shared across its executions.
///
/// The host decides how (and whether) it is persisted.
pub trait StaticDataStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str) -> Option<Value>;
    fn keys(&self) -> Vec<String>;
}

/// In-memory [`StaticDataStore`]. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStaticData {
    entries: Arc<Mutex<Map<String, Value>>>,
}

impl MemoryStaticData {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries as one JSON object.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StaticDataStore for MemoryStaticData {
    fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.lock().insert(key.to_owned(), value);
    }

    fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// What the trigger needs from the host workflow system.
#[async_trait]
pub trait HostBridge: Send + Sync {
    /// Hand one decoded inbound frame to the workflow.
    ///
    /// Called once per frame, in arrival order, from a task of its own. The
    /// next frame is not handed over until this returns. While it runs the
    /// host may still send on the same connection and await its replies.
    /// Once a bounded backlog builds up the connection stops reading, so a
    /// slow host slows the socket rather than losing frames.
    async fn emit(&self, message: DecodedMessage);

    /// Report a non-fatal error (transport error, abnormal close, script fault).
    fn emit_error(&self, error: TriggerError);

    /// Read-only node configuration, as exposed to the open-script.
    fn parameter(&self, name: &str) -> Option<Value>;

    /// The workflow-scoped store exposed to the open-script.
    fn static_data(&self) -> Arc<dyn StaticDataStore>;
}
