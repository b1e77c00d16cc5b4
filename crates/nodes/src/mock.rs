//! `MockNode`: a test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::{ExecutableNode, ExecutionContext, NodeError};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value merged with `{"node": name}`.
    ReturnValue(Value),
    /// Echo the input back under `{"node": name, "input": ...}`.
    Echo,
    /// Fail with a `Retryable` error for the first `n` calls, then succeed.
    FlakyThenReturn(u32, Value),
    /// Fail with a `Fatal` error.
    FailFatal(String),
}

/// A mock node that records every input it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    failures: AtomicU32,
}

impl MockNode {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: AtomicU32::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that passes its input through.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Echo)
    }

    /// Create a mock that fails retryably `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with(name, MockBehaviour::FlakyThenReturn(failures, value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn tagged(&self, value: &Value) -> Value {
        let mut out = json!({ "node": self.name });
        if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), value.as_object()) {
            for (k, val) in v_obj {
                out_obj.insert(k.clone(), val.clone());
            }
        }
        out
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(&self, input: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        self.calls.lock().unwrap().push(input.clone());

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.tagged(v)),
            MockBehaviour::Echo => Ok(json!({ "node": self.name, "input": input })),
            MockBehaviour::FlakyThenReturn(limit, v) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < *limit {
                    Err(NodeError::Retryable(format!("{} not ready yet", self.name)))
                } else {
                    Ok(self.tagged(v))
                }
            }
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
        }
    }
}
