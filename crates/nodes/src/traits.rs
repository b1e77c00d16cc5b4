//! The `ExecutableNode` trait: the contract every node must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::NodeError;

/// Context handed to a node for one execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run (one per emitted trigger event).
    pub execution_id: Uuid,
    /// ID of the node being executed.
    pub node_id: String,
    /// The decoded trigger event that started this execution.
    pub event: Value,
    /// The node's own configuration object from the workflow definition.
    pub parameters: Value,
}

impl ExecutionContext {
    /// Read one configuration value of the executing node.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// `true` when the node is configured to turn failures into output items.
    pub fn continue_on_fail(&self) -> bool {
        self.parameter("continueOnFail")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The core node trait.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node, receive the upstream JSON output as `input`,
    /// and return this node's JSON output.
    async fn execute(
        &self,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}
