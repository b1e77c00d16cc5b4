//! `JsonValueNode`: emits the JSON value held in its `expression` parameter.
//!
//! Used to inject a fixed payload into a workflow, e.g. a canned reply that
//! later nodes forward. When the node receives an array of items it produces
//! one output per item; any other input counts as a single item.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ExecutableNode, ExecutionContext, NodeError};

/// Registry name under which the engine exposes this node.
pub const JSON_VALUE_NODE_TYPE: &str = "json_value";

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValueNode;

impl JsonValueNode {
    fn item_output(ctx: &ExecutionContext) -> Result<Value, NodeError> {
        match ctx.parameter("expression") {
            Some(value) => Ok(value.clone()),
            None => {
                let message = format!("node '{}' has no 'expression' parameter", ctx.node_id);
                if ctx.continue_on_fail() {
                    Ok(json!({ "error": message }))
                } else {
                    Err(NodeError::Fatal(message))
                }
            }
        }
    }
}

#[async_trait]
impl ExecutableNode for JsonValueNode {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        match input {
            Value::Array(items) => {
                debug!("json_value node '{}' mapping {} items", ctx.node_id, items.len());
                items
                    .iter()
                    .map(|_| Self::item_output(ctx))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            _ => Self::item_output(ctx),
        }
    }
}
