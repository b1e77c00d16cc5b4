//! Workflow execution engine.
//!
//! `WorkflowExecutor` is the central orchestrator:
//! 1. Plans the workflow graph (validation plus a deterministic order).
//! 2. Iterates through nodes in order, dispatching each via `ExecutableNode`.
//! 3. Feeds entry nodes the trigger event and every other node its parents'
//!    output (an array when there are several parents).
//! 4. Keeps a per-node record of every execution in memory.
//! 5. Handles `NodeError::Retryable` (up to `max_retries`) and
//!    `NodeError::Fatal` (abort immediately).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use nodes::json_value::JSON_VALUE_NODE_TYPE;
use nodes::{ExecutableNode, ExecutionContext, JsonValueNode, NodeError};

use crate::plan::{plan, PlannedNode};
use crate::{EngineError, Workflow};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable node failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Node registry
// ---------------------------------------------------------------------------

/// Maps `node_type` strings to boxed `ExecutableNode` implementations.
pub type NodeRegistry = HashMap<String, Arc<dyn ExecutableNode>>;

/// Registry with every built-in node type.
pub fn default_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.insert(
        JSON_VALUE_NODE_TYPE.to_owned(),
        Arc::new(JsonValueNode) as Arc<dyn ExecutableNode>,
    );
    registry
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
        })
    }
}

/// What happened to one node during one execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: NodeStatus,
    /// Number of `execute` calls, retries included.
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The result of running a full workflow.
///
/// A node failure does not discard the run: the failed node's record is
/// kept and `status` is [`NodeStatus::Failed`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: NodeStatus,
    /// Output of the last node in plan order, or the event itself for a
    /// workflow without nodes. `Null` after a failure.
    pub output: Value,
    /// One record per executed node, in execution order.
    pub records: Vec<NodeRecord>,
    /// Why the run stopped, when it failed.
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeRecord> {
        self.records.iter().find(|record| record.node_id == node_id)
    }

    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.record(node_id).and_then(|record| record.output.as_ref())
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Stateless orchestrator that runs workflow executions.
///
/// Construct one executor per process and call [`WorkflowExecutor::run`]
/// once per trigger event.
pub struct WorkflowExecutor {
    registry: NodeRegistry,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor.
    pub fn new(registry: NodeRegistry, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    /// Run the workflow on one trigger event and return every node's record.
    ///
    /// # Errors
    /// Returns `EngineError` when the workflow cannot run at all: planning
    /// failures or a node type missing from the registry. Node failures are
    /// reported through [`ExecutionResult::status`].
    #[instrument(skip(self, workflow, event), fields(workflow_id = %workflow.id))]
    pub async fn run(
        &self,
        workflow: &Workflow,
        event: Value,
    ) -> Result<ExecutionResult, EngineError> {
        let plan = plan(workflow)?;

        let mut steps = Vec::with_capacity(plan.len());
        for step in &plan.steps {
            let node_def = workflow.node(&step.id).ok_or_else(|| EngineError::UnknownNodeReference {
                node_id: step.id.clone(),
                side: "plan",
            })?;
            let node_impl = self.registry.get(&node_def.node_type).ok_or_else(|| {
                EngineError::UnknownNodeType {
                    node_id: step.id.clone(),
                    node_type: node_def.node_type.clone(),
                }
            })?;
            steps.push((step, node_def, node_impl));
        }

        let execution_id = Uuid::new_v4();
        info!(%execution_id, "executing {} nodes in order: {:?}", plan.len(), plan.order());

        let mut outputs: HashMap<&str, Value> = HashMap::with_capacity(plan.len());
        let mut records = Vec::with_capacity(plan.len());
        let mut last_output = event.clone();

        for (step, node_def, node_impl) in steps {
            let input = Self::input_for(step, &event, &outputs);
            let ctx = ExecutionContext {
                workflow_id: workflow.id,
                execution_id,
                node_id: step.id.clone(),
                event: event.clone(),
                parameters: node_def.config.clone(),
            };

            let started_at = Utc::now();
            let (result, attempts) = self
                .execute_with_retry(&step.id, node_impl.as_ref(), input.clone(), &ctx)
                .await;

            match result {
                Ok(output) => {
                    info!("node '{}' succeeded", step.id);
                    records.push(NodeRecord {
                        node_id: step.id.clone(),
                        input,
                        output: Some(output.clone()),
                        status: NodeStatus::Succeeded,
                        attempts,
                        error: None,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    last_output = output.clone();
                    outputs.insert(step.id.as_str(), output);
                }

                Err(engine_err) => {
                    error!("node '{}' failed: {}", step.id, engine_err);
                    let message = engine_err.to_string();
                    records.push(NodeRecord {
                        node_id: step.id.clone(),
                        input,
                        output: None,
                        status: NodeStatus::Failed,
                        attempts,
                        error: Some(message.clone()),
                        started_at,
                        finished_at: Utc::now(),
                    });
                    return Ok(ExecutionResult {
                        execution_id,
                        status: NodeStatus::Failed,
                        output: Value::Null,
                        records,
                        error: Some(message),
                    });
                }
            }
        }

        info!("workflow '{}' execution {} succeeded", workflow.id, execution_id);

        Ok(ExecutionResult {
            execution_id,
            status: NodeStatus::Succeeded,
            output: last_output,
            records,
            error: None,
        })
    }

    /// Entry nodes get the event; others get their parents' output.
    fn input_for(step: &PlannedNode, event: &Value, outputs: &HashMap<&str, Value>) -> Value {
        let parent_output = |id: &String| outputs.get(id.as_str()).cloned().unwrap_or(Value::Null);
        match step.parents.as_slice() {
            [] => event.clone(),
            [single] => parent_output(single),
            many => Value::Array(many.iter().map(parent_output).collect()),
        }
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single node with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        node_id: &str,
        node: &dyn ExecutableNode,
        input: Value,
        ctx: &ExecutionContext,
    ) -> (Result<Value, EngineError>, u32) {
        let mut retries = 0u32;

        loop {
            match node.execute(input.clone(), ctx).await {
                Ok(output) => return (Ok(output), retries + 1),

                Err(NodeError::Fatal(msg)) => {
                    let err = EngineError::NodeFatal {
                        node_id: node_id.to_owned(),
                        message: msg,
                    };
                    return (Err(err), retries + 1);
                }

                Err(NodeError::Retryable(msg)) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        let err = EngineError::NodeRetryExhausted {
                            node_id: node_id.to_owned(),
                            message: msg,
                        };
                        return (Err(err), retries);
                    }

                    let delay = self.config.retry_base_delay
                        * 2u32.pow(retries.saturating_sub(1));

                    warn!(
                        "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        node_id, retries, self.config.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
