//! Engine-level error types.

use thiserror::Error;
use trigger::TriggerError;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the workflow.
    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,

    /// The trigger parameters do not describe a usable socket trigger.
    #[error("invalid trigger configuration: {0}")]
    Trigger(#[from] TriggerError),

    // ------ Execution errors ------

    /// No implementation is registered for a node's type.
    #[error("node '{node_id}' has unknown node_type '{node_type}'")]
    UnknownNodeType {
        node_id: String,
        node_type: String,
    },

    /// A node failed with a fatal error; the whole execution is aborted.
    #[error("node '{node_id}' failed fatally: {message}")]
    NodeFatal {
        node_id: String,
        message: String,
    },

    /// A node's retryable error was exhausted.
    #[error("node '{node_id}' exceeded retry limit: {message}")]
    NodeRetryExhausted {
        node_id: String,
        message: String,
    },
}
