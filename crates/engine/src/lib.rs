//! `engine` crate: workflow models, execution planning, the executor, and
//! the bridge that feeds socket trigger events into workflow runs.

pub mod models;
pub mod error;
pub mod plan;
pub mod executor;
pub mod bridge;

pub use models::{Workflow, NodeDefinition, Edge};
pub use error::EngineError;
pub use plan::{plan, ExecutionPlan, PlannedNode};
pub use executor::{default_registry, ExecutionResult, ExecutorConfig, NodeRecord, NodeRegistry, NodeStatus, WorkflowExecutor};
pub use bridge::{WorkflowActivity, WorkflowBridge, MAX_RECORDED_ERRORS};
