//! `nodes` crate: the `ExecutableNode` trait and built-in node implementations.
//!
//! Every node a workflow runs after its socket trigger fires must implement
//! [`ExecutableNode`]. The engine crate dispatches execution through this
//! trait object.

pub mod error;
pub mod traits;
pub mod json_value;
pub mod mock;

pub use error::NodeError;
pub use json_value::JsonValueNode;
pub use traits::{ExecutableNode, ExecutionContext};
