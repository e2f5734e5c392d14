//! DAG orchestration: template validation and the execution engine.

pub mod executor;
pub mod template;

pub use executor::{DagError, DagExecutor, ExecutionProgress};
pub use template::{TemplateError, dependency_graph, validate_nodes};
