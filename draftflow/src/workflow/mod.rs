//! Stage declarations and the validated workflow graph.

mod builder;
mod graph;
mod stage;
mod templates;

pub use builder::WorkflowBuilder;
pub use graph::{Workflow, WorkflowDefinition};
pub use stage::{is_valid_name, Stage};
pub use templates::{WorkflowCatalog, DEFAULT_TEMPLATE};
