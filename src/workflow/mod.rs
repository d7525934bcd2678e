//! Workflow graph: explicit state, pure node transforms, the executor that
//! walks the fixed node sequence, and history-based resume.

pub mod executor;
pub mod node;
pub mod resume;
pub mod state;

pub use executor::{
    DEFAULT_MAX_ITERATIONS, ExecutionResult, ExecutorInput, NoopObserver, Outcome, StepObserver,
    WorkflowExecutor,
};
pub use resume::resolve_next_node;
pub use state::{StatePatch, WorkflowState, reduce};
