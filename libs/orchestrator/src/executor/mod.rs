//! Step Executor Registry and Workflow Executor: dispatching
//! a rendered step to its typed handler, and running a whole workflow
//! instance against a resolved definition.

pub mod builtin;
pub mod handlers;
pub mod workflow_executor;

pub use handlers::{HandlerError, HandlerRegistry, StepHandler, StepInvocation, StepOutcome};
pub use workflow_executor::{WorkflowExecutor, WorkflowExecutorError};
