//! Per-operation gateway errors.
//!
//! Each error enum corresponds to one family of [`crate::repo::traits`]
//! operations and carries only the failure modes that operation can
//! actually produce: validation/conflict variants surface to the caller
//! unchanged, `InvalidTransition` is retried by the engine on the next
//! tick, and everything else collapses to the enum's own `Database`
//! variant, which the engine also retries.

use innominatus_domain::{ResourceId, ResourceState, WorkflowExecutionId};
use thiserror::Error;

/// Errors from [`crate::repo::traits::PersistenceGateway::upsert_application`].
#[derive(Debug, Error)]
pub enum UpsertApplicationError {
    #[error("application name must be a lowercase DNS label: {0}")]
    InvalidName(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("graph upsert failed: {0}")]
    Graph(#[source] GraphError),
}

/// Errors from resource-creation and -lookup operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("application not found: {0}")]
    ApplicationNotFound(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
    #[error("graph upsert failed: {0}")]
    Graph(#[source] GraphError),
}

/// Errors from leasing and binding a resource to an execution.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("transition from {from:?} to {to:?} is not in the allowed transition table")]
    InvalidTransition {
        from: ResourceState,
        to: ResourceState,
    },
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("resource already has an in-flight execution: {0}")]
    AlreadyLeased(ResourceId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

/// Errors from workflow/step execution bookkeeping.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(WorkflowExecutionId),
    #[error("execution {0} is already in a terminal state")]
    AlreadyTerminal(WorkflowExecutionId),
    #[error("step execution not found")]
    StepNotFound,
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

/// Errors from graph node/edge persistence.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid edge endpoints for {0:?}")]
    InvalidEndpoints(innominatus_domain::EdgeType),
    #[error("node not found for key: {0}")]
    NodeNotFound(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for UpsertApplicationError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<sqlx::Error> for ResourceError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<sqlx::Error> for TransitionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<sqlx::Error> for ExecutionError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<sqlx::Error> for GraphError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

impl From<GraphError> for UpsertApplicationError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<GraphError> for ResourceError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}
