//! All enum types for the innominatus orchestration core
//!
//! These enums are the source of truth and must match the SQL enum types exactly.

use serde::{Deserialize, Serialize};

// =============================================================================
// Resource Lifecycle
// =============================================================================

/// Lifecycle state of a resource instance.
///
/// The allowed transition table lives in the orchestrator crate's resource
/// state machine, not here — this type is the pure data representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "resource_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Requested,
    Provisioning,
    Active,
    Updating,
    Terminating,
    Terminated,
    Failed,
}

/// The intent applied to a resource: what the next workflow run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "desired_operation", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DesiredOperation {
    Create,
    Update,
    Delete,
}

// =============================================================================
// Workflow Execution
// =============================================================================

/// Status of a workflow execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses can never be followed by another state-changing write.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled
        )
    }
}

/// Status of a single step execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepExecutionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Category of a parsed workflow definition.
///
/// A `Provisioner` workflow is reachable through the resolver for a
/// `(resource_type, operation)` pair; a `GoldenPath` workflow is only ever
/// invoked explicitly and is never returned by `Resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "workflow_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    Provisioner,
    Goldenpath,
}

// =============================================================================
// Graph
// =============================================================================

/// Type of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "graph_node_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Team,
    Application,
    Spec,
    Resource,
    Provider,
    Workflow,
    Step,
}

/// Type of a graph edge. Each variant has a fixed, validated
/// `(from_node_type, to_node_type)` pair enforced by
/// [`crate::graph::EdgeType::valid_endpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "graph_edge_type", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum EdgeType {
    Owns,
    HasSpec,
    Contains,
    Requires,
    Executes,
    Triggers,
}
