//! The Persistence Gateway contract: typed CRUD plus the
//! transactional operations the reconciler and workflow executor need.
//! `PgGateway` in [`crate::repo::pg`] is the only implementation; the trait
//! exists so the orchestrator crate can be tested against an in-memory
//! fake without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use innominatus_domain::{
    Application, DesiredOperation, EdgeType, ExecutionStatus, GraphEdge, GraphNode, NodeType,
    Resource, ResourceId, ResourceState, ResourceStateTransition, StepExecution,
    StepExecutionId, StepExecutionStatus, WorkflowExecution, WorkflowExecutionId,
};

use crate::pagination::{Page, Pagination};
use crate::repo::errors::{
    ExecutionError, GraphError, ResourceError, TransitionError, UpsertApplicationError,
};

/// One row of [`PersistenceGateway::get_teams_view`]: a team and the
/// applications/resources it owns, for the graph manager's team-level
/// summary query.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TeamSummary {
    pub team: String,
    pub application_count: i64,
    pub resource_count: i64,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert or update an application, idempotently emitting its
    /// `team`/`app`/`spec` graph nodes and edges. Returns `created = true`
    /// only the first time this `name` is seen.
    async fn upsert_application(
        &self,
        name: &str,
        team: &str,
        created_by: &str,
        spec: serde_json::Value,
    ) -> Result<(Application, bool), UpsertApplicationError>;

    async fn get_application(&self, name: &str) -> Result<Option<Application>, ResourceError>;

    /// Idempotent on `(application_name, name)`.
    async fn create_resource_if_absent(
        &self,
        application_name: &str,
        name: &str,
        resource_type: &str,
        configuration: HashMap<String, serde_json::Value>,
        desired_operation: DesiredOperation,
    ) -> Result<(Resource, bool), ResourceError>;

    async fn get_resource(&self, id: ResourceId) -> Result<Option<Resource>, ResourceError>;

    async fn get_resource_by_name(
        &self,
        application_name: &str,
        name: &str,
    ) -> Result<Option<Resource>, ResourceError>;

    /// Every resource belonging to `application_name`, for building the
    /// `resources.<name>.<attr>` namespace of a workflow's interpolation
    /// context.
    async fn list_resources_for_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<Resource>, ResourceError>;

    /// Change `desired_operation` on an already-`active` resource and push
    /// it back into an in-flight state; a no-op error path for resources
    /// with no existing in-flight execution (the reconciler picks them up
    /// on the next tick via [`Self::lease_pending_resources`]).
    async fn set_desired_operation(
        &self,
        id: ResourceId,
        operation: DesiredOperation,
    ) -> Result<Resource, ResourceError>;

    /// Returns resources in `requested` with `workflow_execution_id IS
    /// NULL`, FIFO, leasing them under a transaction so concurrent
    /// pollers cannot double-lease.
    async fn lease_pending_resources(&self, limit: i64) -> Result<Vec<Resource>, ResourceError>;

    /// Atomic: binds `execution_id` to the resource and transitions its
    /// state, but only if the current `(state, operation)` pair allows it
    /// allows it, per the resource state machine's transition table;
    /// otherwise `InvalidTransitionError`.
    async fn bind_execution_to_resource(
        &self,
        resource_id: ResourceId,
        execution_id: WorkflowExecutionId,
        new_state: ResourceState,
    ) -> Result<(), TransitionError>;

    /// Clears `workflow_execution_id` and transitions to the terminal
    /// state for the operation, recording the transition in the same
    /// write.
    async fn complete_resource_transition(
        &self,
        resource_id: ResourceId,
        new_state: ResourceState,
        reason: &str,
        execution_id: Option<WorkflowExecutionId>,
    ) -> Result<(), TransitionError>;

    async fn mark_resource_failed(
        &self,
        resource_id: ResourceId,
        reason: &str,
    ) -> Result<(), TransitionError>;

    /// Resources tied to an in-flight execution.
    async fn list_provisioning_resources(&self) -> Result<Vec<Resource>, ResourceError>;

    /// Resets resources whose `workflow_execution_id` points to a missing
    /// or terminal execution, but whose own state is still in-flight, back
    /// to `requested` — or to `failed` once `orphan_retries` resets have
    /// already been spent on that resource. Returns the number
    /// of resources reset.
    async fn recover_orphans(
        &self,
        orphan_retries: u32,
        stuck_after: chrono::Duration,
    ) -> Result<usize, TransitionError>;

    async fn list_transitions(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceStateTransition>, ResourceError>;

    async fn create_workflow_execution(
        &self,
        application_name: &str,
        workflow_name: &str,
        resource_id: Option<ResourceId>,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowExecutionId, ExecutionError>;

    async fn mark_execution_running(
        &self,
        id: WorkflowExecutionId,
    ) -> Result<(), ExecutionError>;

    /// Fails if the execution is already terminal.
    async fn finalize_execution(
        &self,
        id: WorkflowExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutionError>;

    async fn get_execution(
        &self,
        id: WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, ExecutionError>;

    async fn append_step_execution(
        &self,
        execution_id: WorkflowExecutionId,
        idx: i32,
        name: &str,
        step_type: &str,
        rendered_config: serde_json::Value,
    ) -> Result<StepExecutionId, ExecutionError>;

    async fn update_step(
        &self,
        step_id: StepExecutionId,
        status: StepExecutionStatus,
        outputs: HashMap<String, serde_json::Value>,
        logs: String,
        error: Option<String>,
        mark_ended: bool,
    ) -> Result<(), ExecutionError>;

    async fn list_step_executions(
        &self,
        execution_id: WorkflowExecutionId,
    ) -> Result<Vec<StepExecution>, ExecutionError>;

    async fn upsert_graph_node(
        &self,
        app_name: &str,
        node_type: NodeType,
        key: &str,
        name: &str,
        properties: serde_json::Value,
    ) -> Result<(GraphNode, bool), GraphError>;

    async fn upsert_graph_edge(
        &self,
        app_name: &str,
        from_key: &str,
        to_key: &str,
        edge_type: EdgeType,
        properties: serde_json::Value,
    ) -> Result<(GraphEdge, bool), GraphError>;

    async fn get_graph(
        &self,
        app_name: &str,
    ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError>;

    async fn get_history(
        &self,
        app_name: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceStateTransition>, GraphError>;

    async fn get_teams_view(&self) -> Result<Vec<TeamSummary>, GraphError>;
}
