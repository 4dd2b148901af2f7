//! PostgreSQL implementation of the [`PersistenceGateway`] contract.
//!
//! Every state-changing method runs inside a single `sqlx` transaction so
//! the row mutation and its graph node/edge upserts commit atomically —
//! observers of [`crate::repo::traits::PersistenceGateway::get_graph`]
//! never see a world the primary tables disagree with.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use innominatus_domain::{
    Application, DesiredOperation, EdgeType, ExecutionStatus, GraphEdge, GraphEdgeId, GraphNode,
    GraphNodeId, NodeType, Resource, ResourceId, ResourceState, ResourceStateTransition,
    StepExecution, StepExecutionId, StepExecutionStatus, TransitionId, WorkflowExecution,
    WorkflowExecutionId,
};

use crate::pagination::{Page, Pagination};
use crate::repo::errors::{
    ExecutionError, GraphError, ResourceError, TransitionError, UpsertApplicationError,
};
use crate::repo::traits::{PersistenceGateway, TeamSummary};

/// `resource_id` sentinel written during leasing, cleared once the
/// transaction that binds a real execution id commits. Using a sentinel
/// rather than `NULL` mid-lease lets `lease_pending_resources`'s
/// `WHERE workflow_execution_id IS NULL` keep excluding rows a concurrent
/// poller already claimed, without a second column.
const LEASE_SENTINEL: i64 = -1;

pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_value_map(v: serde_json::Value) -> HashMap<String, serde_json::Value> {
    match v {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

async fn record_transition(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: ResourceId,
    from_state: ResourceState,
    to_state: ResourceState,
    reason: &str,
    execution_id: Option<WorkflowExecutionId>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO resource_state_transitions
            (id, resource_id, from_state, to_state, reason, workflow_execution_id, at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ",
    )
    .bind(TransitionId::new().into_uuid())
    .bind(resource_id.as_uuid())
    .bind(from_state)
    .bind(to_state)
    .bind(reason)
    .bind(execution_id.map(WorkflowExecutionId::as_i64))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Upsert a graph node inside an open transaction, returning its surrogate
/// id and whether this call created it.
async fn upsert_node_tx(
    tx: &mut Transaction<'_, Postgres>,
    app_name: &str,
    node_type: NodeType,
    key: &str,
    name: &str,
    properties: serde_json::Value,
) -> Result<(GraphNodeId, bool), sqlx::Error> {
    let existing: Option<(uuid::Uuid,)> =
        sqlx::query_as("SELECT id FROM graph_nodes WHERE app_name = $1 AND key = $2")
            .bind(app_name)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some((id,)) = existing {
        sqlx::query(
            "UPDATE graph_nodes SET name = $2, properties = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(name)
        .bind(&properties)
        .execute(&mut **tx)
        .await?;
        return Ok((GraphNodeId::from_uuid(id), false));
    }

    let id = GraphNodeId::new();
    sqlx::query(
        r"
        INSERT INTO graph_nodes (id, app_name, type, key, name, properties, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
        ",
    )
    .bind(id.as_uuid())
    .bind(app_name)
    .bind(node_type)
    .bind(key)
    .bind(name)
    .bind(&properties)
    .execute(&mut **tx)
    .await?;

    Ok((id, true))
}

/// Upsert a graph edge inside an open transaction, returning its surrogate
/// id and whether this call created it. Both endpoints must already exist
/// and must satisfy `edge_type.is_valid_pair`.
async fn upsert_edge_tx(
    tx: &mut Transaction<'_, Postgres>,
    app_name: &str,
    from_key: &str,
    to_key: &str,
    edge_type: EdgeType,
    properties: serde_json::Value,
) -> Result<(GraphEdgeId, bool), GraphError> {
    let from: Option<(uuid::Uuid, NodeType)> =
        sqlx::query_as("SELECT id, type FROM graph_nodes WHERE app_name = $1 AND key = $2")
            .bind(app_name)
            .bind(from_key)
            .fetch_optional(&mut **tx)
            .await?;
    let to: Option<(uuid::Uuid, NodeType)> =
        sqlx::query_as("SELECT id, type FROM graph_nodes WHERE app_name = $1 AND key = $2")
            .bind(app_name)
            .bind(to_key)
            .fetch_optional(&mut **tx)
            .await?;

    let (from_id, from_type) = from.ok_or_else(|| GraphError::NodeNotFound(from_key.to_string()))?;
    let (to_id, to_type) = to.ok_or_else(|| GraphError::NodeNotFound(to_key.to_string()))?;

    if !edge_type.is_valid_pair(from_type, to_type) {
        return Err(GraphError::InvalidEndpoints(edge_type));
    }

    let existing: Option<(uuid::Uuid,)> = sqlx::query_as(
        "SELECT id FROM graph_edges WHERE app_name = $1 AND from_node_id = $2 AND to_node_id = $3 AND type = $4",
    )
    .bind(app_name)
    .bind(from_id)
    .bind(to_id)
    .bind(edge_type)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some((id,)) = existing {
        return Ok((GraphEdgeId::from_uuid(id), false));
    }

    let id = GraphEdgeId::new();
    sqlx::query(
        r"
        INSERT INTO graph_edges (id, app_name, from_node_id, to_node_id, type, properties, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ",
    )
    .bind(id.as_uuid())
    .bind(app_name)
    .bind(from_id)
    .bind(to_id)
    .bind(edge_type)
    .bind(&properties)
    .execute(&mut **tx)
    .await?;

    Ok((id, true))
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn upsert_application(
        &self,
        name: &str,
        team: &str,
        created_by: &str,
        spec: serde_json::Value,
    ) -> Result<(Application, bool), UpsertApplicationError> {
        if name.is_empty() || name != name.to_lowercase() {
            return Err(UpsertApplicationError::InvalidName(name.to_string()));
        }

        let mut tx = self.pool.begin().await?;

        let existing: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT created_at FROM applications WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        let created = existing.is_none();

        let row: ApplicationRow = sqlx::query_as(
            r"
            INSERT INTO applications (name, team, created_by, spec, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE SET spec = EXCLUDED.spec, updated_at = NOW()
            RETURNING name, team, created_by, spec, created_at, updated_at
            ",
        )
        .bind(name)
        .bind(team)
        .bind(created_by)
        .bind(&spec)
        .fetch_one(&mut *tx)
        .await?;

        let team_key = format!("team:{team}");
        let app_key = format!("app:{name}");
        let spec_key = format!("spec:{name}");

        upsert_node_tx(
            &mut tx,
            name,
            NodeType::Team,
            &team_key,
            team,
            serde_json::json!({}),
        )
        .await?;
        upsert_node_tx(
            &mut tx,
            name,
            NodeType::Application,
            &app_key,
            name,
            serde_json::json!({}),
        )
        .await?;
        upsert_node_tx(
            &mut tx,
            name,
            NodeType::Spec,
            &spec_key,
            name,
            serde_json::json!({}),
        )
        .await?;

        upsert_edge_tx(
            &mut tx,
            name,
            &team_key,
            &app_key,
            EdgeType::Owns,
            serde_json::json!({}),
        )
        .await?;
        upsert_edge_tx(
            &mut tx,
            name,
            &app_key,
            &spec_key,
            EdgeType::HasSpec,
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;

        Ok((row.into(), created))
    }

    async fn get_application(&self, name: &str) -> Result<Option<Application>, ResourceError> {
        let row: Option<ApplicationRow> = sqlx::query_as(
            "SELECT name, team, created_by, spec, created_at, updated_at FROM applications WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create_resource_if_absent(
        &self,
        application_name: &str,
        name: &str,
        resource_type: &str,
        configuration: HashMap<String, serde_json::Value>,
        desired_operation: DesiredOperation,
    ) -> Result<(Resource, bool), ResourceError> {
        let mut tx = self.pool.begin().await?;

        if let Some(row) = sqlx::query_as::<_, ResourceRow>(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE application_name = $1 AND name = $2
            ",
        )
        .bind(application_name)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.commit().await?;
            return Ok((row.into(), false));
        }

        let id = ResourceId::new();
        let config_value = serde_json::Value::Object(configuration.into_iter().collect());

        let row: ResourceRow = sqlx::query_as(
            r"
            INSERT INTO resource_instances
                (id, application_name, name, type, configuration, desired_operation, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING id, application_name, name, type, configuration, desired_operation, state,
                      workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            ",
        )
        .bind(id.as_uuid())
        .bind(application_name)
        .bind(name)
        .bind(resource_type)
        .bind(&config_value)
        .bind(desired_operation)
        .bind(ResourceState::Requested)
        .fetch_one(&mut *tx)
        .await?;

        let spec_key = format!("spec:{application_name}");
        let resource_key = format!("resource:{application_name}:{name}");

        upsert_node_tx(
            &mut tx,
            application_name,
            NodeType::Spec,
            &spec_key,
            application_name,
            serde_json::json!({}),
        )
        .await?;
        upsert_node_tx(
            &mut tx,
            application_name,
            NodeType::Resource,
            &resource_key,
            name,
            serde_json::json!({ "type": resource_type }),
        )
        .await?;

        upsert_edge_tx(
            &mut tx,
            application_name,
            &spec_key,
            &resource_key,
            EdgeType::Contains,
            serde_json::json!({}),
        )
        .await?;

        tx.commit().await?;
        Ok((row.into(), true))
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<Resource>, ResourceError> {
        let row: Option<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_resource_by_name(
        &self,
        application_name: &str,
        name: &str,
    ) -> Result<Option<Resource>, ResourceError> {
        let row: Option<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE application_name = $1 AND name = $2
            ",
        )
        .bind(application_name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_resources_for_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<Resource>, ResourceError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE application_name = $1 ORDER BY created_at ASC
            ",
        )
        .bind(application_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_desired_operation(
        &self,
        id: ResourceId,
        operation: DesiredOperation,
    ) -> Result<Resource, ResourceError> {
        let row: Option<ResourceRow> = sqlx::query_as(
            r"
            UPDATE resource_instances
            SET desired_operation = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, application_name, name, type, configuration, desired_operation, state,
                      workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            ",
        )
        .bind(id.as_uuid())
        .bind(operation)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Into::into).ok_or(ResourceError::NotFound(id))
    }

    async fn lease_pending_resources(&self, limit: i64) -> Result<Vec<Resource>, ResourceError> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<ResourceRow> = sqlx::query_as(
            r"
            WITH leased AS (
                SELECT id FROM resource_instances
                WHERE state = 'requested' AND workflow_execution_id IS NULL
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE resource_instances r
            SET workflow_execution_id = $2, updated_at = NOW()
            FROM leased
            WHERE r.id = leased.id
            RETURNING r.id, r.application_name, r.name, r.type, r.configuration,
                      r.desired_operation, r.state, r.workflow_override, r.workflow_tags,
                      r.workflow_execution_id, r.error, r.created_at, r.updated_at
            ",
        )
        .bind(limit)
        .bind(LEASE_SENTINEL)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn bind_execution_to_resource(
        &self,
        resource_id: ResourceId,
        execution_id: WorkflowExecutionId,
        new_state: ResourceState,
    ) -> Result<(), TransitionError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE id = $1 FOR UPDATE
            ",
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let current: Resource = current
            .map(Into::into)
            .ok_or(TransitionError::NotFound(resource_id))?;

        if !innominatus_domain::state_machine::is_allowed(current.state, new_state) {
            return Err(TransitionError::InvalidTransition {
                from: current.state,
                to: new_state,
            });
        }

        sqlx::query(
            r"
            UPDATE resource_instances
            SET state = $2, workflow_execution_id = $3, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(resource_id.as_uuid())
        .bind(new_state)
        .bind(execution_id.as_i64())
        .execute(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            resource_id,
            current.state,
            new_state,
            "bound to workflow execution",
            Some(execution_id),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_resource_transition(
        &self,
        resource_id: ResourceId,
        new_state: ResourceState,
        reason: &str,
        execution_id: Option<WorkflowExecutionId>,
    ) -> Result<(), TransitionError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE id = $1 FOR UPDATE
            ",
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let current: Resource = current
            .map(Into::into)
            .ok_or(TransitionError::NotFound(resource_id))?;

        if !innominatus_domain::state_machine::is_allowed(current.state, new_state) {
            return Err(TransitionError::InvalidTransition {
                from: current.state,
                to: new_state,
            });
        }

        // A failed completion carries its reason into the resource's own
        // `error` column so a reader of `resource_instances` alone sees why
        // it failed, not just the transition audit row. Any other target
        // (e.g. succeeding after a prior failed attempt) clears it.
        let error_value: Option<&str> = (new_state == ResourceState::Failed).then_some(reason);

        sqlx::query(
            r"
            UPDATE resource_instances
            SET state = $2, workflow_execution_id = NULL, error = $3, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(resource_id.as_uuid())
        .bind(new_state)
        .bind(error_value)
        .execute(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            resource_id,
            current.state,
            new_state,
            reason,
            execution_id,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_resource_failed(
        &self,
        resource_id: ResourceId,
        reason: &str,
    ) -> Result<(), TransitionError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances WHERE id = $1 FOR UPDATE
            ",
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let current: Resource = current
            .map(Into::into)
            .ok_or(TransitionError::NotFound(resource_id))?;

        sqlx::query(
            r"
            UPDATE resource_instances
            SET state = 'failed', workflow_execution_id = NULL, error = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(resource_id.as_uuid())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            resource_id,
            current.state,
            ResourceState::Failed,
            reason,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_provisioning_resources(&self) -> Result<Vec<Resource>, ResourceError> {
        let rows: Vec<ResourceRow> = sqlx::query_as(
            r"
            SELECT id, application_name, name, type, configuration, desired_operation, state,
                   workflow_override, workflow_tags, workflow_execution_id, error, created_at, updated_at
            FROM resource_instances
            WHERE state IN ('provisioning', 'updating', 'terminating') AND workflow_execution_id IS NOT NULL
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recover_orphans(
        &self,
        orphan_retries: u32,
        stuck_after: chrono::Duration,
    ) -> Result<usize, TransitionError> {
        let mut tx = self.pool.begin().await?;

        let cutoff = Utc::now() - stuck_after;
        let candidates: Vec<ResourceRow> = sqlx::query_as(
            r"
            SELECT r.id, r.application_name, r.name, r.type, r.configuration, r.desired_operation,
                   r.state, r.workflow_override, r.workflow_tags, r.workflow_execution_id, r.error,
                   r.created_at, r.updated_at
            FROM resource_instances r
            LEFT JOIN workflow_executions w ON w.id = r.workflow_execution_id
            WHERE r.state IN ('provisioning', 'updating', 'terminating')
              AND r.updated_at < $1
              AND (w.id IS NULL OR w.status IN ('succeeded', 'failed', 'cancelled'))
            FOR UPDATE OF r SKIP LOCKED
            ",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut recovered = 0usize;
        for row in candidates {
            let resource: Resource = row.into();
            let retry_count: i64 = sqlx::query_scalar(
                r"SELECT COUNT(*) FROM resource_state_transitions
                   WHERE resource_id = $1 AND reason = 'orphan recovery'",
            )
            .bind(resource.id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

            let (target, reason) = if retry_count >= i64::from(orphan_retries) {
                (ResourceState::Failed, "orphan recovery budget exhausted")
            } else {
                (ResourceState::Requested, "orphan recovery")
            };

            sqlx::query(
                r"UPDATE resource_instances
                   SET state = $2, workflow_execution_id = NULL, updated_at = NOW()
                   WHERE id = $1",
            )
            .bind(resource.id.as_uuid())
            .bind(target)
            .execute(&mut *tx)
            .await?;

            record_transition(&mut tx, resource.id, resource.state, target, reason, None).await?;
            recovered += 1;
        }

        tx.commit().await?;
        Ok(recovered)
    }

    async fn list_transitions(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<ResourceStateTransition>, ResourceError> {
        let rows: Vec<TransitionRow> = sqlx::query_as(
            r"
            SELECT id, resource_id, from_state, to_state, reason, workflow_execution_id, at
            FROM resource_state_transitions WHERE resource_id = $1 ORDER BY at ASC
            ",
        )
        .bind(resource_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_workflow_execution(
        &self,
        application_name: &str,
        workflow_name: &str,
        resource_id: Option<ResourceId>,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowExecutionId, ExecutionError> {
        let params_value = serde_json::Value::Object(params.into_iter().collect());
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO workflow_executions
                (application_name, workflow_name, resource_id, status, params, started_at)
            VALUES ($1, $2, $3, 'pending', $4, NOW())
            RETURNING id
            ",
        )
        .bind(application_name)
        .bind(workflow_name)
        .bind(resource_id.map(|r| *r.as_uuid()))
        .bind(&params_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(WorkflowExecutionId::from_raw(id))
    }

    async fn mark_execution_running(&self, id: WorkflowExecutionId) -> Result<(), ExecutionError> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET status = 'running' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ExecutionError::NotFound(id));
        }
        Ok(())
    }

    async fn finalize_execution(
        &self,
        id: WorkflowExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutionError> {
        let result = sqlx::query(
            r"
            UPDATE workflow_executions
            SET status = $2, error = $3, ended_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            ",
        )
        .bind(id.as_i64())
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ExecutionError::AlreadyTerminal(id));
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        id: WorkflowExecutionId,
    ) -> Result<Option<WorkflowExecution>, ExecutionError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r"
            SELECT id, application_name, workflow_name, resource_id, status, params, error,
                   started_at, ended_at
            FROM workflow_executions WHERE id = $1
            ",
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn append_step_execution(
        &self,
        execution_id: WorkflowExecutionId,
        idx: i32,
        name: &str,
        step_type: &str,
        rendered_config: serde_json::Value,
    ) -> Result<StepExecutionId, ExecutionError> {
        let id = StepExecutionId::new();
        sqlx::query(
            r"
            INSERT INTO workflow_step_executions
                (id, execution_id, idx, name, type, status, rendered_config, outputs, logs)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, '{}', '')
            ",
        )
        .bind(id.as_uuid())
        .bind(execution_id.as_i64())
        .bind(idx)
        .bind(name)
        .bind(step_type)
        .bind(&rendered_config)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_step(
        &self,
        step_id: StepExecutionId,
        status: StepExecutionStatus,
        outputs: HashMap<String, serde_json::Value>,
        logs: String,
        error: Option<String>,
        mark_ended: bool,
    ) -> Result<(), ExecutionError> {
        let outputs_value = serde_json::Value::Object(outputs.into_iter().collect());
        let result = sqlx::query(
            r"
            UPDATE workflow_step_executions
            SET status = $2,
                outputs = $3,
                logs = $4,
                error = $5,
                started_at = COALESCE(started_at, CASE WHEN $2 = 'running' THEN NOW() END),
                ended_at = CASE WHEN $6 THEN NOW() ELSE ended_at END
            WHERE id = $1
            ",
        )
        .bind(step_id.as_uuid())
        .bind(status)
        .bind(&outputs_value)
        .bind(&logs)
        .bind(error)
        .bind(mark_ended)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ExecutionError::StepNotFound);
        }
        Ok(())
    }

    async fn list_step_executions(
        &self,
        execution_id: WorkflowExecutionId,
    ) -> Result<Vec<StepExecution>, ExecutionError> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(
            r"
            SELECT id, execution_id, idx, name, type, status, rendered_config, outputs, logs,
                   error, started_at, ended_at
            FROM workflow_step_executions WHERE execution_id = $1 ORDER BY idx ASC
            ",
        )
        .bind(execution_id.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_graph_node(
        &self,
        app_name: &str,
        node_type: NodeType,
        key: &str,
        name: &str,
        properties: serde_json::Value,
    ) -> Result<(GraphNode, bool), GraphError> {
        let mut tx = self.pool.begin().await?;
        let (id, created) =
            upsert_node_tx(&mut tx, app_name, node_type, key, name, properties).await?;
        let row: GraphNodeRow = sqlx::query_as(
            "SELECT id, app_name, type, key, name, properties, created_at, updated_at FROM graph_nodes WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((row.into(), created))
    }

    async fn upsert_graph_edge(
        &self,
        app_name: &str,
        from_key: &str,
        to_key: &str,
        edge_type: EdgeType,
        properties: serde_json::Value,
    ) -> Result<(GraphEdge, bool), GraphError> {
        let mut tx = self.pool.begin().await?;
        let (edge_id, created) =
            upsert_edge_tx(&mut tx, app_name, from_key, to_key, edge_type, properties).await?;
        let row: GraphEdgeRow = sqlx::query_as(
            "SELECT id, app_name, from_node_id, to_node_id, type, properties, created_at FROM graph_edges WHERE id = $1",
        )
        .bind(edge_id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok((row.into(), created))
    }

    async fn get_graph(
        &self,
        app_name: &str,
    ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError> {
        let nodes: Vec<GraphNodeRow> = sqlx::query_as(
            "SELECT id, app_name, type, key, name, properties, created_at, updated_at FROM graph_nodes WHERE app_name = $1",
        )
        .bind(app_name)
        .fetch_all(&self.pool)
        .await?;
        let edges: Vec<GraphEdgeRow> = sqlx::query_as(
            "SELECT id, app_name, from_node_id, to_node_id, type, properties, created_at FROM graph_edges WHERE app_name = $1",
        )
        .bind(app_name)
        .fetch_all(&self.pool)
        .await?;
        Ok((
            nodes.into_iter().map(Into::into).collect(),
            edges.into_iter().map(Into::into).collect(),
        ))
    }

    async fn get_history(
        &self,
        app_name: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceStateTransition>, GraphError> {
        let total: i64 = sqlx::query_scalar(
            r"SELECT COUNT(*) FROM resource_state_transitions t
               JOIN resource_instances r ON r.id = t.resource_id
               WHERE r.application_name = $1",
        )
        .bind(app_name)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<TransitionRow> = sqlx::query_as(
            r"
            SELECT t.id, t.resource_id, t.from_state, t.to_state, t.reason, t.workflow_execution_id, t.at
            FROM resource_state_transitions t
            JOIN resource_instances r ON r.id = t.resource_id
            WHERE r.application_name = $1
            ORDER BY t.at DESC
            LIMIT $2 OFFSET $3
            ",
        )
        .bind(app_name)
        .bind(pagination.clamped_limit())
        .bind(pagination.offset)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<ResourceStateTransition> = rows.into_iter().map(Into::into).collect();
        Ok(Page::new(items, total, &pagination))
    }

    async fn get_teams_view(&self) -> Result<Vec<TeamSummary>, GraphError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r"
            SELECT a.team, COUNT(DISTINCT a.name), COUNT(r.id)
            FROM applications a
            LEFT JOIN resource_instances r ON r.application_name = a.name
            GROUP BY a.team
            ORDER BY a.team ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(team, application_count, resource_count)| TeamSummary {
                team,
                application_count,
                resource_count,
            })
            .collect())
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    name: String,
    team: String,
    created_by: String,
    spec: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Self {
            name: row.name,
            team: row.team,
            created_by: row.created_by,
            spec: row.spec,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: uuid::Uuid,
    application_name: String,
    name: String,
    r#type: String,
    configuration: serde_json::Value,
    desired_operation: DesiredOperation,
    state: ResourceState,
    workflow_override: Option<String>,
    workflow_tags: Vec<String>,
    workflow_execution_id: Option<i64>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: ResourceId::from_uuid(row.id),
            application_name: row.application_name,
            name: row.name,
            resource_type: row.r#type,
            configuration: to_value_map(row.configuration),
            desired_operation: row.desired_operation,
            state: row.state,
            workflow_override: row.workflow_override,
            workflow_tags: row.workflow_tags,
            workflow_execution_id: row
                .workflow_execution_id
                .filter(|id| *id != LEASE_SENTINEL)
                .map(WorkflowExecutionId::from_raw),
            error_message: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    application_name: String,
    workflow_name: String,
    resource_id: Option<uuid::Uuid>,
    status: ExecutionStatus,
    params: serde_json::Value,
    error: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRow> for WorkflowExecution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: WorkflowExecutionId::from_raw(row.id),
            application_name: row.application_name,
            workflow_name: row.workflow_name,
            resource_id: row.resource_id.map(ResourceId::from_uuid),
            status: row.status,
            params: to_value_map(row.params),
            error: row.error,
            started_at: row.started_at,
            ended_at: row.ended_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepExecutionRow {
    id: uuid::Uuid,
    execution_id: i64,
    idx: i32,
    name: String,
    r#type: String,
    status: StepExecutionStatus,
    rendered_config: serde_json::Value,
    outputs: serde_json::Value,
    logs: String,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<StepExecutionRow> for StepExecution {
    fn from(row: StepExecutionRow) -> Self {
        Self {
            id: StepExecutionId::from_uuid(row.id),
            execution_id: WorkflowExecutionId::from_raw(row.execution_id),
            idx: row.idx,
            name: row.name,
            step_type: row.r#type,
            status: row.status,
            rendered_config: row.rendered_config,
            outputs: to_value_map(row.outputs),
            logs: row.logs,
            error: row.error,
            started_at: row.started_at,
            ended_at: row.ended_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    id: uuid::Uuid,
    resource_id: uuid::Uuid,
    from_state: ResourceState,
    to_state: ResourceState,
    reason: String,
    workflow_execution_id: Option<i64>,
    at: DateTime<Utc>,
}

impl From<TransitionRow> for ResourceStateTransition {
    fn from(row: TransitionRow) -> Self {
        Self {
            id: TransitionId::from_uuid(row.id),
            resource_id: ResourceId::from_uuid(row.resource_id),
            from_state: row.from_state,
            to_state: row.to_state,
            reason: row.reason,
            workflow_execution_id: row.workflow_execution_id.map(WorkflowExecutionId::from_raw),
            at: row.at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GraphNodeRow {
    id: uuid::Uuid,
    app_name: String,
    r#type: NodeType,
    key: String,
    name: String,
    properties: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<GraphNodeRow> for GraphNode {
    fn from(row: GraphNodeRow) -> Self {
        Self {
            id: GraphNodeId::from_uuid(row.id),
            app_name: row.app_name,
            node_type: row.r#type,
            key: row.key,
            name: row.name,
            properties: row.properties,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct GraphEdgeRow {
    id: uuid::Uuid,
    app_name: String,
    from_node_id: uuid::Uuid,
    to_node_id: uuid::Uuid,
    r#type: EdgeType,
    properties: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<GraphEdgeRow> for GraphEdge {
    fn from(row: GraphEdgeRow) -> Self {
        Self {
            id: GraphEdgeId::from_uuid(row.id),
            app_name: row.app_name,
            from_node_id: GraphNodeId::from_uuid(row.from_node_id),
            to_node_id: GraphNodeId::from_uuid(row.to_node_id),
            edge_type: row.r#type,
            properties: row.properties,
            created_at: row.created_at,
        }
    }
}
