//! Orchestration Engine / Reconciler: the tick loop that leases
//! pending resources, resolves and starts their workflows, polls in-flight
//! executions to completion, and recovers orphans. Everything it touches
//! goes through the gateway, the registry, and the graph manager — this
//! module owns only the scheduling decisions, never a SQL statement.

use std::collections::HashMap;
use std::sync::Arc;

use innominatus_db::repo::traits::PersistenceGateway;
use innominatus_domain::{
    state_machine, DesiredOperation, EdgeType, ExecutionStatus, NodeType, Resource, ResourceState,
    WorkflowDefinition, WorkflowExecutionId,
};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::executor::WorkflowExecutor;
use crate::graph::GraphManager;
use crate::interpolator::InterpolationContext;
use crate::registry::{ProviderRegistry, ResolveError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("graph error: {0}")]
    Graph(String),
}

/// The key a graph node was upserted under for a resource: shared between
/// this module and whatever wrote the node in the first place.
fn resource_node_key(application_name: &str, resource_name: &str) -> String {
    format!("resource:{application_name}:{resource_name}")
}

pub struct Engine {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<ProviderRegistry>,
    graph: Arc<GraphManager>,
    executor: Arc<WorkflowExecutor>,
    config: EngineConfig,
    worker_permits: Arc<Semaphore>,
    /// Per-execution cancellation tokens for workflows currently running on
    /// the worker pool, keyed separately from the engine-wide shutdown
    /// token so cancelling one
    /// execution never touches its siblings.
    running: Arc<Mutex<HashMap<WorkflowExecutionId, CancellationToken>>>,
}

impl Engine {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<ProviderRegistry>,
        graph: Arc<GraphManager>,
        executor: Arc<WorkflowExecutor>,
        config: EngineConfig,
    ) -> Self {
        let worker_permits = Arc::new(Semaphore::new(config.resolved_workflow_parallelism()));
        Self {
            gateway,
            registry,
            graph,
            executor,
            config,
            worker_permits,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cancels a running workflow execution. Signals the execution's own
    /// cancellation
    /// token so its current step unwinds within its grace period; the
    /// executor marks the execution `cancelled` and the next tick's
    /// `poll_in_flight` mirrors that into the owning resource's `failed`
    /// state. Returns `false` if no execution with this id is currently
    /// running on this process (already terminal, or never started here).
    pub async fn cancel_execution(&self, execution_id: WorkflowExecutionId) -> bool {
        if let Some(token) = self.running.lock().await.get(&execution_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Runs the reconciliation loop until `cancellation` fires, then drains
    /// in-flight workflow tasks for up to `config.shutdown_grace` before
    /// returning.
    pub async fn run(&self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&mut in_flight, cancellation.clone()).await {
                        error!(error = %e, "reconciliation tick failed");
                    }
                }
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("a workflow task panicked");
                        }
                    }
                }
                () = cancellation.cancelled() => break,
            }
        }

        info!(
            pending = in_flight.len(),
            "reconciler stopping, draining in-flight workflows"
        );
        let drain = tokio::time::timeout(self.config.shutdown_grace(), async {
            while in_flight.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            warn!("shutdown grace period elapsed with workflows still in flight");
        }
    }

    /// One reconciliation pass: lease new work, poll in-flight work
    /// to completion, then recover orphans. Skips leasing entirely if the
    /// registry is mid-reload rather than blocking on it.
    async fn tick(
        &self,
        in_flight: &mut JoinSet<()>,
        cancellation: CancellationToken,
    ) -> Result<(), EngineError> {
        if let Some(snapshot) = self.registry.try_current() {
            let leased = self
                .gateway
                .lease_pending_resources(self.config.reconcile_batch)
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;

            for resource in leased {
                self.dispatch(resource, &snapshot, in_flight, cancellation.clone())
                    .await;
            }
        } else {
            info!("registry reload in progress, skipping lease this tick");
        }

        self.poll_in_flight().await?;

        let recovered = self
            .gateway
            .recover_orphans(self.config.orphan_retries, self.config.orphan_stuck_after())
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        if recovered > 0 {
            info!(recovered, "orphan recovery reset stuck resources");
        }

        Ok(())
    }

    /// Resolves `resource`'s workflow, binds an execution to it, and spawns
    /// the executor run as a background task bounded by the worker
    /// semaphore. Resolution failures mark the resource `failed` directly;
    /// they never enter the in-flight pool.
    async fn dispatch(
        &self,
        resource: Resource,
        snapshot: &crate::registry::RegistrySnapshot,
        in_flight: &mut JoinSet<()>,
        cancellation: CancellationToken,
    ) {
        let resolution = match self.resolve(&resource, snapshot) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(resource = %resource.name, error = %e, "workflow resolution failed");
                self.fail_resolution(&resource, &e.to_string()).await;
                return;
            }
        };

        let Some(definition) = snapshot.workflow(&resolution.provider_name, &resolution.workflow_name)
        else {
            let message = format!(
                "resolved workflow '{}' not found on provider '{}'",
                resolution.workflow_name, resolution.provider_name
            );
            warn!(resource = %resource.name, %message);
            self.fail_resolution(&resource, &message).await;
            return;
        };
        let definition = definition.clone();

        self.wire_dispatch_graph(&resource, &resolution.provider_name, &definition)
            .await;

        let Some(target) = state_machine::lease_target(resource.state, resource.desired_operation)
        else {
            warn!(resource = %resource.name, "no lease target for current (state, operation)");
            return;
        };

        let params: std::collections::HashMap<String, serde_json::Value> = resource
            .configuration
            .clone();
        let execution_id = match self
            .gateway
            .create_workflow_execution(
                &resource.application_name,
                &definition.name,
                Some(resource.id),
                params,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(resource = %resource.name, error = %e, "failed to create workflow execution");
                return;
            }
        };

        if let Err(e) = self
            .gateway
            .bind_execution_to_resource(resource.id, execution_id, target)
            .await
        {
            error!(resource = %resource.name, error = %e, "failed to bind execution to resource");
            return;
        }
        let _ = self
            .graph
            .notify_resource_state_changed(
                &resource.application_name,
                &resource_node_key(&resource.application_name, &resource.name),
                &resource.name,
                resource.state,
                target,
            )
            .await;

        let ctx = match self.build_context(&resource).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(resource = %resource.name, error = %e, "failed to build interpolation context");
                return;
            }
        };

        let executor = Arc::clone(&self.executor);
        let strict = self.config.strict_validation;
        let permits = Arc::clone(&self.worker_permits);
        let running = Arc::clone(&self.running);
        let exec_token = cancellation.child_token();
        running.lock().await.insert(execution_id, exec_token.clone());

        in_flight.spawn(async move {
            let _permit = permits.acquire().await;
            match executor
                .run(execution_id, &definition, ctx, strict, exec_token)
                .await
            {
                Ok(_status) => {}
                Err(e) => error!(execution = %execution_id, error = %e, "workflow executor error"),
            }
            running.lock().await.remove(&execution_id);
        });
    }

    /// Upserts the provider/workflow/step graph nodes and the
    /// `requires`/`executes`/`contains` edges a dispatched resource's
    /// resolution implies (spec §3's S1 graph shape). The graph is a
    /// read-side cache of these writes, not their source of truth, so a
    /// failure here is logged and otherwise non-fatal to the dispatch.
    async fn wire_dispatch_graph(
        &self,
        resource: &Resource,
        provider_name: &str,
        definition: &WorkflowDefinition,
    ) {
        let app = resource.application_name.as_str();
        let resource_key = resource_node_key(app, &resource.name);
        let provider_key = format!("provider:{provider_name}");
        let workflow_key = format!("workflow:{}", definition.name);

        if let Err(e) = self
            .graph
            .upsert_node(app, NodeType::Provider, &provider_key, provider_name, serde_json::json!({}))
            .await
        {
            warn!(resource = %resource.name, error = %e, "failed to upsert provider graph node");
        }
        if let Err(e) = self
            .graph
            .upsert_node(app, NodeType::Workflow, &workflow_key, &definition.name, serde_json::json!({}))
            .await
        {
            warn!(resource = %resource.name, error = %e, "failed to upsert workflow graph node");
        }
        if let Err(e) = self
            .graph
            .upsert_edge(app, &resource_key, &provider_key, EdgeType::Requires, serde_json::json!({}))
            .await
        {
            warn!(resource = %resource.name, error = %e, "failed to upsert requires edge");
        }
        if let Err(e) = self
            .graph
            .upsert_edge(app, &provider_key, &workflow_key, EdgeType::Executes, serde_json::json!({}))
            .await
        {
            warn!(resource = %resource.name, error = %e, "failed to upsert executes edge");
        }

        for step in &definition.steps {
            let step_key = format!("step:{}", step.name);
            if let Err(e) = self
                .graph
                .upsert_node(
                    app,
                    NodeType::Step,
                    &step_key,
                    &step.name,
                    serde_json::json!({ "step_type": step.step_type }),
                )
                .await
            {
                warn!(resource = %resource.name, step = %step.name, error = %e, "failed to upsert step graph node");
            }
            if let Err(e) = self
                .graph
                .upsert_edge(app, &workflow_key, &step_key, EdgeType::Contains, serde_json::json!({}))
                .await
            {
                warn!(resource = %resource.name, step = %step.name, error = %e, "failed to upsert workflow-step contains edge");
            }
        }
    }

    fn resolve(
        &self,
        resource: &Resource,
        snapshot: &crate::registry::RegistrySnapshot,
    ) -> Result<crate::registry::Resolution, ResolveError> {
        if let Some(workflow_name) = &resource.workflow_override {
            if let Some(provider_name) = snapshot.find_workflow_owner(workflow_name) {
                return Ok(crate::registry::Resolution {
                    provider_name: provider_name.to_string(),
                    workflow_name: workflow_name.clone(),
                });
            }
            return Err(ResolveError::NotFound {
                resource_type: resource.resource_type.clone(),
                operation: resource.desired_operation,
            });
        }

        let (resource_type, operation, tags) = resource.resolution_key();
        snapshot.resolve(resource_type, operation, tags)
    }

    async fn fail_resolution(&self, resource: &Resource, reason: &str) {
        if let Err(e) = self.gateway.mark_resource_failed(resource.id, reason).await {
            error!(resource = %resource.name, error = %e, "failed to mark resource failed");
            return;
        }
        let _ = self
            .graph
            .notify_resource_state_changed(
                &resource.application_name,
                &resource_node_key(&resource.application_name, &resource.name),
                &resource.name,
                resource.state,
                ResourceState::Failed,
            )
            .await;
    }

    /// Builds the `workflow.params` / `resources.<name>.<attr>` namespaces
    /// for `resource`'s execution: its own configuration plus every
    /// sibling resource in the same application, keyed by name.
    async fn build_context(
        &self,
        resource: &Resource,
    ) -> Result<InterpolationContext, EngineError> {
        let siblings = self
            .gateway
            .list_resources_for_application(&resource.application_name)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        let mut resources_map = serde_json::Map::new();
        for sibling in &siblings {
            let mut attrs = serde_json::Map::new();
            for (key, value) in &sibling.configuration {
                attrs.insert(key.clone(), value.clone());
            }
            attrs.insert("state".to_string(), serde_json::to_value(sibling.state).unwrap_or_default());
            resources_map.insert(sibling.name.clone(), serde_json::Value::Object(attrs));
        }

        let params = serde_json::json!({ "params": resource.configuration });
        Ok(InterpolationContext::new(
            params,
            serde_json::Value::Object(resources_map),
        ))
    }

    /// Polls every resource with an in-flight execution; once that
    /// execution reaches a terminal status, completes the resource's
    /// transition and notifies the graph.
    async fn poll_in_flight(&self) -> Result<(), EngineError> {
        let provisioning = self
            .gateway
            .list_provisioning_resources()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        for resource in provisioning {
            let Some(execution_id) = resource.workflow_execution_id else {
                continue;
            };
            let execution = self
                .gateway
                .get_execution(execution_id)
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
            let Some(execution) = execution else { continue };
            if !execution.is_terminal() {
                continue;
            }

            let success = execution.status == ExecutionStatus::Succeeded;
            let Some(target) = state_machine::completion_target(resource.state, success) else {
                continue;
            };

            let reason = match execution.status {
                ExecutionStatus::Succeeded => "workflow succeeded".to_string(),
                ExecutionStatus::Failed => execution
                    .error
                    .clone()
                    .unwrap_or_else(|| "workflow failed".to_string()),
                ExecutionStatus::Cancelled => "workflow cancelled".to_string(),
                ExecutionStatus::Pending | ExecutionStatus::Running => continue,
            };

            self.gateway
                .complete_resource_transition(resource.id, target, &reason, Some(execution_id))
                .await
                .map_err(|e| EngineError::Persistence(e.to_string()))?;

            let _ = self
                .graph
                .notify_resource_state_changed(
                    &resource.application_name,
                    &resource_node_key(&resource.application_name, &resource.name),
                    &resource.name,
                    resource.state,
                    target,
                )
                .await;
        }

        Ok(())
    }

    /// Issues a new desired operation against an already-settled resource,
    /// for callers outside the reconciler loop (an external API surface,
    /// out of scope here, or a test harness). The reconciler picks the
    /// resulting in-flight state up on its own next tick.
    pub async fn request_operation(
        &self,
        resource_id: innominatus_domain::ResourceId,
        operation: DesiredOperation,
    ) -> Result<Resource, EngineError> {
        self.gateway
            .set_desired_operation(resource_id, operation)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_node_key_matches_graph_manager_convention() {
        assert_eq!(resource_node_key("blog", "db"), "resource:blog:db");
    }

    #[tokio::test]
    async fn cancel_execution_signals_its_own_token_and_reports_unknown_ids() {
        let running: Arc<Mutex<HashMap<WorkflowExecutionId, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let id = WorkflowExecutionId::from_raw(7);
        let token = CancellationToken::new();
        running.lock().await.insert(id, token.clone());

        // Mirrors Engine::cancel_execution's body without constructing a
        // full Engine (which needs a live gateway/registry/executor).
        let found = running.lock().await.get(&id).map(CancellationToken::clone);
        if let Some(t) = found {
            t.cancel();
        }

        assert!(token.is_cancelled());
        assert!(!running.lock().await.contains_key(&WorkflowExecutionId::from_raw(99)));
    }
}
