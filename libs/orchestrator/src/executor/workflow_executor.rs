//! Workflow Executor: runs a resolved, parsed workflow against a fully
//! populated variable context, persisting every step/execution state
//! change before the graph manager ever sees it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::stream::StreamExt;
use futures::FutureExt;
use innominatus_db::repo::traits::PersistenceGateway;
use innominatus_domain::{
    ExecutionStatus, RetryPolicy, StepDef, StepExecutionStatus, WorkflowDefinition,
    WorkflowExecutionId,
};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::interpolator::{self, InterpolationContext};

use super::handlers::{HandlerRegistry, StepInvocation};

#[derive(Debug, Error)]
pub enum WorkflowExecutorError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("variable interpolation failed: {0}")]
    Interpolation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub struct WorkflowExecutor {
    gateway: Arc<dyn PersistenceGateway>,
    handlers: Arc<HandlerRegistry>,
    step_parallel_fanout: usize,
    default_step_timeout: Duration,
}

impl WorkflowExecutor {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        handlers: Arc<HandlerRegistry>,
        step_parallel_fanout: usize,
        default_step_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            handlers,
            step_parallel_fanout,
            default_step_timeout,
        }
    }

    /// Explicit invocation entry point for a `category: goldenpath`
    /// workflow (glossary: "invoked explicitly rather than by resolver").
    /// Unlike the resolver-driven path in the reconciler, a golden path has
    /// no initiating resource: it creates its own `WorkflowExecution` row
    /// with `resource_id = None` and runs against a context built purely
    /// from the supplied parameters, then delegates to [`Self::run`].
    pub async fn run_golden_path(
        &self,
        application_name: &str,
        definition: &WorkflowDefinition,
        params: std::collections::HashMap<String, serde_json::Value>,
        strict_validation: bool,
        cancellation: CancellationToken,
    ) -> Result<(WorkflowExecutionId, ExecutionStatus), WorkflowExecutorError> {
        let execution_id = self
            .gateway
            .create_workflow_execution(application_name, &definition.name, None, params.clone())
            .await
            .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;

        let ctx = InterpolationContext::new(
            serde_json::json!({ "params": params }),
            serde_json::Value::Object(serde_json::Map::new()),
        );

        let status = self
            .run(execution_id, definition, ctx, strict_validation, cancellation)
            .await?;
        Ok((execution_id, status))
    }

    /// Runs `definition` end to end under `execution_id`, which must already
    /// exist as a `pending` row. Returns the terminal status; persistence
    /// errors bubble up as [`WorkflowExecutorError`] but step/handler
    /// failures are captured in the execution's own `failed` status instead
    /// of propagating.
    pub async fn run(
        &self,
        execution_id: WorkflowExecutionId,
        definition: &WorkflowDefinition,
        mut ctx: InterpolationContext,
        strict_validation: bool,
        cancellation: CancellationToken,
    ) -> Result<ExecutionStatus, WorkflowExecutorError> {
        self.gateway
            .mark_execution_running(execution_id)
            .await
            .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;

        if strict_validation {
            if let Err(e) = interpolator::validate_strict(definition, &ctx) {
                let message = e.to_string();
                self.finalize(execution_id, ExecutionStatus::Failed, Some(message.clone()))
                    .await?;
                return Ok(ExecutionStatus::Failed);
            }
        }

        let mut idx: i32 = 0;
        let mut failed = false;

        for unit in definition.execution_order() {
            if cancellation.is_cancelled() {
                self.finalize(execution_id, ExecutionStatus::Cancelled, None)
                    .await?;
                return Ok(ExecutionStatus::Cancelled);
            }

            match unit {
                innominatus_domain::ExecutionUnit::Single(step) => {
                    let outcome = self
                        .run_step(execution_id, idx, step, &ctx, cancellation.clone())
                        .await?;
                    idx += 1;
                    match outcome {
                        Some(output) => ctx.record_step_output(&step.name, output),
                        None => {
                            failed = true;
                            break;
                        }
                    }
                }
                innominatus_domain::ExecutionUnit::Parallel(members) => {
                    // Any member failing signals `group_cancel` immediately so
                    // every other still-running sibling's combined token trips
                    // (per spec: "any-fail -> group fail, but siblings are
                    // allowed to finish, cancellation signalled to them") —
                    // siblings aren't killed, they just observe cancellation
                    // the next time they check it. We still await every
                    // member to its own terminal outcome via `FuturesUnordered`
                    // so a member that ignores the signal is allowed to finish.
                    let group_cancel = CancellationToken::new();
                    let semaphore = Arc::new(Semaphore::new(self.step_parallel_fanout.max(1)));
                    let mut tasks = futures::stream::FuturesUnordered::new();

                    for (offset, step) in members.iter().enumerate() {
                        let semaphore = Arc::clone(&semaphore);
                        let step = (*step).clone();
                        let ctx = ctx.clone();
                        let this_idx = idx + offset as i32;
                        let token = cancellation.clone();
                        let group_cancel = group_cancel.clone();
                        let this = self.clone_handles();
                        tasks.push(tokio::spawn(async move {
                            let _permit = semaphore.acquire_owned().await;
                            let combined = token.child_token();
                            tokio::select! {
                                result = this.run_step(execution_id, this_idx, &step, &ctx, combined.clone()) => {
                                    (step.name.clone(), result)
                                }
                                () = group_cancel.cancelled() => {
                                    combined.cancel();
                                    (step.name.clone(), Ok(None))
                                }
                            }
                        }));
                    }

                    idx += members.len() as i32;

                    let mut group_failed = false;
                    let mut outputs = Vec::new();
                    while let Some(joined) = tasks.next().await {
                        match joined {
                            Ok((name, Ok(Some(output)))) => outputs.push((name, output)),
                            Ok((name, Ok(None))) => {
                                if !group_failed {
                                    warn!(step = %name, "parallel group member failed, signalling siblings");
                                }
                                group_failed = true;
                                group_cancel.cancel();
                            }
                            Ok((_, Err(e))) => {
                                group_cancel.cancel();
                                return Err(e);
                            }
                            Err(e) => {
                                group_cancel.cancel();
                                return Err(WorkflowExecutorError::Internal(format!(
                                    "parallel step task panicked: {e}"
                                )));
                            }
                        }
                    }

                    if group_failed {
                        failed = true;
                        break;
                    }

                    for (name, output) in outputs {
                        ctx.record_step_output(&name, output);
                    }
                }
            }
        }

        if failed {
            if !definition.rollback.is_empty() {
                self.run_rollback(execution_id, definition, &ctx, &mut idx)
                    .await;
            }
            self.finalize(
                execution_id,
                ExecutionStatus::Failed,
                Some("one or more steps failed".to_string()),
            )
            .await?;
            return Ok(ExecutionStatus::Failed);
        }

        self.finalize(execution_id, ExecutionStatus::Succeeded, None)
            .await?;
        Ok(ExecutionStatus::Succeeded)
    }

    /// A cheap clone of just the fields needed inside a spawned task; kept
    /// distinct from `Clone` on the whole executor so callers can't
    /// accidentally share a handler registry meant to stay singleton.
    fn clone_handles(&self) -> Arc<Self> {
        Arc::new(Self {
            gateway: Arc::clone(&self.gateway),
            handlers: Arc::clone(&self.handlers),
            step_parallel_fanout: self.step_parallel_fanout,
            default_step_timeout: self.default_step_timeout,
        })
    }

    /// Runs one step with its retry policy. Returns `Ok(Some(outputs))` on
    /// success, `Ok(None)` once the retry budget is exhausted (the step is
    /// left `failed` in the database), or `Err` for a persistence failure.
    async fn run_step(
        &self,
        execution_id: WorkflowExecutionId,
        idx: i32,
        step: &StepDef,
        ctx: &InterpolationContext,
        cancellation: CancellationToken,
    ) -> Result<Option<serde_json::Value>, WorkflowExecutorError> {
        let rendered = interpolator::render_step(step, ctx)
            .map_err(|e| WorkflowExecutorError::Interpolation(e.to_string()))?;

        let step_id = self
            .gateway
            .append_step_execution(execution_id, idx, &step.name, &step.step_type, rendered.clone())
            .await
            .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;

        self.gateway
            .update_step(
                step_id,
                StepExecutionStatus::Running,
                std::collections::HashMap::new(),
                String::new(),
                None,
                false,
            )
            .await
            .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;

        let policy = step.retry.clone().unwrap_or_default();
        let deadline = step
            .timeout_secs
            .map(Duration::from_secs)
            .or(Some(self.default_step_timeout));

        let mut backoff = exponential_backoff(&policy);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let invocation = StepInvocation {
                execution_id: execution_id.as_i64(),
                step_name: &step.name,
                rendered_config: &rendered,
                cancellation: cancellation.clone(),
            };

            // Panic barrier: a handler that panics must not take the engine's
            // worker task down with it. A recovered panic is treated like a
            // permanent (non-retried) failure with an InternalError reason.
            let outcome = AssertUnwindSafe(self.handlers.run(&step.step_type, deadline, invocation))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "step handler panicked".to_string());
                    Err(super::handlers::HandlerError::Failed(format!(
                        "internal error: {message}"
                    )))
                });

            match outcome {
                Ok(outcome) => {
                    let outputs = json_as_map(&outcome.outputs);
                    self.gateway
                        .update_step(
                            step_id,
                            StepExecutionStatus::Succeeded,
                            outputs,
                            outcome.logs,
                            None,
                            true,
                        )
                        .await
                        .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;
                    return Ok(Some(outcome.outputs));
                }
                Err(e) if attempt < policy.max_attempts => {
                    warn!(step = %step.name, attempt, error = %e, "step failed, retrying");
                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    info!(step = %step.name, attempts = attempt, error = %e, "step failed permanently");
                    self.gateway
                        .update_step(
                            step_id,
                            StepExecutionStatus::Failed,
                            std::collections::HashMap::new(),
                            String::new(),
                            Some(e.to_string()),
                            true,
                        )
                        .await
                        .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))?;
                    return Ok(None);
                }
            }
        }
    }

    async fn run_rollback(
        &self,
        execution_id: WorkflowExecutionId,
        definition: &WorkflowDefinition,
        ctx: &InterpolationContext,
        idx: &mut i32,
    ) {
        for name in definition.rollback.iter().rev() {
            let Some(step) = definition.step(name) else {
                continue;
            };
            if let Err(e) = self
                .run_step(execution_id, *idx, step, ctx, CancellationToken::new())
                .await
            {
                warn!(step = %name, error = %e, "rollback step failed, continuing");
            }
            *idx += 1;
        }
    }

    async fn finalize(
        &self,
        execution_id: WorkflowExecutionId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), WorkflowExecutorError> {
        self.gateway
            .finalize_execution(execution_id, status, error)
            .await
            .map_err(|e| WorkflowExecutorError::Persistence(e.to_string()))
    }
}

fn exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(policy.initial_delay_secs.max(1)),
        multiplier: policy.multiplier,
        randomization_factor: if policy.jitter { 0.5 } else { 0.0 },
        max_elapsed_time: None,
        ..Default::default()
    }
}

fn json_as_map(
    value: &serde_json::Value,
) -> std::collections::HashMap<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.clone().into_iter().collect(),
        other => {
            let mut map = std::collections::HashMap::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use innominatus_db::repo::errors::{
        ExecutionError, GraphError, ResourceError, TransitionError, UpsertApplicationError,
    };
    use innominatus_db::repo::traits::TeamSummary;
    use innominatus_domain::{
        Application, DesiredOperation, EdgeType, GraphEdge, GraphNode, NodeType, Resource,
        ResourceId, ResourceState, ResourceStateTransition, StepExecution, StepExecutionId,
        WorkflowCategory, WorkflowExecution,
    };
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use crate::executor::builtin::NoopHandler;

    #[derive(Default)]
    struct FakeGateway {
        next_id: AtomicI64,
        executions: Mutex<Map<i64, WorkflowExecution>>,
    }

    #[async_trait]
    impl PersistenceGateway for FakeGateway {
        async fn upsert_application(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: serde_json::Value,
        ) -> Result<(Application, bool), UpsertApplicationError> {
            unimplemented!()
        }
        async fn get_application(&self, _: &str) -> Result<Option<Application>, ResourceError> {
            unimplemented!()
        }
        async fn create_resource_if_absent(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Map<String, serde_json::Value>,
            _: DesiredOperation,
        ) -> Result<(Resource, bool), ResourceError> {
            unimplemented!()
        }
        async fn get_resource(&self, _: ResourceId) -> Result<Option<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn get_resource_by_name(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn list_resources_for_application(
            &self,
            _: &str,
        ) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn set_desired_operation(
            &self,
            _: ResourceId,
            _: DesiredOperation,
        ) -> Result<Resource, ResourceError> {
            unimplemented!()
        }
        async fn lease_pending_resources(&self, _: i64) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn bind_execution_to_resource(
            &self,
            _: ResourceId,
            _: WorkflowExecutionId,
            _: ResourceState,
        ) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn complete_resource_transition(
            &self,
            _: ResourceId,
            _: ResourceState,
            _: &str,
            _: Option<WorkflowExecutionId>,
        ) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn mark_resource_failed(&self, _: ResourceId, _: &str) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn list_provisioning_resources(&self) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn recover_orphans(
            &self,
            _: u32,
            _: chrono::Duration,
        ) -> Result<usize, TransitionError> {
            unimplemented!()
        }
        async fn list_transitions(
            &self,
            _: ResourceId,
        ) -> Result<Vec<ResourceStateTransition>, ResourceError> {
            unimplemented!()
        }
        async fn create_workflow_execution(
            &self,
            application_name: &str,
            workflow_name: &str,
            resource_id: Option<ResourceId>,
            params: Map<String, serde_json::Value>,
        ) -> Result<WorkflowExecutionId, ExecutionError> {
            let id = WorkflowExecutionId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.executions.lock().unwrap().insert(
                id.as_i64(),
                WorkflowExecution {
                    id,
                    application_name: application_name.to_string(),
                    workflow_name: workflow_name.to_string(),
                    resource_id,
                    status: ExecutionStatus::Pending,
                    params,
                    error: None,
                    started_at: chrono::Utc::now(),
                    ended_at: None,
                },
            );
            Ok(id)
        }
        async fn mark_execution_running(&self, id: WorkflowExecutionId) -> Result<(), ExecutionError> {
            let mut executions = self.executions.lock().unwrap();
            let execution = executions.get_mut(&id.as_i64()).expect("execution exists");
            execution.status = ExecutionStatus::Running;
            Ok(())
        }
        async fn finalize_execution(
            &self,
            id: WorkflowExecutionId,
            status: ExecutionStatus,
            error: Option<String>,
        ) -> Result<(), ExecutionError> {
            let mut executions = self.executions.lock().unwrap();
            let execution = executions.get_mut(&id.as_i64()).expect("execution exists");
            assert!(!execution.is_terminal(), "finalize called twice");
            execution.status = status;
            execution.error = error;
            execution.ended_at = Some(chrono::Utc::now());
            Ok(())
        }
        async fn get_execution(
            &self,
            id: WorkflowExecutionId,
        ) -> Result<Option<WorkflowExecution>, ExecutionError> {
            Ok(self.executions.lock().unwrap().get(&id.as_i64()).cloned())
        }
        async fn append_step_execution(
            &self,
            _: WorkflowExecutionId,
            _: i32,
            _: &str,
            _: &str,
            _: serde_json::Value,
        ) -> Result<StepExecutionId, ExecutionError> {
            Ok(StepExecutionId::new())
        }
        async fn update_step(
            &self,
            _: StepExecutionId,
            _: StepExecutionStatus,
            _: Map<String, serde_json::Value>,
            _: String,
            _: Option<String>,
            _: bool,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn list_step_executions(
            &self,
            _: WorkflowExecutionId,
        ) -> Result<Vec<StepExecution>, ExecutionError> {
            unimplemented!()
        }
        async fn upsert_graph_node(
            &self,
            _: &str,
            _: NodeType,
            _: &str,
            _: &str,
            _: serde_json::Value,
        ) -> Result<(GraphNode, bool), GraphError> {
            unimplemented!()
        }
        async fn upsert_graph_edge(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: EdgeType,
            _: serde_json::Value,
        ) -> Result<(GraphEdge, bool), GraphError> {
            unimplemented!()
        }
        async fn get_graph(
            &self,
            _: &str,
        ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError> {
            unimplemented!()
        }
        async fn get_history(
            &self,
            _: &str,
            _: innominatus_db::pagination::Pagination,
        ) -> Result<innominatus_db::pagination::Page<ResourceStateTransition>, GraphError> {
            unimplemented!()
        }
        async fn get_teams_view(&self) -> Result<Vec<TeamSummary>, GraphError> {
            unimplemented!()
        }
    }

    fn noop_step(name: &str) -> StepDef {
        StepDef {
            name: name.to_string(),
            step_type: "noop".to_string(),
            config: serde_json::json!({ "k": "v" }),
            timeout_secs: None,
            retry: None,
            parallel_group: None,
        }
    }

    fn golden_path_definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            provider_name: "platform-team".to_string(),
            name: name.to_string(),
            parameters: vec![],
            steps: vec![noop_step("apply")],
            operation: DesiredOperation::Create,
            tags: vec![],
            category: WorkflowCategory::Goldenpath,
            rollback: vec![],
        }
    }

    fn executor(gateway: Arc<FakeGateway>) -> WorkflowExecutor {
        let mut handlers = HandlerRegistry::new(Duration::from_secs(5));
        handlers.register(Arc::new(NoopHandler));
        WorkflowExecutor::new(gateway, Arc::new(handlers), 8, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn run_golden_path_creates_its_own_execution_with_no_resource() {
        let gateway = Arc::new(FakeGateway::default());
        let executor = executor(Arc::clone(&gateway));
        let definition = golden_path_definition("rotate-credentials");

        let (execution_id, status) = executor
            .run_golden_path(
                "blog",
                &definition,
                Map::from([("scope".to_string(), serde_json::json!("db"))]),
                true,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
        let stored = gateway
            .get_execution(execution_id)
            .await
            .unwrap()
            .expect("execution persisted");
        assert_eq!(stored.resource_id, None);
        assert_eq!(stored.application_name, "blog");
        assert!(stored.is_terminal());
    }

    #[tokio::test]
    async fn run_succeeds_for_a_simple_sequential_workflow() {
        let gateway = Arc::new(FakeGateway::default());
        let executor = executor(Arc::clone(&gateway));
        let definition = golden_path_definition("provision-postgres");
        let execution_id = gateway
            .create_workflow_execution("blog", &definition.name, None, Map::new())
            .await
            .unwrap();

        let ctx = InterpolationContext::new(
            serde_json::json!({ "params": {} }),
            serde_json::json!({}),
        );
        let status = executor
            .run(execution_id, &definition, ctx, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, ExecutionStatus::Succeeded);
    }
}
