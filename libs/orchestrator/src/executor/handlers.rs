//! Step Executor Registry: dispatches a rendered step config to the
//! `Handler` registered for its `type` string, enforcing the effective
//! timeout around every invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Outputs a handler returns on success: a flat map merged into the
/// execution context under `step.<name>.output`, plus free-form logs.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub outputs: Value,
    pub logs: String,
}

impl StepOutcome {
    #[must_use]
    pub fn new(outputs: Value, logs: impl Into<String>) -> Self {
        Self {
            outputs,
            logs: logs.into(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("handler execution failed: {0}")]
    Failed(String),
    #[error("step timed out after {0:?}")]
    Timeout(Duration),
    #[error("no handler registered for step type '{0}'")]
    NotFound(String),
}

/// What a handler needs to run one step: its rendered config and a
/// cancellation token it must honor promptly.
pub struct StepInvocation<'a> {
    pub execution_id: i64,
    pub step_name: &'a str,
    pub rendered_config: &'a Value,
    pub cancellation: CancellationToken,
}

/// Opaque to the core: the registry trusts whatever a handler returns. New
/// step types are added by implementing this trait and registering an
/// instance; the core never hardcodes step-type behavior.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, HandlerError>;

    fn step_type(&self) -> &str;
}

/// Maps a step's `type` string to the handler that runs it, and wraps every
/// invocation with the step's effective deadline (min of step-level,
/// workflow-level, and the registry default).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    default_timeout: Duration,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            default_timeout,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers
            .insert(handler.step_type().to_string(), handler);
    }

    #[must_use]
    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    /// Runs `invocation` against the handler registered for `step_type`,
    /// cancelling it if `deadline` (step/workflow override, falling back to
    /// the registry default) elapses first.
    pub async fn run(
        &self,
        step_type: &str,
        deadline: Option<Duration>,
        invocation: StepInvocation<'_>,
    ) -> Result<StepOutcome, HandlerError> {
        let handler = self
            .get(step_type)
            .ok_or_else(|| HandlerError::NotFound(step_type.to_string()))?;

        let effective_timeout = deadline.unwrap_or(self.default_timeout);
        let cancellation = invocation.cancellation.clone();

        tokio::select! {
            result = handler.execute(invocation) => result,
            () = tokio::time::sleep(effective_timeout) => {
                cancellation.cancel();
                Err(HandlerError::Timeout(effective_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl StepHandler for EchoHandler {
        async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, HandlerError> {
            Ok(StepOutcome::new(invocation.rendered_config.clone(), "ok"))
        }

        fn step_type(&self) -> &str {
            "echo"
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl StepHandler for SlowHandler {
        async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, HandlerError> {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(60)) => {
                    Ok(StepOutcome::default())
                }
                () = invocation.cancellation.cancelled() => {
                    Err(HandlerError::Failed("cancelled".to_string()))
                }
            }
        }

        fn step_type(&self) -> &str {
            "slow"
        }
    }

    fn invocation(config: &Value) -> StepInvocation<'_> {
        StepInvocation {
            execution_id: 1,
            step_name: "apply",
            rendered_config: config,
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = HandlerRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(EchoHandler));
        let config = json!({ "k": "v" });
        let outcome = registry.run("echo", None, invocation(&config)).await.unwrap();
        assert_eq!(outcome.outputs, config);
    }

    #[tokio::test]
    async fn unknown_step_type_is_not_found() {
        let registry = HandlerRegistry::new(Duration::from_secs(5));
        let config = json!({});
        let err = registry.run("missing", None, invocation(&config)).await.unwrap_err();
        assert!(matches!(err, HandlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn step_level_timeout_cancels_slow_handler() {
        let mut registry = HandlerRegistry::new(Duration::from_secs(30));
        registry.register(Arc::new(SlowHandler));
        let config = json!({});
        let err = registry
            .run("slow", Some(Duration::from_millis(20)), invocation(&config))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Timeout(_)));
    }
}
