//! A couple of always-registered step handlers. Every handler that talks
//! to an external system (`terraform`, `kubectl`, `ansible`, a GitOps
//! controller) is an external collaborator registered by the binary that
//! embeds this crate; these two are the only ones the core itself
//! ships, since golden-path workflows and tests need something to dispatch
//! to that has no real-world side effect.

use async_trait::async_trait;

use super::handlers::{HandlerError, StepHandler, StepInvocation, StepOutcome};

/// Echoes its rendered config back as output and does nothing else. Useful
/// for golden-path workflows that only need to fan variables through, and
/// for exercising the executor/interpolator without a real step handler.
pub struct NoopHandler;

#[async_trait]
impl StepHandler for NoopHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, HandlerError> {
        Ok(StepOutcome::new(
            invocation.rendered_config.clone(),
            format!("noop: {}", invocation.step_name),
        ))
    }

    fn step_type(&self) -> &str {
        "noop"
    }
}

/// Sleeps for a configured number of milliseconds (`config.duration_ms`,
/// default 0) before succeeding. Used to exercise step timeouts and retry
/// policies without a real handler.
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, HandlerError> {
        let millis = invocation
            .rendered_config
            .get("duration_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        tokio::select! {
            () = tokio::time::sleep(std::time::Duration::from_millis(millis)) => {
                Ok(StepOutcome::new(serde_json::json!({ "slept_ms": millis }), "delay: done"))
            }
            () = invocation.cancellation.cancelled() => {
                Err(HandlerError::Failed("cancelled".to_string()))
            }
        }
    }

    fn step_type(&self) -> &str {
        "delay"
    }
}
