//! Workflow Execution and Step Execution: the run-time record of a single
//! workflow invocation and its constituent steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::enums::{ExecutionStatus, StepExecutionStatus};
use crate::ids::{ResourceId, StepExecutionId, WorkflowExecutionId};

/// A single run of a workflow against an application (and, for
/// provisioner workflows, a resource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: WorkflowExecutionId,
    pub application_name: String,
    pub workflow_name: String,
    /// `None` for golden-path invocations, which are not tied to a resource.
    pub resource_id: Option<ResourceId>,
    pub status: ExecutionStatus,
    /// The resolved parameter map the workflow ran with, captured at start
    /// so retries/audits can see exactly what was rendered.
    pub params: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One step within a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub execution_id: WorkflowExecutionId,
    /// Position within the execution; unique together with `execution_id`.
    pub idx: i32,
    pub name: String,
    pub step_type: String,
    pub status: StepExecutionStatus,
    /// The config map after variable interpolation, as actually dispatched
    /// to the handler.
    pub rendered_config: serde_json::Value,
    pub outputs: HashMap<String, serde_json::Value>,
    /// Tail of the handler's captured log output, bounded by the caller.
    pub logs: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_is_terminal_matches_status() {
        let mut exec = WorkflowExecution {
            id: WorkflowExecutionId::from_raw(1),
            application_name: "blog".to_string(),
            workflow_name: "provision-postgres".to_string(),
            resource_id: None,
            status: ExecutionStatus::Running,
            params: HashMap::new(),
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        assert!(!exec.is_terminal());
        exec.status = ExecutionStatus::Succeeded;
        assert!(exec.is_terminal());
    }

    #[test]
    fn step_execution_skipped_is_terminal() {
        let step = StepExecution {
            id: StepExecutionId::new(),
            execution_id: WorkflowExecutionId::from_raw(1),
            idx: 0,
            name: "create-ns".to_string(),
            step_type: "kubernetes-apply".to_string(),
            status: StepExecutionStatus::Skipped,
            rendered_config: serde_json::json!({}),
            outputs: HashMap::new(),
            logs: String::new(),
            error: None,
            started_at: None,
            ended_at: None,
        };
        assert!(step.is_terminal());
    }
}
