//! Resource State Transition: the append-only audit row for resource state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::ResourceState;
use crate::ids::{ResourceId, TransitionId, WorkflowExecutionId};

/// One recorded transition of a resource from one state to another.
///
/// Append-only: rows are never updated or deleted. Rows are durable for
/// the lifetime of the resource but nothing prevents external retention
/// policies from pruning old ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStateTransition {
    pub id: TransitionId,
    pub resource_id: ResourceId,
    pub from_state: ResourceState,
    pub to_state: ResourceState,
    pub reason: String,
    pub workflow_execution_id: Option<WorkflowExecutionId>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_serde_roundtrip() {
        let t = ResourceStateTransition {
            id: TransitionId::new(),
            resource_id: ResourceId::new(),
            from_state: ResourceState::Requested,
            to_state: ResourceState::Provisioning,
            reason: "leased by reconciler".to_string(),
            workflow_execution_id: Some(WorkflowExecutionId::from_raw(7)),
            at: Utc::now(),
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: ResourceStateTransition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.from_state, ResourceState::Requested);
        assert_eq!(back.to_state, ResourceState::Provisioning);
    }
}
