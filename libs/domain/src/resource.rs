//! Resource Instance: a declared infrastructure/service dependency with a lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::enums::{DesiredOperation, ResourceState};
use crate::ids::{ResourceId, WorkflowExecutionId};

/// A resource instance belonging to exactly one application.
///
/// Identity is `(application_name, name)`; `id` is a surrogate used by
/// foreign keys elsewhere (step outputs, transitions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub application_name: String,
    pub name: String,
    /// Free-form string keyed into provider capabilities, e.g. `"postgres"`.
    pub resource_type: String,
    /// Opaque key/value configuration, passed through to the workflow's
    /// parameter snapshot untouched.
    pub configuration: HashMap<String, serde_json::Value>,
    pub desired_operation: DesiredOperation,
    pub state: ResourceState,
    /// Explicit workflow name/tags to bypass the resolver, if set.
    pub workflow_override: Option<String>,
    pub workflow_tags: Vec<String>,
    pub workflow_execution_id: Option<WorkflowExecutionId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// The `(type, operation, tags)` triple the resolver needs, honoring the
    /// resource's `workflow_override` (tags still apply; the override only
    /// pins the workflow name itself, not the resolution path — see
    /// `crate::provider`).
    #[must_use]
    pub fn resolution_key(&self) -> (&str, DesiredOperation, &[String]) {
        (&self.resource_type, self.desired_operation, &self.workflow_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Resource {
        Resource {
            id: ResourceId::new(),
            application_name: "blog".to_string(),
            name: "db".to_string(),
            resource_type: "postgres".to_string(),
            configuration: HashMap::new(),
            desired_operation: DesiredOperation::Create,
            state: ResourceState::Requested,
            workflow_override: None,
            workflow_tags: vec![],
            workflow_execution_id: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resolution_key_reflects_type_and_operation() {
        let r = sample();
        let (ty, op, tags) = r.resolution_key();
        assert_eq!(ty, "postgres");
        assert_eq!(op, DesiredOperation::Create);
        assert!(tags.is_empty());
    }

    #[test]
    fn resource_serde_roundtrip() {
        let r = sample();
        let json = serde_json::to_string(&r).unwrap();
        let back: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "db");
        assert_eq!(back.state, ResourceState::Requested);
    }
}
