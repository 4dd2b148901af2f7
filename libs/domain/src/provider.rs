//! Provider: a named bundle of workflows that claims capability for one or
//! more resource types. These are pure data types describing a loaded
//! provider manifest; parsing and resolution live in the orchestrator crate.

use serde::{Deserialize, Serialize};

use crate::enums::{DesiredOperation, WorkflowCategory};

/// A single `(operation -> workflow)` declaration for a resource type,
/// optionally narrowed by tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowChoice {
    pub name: String,
    pub tags: Vec<String>,
}

/// What a provider declares for one `(resource_type, operation)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCapability {
    pub operation: DesiredOperation,
    /// A single unconditional workflow, or a tag-filtered list (at most one
    /// of the two is populated by the manifest parser).
    pub workflow: Option<String>,
    pub workflows: Vec<WorkflowChoice>,
    /// Required when `workflows` has more than one entry with no tag filter
    /// that narrows to a single match.
    pub default: Option<String>,
}

/// A capability declaration: this provider claims to handle `resource_type`,
/// optionally as an alias of another canonical type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTypeCapability {
    pub resource_type: String,
    pub alias_for: Option<String>,
    pub operations: Vec<OperationCapability>,
}

/// A workflow reference declared by a provider manifest, pointing at a
/// workflow definition file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowManifestEntry {
    pub name: String,
    pub file: String,
    pub category: WorkflowCategory,
    pub operation: DesiredOperation,
    pub tags: Vec<String>,
}

/// A fully loaded provider: its capabilities plus the workflow files it
/// declares, as read from one manifest source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub capabilities: Vec<ResourceTypeCapability>,
    pub workflows: Vec<WorkflowManifestEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_serde_roundtrip() {
        let provider = Provider {
            name: "database-team".to_string(),
            capabilities: vec![ResourceTypeCapability {
                resource_type: "postgres".to_string(),
                alias_for: None,
                operations: vec![OperationCapability {
                    operation: DesiredOperation::Create,
                    workflow: Some("provision-postgres".to_string()),
                    workflows: vec![],
                    default: None,
                }],
            }],
            workflows: vec![WorkflowManifestEntry {
                name: "provision-postgres".to_string(),
                file: "workflows/provision-postgres.yaml".to_string(),
                category: WorkflowCategory::Provisioner,
                operation: DesiredOperation::Create,
                tags: vec![],
            }],
        };
        let json = serde_json::to_string(&provider).unwrap();
        let back: Provider = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "database-team");
        assert_eq!(back.capabilities.len(), 1);
    }
}
