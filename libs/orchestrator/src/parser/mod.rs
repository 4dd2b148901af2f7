//! Parses a workflow YAML file's step list into a
//! [`innominatus_domain::WorkflowDefinition`] and validates its structure:
//! unique step names, resolvable rollback references, and sane parallel
//! groups. The registry calls this once per workflow file at load time so
//! a bad workflow fails the whole manifest load rather than surfacing at
//! dispatch.

mod validator;

pub use validator::ValidationError;

use innominatus_domain::{
    DesiredOperation, ParameterDef, RetryPolicy, StepDef, WorkflowCategory, WorkflowDefinition,
};
use serde::Deserialize;

/// Raw shape of a workflow YAML file, before the provider-manifest entry's
/// identity (provider, name, operation, category, tags) is attached.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub rollback: Vec<String>,
}

/// Attaches a workflow file's manifest identity and validates the result.
pub fn into_definition(
    provider_name: &str,
    name: String,
    operation: DesiredOperation,
    category: WorkflowCategory,
    tags: Vec<String>,
    file: WorkflowFile,
) -> Result<WorkflowDefinition, ValidationError> {
    let definition = WorkflowDefinition {
        provider_name: provider_name.to_string(),
        name,
        parameters: file.parameters,
        steps: file.steps,
        operation,
        tags,
        category,
        rollback: file.rollback,
    };

    validator::validate(&definition)?;
    Ok(definition)
}

#[must_use]
pub fn default_retry() -> RetryPolicy {
    RetryPolicy::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use innominatus_domain::ParameterType;

    fn step(name: &str, group: Option<&str>) -> StepDef {
        StepDef {
            name: name.to_string(),
            step_type: "noop".to_string(),
            config: serde_json::json!({}),
            timeout_secs: None,
            retry: None,
            parallel_group: group.map(str::to_string),
        }
    }

    #[test]
    fn well_formed_workflow_parses() {
        let file = WorkflowFile {
            parameters: vec![ParameterDef {
                name: "size".to_string(),
                param_type: ParameterType::String,
                required: true,
                default: None,
                constraints: vec![],
            }],
            steps: vec![step("create-ns", None), step("apply", None)],
            rollback: vec!["create-ns".to_string()],
        };
        let def = into_definition(
            "database-team",
            "provision-postgres".to_string(),
            DesiredOperation::Create,
            WorkflowCategory::Provisioner,
            vec![],
            file,
        )
        .unwrap();
        assert_eq!(def.steps.len(), 2);
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let file = WorkflowFile {
            parameters: vec![],
            steps: vec![step("apply", None), step("apply", None)],
            rollback: vec![],
        };
        let err = into_definition(
            "database-team",
            "broken".to_string(),
            DesiredOperation::Create,
            WorkflowCategory::Provisioner,
            vec![],
            file,
        )
        .unwrap_err();
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn rollback_referencing_unknown_step_is_rejected_with_suggestion() {
        let file = WorkflowFile {
            parameters: vec![],
            steps: vec![step("create-ns", None)],
            rollback: vec!["create-nss".to_string()],
        };
        let err = into_definition(
            "database-team",
            "broken".to_string(),
            DesiredOperation::Create,
            WorkflowCategory::Provisioner,
            vec![],
            file,
        )
        .unwrap_err();
        assert!(err.suggestion.as_deref().is_some_and(|s| s.contains("create-ns")));
    }
}
