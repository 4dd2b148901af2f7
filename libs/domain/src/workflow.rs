//! Workflow Definition: the parsed, in-memory-cached shape of a workflow
//! file. Parsing and validation live in the orchestrator crate; these are
//! the pure data types the parser produces and the executor and resolver
//! consume.

use serde::{Deserialize, Serialize};

use crate::enums::{DesiredOperation, WorkflowCategory};

/// Declared type of a workflow parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Int,
    Bool,
    Duration,
    Enum,
}

/// One declared parameter of a workflow, as authored in the `parameters:`
/// block of a workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    pub default: Option<serde_json::Value>,
    /// Allowed values; only meaningful when `param_type` is `Enum`.
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Retry policy for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_secs: 1,
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

/// One step in a workflow's authored order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
    /// Steps sharing a `parallel_group` run concurrently as one unit; their
    /// relative order in `steps` does not matter, only their position
    /// relative to non-group siblings.
    pub parallel_group: Option<String>,
}

/// A parsed, cached workflow definition: `(provider_name, workflow_name)`
/// identity, declared parameters, and the ordered step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub provider_name: String,
    pub name: String,
    pub parameters: Vec<ParameterDef>,
    /// Authored order; use [`WorkflowDefinition::execution_order`] to get
    /// the grouped sequential/parallel run order the executor follows.
    pub steps: Vec<StepDef>,
    pub operation: DesiredOperation,
    pub tags: Vec<String>,
    pub category: WorkflowCategory,
    /// Step names to run, in reverse authored order, on a failed/compensated
    /// execution.
    #[serde(default)]
    pub rollback: Vec<String>,
}

/// One unit of the executor's run order: either a single sequential step,
/// or a parallel group whose members have no mutual ordering.
#[derive(Debug, Clone)]
pub enum ExecutionUnit<'a> {
    Single(&'a StepDef),
    Parallel(Vec<&'a StepDef>),
}

impl WorkflowDefinition {
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Group authored steps into the executor's run order: consecutive
    /// steps sharing a `parallel_group` collapse into one
    /// [`ExecutionUnit::Parallel`]; a group's position is the position of
    /// its first member, and group membership need not be contiguous in
    /// the authored list — all members of a group are pulled into the unit
    /// the first time that group id is seen.
    #[must_use]
    pub fn execution_order(&self) -> Vec<ExecutionUnit<'_>> {
        let mut seen_groups = std::collections::HashSet::new();
        let mut order = Vec::new();

        for step in &self.steps {
            match &step.parallel_group {
                None => order.push(ExecutionUnit::Single(step)),
                Some(group) => {
                    if seen_groups.insert(group.clone()) {
                        let members: Vec<&StepDef> = self
                            .steps
                            .iter()
                            .filter(|s| s.parallel_group.as_deref() == Some(group.as_str()))
                            .collect();
                        order.push(ExecutionUnit::Parallel(members));
                    }
                }
            }
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn workflow(steps: Vec<StepDef>) -> WorkflowDefinition {
        WorkflowDefinition {
            provider_name: "database-team".to_string(),
            name: "provision-postgres".to_string(),
            parameters: vec![],
            steps,
            operation: DesiredOperation::Create,
            tags: vec![],
            category: WorkflowCategory::Provisioner,
            rollback: vec![],
        }
    }

    #[test]
    fn sequential_steps_are_all_single_units() {
        let wf = workflow(vec![step("create-ns", None), step("apply", None)]);
        let order = wf.execution_order();
        assert_eq!(order.len(), 2);
        assert!(matches!(order[0], ExecutionUnit::Single(s) if s.name == "create-ns"));
        assert!(matches!(order[1], ExecutionUnit::Single(s) if s.name == "apply"));
    }

    #[test]
    fn grouped_steps_collapse_into_one_parallel_unit() {
        let wf = workflow(vec![
            step("seed", None),
            step("a", Some("g1")),
            step("b", Some("g1")),
            step("finalize", None),
        ]);
        let order = wf.execution_order();
        assert_eq!(order.len(), 3);
        match &order[1] {
            ExecutionUnit::Parallel(members) => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].name, "a");
                assert_eq!(members[1].name, "b");
            }
            ExecutionUnit::Single(_) => panic!("expected parallel unit"),
        }
    }

    #[test]
    fn step_lookup_by_name() {
        let wf = workflow(vec![step("create-ns", None)]);
        assert!(wf.step("create-ns").is_some());
        assert!(wf.step("missing").is_none());
    }
}
