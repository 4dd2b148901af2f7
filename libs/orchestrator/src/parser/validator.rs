//! Structural validation for a parsed workflow definition: step reference
//! checks with typo suggestions, parallel group sanity, and retry policy
//! bounds.

use std::collections::HashSet;

use innominatus_domain::WorkflowDefinition;
use thiserror::Error;

/// A validation failure with an optional location and typo suggestion, in
/// the style of a user-facing configuration error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub location: Option<String>,
    pub suggestion: Option<String>,
}

impl ValidationError {
    #[must_use]
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            suggestion: None,
        }
    }

    #[must_use]
    fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

pub(super) fn validate(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    validate_unique_step_names(def)?;
    validate_rollback_references(def)?;
    validate_parallel_groups(def)?;
    validate_retry_policies(def)?;
    Ok(())
}

fn validate_unique_step_names(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for step in &def.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ValidationError::new(format!(
                "duplicate step name '{}' in workflow '{}'",
                step.name, def.name
            )));
        }
    }
    if def.steps.is_empty() {
        return Err(ValidationError::new(format!(
            "workflow '{}' has no steps",
            def.name
        )));
    }
    Ok(())
}

fn validate_rollback_references(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    let step_names: HashSet<&str> = def.steps.iter().map(|s| s.name.as_str()).collect();
    for (idx, name) in def.rollback.iter().enumerate() {
        if !step_names.contains(name.as_str()) {
            let suggestion = find_similar(name, &step_names);
            return Err(ValidationError::new(format!(
                "rollback step '{name}' is not a step in workflow '{}'",
                def.name
            ))
            .with_location(format!("rollback[{idx}]"))
            .with_suggestion(suggestion.map_or_else(String::new, |s| format!("did you mean '{s}'?"))));
        }
    }
    Ok(())
}

fn validate_parallel_groups(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    use std::collections::HashMap;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for step in &def.steps {
        if let Some(group) = &step.parallel_group {
            *counts.entry(group.as_str()).or_default() += 1;
        }
    }
    for (group, count) in counts {
        if count < 2 {
            return Err(ValidationError::new(format!(
                "parallel group '{group}' in workflow '{}' has only one member; remove the group \
                 or add a sibling",
                def.name
            )));
        }
    }
    Ok(())
}

fn validate_retry_policies(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    for (idx, step) in def.steps.iter().enumerate() {
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(ValidationError::new(format!(
                    "step '{}' retry.max_attempts must be at least 1",
                    step.name
                ))
                .with_location(format!("steps[{idx}].retry.max_attempts")));
            }
            if retry.multiplier < 1.0 {
                return Err(ValidationError::new(format!(
                    "step '{}' retry.multiplier must be >= 1.0",
                    step.name
                ))
                .with_location(format!("steps[{idx}].retry.multiplier")));
            }
        }
    }
    Ok(())
}

fn find_similar<'a>(target: &str, candidates: &HashSet<&'a str>) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    let mut best_distance = usize::MAX;
    for &candidate in candidates {
        let distance = strsim::levenshtein(target, candidate);
        if distance < best_distance && distance <= 3 {
            best_distance = distance;
            best = Some(candidate);
        }
    }
    best
}
