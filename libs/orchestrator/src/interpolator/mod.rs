//! Variable Interpolator: resolves `${namespace.path}` tokens against a
//! workflow's runtime context, substituting whole-value tokens with their
//! source type and stringifying tokens embedded in larger strings.

use std::collections::HashMap;

use innominatus_domain::{StepDef, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;

/// A missing variable, collected by strict mode or raised immediately by
/// lenient mode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("step '{step}' references undefined variable '${{{token}}}'")]
pub struct VariableError {
    pub step: String,
    pub token: String,
}

/// Strict mode collects every missing variable across the whole workflow
/// before execution starts; lenient mode only ever sees one step's config
/// at a time and so can only report that step's own missing variables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    #[error("{0} undefined variable(s): {1:?}")]
    Missing(usize, Vec<VariableError>),
}

/// Runtime context a workflow execution interpolates against:
/// `workflow.params.*`, `resources.<name>.<attr>`, and
/// `step.<name>.output.<key>` for steps that already ran.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    pub workflow: Value,
    pub resources: Value,
    pub step_outputs: HashMap<String, Value>,
}

impl InterpolationContext {
    #[must_use]
    pub fn new(workflow_params: Value, resources: Value) -> Self {
        Self {
            workflow: workflow_params,
            resources,
            step_outputs: HashMap::new(),
        }
    }

    pub fn record_step_output(&mut self, step_name: &str, output: Value) {
        self.step_outputs.insert(step_name.to_string(), output);
    }

    fn lookup(&self, token: &str) -> Option<Value> {
        let mut parts = token.split('.');
        let namespace = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        match namespace {
            "workflow" => lookup_path(&self.workflow, &rest),
            "resources" => lookup_path(&self.resources, &rest),
            "step" => {
                let (name, remainder) = rest.split_first()?;
                let output = self.step_outputs.get(*name)?;
                let object = serde_json::json!({ "output": output });
                lookup_path(&object, remainder)
            }
            _ => None,
        }
    }
}

fn lookup_path(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

/// Finds every `${...}` token in `value`'s entire structure and reports
/// which ones `ctx` cannot resolve, without substituting anything — used
/// by strict / pre-execution validation.
pub fn find_missing(
    step_name: &str,
    value: &Value,
    ctx: &InterpolationContext,
) -> Vec<VariableError> {
    let mut missing = Vec::new();
    collect_missing(step_name, value, ctx, &mut missing);
    missing
}

fn collect_missing(
    step_name: &str,
    value: &Value,
    ctx: &InterpolationContext,
    missing: &mut Vec<VariableError>,
) {
    match value {
        Value::String(s) => {
            for token in extract_tokens(s) {
                if ctx.lookup(&token).is_none() {
                    missing.push(VariableError {
                        step: step_name.to_string(),
                        token,
                    });
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_missing(step_name, item, ctx, missing);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_missing(step_name, item, ctx, missing);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Strict / pre-execution mode: walk every step's rendered config
/// once, before step 1, and report all missing variables together.
pub fn validate_strict(
    def: &WorkflowDefinition,
    ctx: &InterpolationContext,
) -> Result<(), InterpolationError> {
    let mut missing = Vec::new();
    for step in &def.steps {
        missing.extend(find_missing(&step.name, &step.config, ctx));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        let count = missing.len();
        Err(InterpolationError::Missing(count, missing))
    }
}

/// Renders `value`, substituting every resolvable `${...}` token. A token
/// that is the entire string value keeps its source JSON type; a token
/// embedded in a longer string is stringified. Returns the first missing
/// variable encountered (lenient / per-step mode).
pub fn render(
    step_name: &str,
    value: &Value,
    ctx: &InterpolationContext,
) -> Result<Value, VariableError> {
    match value {
        Value::String(s) => render_string(step_name, s, ctx),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>, VariableError> = items
                .iter()
                .map(|item| render(step_name, item, ctx))
                .collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut rendered = serde_json::Map::new();
            for (key, item) in map {
                rendered.insert(key.clone(), render(step_name, item, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(step_name: &str, s: &str, ctx: &InterpolationContext) -> Result<Value, VariableError> {
    if let Some(token) = whole_token(s) {
        return ctx.lookup(&token).ok_or_else(|| VariableError {
            step: step_name.to_string(),
            token,
        });
    }

    let mut result = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            result.push_str(rest);
            rest = "";
            break;
        };
        result.push_str(&rest[..start]);
        let token = &rest[start + 2..start + end];
        let resolved = ctx.lookup(token).ok_or_else(|| VariableError {
            step: step_name.to_string(),
            token: token.to_string(),
        })?;
        result.push_str(&value_to_string(&resolved));
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    Ok(Value::String(result))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `Some(token)` when `s` is exactly one `${...}` token with nothing else
/// around it, so a whole-value substitution can preserve the source type.
fn whole_token(s: &str) -> Option<String> {
    let trimmed = s.strip_prefix("${")?.strip_suffix('}')?;
    if trimmed.contains("${") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extract_tokens(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        tokens.push(rest[start + 2..start + end].to_string());
        rest = &rest[start + end + 1..];
    }
    tokens
}

/// Builds the rendered config for `step`, applying [`render`] in whichever
/// mode `strict` implies. Lenient mode may reference any earlier step's
/// output; strict mode should have already been checked with
/// [`validate_strict`] before the workflow starts.
pub fn render_step(
    step: &StepDef,
    ctx: &InterpolationContext,
) -> Result<Value, VariableError> {
    render(&step.name, &step.config, ctx)
}
