//! Provider Registry & Resolver: loads provider manifests into an
//! immutable snapshot and resolves `(resource_type, operation, tags)` to a
//! concrete workflow, with global capability-conflict detection at load
//! time.

mod manifest;
mod schema;

pub use manifest::{ManifestSource, ProviderManifest};

use std::collections::HashMap;
use std::sync::Arc;

use innominatus_domain::{DesiredOperation, Provider, ResourceTypeCapability, WorkflowDefinition};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced while loading a set of manifests into a new snapshot.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("manifest {source}: invalid YAML: {source_err}")]
    Yaml {
        source: String,
        #[source]
        source_err: serde_yml::Error,
    },
    #[error("manifest {source}: schema validation failed: {reason}")]
    Schema { source: String, reason: String },
    #[error(
        "alias '{alias}' in provider '{provider}' targets unknown canonical type '{target}'"
    )]
    UnknownAlias {
        provider: String,
        alias: String,
        target: String,
    },
    #[error(
        "capability conflict: providers {providers:?} all declare a default workflow for \
         ({resource_type}, {operation:?})"
    )]
    Conflict {
        resource_type: String,
        operation: DesiredOperation,
        providers: Vec<String>,
    },
    #[error("workflow file read/parse failed for provider '{provider}', file '{file}': {reason}")]
    WorkflowFile {
        provider: String,
        file: String,
        reason: String,
    },
}

/// Resolver failure modes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no workflow registered for resource type '{resource_type}' operation {operation:?}")]
    NotFound {
        resource_type: String,
        operation: DesiredOperation,
    },
    #[error(
        "ambiguous resolution for ({resource_type}, {operation:?}): {candidates:?} all match \
         and none is marked default"
    )]
    Ambiguous {
        resource_type: String,
        operation: DesiredOperation,
        candidates: Vec<String>,
    },
}

/// One resolved `(provider, workflow)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub provider_name: String,
    pub workflow_name: String,
}

/// An immutable, fully-validated view of every loaded provider and its
/// parsed workflow definitions. Readers hold an `Arc` to one of these;
/// [`ProviderRegistry::reload`] swaps in a new one wholesale: swapping
/// is atomic under an exclusive lock.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    providers: Vec<Provider>,
    /// Alias -> canonical type, flattened across all providers.
    aliases: HashMap<String, String>,
    /// `(provider_name, workflow_name)` -> parsed definition.
    workflows: HashMap<(String, String), WorkflowDefinition>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    #[must_use]
    pub fn workflow(&self, provider: &str, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows
            .get(&(provider.to_string(), name.to_string()))
    }

    /// Which provider declares `workflow_name`, for resources with an
    /// explicit `workflow_override` that bypasses tag/operation resolution
    /// entirely. The override only pins the workflow name,
    /// not the provider, so the first declaring provider wins.
    #[must_use]
    pub fn find_workflow_owner(&self, workflow_name: &str) -> Option<&str> {
        self.workflows
            .keys()
            .find(|(_, name)| name == workflow_name)
            .map(|(provider, _)| provider.as_str())
    }

    fn canonicalize<'a>(&'a self, resource_type: &'a str) -> &'a str {
        self.aliases
            .get(resource_type)
            .map_or(resource_type, String::as_str)
    }

    /// Resolves a resource type, operation, and tag set to a concrete
    /// provider workflow.
    pub fn resolve(
        &self,
        resource_type: &str,
        operation: DesiredOperation,
        tags: &[String],
    ) -> Result<Resolution, ResolveError> {
        let canonical = self.canonicalize(resource_type);

        for provider in &self.providers {
            let Some(capability) = provider
                .capabilities
                .iter()
                .find(|c| self.canonicalize(&c.resource_type) == canonical)
            else {
                continue;
            };
            let Some(op) = capability.operations.iter().find(|o| o.operation == operation) else {
                continue;
            };

            if let Some(name) = &op.workflow {
                return Ok(Resolution {
                    provider_name: provider.name.clone(),
                    workflow_name: name.clone(),
                });
            }

            let matching: Vec<&str> = op
                .workflows
                .iter()
                .filter(|choice| tags.iter().all(|t| choice.tags.contains(t)))
                .map(|choice| choice.name.as_str())
                .collect();

            if matching.is_empty() {
                return Err(ResolveError::NotFound {
                    resource_type: resource_type.to_string(),
                    operation,
                });
            }

            if matching.len() == 1 {
                return Ok(Resolution {
                    provider_name: provider.name.clone(),
                    workflow_name: matching[0].to_string(),
                });
            }

            return op
                .default
                .as_ref()
                .filter(|d| matching.contains(&d.as_str()))
                .map(|d| Resolution {
                    provider_name: provider.name.clone(),
                    workflow_name: d.clone(),
                })
                .ok_or_else(|| ResolveError::Ambiguous {
                    resource_type: resource_type.to_string(),
                    operation,
                    candidates: matching.into_iter().map(str::to_string).collect(),
                });
        }

        Err(ResolveError::NotFound {
            resource_type: resource_type.to_string(),
            operation,
        })
    }
}

/// Checks every `(canonical_type, operation)` pair across all providers for
/// more than one unconditional default workflow.
fn check_global_conflicts(
    providers: &[Provider],
    aliases: &HashMap<String, String>,
) -> Result<(), LoadError> {
    let canon = |t: &str| aliases.get(t).cloned().unwrap_or_else(|| t.to_string());

    let mut defaults: HashMap<(String, DesiredOperation), Vec<String>> = HashMap::new();
    for provider in providers {
        for capability in &provider.capabilities {
            if capability.alias_for.is_some() {
                continue;
            }
            let canonical = canon(&capability.resource_type);
            for op in &capability.operations {
                let has_unconditional_default = op.workflow.is_some()
                    || (op.workflows.len() == 1)
                    || op.default.is_some();
                if has_unconditional_default {
                    defaults
                        .entry((canonical.clone(), op.operation))
                        .or_default()
                        .push(provider.name.clone());
                }
            }
        }
    }

    for ((resource_type, operation), providers) in defaults {
        if providers.len() > 1 {
            return Err(LoadError::Conflict {
                resource_type,
                operation,
                providers,
            });
        }
    }

    Ok(())
}

fn build_snapshot(
    providers: Vec<Provider>,
    parsed_workflows: HashMap<(String, String), WorkflowDefinition>,
) -> Result<RegistrySnapshot, LoadError> {
    let mut aliases = HashMap::new();
    let canonical_types: std::collections::HashSet<&str> = providers
        .iter()
        .flat_map(|p| p.capabilities.iter())
        .filter(|c| c.alias_for.is_none())
        .map(|c| c.resource_type.as_str())
        .collect();

    for provider in &providers {
        for capability in &provider.capabilities {
            if let Some(target) = &capability.alias_for {
                if !canonical_types.contains(target.as_str()) {
                    return Err(LoadError::UnknownAlias {
                        provider: provider.name.clone(),
                        alias: capability.resource_type.clone(),
                        target: target.clone(),
                    });
                }
                aliases.insert(capability.resource_type.clone(), target.clone());
            }
        }
    }

    check_global_conflicts(&providers, &aliases)?;

    Ok(RegistrySnapshot {
        providers,
        aliases,
        workflows: parsed_workflows,
    })
}

/// The process-wide provider registry singleton. Readers take a cheap
/// `Arc` clone of the current snapshot; [`Self::reload`] swaps it under an
/// exclusive lock, which the reconciler tick respects by skipping for the
/// duration.
pub struct ProviderRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ProviderRegistry {
    /// Parse and validate every manifest `source`, building the initial
    /// snapshot. Aborts (returns `Err`, snapshot left empty) on any schema
    /// violation, unknown alias target, or capability conflict.
    pub async fn load(sources: &[ManifestSource]) -> Result<Self, LoadError> {
        let snapshot = Self::build(sources).await?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    async fn build(sources: &[ManifestSource]) -> Result<RegistrySnapshot, LoadError> {
        let mut providers = Vec::new();
        let mut workflows = HashMap::new();

        for source in sources {
            let provider = ProviderManifest::parse(source)?.provider;

            for entry in &provider.workflows {
                let body = source.read_workflow_file(&entry.file).map_err(|e| {
                    LoadError::WorkflowFile {
                        provider: provider.name.clone(),
                        file: entry.file.clone(),
                        reason: e,
                    }
                })?;
                let def: crate::parser::WorkflowFile = serde_yml::from_str(&body).map_err(|e| {
                    LoadError::WorkflowFile {
                        provider: provider.name.clone(),
                        file: entry.file.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let definition = crate::parser::into_definition(
                    &provider.name,
                    entry.name.clone(),
                    entry.operation,
                    entry.category,
                    entry.tags.clone(),
                    def,
                )
                .map_err(|e| LoadError::WorkflowFile {
                    provider: provider.name.clone(),
                    file: entry.file.clone(),
                    reason: e.to_string(),
                })?;
                workflows.insert((provider.name.clone(), entry.name.clone()), definition);
            }

            providers.push(provider);
        }

        build_snapshot(providers, workflows)
    }

    /// Builds a brand new snapshot from `sources` and, only
    /// if it validates cleanly, swaps it in under the exclusive write
    /// lock. A failed reload leaves the previous snapshot fully in effect.
    pub async fn reload(&self, sources: &[ManifestSource]) -> Result<(), LoadError> {
        let next = Self::build(sources).await?;
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Cheap `Arc` clone of the current snapshot for a resolver call.
    pub async fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Non-blocking snapshot fetch: `None` if [`Self::reload`] currently
    /// holds the exclusive write lock mid-swap. The reconciler tick uses
    /// this to skip leasing new work for the duration of a reload without
    /// blocking on it.
    #[must_use]
    pub fn try_current(&self) -> Option<Arc<RegistrySnapshot>> {
        self.snapshot.try_read().ok().map(|guard| Arc::clone(&*guard))
    }

    pub async fn resolve(
        &self,
        resource_type: &str,
        operation: DesiredOperation,
        tags: &[String],
    ) -> Result<Resolution, ResolveError> {
        self.current().await.resolve(resource_type, operation, tags)
    }
}

/// Capabilities declared by a provider, flattened for validator lookups.
#[must_use]
pub fn capability_resource_types(capabilities: &[ResourceTypeCapability]) -> Vec<&str> {
    capabilities.iter().map(|c| c.resource_type.as_str()).collect()
}
