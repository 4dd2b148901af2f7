//! Reads a provider manifest (`provider.yaml` plus its referenced workflow
//! files) from disk and validates it against the manifest schema before any
//! of its content reaches the rest of the registry.

use std::path::{Path, PathBuf};

use innominatus_domain::Provider;

use super::schema::validate_manifest_schema;
use super::LoadError;

/// Where a provider's manifest and workflow files live. `Directory` is the
/// production case (a checked-out manifest repository); `Inline` lets tests
/// build a manifest without touching the filesystem.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Directory(PathBuf),
    Inline {
        label: String,
        manifest_yaml: String,
        workflow_files: std::collections::HashMap<String, String>,
    },
}

impl ManifestSource {
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    fn label(&self) -> String {
        match self {
            Self::Directory(path) => path.display().to_string(),
            Self::Inline { label, .. } => label.clone(),
        }
    }

    fn read_manifest(&self) -> Result<String, String> {
        match self {
            Self::Directory(dir) => {
                std::fs::read_to_string(dir.join("provider.yaml")).map_err(|e| e.to_string())
            }
            Self::Inline { manifest_yaml, .. } => Ok(manifest_yaml.clone()),
        }
    }

    pub(super) fn read_workflow_file(&self, file: &str) -> Result<String, String> {
        match self {
            Self::Directory(dir) => {
                std::fs::read_to_string(Path::new(dir).join(file)).map_err(|e| e.to_string())
            }
            Self::Inline { workflow_files, .. } => workflow_files
                .get(file)
                .cloned()
                .ok_or_else(|| format!("no inline workflow file registered for '{file}'")),
        }
    }
}

/// A parsed, schema-validated provider manifest.
pub struct ProviderManifest {
    pub provider: Provider,
}

impl ProviderManifest {
    pub(super) fn parse(source: &ManifestSource) -> Result<Self, LoadError> {
        let label = source.label();
        let raw = source.read_manifest().map_err(|reason| LoadError::WorkflowFile {
            provider: label.clone(),
            file: "provider.yaml".to_string(),
            reason,
        })?;

        let value: serde_yml::Value =
            serde_yml::from_str(&raw).map_err(|source_err| LoadError::Yaml {
                source: label.clone(),
                source_err,
            })?;

        validate_manifest_schema(&value).map_err(|reason| LoadError::Schema {
            source: label.clone(),
            reason,
        })?;

        let provider: Provider =
            serde_yml::from_value(value).map_err(|source_err| LoadError::Yaml {
                source: label,
                source_err,
            })?;

        Ok(Self { provider })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> &'static str {
        r"
name: database-team
capabilities:
  - resource_type: postgres
    operations:
      - operation: create
        workflow: provision-postgres
workflows:
  - name: provision-postgres
    file: provision-postgres.yaml
    category: provisioner
    operation: create
    tags: []
"
    }

    #[test]
    fn parses_a_well_formed_inline_manifest() {
        let source = ManifestSource::Inline {
            label: "test".to_string(),
            manifest_yaml: sample_manifest().to_string(),
            workflow_files: std::collections::HashMap::new(),
        };
        let manifest = ProviderManifest::parse(&source).unwrap();
        assert_eq!(manifest.provider.name, "database-team");
        assert_eq!(manifest.provider.capabilities.len(), 1);
    }

    #[test]
    fn rejects_malformed_yaml() {
        let source = ManifestSource::Inline {
            label: "test".to_string(),
            manifest_yaml: "not: valid: yaml: at: all: -".to_string(),
            workflow_files: std::collections::HashMap::new(),
        };
        let err = ProviderManifest::parse(&source).unwrap_err();
        assert!(matches!(err, LoadError::Yaml { .. }));
    }

    #[test]
    fn rejects_missing_required_fields() {
        let source = ManifestSource::Inline {
            label: "test".to_string(),
            manifest_yaml: "capabilities: []\nworkflows: []\n".to_string(),
            workflow_files: std::collections::HashMap::new(),
        };
        let err = ProviderManifest::parse(&source).unwrap_err();
        assert!(matches!(err, LoadError::Schema { .. }));
    }
}
