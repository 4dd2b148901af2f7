//! Type-safe prefixed ID types for all domain entities.
//!
//! Each ID type wraps a UUID v7 (time-ordered) and serializes with a human-readable prefix.
//! Example: `res_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90`

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when parsing entity IDs
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("missing prefix separator '_'")]
    MissingPrefix,
    #[error("wrong prefix: expected '{expected}', got '{got}'")]
    WrongPrefix { expected: &'static str, got: String },
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

impl From<uuid::Error> for IdParseError {
    fn from(e: uuid::Error) -> Self {
        IdParseError::InvalidUuid(e.to_string())
    }
}

/// Macro to define a prefixed ID type with all necessary implementations
macro_rules! define_prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            /// The string prefix for this ID type
            pub const PREFIX: &'static str = $prefix;

            /// Create a new ID with UUID v7 (time-ordered)
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create an ID from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let (prefix, uuid_str) = s.split_once('_').ok_or(IdParseError::MissingPrefix)?;

                if prefix != Self::PREFIX {
                    return Err(IdParseError::WrongPrefix {
                        expected: Self::PREFIX,
                        got: prefix.to_string(),
                    });
                }

                let uuid = Uuid::parse_str(uuid_str)?;
                Ok(Self(uuid))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }
    };
}

// Define all entity ID types
define_prefixed_id!(ResourceId, "res");
define_prefixed_id!(StepExecutionId, "step");
define_prefixed_id!(TransitionId, "xn");
define_prefixed_id!(GraphNodeId, "node");
define_prefixed_id!(GraphEdgeId, "edge");

/// Identity of a workflow execution.
///
/// Unlike the UUID-backed ids above, a workflow execution needs a
/// monotonically increasing integer (rows are created in FIFO order by the
/// reconciler and creation order matters for keeping a resource's
/// executions single-flight), so this wraps a plain `i64` assigned by the
/// database sequence instead of a v7 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowExecutionId(i64);

impl WorkflowExecutionId {
    #[must_use]
    pub const fn from_raw(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for WorkflowExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for WorkflowExecutionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_new_and_display() {
        let id = ResourceId::new();
        let s = id.to_string();
        assert!(s.starts_with("res_"), "Expected res_ prefix, got: {s}");
        assert!(s.len() > 4, "ID should be longer than just prefix");
    }

    #[test]
    fn test_resource_id_parse_roundtrip() {
        let id = ResourceId::new();
        let s = id.to_string();
        let parsed: ResourceId = s.parse().expect("Should parse valid ID");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_resource_id_parse_valid() {
        let s = "res_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90";
        let id: ResourceId = s.parse().expect("Should parse valid resource ID");
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn test_resource_id_parse_missing_prefix() {
        let result = "01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90".parse::<ResourceId>();
        assert!(matches!(result, Err(IdParseError::MissingPrefix)));
    }

    #[test]
    fn test_resource_id_parse_wrong_prefix() {
        let result = "step_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90".parse::<ResourceId>();
        match result {
            Err(IdParseError::WrongPrefix { expected, got }) => {
                assert_eq!(expected, "res");
                assert_eq!(got, "step");
            }
            _ => panic!("Expected WrongPrefix error"),
        }
    }

    #[test]
    fn test_resource_id_parse_invalid_uuid() {
        let result = "res_not-a-valid-uuid".parse::<ResourceId>();
        assert!(matches!(result, Err(IdParseError::InvalidUuid(_))));
    }

    #[test]
    fn test_resource_id_serde_roundtrip() {
        let id = ResourceId::new();
        let json = serde_json::to_string(&id).expect("Should serialize");
        let parsed: ResourceId = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_step_execution_id() {
        let id = StepExecutionId::new();
        let s = id.to_string();
        assert!(s.starts_with("step_"));
        let parsed: StepExecutionId = s.parse().expect("Should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_transition_id() {
        let id = TransitionId::new();
        let s = id.to_string();
        assert!(s.starts_with("xn_"));
        let parsed: TransitionId = s.parse().expect("Should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_graph_node_id() {
        let id = GraphNodeId::new();
        let s = id.to_string();
        assert!(s.starts_with("node_"));
        let parsed: GraphNodeId = s.parse().expect("Should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_graph_edge_id() {
        let id = GraphEdgeId::new();
        let s = id.to_string();
        assert!(s.starts_with("edge_"));
        let parsed: GraphEdgeId = s.parse().expect("Should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_unique() {
        let id1 = ResourceId::new();
        let id2 = ResourceId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_from_uuid() {
        let uuid = Uuid::now_v7();
        let id = ResourceId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_cross_type_prefix_rejection() {
        let step_id = StepExecutionId::new();
        let step_str = step_id.to_string();
        let result = step_str.parse::<ResourceId>();
        assert!(matches!(
            result,
            Err(IdParseError::WrongPrefix { expected: "res", .. })
        ));
    }

    #[test]
    fn test_workflow_execution_id_display_and_ord() {
        let a = WorkflowExecutionId::from_raw(1);
        let b = WorkflowExecutionId::from_raw(2);
        assert!(a < b);
        assert_eq!(a.to_string(), "1");
        assert_eq!(a.as_i64(), 1);
    }

    #[test]
    fn test_workflow_execution_id_serde() {
        let id = WorkflowExecutionId::from_raw(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let parsed: WorkflowExecutionId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
