//! Graph Nodes & Edges: the typed dependency graph (team → app → spec →
//! resource → provider → workflow → step) and the change events it emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{EdgeType, NodeType};
use crate::ids::{GraphEdgeId, GraphNodeId};

/// A node in the dependency graph. `key` is the stable string identity used
/// in wire payloads and as the node-lookup key (e.g. `resource:blog:db`);
/// `id` is the surrogate row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: GraphNodeId,
    pub app_name: String,
    pub node_type: NodeType,
    pub key: String,
    pub name: String,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: GraphEdgeId,
    pub app_name: String,
    pub from_node_id: GraphNodeId,
    pub to_node_id: GraphNodeId,
    pub edge_type: EdgeType,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EdgeType {
    /// The `(from, to)` node-type pair this edge type is allowed to connect.
    /// Edge validation rejects any edge whose endpoints don't match.
    #[must_use]
    pub const fn valid_endpoints(self) -> (NodeType, NodeType) {
        match self {
            Self::Owns => (NodeType::Team, NodeType::Application),
            Self::HasSpec => (NodeType::Application, NodeType::Spec),
            // `contains` is overloaded: spec -> resource, and workflow -> step.
            // Callers distinguish via the node types of the concrete endpoints
            // they have in hand; `valid_endpoints` reports the primary
            // (spec -> resource) pairing and `is_valid_pair` below accepts both.
            Self::Contains => (NodeType::Spec, NodeType::Resource),
            Self::Requires => (NodeType::Resource, NodeType::Provider),
            Self::Executes => (NodeType::Provider, NodeType::Workflow),
            Self::Triggers => (NodeType::Spec, NodeType::Workflow),
        }
    }

    /// True if `(from, to)` is a valid endpoint pair for this edge type.
    #[must_use]
    pub fn is_valid_pair(self, from: NodeType, to: NodeType) -> bool {
        if self == Self::Contains {
            return (from, to) == (NodeType::Spec, NodeType::Resource)
                || (from, to) == (NodeType::Workflow, NodeType::Step);
        }
        self.valid_endpoints() == (from, to)
    }
}

/// A graph change event, emitted after the enclosing transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEvent {
    NodeStateChanged {
        timestamp: DateTime<Utc>,
        node_id: GraphNodeId,
        node_name: String,
        node_type: NodeType,
        old_state: String,
        new_state: String,
    },
    NodeUpdated {
        timestamp: DateTime<Utc>,
        node_id: GraphNodeId,
        node_name: String,
        node_type: NodeType,
    },
    EdgeAdded {
        timestamp: DateTime<Utc>,
        edge_id: GraphEdgeId,
        edge_type: EdgeType,
        from_node: GraphNodeId,
        to_node: GraphNodeId,
    },
    GraphUpdated {
        timestamp: DateTime<Utc>,
        node_count: usize,
        edge_count: usize,
    },
}
