//! Graph Manager: a per-application in-memory cache over the
//! durable `graph_nodes`/`graph_edges` rows, kept in sync with every
//! gateway write and re-published to the event broadcaster once that
//! write's transaction has committed.
//!
//! The gateway already performs node/edge upserts inside the same
//! transaction as the primary-table write they describe, so this manager
//! does not re-derive graph mutations itself — it owns the read-side
//! cache and the "tell subscribers" half of the contract: call one of the
//! `notify_*` methods after a gateway write returns and the corresponding
//! event reaches every live subscriber exactly once, never before the row
//! is durable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use innominatus_db::pagination::{Page, Pagination};
use innominatus_db::repo::errors::GraphError;
use innominatus_db::repo::traits::{PersistenceGateway, TeamSummary};
use innominatus_domain::{
    EdgeType, GraphEdge, GraphEvent, GraphNode, GraphNodeId, NodeType, ResourceState,
    ResourceStateTransition,
};
use tokio::sync::Mutex;

use crate::events::EventBroadcaster;

#[derive(Debug, Clone, Default)]
struct AppGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

pub struct GraphManager {
    gateway: Arc<dyn PersistenceGateway>,
    broadcaster: Arc<EventBroadcaster>,
    /// Graph cache mutations are serialized per application; using
    /// one lock for the whole map rather than one per app keeps this
    /// simple since cache refreshes are cheap reads, not the hot path.
    cache: Mutex<HashMap<String, AppGraph>>,
}

impl GraphManager {
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            gateway,
            broadcaster,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Refreshes the cached graph for `app_name` from the gateway and
    /// publishes `GraphUpdated` with the new node/edge counts. Call after
    /// any write whose shape isn't captured by a more specific `notify_*`.
    pub async fn notify_graph_changed(&self, app_name: &str) -> Result<(), GraphError> {
        let (nodes, edges) = self.refresh(app_name).await?;
        self.broadcaster
            .publish(
                app_name,
                GraphEvent::GraphUpdated {
                    timestamp: Utc::now(),
                    node_count: nodes.len(),
                    edge_count: edges.len(),
                },
            )
            .await;
        Ok(())
    }

    /// Refreshes the cache and publishes `NodeStateChanged` for a
    /// resource's transition. `node_key` is the graph node key the
    /// resource was upserted under (`resource:<app>:<name>`); the caller
    /// — the reconciler — is expected to have already written the new
    /// state via the gateway before calling this.
    pub async fn notify_resource_state_changed(
        &self,
        app_name: &str,
        node_key: &str,
        resource_name: &str,
        old_state: ResourceState,
        new_state: ResourceState,
    ) -> Result<(), GraphError> {
        let (nodes, _) = self.refresh(app_name).await?;
        let node_id = nodes
            .iter()
            .find(|n| n.key == node_key)
            .map_or_else(GraphNodeId::new, |n| n.id);

        self.broadcaster
            .publish(
                app_name,
                GraphEvent::NodeStateChanged {
                    timestamp: Utc::now(),
                    node_id,
                    node_name: resource_name.to_string(),
                    node_type: NodeType::Resource,
                    old_state: state_label(old_state),
                    new_state: state_label(new_state),
                },
            )
            .await;
        Ok(())
    }

    /// Refreshes the cache and publishes `NodeUpdated` for a node that was
    /// freshly created or had its properties changed by the caller's
    /// gateway write (application/spec/provider/workflow/step nodes).
    pub async fn notify_node_updated(
        &self,
        app_name: &str,
        node_key: &str,
        node_name: &str,
        node_type: NodeType,
    ) -> Result<(), GraphError> {
        let (nodes, _) = self.refresh(app_name).await?;
        let node_id = nodes
            .iter()
            .find(|n| n.key == node_key)
            .map_or_else(GraphNodeId::new, |n| n.id);

        self.broadcaster
            .publish(
                app_name,
                GraphEvent::NodeUpdated {
                    timestamp: Utc::now(),
                    node_id,
                    node_name: node_name.to_string(),
                    node_type,
                },
            )
            .await;
        Ok(())
    }

    /// Refreshes the cache and publishes `EdgeAdded` for a newly-created
    /// edge between `from_key` and `to_key`.
    pub async fn notify_edge_added(
        &self,
        app_name: &str,
        edge: &GraphEdge,
    ) -> Result<(), GraphError> {
        self.refresh(app_name).await?;
        self.broadcaster
            .publish(
                app_name,
                GraphEvent::EdgeAdded {
                    timestamp: Utc::now(),
                    edge_id: edge.id,
                    edge_type: edge.edge_type,
                    from_node: edge.from_node_id,
                    to_node: edge.to_node_id,
                },
            )
            .await;
        Ok(())
    }

    /// A convenience that upserts an edge through the gateway (enforcing
    /// endpoint validity there) and emits the corresponding event on
    /// success, so callers outside the gateway's own transactional writes
    /// — e.g. the reconciler wiring `resource --requires--> provider` and
    /// `provider --executes--> workflow` — don't have to remember both
    /// steps.
    pub async fn upsert_edge(
        &self,
        app_name: &str,
        from_key: &str,
        to_key: &str,
        edge_type: EdgeType,
        properties: serde_json::Value,
    ) -> Result<GraphEdge, GraphError> {
        let (edge, created) = self
            .gateway
            .upsert_graph_edge(app_name, from_key, to_key, edge_type, properties)
            .await?;
        if created {
            self.notify_edge_added(app_name, &edge).await?;
        }
        Ok(edge)
    }

    /// A convenience mirroring [`Self::upsert_edge`] for nodes.
    pub async fn upsert_node(
        &self,
        app_name: &str,
        node_type: NodeType,
        key: &str,
        name: &str,
        properties: serde_json::Value,
    ) -> Result<GraphNode, GraphError> {
        let (node, created) = self
            .gateway
            .upsert_graph_node(app_name, node_type, key, name, properties)
            .await?;
        if created {
            self.notify_node_updated(app_name, key, name, node_type).await?;
        }
        Ok(node)
    }

    /// Current `(nodes, edges)` for `app_name`, served from cache when
    /// present and refreshed from the gateway otherwise.
    pub async fn get_graph(
        &self,
        app_name: &str,
    ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError> {
        if let Some(cached) = self.cache.lock().await.get(app_name) {
            return Ok((cached.nodes.clone(), cached.edges.clone()));
        }
        self.refresh(app_name).await
    }

    pub async fn get_history(
        &self,
        app_name: &str,
        pagination: Pagination,
    ) -> Result<Page<ResourceStateTransition>, GraphError> {
        self.gateway.get_history(app_name, pagination).await
    }

    pub async fn get_teams_view(&self) -> Result<Vec<TeamSummary>, GraphError> {
        self.gateway.get_teams_view().await
    }

    async fn refresh(
        &self,
        app_name: &str,
    ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError> {
        let (nodes, edges) = self.gateway.get_graph(app_name).await?;
        if has_cycle(&nodes, &edges) {
            // Edges are typed and acyclic by construction via
            // EdgeType::valid_endpoints, so this should be unreachable for
            // data that went through the gateway's own edge validation.
            // Surfacing it as a warning rather than a panic keeps a stale
            // or hand-inserted row from taking the whole cache down.
            tracing::warn!(app = %app_name, "graph cache detected a cycle among committed edges");
        }
        self.cache.lock().await.insert(
            app_name.to_string(),
            AppGraph {
                nodes: nodes.clone(),
                edges: edges.clone(),
            },
        );
        Ok((nodes, edges))
    }
}

/// Builds a throwaway `petgraph` digraph over the current node/edge set and
/// checks it for cycles, reusing the same cycle-detection algorithm the
/// workflow parser's validator would apply to step dependencies.
fn has_cycle(nodes: &[GraphNode], edges: &[GraphEdge]) -> bool {
    use petgraph::algo::is_cyclic_directed;
    use petgraph::graph::{DiGraph, NodeIndex};

    let mut graph: DiGraph<GraphNodeId, ()> = DiGraph::new();
    let mut index: HashMap<GraphNodeId, NodeIndex> = HashMap::new();

    for node in nodes {
        index.insert(node.id, graph.add_node(node.id));
    }
    for edge in edges {
        if let (Some(&from), Some(&to)) =
            (index.get(&edge.from_node_id), index.get(&edge.to_node_id))
        {
            graph.add_edge(from, to, ());
        }
    }

    is_cyclic_directed(&graph)
}

/// The snake_case wire label for a resource state, reusing its `Serialize`
/// impl rather than hand-duplicating the match.
fn state_label(state: ResourceState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use innominatus_db::pagination::{Page, Pagination};
    use innominatus_db::repo::errors::{
        ExecutionError, GraphError, ResourceError, TransitionError, UpsertApplicationError,
    };
    use innominatus_domain::{
        Application, DesiredOperation, ExecutionStatus, GraphEdgeId, GraphNodeId, Resource,
        ResourceId, StepExecution, StepExecutionId, StepExecutionStatus, WorkflowExecution,
        WorkflowExecutionId,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeGateway {
        graph_calls: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceGateway for FakeGateway {
        async fn upsert_application(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: serde_json::Value,
        ) -> Result<(Application, bool), UpsertApplicationError> {
            unimplemented!()
        }
        async fn get_application(&self, _: &str) -> Result<Option<Application>, ResourceError> {
            unimplemented!()
        }
        async fn create_resource_if_absent(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: std::collections::HashMap<String, serde_json::Value>,
            _: DesiredOperation,
        ) -> Result<(Resource, bool), ResourceError> {
            unimplemented!()
        }
        async fn get_resource(&self, _: ResourceId) -> Result<Option<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn get_resource_by_name(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn list_resources_for_application(
            &self,
            _: &str,
        ) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn set_desired_operation(
            &self,
            _: ResourceId,
            _: DesiredOperation,
        ) -> Result<Resource, ResourceError> {
            unimplemented!()
        }
        async fn lease_pending_resources(&self, _: i64) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn bind_execution_to_resource(
            &self,
            _: ResourceId,
            _: WorkflowExecutionId,
            _: ResourceState,
        ) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn complete_resource_transition(
            &self,
            _: ResourceId,
            _: ResourceState,
            _: &str,
            _: Option<WorkflowExecutionId>,
        ) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn mark_resource_failed(&self, _: ResourceId, _: &str) -> Result<(), TransitionError> {
            unimplemented!()
        }
        async fn list_provisioning_resources(&self) -> Result<Vec<Resource>, ResourceError> {
            unimplemented!()
        }
        async fn recover_orphans(
            &self,
            _: u32,
            _: chrono::Duration,
        ) -> Result<usize, TransitionError> {
            unimplemented!()
        }
        async fn list_transitions(
            &self,
            _: ResourceId,
        ) -> Result<Vec<ResourceStateTransition>, ResourceError> {
            unimplemented!()
        }
        async fn create_workflow_execution(
            &self,
            _: &str,
            _: &str,
            _: Option<ResourceId>,
            _: std::collections::HashMap<String, serde_json::Value>,
        ) -> Result<WorkflowExecutionId, ExecutionError> {
            unimplemented!()
        }
        async fn mark_execution_running(&self, _: WorkflowExecutionId) -> Result<(), ExecutionError> {
            unimplemented!()
        }
        async fn finalize_execution(
            &self,
            _: WorkflowExecutionId,
            _: ExecutionStatus,
            _: Option<String>,
        ) -> Result<(), ExecutionError> {
            unimplemented!()
        }
        async fn get_execution(
            &self,
            _: WorkflowExecutionId,
        ) -> Result<Option<WorkflowExecution>, ExecutionError> {
            unimplemented!()
        }
        async fn append_step_execution(
            &self,
            _: WorkflowExecutionId,
            _: i32,
            _: &str,
            _: &str,
            _: serde_json::Value,
        ) -> Result<StepExecutionId, ExecutionError> {
            unimplemented!()
        }
        async fn update_step(
            &self,
            _: StepExecutionId,
            _: StepExecutionStatus,
            _: std::collections::HashMap<String, serde_json::Value>,
            _: String,
            _: Option<String>,
            _: bool,
        ) -> Result<(), ExecutionError> {
            unimplemented!()
        }
        async fn list_step_executions(
            &self,
            _: WorkflowExecutionId,
        ) -> Result<Vec<StepExecution>, ExecutionError> {
            unimplemented!()
        }
        async fn upsert_graph_node(
            &self,
            app_name: &str,
            node_type: NodeType,
            key: &str,
            name: &str,
            _: serde_json::Value,
        ) -> Result<(GraphNode, bool), GraphError> {
            Ok((
                GraphNode {
                    id: GraphNodeId::new(),
                    app_name: app_name.to_string(),
                    node_type,
                    key: key.to_string(),
                    name: name.to_string(),
                    properties: serde_json::json!({}),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                true,
            ))
        }
        async fn upsert_graph_edge(
            &self,
            app_name: &str,
            _: &str,
            _: &str,
            edge_type: EdgeType,
            _: serde_json::Value,
        ) -> Result<(GraphEdge, bool), GraphError> {
            Ok((
                GraphEdge {
                    id: GraphEdgeId::new(),
                    app_name: app_name.to_string(),
                    from_node_id: GraphNodeId::new(),
                    to_node_id: GraphNodeId::new(),
                    edge_type,
                    properties: serde_json::json!({}),
                    created_at: Utc::now(),
                },
                true,
            ))
        }
        async fn get_graph(
            &self,
            app_name: &str,
        ) -> Result<(Vec<GraphNode>, Vec<GraphEdge>), GraphError> {
            self.graph_calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                vec![GraphNode {
                    id: GraphNodeId::new(),
                    app_name: app_name.to_string(),
                    node_type: NodeType::Resource,
                    key: format!("resource:{app_name}:db"),
                    name: "db".to_string(),
                    properties: serde_json::json!({}),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }],
                vec![],
            ))
        }
        async fn get_history(
            &self,
            _: &str,
            pagination: Pagination,
        ) -> Result<Page<ResourceStateTransition>, GraphError> {
            Ok(Page::empty(&pagination))
        }
        async fn get_teams_view(&self) -> Result<Vec<TeamSummary>, GraphError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn get_graph_caches_after_first_fetch() {
        let gateway = Arc::new(FakeGateway::default());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let manager = GraphManager::new(gateway.clone(), broadcaster);

        manager.get_graph("blog").await.unwrap();
        manager.get_graph("blog").await.unwrap();
        assert_eq!(gateway.graph_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notify_resource_state_changed_publishes_event() {
        let gateway = Arc::new(FakeGateway::default());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let mut sub = broadcaster.subscribe("blog").await;
        let manager = GraphManager::new(gateway, broadcaster);

        manager
            .notify_resource_state_changed(
                "blog",
                "resource:blog:db",
                "db",
                ResourceState::Requested,
                ResourceState::Provisioning,
            )
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        match event {
            GraphEvent::NodeStateChanged {
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(old_state, "requested");
                assert_eq!(new_state, "provisioning");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_edge_emits_only_on_creation() {
        let gateway = Arc::new(FakeGateway::default());
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let mut sub = broadcaster.subscribe("blog").await;
        let manager = GraphManager::new(gateway, broadcaster);

        manager
            .upsert_edge(
                "blog",
                "resource:blog:db",
                "provider:database-team",
                EdgeType::Requires,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, GraphEvent::EdgeAdded { .. }));
    }

    fn node(app: &str, key: &str) -> GraphNode {
        GraphNode {
            id: GraphNodeId::new(),
            app_name: app.to_string(),
            node_type: NodeType::Resource,
            key: key.to_string(),
            name: key.to_string(),
            properties: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn edge(app: &str, from: GraphNodeId, to: GraphNodeId) -> GraphEdge {
        GraphEdge {
            id: GraphEdgeId::new(),
            app_name: app.to_string(),
            from_node_id: from,
            to_node_id: to,
            edge_type: EdgeType::Requires,
            properties: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn has_cycle_is_false_for_a_dag() {
        let a = node("blog", "a");
        let b = node("blog", "b");
        let c = node("blog", "c");
        let edges = vec![edge("blog", a.id, b.id), edge("blog", b.id, c.id)];
        assert!(!has_cycle(&[a, b, c], &edges));
    }

    #[test]
    fn has_cycle_detects_a_back_edge() {
        let a = node("blog", "a");
        let b = node("blog", "b");
        let c = node("blog", "c");
        let edges = vec![
            edge("blog", a.id, b.id),
            edge("blog", b.id, c.id),
            edge("blog", c.id, a.id),
        ];
        assert!(has_cycle(&[a, b, c], &edges));
    }
}
