//! Live graph projection: nodes, edges, and the run→root index.
//!
//! Edges may arrive before their endpoints exist; they are stored regardless
//! and resolved against a run's root lazily when filtering by run.  A
//! `run_started` event drops the whole projection — only the most recent run
//! is kept in memory.

use relay_protocol::{Edge, Event, EventPayload, Node, NodeStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Thread-safe graph projection.  All public methods take consistent
/// snapshots under a single reader/writer lock; returned collections are
/// copies the caller may mutate freely.
#[derive(Clone, Default)]
pub struct GraphManager {
    inner: Arc<RwLock<GraphInner>>,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    node_order: Vec<String>,
    edge_order: Vec<String>,
    /// run_id → root node_id, populated when a root node is observed.
    root_nodes: HashMap<String, String>,
}

impl GraphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a node.
    ///
    /// Creation fields (nid, types, goal, layer, parents, metadata) are
    /// overwritten; `status` and `result` of an existing node are preserved so
    /// that a redelivered `node_created` cannot regress later transitions.
    pub fn add_node(&self, node: Node, run_id: Option<&str>) {
        let mut inner = self.inner.write().unwrap();
        if node.is_root() {
            if let Some(run_id) = run_id {
                inner
                    .root_nodes
                    .insert(run_id.to_owned(), node.node_id.clone());
            }
        }
        match inner.nodes.get_mut(&node.node_id) {
            Some(existing) => {
                existing.nid = node.nid;
                existing.node_type = node.node_type;
                existing.task_type = node.task_type;
                existing.task_goal = node.task_goal;
                existing.layer = node.layer;
                existing.outer_node_id = node.outer_node_id;
                existing.root_node_id = node.root_node_id;
                existing.metadata = node.metadata;
            }
            None => {
                inner.node_order.push(node.node_id.clone());
                inner.nodes.insert(node.node_id.clone(), node);
            }
        }
    }

    /// Insert or update an edge, synthesizing its id from the endpoints if
    /// the producer did not supply one.
    pub fn add_edge(&self, mut edge: Edge) {
        if edge.id.is_empty() {
            edge.id = Edge::synthetic_id(&edge.parent_node_id, &edge.child_node_id);
        }
        let mut inner = self.inner.write().unwrap();
        if !inner.edges.contains_key(&edge.id) {
            inner.edge_order.push(edge.id.clone());
        }
        inner.edges.insert(edge.id.clone(), edge);
    }

    /// Returns false when the node is unknown (e.g. reordered delivery).
    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.nodes.get_mut(node_id) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    /// Returns false when the node is unknown.
    pub fn update_node_result(&self, node_id: &str, result: Value) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.nodes.get_mut(node_id) {
            Some(node) => {
                node.result = Some(result);
                true
            }
            None => false,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.inner.read().unwrap().nodes.get(node_id).cloned()
    }

    pub fn edge(&self, edge_id: &str) -> Option<Edge> {
        self.inner.read().unwrap().edges.get(edge_id).cloned()
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        inner
            .node_order
            .iter()
            .filter_map(|id| inner.nodes.get(id).cloned())
            .collect()
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> Vec<Edge> {
        let inner = self.inner.read().unwrap();
        inner
            .edge_order
            .iter()
            .filter_map(|id| inner.edges.get(id).cloned())
            .collect()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().node_order.clone()
    }

    pub fn edge_ids(&self) -> Vec<String> {
        self.inner.read().unwrap().edge_order.clone()
    }

    pub fn root_of_run(&self, run_id: &str) -> Option<String> {
        self.inner.read().unwrap().root_nodes.get(run_id).cloned()
    }

    /// Nodes belonging to the run, i.e. whose `root_node_id` matches the
    /// run's indexed root.  Empty when the run is unknown.
    pub fn nodes_by_run(&self, run_id: &str) -> Vec<Node> {
        let inner = self.inner.read().unwrap();
        let Some(root) = inner.root_nodes.get(run_id) else {
            return Vec::new();
        };
        inner
            .node_order
            .iter()
            .filter_map(|id| inner.nodes.get(id))
            .filter(|n| &n.root_node_id == root)
            .cloned()
            .collect()
    }

    /// Edges whose endpoints both exist under the run's root.  Dangling
    /// edges stay stored but are excluded here until both nodes arrive.
    pub fn edges_by_run(&self, run_id: &str) -> Vec<Edge> {
        let inner = self.inner.read().unwrap();
        let Some(root) = inner.root_nodes.get(run_id) else {
            return Vec::new();
        };
        let in_run = |id: &str| {
            inner
                .nodes
                .get(id)
                .is_some_and(|n| &n.root_node_id == root)
        };
        inner
            .edge_order
            .iter()
            .filter_map(|id| inner.edges.get(id))
            .filter(|e| in_run(&e.parent_node_id) && in_run(&e.child_node_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.clear();
        inner.edges.clear();
        inner.node_order.clear();
        inner.edge_order.clear();
        inner.root_nodes.clear();
    }

    /// Rebuild the projection from store rows.
    ///
    /// Rows are inserted verbatim (status and result included).  The run
    /// index is taken from the snapshot's root when present, otherwise
    /// derived from the first root-looking node.
    pub fn load_from_db(
        &self,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        run_id: Option<&str>,
        root_node_id: Option<&str>,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner.nodes.clear();
        inner.edges.clear();
        inner.node_order.clear();
        inner.edge_order.clear();
        inner.root_nodes.clear();

        if let Some(run_id) = run_id {
            let root = root_node_id
                .map(ToOwned::to_owned)
                .or_else(|| nodes.iter().find(|n| n.is_root()).map(|n| n.node_id.clone()));
            if let Some(root) = root {
                inner.root_nodes.insert(run_id.to_owned(), root);
            }
        }
        for node in nodes {
            inner.node_order.push(node.node_id.clone());
            inner.nodes.insert(node.node_id.clone(), node);
        }
        for edge in edges {
            inner.edge_order.push(edge.id.clone());
            inner.edges.insert(edge.id.clone(), edge);
        }
    }

    /// Apply one event to the projection.
    ///
    /// `run_started` drops all state; step/LLM/tool/opaque events are no-ops
    /// here (they only live in the event log).
    pub fn process_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::RunStarted(_) => self.clear(),
            EventPayload::NodeCreated(p) => {
                self.add_node(
                    Node {
                        node_id: p.node_id.clone(),
                        nid: p.node_nid.clone(),
                        node_type: p.node_type,
                        task_type: p.task_type,
                        task_goal: p.task_goal.clone(),
                        status: NodeStatus::NotReady,
                        layer: p.layer,
                        outer_node_id: p.outer_node_id.clone(),
                        root_node_id: p.root_node_id.clone(),
                        result: None,
                        metadata: p.metadata.clone(),
                    },
                    event.run_id.as_deref(),
                );
            }
            EventPayload::NodeStatusChanged(p) => {
                if !self.update_node_status(&p.node_id, p.new_status) {
                    debug!(node_id = %p.node_id, "status change for unknown node");
                }
            }
            EventPayload::NodeResultAvailable(p) => {
                if p.has_result() && !self.update_node_result(&p.node_id, p.result_summary.clone())
                {
                    debug!(node_id = %p.node_id, "result for unknown node");
                }
            }
            EventPayload::EdgeAdded(p) => {
                self.add_edge(Edge {
                    id: p.edge_id.clone().unwrap_or_default(),
                    parent_node_id: p.parent_node_id.clone(),
                    child_node_id: p.child_node_id.clone(),
                    parent_nid: p.parent_node_nid.clone(),
                    child_nid: p.child_node_nid.clone(),
                    metadata: p.metadata.clone(),
                });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{decode_event, NodeType, TaskType};
    use serde_json::json;

    fn event(event_id: &str, event_type: &str, run_id: &str, payload: Value) -> Event {
        decode_event(
            &json!({
                "event_id": event_id,
                "timestamp": "2026-03-01T10:00:00.000Z",
                "event_type": event_type,
                "run_id": run_id,
                "payload": payload,
            })
            .to_string(),
        )
        .unwrap()
    }

    fn node_created(event_id: &str, run_id: &str, node_id: &str, layer: u32, root: &str) -> Event {
        event(
            event_id,
            "node_created",
            run_id,
            json!({
                "node_id": node_id,
                "node_nid": "1",
                "node_type": "EXECUTE_NODE",
                "task_type": "REASONING",
                "task_goal": "g",
                "layer": layer,
                "root_node_id": root,
                "initial_parent_nids": [],
                "outer_node_id": if layer == 0 { Value::Null } else { json!(root) },
            }),
        )
    }

    fn mk_node(node_id: &str, layer: u32, root: &str) -> Node {
        Node {
            node_id: node_id.to_owned(),
            nid: "1".to_owned(),
            node_type: NodeType::PlanNode,
            task_type: TaskType::Composition,
            task_goal: "g".to_owned(),
            status: NodeStatus::NotReady,
            layer,
            outer_node_id: (layer > 0).then(|| root.to_owned()),
            root_node_id: root.to_owned(),
            result: None,
            metadata: None,
        }
    }

    #[test]
    fn create_then_transition_status() {
        let graph = GraphManager::new();
        graph.process_event(&node_created("e1", "r1", "n1", 0, "n1"));
        graph.process_event(&event(
            "e2",
            "node_status_changed",
            "r1",
            json!({"node_id": "n1", "node_goal": "g", "old_status": "NOT_READY", "new_status": "READY"}),
        ));

        let node = graph.node("n1").expect("node exists");
        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.layer, 0);
        assert_eq!(graph.root_of_run("r1").as_deref(), Some("n1"));
    }

    #[test]
    fn redelivered_node_created_preserves_status_and_result() {
        let graph = GraphManager::new();
        let created = node_created("e1", "r1", "n1", 0, "n1");
        graph.process_event(&created);
        graph.update_node_status("n1", NodeStatus::Doing);
        graph.update_node_result("n1", json!({"out": 1}));

        graph.process_event(&created);
        let node = graph.node("n1").unwrap();
        assert_eq!(node.status, NodeStatus::Doing);
        assert_eq!(node.result, Some(json!({"out": 1})));
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn duplicated_sequence_yields_same_snapshot() {
        let seq = vec![
            node_created("e1", "r1", "n1", 0, "n1"),
            node_created("e2", "r1", "n2", 1, "n1"),
            event(
                "e3",
                "edge_added",
                "r1",
                json!({"graph_owner_node_id": "n1", "parent_node_id": "n1", "child_node_id": "n2",
                       "parent_node_nid": "1", "child_node_nid": "1.1"}),
            ),
            event(
                "e4",
                "node_status_changed",
                "r1",
                json!({"node_id": "n2", "node_goal": "g", "new_status": "DOING"}),
            ),
        ];

        let once = GraphManager::new();
        for e in &seq {
            once.process_event(e);
        }

        let duplicated = GraphManager::new();
        for e in &seq {
            duplicated.process_event(e);
            duplicated.process_event(e);
        }

        assert_eq!(once.nodes(), duplicated.nodes());
        assert_eq!(once.edges(), duplicated.edges());
    }

    #[test]
    fn status_update_for_unknown_node_returns_false() {
        let graph = GraphManager::new();
        assert!(!graph.update_node_status("ghost", NodeStatus::Ready));
        assert!(!graph.update_node_result("ghost", json!("r")));
    }

    #[test]
    fn edge_before_node_is_stored_and_resolved_lazily() {
        let graph = GraphManager::new();
        graph.process_event(&node_created("e1", "r1", "n1", 0, "n1"));
        graph.process_event(&event(
            "e2",
            "edge_added",
            "r1",
            json!({"graph_owner_node_id": "n1", "parent_node_id": "n1", "child_node_id": "n2",
                   "parent_node_nid": "1", "child_node_nid": "1.1"}),
        ));

        // Stored with the synthetic id even though n2 does not exist yet.
        assert!(graph.edge("n1->n2").is_some());
        assert!(graph.edges_by_run("r1").is_empty());

        graph.process_event(&node_created("e3", "r1", "n2", 1, "n1"));
        let edges = graph.edges_by_run("r1");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id, "n1->n2");
    }

    #[test]
    fn empty_result_summary_is_ignored() {
        let graph = GraphManager::new();
        graph.process_event(&node_created("e1", "r1", "n1", 0, "n1"));
        graph.process_event(&event(
            "e2",
            "node_result_available",
            "r1",
            json!({"node_id": "n1", "action_name": "act", "result_summary": ""}),
        ));
        assert!(graph.node("n1").unwrap().result.is_none());

        graph.process_event(&event(
            "e3",
            "node_result_available",
            "r1",
            json!({"node_id": "n1", "action_name": "act", "result_summary": "real output"}),
        ));
        assert_eq!(graph.node("n1").unwrap().result, Some(json!("real output")));
    }

    #[test]
    fn run_started_clears_previous_state() {
        let graph = GraphManager::new();
        graph.process_event(&node_created("e1", "r1", "n1", 0, "n1"));
        graph.process_event(&event("e2", "run_started", "r2", json!({})));

        assert!(graph.nodes().is_empty());
        assert!(graph.edges().is_empty());
        assert!(graph.root_of_run("r1").is_none());
    }

    #[test]
    fn nodes_by_run_only_returns_matching_root() {
        let graph = GraphManager::new();
        graph.add_node(mk_node("a1", 0, "a1"), Some("r1"));
        graph.add_node(mk_node("a2", 1, "a1"), Some("r1"));
        graph.add_node(mk_node("b1", 0, "b1"), Some("r2"));

        let r1_nodes: Vec<_> = graph
            .nodes_by_run("r1")
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        assert_eq!(r1_nodes, vec!["a1", "a2"]);
        for node in graph.nodes_by_run("r1") {
            assert_eq!(node.root_node_id, "a1");
        }
        assert!(graph.nodes_by_run("unknown").is_empty());
    }

    #[test]
    fn load_from_db_restores_rows_and_derives_root() {
        let graph = GraphManager::new();
        let mut restored = mk_node("n1", 0, "n1");
        restored.status = NodeStatus::Doing;
        restored.result = Some(json!({"partial": true}));
        let child = mk_node("n2", 1, "n1");
        let edge = Edge {
            id: "n1->n2".to_owned(),
            parent_node_id: "n1".to_owned(),
            child_node_id: "n2".to_owned(),
            parent_nid: "1".to_owned(),
            child_nid: "1.1".to_owned(),
            metadata: None,
        };

        graph.load_from_db(vec![restored.clone(), child], vec![edge], Some("r1"), None);

        assert_eq!(graph.node("n1").unwrap().status, NodeStatus::Doing);
        assert_eq!(graph.node("n1").unwrap().result, Some(json!({"partial": true})));
        assert_eq!(graph.root_of_run("r1").as_deref(), Some("n1"));
        assert_eq!(graph.edges_by_run("r1").len(), 1);
    }

    #[test]
    fn snapshots_are_independent_copies() {
        let graph = GraphManager::new();
        graph.add_node(mk_node("n1", 0, "n1"), Some("r1"));
        let mut snapshot = graph.nodes();
        snapshot[0].status = NodeStatus::Failed;
        assert_eq!(graph.node("n1").unwrap().status, NodeStatus::NotReady);
    }
}
