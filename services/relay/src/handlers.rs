//! The three per-message fan-out targets: persist, project, broadcast.
//!
//! The consumer runs them synchronously per message, in this order.  Only
//! the persist handler can fail (and thereby nack the message); projection
//! and broadcast are re-derivable from storage, so they never veto an ack.

use crate::consumer::{HandlerError, MessageHandler};
use crate::hub::HubHandle;
use async_trait::async_trait;
use relay_protocol::{EventPayload, StreamMessage};
use relay_state::{EventManager, GraphManager};
use relay_store::Store;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Appends the event to SQLite and maintains the derived graph rows.
pub struct PersistHandler {
    store: Arc<Mutex<Store>>,
}

impl PersistHandler {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for PersistHandler {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn handle(&self, msg: &StreamMessage) -> Result<(), HandlerError> {
        self.store.lock().await.apply(msg)?;
        Ok(())
    }
}

/// Feeds the in-memory event ring and graph projection.
///
/// A `run_started` event drops the previous run's in-memory history before
/// it is recorded, so snapshots only ever describe the current run.
pub struct ProjectHandler {
    events: EventManager,
    graph: GraphManager,
}

impl ProjectHandler {
    pub fn new(events: EventManager, graph: GraphManager) -> Self {
        Self { events, graph }
    }
}

#[async_trait]
impl MessageHandler for ProjectHandler {
    fn name(&self) -> &'static str {
        "project"
    }

    async fn handle(&self, msg: &StreamMessage) -> Result<(), HandlerError> {
        if matches!(msg.event.payload, EventPayload::RunStarted(_)) {
            self.events.clear();
        }
        self.graph.process_event(&msg.event);
        self.events.add_event(msg.event.clone());
        Ok(())
    }
}

/// Pushes the verbatim wire JSON to every connected WebSocket client.
pub struct BroadcastHandler {
    hub: HubHandle,
}

impl BroadcastHandler {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MessageHandler for BroadcastHandler {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn handle(&self, msg: &StreamMessage) -> Result<(), HandlerError> {
        self.hub.broadcast(msg.raw.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::NodeStatus;
    use serde_json::json;

    fn msg(event_id: &str, event_type: &str, run_id: &str, payload: serde_json::Value) -> StreamMessage {
        let raw = json!({
            "event_id": event_id,
            "timestamp": "2026-03-01T10:00:00.000Z",
            "event_type": event_type,
            "run_id": run_id,
            "payload": payload,
        })
        .to_string();
        StreamMessage::from_raw("1-0", raw).unwrap()
    }

    fn node_created(event_id: &str, run_id: &str, node_id: &str) -> StreamMessage {
        msg(
            event_id,
            "node_created",
            run_id,
            json!({
                "node_id": node_id,
                "node_nid": "1",
                "node_type": "PLAN_NODE",
                "task_type": "COMPOSITION",
                "task_goal": "g",
                "layer": 0,
                "root_node_id": node_id,
                "initial_parent_nids": [],
            }),
        )
    }

    #[tokio::test]
    async fn persist_and_project_agree_on_node_state() {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let events = EventManager::new(100);
        let graph = GraphManager::new();
        let persist = PersistHandler::new(store.clone());
        let project = ProjectHandler::new(events.clone(), graph.clone());

        for m in [
            node_created("e1", "r1", "n1"),
            msg(
                "e2",
                "node_status_changed",
                "r1",
                json!({"node_id": "n1", "node_goal": "g", "old_status": "NOT_READY", "new_status": "READY"}),
            ),
        ] {
            persist.handle(&m).await.unwrap();
            project.handle(&m).await.unwrap();
        }

        assert_eq!(graph.node("n1").unwrap().status, NodeStatus::Ready);
        let snapshot = store.lock().await.latest_run_graph().unwrap();
        assert_eq!(snapshot.nodes[0].status, NodeStatus::Ready);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn run_started_clears_in_memory_history_only() {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let events = EventManager::new(100);
        let graph = GraphManager::new();
        let persist = PersistHandler::new(store.clone());
        let project = ProjectHandler::new(events.clone(), graph.clone());

        let old = node_created("e1", "r1", "n1");
        persist.handle(&old).await.unwrap();
        project.handle(&old).await.unwrap();

        let new_run = msg("e2", "run_started", "r2", json!({"run_mode": "full"}));
        persist.handle(&new_run).await.unwrap();
        project.handle(&new_run).await.unwrap();

        // In-memory state only knows the new run.
        assert!(graph.node("n1").is_none());
        let ids: Vec<_> = events.events().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["e2"]);

        // The store keeps both runs.
        let runs = store.lock().await.available_run_ids().unwrap();
        assert!(runs.contains(&"r1".to_owned()));
        assert!(runs.contains(&"r2".to_owned()));
    }
}
