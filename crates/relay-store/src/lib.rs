//! Durable SQLite store for the event relay.
//!
//! # Schema
//! - `events`: append-only log keyed by `event_id` (duplicate inserts ignored).
//! - `runs`, `nodes`, `edges`: rows derived incrementally from the event log,
//!   enough to rehydrate the in-memory projections after a restart.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  PRAGMA integrity_check runs at open; returns error if it
//! fails.
//!
//! # Idempotency
//! `INSERT OR IGNORE` on `events.event_id` is the primary defense against
//! at-least-once redelivery: when the event row already exists the derived
//! updates are skipped entirely, so a replayed message can never regress
//! node state.

use chrono::{DateTime, Utc};
use relay_protocol::{
    format_ts, Edge, Event, EventPayload, Node, NodeStatus, NodeType, StreamMessage, TaskType,
    decode_event,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const RUN_RUNNING: &str = "RUNNING";
const RUN_FINISHED: &str = "FINISHED";
const RUN_ERROR: &str = "ERROR";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything needed to rebuild the graph projection for one run.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub run_id: Option<String>,
    pub root_node_id: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.integrity_check()?;
        store.apply_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn integrity_check(&self) -> StoreResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StoreError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Idempotently persist one message: the verbatim event row plus the
    /// derived `runs`/`nodes`/`edges` updates, all in a single transaction.
    ///
    /// A duplicate `event_id` commits without touching the derived tables.
    /// A payload that failed variant decoding still gets its event row; the
    /// structured update is skipped (degraded but non-fatal).
    pub fn apply(&mut self, msg: &StreamMessage) -> StoreResult<()> {
        let event = &msg.event;
        let tx = self.conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events (event_id, run_id, event_type, timestamp, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id,
                event.run_id,
                event.event_type.as_str(),
                format_ts(event.timestamp),
                msg.raw,
            ],
        )?;
        if inserted == 0 {
            debug!(event_id = %event.event_id, "duplicate event, derived updates skipped");
            tx.commit()?;
            return Ok(());
        }

        let ts = format_ts(event.timestamp);
        match &event.payload {
            EventPayload::RunStarted(_) => {
                if let Some(run_id) = &event.run_id {
                    tx.execute(
                        "INSERT INTO runs (run_id, start_time, status) VALUES (?1, ?2, ?3)
                         ON CONFLICT(run_id) DO UPDATE SET
                             start_time = excluded.start_time,
                             status = excluded.status",
                        params![run_id, ts, RUN_RUNNING],
                    )?;
                }
            }
            EventPayload::RunFinished(_) => {
                finish_run(&tx, event.run_id.as_deref(), &ts, RUN_FINISHED)?;
            }
            EventPayload::RunError(_) => {
                finish_run(&tx, event.run_id.as_deref(), &ts, RUN_ERROR)?;
            }
            EventPayload::NodeCreated(p) => {
                let metadata_json = p
                    .metadata
                    .as_ref()
                    .map(serde_json::Value::to_string);
                tx.execute(
                    "INSERT INTO nodes (node_id, run_id, nid, type, task_type, goal, status,
                                        layer, outer_node_id, root_node_id, metadata_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(node_id) DO UPDATE SET
                         run_id = excluded.run_id,
                         nid = excluded.nid,
                         type = excluded.type,
                         task_type = excluded.task_type,
                         goal = excluded.goal,
                         layer = excluded.layer,
                         outer_node_id = excluded.outer_node_id,
                         root_node_id = excluded.root_node_id,
                         metadata_json = excluded.metadata_json,
                         updated_at = excluded.updated_at",
                    params![
                        p.node_id,
                        event.run_id,
                        p.node_nid,
                        p.node_type.as_str(),
                        p.task_type.as_str(),
                        p.task_goal,
                        NodeStatus::NotReady.as_str(),
                        p.layer,
                        p.outer_node_id,
                        p.root_node_id,
                        metadata_json,
                        ts,
                    ],
                )?;
                // A layer-0 (or parentless) node is the run's root.
                let is_root =
                    p.layer == 0 || p.outer_node_id.as_deref().is_none_or(str::is_empty);
                if is_root {
                    if let Some(run_id) = &event.run_id {
                        tx.execute(
                            "INSERT INTO runs (run_id, start_time, root_node_id, status)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(run_id) DO UPDATE SET
                                 root_node_id = excluded.root_node_id",
                            params![run_id, ts, p.node_id, RUN_RUNNING],
                        )?;
                    }
                }
            }
            EventPayload::NodeStatusChanged(p) => {
                let updated = tx.execute(
                    "UPDATE nodes SET status = ?2, updated_at = ?3 WHERE node_id = ?1",
                    params![p.node_id, p.new_status.as_str(), ts],
                )?;
                if updated == 0 {
                    debug!(node_id = %p.node_id, "status change for unknown node");
                }
            }
            EventPayload::NodeResultAvailable(p) => {
                if p.has_result() {
                    tx.execute(
                        "UPDATE nodes SET result_json = ?2, updated_at = ?3 WHERE node_id = ?1",
                        params![p.node_id, p.result_summary.to_string(), ts],
                    )?;
                }
            }
            EventPayload::EdgeAdded(p) => {
                let id = p
                    .edge_id
                    .clone()
                    .unwrap_or_else(|| Edge::synthetic_id(&p.parent_node_id, &p.child_node_id));
                let metadata_json = p.metadata.as_ref().map(serde_json::Value::to_string);
                tx.execute(
                    "INSERT OR REPLACE INTO edges
                         (id, run_id, parent_id, child_id, parent_nid, child_nid, metadata_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        event.run_id,
                        p.parent_node_id,
                        p.child_node_id,
                        p.parent_node_nid,
                        p.child_node_nid,
                        metadata_json,
                    ],
                )?;
            }
            // Step, LLM, tool, plan and opaque payloads only live in the
            // event log; nothing to derive.
            _ => {}
        }

        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshot reads
    // -----------------------------------------------------------------------

    /// The run with the most recent `start_time`, falling back to the run of
    /// the most recently appended event when no `runs` row exists yet.
    pub fn latest_run_id(&self) -> StoreResult<Option<String>> {
        let from_runs: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM runs ORDER BY start_time DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if from_runs.is_some() {
            return Ok(from_runs);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT run_id FROM events WHERE run_id IS NOT NULL ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Nodes and edges of the latest run, in insertion order.
    pub fn latest_run_graph(&self) -> StoreResult<GraphSnapshot> {
        let Some(run_id) = self.latest_run_id()? else {
            return Ok(GraphSnapshot::default());
        };

        let mut stmt = self.conn.prepare(
            "SELECT node_id, nid, type, task_type, goal, status, layer,
                    outer_node_id, root_node_id, result_json, metadata_json
             FROM nodes WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let mut nodes = Vec::new();
        let rows = stmt.query_map(params![run_id], map_node_row)?;
        for row in rows {
            match row? {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(error = %e, "skipping corrupt node row"),
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, parent_id, child_id, parent_nid, child_nid, metadata_json
             FROM edges WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id], map_edge_row)?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }

        let root_node_id: Option<String> = self
            .conn
            .query_row(
                "SELECT root_node_id FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten()
            .or_else(|| nodes.iter().find(|n| n.is_root()).map(|n| n.node_id.clone()));

        Ok(GraphSnapshot {
            run_id: Some(run_id),
            root_node_id,
            nodes,
            edges,
        })
    }

    /// The event log of the latest run, oldest first.
    pub fn latest_run_events(&self) -> StoreResult<Vec<Event>> {
        let Some(run_id) = self.latest_run_id()? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM events WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let raw = row?;
            match decode_event(&raw) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "skipping undecodable event row"),
            }
        }
        Ok(events)
    }

    /// All events with `start <= timestamp <= end`, oldest first.
    ///
    /// Timestamps are stored as fixed-width RFC 3339 strings, so the
    /// lexicographic comparison is chronological.
    pub fn events_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM events
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![format_ts(start), format_ts(end)], |row| {
            row.get::<_, String>(0)
        })?;
        let mut events = Vec::new();
        for row in rows {
            let raw = row?;
            match decode_event(&raw) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "skipping undecodable event row"),
            }
        }
        Ok(events)
    }

    /// Every run id the store has seen, `runs` rows first (newest first),
    /// then run ids that only appear in the event log.
    pub fn available_run_ids(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT run_id FROM runs ORDER BY start_time DESC, rowid DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut run_ids: Vec<String> = rows.collect::<Result<_, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT run_id FROM events
             WHERE run_id IS NOT NULL
               AND run_id NOT IN (SELECT run_id FROM runs)",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            run_ids.push(row?);
        }
        Ok(run_ids)
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn apply_pragmas(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

fn finish_run(
    tx: &rusqlite::Transaction<'_>,
    run_id: Option<&str>,
    ts: &str,
    status: &str,
) -> StoreResult<()> {
    let Some(run_id) = run_id else {
        debug!("run terminal event without run_id, runs table untouched");
        return Ok(());
    };
    tx.execute(
        "INSERT INTO runs (run_id, start_time, end_time, status) VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(run_id) DO UPDATE SET
             end_time = excluded.end_time,
             status = excluded.status",
        params![run_id, ts, status],
    )?;
    Ok(())
}

type NodeRow = Result<Node, StoreError>;

fn map_node_row(row: &rusqlite::Row<'_>) -> Result<NodeRow, rusqlite::Error> {
    let node_id: String = row.get(0)?;
    let nid: String = row.get(1)?;
    let type_str: String = row.get(2)?;
    let task_type_str: String = row.get(3)?;
    let task_goal: String = row.get(4)?;
    let status_str: String = row.get(5)?;
    let layer = row.get::<_, i64>(6)?.max(0) as u32;
    let outer_node_id: Option<String> = row.get(7)?;
    let root_node_id: String = row.get(8)?;
    let result_json: Option<String> = row.get(9)?;
    let metadata_json: Option<String> = row.get(10)?;

    let parse = move || -> Result<Node, StoreError> {
        let node_type = NodeType::parse(&type_str)
            .ok_or_else(|| StoreError::InvalidData(format!("node type '{type_str}'")))?;
        let task_type = TaskType::parse(&task_type_str)
            .ok_or_else(|| StoreError::InvalidData(format!("task type '{task_type_str}'")))?;
        let status = NodeStatus::parse(&status_str)
            .ok_or_else(|| StoreError::InvalidData(format!("node status '{status_str}'")))?;
        let result = result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("result_json: {e}")))?;
        let metadata = metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("metadata_json: {e}")))?;
        Ok(Node {
            node_id,
            nid,
            node_type,
            task_type,
            task_goal,
            status,
            layer,
            outer_node_id,
            root_node_id,
            result,
            metadata,
        })
    };

    Ok(parse())
}

fn map_edge_row(row: &rusqlite::Row<'_>) -> Result<Edge, rusqlite::Error> {
    let metadata_json: Option<String> = row.get(5)?;
    Ok(Edge {
        id: row.get(0)?,
        parent_node_id: row.get(1)?,
        child_node_id: row.get(2)?,
        parent_nid: row.get(3)?,
        child_nid: row.get(4)?,
        metadata: metadata_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_event(
        event_id: &str,
        ts: &str,
        event_type: &str,
        run_id: Option<&str>,
        payload: serde_json::Value,
    ) -> String {
        let mut v = json!({
            "event_id": event_id,
            "timestamp": ts,
            "event_type": event_type,
            "payload": payload,
        });
        if let Some(r) = run_id {
            v["run_id"] = json!(r);
        }
        v.to_string()
    }

    fn msg(raw: &str) -> StreamMessage {
        StreamMessage::from_raw("0-1", raw).expect("test event should decode")
    }

    fn node_created(event_id: &str, ts: &str, run_id: &str, node_id: &str, layer: u32) -> StreamMessage {
        msg(&raw_event(
            event_id,
            ts,
            "node_created",
            Some(run_id),
            json!({
                "node_id": node_id,
                "node_nid": "1",
                "node_type": "PLAN_NODE",
                "task_type": "COMPOSITION",
                "task_goal": "g",
                "layer": layer,
                "root_node_id": node_id,
                "initial_parent_nids": [],
            }),
        ))
    }

    fn status_changed(event_id: &str, ts: &str, run_id: &str, node_id: &str, status: &str) -> StreamMessage {
        msg(&raw_event(
            event_id,
            ts,
            "node_status_changed",
            Some(run_id),
            json!({
                "node_id": node_id,
                "node_goal": "g",
                "old_status": "NOT_READY",
                "new_status": status,
            }),
        ))
    }

    #[test]
    fn apply_creates_node_and_updates_status() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0))
            .unwrap();
        store
            .apply(&status_changed("e2", "2026-03-01T10:00:01.000Z", "r1", "n1", "READY"))
            .unwrap();

        let snapshot = store.latest_run_graph().unwrap();
        assert_eq!(snapshot.run_id.as_deref(), Some("r1"));
        assert_eq!(snapshot.root_node_id.as_deref(), Some("n1"));
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].node_id, "n1");
        assert_eq!(snapshot.nodes[0].status, NodeStatus::Ready);
    }

    #[test]
    fn duplicate_event_id_is_ignored() {
        let mut store = Store::open_in_memory().unwrap();
        let e1 = node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0);
        store.apply(&e1).unwrap();
        store.apply(&e1).unwrap();

        assert_eq!(store.latest_run_events().unwrap().len(), 1);
        assert_eq!(store.latest_run_graph().unwrap().nodes.len(), 1);
    }

    #[test]
    fn redelivered_old_status_does_not_regress_newer_state() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0))
            .unwrap();
        let ready = status_changed("e2", "2026-03-01T10:00:01.000Z", "r1", "n1", "READY");
        store.apply(&ready).unwrap();
        store
            .apply(&status_changed("e3", "2026-03-01T10:00:02.000Z", "r1", "n1", "DOING"))
            .unwrap();
        // Redelivery of e2 after e3: the duplicate event_id short-circuits.
        store.apply(&ready).unwrap();

        let snapshot = store.latest_run_graph().unwrap();
        assert_eq!(snapshot.nodes[0].status, NodeStatus::Doing);
    }

    #[test]
    fn edge_before_node_gets_synthetic_id() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0))
            .unwrap();
        store
            .apply(&msg(&raw_event(
                "e2",
                "2026-03-01T10:00:01.000Z",
                "edge_added",
                Some("r1"),
                json!({
                    "graph_owner_node_id": "n1",
                    "parent_node_id": "n1",
                    "child_node_id": "n2",
                    "parent_node_nid": "1",
                    "child_node_nid": "1.1",
                }),
            )))
            .unwrap();

        let snapshot = store.latest_run_graph().unwrap();
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].id, "n1->n2");
        assert_eq!(snapshot.edges[0].child_node_id, "n2");
    }

    #[test]
    fn run_lifecycle_rows() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&msg(&raw_event(
                "e1",
                "2026-03-01T10:00:00.000Z",
                "run_started",
                Some("r1"),
                json!({"input_data": {}, "config": {}, "run_mode": "full"}),
            )))
            .unwrap();
        store
            .apply(&msg(&raw_event(
                "e2",
                "2026-03-01T10:05:00.000Z",
                "run_finished",
                Some("r1"),
                json!({"total_steps": 3, "duration_seconds": 300.0}),
            )))
            .unwrap();

        assert_eq!(store.available_run_ids().unwrap(), vec!["r1".to_owned()]);
        assert_eq!(store.latest_run_id().unwrap().as_deref(), Some("r1"));
    }

    #[test]
    fn malformed_payload_still_persists_envelope() {
        let mut store = Store::open_in_memory().unwrap();
        // node_created without node_id decodes to an opaque payload.
        store
            .apply(&msg(&raw_event(
                "e1",
                "2026-03-01T10:00:00.000Z",
                "node_created",
                Some("r1"),
                json!({"node_nid": "1", "layer": 0}),
            )))
            .unwrap();

        assert_eq!(store.latest_run_events().unwrap().len(), 1);
        assert!(store.latest_run_graph().unwrap().nodes.is_empty());
    }

    #[test]
    fn unknown_event_type_is_persisted_verbatim() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&msg(&raw_event(
                "e1",
                "2026-03-01T10:00:00.000Z",
                "telemetry_blip",
                Some("r1"),
                json!({"blip": true}),
            )))
            .unwrap();

        let events = store.latest_run_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), "telemetry_blip");
    }

    #[test]
    fn latest_run_is_most_recent_start_time() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&msg(&raw_event(
                "e1",
                "2026-03-01T10:00:00.000Z",
                "run_started",
                Some("r1"),
                json!({}),
            )))
            .unwrap();
        store
            .apply(&node_created("e2", "2026-03-01T10:00:01.000Z", "r1", "a1", 0))
            .unwrap();
        store
            .apply(&msg(&raw_event(
                "e3",
                "2026-03-01T11:00:00.000Z",
                "run_started",
                Some("r2"),
                json!({}),
            )))
            .unwrap();
        store
            .apply(&node_created("e4", "2026-03-01T11:00:01.000Z", "r2", "b1", 0))
            .unwrap();

        let snapshot = store.latest_run_graph().unwrap();
        assert_eq!(snapshot.run_id.as_deref(), Some("r2"));
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].node_id, "b1");
        assert_eq!(
            store.available_run_ids().unwrap(),
            vec!["r2".to_owned(), "r1".to_owned()]
        );
    }

    #[test]
    fn events_in_time_range_filters_inclusively() {
        let mut store = Store::open_in_memory().unwrap();
        for (id, ts) in [
            ("e1", "2026-03-01T10:00:00.000Z"),
            ("e2", "2026-03-01T10:00:05.000Z"),
            ("e3", "2026-03-01T10:00:10.000Z"),
        ] {
            store
                .apply(&msg(&raw_event(id, ts, "step_started", Some("r1"), json!({"step": 1}))))
                .unwrap();
        }

        let start = chrono::DateTime::parse_from_rfc3339("2026-03-01T10:00:05.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = chrono::DateTime::parse_from_rfc3339("2026-03-01T10:00:10.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let events = store.events_in_time_range(start, end).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "e2");
        assert_eq!(events[1].event_id, "e3");
    }

    #[test]
    fn empty_result_summary_is_not_a_result() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .apply(&node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0))
            .unwrap();
        store
            .apply(&msg(&raw_event(
                "e2",
                "2026-03-01T10:00:01.000Z",
                "node_result_available",
                Some("r1"),
                json!({"node_id": "n1", "action_name": "act", "result_summary": ""}),
            )))
            .unwrap();
        assert!(store.latest_run_graph().unwrap().nodes[0].result.is_none());

        store
            .apply(&msg(&raw_event(
                "e3",
                "2026-03-01T10:00:02.000Z",
                "node_result_available",
                Some("r1"),
                json!({"node_id": "n1", "action_name": "act", "result_summary": {"answer": 42}}),
            )))
            .unwrap();
        let result = store.latest_run_graph().unwrap().nodes[0].result.clone();
        assert_eq!(result, Some(json!({"answer": 42})));
    }

    #[test]
    fn reopen_preserves_graph_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sqlite3");

        let before = {
            let mut store = Store::open(&path).unwrap();
            store
                .apply(&node_created("e1", "2026-03-01T10:00:00.000Z", "r1", "n1", 0))
                .unwrap();
            store
                .apply(&status_changed("e2", "2026-03-01T10:00:01.000Z", "r1", "n1", "DOING"))
                .unwrap();
            store.latest_run_graph().unwrap()
        };

        let store = Store::open(&path).unwrap();
        let after = store.latest_run_graph().unwrap();
        assert_eq!(after.run_id, before.run_id);
        assert_eq!(after.nodes, before.nodes);
        assert_eq!(after.edges, before.edges);
    }
}
