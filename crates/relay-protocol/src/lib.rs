// relay-protocol: event envelope, payload variants, and graph model types.
//
// Wire format is JSON with snake_case field names.  The envelope fields
// (event_id, timestamp, event_type, run_id) are decoded first; the payload
// variant is selected by `event_type` afterwards, so a malformed payload
// never prevents the envelope from being persisted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Graph model
// ---------------------------------------------------------------------------

/// Node lifecycle status as emitted by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    NotReady,
    Ready,
    Doing,
    PlanDone,
    FinalToFinish,
    NeedUpdate,
    NeedPostReflect,
    Finish,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::NotReady => "NOT_READY",
            NodeStatus::Ready => "READY",
            NodeStatus::Doing => "DOING",
            NodeStatus::PlanDone => "PLAN_DONE",
            NodeStatus::FinalToFinish => "FINAL_TO_FINISH",
            NodeStatus::NeedUpdate => "NEED_UPDATE",
            NodeStatus::NeedPostReflect => "NEED_POST_REFLECT",
            NodeStatus::Finish => "FINISH",
            NodeStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "NOT_READY" => NodeStatus::NotReady,
            "READY" => NodeStatus::Ready,
            "DOING" => NodeStatus::Doing,
            "PLAN_DONE" => NodeStatus::PlanDone,
            "FINAL_TO_FINISH" => NodeStatus::FinalToFinish,
            "NEED_UPDATE" => NodeStatus::NeedUpdate,
            "NEED_POST_REFLECT" => NodeStatus::NeedPostReflect,
            "FINISH" => NodeStatus::Finish,
            "FAILED" => NodeStatus::Failed,
            _ => return None,
        })
    }
}

/// PLAN nodes decompose work; EXECUTE nodes act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    PlanNode,
    ExecuteNode,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::PlanNode => "PLAN_NODE",
            NodeType::ExecuteNode => "EXECUTE_NODE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PLAN_NODE" => NodeType::PlanNode,
            "EXECUTE_NODE" => NodeType::ExecuteNode,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Composition,
    Reasoning,
    Retrieval,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Composition => "COMPOSITION",
            TaskType::Reasoning => "REASONING",
            TaskType::Retrieval => "RETRIEVAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "COMPOSITION" => TaskType::Composition,
            "REASONING" => TaskType::Reasoning,
            "RETRIEVAL" => TaskType::Retrieval,
            _ => return None,
        })
    }
}

/// A task unit in the agent's recursive graph.
///
/// Created by `node_created`; status mutated by `node_status_changed`;
/// result set by `node_result_available`.  Nodes are never destroyed within
/// a run; in-memory copies are dropped wholesale when a new run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier assigned by the producer.
    pub node_id: String,
    /// Hierarchical human-readable identifier, e.g. `"1.2.3"`.
    pub nid: String,
    pub node_type: NodeType,
    pub task_type: TaskType,
    pub task_goal: String,
    pub status: NodeStatus,
    /// Depth in the recursive graph; the root is layer 0.
    pub layer: u32,
    /// Owning parent for nested subgraphs, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_node_id: Option<String>,
    pub root_node_id: String,
    /// Latest known result, if any.  Opaque to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Node {
    /// A node is a graph root when it sits on layer 0 or has no owning parent.
    pub fn is_root(&self) -> bool {
        self.layer == 0 || self.outer_node_id.as_deref().is_none_or(str::is_empty)
    }
}

/// A parent→child relation in the task graph.
///
/// Edges may reference nodes that have not been created yet; consumers must
/// tolerate dangling endpoints and resolve them lazily at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub parent_node_id: String,
    pub child_node_id: String,
    #[serde(default)]
    pub parent_nid: String,
    #[serde(default)]
    pub child_nid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Edge {
    /// The id used when the producer does not supply one.
    pub fn synthetic_id(parent_node_id: &str, child_node_id: &str) -> String {
        format!("{parent_node_id}->{child_node_id}")
    }
}

// ---------------------------------------------------------------------------
// Event type tag
// ---------------------------------------------------------------------------

/// Discriminant for the payload variants.
///
/// Unrecognized tags survive as `Unknown(tag)` so that persistence can store
/// the original string and the projector can skip the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    RunStarted,
    RunFinished,
    RunError,
    StepStarted,
    StepFinished,
    NodeCreated,
    NodeStatusChanged,
    NodeResultAvailable,
    EdgeAdded,
    NodeAdded,
    InnerGraphBuilt,
    PlanReceived,
    LlmCallStarted,
    LlmCallCompleted,
    ToolInvoked,
    ToolReturned,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::RunFinished => "run_finished",
            EventType::RunError => "run_error",
            EventType::StepStarted => "step_started",
            EventType::StepFinished => "step_finished",
            EventType::NodeCreated => "node_created",
            EventType::NodeStatusChanged => "node_status_changed",
            EventType::NodeResultAvailable => "node_result_available",
            EventType::EdgeAdded => "edge_added",
            EventType::NodeAdded => "node_added",
            EventType::InnerGraphBuilt => "inner_graph_built",
            EventType::PlanReceived => "plan_received",
            EventType::LlmCallStarted => "llm_call_started",
            EventType::LlmCallCompleted => "llm_call_completed",
            EventType::ToolInvoked => "tool_invoked",
            EventType::ToolReturned => "tool_returned",
            EventType::Unknown(tag) => tag,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "run_started" => EventType::RunStarted,
            "run_finished" => EventType::RunFinished,
            "run_error" => EventType::RunError,
            "step_started" => EventType::StepStarted,
            "step_finished" => EventType::StepFinished,
            "node_created" => EventType::NodeCreated,
            "node_status_changed" => EventType::NodeStatusChanged,
            "node_result_available" => EventType::NodeResultAvailable,
            "edge_added" => EventType::EdgeAdded,
            "node_added" => EventType::NodeAdded,
            "inner_graph_built" => EventType::InnerGraphBuilt,
            "plan_received" => EventType::PlanReceived,
            "llm_call_started" => EventType::LlmCallStarted,
            "llm_call_completed" => EventType::LlmCallCompleted,
            "tool_invoked" => EventType::ToolInvoked,
            "tool_returned" => EventType::ToolReturned,
            _ => EventType::Unknown(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_owned()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub run_mode: String,
    #[serde(default)]
    pub timestamp_utc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    #[serde(default)]
    pub total_steps: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub total_nodes: u64,
    #[serde(default)]
    pub total_llm_calls: u64,
    #[serde(default)]
    pub total_tool_calls: u64,
    #[serde(default)]
    pub token_usage_summary: Value,
    #[serde(default)]
    pub node_statistics: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorPayload {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub step: Option<u64>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedPayload {
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_goal: String,
    #[serde(default)]
    pub root_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    #[serde(default)]
    pub step: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub action_name: String,
    #[serde(default)]
    pub status_after: Option<NodeStatus>,
    #[serde(default)]
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCreatedPayload {
    pub node_id: String,
    pub node_nid: String,
    pub node_type: NodeType,
    pub task_type: TaskType,
    #[serde(default)]
    pub task_goal: String,
    pub layer: u32,
    #[serde(default)]
    pub outer_node_id: Option<String>,
    pub root_node_id: String,
    #[serde(default)]
    pub initial_parent_nids: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusChangedPayload {
    pub node_id: String,
    #[serde(default)]
    pub node_goal: String,
    #[serde(default)]
    pub old_status: Option<NodeStatus>,
    pub new_status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResultAvailablePayload {
    pub node_id: String,
    #[serde(default)]
    pub action_name: String,
    /// May be empty (null or `""`); consumers only treat non-empty blobs
    /// as a result update.
    #[serde(default)]
    pub result_summary: Value,
}

impl NodeResultAvailablePayload {
    /// The producer sometimes emits an empty `result_summary`; only a
    /// non-empty blob counts as a result update.
    pub fn has_result(&self) -> bool {
        match &self.result_summary {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAddedPayload {
    #[serde(default)]
    pub graph_owner_node_id: String,
    pub parent_node_id: String,
    pub child_node_id: String,
    #[serde(default)]
    pub parent_node_nid: String,
    #[serde(default)]
    pub child_node_nid: String,
    /// Producer-assigned edge id; synthesized from the endpoints if absent.
    #[serde(default)]
    pub edge_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAddedPayload {
    #[serde(default)]
    pub graph_owner_node_id: String,
    pub added_node_id: String,
    #[serde(default)]
    pub added_node_nid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerGraphBuiltPayload {
    pub node_id: String,
    #[serde(default)]
    pub node_count: u64,
    #[serde(default)]
    pub edge_count: u64,
    #[serde(default)]
    pub node_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReceivedPayload {
    pub node_id: String,
    #[serde(default)]
    pub raw_plan: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallStartedPayload {
    pub agent_class: String,
    pub model: String,
    #[serde(default)]
    pub prompt: Vec<Value>,
    #[serde(default)]
    pub prompt_preview: String,
    #[serde(default)]
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCallCompletedPayload {
    pub agent_class: String,
    pub model: String,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub result_summary: Value,
    #[serde(default)]
    pub token_usage: Option<Value>,
    #[serde(default)]
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvokedPayload {
    pub tool_name: String,
    #[serde(default)]
    pub api_name: String,
    #[serde(default)]
    pub args_summary: String,
    #[serde(default)]
    pub tool_call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReturnedPayload {
    pub tool_name: String,
    #[serde(default)]
    pub api_name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub result_summary: String,
    #[serde(default)]
    pub tool_call_id: String,
}

/// The decoded payload of an event.
///
/// Serializes untagged: each variant flattens to the payload object itself,
/// matching the wire shape (`event_type` on the envelope selects the variant).
/// `Opaque` carries the raw JSON of payloads whose type is unknown or whose
/// fields failed variant decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    RunFinished(RunFinishedPayload),
    RunError(RunErrorPayload),
    StepStarted(StepStartedPayload),
    StepFinished(StepFinishedPayload),
    NodeCreated(NodeCreatedPayload),
    NodeStatusChanged(NodeStatusChangedPayload),
    NodeResultAvailable(NodeResultAvailablePayload),
    EdgeAdded(EdgeAddedPayload),
    NodeAdded(NodeAddedPayload),
    InnerGraphBuilt(InnerGraphBuiltPayload),
    PlanReceived(PlanReceivedPayload),
    LlmCallStarted(LlmCallStartedPayload),
    LlmCallCompleted(LlmCallCompletedPayload),
    ToolInvoked(ToolInvokedPayload),
    ToolReturned(ToolReturnedPayload),
    Opaque(Value),
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// One immutable event emitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_id: String,
    #[serde(serialize_with = "serialize_ts")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub payload: EventPayload,
}

/// Timestamps are ISO-8601 with millisecond precision and a `Z` suffix.
fn serialize_ts<S: serde::Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_ts(*ts))
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp '{0}': {1}")]
    InvalidTimestamp(String, String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    event_id: String,
    timestamp: String,
    event_type: EventType,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Decode an event from its wire JSON.
///
/// The envelope is decoded strictly; the payload falls back to
/// [`EventPayload::Opaque`] when its variant fields do not match, so a
/// malformed or unknown payload never loses the event.
pub fn decode_event(raw: &str) -> Result<Event, DecodeError> {
    let envelope: RawEnvelope = serde_json::from_str(raw)?;
    let timestamp = DateTime::parse_from_rfc3339(&envelope.timestamp)
        .map_err(|e| DecodeError::InvalidTimestamp(envelope.timestamp.clone(), e.to_string()))?
        .with_timezone(&Utc);
    let payload = decode_payload(&envelope.event_type, &envelope.event_id, envelope.payload);
    Ok(Event {
        event_id: envelope.event_id,
        timestamp,
        event_type: envelope.event_type,
        run_id: envelope.run_id,
        payload,
    })
}

/// Encode an event back to wire JSON.
pub fn encode_event(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

fn decode_payload(event_type: &EventType, event_id: &str, raw: Value) -> EventPayload {
    fn typed<T: serde::de::DeserializeOwned>(
        raw: Value,
        event_id: &str,
        wrap: fn(T) -> EventPayload,
    ) -> EventPayload {
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(p) => wrap(p),
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "payload failed variant decoding, retaining raw");
                EventPayload::Opaque(raw)
            }
        }
    }

    match event_type {
        EventType::RunStarted => typed(raw, event_id, EventPayload::RunStarted),
        EventType::RunFinished => typed(raw, event_id, EventPayload::RunFinished),
        EventType::RunError => typed(raw, event_id, EventPayload::RunError),
        EventType::StepStarted => typed(raw, event_id, EventPayload::StepStarted),
        EventType::StepFinished => typed(raw, event_id, EventPayload::StepFinished),
        EventType::NodeCreated => typed(raw, event_id, EventPayload::NodeCreated),
        EventType::NodeStatusChanged => typed(raw, event_id, EventPayload::NodeStatusChanged),
        EventType::NodeResultAvailable => typed(raw, event_id, EventPayload::NodeResultAvailable),
        EventType::EdgeAdded => typed(raw, event_id, EventPayload::EdgeAdded),
        EventType::NodeAdded => typed(raw, event_id, EventPayload::NodeAdded),
        EventType::InnerGraphBuilt => typed(raw, event_id, EventPayload::InnerGraphBuilt),
        EventType::PlanReceived => typed(raw, event_id, EventPayload::PlanReceived),
        EventType::LlmCallStarted => typed(raw, event_id, EventPayload::LlmCallStarted),
        EventType::LlmCallCompleted => typed(raw, event_id, EventPayload::LlmCallCompleted),
        EventType::ToolInvoked => typed(raw, event_id, EventPayload::ToolInvoked),
        EventType::ToolReturned => typed(raw, event_id, EventPayload::ToolReturned),
        EventType::Unknown(_) => EventPayload::Opaque(raw),
    }
}

// ---------------------------------------------------------------------------
// Delivered unit
// ---------------------------------------------------------------------------

/// One message as delivered by the stream consumer to its handlers.
///
/// `raw` is the verbatim payload JSON from the wire: persistence stores it
/// byte-for-byte and the WebSocket fan-out forwards it unmodified, while the
/// projector works from the decoded `event`.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Redis stream entry id (e.g. `"1719000000000-0"`); empty for messages
    /// replayed from local storage.
    pub entry_id: String,
    pub event: Event,
    pub raw: String,
}

impl StreamMessage {
    pub fn from_raw(entry_id: impl Into<String>, raw: impl Into<String>) -> Result<Self, DecodeError> {
        let raw = raw.into();
        let event = decode_event(&raw)?;
        Ok(StreamMessage {
            entry_id: entry_id.into(),
            event,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_known_tags() {
        for tag in [
            "run_started",
            "node_created",
            "node_status_changed",
            "edge_added",
            "tool_returned",
        ] {
            let t = EventType::from(tag.to_owned());
            assert!(!matches!(t, EventType::Unknown(_)), "{tag} should be known");
            assert_eq!(t.as_str(), tag);
        }
    }

    #[test]
    fn event_type_preserves_unknown_tag() {
        let t = EventType::from("quantum_flux".to_owned());
        assert_eq!(t, EventType::Unknown("quantum_flux".to_owned()));
        assert_eq!(t.as_str(), "quantum_flux");
    }

    #[test]
    fn synthetic_edge_id_joins_endpoints() {
        assert_eq!(Edge::synthetic_id("n1", "n2"), "n1->n2");
    }

    #[test]
    fn node_is_root_on_layer_zero_or_missing_outer() {
        let mut n = Node {
            node_id: "n1".to_owned(),
            nid: "1".to_owned(),
            node_type: NodeType::PlanNode,
            task_type: TaskType::Composition,
            task_goal: String::new(),
            status: NodeStatus::NotReady,
            layer: 0,
            outer_node_id: Some("outer".to_owned()),
            root_node_id: "n1".to_owned(),
            result: None,
            metadata: None,
        };
        assert!(n.is_root());
        n.layer = 2;
        assert!(!n.is_root());
        n.outer_node_id = Some(String::new());
        assert!(n.is_root());
        n.outer_node_id = None;
        assert!(n.is_root());
    }

    #[test]
    fn node_status_parse_matches_as_str() {
        for s in [
            NodeStatus::NotReady,
            NodeStatus::Ready,
            NodeStatus::Doing,
            NodeStatus::PlanDone,
            NodeStatus::FinalToFinish,
            NodeStatus::NeedUpdate,
            NodeStatus::NeedPostReflect,
            NodeStatus::Finish,
            NodeStatus::Failed,
        ] {
            assert_eq!(NodeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(NodeStatus::parse("BOGUS"), None);
    }

    #[test]
    fn timestamp_formats_with_millis_and_z() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T10:20:30.456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_ts(ts), "2026-03-01T10:20:30.456Z");
    }
}
