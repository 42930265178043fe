//! REST snapshot queries and the WebSocket upgrade endpoint.
//!
//! Routes:
//!   GET /api/events            - in-memory event log + link status
//!   GET /api/graph             - normalized graph (ids + entities)
//!   GET /api/graph/nodes       - id → node map
//!   GET /api/graph/nodes/{id}  - single node, 404 if unknown
//!   GET /api/graph/edges       - id → edge map
//!   GET /api/graph/edges/{id}  - single edge, 404 if unknown
//!   GET /ws/events             - WebSocket upgrade with historical replay
//!
//! An optional static asset directory is served on the router fallback.

use crate::consumer::LinkState;
use crate::hub::{self, HubHandle};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use relay_protocol::encode_event;
use relay_state::{EventManager, GraphManager};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub events: EventManager,
    pub graph: GraphManager,
    pub hub: HubHandle,
    pub link: watch::Receiver<LinkState>,
}

pub fn build_router(state: ApiState, static_files_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/api/events", get(get_events))
        .route("/api/graph", get(get_graph))
        .route("/api/graph/nodes", get(get_nodes))
        .route("/api/graph/nodes/{id}", get(get_node))
        .route("/api/graph/edges", get(get_edges))
        .route("/api/graph/edges/{id}", get(get_edge))
        .route("/ws/events", get(ws_events))
        .with_state(state);

    if let Some(dir) = static_files_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn get_events(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let status = *state.link.borrow();
    Json(json!({
        "status": status,
        "events": state.events.events(),
    }))
}

/// Normalized for consumption by an entity-adapter store: parallel id lists
/// plus id-keyed entity maps.
async fn get_graph(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let node_ids = state.graph.node_ids();
    let edge_ids = state.graph.edge_ids();
    let nodes: HashMap<_, _> = state
        .graph
        .nodes()
        .into_iter()
        .map(|n| (n.node_id.clone(), n))
        .collect();
    let edges: HashMap<_, _> = state
        .graph
        .edges()
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    Json(json!({
        "graph": {
            "nodes": { "ids": node_ids, "entities": nodes },
            "edges": { "ids": edge_ids, "entities": edges },
        }
    }))
}

async fn get_nodes(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let nodes: HashMap<_, _> = state
        .graph
        .nodes()
        .into_iter()
        .map(|n| (n.node_id.clone(), n))
        .collect();
    Json(json!({ "nodes": nodes }))
}

async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.graph.node(&id) {
        Some(node) => Json(node).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("node '{id}' not found") })),
        )
            .into_response(),
    }
}

async fn get_edges(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let edges: HashMap<_, _> = state
        .graph
        .edges()
        .into_iter()
        .map(|e| (e.id.clone(), e))
        .collect();
    Json(json!({ "edges": edges }))
}

async fn get_edge(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.graph.edge(&id) {
        Some(edge) => Json(edge).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("edge '{id}' not found") })),
        )
            .into_response(),
    }
}

/// Upgrade, replay the current event snapshot into the client's own buffer,
/// then hand the socket to the hub pumps.
async fn ws_events(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let history: Vec<String> = state
            .events
            .events()
            .iter()
            .filter_map(|e| encode_event(e).ok())
            .collect();
        hub::client_session(socket, addr.to_string(), state.hub, history).await;
    })
}
