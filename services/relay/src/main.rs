// relay: consumes the agent's Redis event stream, persists it to SQLite,
// and serves live graph state to the UI over REST and WebSocket.
//
// Startup order: config → store → managers → (optional rehydrate) → hub →
// HTTP → consumer.  Shutdown runs in reverse on SIGINT/SIGTERM.

use relay::config::{self, RelayConfig};
use relay::consumer::{self, Consumer, LinkState, MessageHandler};
use relay::handlers::{BroadcastHandler, PersistHandler, ProjectHandler};
use relay::http_api::{ApiState, build_router};
use relay::hub;
use relay_state::{EventManager, GraphManager};
use relay_store::Store;
use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let store = match Store::open(&cfg.storage.db_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!(
                "FATAL: failed to open DB at '{}': {e}",
                cfg.storage.db_path.display()
            );
            return ExitCode::FAILURE;
        }
    };

    let events = EventManager::new(cfg.state.max_event_history);
    let graph = GraphManager::new();
    if cfg.state.reload_session {
        if let Err(e) = rehydrate(&store, &events, &graph) {
            error!(error = %e, "rehydration failed, starting with empty in-memory state");
        }
    }
    let store = Arc::new(Mutex::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (link_tx, link_rx) = watch::channel(LinkState::Connecting);

    let (hub_handle, hub) = hub::channel(shutdown_rx.clone());
    let hub_task = tokio::spawn(hub.run());

    let api_state = ApiState {
        events: events.clone(),
        graph: graph.clone(),
        hub: hub_handle.clone(),
        link: link_rx,
    };
    let router = build_router(api_state, cfg.http.static_files_dir.clone());
    let listener = match tokio::net::TcpListener::bind(&cfg.http.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind '{}': {e}", cfg.http.listen_addr);
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %cfg.http.listen_addr, "http listening");
    let mut http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        })
        .await
    });

    let conn = match consumer::connect(&cfg.redis).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("FATAL: failed to connect to Redis at '{}': {e}", cfg.redis.url);
            return ExitCode::FAILURE;
        }
    };
    info!(url = %cfg.redis.url, "redis connected");

    let handlers: Vec<Arc<dyn MessageHandler>> = vec![
        Arc::new(PersistHandler::new(store.clone())),
        Arc::new(ProjectHandler::new(events.clone(), graph.clone())),
        Arc::new(BroadcastHandler::new(hub_handle.clone())),
    ];
    let consumer = Consumer::new(conn, cfg.consumer.clone(), handlers);
    let mut consumer_task = tokio::spawn(consumer.run(shutdown_rx.clone(), link_tx));

    let mut exit = ExitCode::SUCCESS;
    let mut consumer_done = false;
    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received"),
        join = &mut consumer_task => {
            error!(panicked = join.is_err(), "consumer task terminated unexpectedly");
            exit = ExitCode::FAILURE;
            consumer_done = true;
        }
    }

    // Reverse of startup: consumer stops reading, HTTP stops accepting, the
    // hub closes its client sockets; the store drops last.
    let _ = shutdown_tx.send(true);
    if !consumer_done
        && tokio::time::timeout(SHUTDOWN_GRACE, consumer_task)
            .await
            .is_err()
    {
        error!("consumer did not stop within the grace period");
        exit = ExitCode::FAILURE;
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, http_task).await.is_err() {
        error!("http server did not stop within the grace period");
        exit = ExitCode::FAILURE;
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, hub_task).await.is_err() {
        error!("hub did not stop within the grace period");
        exit = ExitCode::FAILURE;
    }

    info!("relay stopped");
    exit
}

/// Config path resolution: `RELAY_CONFIG` env var, then `./relay.toml` if it
/// exists, otherwise built-in defaults.
fn load_config() -> Result<RelayConfig, config::ConfigError> {
    if let Ok(path) = std::env::var("RELAY_CONFIG") {
        return config::load_config_from_path(Path::new(&path));
    }
    let default_path = Path::new("relay.toml");
    if default_path.exists() {
        return config::load_config_from_path(default_path);
    }
    Ok(config::default_config())
}

/// Rebuild the in-memory projections from the latest run in the store.
fn rehydrate(
    store: &Store,
    events: &EventManager,
    graph: &GraphManager,
) -> Result<(), relay_store::StoreError> {
    let snapshot = store.latest_run_graph()?;
    let run_events = store.latest_run_events()?;
    info!(
        run_id = ?snapshot.run_id,
        nodes = snapshot.nodes.len(),
        events = run_events.len(),
        "rehydrated in-memory state from latest run"
    );
    graph.load_from_db(
        snapshot.nodes,
        snapshot.edges,
        snapshot.run_id.as_deref(),
        snapshot.root_node_id.as_deref(),
    );
    events.load_from_db(run_events);
    Ok(())
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
