//! Network handling for the sync server
//!
//! HTTP and WebSocket surface: `/ws` for viewers, `/api/state` as the
//! snapshot fallback, `/health` for liveness checks.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use watchsync_core::persistence::{JsonFileStore, MemoryStore, PersistenceGateway};
use watchsync_core::sync::{current_time_ms, ClientMessage, PlaybackSnapshot, ServerMessage};

use crate::broadcaster::EventBroadcaster;
use crate::config::ServerConfig;
use crate::ingress::{EventIngress, IngressError, IngressHandle};
use crate::metrics::{LogLevel, Metrics, ServerStatus};
use crate::persistence::{load_initial_state, SnapshotWriter};
use crate::registry::{ConnectionId, ConnectionRegistry, SessionHandle};

/// Events sent from network to dashboard
#[derive(Debug)]
pub enum ServerEvent {
    Ready { addr: SocketAddr },
    Failed(String),
}

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub ingress: IngressHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<RwLock<Metrics>>,
}

/// Load the room and spawn ingress, broadcaster and snapshot writer
pub async fn start_services(
    gateway: Arc<dyn PersistenceGateway>,
    metrics: Arc<RwLock<Metrics>>,
) -> AppState {
    let state = load_initial_state(Arc::clone(&gateway), &metrics, current_time_ms()).await;
    if let Some(snapshot) = state.snapshot(current_time_ms()) {
        metrics.write().room = Some(snapshot);
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = EventBroadcaster::new(Arc::clone(&registry), Arc::clone(&metrics)).start();
    let writer = SnapshotWriter::spawn(gateway, Arc::clone(&metrics));
    let ingress = EventIngress::new(state, broadcaster, writer, Arc::clone(&metrics)).start();

    AppState {
        ingress,
        registry,
        metrics,
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/state", get(get_state).post(post_state))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn get_state(State(state): State<AppState>) -> Response {
    match state.ingress.snapshot().await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => Json(serde_json::json!({})).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn post_state(
    State(state): State<AppState>,
    Json(snapshot): Json<PlaybackSnapshot>,
) -> Response {
    match state.ingress.restore(snapshot).await {
        Ok(applied) => Json(applied).into_response(),
        Err(IngressError::Rejected(rejection)) => {
            (StatusCode::BAD_REQUEST, rejection.to_string()).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

/// One task per viewer: outbound queue and inbound frames joined by `select!`
async fn handle_socket(socket: WebSocket, remote: Option<SocketAddr>, state: AppState) {
    let id = state.registry.next_id();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    info!("Session #{} connected ({:?})", id, remote);
    state
        .metrics
        .write()
        .session_opened(id, remote.map(|a| a.to_string()));

    // Registration and the Init happen in ingress order
    if state
        .ingress
        .join(SessionHandle::new(id, outbound_tx.clone()))
        .is_err()
    {
        warn!("Ingress closed, dropping session #{}", id);
        state.metrics.write().session_closed(id);
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            Some(message) = outbound_rx.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {:?}: {}", message, e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&state, id, &text, &outbound_tx);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Session #{} socket error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    // Close the queue first so fan-out stops targeting this session even if
    // a Join for it is still waiting in the broadcaster
    drop(outbound_rx);
    drop(outbound_tx);
    state.registry.remove(id);
    state.metrics.write().session_closed(id);
    info!("Session #{} disconnected", id);
    debug!("Live sessions: {:?}", state.registry.ids());
}

fn handle_client_text(
    state: &AppState,
    id: ConnectionId,
    text: &str,
    outbound: &mpsc::UnboundedSender<ServerMessage>,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Session #{} sent an unparseable frame: {}", id, e);
            state
                .metrics
                .write()
                .event_rejected(Some(id), &format!("unparseable frame: {}", e));
            return;
        }
    };

    match message {
        ClientMessage::RequestInit => {
            debug!("Session #{} requested init", id);
            if let Err(e) = state.ingress.request_init(id) {
                warn!("Session #{} init request dropped: {}", id, e);
            }
        }
        ClientMessage::Ping { sent_at_ms } => {
            let _ = outbound.send(ServerMessage::Pong {
                ping_sent_at_ms: sent_at_ms,
                server_time_ms: current_time_ms(),
            });
        }
        other => {
            if let Some(event) = other.into_playback_event() {
                debug!("Session #{} sent {:?}", id, event);
                if let Err(e) = state.ingress.submit(id, event) {
                    warn!("Session #{} event dropped: {}", id, e);
                }
            }
        }
    }
}

/// Run the server with dashboard integration
pub async fn run_with_dashboard(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
) -> Result<(), Box<dyn Error>> {
    info!("watchsync server starting...");

    let gateway: Arc<dyn PersistenceGateway> = match &config.snapshot_path {
        Some(path) => {
            info!("Persisting snapshots to {}", path.display());
            Arc::new(JsonFileStore::new(path))
        }
        None => {
            info!("Memory-only mode, state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    {
        let mut m = metrics.write();
        m.snapshot_path = config.snapshot_path.as_ref().map(|p| p.display().to_string());
        m.log(
            LogLevel::Info,
            match &config.snapshot_path {
                Some(path) => format!("Snapshot file: {}", path.display()),
                None => "Memory-only mode".to_string(),
            },
        );
    }

    let state = start_services(gateway, Arc::clone(&metrics)).await;

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let mut m = metrics.write();
            m.status = ServerStatus::Error;
            m.log(LogLevel::Error, format!("Bind {} failed: {}", config.bind_addr, e));
            let _ = event_tx.send(ServerEvent::Failed(e.to_string()));
            return Err(e.into());
        }
    };
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    {
        let mut m = metrics.write();
        m.bind_addr = Some(addr.to_string());
        m.status = ServerStatus::Running;
        m.log(LogLevel::Info, format!("Listening on {}", addr));
    }
    let _ = event_tx.send(ServerEvent::Ready { addr });

    let ingress = state.ingress.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Shutting down");
    ingress.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Run with plain logging (no dashboard)
pub async fn run_with_logging(
    config: ServerConfig,
    metrics: Arc<RwLock<Metrics>>,
) -> Result<(), Box<dyn Error>> {
    // Initialize tracing for logging mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("watchsync_server=info".parse()?)
                .add_directive("watchsync_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let (tx, _rx) = mpsc::unbounded_channel();
    run_with_dashboard(config, metrics, tx).await
}
