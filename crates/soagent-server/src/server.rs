use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use soagent_core::events::{ChatEvent, LogRecord};
use soagent_provider::McpConfigStore;
use soagent_store::SessionStore;

use crate::bus::EventBus;
use crate::handlers;
use crate::orchestrator::ChatOrchestrator;
use crate::sse;

pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub store: Arc<SessionStore>,
    pub bus: Arc<EventBus>,
    pub mcp: Arc<McpConfigStore>,
    pub port: u16,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat/send", post(handlers::send))
        .route("/chat/stop", post(handlers::stop))
        .route("/chat/reset", post(handlers::reset))
        .route("/chat/permission-response", post(handlers::permission_response))
        .route("/question/respond", post(handlers::question_response))
        .route("/chat/load-session", post(handlers::load_session))
        .route("/chat/messages", get(handlers::transcript))
        .route("/agent/state", get(handlers::agent_state))
        .route("/chat/sessions", get(handlers::list_sessions))
        .route("/chat/sessions/{id}", delete(handlers::delete_session))
        .route("/chat/sessions/{id}/title", put(handlers::rename_session))
        .route("/chat/search", get(handlers::search))
        .route("/provider/verify", post(handlers::verify))
        .route("/chat/events", get(sse::chat_events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve. Returns a handle that keeps the server task alive.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<ChatOrchestrator>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    mcp: Arc<McpConfigStore>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let port = listener.local_addr()?.port();

    let state = AppState { orchestrator, store, bus, mcp, port };
    let router = build_router(state);

    tracing::info!(port, "server listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle { port, _server: server })
}

pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// Pump telemetry records into the bus as `chat:log` events, which also
/// populates the replay ring for late subscribers.
pub fn spawn_log_drain(
    bus: Arc<EventBus>,
    mut rx: mpsc::UnboundedReceiver<LogRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            bus.broadcast(ChatEvent::Log(record));
        }
    })
}
