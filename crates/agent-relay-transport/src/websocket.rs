//! WebSocket listener for agent connections.

use std::{future::Future, sync::Arc};

use agent_relay_core::{ControllerConfig, Frame, SessionConfig};
use agent_relay_session::{Registry, run_session};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt, future};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::frame::{from_message, to_message};

/// Shared state for the agent routes.
#[derive(Clone)]
pub struct ControllerState {
    /// Registry every accepted connection is admitted into.
    pub registry: Arc<Registry>,
    /// Timers and queue sizing applied to each session.
    pub session: Arc<SessionConfig>,
}

impl ControllerState {
    #[must_use]
    pub fn new(registry: Arc<Registry>, session: SessionConfig) -> Self {
        Self {
            registry,
            session: Arc::new(session),
        }
    }
}

/// Serve error.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ControllerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_socket(socket: WebSocket, state: ControllerState) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = stream.filter_map(|msg| future::ready(msg.map(from_message).transpose()));

    match run_session(Arc::clone(&state.registry), &state.session, stream, sink).await {
        Ok(reason) => tracing::debug!(%reason, "Connection finished"),
        Err(e) => tracing::debug!("Connection dropped during handshake: {e}"),
    }
}

/// Create the controller router.
///
/// Mounts the agent upgrade route at `config.ws_path` and the liveness
/// endpoint at `config.health_path`.
#[must_use]
pub fn create_router(state: ControllerState, config: &ControllerConfig) -> Router {
    Router::new()
        .route(&config.ws_path, get(ws_handler))
        .route(&config.health_path, get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve agents on `listener` until `shutdown` resolves.
///
/// On shutdown every live session is closed and removed before the
/// listener stops.
///
/// # Errors
/// Returns error if the server fails.
pub async fn serve<F>(
    listener: TcpListener,
    state: ControllerState,
    config: &ControllerConfig,
    shutdown: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    let app = create_router(state, config);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Server started on {addr}");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = registry.drain().await;
            tracing::info!(sessions = closed, "Shutting down");
        })
        .await?;
    Ok(())
}
