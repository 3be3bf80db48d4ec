//! HTTP and WebSocket access to an [`AgentSupervisor`](deckhand_core::AgentSupervisor).
//!
//! REST routes under `/api/agents` map one-to-one onto supervisor operations;
//! `/ws` streams the event bus. An optional static directory is served as the
//! fallback for the browser UI.

pub mod routes;
pub mod state;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub use state::{AppState, SharedState};

/// Build the application router.
pub fn router(state: SharedState, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health))
        .route(
            "/api/agents",
            get(routes::list_agents).post(routes::create_agent),
        )
        .route("/api/agents/{id}", get(routes::get_agent))
        .route("/api/agents/{id}/logs", get(routes::agent_logs))
        .route("/api/agents/{id}/assign", post(routes::assign_work))
        .route("/api/agents/{id}/start", post(routes::start_agent))
        .route("/api/agents/{id}/approve", post(routes::approve_agent))
        .route("/api/agents/{id}/stop", post(routes::stop_agent))
        .route("/ws", get(websocket::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(
    state: SharedState,
    addr: SocketAddr,
    static_dir: Option<PathBuf>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on http://{}", listener.local_addr()?);
    log::info!("WebSocket endpoint at ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, router(state, static_dir))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}

// ============================================================================
// TESTS
// ============================================================================
