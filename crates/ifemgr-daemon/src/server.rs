//! Control server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/hw", get(api::list_hw))
        .route("/api/contexts", get(api::list_contexts).post(api::acquire_context))
        .route(
            "/api/contexts/{id}",
            get(api::get_context).delete(api::release_context),
        )
        .route("/api/contexts/{id}/start", post(api::start_context))
        .route("/api/contexts/{id}/stop", post(api::stop_context))
        .route("/api/contexts/{id}/reset", post(api::reset_context))
        .route("/api/contexts/{id}/config", post(api::configure_context))
        .route("/api/contexts/{id}/query", post(api::query_context))
        .route("/api/contexts/{id}/dump", get(api::dump_context))
        .route(
            "/api/stream-groups",
            get(api::list_stream_groups).put(api::set_stream_groups),
        )
        .route("/api/events", post(api::inject_event))
        .route("/api/config", get(api::get_config))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the control server until it fails
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    state.start_worker();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, "Starting control server");
    axum::serve(listener, app).await?;
    Ok(())
}
