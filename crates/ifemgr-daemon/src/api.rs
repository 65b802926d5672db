//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ifemgr_core::{
    AcquireRequest, HwCaps, HwEvent, IspError, StopMode, StreamGroupConfig,
};
use ifemgr_hwmgr::{ConfigPacket, HwManager, QueryCmd, RegistryCounts, StopArgs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// HTTP status for a manager error
fn status_for(err: &IspError) -> StatusCode {
    match err {
        IspError::InvalidContext { .. } => StatusCode::NOT_FOUND,
        IspError::InvalidState { .. } | IspError::StreamGroupBusy { .. } => StatusCode::CONFLICT,
        IspError::UnmappedOutPort(_)
        | IspError::Rejected { .. }
        | IspError::UnsupportedVersion(_) => StatusCode::BAD_REQUEST,
        IspError::NoFreeContext { .. }
        | IspError::PoolExhausted { .. }
        | IspError::NoDevicesFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
        IspError::Timeout { .. } | IspError::CdmHang { .. } => StatusCode::GATEWAY_TIMEOUT,
        IspError::Hw { .. } => StatusCode::BAD_GATEWAY,
        IspError::StaleHandle { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: IspError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    } else {
        debug!(error = %err, "Request rejected");
    }
    (status, Json(ApiError::new(err.to_string()))).into_response()
}

/// Run a manager call off the async runtime; hardware calls block
async fn with_manager<T, F>(state: &AppState, f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&HwManager) -> ifemgr_core::Result<T> + Send + 'static,
{
    let manager = state.manager.clone();
    match tokio::task::spawn_blocking(move || f(&manager)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(e)),
        Err(e) => {
            warn!(error = %e, "Manager task failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("Manager task failed")),
            )
                .into_response())
        }
    }
}

/// Registry listing
#[derive(Serialize)]
struct HwListing {
    counts: RegistryCounts,
    max_ife_out_res: u32,
    max_sfe_out_res: u32,
    instances: Vec<HwCaps>,
}

/// List the probed hardware
pub async fn list_hw(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.manager.registry();
    let mut instances: Vec<HwCaps> = registry.entries().map(|e| e.caps.clone()).collect();
    instances.sort_by_key(|c| c.id);
    Json(HwListing {
        counts: registry.counts().clone(),
        max_ife_out_res: registry.max_ife_out_res(),
        max_sfe_out_res: registry.max_sfe_out_res(),
        instances,
    })
}

/// List in-use contexts
pub async fn list_contexts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.contexts())
}

pub async fn get_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    match state.manager.summary(id) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
struct Acquired {
    ctx: usize,
}

/// Acquire a context
pub async fn acquire_context(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AcquireRequest>,
) -> impl IntoResponse {
    let callback = state.callback();
    match with_manager(&state, move |m| m.acquire(&req, callback)).await {
        Ok(ctx) => {
            info!(ctx, "Context acquired via API");
            (StatusCode::CREATED, Json(Acquired { ctx })).into_response()
        }
        Err(resp) => resp,
    }
}

/// Start streaming
pub async fn start_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    match with_manager(&state, move |m| m.start(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

/// Stop request body
#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    mode: StopMode,
    /// Also deinitialize the hardware
    #[serde(default)]
    deinit: bool,
}

/// Stop streaming
pub async fn stop_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
    Json(req): Json<StopRequest>,
) -> impl IntoResponse {
    let args = StopArgs {
        stop_only: !req.deinit,
        ..StopArgs::new(req.mode)
    };
    match with_manager(&state, move |m| m.stop_with(id, args)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

/// Reset the context's hardware
pub async fn reset_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    match with_manager(&state, move |m| m.reset(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

/// Release a stopped context
pub async fn release_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    match with_manager(&state, move |m| m.release(id)).await {
        Ok(()) => {
            info!(ctx = id, "Context released via API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(resp) => resp,
    }
}

/// Apply a configuration packet
pub async fn configure_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
    Json(packet): Json<ConfigPacket>,
) -> impl IntoResponse {
    let result = with_manager(&state, move |m| {
        let entries = m.prepare_update(id, &packet)?;
        m.config(id, &entries, packet.request_id)?;
        Ok(entries.len())
    })
    .await;
    match result {
        Ok(entries) => {
            debug!(ctx = id, entries, "Config applied");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(resp) => resp,
    }
}

/// Answer a query about a context
pub async fn query_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
    Json(cmd): Json<QueryCmd>,
) -> impl IntoResponse {
    match with_manager(&state, move |m| m.query(id, cmd)).await {
        Ok(result) => Json(result).into_response(),
        Err(resp) => resp,
    }
}

/// Capture a mini dump of a context
pub async fn dump_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    match state.manager.mini_dump(id) {
        Ok(dump) => Json(dump).into_response(),
        Err(e) => error_response(e),
    }
}

/// Raise a simulated interrupt
pub async fn inject_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<HwEvent>,
) -> impl IntoResponse {
    let raised = tokio::task::spawn_blocking({
        let state = state.clone();
        move || state.inject(&event)
    })
    .await
    .unwrap_or(false);

    if raised {
        StatusCode::ACCEPTED.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(format!("No armed instance {}", event.hw))),
        )
            .into_response()
    }
}

/// Status of every stream group
pub async fn list_stream_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.stream_groups())
}

/// Replace the stream group configuration
pub async fn set_stream_groups(
    State(state): State<Arc<AppState>>,
    Json(configs): Json<Vec<StreamGroupConfig>>,
) -> impl IntoResponse {
    let count = configs.len();
    match with_manager(&state, move |m| m.configure_stream_groups(configs)).await {
        Ok(()) => {
            info!(groups = count, "Stream groups configured via API");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(resp) => resp,
    }
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ifemgr_core::{ContextState, HwError, HwId, InPort, OutPortId};

    fn state() -> Arc<AppState> {
        AppState::new(Config::default()).unwrap()
    }

    fn full_request() -> AcquireRequest {
        AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])])
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&IspError::InvalidContext { index: 3 }), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&IspError::invalid_state(0, "free")), StatusCode::CONFLICT);
        assert_eq!(status_for(&IspError::rejected("no")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&IspError::NoFreeContext { max: 8 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&IspError::CdmHang { index: 0, request_id: 1 }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&IspError::hw(HwId::ife(0), HwError::Busy)),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_context_lifecycle_over_api() {
        let state = state();

        let resp = acquire_context(State(state.clone()), Json(full_request()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let idx = state.manager.used_contexts()[0];

        let resp = start_context(State(state.clone()), Path(idx)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.manager.state(idx).unwrap(), ContextState::Streaming);

        // Release needs a stopped context
        let resp = release_context(State(state.clone()), Path(idx)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = stop_context(State(state.clone()), Path(idx), Json(StopRequest::default()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = release_context(State(state.clone()), Path(idx)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(state.manager.used_contexts().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_context_is_not_found() {
        let state = state();
        let resp = start_context(State(state.clone()), Path(99)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = get_context(State(state), Path(99)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inject_into_unknown_instance() {
        let state = state();
        let event: HwEvent = serde_json::from_value(serde_json::json!({
            "hw": { "hw_type": "ife", "index": 40 },
            "res": { "ife_src": "camif" },
            "kind": { "type": "sof" }
        }))
        .unwrap();
        let resp = inject_event(State(state), Json(event)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
