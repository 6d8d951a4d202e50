//! Driver REST surface (§6 "Driver surface at base path (default `/driver`)").
//!
//! Grounded on the teacher's `api/http.rs` (axum `Router` + `State<Arc<_>>`
//! shape, tuple `(StatusCode, String)` error responses) applied to this
//! spec's device-ownership verb list instead of the teacher's WAL write
//! surface.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::cluster::ClusterService;
use crate::driver::DriverService;
use crate::model::Device;

#[derive(Clone)]
pub struct DriverApiState {
    pub driver: Arc<DriverService>,
    pub cluster: Arc<ClusterService>,
}

pub fn router(driver: Arc<DriverService>, cluster: Arc<ClusterService>) -> Router {
    let state = DriverApiState { driver, cluster };
    Router::new()
        .route("/connect-all/:node_index", post(handle_connect_all))
        .route("/balanced-connect-all", post(handle_balanced_connect_all))
        .route("/connect-all-to-index", post(handle_connect_all_to_index))
        .route("/connect-all-to-leader/:node_index", post(handle_connect_all_to_leader))
        .route("/disconnect", post(handle_disconnect))
        .route("/reconnect-all", post(handle_reconnect_all))
        .route("/device-status", get(handle_device_status_all))
        .route("/device-status/:device_id", get(handle_device_status))
        .route("/device-id-map", get(handle_device_id_map))
        .route("/response/:device_id", get(handle_response_all))
        .route("/response/:device_id/:tag_id", get(handle_response_one))
        .route("/execute-commands/:device_id", post(handle_execute_commands))
        .route("/request-commands/:device_id", post(handle_request_commands))
        .route("/execute-command-ids/:device_id", post(handle_execute_command_ids))
        .route("/request-command-ids/:device_id", post(handle_request_command_ids))
        .with_state(state)
}

/// §7 "cluster ops that require readiness return 400 ... during the
/// startup window", applied to writer-initiated driver ops.
fn require_prepared(cluster: &ClusterService) -> Result<(), (StatusCode, String)> {
    if cluster.is_prepared() {
        Ok(())
    } else {
        Err((StatusCode::BAD_REQUEST, "application is not prepared".into()))
    }
}

#[derive(Deserialize)]
struct ConnectBody {
    devices: Vec<Device>,
}

#[derive(Deserialize, Default)]
struct DisconnectBody {
    ids: Vec<String>,
    #[serde(default)]
    only_self: bool,
}

#[derive(Deserialize, Default)]
struct CommandIdsBody {
    #[serde(default)]
    ids: Vec<String>,
}

async fn handle_connect_all(
    State(state): State<DriverApiState>,
    Path(node_index): Path<u32>,
    Json(body): Json<ConnectBody>,
) -> impl IntoResponse {
    if let Err(e) = require_prepared(&state.cluster) {
        return e.into_response();
    }
    match state.driver.connect_all_to_leader(node_index, body.devices).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn handle_balanced_connect_all(State(state): State<DriverApiState>, Json(body): Json<ConnectBody>) -> impl IntoResponse {
    if let Err(e) = require_prepared(&state.cluster) {
        return e.into_response();
    }
    let node_index = state.driver.node_index();
    match state.driver.balanced_connect_all(node_index, body.devices).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Peer-internal: the target node dispatches locally without re-validating
/// (the leader already validated and partitioned before forwarding here).
async fn handle_connect_all_to_index(State(state): State<DriverApiState>, Json(body): Json<ConnectBody>) -> impl IntoResponse {
    match state.driver.connect_all(body.devices).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// Peer-internal: forwarded by a follower's `connectAllToLeader` to
/// whichever node answers as LEADER.
async fn handle_connect_all_to_leader(
    State(state): State<DriverApiState>,
    Path(node_index): Path<u32>,
    Json(body): Json<ConnectBody>,
) -> impl IntoResponse {
    match state.driver.connect_all_to_leader(node_index, body.devices).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn handle_disconnect(State(state): State<DriverApiState>, Json(body): Json<DisconnectBody>) -> impl IntoResponse {
    match state.driver.disconnect_list(body.ids, body.only_self).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn handle_reconnect_all(State(state): State<DriverApiState>) -> impl IntoResponse {
    if let Err(e) = require_prepared(&state.cluster) {
        return e.into_response();
    }
    match state.driver.reconnect_all().await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn handle_device_status_all(State(state): State<DriverApiState>) -> impl IntoResponse {
    Json(state.driver.device_status_all().await).into_response()
}

/// §7 "status endpoints return DISCONNECTED for unknown devices" — never
/// a 404, always 200 with the status code.
async fn handle_device_status(State(state): State<DriverApiState>, Path(device_id): Path<String>) -> impl IntoResponse {
    Json(state.driver.device_status(&device_id).await).into_response()
}

async fn handle_device_id_map(State(state): State<DriverApiState>) -> impl IntoResponse {
    Json(state.driver.device_id_map().await).into_response()
}

async fn handle_response_all(State(state): State<DriverApiState>, Path(device_id): Path<String>) -> impl IntoResponse {
    Json(state.driver.last_responses_for_device(&device_id).await).into_response()
}

async fn handle_response_one(
    State(state): State<DriverApiState>,
    Path((device_id, tag_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.driver.last_response(&device_id, &tag_id).await {
        Some(response) => Json(response).into_response(),
        None => (StatusCode::NOT_FOUND, "no response recorded".to_string()).into_response(),
    }
}

/// `execute-*` fires without waiting for the command set to finish;
/// `request-*` (below) awaits and returns the produced responses.
async fn handle_execute_commands(State(state): State<DriverApiState>, Path(device_id): Path<String>) -> impl IntoResponse {
    spawn_fire_and_forget(state.driver, device_id, Vec::new());
    StatusCode::ACCEPTED.into_response()
}

async fn handle_request_commands(State(state): State<DriverApiState>, Path(device_id): Path<String>) -> impl IntoResponse {
    match state.driver.run_commands(&device_id, Vec::new(), true).await {
        Ok(responses) => Json(responses).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn handle_execute_command_ids(
    State(state): State<DriverApiState>,
    Path(device_id): Path<String>,
    Json(body): Json<CommandIdsBody>,
) -> impl IntoResponse {
    spawn_fire_and_forget(state.driver, device_id, body.ids);
    StatusCode::ACCEPTED.into_response()
}

async fn handle_request_command_ids(
    State(state): State<DriverApiState>,
    Path(device_id): Path<String>,
    Json(body): Json<CommandIdsBody>,
) -> impl IntoResponse {
    match state.driver.run_commands(&device_id, body.ids, true).await {
        Ok(responses) => Json(responses).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

fn spawn_fire_and_forget(driver: Arc<DriverService>, device_id: String, ids: Vec<String>) {
    tokio::spawn(async move {
        if let Err(e) = driver.run_commands(&device_id, ids, false).await {
            tracing::warn!(device_id = %device_id, error = %e, "fire-and-forget command execution failed");
        }
    });
}
