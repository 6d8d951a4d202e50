//! HTTP wire protocol between cluster peers (§6 "Wire protocol between peers").
//!
//! Grounded on the teacher's `api/http.rs` (axum `Router` + `State<Arc<_>>`
//! shape, tuple `(StatusCode, Json<_>)` error responses) applied to this
//! spec's RPC verb list instead of the teacher's WAL write surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};

use crate::cluster::service::ClusterService;
use crate::cluster::transport::{SharedObjectBody, SharedObjectDelta, SharedObjectDeletion};
use crate::model::NodeRole;

pub fn router(cluster: Arc<ClusterService>) -> Router {
    Router::new()
        .route("/heartbeat/:node_index/:role/:last_transition", put(handle_heartbeat))
        .route("/node-status", get(handle_node_status))
        .route("/set-to-leader", put(handle_set_to_leader))
        .route("/set-to-follower", put(handle_set_to_follower))
        .route("/cluster-deleted/:node_index", delete(handle_cluster_deleted))
        .route("/remove-shared-object/:node_index", delete(handle_remove_shared_object))
        .route("/get-shared-object", get(handle_get_own_shared_object))
        .route("/get-shared-object/:node_index", get(handle_get_shared_object))
        .route("/merge-shared-object-to-leader/:node_index", post(handle_merge_to_leader))
        .route("/delete-shared-object-to-leader/:node_index", post(handle_delete_to_leader))
        .route("/check-merge-shared-object/:node_index", post(handle_check_merge))
        .route("/check-delete-shared-object/:node_index", post(handle_check_delete))
        .route("/overwrite-shared-object/:node_index", post(handle_overwrite))
        .route("/sync-shared-object/:node_index", post(handle_sync))
        .route("/check-shared-object-sequence", post(handle_check_seq))
        .route("/index", get(handle_index))
        .with_state(cluster)
}

fn parse_role(raw: &str) -> Result<NodeRole, (StatusCode, String)> {
    match raw {
        "LEADER" => Ok(NodeRole::Leader),
        "FOLLOWER" => Ok(NodeRole::Follower),
        other => Err((StatusCode::BAD_REQUEST, format!("unknown role {other:?}"))),
    }
}

/// Gate for writer-initiated cluster ops during the startup prepare window
/// (§4.B, §7): pure membership machinery (heartbeat, node-status, /index,
/// the check-* peer callbacks) stays open so bootstrap itself can proceed.
fn require_prepared(cluster: &ClusterService) -> Result<(), (StatusCode, String)> {
    if cluster.is_prepared() {
        Ok(())
    } else {
        Err((StatusCode::BAD_REQUEST, "application is not prepared".into()))
    }
}

async fn handle_heartbeat(
    State(cluster): State<Arc<ClusterService>>,
    Path((node_index, role, last_transition)): Path<(u32, String, i64)>,
    Json(body): Json<super::transport::HeartbeatBody>,
) -> impl IntoResponse {
    let role = match parse_role(&role) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    cluster
        .heartbeat_received(node_index, role, last_transition, body.seq_map)
        .await;
    StatusCode::OK.into_response()
}

async fn handle_node_status(State(cluster): State<Arc<ClusterService>>) -> impl IntoResponse {
    Json(cluster.node_status().await).into_response()
}

async fn handle_set_to_leader(State(cluster): State<Arc<ClusterService>>) -> impl IntoResponse {
    if let Err(e) = require_prepared(&cluster) {
        return e.into_response();
    }
    cluster.transition_to(NodeRole::Leader).await;
    StatusCode::OK.into_response()
}

async fn handle_set_to_follower(State(cluster): State<Arc<ClusterService>>) -> impl IntoResponse {
    if let Err(e) = require_prepared(&cluster) {
        return e.into_response();
    }
    cluster.transition_to(NodeRole::Follower).await;
    StatusCode::OK.into_response()
}

async fn handle_cluster_deleted(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> impl IntoResponse {
    cluster.cluster_deleted(node_index).await;
    StatusCode::OK.into_response()
}

async fn handle_remove_shared_object(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> impl IntoResponse {
    cluster.remove_shared_object(node_index).await;
    StatusCode::OK.into_response()
}

async fn handle_get_own_shared_object(State(cluster): State<Arc<ClusterService>>) -> impl IntoResponse {
    Json(cluster.get_shared_object(None).await).into_response()
}

async fn handle_get_shared_object(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
) -> impl IntoResponse {
    Json(cluster.get_shared_object(Some(node_index)).await).into_response()
}

async fn handle_merge_to_leader(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<SharedObjectDelta>,
) -> impl IntoResponse {
    if let Err(e) = require_prepared(&cluster) {
        return e.into_response();
    }
    match cluster.merge_from_follower(node_index, info).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_delete_to_leader(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<SharedObjectDeletion>,
) -> impl IntoResponse {
    if let Err(e) = require_prepared(&cluster) {
        return e.into_response();
    }
    match cluster.delete_from_follower(node_index, info).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_check_merge(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<SharedObjectDelta>,
) -> impl IntoResponse {
    Json(cluster.check_merge_shared_object(node_index, info).await).into_response()
}

async fn handle_check_delete(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(info): Json<SharedObjectDeletion>,
) -> impl IntoResponse {
    Json(cluster.check_delete_shared_object(node_index, info).await).into_response()
}

async fn handle_overwrite(
    State(cluster): State<Arc<ClusterService>>,
    Path(node_index): Path<u32>,
    Json(body): Json<SharedObjectBody>,
) -> impl IntoResponse {
    cluster.overwrite_shared_object(node_index, body).await;
    StatusCode::OK.into_response()
}

#[derive(serde::Deserialize)]
struct SyncBody {
    full_map: HashMap<u32, SharedObjectBody>,
    #[allow(dead_code)]
    seq_map: HashMap<u32, u64>,
}

async fn handle_sync(
    State(cluster): State<Arc<ClusterService>>,
    Path(_sender_index): Path<u32>,
    Json(body): Json<SyncBody>,
) -> impl IntoResponse {
    cluster.sync_shared_object_received(body.full_map).await;
    StatusCode::OK.into_response()
}

async fn handle_check_seq(
    State(cluster): State<Arc<ClusterService>>,
    Json(seq_map): Json<HashMap<u32, u64>>,
) -> impl IntoResponse {
    Json(cluster.check_shared_object_seq(seq_map).await).into_response()
}

async fn handle_index(State(cluster): State<Arc<ClusterService>>) -> impl IntoResponse {
    cluster.node_index().to_string().into_response()
}
