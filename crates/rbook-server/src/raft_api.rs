use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};

use rbook_replication::{NodeId, Raft, TypeConfig};

/// Raft RPC routes. The consensus transport is JSON over HTTP; these handlers
/// only hand the request to the local Raft instance and echo its answer.
pub fn router(raft: Raft) -> Router {
    Router::new()
        .route("/raft/append", post(append_entries))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(install_snapshot))
        .with_state(raft)
}

async fn append_entries(
    State(raft): State<Raft>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Response {
    match raft.append_entries(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn vote(State(raft): State<Raft>, Json(req): Json<VoteRequest<NodeId>>) -> Response {
    match raft.vote(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn install_snapshot(
    State(raft): State<Raft>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Response {
    match raft.install_snapshot(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
