use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use rbook_storage::CacheStore;
use rbook_types::{Command, Envelope, NodeId, RollbookError, Student};

use crate::AppState;

pub fn router<C: CacheStore>(state: AppState<C>) -> Router {
    Router::new()
        .route("/student", post(add_student::<C>).put(update_student::<C>))
        .route("/student/:id", get(get_student::<C>).delete(delete_student::<C>))
        .route("/JoinRaftCluster", get(join_cluster::<C>))
        .route("/LeaderHandleCommand", get(leader_handle_command::<C>))
        .route("/GetLeaderAddress", get(get_leader_address::<C>))
        .with_state(state)
}

fn error_status(err: &RollbookError) -> StatusCode {
    match err {
        RollbookError::NotFound(_) | RollbookError::Expired(_) => StatusCode::NOT_FOUND,
        RollbookError::InvalidArgument(_) | RollbookError::Apply(_) => StatusCode::BAD_REQUEST,
        RollbookError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RollbookError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RollbookError::Cache(_) | RollbookError::Storage(_) | RollbookError::Consensus(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn failure(err: RollbookError) -> (StatusCode, Json<Envelope>) {
    warn!(error = %err, "request failed");
    (error_status(&err), Json(Envelope::error(err.to_string())))
}

async fn add_student<C: CacheStore>(
    State(state): State<AppState<C>>,
    Json(student): Json<Student>,
) -> (StatusCode, Json<Envelope>) {
    if student.id.is_empty() {
        return failure(RollbookError::InvalidArgument("id must not be empty".into()));
    }
    match state.replicator.submit(Command::Add { student }).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::ok())),
        Err(e) => failure(e),
    }
}

async fn get_student<C: CacheStore>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    match state.coordinator.get(&id).await {
        Ok(student) => match serde_json::to_value(&student) {
            Ok(data) => (StatusCode::OK, Json(Envelope::success(data))),
            Err(e) => failure(RollbookError::InvalidArgument(e.to_string())),
        },
        Err(e) => failure(e),
    }
}

async fn update_student<C: CacheStore>(
    State(state): State<AppState<C>>,
    Json(student): Json<Student>,
) -> (StatusCode, Json<Envelope>) {
    if student.id.is_empty() {
        return failure(RollbookError::InvalidArgument("id must not be empty".into()));
    }
    match state.replicator.submit(Command::Update { student }).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::ok())),
        Err(e) => failure(e),
    }
}

async fn delete_student<C: CacheStore>(
    State(state): State<AppState<C>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Envelope>) {
    match state.replicator.submit(Command::Delete { id }).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::ok())),
        Err(e) => failure(e),
    }
}

#[derive(serde::Deserialize)]
struct JoinParams {
    #[serde(rename = "nodeID")]
    node_id: NodeId,
    #[serde(rename = "nodeAddress")]
    node_address: String,
    #[serde(rename = "portAddress")]
    port_address: u16,
}

async fn join_cluster<C: CacheStore>(
    State(state): State<AppState<C>>,
    Query(params): Query<JoinParams>,
) -> (StatusCode, Json<Envelope>) {
    match state
        .replicator
        .join_cluster(params.node_id, params.node_address, params.port_address)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(Envelope::ok())),
        Err(e) => failure(e),
    }
}

#[derive(serde::Deserialize)]
struct ForwardedCommand {
    cmd: String,
}

async fn leader_handle_command<C: CacheStore>(
    State(state): State<AppState<C>>,
    Query(params): Query<ForwardedCommand>,
) -> (StatusCode, Json<Envelope>) {
    match state.replicator.handle_forwarded(&params.cmd).await {
        Ok(()) => (StatusCode::OK, Json(Envelope::ok())),
        Err(e) => failure(e),
    }
}

/// The leader answers with its own HTTP port; everyone else answers empty.
async fn get_leader_address<C: CacheStore>(
    State(state): State<AppState<C>>,
) -> (StatusCode, Json<Envelope>) {
    let port = state
        .replicator
        .local_leader_port()
        .await
        .map(|p| p.to_string())
        .unwrap_or_default();
    (StatusCode::OK, Json(Envelope::success(serde_json::Value::String(port))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_error_kinds() {
        assert_eq!(error_status(&RollbookError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&RollbookError::Expired("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&RollbookError::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            error_status(&RollbookError::NotLeader { leader: None }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&RollbookError::Cache("down".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&RollbookError::Apply("rejected".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn join_params_use_the_documented_query_names() {
        let params: JoinParams = serde_json::from_value(serde_json::json!({
            "nodeID": 3,
            "nodeAddress": "127.0.0.1:9303",
            "portAddress": 8083,
        }))
        .unwrap();
        assert_eq!(params.node_id, 3);
        assert_eq!(params.node_address, "127.0.0.1:9303");
        assert_eq!(params.port_address, 8083);
    }
}
