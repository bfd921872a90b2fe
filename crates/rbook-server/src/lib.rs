mod raft_api;
mod student_api;

use std::sync::Arc;

use tokio::net::TcpListener;

use rbook_coordinator::Coordinator;
use rbook_replication::{Raft, Replicator};
use rbook_storage::CacheStore;

pub struct AppState<C: CacheStore> {
    pub coordinator: Arc<Coordinator<C>>,
    pub replicator: Arc<Replicator>,
}

impl<C: CacheStore> Clone for AppState<C> {
    fn clone(&self) -> Self {
        AppState { coordinator: self.coordinator.clone(), replicator: self.replicator.clone() }
    }
}

/// Client surface: student CRUD plus the cluster endpoints other replicas
/// call (`JoinRaftCluster`, `LeaderHandleCommand`, `GetLeaderAddress`).
///
/// Takes a pre-bound listener so the caller controls when the port is live;
/// the node must be reachable before it asks a leader to admit it.
pub async fn serve_client<C: CacheStore>(
    listener: TcpListener,
    state: AppState<C>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "client HTTP server starting");
    axum::serve(listener, student_api::router(state)).await.map_err(Into::into)
}

/// Cluster surface: the Raft RPC routes, bound on the node's raft address.
pub async fn serve_cluster(listener: TcpListener, raft: Raft) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "cluster RPC server starting");
    axum::serve(listener, raft_api::router(raft)).await.map_err(Into::into)
}
