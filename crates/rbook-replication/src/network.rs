use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use tracing::debug;

use crate::{NodeId, TypeConfig};

/// Raft RPCs travel as JSON over plain HTTP to the peer's cluster router
/// (`/raft/append`, `/raft/vote`, `/raft/snapshot`).
#[derive(Clone, Default)]
pub struct HttpNetworkFactory {
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        HttpNetwork { client: self.client.clone(), target, addr: node.addr.clone() }
    }
}

pub struct HttpNetwork {
    client: reqwest::Client,
    target: NodeId,
    addr: String,
}

impl HttpNetwork {
    async fn post<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp, NetworkError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("http://{}/{}", self.addr, path);
        debug!(target = self.target, %url, "raft rpc");
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| NetworkError::new(&e))?
            .error_for_status()
            .map_err(|e| NetworkError::new(&e))?;
        resp.json::<Resp>().await.map_err(|e| NetworkError::new(&e))
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        self.post("raft/append", &rpc).await.map_err(RPCError::Network)
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.post("raft/snapshot", &rpc).await.map_err(RPCError::Network)
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        self.post("raft/vote", &rpc).await.map_err(RPCError::Network)
    }
}
