use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{BasicNode, Config, SnapshotPolicy};
use tracing::{debug, info, warn};

use rbook_types::{Command, Envelope, NodeId, Peer, RollbookError};

use crate::applier::Applier;
use crate::log::MemLogStore;
use crate::network::HttpNetworkFactory;
use crate::peers::PeerRegistry;
use crate::snapshot::SnapshotStore;
use crate::state_machine::DispatchStateMachine;
use crate::Raft;

/// Budget for one replicated apply, from proposal to committed state-machine
/// return.
const APPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on every outbound HTTP call (leader probes, forwarded commands,
/// join requests), so an unreachable peer surfaces as an error instead of a
/// hang.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn consensus_err(e: impl std::fmt::Display) -> RollbookError {
    RollbookError::Consensus(e.to_string())
}

/// Routes mutating commands into the replicated log.
///
/// On the leader a command is proposed directly; on a follower the leader's
/// HTTP port is discovered by fanning a `GetLeaderAddress` probe over the
/// known peers and the serialized command is forwarded to the leader's
/// `LeaderHandleCommand` endpoint. Submission is at-least-once with bounded
/// waiting: callers must tolerate a repeated `add` for the same id.
pub struct Replicator {
    raft: Raft,
    node: Peer,
    peers: Arc<PeerRegistry>,
    http: reqwest::Client,
}

impl Replicator {
    /// Build the consensus node: in-memory log, dispatching state machine,
    /// HTTP transport. Snapshotting is configured off — a restarting node
    /// replays the log.
    pub async fn start<A: Applier>(
        node: Peer,
        peers: Arc<PeerRegistry>,
        applier: Arc<A>,
        snapshot_dir: &Path,
    ) -> Result<Arc<Replicator>, RollbookError> {
        let config = Config {
            cluster_name: "rollbook".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            snapshot_policy: SnapshotPolicy::Never,
            ..Default::default()
        };
        let config = Arc::new(config.validate().map_err(consensus_err)?);

        let snapshots = SnapshotStore::open(snapshot_dir, node.node_id)?;
        let state_machine = DispatchStateMachine::new(applier, snapshots);
        let log_store = MemLogStore::default();
        let network = HttpNetworkFactory::new();

        let raft = Raft::new(node.node_id, config, network, log_store, state_machine)
            .await
            .map_err(consensus_err)?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(consensus_err)?;

        info!(node_id = node.node_id, raft_addr = %node.raft_addr, "consensus node started");
        Ok(Arc::new(Replicator { raft, node, peers, http }))
    }

    /// Raft handle for the cluster-side RPC routes.
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn node(&self) -> &Peer {
        &self.node
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.node.node_id)
    }

    /// Own HTTP port iff this node is the leader; the `GetLeaderAddress`
    /// contract returns an empty answer otherwise.
    pub async fn local_leader_port(&self) -> Option<u16> {
        if self.is_leader().await {
            Some(self.node.http_port)
        } else {
            None
        }
    }

    /// Serialize and submit a command: propose locally when leader, otherwise
    /// resolve the leader and forward. The state-machine return is inspected
    /// and surfaced as an error when the apply failed.
    pub async fn submit(&self, cmd: Command) -> Result<(), RollbookError> {
        if self.is_leader().await {
            match self.apply_local(cmd.clone()).await {
                // Leadership moved between the check and the proposal; fall
                // through to forwarding.
                Err(RollbookError::NotLeader { leader }) => {
                    debug!(?leader, "lost leadership mid-submit, forwarding")
                }
                other => return other,
            }
        }
        self.forward(&cmd).await
    }

    /// Leader-side handler for a command forwarded by a follower. The payload
    /// must carry exactly the replicated-command wire tags.
    pub async fn handle_forwarded(&self, payload: &str) -> Result<(), RollbookError> {
        let cmd: Command = serde_json::from_str(payload)
            .map_err(|e| RollbookError::InvalidArgument(format!("bad command payload: {e}")))?;
        self.apply_local(cmd).await
    }

    async fn apply_local(&self, cmd: Command) -> Result<(), RollbookError> {
        let write = tokio::time::timeout(APPLY_TIMEOUT, self.raft.client_write(cmd))
            .await
            .map_err(|_| RollbookError::Timeout)?;
        match write {
            Ok(resp) => match resp.data.error {
                Some(message) => Err(RollbookError::Apply(message)),
                None => Ok(()),
            },
            Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd))) => {
                Err(RollbookError::NotLeader { leader: fwd.leader_node.map(|n| n.addr) })
            }
            Err(e) => Err(consensus_err(e)),
        }
    }

    async fn forward(&self, cmd: &Command) -> Result<(), RollbookError> {
        let payload = serde_json::to_string(cmd)
            .map_err(|e| RollbookError::InvalidArgument(e.to_string()))?;
        let (host, port) = self.leader_http_addr().await?;
        let url = format!("http://{host}:{port}/LeaderHandleCommand");
        debug!(%url, "forwarding command to leader");
        let resp = self
            .http
            .get(&url)
            .query(&[("cmd", payload.as_str())])
            .send()
            .await
            .map_err(consensus_err)?;
        let envelope: Envelope = resp.json().await.map_err(consensus_err)?;
        if envelope.is_success() {
            Ok(())
        } else {
            Err(RollbookError::Apply(envelope.message))
        }
    }

    /// Resolve the leader's HTTP address, short-circuiting locally when this
    /// node is the leader.
    async fn leader_http_addr(&self) -> Result<(String, u16), RollbookError> {
        if let Some(port) = self.local_leader_port().await {
            return Ok((self.node.host().to_string(), port));
        }
        let peers = self.peers.list().await;
        self.probe_leader(&peers).await
    }

    /// Broadcast `GetLeaderAddress` to every known peer. The leader answers
    /// with its own HTTP port; everyone else answers empty.
    async fn probe_leader(&self, peers: &[Peer]) -> Result<(String, u16), RollbookError> {
        for peer in peers {
            if peer.node_id == self.node.node_id {
                continue;
            }
            let url = format!("http://{}:{}/GetLeaderAddress", peer.host(), peer.http_port);
            let resp = match self.http.get(&url).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(%url, error = %e, "leader probe unreachable");
                    continue;
                }
            };
            let envelope: Envelope = match resp.json().await {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(%url, error = %e, "leader probe returned garbage");
                    continue;
                }
            };
            let Some(port) = envelope.data.as_str().filter(|s| !s.is_empty()) else {
                continue;
            };
            match port.parse::<u16>() {
                Ok(port) => return Ok((peer.host().to_string(), port)),
                Err(e) => debug!(%url, error = %e, "unparsable leader port"),
            }
        }
        Err(RollbookError::Consensus("no peer identified itself as the leader".into()))
    }

    /// First node of a cluster initializes a single-server configuration;
    /// later nodes probe the configured peers for the leader and ask it to
    /// admit them.
    pub async fn bootstrap(&self) -> Result<(), RollbookError> {
        let peers = self.peers.list().await;
        if peers.is_empty() {
            info!(node_id = self.node.node_id, "no initial peers, bootstrapping the cluster");
            let mut nodes = BTreeMap::new();
            nodes.insert(self.node.node_id, BasicNode::new(self.node.raft_addr.clone()));
            return match self.raft.initialize(nodes).await {
                Ok(()) => Ok(()),
                // Restarted with an existing configuration.
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => Ok(()),
                Err(e) => Err(consensus_err(e)),
            };
        }

        let (host, port) = self.probe_leader(&peers).await?;
        let url = format!("http://{host}:{port}/JoinRaftCluster");
        info!(%url, node_id = self.node.node_id, "requesting admission to the cluster");
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("nodeID", self.node.node_id.to_string()),
                ("nodeAddress", self.node.raft_addr.clone()),
                ("portAddress", self.node.http_port.to_string()),
            ])
            .send()
            .await
            .map_err(consensus_err)?;
        let envelope: Envelope = resp.json().await.map_err(consensus_err)?;
        if envelope.is_success() {
            Ok(())
        } else {
            Err(RollbookError::Consensus(format!("join rejected: {}", envelope.message)))
        }
    }

    /// Leader-only admission: add the server as a voter, then replicate an
    /// `updatePeers` command so every replica records the newcomer. A no-op
    /// success on followers.
    pub async fn join_cluster(
        &self,
        node_id: NodeId,
        raft_addr: String,
        http_port: u16,
    ) -> Result<(), RollbookError> {
        if !self.is_leader().await {
            return Ok(());
        }
        self.raft
            .add_learner(node_id, BasicNode::new(raft_addr.clone()), true)
            .await
            .map_err(consensus_err)?;

        let voters: BTreeSet<NodeId> = {
            let metrics = self.raft.metrics().borrow().clone();
            let mut ids: BTreeSet<NodeId> =
                metrics.membership_config.membership().voter_ids().collect();
            ids.insert(node_id);
            ids
        };
        self.raft.change_membership(voters, false).await.map_err(consensus_err)?;
        info!(node_id, %raft_addr, "voter admitted");

        if let Err(e) = self
            .submit(Command::UpdatePeers {
                peer: Peer { node_id, raft_addr, http_port },
            })
            .await
        {
            warn!(error = %e, "failed to replicate the peer update");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    use rbook_types::Student;

    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<String>>,
    }

    impl Applier for RecordingApplier {
        async fn apply_add(&self, student: Student) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("add:{}", student.id));
            Ok(())
        }

        async fn apply_update(&self, student: Student) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("update:{}", student.id));
            Ok(())
        }

        async fn apply_delete(&self, id: String) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("delete:{id}"));
            Err(RollbookError::NotFound(id))
        }

        async fn apply_reload_cache(&self) -> Result<(), RollbookError> {
            self.calls.lock().await.push("reload".into());
            Ok(())
        }

        async fn apply_periodic_delete(&self, examine_size: usize) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("expire:{examine_size}"));
            Ok(())
        }

        async fn apply_update_peers(&self, peer: Peer) {
            self.calls.lock().await.push(format!("peer:{}", peer.node_id));
        }
    }

    fn self_peer() -> Peer {
        Peer { node_id: 1, raft_addr: "127.0.0.1:9301".into(), http_port: 18081 }
    }

    async fn leader_replicator(
        applier: Arc<RecordingApplier>,
        dir: &std::path::Path,
    ) -> Arc<Replicator> {
        let replicator = Replicator::start(
            self_peer(),
            Arc::new(PeerRegistry::new(Vec::new())),
            applier,
            dir,
        )
        .await
        .unwrap();
        replicator.bootstrap().await.unwrap();
        replicator
            .raft()
            .wait(Some(Duration::from_secs(10)))
            .current_leader(1, "single node elects itself")
            .await
            .unwrap();
        replicator
    }

    #[tokio::test]
    async fn single_node_submit_applies_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Arc::new(RecordingApplier::default());
        let replicator = leader_replicator(applier.clone(), dir.path()).await;

        assert!(replicator.is_leader().await);
        assert_eq!(replicator.local_leader_port().await, Some(18081));

        replicator.submit(Command::PeriodicDelete { examine_size: 4 }).await.unwrap();
        replicator.submit(Command::ReloadCacheData).await.unwrap();

        let calls = applier.calls.lock().await.clone();
        assert_eq!(calls, vec!["expire:4", "reload"]);
    }

    #[tokio::test]
    async fn failed_apply_surfaces_to_the_submitter() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Arc::new(RecordingApplier::default());
        let replicator = leader_replicator(applier.clone(), dir.path()).await;

        let err = replicator
            .submit(Command::Delete { id: "ghost".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RollbookError::Apply(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn forwarded_payload_is_decoded_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Arc::new(RecordingApplier::default());
        let replicator = leader_replicator(applier.clone(), dir.path()).await;

        let payload = r#"{"op":"periodicDelete","examineSize":9}"#;
        replicator.handle_forwarded(payload).await.unwrap();
        assert_eq!(*applier.calls.lock().await, vec!["expire:9"]);

        let err = replicator.handle_forwarded("not json").await.unwrap_err();
        assert!(matches!(err, RollbookError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn join_on_follower_is_a_noop_success() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Arc::new(RecordingApplier::default());
        // Started but never bootstrapped: the node has no leader and is not one.
        let replicator = Replicator::start(
            self_peer(),
            Arc::new(PeerRegistry::new(Vec::new())),
            applier,
            dir.path(),
        )
        .await
        .unwrap();

        assert!(!replicator.is_leader().await);
        replicator.join_cluster(9, "127.0.0.1:9309".into(), 18089).await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Two-node cluster: admission replicates over real loopback RPC
    // -----------------------------------------------------------------------

    /// Serve the Raft RPC routes for `raft` on a pre-bound listener, the same
    /// three routes the node's cluster router exposes.
    fn spawn_raft_router(listener: tokio::net::TcpListener, raft: Raft) {
        use axum::extract::State;
        use axum::routing::post;
        use axum::{Json, Router};
        use openraft::raft::{
            AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
            InstallSnapshotResponse, VoteRequest, VoteResponse,
        };

        use crate::{NodeId, TypeConfig};

        async fn append(
            State(raft): State<Raft>,
            Json(req): Json<AppendEntriesRequest<TypeConfig>>,
        ) -> Json<AppendEntriesResponse<NodeId>> {
            Json(raft.append_entries(req).await.expect("append_entries"))
        }

        async fn vote(
            State(raft): State<Raft>,
            Json(req): Json<VoteRequest<NodeId>>,
        ) -> Json<VoteResponse<NodeId>> {
            Json(raft.vote(req).await.expect("vote"))
        }

        async fn snapshot(
            State(raft): State<Raft>,
            Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
        ) -> Json<InstallSnapshotResponse<NodeId>> {
            Json(raft.install_snapshot(req).await.expect("install_snapshot"))
        }

        let router = Router::new()
            .route("/raft/append", post(append))
            .route("/raft/vote", post(vote))
            .route("/raft/snapshot", post(snapshot))
            .with_state(raft);
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("raft RPC router");
        });
    }

    async fn wait_for_call(applier: &RecordingApplier, needle: &str) {
        for _ in 0..100 {
            if applier.calls.lock().await.iter().any(|c| c == needle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for applier call {needle:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leader_admits_a_second_node_and_replicates_to_it() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let applier1 = Arc::new(RecordingApplier::default());
        let applier2 = Arc::new(RecordingApplier::default());

        // Bind both Raft listeners first; the leader replicates to the
        // newcomer's raft_addr while admitting it, so the port must be live
        // before the join is requested.
        let listener1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr1 = listener1.local_addr().unwrap();
        let addr2 = listener2.local_addr().unwrap();

        let node1 = Peer { node_id: 1, raft_addr: addr1.to_string(), http_port: 18181 };
        let node2 = Peer { node_id: 2, raft_addr: addr2.to_string(), http_port: 18182 };

        let repl1 = Replicator::start(
            node1.clone(),
            Arc::new(PeerRegistry::new(Vec::new())),
            applier1.clone(),
            dir1.path(),
        )
        .await
        .unwrap();
        let repl2 = Replicator::start(
            node2.clone(),
            Arc::new(PeerRegistry::new(vec![node1])),
            applier2.clone(),
            dir2.path(),
        )
        .await
        .unwrap();

        spawn_raft_router(listener1, repl1.raft().clone());
        spawn_raft_router(listener2, repl2.raft().clone());

        repl1.bootstrap().await.unwrap();
        repl1
            .raft()
            .wait(Some(Duration::from_secs(10)))
            .current_leader(1, "first node elects itself")
            .await
            .unwrap();

        // What the leader's JoinRaftCluster handler runs: voter admission
        // plus the replicated peer update.
        repl1.join_cluster(2, addr2.to_string(), node2.http_port).await.unwrap();

        // The follower learns the leader through real AppendEntries traffic.
        repl2
            .raft()
            .wait(Some(Duration::from_secs(10)))
            .current_leader(1, "admitted node follows the leader")
            .await
            .unwrap();

        // The updatePeers command committed on both state machines.
        wait_for_call(&applier1, "peer:2").await;
        wait_for_call(&applier2, "peer:2").await;

        // A mutation submitted after the join reaches both replicas.
        repl1.submit(Command::PeriodicDelete { examine_size: 3 }).await.unwrap();
        wait_for_call(&applier1, "expire:3").await;
        wait_for_call(&applier2, "expire:3").await;
    }
}
