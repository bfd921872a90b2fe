use tokio::sync::RwLock;
use tracing::info;

use rbook_types::Peer;

/// The set of known cluster peers.
///
/// Seeded from configuration at startup and extended by replicated
/// `updatePeers` commands, so every replica records a membership change at the
/// same log index. Shared between the coordinator (which applies the command)
/// and the replicator (which fans leader probes out over it).
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<Vec<Peer>>,
}

impl PeerRegistry {
    pub fn new(initial: Vec<Peer>) -> Self {
        PeerRegistry { peers: RwLock::new(initial) }
    }

    /// Append `peer`, replacing any previous entry with the same node id.
    pub async fn add(&self, peer: Peer) {
        let mut g = self.peers.write().await;
        g.retain(|p| p.node_id != peer.node_id);
        info!(node_id = peer.node_id, raft_addr = %peer.raft_addr, "peer recorded");
        g.push(peer);
    }

    pub async fn list(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }
}
