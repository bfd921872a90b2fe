pub mod applier;
pub mod log;
pub mod network;
pub mod peers;
pub mod replicator;
pub mod snapshot;
pub mod state_machine;

use std::io::Cursor;

use rbook_types::{Command, CommandOutcome};

openraft::declare_raft_types!(
    /// Raft type configuration: replicated commands in, command outcomes out.
    pub TypeConfig:
        D = Command,
        R = CommandOutcome,
);

pub type NodeId = rbook_types::NodeId;
pub type Raft = openraft::Raft<TypeConfig>;

pub use applier::Applier;
pub use peers::PeerRegistry;
pub use replicator::Replicator;
