use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta,
    StorageError, StoredMembership,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rbook_types::{Command, CommandOutcome};

use crate::applier::Applier;
use crate::snapshot::SnapshotStore;
use crate::{NodeId, TypeConfig};

#[derive(Default)]
struct SmState {
    last_applied: Option<LogId<NodeId>>,
    membership: StoredMembership<NodeId, BasicNode>,
}

/// The replicated state machine: committed commands are dispatched to the
/// [`Applier`] in log order, and the outcome (including a failed apply) is
/// returned to the submitter as data.
///
/// Snapshots carry no application state — the store of record is durable on
/// its own and the warmer tiers are reconstructable from it — so a node that
/// restarts replays the log rather than installing state from disk.
pub struct DispatchStateMachine<A: Applier> {
    applier: Arc<A>,
    snapshots: Arc<SnapshotStore>,
    state: Arc<Mutex<SmState>>,
}

impl<A: Applier> Clone for DispatchStateMachine<A> {
    fn clone(&self) -> Self {
        DispatchStateMachine {
            applier: self.applier.clone(),
            snapshots: self.snapshots.clone(),
            state: self.state.clone(),
        }
    }
}

impl<A: Applier> DispatchStateMachine<A> {
    pub fn new(applier: Arc<A>, snapshots: SnapshotStore) -> Self {
        DispatchStateMachine {
            applier,
            snapshots: Arc::new(snapshots),
            state: Arc::new(Mutex::new(SmState::default())),
        }
    }

    async fn dispatch(&self, cmd: Command) -> CommandOutcome {
        let result = match cmd {
            Command::Add { student } => self.applier.apply_add(student).await,
            Command::Update { student } => self.applier.apply_update(student).await,
            Command::Delete { id } => self.applier.apply_delete(id).await,
            Command::ReloadCacheData => self.applier.apply_reload_cache().await,
            Command::PeriodicDelete { examine_size } => {
                self.applier.apply_periodic_delete(examine_size).await
            }
            Command::UpdatePeers { peer } => {
                self.applier.apply_update_peers(peer).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => CommandOutcome::ok(),
            Err(e) => {
                warn!(error = %e, "command apply failed");
                CommandOutcome::fail(e.to_string())
            }
        }
    }
}

impl<A: Applier> RaftSnapshotBuilder<TypeConfig> for DispatchStateMachine<A> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (last_applied, membership) = {
            let g = self.state.lock().await;
            (g.last_applied, g.membership.clone())
        };
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id: uuid::Uuid::new_v4().to_string(),
        };
        // Application state is intentionally absent.
        if let Err(e) = self.snapshots.persist(&meta, &[]) {
            warn!(error = %e, "failed to persist snapshot marker");
        }
        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(Vec::new())) })
    }
}

impl<A: Applier> RaftStateMachine<TypeConfig> for DispatchStateMachine<A> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let g = self.state.lock().await;
        Ok((g.last_applied, g.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut outcomes = Vec::new();
        for entry in entries {
            {
                let mut g = self.state.lock().await;
                g.last_applied = Some(entry.log_id);
                if let EntryPayload::Membership(ref m) = entry.payload {
                    g.membership = StoredMembership::new(Some(entry.log_id), m.clone());
                }
            }
            let outcome = match entry.payload {
                EntryPayload::Normal(cmd) => {
                    debug!(index = entry.log_id.index, "applying committed command");
                    self.dispatch(cmd).await
                }
                EntryPayload::Blank | EntryPayload::Membership(_) => CommandOutcome::ok(),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        // Nothing to restore beyond the log position and membership.
        let mut g = self.state.lock().await;
        g.last_applied = meta.last_log_id;
        g.membership = meta.last_membership.clone();
        if let Err(e) = self.snapshots.persist(meta, snapshot.get_ref()) {
            warn!(error = %e, "failed to persist installed snapshot");
        }
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let stored = self
            .snapshots
            .latest()
            .map_err(|e| {
                openraft::StorageIOError::read_snapshot(None, &std::io::Error::other(e.to_string()))
            })?;
        Ok(stored.map(|(meta, data)| Snapshot { meta, snapshot: Box::new(Cursor::new(data)) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::CommittedLeaderId;
    use rbook_types::{Peer, RollbookError, Student};

    #[derive(Default)]
    struct RecordingApplier {
        calls: Mutex<Vec<String>>,
        fail_adds: bool,
    }

    impl Applier for RecordingApplier {
        async fn apply_add(&self, student: Student) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("add:{}", student.id));
            if self.fail_adds {
                Err(RollbookError::Cache("cache down".into()))
            } else {
                Ok(())
            }
        }

        async fn apply_update(&self, student: Student) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("update:{}", student.id));
            Ok(())
        }

        async fn apply_delete(&self, id: String) -> Result<(), RollbookError> {
            self.calls.lock().await.push(format!("delete:{id}"));
            Ok(())
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

    fn student(id: &str) -> Student {
        Student {
            id: id.into(),
            name: "Ann".into(),
            gender: "F".into(),
            class: "1-1".into(),
            grades: Default::default(),
            expiration: 0,
        }
    }

    fn entry(index: u64, cmd: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    fn sm(
        applier: Arc<RecordingApplier>,
    ) -> (DispatchStateMachine<RecordingApplier>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotStore::open(dir.path(), 1).unwrap();
        (DispatchStateMachine::new(applier, snapshots), dir)
    }

    #[tokio::test]
    async fn commands_dispatch_in_log_order() {
        let applier = Arc::new(RecordingApplier::default());
        let (mut machine, _dir) = sm(applier.clone());

        let outcomes = machine
            .apply(vec![
                entry(1, Command::Add { student: student("s1") }),
                entry(2, Command::Update { student: student("s1") }),
                entry(3, Command::Delete { id: "s1".into() }),
                entry(4, Command::ReloadCacheData),
                entry(5, Command::PeriodicDelete { examine_size: 8 }),
                entry(
                    6,
                    Command::UpdatePeers {
                        peer: Peer {
                            node_id: 2,
                            raft_addr: "127.0.0.1:9302".into(),
                            http_port: 8082,
                        },
                    },
                ),
            ])
            .await
            .unwrap();

        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert_eq!(
            *applier.calls.lock().await,
            vec!["add:s1", "update:s1", "delete:s1", "reload", "expire:8", "peer:2"]
        );

        let (last_applied, _) = machine.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 6);
    }

    #[tokio::test]
    async fn failed_apply_commits_with_an_error_outcome() {
        let applier = Arc::new(RecordingApplier { fail_adds: true, ..Default::default() });
        let (mut machine, _dir) = sm(applier.clone());

        let outcomes = machine
            .apply(vec![entry(1, Command::Add { student: student("s1") })])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        let err = outcomes[0].error.as_deref().unwrap();
        assert!(err.contains("cache down"));
        // The entry still advanced the applied cursor.
        let (last_applied, _) = machine.applied_state().await.unwrap();
        assert_eq!(last_applied.unwrap().index, 1);
    }

    #[tokio::test]
    async fn snapshots_carry_no_application_state() {
        let applier = Arc::new(RecordingApplier::default());
        let (mut machine, _dir) = sm(applier);

        machine
            .apply(vec![entry(1, Command::Add { student: student("s1") })])
            .await
            .unwrap();

        let snapshot = machine.build_snapshot().await.unwrap();
        assert!(snapshot.snapshot.get_ref().is_empty());
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 1);

        let current = machine.get_current_snapshot().await.unwrap().unwrap();
        assert!(current.snapshot.get_ref().is_empty());
    }
}
