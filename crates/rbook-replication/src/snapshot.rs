use std::fs;
use std::path::{Path, PathBuf};

use openraft::{BasicNode, SnapshotMeta};
use tracing::debug;

use rbook_types::RollbookError;

use crate::NodeId;

/// Number of snapshot files retained per node.
const RETENTION: usize = 3;

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

/// File-backed snapshot store under `snapshots/<node_id>/`.
///
/// Snapshots here carry membership and log position only — the application
/// state machine is deliberately not serialised, so a restarting node replays
/// the log instead of restoring from disk. Files beyond [`RETENTION`] are
/// pruned oldest-first.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(base: &Path, node_id: NodeId) -> Result<Self, RollbookError> {
        let dir = base.join(node_id.to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| RollbookError::Storage(format!("snapshot dir {}: {e}", dir.display())))?;
        Ok(SnapshotStore { dir })
    }

    /// File name keyed by log index so lexicographic order matches log order.
    fn file_name(meta: &SnapshotMeta<NodeId, BasicNode>) -> String {
        let index = meta.last_log_id.map(|id| id.index).unwrap_or(0);
        format!("snapshot-{index:020}.json")
    }

    pub fn persist(
        &self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), RollbookError> {
        let stored = StoredSnapshot { meta: meta.clone(), data: data.to_vec() };
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| RollbookError::Storage(e.to_string()))?;
        let path = self.dir.join(Self::file_name(meta));
        fs::write(&path, bytes)
            .map_err(|e| RollbookError::Storage(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "snapshot persisted");
        self.prune()
    }

    pub fn latest(
        &self,
    ) -> Result<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>, RollbookError> {
        let Some(path) = self.sorted_files()?.pop() else {
            return Ok(None);
        };
        let bytes = fs::read(&path)
            .map_err(|e| RollbookError::Storage(format!("{}: {e}", path.display())))?;
        let stored: StoredSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| RollbookError::Storage(e.to_string()))?;
        Ok(Some((stored.meta, stored.data)))
    }

    fn sorted_files(&self) -> Result<Vec<PathBuf>, RollbookError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| RollbookError::Storage(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("snapshot-"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn prune(&self) -> Result<(), RollbookError> {
        let files = self.sorted_files()?;
        if files.len() <= RETENTION {
            return Ok(());
        }
        for stale in &files[..files.len() - RETENTION] {
            if let Err(e) = fs::remove_file(stale) {
                debug!(path = %stale.display(), error = %e, "failed to prune snapshot");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, LogId, StoredMembership};

    fn meta(index: u64) -> SnapshotMeta<NodeId, BasicNode> {
        SnapshotMeta {
            last_log_id: Some(LogId::new(CommittedLeaderId::new(1, 1), index)),
            last_membership: StoredMembership::default(),
            snapshot_id: format!("snap-{index}"),
        }
    }

    #[test]
    fn latest_returns_highest_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 1).unwrap();

        store.persist(&meta(3), b"three").unwrap();
        store.persist(&meta(12), b"twelve").unwrap();
        store.persist(&meta(7), b"seven").unwrap();

        let (meta, data) = store.latest().unwrap().unwrap();
        assert_eq!(meta.last_log_id.unwrap().index, 12);
        assert_eq!(data, b"twelve");
    }

    #[test]
    fn retention_keeps_three_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        for index in 1..=5 {
            store.persist(&meta(index), &[]).unwrap();
        }

        let files = store.sorted_files().unwrap();
        assert_eq!(files.len(), 3);
        let (meta, _) = store.latest().unwrap().unwrap();
        assert_eq!(meta.last_log_id.unwrap().index, 5);
    }

    #[test]
    fn snapshots_are_scoped_per_node() {
        let dir = tempfile::tempdir().unwrap();
        let store1 = SnapshotStore::open(dir.path(), 1).unwrap();
        let store2 = SnapshotStore::open(dir.path(), 2).unwrap();

        store1.persist(&meta(1), b"one").unwrap();
        assert!(store2.latest().unwrap().is_none());
    }
}
