//! Snapshots of shelved Background content.
//!
//! A [`Snapshot`] records, for one wrapped operation, which paths were
//! shelved and the SHA-256 digest of each path's bytes at shelve time. The
//! snapshot id is embedded in the shelf's stash message, so a snapshot always
//! points at exactly one recoverable shelf. Snapshots are written to the
//! index before the shelf exists and removed only after the shelf has been
//! restored and dropped.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::StateError;
use crate::git::{ShelfLabel, StatusEntry};
use crate::state::{read_record, write_record, StatePaths};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One shelved path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPath {
    pub path: String,
    /// Hex SHA-256 of the content, `None` if deleted in the working tree.
    pub digest: Option<String>,
    pub untracked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub operation_label: String,
    pub repo_root: PathBuf,
    pub paths: Vec<SnapshotPath>,
    /// Commit id of the shelf entry, filled in once the shelve succeeds.
    #[serde(default)]
    pub shelf_commit: Option<String>,
}

impl Snapshot {
    /// Digest every entry's current working-tree content.
    pub fn capture(
        repo_root: &Path,
        operation_label: &str,
        entries: &[StatusEntry],
    ) -> Result<Self, StateError> {
        let mut paths = Vec::with_capacity(entries.len());
        for entry in entries {
            paths.push(SnapshotPath {
                path: entry.path.clone(),
                digest: digest_path(&repo_root.join(&entry.path))?,
                untracked: entry.is_untracked(),
            });
        }
        let snapshot = Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            operation_label: operation_label.to_string(),
            repo_root: repo_root.to_path_buf(),
            paths,
            shelf_commit: None,
        };
        debug!(snapshot_id = %snapshot.id, paths = snapshot.paths.len(), "snapshot captured");
        Ok(snapshot)
    }

    pub fn path_list(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.path.clone()).collect()
    }

    pub fn has_untracked(&self) -> bool {
        self.paths.iter().any(|p| p.untracked)
    }

    /// The label under which this snapshot's content is shelved.
    pub fn shelf_label(&self) -> ShelfLabel {
        ShelfLabel::new(self.id, &self.operation_label, &self.path_list())
    }

    /// Paths whose current content no longer matches the captured digest.
    pub fn diverged_paths(&self) -> Result<Vec<String>, StateError> {
        let mut diverged = Vec::new();
        for p in &self.paths {
            if digest_path(&self.repo_root.join(&p.path))? != p.digest {
                diverged.push(p.path.clone());
            }
        }
        Ok(diverged)
    }
}

/// Hex SHA-256 of a file's bytes, or of a symlink's target path.
pub fn digest_path(path: &Path) -> Result<Option<String>, StateError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let bytes = if meta.file_type().is_symlink() {
        fs::read_link(path)?.to_string_lossy().into_owned().into_bytes()
    } else {
        fs::read(path)?
    };
    Ok(Some(hex::encode(Sha256::digest(&bytes))))
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotIndex {
    snapshots: Vec<Snapshot>,
}

/// The per-repository snapshot index (`snapshots.json`).
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    file: PathBuf,
}

impl SnapshotStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            file: paths.snapshot_index(),
        }
    }

    fn load(&self) -> Result<SnapshotIndex, StateError> {
        Ok(read_record(&self.file)?.unwrap_or_default())
    }

    fn save(&self, index: &SnapshotIndex) -> Result<(), StateError> {
        write_record(&self.file, index)
    }

    /// Add a snapshot to the index.
    pub fn record(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let mut index = self.load()?;
        index.snapshots.retain(|s| s.id != snapshot.id);
        index.snapshots.push(snapshot.clone());
        self.save(&index)?;
        info!(snapshot_id = %snapshot.id, label = %snapshot.operation_label, "snapshot recorded");
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Snapshot>, StateError> {
        Ok(self.load()?.snapshots.into_iter().find(|s| &s.id == id))
    }

    /// All retained snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<Snapshot>, StateError> {
        let mut snapshots = self.load()?.snapshots;
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    /// Remove a snapshot. Returns `false` if it was not present.
    pub fn remove(&self, id: &Uuid) -> Result<bool, StateError> {
        let mut index = self.load()?;
        let before = index.snapshots.len();
        index.snapshots.retain(|s| &s.id != id);
        if index.snapshots.len() == before {
            return Ok(false);
        }
        self.save(&index)?;
        debug!(snapshot_id = %id, "snapshot removed");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::ChangeKind;

    fn entry(path: &str, kind: ChangeKind) -> StatusEntry {
        StatusEntry {
            path: path.into(),
            kind,
        }
    }

    #[test]
    fn test_capture_digests_and_divergence() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.po"), "msgid \"x\"\n").unwrap();
        fs::write(dir.path().join("b.mo"), [0u8, 1, 2]).unwrap();

        let snap = Snapshot::capture(
            dir.path(),
            "push",
            &[
                entry("a.po", ChangeKind::Modified),
                entry("b.mo", ChangeKind::Untracked),
                entry("gone.po", ChangeKind::Deleted),
            ],
        )
        .unwrap();

        assert_eq!(snap.paths.len(), 3);
        assert!(snap.paths[0].digest.is_some());
        assert!(snap.paths[1].untracked);
        assert!(snap.paths[2].digest.is_none());
        assert!(snap.has_untracked());
        assert!(snap.diverged_paths().unwrap().is_empty());

        fs::write(dir.path().join("a.po"), "changed\n").unwrap();
        fs::write(dir.path().join("gone.po"), "back\n").unwrap();
        assert_eq!(snap.diverged_paths().unwrap(), vec!["a.po", "gone.po"]);

        let label = snap.shelf_label();
        assert_eq!(label.snapshot_id, snap.id);
        assert!(label.description.starts_with("push: a.po"));
    }

    #[test]
    fn test_store_record_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(&StatePaths::at(dir.path()));
        assert!(store.list().unwrap().is_empty());

        let first = Snapshot::capture(dir.path(), "first", &[]).unwrap();
        let second = Snapshot::capture(dir.path(), "second", &[]).unwrap();
        store.record(&first).unwrap();
        store.record(&second).unwrap();
        store.record(&first).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(store.get(&second.id).unwrap().unwrap(), second);

        assert!(store.remove(&first.id).unwrap());
        assert!(!store.remove(&first.id).unwrap());
        assert_eq!(store.list().unwrap(), vec![second]);
    }
}
