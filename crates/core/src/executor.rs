//! The atomic operation executor.
//!
//! Wraps one mutating git command so that Background changes survive it:
//!
//! 1. Partition the working-tree changes with the [`Classifier`].
//! 2. Record a [`Snapshot`] of the Background paths and shelve them under a
//!    label carrying the snapshot id. A failed shelve stops here.
//! 3. Run the command.
//! 4. On success, restore the shelf. On a non-conflict failure, abort any
//!    operation the command left in progress, restore the shelf and verify
//!    every path is byte-identical to the snapshot. On a conflict, leave the
//!    shelf alone and open a conflict session that references the snapshot.
//!    A sequence stopped on a commit with nothing to resolve (a merge commit
//!    in a cherry-pick range) is continued past it first.
//!
//! A snapshot is removed only after its shelf has been applied and dropped,
//! so every shelf gitward leaves behind is reachable from a recorded id.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::conflict::manager::Continued;
use crate::conflict::SessionManager;
use crate::errors::{ConflictError, CoreError, StateError};
use crate::git::{
    ChangeKind, CommandOutput, ConflictSide, GitBackend, GitCommand, OperationKind, StatusEntry,
};
use crate::snapshot::{Snapshot, SnapshotStore};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to shelved Background content.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// There was no Background content to shelve.
    NothingShelved,
    /// Applied and dropped; the snapshot is gone.
    Restored {
        snapshot_id: Uuid,
        /// Binary paths that conflicted and took the shelved side.
        auto_resolved: Vec<String>,
    },
    /// Still shelved. The snapshot id is the handle for recovery.
    Retained {
        snapshot_id: Uuid,
        reason: String,
        paths: Vec<String>,
    },
}

impl RestoreOutcome {
    pub fn is_retained(&self) -> bool {
        matches!(self, Self::Retained { .. })
    }
}

/// Result of [`Executor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Completed {
        stdout: String,
        restore: RestoreOutcome,
    },
    /// The command stopped on conflicts. Background content stays shelved
    /// until the session is finalized or aborted.
    NeedsResolution {
        session_id: Uuid,
        kind: OperationKind,
        conflicted: Vec<String>,
        snapshot_id: Option<Uuid>,
    },
    Failed {
        reason: String,
        exit_code: i32,
        restore: RestoreOutcome,
    },
}

/// What [`Executor::execute`] would shelve, without touching anything.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub label: String,
    pub command: GitCommand,
    pub kind: Option<OperationKind>,
    pub foreground: Vec<StatusEntry>,
    pub background: Vec<StatusEntry>,
}

impl ExecutionPlan {
    pub fn include_untracked(&self) -> bool {
        self.background.iter().any(StatusEntry::is_untracked)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor<'a> {
    backend: &'a GitBackend,
    snapshots: SnapshotStore,
    sessions: SessionManager<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(backend: &'a GitBackend, snapshots: SnapshotStore, sessions: SessionManager<'a>) -> Self {
        Self {
            backend,
            snapshots,
            sessions,
        }
    }

    /// Classify the working tree for `command`.
    pub fn plan(
        &self,
        label: &str,
        command: &GitCommand,
        classifier: &Classifier,
    ) -> Result<ExecutionPlan, CoreError> {
        let mut foreground = Vec::new();
        let mut background = Vec::new();
        for entry in self.backend.status()? {
            if classifier.is_background(&entry.path) && entry.kind != ChangeKind::Conflicted {
                background.push(entry);
            } else {
                foreground.push(entry);
            }
        }
        Ok(ExecutionPlan {
            label: label.to_string(),
            command: command.clone(),
            kind: command.kind(),
            foreground,
            background,
        })
    }

    fn ensure_idle(&self) -> Result<(), CoreError> {
        if let Some(active) = self.sessions.store().load_active()? {
            return Err(StateError::ConcurrencyViolation {
                existing: active.session_id.to_string(),
            }
            .into());
        }
        if let Some(kind) = self.backend.operation_in_progress()? {
            return Err(StateError::ConcurrencyViolation {
                existing: format!("an unfinished {kind} not tracked by gitward"),
            }
            .into());
        }
        Ok(())
    }

    /// Run `command` with Background changes shelved around it.
    pub fn execute(
        &self,
        label: &str,
        command: &GitCommand,
        classifier: &Classifier,
    ) -> Result<OperationResult, CoreError> {
        self.ensure_idle()?;
        let plan = self.plan(label, command, classifier)?;
        info!(
            label,
            command = %command,
            foreground = plan.foreground.len(),
            background = plan.background.len(),
            "executing wrapped operation"
        );

        let snapshot = if plan.background.is_empty() {
            None
        } else {
            Some(self.shelve(label, &plan.background)?)
        };

        let args: Vec<&str> = command.args().iter().map(String::as_str).collect();
        let out = match self.backend.run_raw(&args) {
            Ok(out) => out,
            Err(e) => {
                error!(error = %e, "could not run wrapped command; restoring shelf");
                if let Some(snap) = &snapshot {
                    let restore = self.restore_snapshot(snap, true)?;
                    if restore.is_retained() {
                        warn!(snapshot_id = %snap.id, "background content left shelved");
                    }
                }
                return Err(e.into());
            }
        };

        if out.success() {
            let restore = match &snapshot {
                Some(snap) => self.restore_snapshot(snap, false)?,
                None => RestoreOutcome::NothingShelved,
            };
            info!(label, "wrapped operation completed");
            return Ok(OperationResult::Completed {
                stdout: out.stdout,
                restore,
            });
        }

        if let Some(kind) = self.backend.operation_in_progress()? {
            if !self.backend.unmerged()?.is_empty() {
                return self.needs_resolution(label, command, kind, snapshot.as_ref());
            }
            if kind.is_sequence() && !self.backend.has_staged_changes()? {
                warn!(
                    operation = %kind,
                    reason = %out.summary(),
                    "sequence stopped on a commit without textual conflicts; continuing past it"
                );
                return self.continue_sequence(label, command, &out, snapshot.as_ref());
            }
        }

        let reason = out.summary();
        warn!(label, exit_code = out.exit_code, %reason, "wrapped operation failed; rolling back");
        self.roll_back_operation()?;
        let restore = match &snapshot {
            Some(snap) => self.restore_snapshot(snap, true)?,
            None => RestoreOutcome::NothingShelved,
        };
        Ok(OperationResult::Failed {
            reason,
            exit_code: out.exit_code,
            restore,
        })
    }

    /// Open a session for the conflicts the backend stopped on.
    fn needs_resolution(
        &self,
        label: &str,
        command: &GitCommand,
        kind: OperationKind,
        snapshot: Option<&Snapshot>,
    ) -> Result<OperationResult, CoreError> {
        if command.kind() != Some(kind) {
            debug!(
                command = %command,
                inferred = ?command.kind(),
                actual = %kind,
                "backend state disagrees with the inferred operation; using backend state"
            );
        }
        let snapshot_id = snapshot.map(|s| s.id);
        let session = self.sessions.open(kind, label, snapshot_id)?;
        let conflicted: Vec<String> = session.files.iter().map(|f| f.path.clone()).collect();
        warn!(
            session_id = %session.session_id,
            operation = %kind,
            files = conflicted.len(),
            "operation stopped on conflicts; background content stays shelved"
        );
        Ok(OperationResult::NeedsResolution {
            session_id: session.session_id,
            kind,
            conflicted,
            snapshot_id,
        })
    }

    /// Continue a sequence past commits with nothing to resolve.
    ///
    /// If the sequence cannot go on it is aborted, so a `Failed` result
    /// always leaves `HEAD` where it was before the command.
    fn continue_sequence(
        &self,
        label: &str,
        command: &GitCommand,
        out: &CommandOutput,
        snapshot: Option<&Snapshot>,
    ) -> Result<OperationResult, CoreError> {
        match self.sessions.continue_to_end() {
            Ok(Continued::Finished) => {
                let restore = match snapshot {
                    Some(snap) => self.restore_snapshot(snap, false)?,
                    None => RestoreOutcome::NothingShelved,
                };
                info!(label, "wrapped operation completed after skipping commits");
                Ok(OperationResult::Completed {
                    stdout: out.stdout.clone(),
                    restore,
                })
            }
            Ok(Continued::Conflicted(kind)) => self.needs_resolution(label, command, kind, snapshot),
            Err(e) => {
                warn!(label, error = %e, "sequence cannot continue; rolling back");
                self.roll_back_operation()?;
                let restore = match snapshot {
                    Some(snap) => self.restore_snapshot(snap, true)?,
                    None => RestoreOutcome::NothingShelved,
                };
                Ok(OperationResult::Failed {
                    reason: e.to_string(),
                    exit_code: out.exit_code,
                    restore,
                })
            }
        }
    }

    /// Abort whatever the failed command left in progress.
    fn roll_back_operation(&self) -> Result<(), CoreError> {
        if let Some(kind) = self.backend.operation_in_progress()? {
            self.backend.abort(kind)?;
        }
        Ok(())
    }

    fn shelve(&self, label: &str, entries: &[StatusEntry]) -> Result<Snapshot, CoreError> {
        let mut snapshot = Snapshot::capture(self.backend.root(), label, entries)?;
        // Record first: a shelf must never exist without its snapshot.
        self.snapshots.record(&snapshot)?;
        let shelved = self.backend.shelve(
            &snapshot.shelf_label(),
            &snapshot.path_list(),
            snapshot.has_untracked(),
        );
        match shelved {
            Ok(entry) => {
                snapshot.shelf_commit = Some(entry.commit);
                self.snapshots.record(&snapshot)?;
                Ok(snapshot)
            }
            Err(e) => {
                error!(snapshot_id = %snapshot.id, error = %e, "shelve failed; not running the command");
                let shelf_exists = self
                    .backend
                    .find_shelf(&snapshot.id)
                    .map(|s| s.is_some())
                    .unwrap_or(true);
                if !shelf_exists {
                    self.snapshots.remove(&snapshot.id)?;
                }
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Restore a retained snapshot by id.
    pub fn restore(&self, snapshot_id: &Uuid) -> Result<RestoreOutcome, CoreError> {
        if let Some(active) = self.sessions.store().load_active()? {
            if active.snapshot_id.as_ref() == Some(snapshot_id) {
                return Err(StateError::ConcurrencyViolation {
                    existing: active.session_id.to_string(),
                }
                .into());
            }
        }
        let snapshot = self
            .snapshots
            .get(snapshot_id)?
            .ok_or_else(|| StateError::SnapshotNotFound(snapshot_id.to_string()))?;
        self.restore_snapshot(&snapshot, false)
    }

    /// Drop a snapshot's shelf and forget it. The shelved content is lost.
    pub fn discard(&self, snapshot_id: &Uuid) -> Result<bool, CoreError> {
        let dropped = self.backend.drop_shelf(snapshot_id)?;
        let removed = self.snapshots.remove(snapshot_id)?;
        warn!(snapshot_id = %snapshot_id, dropped, removed, "snapshot discarded");
        Ok(dropped || removed)
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Apply, verify if asked, then drop. Text conflicts retain the shelf.
    pub(crate) fn restore_snapshot(
        &self,
        snapshot: &Snapshot,
        verify: bool,
    ) -> Result<RestoreOutcome, CoreError> {
        match self.unshelve(snapshot, verify) {
            Err(CoreError::Conflict(ConflictError::RestoreConflict { snapshot_id, paths })) => {
                warn!(
                    snapshot_id = %snapshot_id,
                    paths = ?paths,
                    "restoring background content conflicted on text files; resolve them by hand"
                );
                Ok(RestoreOutcome::Retained {
                    snapshot_id,
                    reason: "restoring conflicted on text files; resolve the markers, then discard the snapshot".into(),
                    paths,
                })
            }
            other => other,
        }
    }

    fn unshelve(&self, snapshot: &Snapshot, verify: bool) -> Result<RestoreOutcome, CoreError> {
        let retained = |reason: String, paths: Vec<String>| -> Result<RestoreOutcome, CoreError> {
            warn!(snapshot_id = %snapshot.id, %reason, "snapshot retained");
            Ok(RestoreOutcome::Retained {
                snapshot_id: snapshot.id,
                reason,
                paths,
            })
        };

        let Some(entry) = self.backend.find_shelf(&snapshot.id)? else {
            return retained("no shelf entry carries this snapshot id".into(), snapshot.path_list());
        };

        let out = self.backend.apply_shelf(&entry)?;
        let mut auto_resolved = Vec::new();
        if !out.success() {
            let conflicted = self.backend.unmerged()?;
            if conflicted.is_empty() {
                return retained(format!("shelf did not apply: {}", out.summary()), snapshot.path_list());
            }
            let paths: Vec<String> = conflicted.iter().map(|c| c.path.clone()).collect();
            if conflicted.iter().any(|c| !c.is_binary) {
                return Err(ConflictError::RestoreConflict {
                    snapshot_id: snapshot.id,
                    paths,
                }
                .into());
            }

            let stacked: Vec<String> = self
                .backend
                .list_shelves()?
                .into_iter()
                .filter(|s| s.position < entry.position)
                .filter_map(|s| s.label.map(|l| l.snapshot_id))
                .filter(|id| id != &snapshot.id)
                .map(|id| id.to_string())
                .collect();
            if !stacked.is_empty() {
                return Err(StateError::StackedShelves {
                    snapshot_id: snapshot.id.to_string(),
                    others: stacked,
                }
                .into());
            }

            // Binary paths cannot be merged: keep the shelved version.
            self.backend.checkout_side(ConflictSide::Theirs, &paths)?;
            self.backend.add(&paths)?;
            self.backend.unstage(&paths)?;
            info!(snapshot_id = %snapshot.id, paths = ?paths, "binary restore conflicts resolved with shelved content");
            auto_resolved = paths;
        }

        if verify {
            let diverged = snapshot.diverged_paths()?;
            if !diverged.is_empty() {
                return retained("restored content differs from the snapshot".into(), diverged);
            }
        }

        self.backend.drop_shelf(&snapshot.id)?;
        self.snapshots.remove(&snapshot.id)?;
        info!(snapshot_id = %snapshot.id, "background content restored");
        Ok(RestoreOutcome::Restored {
            snapshot_id: snapshot.id,
            auto_resolved,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
