//! The gitward engine: one repository, one configuration, every operation.
//!
//! The engine owns no session or snapshot state in memory. Each call builds
//! the stores over the repository's state directory and reads what it needs,
//! so two engines opened on the same repository (or one engine opened after
//! a crash) see exactly the same state.

use std::path::Path;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::classifier::{ChangeClass, Classifier};
use crate::config::GitwardConfig;
use crate::conflict::{
    ConcludeOutcome, ConflictFile, ConflictSession, Disposition, SessionManager, SessionStore,
};
use crate::errors::{CoreError, GitError};
use crate::executor::{ExecutionPlan, Executor, OperationResult, RestoreOutcome};
use crate::git::{ChangeKind, GitBackend, GitCommand, StatusEntry};
use crate::rename::{RenameCandidate, RenameMatcher, RenamePair};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::state::StatePaths;

/// A working-tree change with its classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedEntry {
    pub path: String,
    pub kind: ChangeKind,
    pub class: ChangeClass,
    /// Pattern of the rule that matched, if any.
    pub rule: Option<String>,
}

/// How [`Engine::finalize`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// The operation finished and shelved Background content was restored.
    Concluded {
        session: ConflictSession,
        restore: RestoreOutcome,
    },
    /// The operation stopped again; keep resolving the same session.
    Reopened(ConflictSession),
}

/// What [`Engine::abort`] left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortOutcome {
    pub session: ConflictSession,
    pub restore: RestoreOutcome,
}

pub struct Engine {
    backend: GitBackend,
    config: GitwardConfig,
    classifier: Classifier,
    paths: StatePaths,
}

impl Engine {
    /// Open the repository containing `path` with state in the configured
    /// (or platform default) state directory.
    pub fn open<P: AsRef<Path>>(path: P, config: GitwardConfig) -> Result<Self, CoreError> {
        let backend = GitBackend::open(path, &config.engine.git_binary)?;
        let paths = StatePaths::for_repo(config.engine.state_dir.as_deref(), backend.root())?;
        Ok(Self::assemble(backend, config, paths))
    }

    /// Open with an explicit state directory.
    pub fn with_state<P: AsRef<Path>>(
        path: P,
        config: GitwardConfig,
        paths: StatePaths,
    ) -> Result<Self, CoreError> {
        let backend = GitBackend::open(path, &config.engine.git_binary)?;
        Ok(Self::assemble(backend, config, paths))
    }

    fn assemble(backend: GitBackend, config: GitwardConfig, paths: StatePaths) -> Self {
        let classifier = config.classifier_for(backend.root());
        info!(
            root = %backend.root().display(),
            state = %paths.dir().display(),
            rules = classifier.rules().len(),
            "engine ready"
        );
        Self {
            backend,
            config,
            classifier,
            paths,
        }
    }

    pub fn backend(&self) -> &GitBackend {
        &self.backend
    }

    pub fn config(&self) -> &GitwardConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn state_paths(&self) -> &StatePaths {
        &self.paths
    }

    fn sessions(&self) -> SessionManager<'_> {
        SessionManager::new(
            &self.backend,
            SessionStore::new(&self.paths),
            self.config.engine.diff_context,
        )
    }

    fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.paths)
    }

    fn executor(&self) -> Executor<'_> {
        Executor::new(&self.backend, self.snapshot_store(), self.sessions())
    }

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    pub fn classify(&self, rel_path: &str) -> ChangeClass {
        self.classifier.classify(rel_path)
    }

    /// Every working-tree change with its class.
    pub fn status(&self) -> Result<Vec<ClassifiedEntry>, CoreError> {
        Ok(self
            .backend
            .status()?
            .into_iter()
            .map(|entry| {
                let rule = self.classifier.classify_with_rule(&entry.path);
                ClassifiedEntry {
                    class: rule
                        .map(|r| r.class)
                        .unwrap_or(ChangeClass::Foreground),
                    rule: rule.map(|r| r.pattern.clone()),
                    path: entry.path,
                    kind: entry.kind,
                }
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Wrapped operations
    // -----------------------------------------------------------------------

    pub fn plan(&self, label: &str, command: &GitCommand) -> Result<ExecutionPlan, CoreError> {
        self.executor().plan(label, command, &self.classifier)
    }

    #[instrument(skip(self), fields(command = %command))]
    pub fn execute(&self, label: &str, command: &GitCommand) -> Result<OperationResult, CoreError> {
        self.executor().execute(label, command, &self.classifier)
    }

    // -----------------------------------------------------------------------
    // Conflict sessions
    // -----------------------------------------------------------------------

    /// The session to continue with, if any.
    ///
    /// A persisted active session is returned unchanged. Without one, a
    /// conflict the backend is already stopped on is picked up as a new
    /// Detected session.
    pub fn resume_session(&self) -> Result<Option<ConflictSession>, CoreError> {
        let sessions = self.sessions();
        if let Some(session) = sessions.resume()? {
            return Ok(Some(session));
        }
        sessions.detect()
    }

    /// The recorded active session, read as-is. Nothing is detected or
    /// cleaned up.
    pub fn session_record(&self) -> Result<Option<ConflictSession>, CoreError> {
        Ok(SessionStore::new(&self.paths).load_active()?)
    }

    /// Drop a session record that no longer parses, so operations can run
    /// again. Returns `false` if the record was readable or absent.
    ///
    /// Any operation still stopped in the backend is picked up again by
    /// [`Engine::resume_session`]; a snapshot the record referenced stays in
    /// the snapshot index.
    pub fn discard_corrupted_session(&self) -> Result<bool, CoreError> {
        let discarded = SessionStore::new(&self.paths).discard_corrupted()?;
        if discarded {
            warn!(state = %self.paths.dir().display(), "unreadable conflict session record discarded");
        }
        Ok(discarded)
    }

    pub fn begin(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        self.sessions().begin(session_id)
    }

    pub fn advance(
        &self,
        session_id: &Uuid,
        path: &str,
        hunk_index: usize,
        disposition: Disposition,
    ) -> Result<ConflictFile, CoreError> {
        self.sessions()
            .advance(session_id, path, hunk_index, disposition)
    }

    pub fn resolve_all(
        &self,
        session_id: &Uuid,
        disposition: Disposition,
    ) -> Result<ConflictSession, CoreError> {
        self.sessions().resolve_all(session_id, disposition)
    }

    pub fn pause(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        self.sessions().pause(session_id)
    }

    /// Conclude the operation, then bring shelved Background content back.
    #[instrument(skip(self))]
    pub fn finalize(&self, session_id: &Uuid) -> Result<FinalizeOutcome, CoreError> {
        match self.sessions().finalize(session_id)? {
            ConcludeOutcome::Reopened(session) => Ok(FinalizeOutcome::Reopened(session)),
            ConcludeOutcome::Concluded(session) => {
                let restore = self.restore_for(&session, false)?;
                Ok(FinalizeOutcome::Concluded { session, restore })
            }
        }
    }

    /// Abort the operation, then restore and verify shelved content.
    #[instrument(skip(self))]
    pub fn abort(&self, session_id: &Uuid) -> Result<AbortOutcome, CoreError> {
        let session = self.sessions().abort(session_id)?;
        let restore = self.restore_for(&session, true)?;
        Ok(AbortOutcome { session, restore })
    }

    fn restore_for(
        &self,
        session: &ConflictSession,
        verify: bool,
    ) -> Result<RestoreOutcome, CoreError> {
        let Some(snapshot_id) = session.snapshot_id else {
            return Ok(RestoreOutcome::NothingShelved);
        };
        let executor = self.executor();
        match executor.snapshots().get(&snapshot_id)? {
            Some(snapshot) => executor.restore_snapshot(&snapshot, verify),
            None => {
                warn!(%snapshot_id, session_id = %session.session_id, "session referenced a snapshot that is no longer recorded");
                Ok(RestoreOutcome::Retained {
                    snapshot_id,
                    reason: "snapshot record is missing".into(),
                    paths: Vec::new(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn snapshots(&self) -> Result<Vec<Snapshot>, CoreError> {
        Ok(self.snapshot_store().list()?)
    }

    pub fn restore_snapshot(&self, snapshot_id: &Uuid) -> Result<RestoreOutcome, CoreError> {
        self.executor().restore(snapshot_id)
    }

    pub fn discard_snapshot(&self, snapshot_id: &Uuid) -> Result<bool, CoreError> {
        self.executor().discard(snapshot_id)
    }

    // -----------------------------------------------------------------------
    // Renames
    // -----------------------------------------------------------------------

    pub fn match_renames(
        &self,
        deleted: &[RenameCandidate],
        added: &[RenameCandidate],
    ) -> Vec<RenamePair> {
        RenameMatcher::new(&self.classifier, self.config.engine.similarity_threshold)
            .match_renames(deleted, added)
    }

    /// Pair deleted tracked files with new files in the working tree.
    pub fn detect_renames(&self) -> Result<Vec<RenamePair>, CoreError> {
        let status = self.backend.status()?;
        let mut deleted = Vec::new();
        let mut added = Vec::new();
        for StatusEntry { path, kind } in status {
            match kind {
                ChangeKind::Deleted => {
                    let bytes = self.backend.head_content(&path)?;
                    deleted.push(RenameCandidate::from_bytes(path, bytes));
                }
                ChangeKind::Untracked | ChangeKind::Added => {
                    let bytes = match std::fs::read(self.backend.root().join(&path)) {
                        Ok(b) => Some(b),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(GitError::IoError(e).into()),
                    };
                    added.push(RenameCandidate::from_bytes(path, bytes));
                }
                _ => {}
            }
        }
        Ok(self.match_renames(&deleted, &added))
    }

    /// Stage both sides of each pair so git records them as renames.
    pub fn stage_renames(&self, pairs: &[RenamePair]) -> Result<(), CoreError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = pairs
            .iter()
            .flat_map(|p| [p.deleted.clone(), p.added.clone()])
            .collect();
        self.backend.add_all(&paths)?;
        info!(pairs = pairs.len(), "renames staged");
        Ok(())
    }
}
