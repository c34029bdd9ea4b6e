//! The conflict session state machine.
//!
//! Every entry point loads the session record, checks it against the live
//! backend, applies one transition and writes the record back before
//! returning. A process killed at any point therefore resumes from the last
//! completed transition.

use std::io::ErrorKind;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hunk::{parse_conflicts, reconstruct, resolve};
use super::store::SessionStore;
use super::{ConflictFile, ConflictSession, Disposition, SessionStatus};
use crate::errors::{CoreError, GitError, StateError, ValidationError};
use crate::git::{looks_binary, ConflictSide, GitBackend, OperationKind, UnmergedEntry};
use crate::state::atomic_write;

/// Upper bound on continue/skip rounds while concluding one session.
const MAX_CONCLUDE_STEPS: usize = 1000;

/// How a finalize attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcludeOutcome {
    /// The operation finished; the session is Resolved and its record gone.
    Concluded(ConflictSession),
    /// Continuing stopped on another conflicting commit; the same session
    /// now tracks the new conflicts.
    Reopened(ConflictSession),
}

/// Where [`SessionManager::continue_to_end`] left the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continued {
    Finished,
    /// Stopped again with unmerged paths.
    Conflicted(OperationKind),
}

pub struct SessionManager<'a> {
    backend: &'a GitBackend,
    store: SessionStore,
    diff_context: usize,
}

impl<'a> SessionManager<'a> {
    pub fn new(backend: &'a GitBackend, store: SessionStore, diff_context: usize) -> Self {
        Self {
            backend,
            store,
            diff_context,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Detection
    // -----------------------------------------------------------------------

    /// Read the backend's unmerged paths into conflict files.
    pub fn scan_files(&self) -> Result<Vec<ConflictFile>, CoreError> {
        self.backend
            .unmerged()?
            .iter()
            .map(|entry| self.scan_file(entry))
            .collect()
    }

    fn scan_file(&self, entry: &UnmergedEntry) -> Result<ConflictFile, CoreError> {
        let path = entry.path.as_str();
        if entry.is_binary {
            return Ok(ConflictFile::whole(path, true, entry.has_ours, entry.has_theirs));
        }
        if !entry.has_ours || !entry.has_theirs {
            return Ok(ConflictFile::whole(path, false, entry.has_ours, entry.has_theirs));
        }
        let bytes = match std::fs::read(self.backend.root().join(path)) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(ConflictFile::whole(path, false, entry.has_ours, entry.has_theirs));
            }
            Err(e) => return Err(GitError::IoError(e).into()),
        };
        if looks_binary(&bytes) {
            return Ok(ConflictFile::whole(path, true, true, true));
        }
        let Ok(text) = String::from_utf8(bytes) else {
            return Ok(ConflictFile::whole(path, true, true, true));
        };
        let parsed = parse_conflicts(&text, self.diff_context);
        if parsed.hunks.is_empty() {
            debug!(path, "unmerged path has no conflict markers");
            return Ok(ConflictFile::whole(path, false, true, true));
        }
        Ok(ConflictFile::text(path, parsed))
    }

    /// Create and persist a session for the operation stopped in the backend.
    pub fn open(
        &self,
        kind: OperationKind,
        operation_label: &str,
        snapshot_id: Option<Uuid>,
    ) -> Result<ConflictSession, CoreError> {
        let files = self.scan_files()?;
        let session = ConflictSession::new(
            kind,
            self.backend.target_ref(Some(kind))?,
            self.backend.head_commit()?,
            self.backend.incoming_commit(kind)?,
            operation_label,
            files,
            snapshot_id,
        );
        self.store.create(&session)?;
        Ok(session)
    }

    /// Pick up a conflict the backend is already stopped on.
    ///
    /// Returns the tracked session if one exists, creates a Detected session
    /// if the backend has unmerged paths, and `None` otherwise.
    pub fn detect(&self) -> Result<Option<ConflictSession>, CoreError> {
        let Some(kind) = self.backend.operation_in_progress()? else {
            return Ok(None);
        };
        if let Some(existing) = self.store.load_active()? {
            return Ok(Some(existing));
        }
        if self.backend.unmerged()?.is_empty() {
            return Ok(None);
        }
        info!(operation = %kind, "found a stopped operation with conflicts");
        self.open(kind, &format!("{kind} (detected)"), None).map(Some)
    }

    /// The persisted session, if it is active and the backend agrees.
    ///
    /// Never mutates a live session. A record whose operation has already
    /// finished or been aborted outside gitward is stale and is removed.
    pub fn resume(&self) -> Result<Option<ConflictSession>, CoreError> {
        let Some(session) = self.store.load()? else {
            return Ok(None);
        };
        if !session.status.is_active() {
            debug!(session_id = %session.session_id, status = %session.status, "nothing to resume");
            return Ok(None);
        }
        if self.backend.operation_in_progress()?.is_none() {
            warn!(
                session_id = %session.session_id,
                snapshot_id = ?session.snapshot_id,
                "backend has no operation in progress; dropping stale session record"
            );
            self.store.delete()?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    fn load_for(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        match self.store.load_active()? {
            Some(s) if &s.session_id == session_id => Ok(s),
            _ => Err(StateError::SessionNotFound(session_id.to_string()).into()),
        }
    }

    fn ensure_in_progress(session: &mut ConflictSession, action: &str) -> Result<(), StateError> {
        if session.status != SessionStatus::InProgress {
            session.transition(SessionStatus::InProgress, action)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Detected/Paused → InProgress, cursor on the first unresolved file.
    pub fn begin(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        let mut session = self.load_for(session_id)?;
        Self::ensure_in_progress(&mut session, "begin")?;
        session.refresh_cursor();
        session.touch();
        self.store.save(&session)?;
        Ok(session)
    }

    /// Record one decision. A file whose hunks are all decided is written
    /// and staged immediately.
    pub fn advance(
        &self,
        session_id: &Uuid,
        path: &str,
        hunk_index: usize,
        disposition: Disposition,
    ) -> Result<ConflictFile, CoreError> {
        let mut session = self.load_for(session_id)?;
        Self::ensure_in_progress(&mut session, "advance")?;

        let file = session
            .file_mut(path)
            .ok_or_else(|| ValidationError::UnknownPath(path.to_string()))?;
        if hunk_index >= file.hunks.len() {
            return Err(ValidationError::HunkOutOfRange {
                path: path.to_string(),
                index: hunk_index,
                count: file.hunks.len(),
            }
            .into());
        }
        if file.whole_file {
            if !matches!(
                disposition,
                Disposition::Ours | Disposition::Theirs | Disposition::Skip
            ) {
                return Err(ValidationError::WholeFileDisposition {
                    path: path.to_string(),
                }
                .into());
            }
        } else {
            resolve(&file.hunks[hunk_index], &disposition)?;
        }

        debug!(path, hunk = hunk_index, disposition = disposition.label(), "hunk decided");
        file.resolved_hunks.insert(hunk_index, disposition);
        if file.is_resolved() {
            self.write_and_stage(file)?;
        } else {
            file.staged = false;
        }
        let updated = file.clone();

        session.refresh_cursor();
        session.touch();
        self.store.save(&session)?;
        Ok(updated)
    }

    /// Apply one side to every undecided hunk in the session.
    pub fn resolve_all(
        &self,
        session_id: &Uuid,
        disposition: Disposition,
    ) -> Result<ConflictSession, CoreError> {
        if !matches!(disposition, Disposition::Ours | Disposition::Theirs) {
            return Err(ValidationError::UnknownDisposition(format!(
                "{} (bulk resolution takes ours or theirs)",
                disposition.label()
            ))
            .into());
        }
        let mut session = self.load_for(session_id)?;
        Self::ensure_in_progress(&mut session, "resolve")?;

        for file in session.files.iter_mut() {
            let pending = file.unresolved_hunks();
            if pending.is_empty() {
                continue;
            }
            for index in pending {
                file.resolved_hunks.insert(index, disposition.clone());
            }
            self.write_and_stage(file)?;
        }
        info!(session_id = %session.session_id, side = disposition.label(), "resolved all remaining hunks");

        session.refresh_cursor();
        session.touch();
        self.store.save(&session)?;
        Ok(session)
    }

    /// InProgress → Paused. Pausing a paused session changes nothing.
    pub fn pause(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        let mut session = self.load_for(session_id)?;
        if session.status == SessionStatus::Paused {
            return Ok(session);
        }
        session.transition(SessionStatus::Paused, "pause")?;
        self.store.save(&session)?;
        info!(session_id = %session.session_id, unresolved = session.unresolved_count(), "session paused");
        Ok(session)
    }

    fn write_and_stage(&self, file: &mut ConflictFile) -> Result<(), CoreError> {
        let paths = [file.path.clone()];
        if file.whole_file {
            let side = match file.whole_file_choice() {
                Some(Disposition::Ours) => ConflictSide::Ours,
                Some(Disposition::Theirs) => ConflictSide::Theirs,
                _ => return Ok(()),
            };
            if file.staged {
                // A previous decision already cleared the conflict stages.
                self.backend.recreate_conflict(&paths)?;
            }
            let present = match side {
                ConflictSide::Ours => file.has_ours,
                ConflictSide::Theirs => file.has_theirs,
            };
            if present {
                self.backend.checkout_side(side, &paths)?;
                self.backend.add(&paths)?;
            } else {
                self.backend.remove(&paths)?;
            }
        } else {
            let content = reconstruct(&file.segments, &file.hunks, &file.resolved_hunks)?
                .ok_or_else(|| ValidationError::UnresolvedHunks {
                    count: file.unresolved_hunks().len(),
                    first_path: file.path.clone(),
                })?;
            atomic_write(&self.backend.root().join(&file.path), content.as_bytes())
                .map_err(StateError::from)?;
            self.backend.add(&paths)?;
        }
        file.staged = true;
        info!(path = %file.path, "conflict resolved and staged");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conclusion
    // -----------------------------------------------------------------------

    /// Every hunk decided → run the operation's conclusion step.
    pub fn finalize(&self, session_id: &Uuid) -> Result<ConcludeOutcome, CoreError> {
        let mut session = self.load_for(session_id)?;
        if !session.is_fully_resolved() {
            let first_path = session
                .first_unresolved()
                .map(|i| session.files[i].path.clone())
                .unwrap_or_default();
            return Err(ValidationError::UnresolvedHunks {
                count: session.unresolved_count(),
                first_path,
            }
            .into());
        }
        Self::ensure_in_progress(&mut session, "finalize")?;
        for file in session.files.iter_mut().filter(|f| !f.staged) {
            self.write_and_stage(file)?;
        }
        session.touch();
        self.store.save(&session)?;
        self.conclude(session)
    }

    fn conclude(&self, mut session: ConflictSession) -> Result<ConcludeOutcome, CoreError> {
        match self.continue_to_end()? {
            Continued::Finished => {
                session.transition(SessionStatus::Resolved, "finalize")?;
                self.store.delete()?;
                info!(session_id = %session.session_id, operation = %session.kind, "conflict session resolved");
                Ok(ConcludeOutcome::Concluded(session))
            }
            Continued::Conflicted(kind) => self.reopen(session, kind).map(ConcludeOutcome::Reopened),
        }
    }

    /// Drive the stopped operation forward until it finishes or stops on
    /// new conflicts.
    ///
    /// A sequence commit that stops with nothing staged (a merge commit, or
    /// one emptied by resolution) has nothing textual to resolve and is
    /// skipped.
    pub(crate) fn continue_to_end(&self) -> Result<Continued, CoreError> {
        let mut last = None;
        for _ in 0..MAX_CONCLUDE_STEPS {
            let Some(kind) = self.backend.operation_in_progress()? else {
                return Ok(Continued::Finished);
            };
            last = Some(kind);
            if !self.backend.unmerged()?.is_empty() {
                return Ok(Continued::Conflicted(kind));
            }

            let out = self.backend.conclude(kind)?;
            if out.success() || !self.backend.unmerged()?.is_empty() {
                continue;
            }
            if self.backend.operation_in_progress()?.is_none() {
                continue;
            }
            if kind.is_sequence() && !self.backend.has_staged_changes()? {
                warn!(operation = %kind, reason = %out.summary(), "stopped commit has no textual changes; skipping it");
                self.backend.skip(kind)?;
                continue;
            }
            return Err(GitError::CommandFailed {
                command: format!("{kind} conclusion"),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            }
            .into());
        }
        let operation = last.map(|k| k.to_string()).unwrap_or_else(|| "operation".into());
        Err(GitError::UnexpectedOutput(format!(
            "{operation} did not finish after {MAX_CONCLUDE_STEPS} continue steps"
        ))
        .into())
    }

    fn reopen(
        &self,
        mut session: ConflictSession,
        kind: OperationKind,
    ) -> Result<ConflictSession, CoreError> {
        session.kind = kind;
        session.files = self.scan_files()?;
        session.incoming_ref = self.backend.incoming_commit(kind)?;
        session.base_ref = self.backend.head_commit()?;
        session.cursor = 0;
        session.touch();
        self.store.save(&session)?;
        info!(
            session_id = %session.session_id,
            files = session.files.len(),
            "operation stopped on another conflicting commit"
        );
        Ok(session)
    }

    /// Abort the backend operation and discard the session.
    ///
    /// If the backend refuses to abort, the error is returned and the record
    /// is left in place.
    pub fn abort(&self, session_id: &Uuid) -> Result<ConflictSession, CoreError> {
        let mut session = self.load_for(session_id)?;
        if let Some(kind) = self.backend.operation_in_progress()? {
            self.backend.abort(kind)?;
        }
        session.transition(SessionStatus::Aborted, "abort")?;
        self.store.delete()?;
        info!(session_id = %session.session_id, "conflict session aborted");
        Ok(session)
    }
}
