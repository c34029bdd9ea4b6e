//! Durable storage for the one conflict session a repository may have.
//!
//! The record is re-read on every operation and rewritten on every
//! transition, so nothing about a session lives only in process memory.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::ConflictSession;
use crate::errors::StateError;
use crate::state::{read_record, remove_record, write_record, StatePaths};

#[derive(Debug, Clone)]
pub struct SessionStore {
    file: PathBuf,
}

impl SessionStore {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            file: paths.session_file(),
        }
    }

    pub fn location(&self) -> &std::path::Path {
        &self.file
    }

    /// The persisted session, if any.
    ///
    /// An unreadable record surfaces as [`StateError::SessionCorrupted`].
    pub fn load(&self) -> Result<Option<ConflictSession>, StateError> {
        read_record(&self.file).map_err(|e| match e {
            StateError::Corrupted { path, detail } => StateError::SessionCorrupted { path, detail },
            other => other,
        })
    }

    /// The persisted session if it is still active.
    pub fn load_active(&self) -> Result<Option<ConflictSession>, StateError> {
        Ok(self.load()?.filter(|s| s.status.is_active()))
    }

    /// Persist a brand-new session.
    ///
    /// Fails with [`StateError::ConcurrencyViolation`] if another active
    /// session is on record. An inactive leftover record is replaced.
    pub fn create(&self, session: &ConflictSession) -> Result<(), StateError> {
        if let Some(existing) = self.load()? {
            if existing.status.is_active() && existing.session_id != session.session_id {
                return Err(StateError::ConcurrencyViolation {
                    existing: existing.session_id.to_string(),
                });
            }
        }
        self.save(session)?;
        info!(
            session_id = %session.session_id,
            kind = %session.kind,
            files = session.files.len(),
            "conflict session created"
        );
        Ok(())
    }

    /// Rewrite the record for an existing session.
    pub fn save(&self, session: &ConflictSession) -> Result<(), StateError> {
        write_record(&self.file, session)?;
        debug!(session_id = %session.session_id, status = %session.status, cursor = session.cursor, "session saved");
        Ok(())
    }

    /// Remove the record, e.g. after Resolved or Aborted.
    pub fn delete(&self) -> Result<(), StateError> {
        remove_record(&self.file)
    }

    /// Remove the record if it can no longer be read.
    ///
    /// Returns `false`, leaving the file alone, when the record is readable
    /// or absent.
    pub fn discard_corrupted(&self) -> Result<bool, StateError> {
        match self.load() {
            Err(StateError::SessionCorrupted { detail, .. }) => {
                warn!(path = %self.file.display(), %detail, "discarding unreadable session record");
                remove_record(&self.file)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
