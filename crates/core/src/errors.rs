//! Error types for the gitward core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type. [`ConflictError`] is a control-flow signal rather than a
//! failure: it tells the caller that resolution must happen before the
//! operation can continue.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// `true` for errors the boundary should re-prompt on instead of bailing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::State(StateError::ConcurrencyViolation { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Backend (git) errors
// ---------------------------------------------------------------------------

/// Errors from the git backend: CLI invocations and `git2` queries.
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A `git` command exited with a non-zero status for a non-conflict reason.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Output from git did not have the expected shape.
    #[error("unexpected git output: {0}")]
    UnexpectedOutput(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Malformed input from the operator. Recoverable by re-prompting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("manual resolution text must not be empty")]
    EmptyManualResolution,

    #[error("manual resolution still contains a conflict marker on line {line}")]
    LeftoverConflictMarker { line: usize },

    #[error("unknown disposition '{0}' (expected ours, theirs, both, manual or skip)")]
    UnknownDisposition(String),

    #[error("'{path}' has no hunk {index} (it has {count})")]
    HunkOutOfRange {
        path: String,
        index: usize,
        count: usize,
    },

    #[error("'{0}' is not part of this conflict session")]
    UnknownPath(String),

    #[error("'{path}' is resolved as a whole file; only ours, theirs or skip apply")]
    WholeFileDisposition { path: String },

    #[error("{count} hunk(s) are still unresolved, first in '{first_path}'")]
    UnresolvedHunks { count: usize, first_path: String },

    #[error("command must not be empty")]
    EmptyCommand,
}

// ---------------------------------------------------------------------------
// Persisted state errors
// ---------------------------------------------------------------------------

/// Errors around the persisted session record and snapshot index.
#[derive(Debug, Error)]
pub enum StateError {
    /// A persisted record is unreadable or fails its integrity check.
    #[error("state record at '{}' is corrupted: {detail}", path.display())]
    Corrupted { path: PathBuf, detail: String },

    /// The conflict session record is unreadable. Only that record is
    /// affected; the live repository is untouched.
    #[error(
        "conflict session record at '{}' is unreadable: {detail}; drop it with `gitward abort --discard`",
        path.display()
    )]
    SessionCorrupted { path: PathBuf, detail: String },

    /// A second session was attempted while one is still active.
    #[error("a conflict session is already active for this repository ({existing})")]
    ConcurrencyViolation { existing: String },

    #[error("conflict session '{0}' not found")]
    SessionNotFound(String),

    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("cannot {action} a session in state {status}")]
    InvalidTransition { action: String, status: String },

    /// A binary conflict surfaced while other gitward shelves are stacked on
    /// top of the one being restored.
    #[error(
        "binary restore conflict for snapshot {snapshot_id} while other shelves are stacked above it ({}); refusing to auto-resolve",
        others.join(", ")
    )]
    StackedShelves {
        snapshot_id: String,
        others: Vec<String>,
    },

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conflict signals
// ---------------------------------------------------------------------------

/// Conflicts that need the operator. Never rolled back.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Restoring shelved content conflicted on text files.
    #[error(
        "restoring snapshot {snapshot_id} conflicted on text file(s): {}; the shelf is retained",
        paths.join(", ")
    )]
    RestoreConflict {
        snapshot_id: Uuid,
        paths: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config field has an invalid value.
    #[error("invalid config value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Serialization failed while saving.
    #[error("configuration serialize error: {0}")]
    SerializeError(String),

    /// No platform directory could be determined.
    #[error("could not determine a {0} directory for this platform")]
    NoPlatformDir(&'static str),

    /// I/O error reading the config file.
    #[error("config I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = GitError::CommandFailed {
            command: "push".into(),
            exit_code: 128,
            stderr: "could not read from remote".into(),
        };
        assert_eq!(
            err.to_string(),
            "git push failed (exit 128): could not read from remote"
        );

        let err = StateError::Corrupted {
            path: PathBuf::from("/state/session.json"),
            detail: "checksum mismatch".into(),
        };
        assert!(err.to_string().contains("/state/session.json"));

        let err = StateError::SessionCorrupted {
            path: PathBuf::from("/state/session.json"),
            detail: "EOF while parsing".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/state/session.json"));
        assert!(msg.contains("abort --discard"));

        let err = StateError::StackedShelves {
            snapshot_id: "a".into(),
            others: vec!["b".into(), "c".into()],
        };
        assert!(err.to_string().contains("b, c"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = ValidationError::EmptyManualResolution.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert!(core_err.is_retryable());

        let core_err: CoreError = StateError::ConcurrencyViolation {
            existing: "abc".into(),
        }
        .into();
        assert!(core_err.is_retryable());

        let core_err: CoreError = StateError::SessionNotFound("x".into()).into();
        assert!(!core_err.is_retryable());

        let core_err: CoreError = GitError::BinaryNotFound("git".into()).into();
        assert!(matches!(core_err, CoreError::Git(_)));
    }
}
