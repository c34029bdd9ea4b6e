//! Conflict sessions: the durable record of a stopped merge, rebase or
//! cherry-pick and the operator's progress through it.
//!
//! - [`hunk`] parses conflict markers and applies one decision to one hunk.
//! - [`store`] persists the single active session per repository.
//! - [`manager`] drives the session state machine against the backend.
//!
//! ```text
//! Detected ──begin──▶ InProgress ──finalize──▶ Resolved
//!                      │      ▲
//!                 pause│      │begin/advance
//!                      ▼      │
//!                      Paused ─┘
//! (any active state) ──abort──▶ Aborted
//! ```

pub mod hunk;
pub mod manager;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{StateError, ValidationError};
use crate::git::OperationKind;

pub use hunk::{parse_conflicts, reconstruct, resolve, Hunk, ParsedConflicts};
pub use manager::{ConcludeOutcome, SessionManager};
pub use store::SessionStore;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a conflict session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Found, nothing resolved yet.
    Detected,
    InProgress,
    /// Operator stepped away mid-resolution.
    Paused,
    Resolved,
    Aborted,
}

impl SessionStatus {
    /// Detected, InProgress and Paused sessions block new ones.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Detected | Self::InProgress | Self::Paused)
    }

    fn can_become(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Detected, InProgress) | (Paused, InProgress) => true,
            (InProgress, Paused) | (InProgress, Resolved) => true,
            (s, Aborted) => s.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detected => write!(f, "detected"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Resolved => write!(f, "resolved"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// The decision for one hunk, or for a whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum Disposition {
    Ours,
    Theirs,
    /// Ours followed by theirs.
    Both,
    Manual(String),
    /// Leave unresolved for now.
    Skip,
}

impl Disposition {
    pub fn is_resolution(&self) -> bool {
        !matches!(self, Self::Skip)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
            Self::Both => "both",
            Self::Manual(_) => "manual",
            Self::Skip => "skip",
        }
    }
}

impl FromStr for Disposition {
    type Err = ValidationError;

    /// Parses the text-free dispositions; `Manual` carries operator text and
    /// is built directly.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ours" | "o" => Ok(Self::Ours),
            "theirs" | "t" => Ok(Self::Theirs),
            "both" | "b" => Ok(Self::Both),
            "skip" | "s" => Ok(Self::Skip),
            other => Err(ValidationError::UnknownDisposition(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ConflictFile
// ---------------------------------------------------------------------------

/// One conflicting path and the decisions made for it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFile {
    pub path: String,
    pub hunks: Vec<Hunk>,
    /// Text between hunks: `segments[i]` precedes hunk `i`, the last one
    /// trails the final hunk. Empty for whole-file conflicts.
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub resolved_hunks: BTreeMap<usize, Disposition>,
    pub is_binary: bool,
    /// Resolved by a single ours/theirs decision on synthetic hunk 0.
    pub whole_file: bool,
    #[serde(default = "default_true")]
    pub has_ours: bool,
    #[serde(default = "default_true")]
    pub has_theirs: bool,
    /// Resolved content written and staged.
    #[serde(default)]
    pub staged: bool,
}

fn default_true() -> bool {
    true
}

impl ConflictFile {
    /// A text file with parsed marker hunks.
    pub fn text(path: &str, parsed: ParsedConflicts) -> Self {
        Self {
            path: path.to_string(),
            hunks: parsed.hunks,
            segments: parsed.segments,
            resolved_hunks: BTreeMap::new(),
            is_binary: false,
            whole_file: false,
            has_ours: true,
            has_theirs: true,
            staged: false,
        }
    }

    /// A file resolved as a unit: binary content, or a modify/delete
    /// conflict without markers.
    pub fn whole(path: &str, is_binary: bool, has_ours: bool, has_theirs: bool) -> Self {
        Self {
            path: path.to_string(),
            hunks: vec![Hunk::whole_file()],
            segments: Vec::new(),
            resolved_hunks: BTreeMap::new(),
            is_binary,
            whole_file: true,
            has_ours,
            has_theirs,
            staged: false,
        }
    }

    /// Every hunk carries a non-Skip disposition.
    pub fn is_resolved(&self) -> bool {
        self.hunks.iter().all(|h| {
            self.resolved_hunks
                .get(&h.index)
                .is_some_and(Disposition::is_resolution)
        })
    }

    pub fn unresolved_hunks(&self) -> Vec<usize> {
        self.hunks
            .iter()
            .map(|h| h.index)
            .filter(|i| {
                !self
                    .resolved_hunks
                    .get(i)
                    .is_some_and(Disposition::is_resolution)
            })
            .collect()
    }

    /// The whole-file decision, once made.
    pub fn whole_file_choice(&self) -> Option<&Disposition> {
        if !self.whole_file {
            return None;
        }
        self.resolved_hunks.get(&0).filter(|d| d.is_resolution())
    }
}

// ---------------------------------------------------------------------------
// ConflictSession
// ---------------------------------------------------------------------------

/// The persisted record of one in-progress conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSession {
    pub session_id: Uuid,
    pub kind: OperationKind,
    /// Branch being changed.
    pub target_ref: String,
    /// `HEAD` commit when the conflict was detected.
    pub base_ref: Option<String>,
    /// Commit being brought in, when git records one.
    #[serde(default)]
    pub incoming_ref: Option<String>,
    pub operation_label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub files: Vec<ConflictFile>,
    /// Index into `files` of the next file to work on.
    pub cursor: usize,
    /// Background shelf waiting for this session to finish.
    #[serde(default)]
    pub snapshot_id: Option<Uuid>,
}

impl ConflictSession {
    pub fn new(
        kind: OperationKind,
        target_ref: String,
        base_ref: Option<String>,
        incoming_ref: Option<String>,
        operation_label: &str,
        files: Vec<ConflictFile>,
        snapshot_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            kind,
            target_ref,
            base_ref,
            incoming_ref,
            operation_label: operation_label.to_string(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Detected,
            files,
            cursor: 0,
            snapshot_id,
        }
    }

    pub fn file(&self, path: &str) -> Option<&ConflictFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut ConflictFile> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    /// Index of the first file with an unresolved hunk.
    pub fn first_unresolved(&self) -> Option<usize> {
        self.files.iter().position(|f| !f.is_resolved())
    }

    pub fn unresolved_count(&self) -> usize {
        self.files.iter().map(|f| f.unresolved_hunks().len()).sum()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.files.iter().all(ConflictFile::is_resolved)
    }

    /// Point the cursor at the first unresolved file, or past the end.
    pub fn refresh_cursor(&mut self) {
        self.cursor = self.first_unresolved().unwrap_or(self.files.len());
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: SessionStatus, action: &str) -> Result<(), StateError> {
        if !self.status.can_become(next) {
            return Err(StateError::InvalidTransition {
                action: action.to_string(),
                status: self.status.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn two_hunk_file() -> ConflictFile {
        let text = "a\n<<<<<<< HEAD\nx\n=======\ny\n>>>>>>> b\nm\n<<<<<<< HEAD\np\n=======\nq\n>>>>>>> b\n";
        ConflictFile::text("f.txt", parse_conflicts(text, 3))
    }

    #[test]
    fn test_transitions() {
        let mut s = ConflictSession::new(
            OperationKind::Rebase,
            "main".into(),
            None,
            None,
            "rebase",
            vec![],
            None,
        );
        assert!(s.status.is_active());
        assert!(s.transition(SessionStatus::Paused, "pause").is_err());
        s.transition(SessionStatus::InProgress, "begin").unwrap();
        s.transition(SessionStatus::Paused, "pause").unwrap();
        s.transition(SessionStatus::InProgress, "resume").unwrap();
        s.transition(SessionStatus::Resolved, "finalize").unwrap();
        assert!(!s.status.is_active());
        let err = s.transition(SessionStatus::Aborted, "abort").unwrap_err();
        assert!(err.to_string().contains("resolved"));
    }

    #[test]
    fn test_skip_does_not_resolve() {
        let mut f = two_hunk_file();
        assert_eq!(f.hunks.len(), 2);
        f.resolved_hunks.insert(0, Disposition::Ours);
        f.resolved_hunks.insert(1, Disposition::Skip);
        assert!(!f.is_resolved());
        assert_eq!(f.unresolved_hunks(), vec![1]);
        f.resolved_hunks.insert(1, Disposition::Manual("z\n".into()));
        assert!(f.is_resolved());
    }

    #[test]
    fn test_whole_file_choice() {
        let mut f = ConflictFile::whole("img.png", true, true, true);
        assert_eq!(f.hunks.len(), 1);
        assert!(f.whole_file_choice().is_none());
        f.resolved_hunks.insert(0, Disposition::Theirs);
        assert_eq!(f.whole_file_choice(), Some(&Disposition::Theirs));
    }

    #[test]
    fn test_disposition_parse_and_serde() {
        assert_eq!("Ours".parse::<Disposition>().unwrap(), Disposition::Ours);
        assert_eq!("t".parse::<Disposition>().unwrap(), Disposition::Theirs);
        assert!(matches!(
            "maybe".parse::<Disposition>(),
            Err(ValidationError::UnknownDisposition(_))
        ));

        let json = serde_json::to_string(&Disposition::Manual("x\n".into())).unwrap();
        assert_eq!(json, r#"{"type":"manual","text":"x\n"}"#);
        let back: Disposition = serde_json::from_str(r#"{"type":"skip"}"#).unwrap();
        assert_eq!(back, Disposition::Skip);
    }

    #[test]
    fn test_session_cursor() {
        let mut s = ConflictSession::new(
            OperationKind::Merge,
            "main".into(),
            None,
            None,
            "merge",
            vec![two_hunk_file(), ConflictFile::whole("b.bin", true, true, true)],
            None,
        );
        assert_eq!(s.unresolved_count(), 3);
        s.files[0].resolved_hunks.insert(0, Disposition::Ours);
        s.files[0].resolved_hunks.insert(1, Disposition::Theirs);
        s.refresh_cursor();
        assert_eq!(s.cursor, 1);
        s.files[1].resolved_hunks.insert(0, Disposition::Ours);
        s.refresh_cursor();
        assert_eq!(s.cursor, 2);
        assert!(s.is_fully_resolved());
    }
}
