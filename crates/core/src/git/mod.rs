//! Git backend: the `git` CLI for mutations, `git2` for read-only queries.

pub mod client;
pub mod stash;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

pub use client::{
    looks_binary, ChangeKind, CommandOutput, ConflictSide, GitBackend, StatusEntry, UnmergedEntry,
};
pub use stash::{ShelfEntry, ShelfLabel};

// ---------------------------------------------------------------------------
// Operation kinds
// ---------------------------------------------------------------------------

/// A history-rewriting operation that can stop on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Merge,
    Rebase,
    CherryPick,
}

impl OperationKind {
    /// The git subcommand that drives this operation.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::CherryPick => "cherry-pick",
        }
    }

    /// Pseudo-ref naming the commit being brought in.
    pub fn incoming_ref(&self) -> &'static str {
        match self {
            Self::Merge => "MERGE_HEAD",
            Self::Rebase => "REBASE_HEAD",
            Self::CherryPick => "CHERRY_PICK_HEAD",
        }
    }

    /// Rebase and cherry-pick replay a sequence of commits.
    pub fn is_sequence(&self) -> bool {
        matches!(self, Self::Rebase | Self::CherryPick)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subcommand())
    }
}

// ---------------------------------------------------------------------------
// Wrapped commands
// ---------------------------------------------------------------------------

/// A mutating git command to run under the executor, without the leading
/// `git`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommand {
    args: Vec<String>,
}

impl GitCommand {
    pub fn new<I, S>(args: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.is_empty() || args[0].trim().is_empty() {
            return Err(ValidationError::EmptyCommand);
        }
        Ok(Self { args })
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn subcommand(&self) -> &str {
        &self.args[0]
    }

    /// The conflict-capable operation this command starts, if any.
    ///
    /// `pull` is a merge unless `--rebase` (or `-r`) is passed; a
    /// `pull.rebase` setting is picked up later from the backend's own
    /// in-progress state.
    pub fn kind(&self) -> Option<OperationKind> {
        match self.subcommand() {
            "merge" => Some(OperationKind::Merge),
            "rebase" => Some(OperationKind::Rebase),
            "cherry-pick" => Some(OperationKind::CherryPick),
            "pull" => {
                let rebase = self.args[1..].iter().any(|a| {
                    a == "-r" || a == "--rebase" || (a.starts_with("--rebase=") && a != "--rebase=false")
                });
                Some(if rebase {
                    OperationKind::Rebase
                } else {
                    OperationKind::Merge
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git {}", self.args.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
