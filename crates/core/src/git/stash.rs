//! Shelving through `git stash`, addressed by structured labels.
//!
//! Every shelf gitward creates carries `gitward[<snapshot id>]` in its stash
//! message. Entries are located by parsing that id back out of
//! `git stash list`, never by matching free-form text, and the
//! `stash@{n}` position is looked up fresh before each apply or drop since
//! it shifts whenever another entry is pushed or dropped.

use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use super::client::{CommandOutput, GitBackend};
use crate::errors::GitError;

/// Paths named in a shelf message before it switches to "(+N more)".
const LABEL_PATH_PREVIEW: usize = 3;

/// Field separator for `stash list` formatting.
const SEP: char = '\u{1f}';

fn label_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"gitward\[([0-9a-fA-F-]{36})\] (.*)$").ok())
        .as_ref()
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// The structured part of a shelf's stash message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfLabel {
    pub snapshot_id: Uuid,
    pub description: String,
}

impl ShelfLabel {
    /// Label for `operation` shelving `paths`.
    pub fn new(snapshot_id: Uuid, operation: &str, paths: &[String]) -> Self {
        let mut files: Vec<&str> = paths
            .iter()
            .take(LABEL_PATH_PREVIEW)
            .map(String::as_str)
            .collect();
        let more = paths.len().saturating_sub(LABEL_PATH_PREVIEW);
        let extra = (more > 0).then(|| format!("(+{more} more)"));
        if let Some(e) = extra.as_deref() {
            files.push(e);
        }
        Self {
            snapshot_id,
            description: format!("{operation}: {}", files.join(", ")),
        }
    }

    pub fn message(&self) -> String {
        format!("gitward[{}] {}", self.snapshot_id, self.description)
    }

    /// Recover a label from a stash subject such as
    /// `On main: gitward[<id>] push: a.po`.
    pub fn parse(subject: &str) -> Option<Self> {
        let caps = label_regex()?.captures(subject)?;
        let snapshot_id = Uuid::parse_str(caps.get(1)?.as_str()).ok()?;
        Some(Self {
            snapshot_id,
            description: caps.get(2)?.as_str().to_string(),
        })
    }
}

/// One `git stash list` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelfEntry {
    /// `stash@{n}` at the time of listing.
    pub reflog: String,
    pub position: usize,
    pub commit: String,
    pub subject: String,
    pub label: Option<ShelfLabel>,
}

fn parse_stash_list(output: &str) -> Vec<ShelfEntry> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .filter_map(|(position, line)| {
            let mut fields = line.splitn(3, SEP);
            let reflog = fields.next()?.to_string();
            let commit = fields.next()?.to_string();
            let subject = fields.next().unwrap_or("").to_string();
            Some(ShelfEntry {
                label: ShelfLabel::parse(&subject),
                reflog,
                position,
                commit,
                subject,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Shelf operations
// ---------------------------------------------------------------------------

impl GitBackend {
    /// Stash exactly `paths` under `label`. Returns the new entry.
    pub fn shelve(
        &self,
        label: &ShelfLabel,
        paths: &[String],
        include_untracked: bool,
    ) -> Result<ShelfEntry, GitError> {
        let message = label.message();
        let mut args = vec!["stash", "push", "--quiet", "--message", message.as_str()];
        if include_untracked {
            args.push("--include-untracked");
        }
        args.push("--");
        args.extend(paths.iter().map(String::as_str));

        let out = self.run_raw(&args)?;
        if !out.success() {
            return Err(GitError::CommandFailed {
                command: "stash".into(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        let entry = self.find_shelf(&label.snapshot_id)?.ok_or_else(|| {
            GitError::UnexpectedOutput(format!(
                "stash push succeeded but no entry carries {}",
                label.message()
            ))
        })?;
        info!(
            snapshot_id = %label.snapshot_id,
            reflog = %entry.reflog,
            paths = paths.len(),
            "background changes shelved"
        );
        Ok(entry)
    }

    pub fn list_shelves(&self) -> Result<Vec<ShelfEntry>, GitError> {
        let format = format!("--format=%gd{SEP}%H{SEP}%gs");
        let out = self.run(&["stash", "list", &format])?;
        Ok(parse_stash_list(&out))
    }

    pub fn find_shelf(&self, snapshot_id: &Uuid) -> Result<Option<ShelfEntry>, GitError> {
        Ok(self
            .list_shelves()?
            .into_iter()
            .find(|e| e.label.as_ref().is_some_and(|l| &l.snapshot_id == snapshot_id)))
    }

    /// `git stash apply` the shelf; the entry stays in the stash list.
    pub fn apply_shelf(&self, entry: &ShelfEntry) -> Result<CommandOutput, GitError> {
        debug!(reflog = %entry.reflog, "applying shelf");
        self.run_raw(&["stash", "apply", &entry.reflog])
    }

    /// Drop the shelf for `snapshot_id`. Missing shelves are fine.
    pub fn drop_shelf(&self, snapshot_id: &Uuid) -> Result<bool, GitError> {
        let Some(entry) = self.find_shelf(snapshot_id)? else {
            return Ok(false);
        };
        self.run(&["stash", "drop", "--quiet", &entry.reflog])?;
        info!(snapshot_id = %snapshot_id, "shelf dropped");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_roundtrip_through_stash_subject() {
        let id = Uuid::new_v4();
        let label = ShelfLabel::new(id, "push", &["a.po".into(), "b.mo".into()]);
        assert_eq!(label.description, "push: a.po, b.mo");

        let subject = format!("On main: {}", label.message());
        assert_eq!(ShelfLabel::parse(&subject), Some(label));
        assert_eq!(ShelfLabel::parse("On main: WIP something"), None);
        assert_eq!(ShelfLabel::parse("gitward[not-a-uuid] x"), None);
    }

    #[test]
    fn test_label_truncates_paths() {
        let paths: Vec<String> = (0..5).map(|i| format!("f{i}.po")).collect();
        let label = ShelfLabel::new(Uuid::nil(), "rebase", &paths);
        assert_eq!(label.description, "rebase: f0.po, f1.po, f2.po, (+2 more)");
    }

    #[test]
    fn test_parse_stash_list() {
        let a = Uuid::new_v4();
        let output = format!(
            "stash@{{0}}{SEP}abc123{SEP}On main: gitward[{a}] merge: x.mo\n\
             stash@{{1}}{SEP}def456{SEP}WIP on main: 1234 msg\n"
        );
        let entries = parse_stash_list(&output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reflog, "stash@{0}");
        assert_eq!(entries[0].commit, "abc123");
        assert_eq!(entries[0].label.as_ref().unwrap().snapshot_id, a);
        assert_eq!(entries[1].position, 1);
        assert!(entries[1].label.is_none());
    }
}
