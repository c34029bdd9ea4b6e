//! The git backend.
//!
//! Every mutation goes through the `git` binary so hooks, config and the
//! sequencer behave exactly as they do for the operator. Read-only queries
//! (status, unmerged stages, repository state, blob contents) use `git2`
//! against a freshly opened repository so they always see what the last CLI
//! invocation left on disk.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use git2::{Repository, RepositoryState, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::OperationKind;
use crate::errors::GitError;

/// Bytes inspected by [`looks_binary`], mirroring git's own heuristic.
const BINARY_PROBE_LEN: usize = 8000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of one `git` invocation that is allowed to fail.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty line of stderr, falling back to stdout.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no output")
            .to_string()
    }
}

/// How a path differs from `HEAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modified,
    Added,
    Deleted,
    Untracked,
    TypeChange,
    Conflicted,
}

/// One entry of the working-tree status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub path: String,
    pub kind: ChangeKind,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.kind == ChangeKind::Untracked
    }
}

/// An index path with conflict stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmergedEntry {
    pub path: String,
    pub has_base: bool,
    pub has_ours: bool,
    pub has_theirs: bool,
    pub is_binary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Ours,
    Theirs,
}

impl ConflictSide {
    fn flag(&self) -> &'static str {
        match self {
            Self::Ours => "--ours",
            Self::Theirs => "--theirs",
        }
    }
}

/// git's binary heuristic: a NUL byte near the start.
pub fn looks_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_PROBE_LEN).any(|b| *b == 0)
}

// ---------------------------------------------------------------------------
// GitBackend
// ---------------------------------------------------------------------------

/// Handle on one repository's working tree.
#[derive(Debug, Clone)]
pub struct GitBackend {
    root: PathBuf,
    binary: String,
}

impl GitBackend {
    /// Open the repository containing `path`, using `binary` for CLI calls.
    pub fn open<P: AsRef<Path>>(path: P, binary: &str) -> Result<Self, GitError> {
        let path = path.as_ref();
        let repo = Repository::discover(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        let root = repo
            .workdir()
            .ok_or_else(|| GitError::RepositoryNotFound(format!("{} (bare)", path.display())))?
            .to_path_buf();
        let root = root.canonicalize().unwrap_or(root);
        info!(root = %root.display(), "opened git repository");
        Ok(Self {
            root,
            binary: binary.to_string(),
        })
    }

    /// Working-tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo(&self) -> Result<Repository, GitError> {
        Ok(Repository::open(&self.root)?)
    }

    // -- CLI ---------------------------------------------------------------

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&self.root)
            .args(args)
            // Never block on an editor or a credential prompt.
            .env("GIT_EDITOR", "true")
            .env("GIT_SEQUENCE_EDITOR", "true")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn output(&self, mut cmd: Command, args: &[&str]) -> Result<CommandOutput, GitError> {
        debug!(cmd = %format!("git {}", args.join(" ")), "running git command");
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound(self.binary.clone())
            } else {
                GitError::IoError(e)
            }
        })?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run `git <args>` and return its output whatever the exit status.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn run_raw(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let out = self.output(self.command(args), args)?;
        if !out.success() {
            debug!(exit_code = out.exit_code, stderr = %out.stderr.trim(), "git command exited non-zero");
        }
        Ok(out)
    }

    /// Run `git <args>`, failing on a non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let out = self.run_raw(args)?;
        check(args, out)
    }

    /// Run `git <args> -- <paths>` with literal pathspecs.
    fn run_paths(&self, args: &[&str], paths: &[String]) -> Result<String, GitError> {
        let mut full: Vec<&str> = args.to_vec();
        full.push("--");
        full.extend(paths.iter().map(String::as_str));
        let mut cmd = self.command(&full);
        cmd.env("GIT_LITERAL_PATHSPECS", "1");
        let out = self.output(cmd, &full)?;
        check(args, out)
    }

    // -- Queries -----------------------------------------------------------

    /// Working-tree status, untracked files included, ignored files excluded.
    pub fn status(&self) -> Result<Vec<StatusEntry>, GitError> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false)
            .renames_head_to_index(false);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut entries = Vec::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                warn!("skipping status entry with non-UTF-8 path");
                continue;
            };
            let s = entry.status();
            let kind = if s.contains(Status::CONFLICTED) {
                ChangeKind::Conflicted
            } else if s.intersects(Status::WT_DELETED | Status::INDEX_DELETED) {
                ChangeKind::Deleted
            } else if s.contains(Status::WT_NEW) {
                ChangeKind::Untracked
            } else if s.contains(Status::INDEX_NEW) {
                ChangeKind::Added
            } else if s.intersects(Status::WT_TYPECHANGE | Status::INDEX_TYPECHANGE) {
                ChangeKind::TypeChange
            } else if s.intersects(
                Status::WT_MODIFIED | Status::INDEX_MODIFIED | Status::WT_RENAMED | Status::INDEX_RENAMED,
            ) {
                ChangeKind::Modified
            } else {
                continue;
            };
            entries.push(StatusEntry {
                path: path.to_string(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Index entries that carry conflict stages, sorted by path.
    pub fn unmerged(&self) -> Result<Vec<UnmergedEntry>, GitError> {
        let repo = self.repo()?;
        let index = repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let stages = [&conflict.ancestor, &conflict.our, &conflict.their];
            let Some(path) = stages
                .iter()
                .find_map(|s| s.as_ref())
                .map(|e| String::from_utf8_lossy(&e.path).into_owned())
            else {
                continue;
            };
            let mut is_binary = false;
            for entry in stages.iter().filter_map(|s| s.as_ref()) {
                if let Ok(blob) = repo.find_blob(entry.id) {
                    is_binary |= blob.is_binary();
                }
            }
            entries.push(UnmergedEntry {
                path,
                has_base: conflict.ancestor.is_some(),
                has_ours: conflict.our.is_some(),
                has_theirs: conflict.their.is_some(),
                is_binary,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// The merge/rebase/cherry-pick currently stopped in this repository.
    ///
    /// `git2` only reports a cherry-pick while `CHERRY_PICK_HEAD` exists. A
    /// sequence that stopped before picking (a merge commit without `-m`)
    /// leaves just `.git/sequencer`, so that directory is checked as well.
    pub fn operation_in_progress(&self) -> Result<Option<OperationKind>, GitError> {
        let repo = self.repo()?;
        Ok(match repo.state() {
            RepositoryState::Merge => Some(OperationKind::Merge),
            RepositoryState::Rebase
            | RepositoryState::RebaseInteractive
            | RepositoryState::RebaseMerge
            | RepositoryState::ApplyMailboxOrRebase => Some(OperationKind::Rebase),
            RepositoryState::CherryPick | RepositoryState::CherryPickSequence => {
                Some(OperationKind::CherryPick)
            }
            RepositoryState::Clean => stopped_sequence(repo.path()),
            _ => None,
        })
    }

    /// Commit id `HEAD` points at, if any.
    pub fn head_commit(&self) -> Result<Option<String>, GitError> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(h) => h,
            Err(_) => return Ok(None),
        };
        Ok(head.peel_to_commit().ok().map(|c| c.id().to_string()))
    }

    /// The branch being changed by `kind`.
    ///
    /// During a rebase `HEAD` is detached, so the branch is read from the
    /// rebase state directory instead.
    pub fn target_ref(&self, kind: Option<OperationKind>) -> Result<String, GitError> {
        let repo = self.repo()?;
        if kind == Some(OperationKind::Rebase) {
            for dir in ["rebase-merge", "rebase-apply"] {
                let file = repo.path().join(dir).join("head-name");
                if let Ok(name) = std::fs::read_to_string(&file) {
                    let name = name.trim();
                    if !name.is_empty() {
                        return Ok(name.trim_start_matches("refs/heads/").to_string());
                    }
                }
            }
        }
        let name = match repo.head() {
            Ok(h) if h.is_branch() => h.shorthand().unwrap_or("HEAD").to_string(),
            _ => "HEAD".to_string(),
        };
        Ok(name)
    }

    /// Commit id of `kind`'s incoming pseudo-ref, if present.
    pub fn incoming_commit(&self, kind: OperationKind) -> Result<Option<String>, GitError> {
        let repo = self.repo()?;
        Ok(repo
            .revparse_single(kind.incoming_ref())
            .ok()
            .map(|o| o.id().to_string()))
    }

    /// Content of `path` at `HEAD`, or `None` if it is not in `HEAD`.
    pub fn head_content(&self, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let repo = self.repo()?;
        let tree = match repo.head().and_then(|h| h.peel_to_tree()) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };
        let entry = match tree.get_path(Path::new(path)) {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };
        let object = entry.to_object(&repo)?;
        Ok(object.as_blob().map(|b| b.content().to_vec()))
    }

    /// `true` when the index differs from `HEAD`.
    pub fn has_staged_changes(&self) -> Result<bool, GitError> {
        let out = self.run_raw(&["diff", "--cached", "--quiet"])?;
        match out.exit_code {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(GitError::CommandFailed {
                command: "diff".into(),
                exit_code: out.exit_code,
                stderr: out.stderr,
            }),
        }
    }

    // -- Index & working-tree mutations --------------------------------------

    pub fn add(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["add"], paths)?;
        debug!(count = paths.len(), "staged paths");
        Ok(())
    }

    /// Stage additions and deletions alike, so git pairs renames.
    pub fn add_all(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["add", "-A"], paths)?;
        Ok(())
    }

    pub fn remove(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["rm", "-q", "--ignore-unmatch"], paths)?;
        Ok(())
    }

    /// Unstage `paths`, leaving the working tree alone.
    pub fn unstage(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["reset", "-q"], paths)?;
        Ok(())
    }

    /// Take one conflict side for `paths` wholesale.
    pub fn checkout_side(&self, side: ConflictSide, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["checkout", side.flag()], paths)?;
        Ok(())
    }

    /// Recreate the conflicted state of already-resolved paths.
    pub fn recreate_conflict(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.run_paths(&["checkout", "-m"], paths)?;
        Ok(())
    }

    // -- Operation control ---------------------------------------------------

    /// The step that concludes a stopped operation once conflicts are staged.
    #[instrument(skip(self))]
    pub fn conclude(&self, kind: OperationKind) -> Result<CommandOutput, GitError> {
        let args: &[&str] = match kind {
            OperationKind::Merge => &["commit", "--no-edit"],
            OperationKind::Rebase => &["rebase", "--continue"],
            OperationKind::CherryPick => &["cherry-pick", "--continue"],
        };
        self.run_raw(args)
    }

    /// Drop the commit a sequence is stopped on.
    pub fn skip(&self, kind: OperationKind) -> Result<(), GitError> {
        match kind {
            OperationKind::Merge => Err(GitError::UnexpectedOutput(
                "a merge has no commit to skip".into(),
            )),
            k => self.run(&[k.subcommand(), "--skip"]).map(|_| ()),
        }
    }

    /// Return the repository to its pre-operation ref.
    #[instrument(skip(self))]
    pub fn abort(&self, kind: OperationKind) -> Result<(), GitError> {
        self.run(&[kind.subcommand(), "--abort"])?;
        info!(operation = %kind, "operation aborted");
        Ok(())
    }
}

/// A cherry-pick sequence stopped with only its todo list on disk.
///
/// Revert sequences share the directory; their todo starts with `revert`
/// and is not reported.
fn stopped_sequence(git_dir: &Path) -> Option<OperationKind> {
    let todo = std::fs::read_to_string(git_dir.join("sequencer").join("todo")).ok()?;
    let first = todo
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))?;
    matches!(first.split_whitespace().next(), Some("pick" | "p")).then_some(OperationKind::CherryPick)
}

fn check(args: &[&str], out: CommandOutput) -> Result<String, GitError> {
    if out.success() {
        return Ok(out.stdout);
    }
    let command = args.first().copied().unwrap_or("").to_string();
    warn!(command = %command, exit_code = out.exit_code, stderr = %out.stderr.trim(), "git command failed");
    Err(GitError::CommandFailed {
        command,
        exit_code: out.exit_code,
        stderr: out.stderr.trim().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo() -> (tempfile::TempDir, GitBackend) {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let backend = GitBackend::open(dir.path(), "git").unwrap();
        for args in [
            ["config", "user.name", "Test"],
            ["config", "user.email", "test@example.com"],
            ["config", "commit.gpgsign", "false"],
        ] {
            backend.run(&args).unwrap();
        }
        (dir, backend)
    }

    #[test]
    fn test_looks_binary() {
        assert!(looks_binary(b"\x00\x01abc"));
        assert!(!looks_binary(b"plain text\n"));
    }

    #[test]
    fn test_output_summary() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "ignored\n".into(),
            stderr: "\nfatal: bad thing\nmore".into(),
        };
        assert_eq!(out.summary(), "fatal: bad thing");
    }

    #[test]
    fn test_open_rejects_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitBackend::open(dir.path(), "git").unwrap_err();
        assert!(matches!(err, GitError::RepositoryNotFound(_)));
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let backend = GitBackend::open(dir.path(), "definitely-not-a-git-binary").unwrap();
        assert!(matches!(
            backend.run(&["status"]),
            Err(GitError::BinaryNotFound(_))
        ));
    }

    #[test]
    fn test_status_and_head_content() {
        if !git_available() {
            eprintln!("git not available, skipping");
            return;
        }
        let (dir, backend) = init_repo();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        std::fs::write(dir.path().join("gone.txt"), "bye\n").unwrap();
        backend.add(&["a.txt".into(), "gone.txt".into()]).unwrap();
        backend.run(&["commit", "-q", "-m", "init"]).unwrap();

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/new.txt"), "new\n").unwrap();

        let status = backend.status().unwrap();
        let kinds: Vec<(&str, ChangeKind)> =
            status.iter().map(|e| (e.path.as_str(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("a.txt", ChangeKind::Modified),
                ("gone.txt", ChangeKind::Deleted),
                ("sub/new.txt", ChangeKind::Untracked),
            ]
        );

        assert_eq!(backend.head_content("a.txt").unwrap().unwrap(), b"one\n");
        assert!(backend.head_content("sub/new.txt").unwrap().is_none());
        assert!(backend.operation_in_progress().unwrap().is_none());
        assert!(backend.unmerged().unwrap().is_empty());
        assert!(!backend.has_staged_changes().unwrap());
    }

    #[test]
    fn test_stopped_sequence_from_todo() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(stopped_sequence(dir.path()), None);

        let sequencer = dir.path().join("sequencer");
        std::fs::create_dir(&sequencer).unwrap();
        std::fs::write(sequencer.join("todo"), "pick 0049165 Merge branch 'topic'\npick 1a2b3c4 more\n").unwrap();
        assert_eq!(stopped_sequence(dir.path()), Some(OperationKind::CherryPick));

        std::fs::write(sequencer.join("todo"), "revert 0049165 Undo\n").unwrap();
        assert_eq!(stopped_sequence(dir.path()), None);

        std::fs::write(sequencer.join("todo"), "").unwrap();
        assert_eq!(stopped_sequence(dir.path()), None);
    }

    #[test]
    fn test_failed_command_reports_exit_code() {
        if !git_available() {
            return;
        }
        let (_dir, backend) = init_repo();
        match backend.run(&["rev-parse", "--verify", "no-such-ref"]) {
            Err(GitError::CommandFailed { command, exit_code, .. }) => {
                assert_eq!(command, "rev-parse");
                assert_ne!(exit_code, 0);
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
