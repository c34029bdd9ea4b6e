//! End-to-end tests for wrapped operations and conflict sessions.
//!
//! These tests exercise the real `Engine` with:
//! - Local Git repos created with the `git` CLI
//! - Local bare repos standing in for remotes
//! - Real state directories holding session and snapshot records
//!
//! No network I/O. Tests skip gracefully if `git` is not installed.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use gitward_core::conflict::{Disposition, SessionStatus};
use gitward_core::errors::{CoreError, StateError, ValidationError};
use gitward_core::executor::{OperationResult, RestoreOutcome};
use gitward_core::git::{GitCommand, OperationKind};
use gitward_core::{Engine, FinalizeOutcome, GitwardConfig, StatePaths};

// ===========================================================================
// Helpers
// ===========================================================================

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_EDITOR", "true")
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn write(repo: &Path, rel: &str, content: &[u8]) {
    let path = repo.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn read(repo: &Path, rel: &str) -> Vec<u8> {
    std::fs::read(repo.join(rel)).unwrap()
}

fn commit_all(repo: &Path, message: &str) {
    git(repo, &["add", "-A"]);
    git(repo, &["commit", "-q", "-m", message]);
}

/// A repository on `main` with one commit holding `app.py` and a catalog.
fn setup_repo(tmp: &TempDir) -> PathBuf {
    let repo = tmp.path().join("work");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(&repo, &["config", "user.name", "Test User"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    git(&repo, &["config", "core.autocrlf", "false"]);
    git(&repo, &["config", "merge.conflictStyle", "merge"]);

    write(&repo, "app.py", b"print('hello')\n");
    write(&repo, "locale/de.po", b"msgid \"hello\"\nmsgstr \"hallo\"\n");
    commit_all(&repo, "initial commit");
    repo
}

fn open_engine(repo: &Path, tmp: &TempDir) -> Engine {
    Engine::with_state(
        repo,
        GitwardConfig::default(),
        StatePaths::at(tmp.path().join("state")),
    )
    .expect("failed to open engine")
}

fn command(args: &[&str]) -> GitCommand {
    GitCommand::new(args.iter().copied()).unwrap()
}

fn numbered(lines: &[(usize, &str)]) -> String {
    (1..=10)
        .map(|n| {
            let text = lines
                .iter()
                .find(|(i, _)| *i == n)
                .map(|(_, t)| t.to_string())
                .unwrap_or_else(|| format!("line {n}"));
            format!("{text}\n")
        })
        .collect()
}

/// `feature` and `main` both edit lines 2 and 9 of `file.txt`; `feature`
/// is checked out.
fn setup_rebase_conflict(repo: &Path) {
    write(repo, "file.txt", numbered(&[]).as_bytes());
    commit_all(repo, "add file");
    git(repo, &["branch", "feature"]);

    write(
        repo,
        "file.txt",
        numbered(&[(2, "main 2"), (9, "main 9")]).as_bytes(),
    );
    commit_all(repo, "main edits");

    git(repo, &["checkout", "-q", "feature"]);
    write(
        repo,
        "file.txt",
        numbered(&[(2, "feature 2"), (9, "feature 9")]).as_bytes(),
    );
    commit_all(repo, "feature edits");
}

/// `feature` and `main` both edit the middle line of `notes.txt`; `main`
/// is checked out.
fn setup_merge_conflict(repo: &Path) {
    write(repo, "notes.txt", b"a\nb\nc\n");
    commit_all(repo, "add notes");
    git(repo, &["checkout", "-q", "-b", "feature"]);
    write(repo, "notes.txt", b"a\nfeature\nc\n");
    commit_all(repo, "feature notes");
    git(repo, &["checkout", "-q", "main"]);
    write(repo, "notes.txt", b"a\nmain\nc\n");
    commit_all(repo, "main notes");
}

fn stash_count(repo: &Path) -> usize {
    git(repo, &["stash", "list"]).lines().count()
}

fn expect_needs_resolution(result: OperationResult) -> (uuid::Uuid, Option<uuid::Uuid>) {
    match result {
        OperationResult::NeedsResolution {
            session_id,
            snapshot_id,
            ..
        } => (session_id, snapshot_id),
        other => panic!("expected NeedsResolution, got {other:?}"),
    }
}

// ===========================================================================
// Wrapped operations
// ===========================================================================

#[test]
fn test_failed_push_restores_background_byte_identical() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    let po = b"msgid \"hello\"\nmsgstr \"servus\"\n".to_vec();
    let mo = vec![0xde, 0x12, 0x04, 0x95, 0x00, 0x00, 0x01, 0x00];
    write(&repo, "locale/de.po", &po);
    write(&repo, "locale/de.mo", &mo);

    let engine = open_engine(&repo, &tmp);
    let result = engine
        .execute("push", &command(&["push", "nowhere", "main"]))
        .unwrap();

    match result {
        OperationResult::Failed { restore, .. } => {
            assert!(
                matches!(restore, RestoreOutcome::Restored { .. }),
                "unexpected restore outcome {restore:?}"
            );
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert_eq!(read(&repo, "locale/de.mo"), mo);
    assert_eq!(stash_count(&repo), 0);
    assert!(engine.snapshots().unwrap().is_empty());
}

#[test]
fn test_push_with_background_changes_completes() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    let bare = tmp.path().join("origin.git");
    git(tmp.path(), &["init", "-q", "--bare", bare.to_str().unwrap()]);
    git(&repo, &["remote", "add", "origin", bare.to_str().unwrap()]);

    let po = b"msgid \"hello\"\nmsgstr \"moin\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    let engine = open_engine(&repo, &tmp);
    let plan = engine
        .plan("push", &command(&["push", "origin", "main"]))
        .unwrap();
    assert!(plan.foreground.is_empty());
    assert_eq!(plan.background.len(), 1);

    let result = engine
        .execute("push", &command(&["push", "origin", "main"]))
        .unwrap();
    match result {
        OperationResult::Completed { restore, .. } => {
            assert!(matches!(restore, RestoreOutcome::Restored { .. }));
        }
        other => panic!("expected Completed, got {other:?}"),
    }
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert_eq!(stash_count(&repo), 0);

    let local = git(&repo, &["rev-parse", "main"]);
    let remote = git(&bare, &["rev-parse", "main"]);
    assert_eq!(local, remote);
}

#[test]
fn test_foreground_only_operation_shelves_nothing() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    write(&repo, "app.py", b"print('bye')\n");
    git(&repo, &["add", "app.py"]);

    let engine = open_engine(&repo, &tmp);
    let result = engine
        .execute("commit", &command(&["commit", "-q", "-m", "say bye"]))
        .unwrap();
    match result {
        OperationResult::Completed { restore, .. } => {
            assert_eq!(restore, RestoreOutcome::NothingShelved)
        }
        other => panic!("expected Completed, got {other:?}"),
    }
    assert_eq!(git(&repo, &["log", "-1", "--format=%s"]).trim(), "say bye");
}

#[test]
fn test_binary_restore_conflict_keeps_shelved_side() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    let original = vec![0u8, 1, 2, 3, b'X'];
    let incoming = vec![0u8, 1, 2, 3, b'A'];
    let local = vec![0u8, 1, 2, 3, b'B'];

    write(&repo, "locale/app.mo", &original);
    commit_all(&repo, "add catalog");
    git(&repo, &["checkout", "-q", "-b", "feature"]);
    write(&repo, "locale/app.mo", &incoming);
    commit_all(&repo, "rebuild catalog");
    git(&repo, &["checkout", "-q", "main"]);
    write(&repo, "locale/app.mo", &local);

    let engine = open_engine(&repo, &tmp);
    let result = engine
        .execute("merge feature", &command(&["merge", "feature"]))
        .unwrap();
    match result {
        OperationResult::Completed { restore, .. } => match restore {
            RestoreOutcome::Restored { auto_resolved, .. } => {
                assert_eq!(auto_resolved, vec!["locale/app.mo".to_string()])
            }
            other => panic!("expected Restored, got {other:?}"),
        },
        other => panic!("expected Completed, got {other:?}"),
    }

    assert_eq!(read(&repo, "locale/app.mo"), local);
    assert_eq!(stash_count(&repo), 0);
    assert!(engine.snapshots().unwrap().is_empty());
    // The shelved side is back as an unstaged change on top of the merge.
    let staged = git(&repo, &["diff", "--cached", "--name-only"]);
    assert!(staged.trim().is_empty());
}

#[test]
fn test_text_restore_conflict_retains_shelf() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    git(&repo, &["checkout", "-q", "-b", "feature"]);
    write(&repo, "locale/de.po", b"msgid \"hello\"\nmsgstr \"hallo welt\"\n");
    commit_all(&repo, "update catalog");
    git(&repo, &["checkout", "-q", "main"]);
    write(&repo, "locale/de.po", b"msgid \"hello\"\nmsgstr \"servus\"\n");

    let engine = open_engine(&repo, &tmp);
    let result = engine
        .execute("merge feature", &command(&["merge", "feature"]))
        .unwrap();
    let snapshot_id = match result {
        OperationResult::Completed {
            restore: RestoreOutcome::Retained {
                snapshot_id, paths, ..
            },
            ..
        } => {
            assert_eq!(paths, vec!["locale/de.po".to_string()]);
            snapshot_id
        }
        other => panic!("expected Completed with a retained shelf, got {other:?}"),
    };

    // The merge itself went through; the shelf waits for the operator.
    assert_eq!(
        git(&repo, &["rev-parse", "HEAD"]),
        git(&repo, &["rev-parse", "feature"])
    );
    assert_eq!(stash_count(&repo), 1);
    let snapshots = engine.snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, snapshot_id);
    let text = String::from_utf8(read(&repo, "locale/de.po")).unwrap();
    assert!(text.contains("<<<<<<<"), "expected markers, got {text}");
}

#[test]
fn test_failed_shelve_never_runs_the_command() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    let po = b"msgid \"hello\"\nmsgstr \"gruess dich\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    // A held index lock makes `git stash push` fail.
    let lock = repo.join(".git").join("index.lock");
    std::fs::write(&lock, b"").unwrap();

    let engine = open_engine(&repo, &tmp);
    let err = engine
        .execute("tag", &command(&["tag", "gitward-ran"]))
        .unwrap_err();
    std::fs::remove_file(&lock).unwrap();
    assert!(matches!(err, CoreError::Git(_)), "unexpected error {err:?}");

    let tagged = Command::new("git")
        .current_dir(&repo)
        .args(["rev-parse", "--verify", "-q", "refs/tags/gitward-ran"])
        .output()
        .unwrap();
    assert!(!tagged.status.success(), "the wrapped command ran");
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert_eq!(stash_count(&repo), 0);
    assert!(engine.snapshots().unwrap().is_empty());
}

#[test]
fn test_cherry_pick_range_continues_past_merge_commit() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    // side: a.txt, then a merge of topic (b.txt), then c.txt.
    git(&repo, &["checkout", "-q", "-b", "side"]);
    write(&repo, "a.txt", b"a\n");
    commit_all(&repo, "side a");
    git(&repo, &["checkout", "-q", "-b", "topic"]);
    write(&repo, "b.txt", b"b\n");
    commit_all(&repo, "topic b");
    git(&repo, &["checkout", "-q", "side"]);
    git(&repo, &["merge", "-q", "--no-ff", "-m", "merge topic", "topic"]);
    write(&repo, "c.txt", b"c\n");
    commit_all(&repo, "side c");
    git(&repo, &["checkout", "-q", "main"]);
    let head_before = git(&repo, &["rev-parse", "HEAD"]).trim().to_string();

    let po = b"msgid \"hello\"\nmsgstr \"moin moin\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    let engine = open_engine(&repo, &tmp);
    let result = engine
        .execute("pick side", &command(&["cherry-pick", "main..side"]))
        .unwrap();
    match result {
        OperationResult::Completed { restore, .. } => {
            assert!(
                matches!(restore, RestoreOutcome::Restored { .. }),
                "unexpected restore outcome {restore:?}"
            );
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    for file in ["a.txt", "b.txt", "c.txt"] {
        assert!(repo.join(file).exists(), "{file} was not picked");
    }
    let range = format!("{head_before}..HEAD");
    assert_eq!(git(&repo, &["rev-list", "--count", &range]).trim(), "3");
    assert!(engine.backend().operation_in_progress().unwrap().is_none());
    assert!(!repo.join(".git").join("sequencer").exists());
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert_eq!(stash_count(&repo), 0);
    assert!(engine.snapshots().unwrap().is_empty());
}

// ===========================================================================
// Conflict sessions
// ===========================================================================

#[test]
fn test_rebase_session_survives_restart() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_rebase_conflict(&repo);

    let po = b"msgid \"hello\"\nmsgstr \"gruezi\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    let (session_id, snapshot_id) = {
        let engine = open_engine(&repo, &tmp);
        let result = engine
            .execute("rebase onto main", &command(&["rebase", "main"]))
            .unwrap();
        let ids = match &result {
            OperationResult::NeedsResolution {
                session_id,
                kind,
                conflicted,
                snapshot_id,
            } => {
                assert_eq!(*kind, OperationKind::Rebase);
                assert_eq!(conflicted, &vec!["file.txt".to_string()]);
                assert!(snapshot_id.is_some());
                (*session_id, *snapshot_id)
            }
            other => panic!("expected NeedsResolution, got {other:?}"),
        };

        let session = engine.begin(&ids.0).unwrap();
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(session.target_ref, "feature");
        assert_eq!(session.files[0].hunks.len(), 2);

        let file = engine
            .advance(&ids.0, "file.txt", 0, Disposition::Ours)
            .unwrap();
        assert!(!file.staged);
        ids
        // Engine dropped here, as if the process exited.
    };

    let engine = open_engine(&repo, &tmp);
    let session = engine.resume_session().unwrap().expect("session to resume");
    assert_eq!(session.session_id, session_id);
    assert_eq!(session.snapshot_id, snapshot_id);
    assert_eq!(session.status, SessionStatus::InProgress);
    let file = session.file("file.txt").unwrap();
    assert_eq!(file.resolved_hunks.get(&0), Some(&Disposition::Ours));
    assert_eq!(file.unresolved_hunks(), vec![1]);

    // Resuming does not change the record.
    let again = engine.resume_session().unwrap().unwrap();
    assert_eq!(again, session);

    match engine.finalize(&session_id) {
        Err(CoreError::Validation(ValidationError::UnresolvedHunks { count, first_path })) => {
            assert_eq!(count, 1);
            assert_eq!(first_path, "file.txt");
        }
        other => panic!("expected UnresolvedHunks, got {other:?}"),
    }

    let file = engine
        .advance(&session_id, "file.txt", 1, Disposition::Theirs)
        .unwrap();
    assert!(file.staged);

    match engine.finalize(&session_id).unwrap() {
        FinalizeOutcome::Concluded { session, restore } => {
            assert_eq!(session.status, SessionStatus::Resolved);
            assert!(matches!(restore, RestoreOutcome::Restored { .. }));
        }
        other => panic!("expected Concluded, got {other:?}"),
    }

    assert_eq!(
        String::from_utf8(read(&repo, "file.txt")).unwrap(),
        numbered(&[(2, "main 2"), (9, "feature 9")])
    );
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert!(engine.backend().operation_in_progress().unwrap().is_none());
    assert!(!engine.state_paths().session_file().exists());
    assert!(engine.resume_session().unwrap().is_none());
}

#[test]
fn test_only_one_active_session() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);

    let engine = open_engine(&repo, &tmp);
    let (session_id, _) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );

    let err = engine
        .execute("pull", &command(&["pull", "--rebase"]))
        .unwrap_err();
    match err {
        CoreError::State(StateError::ConcurrencyViolation { existing }) => {
            assert_eq!(existing, session_id.to_string())
        }
        other => panic!("expected ConcurrencyViolation, got {other:?}"),
    }
    // The tracked session is untouched by the refused command.
    let session = engine.resume_session().unwrap().unwrap();
    assert_eq!(session.session_id, session_id);
    assert_eq!(session.status, SessionStatus::Detected);
}

#[test]
fn test_merge_resolve_all_and_finalize() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);

    let engine = open_engine(&repo, &tmp);
    let (session_id, snapshot_id) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );
    assert!(snapshot_id.is_none());

    // Skip is recorded but does not resolve.
    engine
        .advance(&session_id, "notes.txt", 0, Disposition::Skip)
        .unwrap();
    assert!(engine.finalize(&session_id).is_err());

    let paused = engine.pause(&session_id).unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert_eq!(engine.pause(&session_id).unwrap().status, SessionStatus::Paused);

    let session = engine
        .resolve_all(&session_id, Disposition::Theirs)
        .unwrap();
    assert!(session.is_fully_resolved());

    match engine.finalize(&session_id).unwrap() {
        FinalizeOutcome::Concluded { restore, .. } => {
            assert_eq!(restore, RestoreOutcome::NothingShelved)
        }
        other => panic!("expected Concluded, got {other:?}"),
    }
    assert_eq!(read(&repo, "notes.txt"), b"a\nfeature\nc\n".to_vec());
    // A real merge commit with two parents.
    git(&repo, &["rev-parse", "--verify", "HEAD^2"]);
}

#[test]
fn test_manual_resolution_rejects_markers() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);

    let engine = open_engine(&repo, &tmp);
    let (session_id, _) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );

    let err = engine
        .advance(
            &session_id,
            "notes.txt",
            0,
            Disposition::Manual("x\n>>>>>>> feature\n".into()),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Validation(ValidationError::LeftoverConflictMarker { line: 2 })
    ));
    assert!(err.is_retryable());

    let file = engine
        .advance(&session_id, "notes.txt", 0, Disposition::Manual("both".into()))
        .unwrap();
    assert!(file.staged);
    assert_eq!(read(&repo, "notes.txt"), b"a\nboth\nc\n".to_vec());
}

#[test]
fn test_abort_restores_pre_operation_state() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);
    let head_before = git(&repo, &["rev-parse", "HEAD"]);

    let po = b"msgid \"hello\"\nmsgstr \"hej\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    let engine = open_engine(&repo, &tmp);
    let (session_id, snapshot_id) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );
    assert!(snapshot_id.is_some());
    assert_eq!(read(&repo, "locale/de.po"), b"msgid \"hello\"\nmsgstr \"hallo\"\n".to_vec());

    let outcome = engine.abort(&session_id).unwrap();
    assert_eq!(outcome.session.status, SessionStatus::Aborted);
    assert!(matches!(outcome.restore, RestoreOutcome::Restored { .. }));

    assert_eq!(git(&repo, &["rev-parse", "HEAD"]), head_before);
    assert_eq!(read(&repo, "notes.txt"), b"a\nmain\nc\n".to_vec());
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert!(engine.backend().operation_in_progress().unwrap().is_none());
    assert!(engine.resume_session().unwrap().is_none());
}

#[test]
fn test_stale_session_dropped_and_snapshot_recoverable() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);

    let po = b"msgid \"hello\"\nmsgstr \"ahoj\"\n".to_vec();
    write(&repo, "locale/de.po", &po);

    let engine = open_engine(&repo, &tmp);
    let (_, snapshot_id) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );
    let snapshot_id = snapshot_id.unwrap();

    // The operator aborts with plain git behind gitward's back.
    git(&repo, &["merge", "--abort"]);
    assert!(engine.resume_session().unwrap().is_none());
    assert!(!engine.state_paths().session_file().exists());

    let snapshots = engine.snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, snapshot_id);

    let restore = engine.restore_snapshot(&snapshot_id).unwrap();
    assert!(matches!(restore, RestoreOutcome::Restored { .. }));
    assert_eq!(read(&repo, "locale/de.po"), po);
    assert!(engine.snapshots().unwrap().is_empty());
    assert!(matches!(
        engine.restore_snapshot(&snapshot_id),
        Err(CoreError::State(StateError::SnapshotNotFound(_)))
    ));
}

#[test]
fn test_detects_conflict_started_outside() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    setup_merge_conflict(&repo);

    let out = Command::new("git")
        .current_dir(&repo)
        .args(["merge", "feature"])
        .env("GIT_MERGE_AUTOEDIT", "no")
        .output()
        .unwrap();
    assert!(!out.status.success());

    let engine = open_engine(&repo, &tmp);
    // Reading the record, as `status` does, must not adopt the merge.
    assert!(engine.session_record().unwrap().is_none());
    assert!(engine.backend().operation_in_progress().unwrap().is_some());
    assert!(!engine.state_paths().session_file().exists());

    let session = engine.resume_session().unwrap().expect("detected session");
    assert_eq!(session.status, SessionStatus::Detected);
    assert_eq!(session.kind, OperationKind::Merge);
    assert!(session.snapshot_id.is_none());
    assert_eq!(session.files.len(), 1);

    let outcome = engine.abort(&session.session_id).unwrap();
    assert_eq!(outcome.restore, RestoreOutcome::NothingShelved);
}

// ===========================================================================
// Recovery
// ===========================================================================

#[test]
fn test_corrupted_session_record_can_be_discarded() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);
    let engine = open_engine(&repo, &tmp);

    let record = engine.state_paths().session_file();
    std::fs::create_dir_all(record.parent().unwrap()).unwrap();
    std::fs::write(&record, b"{\"version\": 1, \"check").unwrap();

    let commit = command(&["commit", "--allow-empty", "-q", "-m", "after recovery"]);
    match engine.execute("commit", &commit) {
        Err(CoreError::State(StateError::SessionCorrupted { path, .. })) => {
            assert_eq!(path, record)
        }
        other => panic!("expected SessionCorrupted, got {other:?}"),
    }
    assert!(matches!(
        engine.resume_session(),
        Err(CoreError::State(StateError::SessionCorrupted { .. }))
    ));

    assert!(engine.discard_corrupted_session().unwrap());
    assert!(!record.exists());
    assert!(!engine.discard_corrupted_session().unwrap());

    match engine.execute("commit", &commit).unwrap() {
        OperationResult::Completed { .. } => {}
        other => panic!("expected Completed, got {other:?}"),
    }
    assert_eq!(
        git(&repo, &["log", "-1", "--format=%s"]).trim(),
        "after recovery"
    );
}

#[test]
fn test_binary_restore_under_stacked_shelf_is_refused() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    write(&repo, "locale/app.mo", &[0u8, 1, 2, 3, b'X']);
    commit_all(&repo, "add catalog");
    setup_merge_conflict(&repo);
    git(&repo, &["checkout", "-q", "feature"]);
    write(&repo, "locale/app.mo", &[0u8, 1, 2, 3, b'A']);
    commit_all(&repo, "rebuild catalog");
    git(&repo, &["checkout", "-q", "main"]);
    write(&repo, "locale/app.mo", &[0u8, 1, 2, 3, b'B']);

    let engine = open_engine(&repo, &tmp);
    let (_, snapshot_id) = expect_needs_resolution(
        engine
            .execute("merge feature", &command(&["merge", "feature"]))
            .unwrap(),
    );
    let snapshot_id = snapshot_id.unwrap();

    // The operator concludes the merge with plain git, then another shelf
    // carrying a gitward label lands on top of ours.
    write(&repo, "notes.txt", b"a\nfeature\nc\n");
    git(&repo, &["add", "notes.txt"]);
    git(&repo, &["commit", "-q", "--no-edit"]);
    let other = uuid::Uuid::new_v4();
    write(&repo, "locale/de.po", b"msgid \"hello\"\nmsgstr \"hoi\"\n");
    let message = format!("gitward[{other}] push: locale/de.po");
    git(&repo, &["stash", "push", "-q", "-m", &message, "--", "locale/de.po"]);
    assert!(engine.resume_session().unwrap().is_none());

    match engine.restore_snapshot(&snapshot_id) {
        Err(CoreError::State(StateError::StackedShelves {
            snapshot_id: refused,
            others,
        })) => {
            assert_eq!(refused, snapshot_id.to_string());
            assert_eq!(others, vec![other.to_string()]);
        }
        other => panic!("expected StackedShelves, got {other:?}"),
    }
    assert_eq!(stash_count(&repo), 2);
    assert!(engine.snapshots().unwrap().iter().any(|s| s.id == snapshot_id));
}

// ===========================================================================
// Renames
// ===========================================================================

#[test]
fn test_detect_and_stage_rename() {
    if !git_available() {
        eprintln!("SKIPPED: git not found in PATH");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let repo = setup_repo(&tmp);

    let body: String = (0..98).map(|i| format!("value_{i} = {i}\n")).collect();
    write(&repo, "foo.py", format!("# foo\n# v1\n{body}").as_bytes());
    commit_all(&repo, "add foo");

    std::fs::remove_file(repo.join("foo.py")).unwrap();
    write(&repo, "bar.py", format!("# bar\n# v2\n{body}").as_bytes());

    let engine = open_engine(&repo, &tmp);
    let pairs = engine.detect_renames().unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].deleted, "foo.py");
    assert_eq!(pairs[0].added, "bar.py");
    assert!(pairs[0].similarity >= 0.6);

    engine.stage_renames(&pairs).unwrap();
    let staged = git(&repo, &["diff", "--cached", "-M", "--name-status"]);
    assert!(staged.trim_start().starts_with('R'), "staged: {staged}");
}
