//! Conflict session commands, including the interactive resolver.
//!
//! Every command re-reads the session from disk through the engine, so the
//! resolver can be quit at any prompt (or killed) and picked up later with
//! `gitward resolve`.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::{Confirm, Editor, Select};

use gitward_core::conflict::{ConflictFile, ConflictSession, Disposition};
use gitward_core::{Engine, FinalizeOutcome};

use super::{report_restore, style};

fn active_session(engine: &Engine) -> Result<ConflictSession> {
    engine
        .resume_session()
        .context("failed to read conflict session")?
        .ok_or_else(|| anyhow::anyhow!("no conflict session in progress"))
}

fn print_session(session: &ConflictSession) {
    println!();
    println!(
        "{}",
        style::header(&format!(
            "{} on {} · session {}",
            session.kind,
            session.target_ref,
            style::short_id(&session.session_id.to_string())
        ))
    );
    println!(
        "  {}",
        style::dim(&format!(
            "{} · {} · started {}",
            session.operation_label,
            session.status,
            session.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["#", "File", "Type", "Hunks", "Unresolved", "Staged"]);
    for (i, f) in session.files.iter().enumerate() {
        let kind = if f.is_binary {
            "binary"
        } else if f.whole_file {
            "whole file"
        } else {
            "text"
        };
        let marker = if i == session.cursor { "▶" } else { "" };
        table.add_row(vec![
            Cell::new(format!("{}{}", marker, i)),
            Cell::new(&f.path),
            Cell::new(kind),
            Cell::new(f.hunks.len()),
            Cell::new(f.unresolved_hunks().len()),
            Cell::new(if f.staged { "yes" } else { "no" }),
        ]);
    }
    println!("{}", table);
    if let Some(id) = session.snapshot_id {
        println!("  {}", style::dim(&format!("background changes shelved as snapshot {}", id)));
    }
    println!();
}

/// Show the current session.
pub fn run_resume(engine: &Engine) -> Result<()> {
    match engine.resume_session().context("failed to read conflict session")? {
        Some(session) => {
            print_session(&session);
            if session.is_fully_resolved() {
                println!("Every hunk is decided: run `gitward finalize`.");
            } else {
                println!(
                    "{} unresolved hunk(s): run `gitward resolve`.",
                    session.unresolved_count()
                );
            }
        }
        None => println!("{}", style::success("No conflict session in progress")),
    }
    Ok(())
}

fn parse_disposition(
    disposition: &str,
    text: Option<String>,
    file: Option<PathBuf>,
) -> Result<Disposition> {
    if disposition.trim().eq_ignore_ascii_case("manual") || disposition.trim() == "m" {
        let text = match (text, file) {
            (Some(t), _) => t,
            (None, Some(path)) => std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?,
            (None, None) => anyhow::bail!("manual resolution needs --text or --file"),
        };
        return Ok(Disposition::Manual(text));
    }
    Ok(disposition.parse()?)
}

pub fn run_advance(
    engine: &Engine,
    path: &str,
    hunk: usize,
    disposition: &str,
    text: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let session = active_session(engine)?;
    let disposition = parse_disposition(disposition, text, file)?;
    let label = disposition.label();
    let updated = engine
        .advance(&session.session_id, path, hunk, disposition)
        .context("failed to record decision")?;

    println!(
        "{}",
        style::success(&format!("{} hunk {}: {}", path, hunk, label))
    );
    report_file(&updated);
    Ok(())
}

fn report_file(file: &ConflictFile) {
    let pending = file.unresolved_hunks();
    if pending.is_empty() {
        println!("  {}", style::dim(&format!("{} resolved and staged", file.path)));
    } else {
        println!(
            "  {}",
            style::dim(&format!("{} hunk(s) left in {}", pending.len(), file.path))
        );
    }
}

pub fn run_resolve_all(engine: &Engine, side: &str) -> Result<()> {
    let session = active_session(engine)?;
    let disposition: Disposition = side.parse()?;
    let session = engine
        .resolve_all(&session.session_id, disposition)
        .context("failed to resolve hunks")?;
    println!(
        "{}",
        style::success(&format!("All remaining hunks resolved with {}", side))
    );
    if session.is_fully_resolved() {
        println!("Run `gitward finalize` to conclude the {}.", session.kind);
    }
    Ok(())
}

pub fn run_pause(engine: &Engine) -> Result<()> {
    let session = active_session(engine)?;
    let session = engine
        .pause(&session.session_id)
        .context("failed to pause session")?;
    println!(
        "{}",
        style::success(&format!(
            "Session paused with {} unresolved hunk(s)",
            session.unresolved_count()
        ))
    );
    Ok(())
}

pub fn run_finalize(engine: &Engine) -> Result<()> {
    let session = active_session(engine)?;
    finalize(engine, &session)
}

fn finalize(engine: &Engine, session: &ConflictSession) -> Result<()> {
    match engine
        .finalize(&session.session_id)
        .context("failed to finalize session")?
    {
        FinalizeOutcome::Concluded { session, restore } => {
            println!(
                "{}",
                style::success(&format!("{} concluded", session.operation_label))
            );
            report_restore(&restore);
        }
        FinalizeOutcome::Reopened(session) => {
            println!(
                "{}",
                style::warn(&format!(
                    "The {} stopped on another conflicting commit ({} file(s))",
                    session.kind,
                    session.files.len()
                ))
            );
            println!("Run `gitward resolve` to continue.");
        }
    }
    Ok(())
}

pub fn run_abort(engine: &Engine, yes: bool) -> Result<()> {
    let session = active_session(engine)?;
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Abort the {} and discard {} decided hunk(s)?",
                session.kind,
                session
                    .files
                    .iter()
                    .map(|f| f.hunks.len() - f.unresolved_hunks().len())
                    .sum::<usize>()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let outcome = engine
        .abort(&session.session_id)
        .context("failed to abort operation")?;
    println!(
        "{}",
        style::success(&format!("{} aborted", outcome.session.operation_label))
    );
    report_restore(&outcome.restore);
    Ok(())
}

/// Drop a session record that no longer parses.
pub fn run_discard_record(engine: &Engine, yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Discard the conflict session record? Decisions stored in it are lost")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if !engine
        .discard_corrupted_session()
        .context("failed to discard session record")?
    {
        println!(
            "{}",
            style::dim("The session record is readable (or absent); nothing discarded")
        );
        return Ok(());
    }
    println!("{}", style::success("Unreadable session record discarded"));
    if let Some(kind) = engine
        .backend()
        .operation_in_progress()
        .context("failed to read repository state")?
    {
        println!(
            "The {} is still stopped in the repository: run `gitward resume` to track it again.",
            kind
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactive resolver
// ---------------------------------------------------------------------------

enum Choice {
    Decide(Disposition),
    Edit,
    Quit,
}

fn show_hunk(file: &ConflictFile, index: usize) {
    println!();
    println!(
        "{}",
        style::header(&format!(
            "{} · hunk {}/{}",
            file.path,
            index + 1,
            file.hunks.len()
        ))
    );

    if file.whole_file {
        let describe = |present: bool| if present { "modified" } else { "deleted" };
        if file.is_binary {
            println!("  {}", style::dim("binary file: choose one side"));
        }
        println!("  {} {}", style::ours("ours:  "), describe(file.has_ours));
        println!("  {} {}", style::theirs("theirs:"), describe(file.has_theirs));
        return;
    }

    let Some(hunk) = file.hunks.get(index) else {
        return;
    };
    for line in &hunk.context_lines {
        println!("  {}", style::dim(line));
    }
    println!("  {}", style::ours(&format!("<<<<<<< ours {}", hunk.ours_label)));
    for line in hunk.ours_text.lines() {
        println!("  {}", line);
    }
    if let Some(base) = &hunk.base_text {
        println!("  {}", style::dim("||||||| base"));
        for line in base.lines() {
            println!("  {}", style::dim(line));
        }
    }
    println!("  {}", style::dim("======="));
    for line in hunk.theirs_text.lines() {
        println!("  {}", line);
    }
    println!(
        "  {}",
        style::theirs(&format!(">>>>>>> theirs {}", hunk.theirs_label))
    );
}

fn prompt(file: &ConflictFile) -> Result<Choice> {
    let mut choices = vec![
        ("Keep ours", Choice::Decide(Disposition::Ours)),
        ("Keep theirs", Choice::Decide(Disposition::Theirs)),
    ];
    if !file.whole_file {
        choices.push(("Keep both (ours first)", Choice::Decide(Disposition::Both)));
        choices.push(("Edit in $EDITOR", Choice::Edit));
    }
    choices.push(("Skip for now", Choice::Decide(Disposition::Skip)));
    choices.push(("Pause and quit", Choice::Quit));

    let labels: Vec<&str> = choices.iter().map(|(l, _)| *l).collect();
    let picked = Select::new()
        .with_prompt("Resolution")
        .items(&labels)
        .default(0)
        .interact()?;
    Ok(choices.swap_remove(picked).1)
}

/// Walk every undecided hunk, one prompt each.
///
/// Opening the editor is a suspension point: the session is paused first,
/// so a resolver killed while the editor is open resumes cleanly.
pub fn run_interactive(engine: &Engine) -> Result<()> {
    let session = active_session(engine)?;
    let session_id = session.session_id;
    let session = engine.begin(&session_id).context("failed to start resolving")?;
    print_session(&session);

    // Hunks already offered in this run; skipped ones are not asked twice.
    let mut offered: HashSet<(String, usize)> = HashSet::new();

    loop {
        let session = active_session(engine)?;
        if session.session_id != session_id {
            anyhow::bail!("conflict session changed underneath the resolver");
        }
        let next = session.files.iter().find_map(|f| {
            f.unresolved_hunks()
                .into_iter()
                .find(|i| !offered.contains(&(f.path.clone(), *i)))
                .map(|i| (f, i))
        });
        let Some((file, index)) = next else {
            break;
        };
        offered.insert((file.path.clone(), index));
        show_hunk(file, index);

        let disposition = match prompt(file)? {
            Choice::Decide(d) => d,
            Choice::Quit => {
                engine.pause(&session_id).context("failed to pause session")?;
                println!();
                println!("{}", style::success("Paused. Run `gitward resolve` to continue."));
                return Ok(());
            }
            Choice::Edit => {
                engine.pause(&session_id).context("failed to pause session")?;
                let initial = file
                    .hunks
                    .get(index)
                    .map(|h| format!("{}{}", h.ours_text, h.theirs_text))
                    .unwrap_or_default();
                match Editor::new().edit(&initial)? {
                    Some(text) => Disposition::Manual(text),
                    None => {
                        println!("{}", style::dim("Editor closed without saving; hunk left undecided"));
                        offered.remove(&(file.path.clone(), index));
                        engine.begin(&session_id).context("failed to resume session")?;
                        continue;
                    }
                }
            }
        };

        let path = file.path.clone();
        match engine.advance(&session_id, &path, index, disposition) {
            Ok(updated) => report_file(&updated),
            Err(e) if e.is_retryable() => {
                println!("{}", style::error(&e.to_string()));
                offered.remove(&(path, index));
            }
            Err(e) => return Err(e).context("failed to record decision"),
        }
    }

    let session = active_session(engine)?;
    println!();
    if !session.is_fully_resolved() {
        println!(
            "{}",
            style::warn(&format!(
                "{} hunk(s) still undecided; run `gitward resolve` again when ready",
                session.unresolved_count()
            ))
        );
        engine.pause(&session_id).context("failed to pause session")?;
        return Ok(());
    }

    let conclude = Confirm::new()
        .with_prompt(format!("Every hunk is decided. Conclude the {} now?", session.kind))
        .default(true)
        .interact()?;
    if conclude {
        finalize(engine, &session)?;
    } else {
        println!("Run `gitward finalize` when ready.");
    }
    Ok(())
}
