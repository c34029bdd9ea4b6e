//! gitward command-line tool.
//!
//! Wraps mutating git commands so Background changes (generated
//! translations, build output and the like) are shelved around them, and
//! drives durable conflict sessions when an operation stops on conflicts.

mod session;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gitward_core::classifier::{ChangeClass, ClassificationRule};
use gitward_core::config::{project_key, GitwardConfig};
use gitward_core::errors::{CoreError, StateError};
use gitward_core::executor::{OperationResult, RestoreOutcome};
use gitward_core::git::{ChangeKind, GitBackend, GitCommand};
use gitward_core::Engine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// gitward command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "gitward",
    version,
    about = "Run git operations without losing background changes"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository to operate on.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration file.
    Validate,

    /// Show working-tree changes with their classes.
    Status {
        /// Print the classified entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a git command with Background changes shelved around it.
    Run {
        /// Short label recorded with the snapshot, e.g. "push".
        label: String,

        /// The git arguments, after `--`.
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Show what `run` would shelve, without changing anything.
    Plan {
        label: String,

        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Show the conflict session in progress, picking up a stopped operation.
    Resume,

    /// Resolve the conflict session interactively.
    Resolve,

    /// Record one decision for one hunk.
    Advance {
        /// Repository-relative path of the conflicted file.
        path: String,

        /// Zero-based hunk index.
        hunk: usize,

        /// ours, theirs, both, skip or manual.
        disposition: String,

        /// Replacement text for `manual`.
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Read replacement text for `manual` from a file.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Take one side for every undecided hunk.
    ResolveAll {
        /// ours or theirs.
        side: String,
    },

    /// Pause the conflict session.
    Pause,

    /// Conclude the operation once every hunk is decided.
    Finalize,

    /// Abort the operation and restore shelved changes.
    Abort {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Only drop an unreadable session record; the repository is not touched.
        #[arg(long)]
        discard: bool,
    },

    /// Manage retained snapshots of shelved Background changes.
    Snapshots {
        #[command(subcommand)]
        action: SnapshotsAction,
    },

    /// Manage classification rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Pair deleted and added files by content similarity.
    Renames {
        /// Stage the detected pairs.
        #[arg(long)]
        stage: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotsAction {
    /// List retained snapshots.
    List,
    /// Apply a retained snapshot's shelf and drop it.
    Restore {
        /// Snapshot ID.
        id: String,
    },
    /// Drop a snapshot's shelf. Its content is lost.
    Discard {
        /// Snapshot ID.
        id: String,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    /// List the effective rules, in priority order.
    List,
    /// Add a rule.
    Add {
        /// Glob matched against the path and the file name.
        pattern: String,

        #[arg(long, value_enum, default_value = "background")]
        class: ClassArg,

        #[arg(long, default_value = "")]
        rationale: String,

        /// Scope the rule to the current repository.
        #[arg(long)]
        project: bool,
    },
    /// Remove a rule by pattern.
    Remove {
        pattern: String,

        /// Remove from the current repository's rules.
        #[arg(long)]
        project: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ClassArg {
    Background,
    Foreground,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(p) => p.clone(),
        None => GitwardConfig::default_path().context("no config directory on this platform")?,
    };

    match cli.command {
        Commands::Init { force } => {
            init_logging("warn", cli.verbose);
            return cmd_init(&config_path, force);
        }
        Commands::Validate => {
            init_logging("warn", cli.verbose);
            return cmd_validate(&config_path);
        }
        _ => {}
    }

    let config =
        GitwardConfig::load_or_default(&config_path).context("failed to load configuration")?;
    init_logging(&config.engine.log_level, cli.verbose);
    tracing::debug!(path = %config_path.display(), rules = config.rules.len(), "configuration loaded");

    match cli.command {
        Commands::Rules { action } => cmd_rules(config, &config_path, &cli.repo, action),
        command => {
            let engine = Engine::open(&cli.repo, config).context("failed to open repository")?;
            match command {
                Commands::Status { json } => cmd_status(&engine, json),
                Commands::Run { label, args } => cmd_run(&engine, &label, args),
                Commands::Plan { label, args } => cmd_plan(&engine, &label, args),
                Commands::Resume => session::run_resume(&engine),
                Commands::Resolve => session::run_interactive(&engine),
                Commands::Advance {
                    path,
                    hunk,
                    disposition,
                    text,
                    file,
                } => session::run_advance(&engine, &path, hunk, &disposition, text, file),
                Commands::ResolveAll { side } => session::run_resolve_all(&engine, &side),
                Commands::Pause => session::run_pause(&engine),
                Commands::Finalize => session::run_finalize(&engine),
                Commands::Abort { yes, discard: true } => session::run_discard_record(&engine, yes),
                Commands::Abort { yes, discard: false } => session::run_abort(&engine, yes),
                Commands::Snapshots { action } => cmd_snapshots(&engine, action),
                Commands::Renames { stage } => cmd_renames(&engine, stage),
                Commands::Init { .. } | Commands::Validate | Commands::Rules { .. } => {
                    unreachable!("handled before opening the repository")
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "file already exists: {}. Use --force to overwrite it.",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }
    std::fs::write(output, GitwardConfig::default_template())
        .context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Add classification rules for your generated files");
    println!("  2. Validate with: gitward validate --config {}", output.display());
    println!("  3. Wrap an operation: gitward run push -- push origin main");
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        GitwardConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Log level           : {}", config.engine.log_level);
    println!("  Similarity threshold: {}", config.engine.similarity_threshold);
    println!("  Diff context        : {}", config.engine.diff_context);
    println!("  Git binary          : {}", config.engine.git_binary);
    println!(
        "  State directory     : {}",
        config
            .engine
            .state_dir
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "platform default".to_string())
    );
    println!("  Global rules        : {}", config.rules.len());
    println!("  Projects            : {}", config.projects.len());
    println!();
    println!("Configuration is valid.");
    Ok(())
}

fn cmd_rules(
    mut config: GitwardConfig,
    config_path: &Path,
    repo: &Path,
    action: RulesAction,
) -> Result<()> {
    let git_binary = config.engine.git_binary.clone();
    let repo_root = |required: bool| -> Result<Option<PathBuf>> {
        match GitBackend::open(repo, &git_binary) {
            Ok(backend) => Ok(Some(backend.root().to_path_buf())),
            Err(e) if required => Err(e).context("--project needs a repository"),
            Err(_) => Ok(None),
        }
    };

    match action {
        RulesAction::List => {
            let root = repo_root(false)?;
            let project_rules = root
                .as_deref()
                .and_then(|r| config.projects.get(&project_key(r)))
                .map(|p| p.rules.clone())
                .unwrap_or_default();

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["#", "Pattern", "Class", "Scope", "Rationale"]);
            let scoped = project_rules
                .iter()
                .map(|r| (r, "project"))
                .chain(config.rules.iter().map(|r| (r, "global")));
            for (i, (rule, scope)) in scoped.enumerate() {
                table.add_row(vec![
                    Cell::new(i + 1),
                    Cell::new(&rule.pattern),
                    Cell::new(rule.class),
                    Cell::new(scope),
                    Cell::new(&rule.rationale),
                ]);
            }
            println!("{}", table);
            println!("{}", style::dim("First match wins; unmatched paths are foreground."));
            Ok(())
        }
        RulesAction::Add {
            pattern,
            class,
            rationale,
            project,
        } => {
            let root = if project { repo_root(true)? } else { None };
            let rule = match class {
                ClassArg::Background => ClassificationRule::background(&pattern, &rationale),
                ClassArg::Foreground => ClassificationRule::foreground(&pattern, &rationale),
            };
            if !config.add_rule(root.as_deref(), rule) {
                println!("{}", style::warn(&format!("Rule '{}' already exists", pattern)));
                return Ok(());
            }
            config.validate().context("rule is not valid")?;
            config
                .save_to_file(config_path)
                .context("failed to save configuration")?;
            println!("{}", style::success(&format!("Added rule '{}'", pattern)));
            Ok(())
        }
        RulesAction::Remove { pattern, project } => {
            let root = if project { repo_root(true)? } else { None };
            if !config.remove_rule(root.as_deref(), &pattern) {
                anyhow::bail!("no rule with pattern '{}'", pattern);
            }
            config
                .save_to_file(config_path)
                .context("failed to save configuration")?;
            println!("{}", style::success(&format!("Removed rule '{}'", pattern)));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Working tree & wrapped operations
// ---------------------------------------------------------------------------

pub(crate) fn kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Modified => "modified",
        ChangeKind::Added => "added",
        ChangeKind::Deleted => "deleted",
        ChangeKind::Untracked => "untracked",
        ChangeKind::TypeChange => "type change",
        ChangeKind::Conflicted => "conflicted",
    }
}

fn class_label(class: ChangeClass) -> String {
    match class {
        ChangeClass::Background => style::background(),
        ChangeClass::Foreground => style::foreground(),
    }
}

fn cmd_status(engine: &Engine, json: bool) -> Result<()> {
    let entries = engine.status().context("failed to read working-tree status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!();
    println!(
        "{}",
        style::header(&format!("gitward · {}", engine.backend().root().display()))
    );
    println!();

    if entries.is_empty() {
        println!("{}", style::success("Working tree clean"));
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Path", "Change", "Class", "Rule"]);
        for e in &entries {
            table.add_row(vec![
                Cell::new(&e.path),
                Cell::new(kind_label(e.kind)),
                Cell::new(class_label(e.class)),
                Cell::new(e.rule.as_deref().unwrap_or("—")),
            ]);
        }
        println!("{}", table);
    }

    println!();
    match engine.session_record() {
        Ok(Some(s)) => println!(
            "{}",
            style::warn(&format!(
                "Conflict session {} ({}, {}): {} unresolved hunk(s) in {} file(s)",
                style::short_id(&s.session_id.to_string()),
                s.kind,
                s.status,
                s.unresolved_count(),
                s.files.len()
            ))
        ),
        Ok(None) => match engine
            .backend()
            .operation_in_progress()
            .context("failed to read repository state")?
        {
            Some(kind) => println!(
                "{}",
                style::warn(&format!(
                    "An unfinished {} is not tracked yet; run `gitward resume` to pick it up",
                    kind
                ))
            ),
            None => println!("  {}", style::dim("No conflict session")),
        },
        Err(CoreError::State(e @ StateError::SessionCorrupted { .. })) => {
            println!("{}", style::error(&e.to_string()))
        }
        Err(e) => return Err(e).context("failed to read conflict session"),
    }

    let snapshots = engine.snapshots().context("failed to read snapshots")?;
    if !snapshots.is_empty() {
        println!(
            "{}",
            style::warn(&format!(
                "{} retained snapshot(s); see `gitward snapshots list`",
                snapshots.len()
            ))
        );
    }
    println!();
    Ok(())
}

fn cmd_plan(engine: &Engine, label: &str, args: Vec<String>) -> Result<()> {
    let command = GitCommand::new(args).context("invalid git command")?;
    let plan = engine.plan(label, &command).context("failed to plan operation")?;

    println!();
    println!("{}", style::header(&format!("Plan: {} ({})", plan.label, plan.command)));
    if let Some(kind) = plan.kind {
        println!("  {}", style::dim(&format!("may stop for {} conflicts", kind)));
    }
    println!();

    if plan.background.is_empty() {
        println!("{}", style::success("Nothing to shelve"));
    } else {
        println!(
            "  Shelve {} background path(s){}:",
            plan.background.len(),
            if plan.include_untracked() {
                " (including untracked)"
            } else {
                ""
            }
        );
        for e in &plan.background {
            println!("    {} {}", style::dim(kind_label(e.kind)), e.path);
        }
    }
    if !plan.foreground.is_empty() {
        println!();
        println!("  Leave {} foreground path(s) for git:", plan.foreground.len());
        for e in &plan.foreground {
            println!("    {} {}", style::dim(kind_label(e.kind)), e.path);
        }
    }
    println!();
    Ok(())
}

fn cmd_run(engine: &Engine, label: &str, args: Vec<String>) -> Result<()> {
    let command = GitCommand::new(args).context("invalid git command")?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {}...", command));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = engine.execute(label, &command);
    spinner.finish_and_clear();

    match result.context("operation did not run")? {
        OperationResult::Completed { stdout, restore } => {
            if !stdout.trim().is_empty() {
                print!("{}", stdout);
            }
            println!("{}", style::success(&format!("{} completed", label)));
            report_restore(&restore);
            Ok(())
        }
        OperationResult::NeedsResolution {
            session_id,
            kind,
            conflicted,
            snapshot_id,
        } => {
            println!(
                "{}",
                style::warn(&format!(
                    "{} stopped on {} conflicts in {} file(s):",
                    label,
                    kind,
                    conflicted.len()
                ))
            );
            for path in &conflicted {
                println!("    {}", path);
            }
            if let Some(id) = snapshot_id {
                println!(
                    "  {}",
                    style::dim(&format!(
                        "background changes stay shelved as snapshot {} until the session ends",
                        id
                    ))
                );
            }
            println!();
            println!(
                "Session {}: run `gitward resolve` to continue.",
                style::short_id(&session_id.to_string())
            );
            Ok(())
        }
        OperationResult::Failed {
            reason,
            exit_code,
            restore,
        } => {
            report_restore(&restore);
            anyhow::bail!("{} failed (git exit code {}): {}", label, exit_code, reason)
        }
    }
}

pub(crate) fn report_restore(restore: &RestoreOutcome) {
    match restore {
        RestoreOutcome::NothingShelved => {}
        RestoreOutcome::Restored { auto_resolved, .. } => {
            println!("{}", style::success("Background changes restored"));
            for path in auto_resolved {
                println!(
                    "    {}",
                    style::dim(&format!("{} kept your shelved version", path))
                );
            }
        }
        RestoreOutcome::Retained {
            snapshot_id,
            reason,
            paths,
        } => {
            println!(
                "{}",
                style::warn(&format!(
                    "Background changes kept in snapshot {}: {}",
                    snapshot_id, reason
                ))
            );
            for path in paths {
                println!("    {}", path);
            }
            println!(
                "  {}",
                style::dim(&format!(
                    "recover with `gitward snapshots restore {}`",
                    snapshot_id
                ))
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots & renames
// ---------------------------------------------------------------------------

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id.trim()).with_context(|| format!("invalid snapshot id '{}'", id))
}

fn cmd_snapshots(engine: &Engine, action: SnapshotsAction) -> Result<()> {
    match action {
        SnapshotsAction::List => {
            let snapshots = engine.snapshots().context("failed to read snapshots")?;
            if snapshots.is_empty() {
                println!();
                println!("{}", style::success("No retained snapshots"));
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["ID", "Created", "Operation", "Paths", "Shelf"]);
            for s in &snapshots {
                let shelf = s
                    .shelf_commit
                    .as_deref()
                    .map(|c| c[..7.min(c.len())].to_string())
                    .unwrap_or_else(|| "—".to_string());
                table.add_row(vec![
                    Cell::new(s.id),
                    Cell::new(s.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
                    Cell::new(&s.operation_label),
                    Cell::new(s.path_list().join("\n")),
                    Cell::new(shelf),
                ]);
            }
            println!("{}", table);
            Ok(())
        }
        SnapshotsAction::Restore { id } => {
            let id = parse_id(&id)?;
            let restore = engine
                .restore_snapshot(&id)
                .context("failed to restore snapshot")?;
            report_restore(&restore);
            if restore.is_retained() {
                anyhow::bail!("snapshot {} could not be restored automatically", id);
            }
            Ok(())
        }
        SnapshotsAction::Discard { id, yes } => {
            let id = parse_id(&id)?;
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Drop snapshot {} and its shelved content for good?",
                        id
                    ))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            if engine
                .discard_snapshot(&id)
                .context("failed to discard snapshot")?
            {
                println!("{}", style::success(&format!("Snapshot {} discarded", id)));
            } else {
                println!("{}", style::warn(&format!("No snapshot {}", id)));
            }
            Ok(())
        }
    }
}

fn cmd_renames(engine: &Engine, stage: bool) -> Result<()> {
    let pairs = engine.detect_renames().context("failed to detect renames")?;
    if pairs.is_empty() {
        println!("{}", style::dim("No renames detected"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Deleted", "Added", "Similarity"]);
    for p in &pairs {
        table.add_row(vec![
            Cell::new(&p.deleted),
            Cell::new(&p.added),
            Cell::new(format!("{:.0}%", p.similarity * 100.0)),
        ]);
    }
    println!("{}", table);

    if stage {
        engine
            .stage_renames(&pairs)
            .context("failed to stage renames")?;
        println!("{}", style::success(&format!("Staged {} rename(s)", pairs.len())));
    }
    Ok(())
}
