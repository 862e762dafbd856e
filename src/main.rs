use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use file_control::{
    cli::{Cli, Commands, OutputFormat},
    diff::DiffAlgorithmType,
    engine::{EngineHandle, Reply},
    ChangeKind, CommitRef, Condition, EngineEvent, RestoreRequest, Snapshot, SnapshotEngine,
    SnapshotKind,
};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const BLUE: &str = "\x1b[34m";
const RESET: &str = "\x1b[0m";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();
    let config = cli.to_config()?;

    let watch_path = cli.get_watch_path();
    tracing::info!("Starting file-control on: {}", watch_path.display());

    let engine = SnapshotEngine::start(&watch_path, config)
        .await
        .with_context(|| format!("Failed to open {}", watch_path.display()))?;
    let handle = engine.handle();

    let result = match cli.command() {
        Commands::Watch => run_watch_mode(&handle, &cli).await,
        Commands::History { file, since, until } => {
            let file = file.map(|f| cli.resolve_file(&f));
            run_history(&handle, &cli, file, since, until).await
        }
        Commands::Show {
            file,
            commit,
            algorithm,
        } => run_show(&handle, &cli, cli.resolve_file(&file), &commit, algorithm).await,
        Commands::Restore { files, to, all } => {
            let files = files.iter().map(|f| cli.resolve_file(f)).collect();
            run_restore(&handle, &cli, files, &to, all).await
        }
        Commands::Status => run_status(&handle, &cli).await,
        Commands::Rebuild => run_rebuild(&handle, &cli).await,
    };

    engine.shutdown().await?;
    result
}

async fn reply<T>(reply: Reply<T>) -> Result<T> {
    reply.await.map_err(|_| anyhow!("Engine stopped before answering"))
}

fn parse_commit(text: &str) -> Result<CommitRef> {
    text.parse::<CommitRef>().map_err(|err| anyhow!(err))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn paint(cli: &Cli, color: &str, text: &str) -> String {
    if cli.no_color {
        text.to_string()
    } else {
        format!("{}{}{}", color, text, RESET)
    }
}

async fn run_watch_mode(handle: &EngineHandle, cli: &Cli) -> Result<()> {
    let mut events = handle.subscribe();

    if matches!(cli.output, OutputFormat::Text) {
        println!("Watching: {}", handle.root().display());
        if handle.is_paused() {
            println!("Automatic snapshots are paused");
        }
        println!("Type 'pause' or 'resume' to toggle snapshots, Ctrl+C to quit");
        println!("---");
    }
    spawn_console_commands(handle.clone());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Ok(event)) => match cli.output {
                OutputFormat::Json => print_json(&event)?,
                OutputFormat::Text => print_text_event(&event, cli),
            },
            Ok(Err(RecvError::Lagged(missed))) => {
                tracing::warn!("Display fell behind, {} events skipped", missed);
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => continue,
        }
    }

    Ok(())
}

/// Read `pause` / `resume` lines from stdin on a plain thread.
fn spawn_console_commands(handle: EngineHandle) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "pause" | "p" => handle.pause(),
                "resume" | "r" => handle.resume(),
                "" => {}
                other => eprintln!("Unknown command '{}': use pause or resume", other),
            }
        }
    });
}

fn print_text_event(event: &EngineEvent, cli: &Cli) {
    match event {
        EngineEvent::SnapshotCreated(snapshot) => {
            let time_str = snapshot.timestamp.format("%H:%M:%S");
            let label = paint(cli, GREEN, "SNAPSHOT");
            println!(
                "[{}] {} {} {}",
                time_str,
                label,
                snapshot.commit.short(),
                snapshot.message
            );
            for change in &snapshot.changes {
                println!("  {}", describe_change(&change.kind, &change.path, cli));
            }
        }
        EngineEvent::Condition(condition) => {
            let (color, name) = match condition {
                Condition::WatchUnavailable { .. } => (RED, "UNAVAILABLE"),
                Condition::WatchRecovered { .. } => (GREEN, "RECOVERED"),
                Condition::SnapshotFailed { .. } => (RED, "FAILED"),
                Condition::SnapshotUnresolvable { .. } => (RED, "UNRESOLVABLE"),
                Condition::Backpressure { .. } => (YELLOW, "BEHIND"),
            };
            let time_str = chrono::Local::now().format("%H:%M:%S");
            println!("[{}] {} {}", time_str, paint(cli, color, name), condition);
        }
    }
}

fn describe_change(kind: &ChangeKind, path: &std::path::Path, cli: &Cli) -> String {
    match kind {
        ChangeKind::Added => format!("{} {}", paint(cli, GREEN, "A"), path.display()),
        ChangeKind::Modified => format!("{} {}", paint(cli, YELLOW, "M"), path.display()),
        ChangeKind::Deleted => format!("{} {}", paint(cli, RED, "D"), path.display()),
        ChangeKind::Renamed { from } => format!(
            "{} {} -> {}",
            paint(cli, BLUE, "R"),
            from.display(),
            path.display()
        ),
    }
}

fn print_snapshot_line(snapshot: &Snapshot, cli: &Cli, number: Option<usize>) {
    let when = snapshot
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S");
    let kind = match snapshot.kind {
        SnapshotKind::Auto => String::new(),
        other => format!(" {}", paint(cli, BLUE, &format!("[{}]", other.as_str()))),
    };
    let prefix = number.map(|n| format!("#{:<4}", n)).unwrap_or_default();
    println!(
        "{}{} {}{} {}",
        prefix,
        paint(cli, YELLOW, snapshot.commit.short()),
        when,
        kind,
        snapshot.message
    );
}

async fn run_history(
    handle: &EngineHandle,
    cli: &Cli,
    file: Option<PathBuf>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    let in_window = |snapshot: &Snapshot| {
        since.map_or(true, |s| snapshot.timestamp >= s)
            && until.map_or(true, |u| snapshot.timestamp <= u)
    };

    match file {
        Some(file) => {
            let versions = reply(handle.versions(&file)).await?;
            let versions: Vec<_> = versions
                .into_iter()
                .filter(|v| in_window(&v.snapshot))
                .collect();
            match cli.output {
                OutputFormat::Json => print_json(&versions)?,
                OutputFormat::Text => {
                    if versions.is_empty() {
                        println!("No versions of {}", file.display());
                    }
                    for version in versions.iter().rev() {
                        print_snapshot_line(&version.snapshot, cli, Some(version.number));
                    }
                }
            }
        }
        None => {
            let snapshots = match (since, until) {
                (None, None) => reply(handle.snapshots()).await?,
                (from, to) => {
                    let from = from.unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
                    let to = to.unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
                    reply(handle.in_range(from, to)).await?
                }
            };
            match cli.output {
                OutputFormat::Json => print_json(&snapshots)?,
                OutputFormat::Text => {
                    for snapshot in snapshots.iter().rev() {
                        print_snapshot_line(snapshot, cli, None);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_show(
    handle: &EngineHandle,
    cli: &Cli,
    file: PathBuf,
    commit: &str,
    algorithm: DiffAlgorithmType,
) -> Result<()> {
    let commit = parse_commit(commit)?;
    let preview = reply(handle.preview(&file, commit, algorithm)).await??;

    match cli.output {
        OutputFormat::Json => print_json(&preview)?,
        OutputFormat::Text => {
            println!(
                "{} at {}",
                preview.path.display(),
                paint(cli, YELLOW, preview.commit.short())
            );
            if preview.content.is_none() {
                println!("(file did not exist in this snapshot)");
            }
            if preview.diff.is_empty() {
                println!("Identical to the current file");
                return Ok(());
            }
            println!(
                "+{} -{}",
                preview.diff.stats.lines_added, preview.diff.stats.lines_removed
            );
            for line in preview.diff.unified.lines() {
                if cli.no_color {
                    println!("{}", line);
                } else if line.starts_with('+') {
                    println!("{}{}{}", GREEN, line, RESET);
                } else if line.starts_with('-') {
                    println!("{}{}{}", RED, line, RESET);
                } else {
                    println!("{}", line);
                }
            }
        }
    }
    Ok(())
}

async fn run_restore(
    handle: &EngineHandle,
    cli: &Cli,
    files: Vec<PathBuf>,
    to: &str,
    all: bool,
) -> Result<()> {
    let commit = parse_commit(to)?;
    let request = if all {
        RestoreRequest::tree(commit)
    } else {
        RestoreRequest::paths(files, commit)
    };

    let outcome = handle.submit_restore(request).outcome().await?;

    match cli.output {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Text => {
            println!(
                "Restored {} file(s), removed {} from {}",
                outcome.written.len(),
                outcome.removed.len(),
                paint(cli, YELLOW, outcome.target.short())
            );
            println!(
                "Undo with: file-control restore --to {} {}",
                outcome.pre_restore.short(),
                if all { "--all".to_string() } else { join_paths(handle, &outcome) }
            );
        }
    }
    Ok(())
}

fn join_paths(handle: &EngineHandle, outcome: &file_control::RestoreOutcome) -> String {
    outcome
        .written
        .iter()
        .chain(outcome.removed.iter())
        .map(|p| handle.root().join(p).display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_status(handle: &EngineHandle, cli: &Cli) -> Result<()> {
    let status = reply(handle.status()).await?;

    match cli.output {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Text => {
            println!("Root:      {}", status.root.display());
            println!("Backend:   {}", status.backend);
            println!(
                "Head:      {}",
                status.head.as_ref().map_or("-", |h| h.short())
            );
            println!("Snapshots: {}", status.snapshots);
            println!("Paused:    {}", status.paused);
            for queue in &status.queues {
                println!(
                    "Queue {:<10} {} / {}",
                    queue.name, queue.depth, queue.high_water_mark
                );
            }
            if status.pending.is_empty() {
                println!("No pending changes");
            }
            for pending in &status.pending {
                println!(
                    "{} {} ({} attempts: {})",
                    paint(cli, RED, "PENDING"),
                    pending.path.display(),
                    pending.attempts,
                    pending.last_error
                );
            }
        }
    }
    Ok(())
}

async fn run_rebuild(handle: &EngineHandle, cli: &Cli) -> Result<()> {
    let count = reply(handle.rebuild_history()).await??;
    match cli.output {
        OutputFormat::Json => print_json(&serde_json::json!({ "snapshots": count }))?,
        OutputFormat::Text => println!("Rebuilt history: {} snapshots", count),
    }
    Ok(())
}
