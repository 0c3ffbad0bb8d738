//! frac - content-addressed snapshots of a working directory

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use fractyl_core::commit::{CommitOptions, CommitOutcome};
use fractyl_core::daemon::{self, DaemonStatus};
use fractyl_core::diff::{render_index_diff, DEFAULT_CONTEXT};
use fractyl_core::error::FracError;
use fractyl_core::index::Index;
use fractyl_core::object_store::ObjectStore;
use fractyl_core::restore::{restore, RestoreOptions};
use fractyl_core::scanner::ScanProgress;
use fractyl_core::snapshot::{Snapshot, TIMESTAMP_FORMAT};
use fractyl_core::store::{delete_snapshot, SnapshotStore};
use fractyl_core::Repository;

#[derive(Parser)]
#[command(name = "frac")]
#[command(about = "Content-addressed snapshots of a working directory")]
#[command(version = env!("FRACTYL_VERSION"))]
struct Cli {
    /// Verbose diagnostics
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a repository in the current directory
    Init,

    /// Capture a snapshot of the working tree (the default command)
    Snapshot {
        /// Snapshot description
        #[arg(short = 'm', long = "message")]
        message: Option<String>,
    },

    /// Restore the working tree to a snapshot
    Restore {
        /// Snapshot id, unique prefix, or -N for the N-th most recent
        #[arg(allow_hyphen_values = true)]
        id: String,
    },

    /// List snapshots on the current branch
    List,

    /// Delete a snapshot record (its blobs are retained)
    Delete {
        /// Snapshot id, unique prefix, or -N for the N-th most recent
        #[arg(allow_hyphen_values = true)]
        id: String,
    },

    /// Show the differences between two snapshots
    Diff {
        #[arg(allow_hyphen_values = true)]
        a: String,
        #[arg(allow_hyphen_values = true)]
        b: String,
    },

    /// Show one snapshot in detail
    Show {
        #[arg(allow_hyphen_values = true)]
        id: String,
    },

    /// Manage the background snapshot daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon
    Start {
        /// Capture interval in seconds (minimum 30, default 180)
        #[arg(short = 'i', long)]
        interval: Option<u64>,
    },
    /// Stop the daemon
    Stop,
    /// Report whether the daemon is running
    Status,
    /// Restart the daemon
    Restart {
        /// Capture interval in seconds (minimum 30, default 180)
        #[arg(short = 'i', long)]
        interval: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Option<Commands>) -> Result<()> {
    // A bare `frac` inside a repository captures a snapshot.
    match command.unwrap_or(Commands::Snapshot { message: None }) {
        Commands::Init => cmd_init(),
        Commands::Snapshot { message } => cmd_snapshot(message),
        Commands::Restore { id } => cmd_restore(&id),
        Commands::List => cmd_list(),
        Commands::Delete { id } => cmd_delete(&id),
        Commands::Diff { a, b } => cmd_diff(&a, &b),
        Commands::Show { id } => cmd_show(&id),
        Commands::Daemon { action } => cmd_daemon(action),
    }
}

fn report_error(e: &anyhow::Error) {
    if let Some(FracError::SnapshotAmbiguous { prefix, matches }) = e.downcast_ref::<FracError>()
    {
        eprintln!("error: snapshot prefix '{}' is ambiguous; matches:", prefix);
        for id in matches {
            eprintln!("  {}", id);
        }
        return;
    }
    eprintln!("error: {:#}", e);
}

fn open_repo() -> Result<Repository> {
    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    Repository::discover(&cwd)
}

fn cmd_init() -> Result<()> {
    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    let repo = Repository::init(&cwd)?;
    println!(
        "Initialized fractyl repository at {}",
        repo.root().display()
    );
    Ok(())
}

fn cmd_snapshot(message: Option<String>) -> Result<()> {
    let repo = open_repo()?;

    let progress = Arc::new(ScanProgress::default());
    let done = Arc::new(AtomicBool::new(false));
    let reporter = spawn_progress_reporter(Arc::clone(&progress), Arc::clone(&done));

    let options = CommitOptions {
        description: message,
        ..CommitOptions::default()
    };
    let outcome = fractyl_core::commit(&repo, &options, Some(&progress));

    done.store(true, Ordering::SeqCst);
    let _ = reporter.join();

    match outcome? {
        CommitOutcome::Created { snapshot, stats } => {
            println!(
                "Created snapshot {} ({})",
                short_id(&snapshot.id),
                snapshot.description
            );
            println!(
                "  {} unchanged, {} hashed, {} new, {} deleted, {} skipped",
                stats.unchanged, stats.hashed, stats.new_files, stats.deleted, stats.skipped
            );
        }
        CommitOutcome::NoChanges => println!("No changes detected"),
    }
    Ok(())
}

/// Short-lived observer thread: renders the scanner's shared counters as a
/// spinner until the commit finishes.
fn spawn_progress_reporter(
    progress: Arc<ScanProgress>,
    done: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}").expect("static spinner template"),
        );
        while !done.load(Ordering::SeqCst) {
            bar.set_message(format!(
                "scanning: {} checked, {} hashed, {} discovered",
                progress.statted.load(Ordering::Relaxed),
                progress.hashed.load(Ordering::Relaxed),
                progress.discovered.load(Ordering::Relaxed),
            ));
            bar.tick();
            std::thread::sleep(Duration::from_millis(100));
        }
        bar.finish_and_clear();
    })
}

fn cmd_restore(id: &str) -> Result<()> {
    let repo = open_repo()?;
    let summary = restore(&repo, id, &RestoreOptions::default())?;

    if let Some(safety) = &summary.safety_snapshot {
        println!("Captured safety snapshot {}", short_id(safety));
    }
    println!(
        "Restored snapshot {} ({} files, {} extraneous removed)",
        short_id(&summary.id),
        summary.restored,
        summary.pruned
    );
    Ok(())
}

fn cmd_list() -> Result<()> {
    let repo = open_repo()?;
    let branch = repo.current_branch();
    let store = SnapshotStore::open(&repo, &branch)?;
    let snapshots = store.list_chronological()?;

    if snapshots.is_empty() {
        println!("No snapshots on branch {}", branch);
        return Ok(());
    }

    let current = repo.read_current(&branch)?;
    let objects = ObjectStore::open(&repo);

    println!("Snapshots on branch {} ({}):", branch, snapshots.len());
    for snapshot in &snapshots {
        let marker = if current.as_deref() == Some(snapshot.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let files = match load_index(&objects, snapshot) {
            Ok(index) => index.len().to_string(),
            Err(_) => "?".to_string(),
        };
        println!(
            "{} {}  {}  {:>6} files  {}",
            marker,
            short_id(&snapshot.id),
            snapshot.timestamp.format(TIMESTAMP_FORMAT),
            files,
            snapshot.description
        );
    }
    Ok(())
}

fn cmd_delete(id: &str) -> Result<()> {
    let repo = open_repo()?;
    let deleted = delete_snapshot(&repo, id, None, Duration::from_secs(30))?;
    println!("Deleted snapshot {}", deleted);
    Ok(())
}

fn cmd_diff(a: &str, b: &str) -> Result<()> {
    let repo = open_repo()?;
    let branch = repo.current_branch();
    let store = SnapshotStore::open(&repo, &branch)?;
    let objects = ObjectStore::open(&repo);

    let snapshot_a = store.read(&store.resolve(a)?)?;
    let snapshot_b = store.read(&store.resolve(b)?)?;
    let index_a = load_index(&objects, &snapshot_a)?;
    let index_b = load_index(&objects, &snapshot_b)?;

    let rendered = render_index_diff(&objects, &index_a, &index_b, DEFAULT_CONTEXT)?;
    if rendered.is_empty() {
        println!(
            "No differences between {} and {}",
            short_id(&snapshot_a.id),
            short_id(&snapshot_b.id)
        );
    } else {
        print!("{}", rendered);
    }
    Ok(())
}

fn cmd_show(id: &str) -> Result<()> {
    let repo = open_repo()?;
    let branch = repo.current_branch();
    let store = SnapshotStore::open(&repo, &branch)?;
    let objects = ObjectStore::open(&repo);

    let snapshot = store.read(&store.resolve(id)?)?;

    println!("Snapshot {}", snapshot.id);
    println!("  description: {}", snapshot.description);
    println!(
        "  timestamp:   {}",
        snapshot.timestamp.format(TIMESTAMP_FORMAT)
    );
    match &snapshot.parent {
        Some(parent) => println!("  parent:      {}", parent),
        None => println!("  parent:      (root)"),
    }
    println!("  index hash:  {}", snapshot.index_hash);
    if let Some(git_branch) = &snapshot.git_branch {
        println!("  git branch:  {}", git_branch);
    }
    if let Some(git_commit) = &snapshot.git_commit {
        println!("  git commit:  {}", git_commit);
    }
    println!("  git dirty:   {}", if snapshot.git_dirty { "yes" } else { "no" });

    let index = load_index(&objects, &snapshot)?;
    let total: u64 = index.iter().map(|e| e.size).sum();
    println!("  files:       {} ({} bytes)", index.len(), total);
    Ok(())
}

fn cmd_daemon(action: DaemonAction) -> Result<()> {
    let repo = open_repo()?;
    match action {
        DaemonAction::Start { interval } => {
            let interval = daemon::effective_interval(interval);
            let pid = daemon::start(&repo, interval)?;
            println!(
                "Daemon started (pid {}, interval {}s)",
                pid,
                interval.as_secs()
            );
        }
        DaemonAction::Stop => {
            if daemon::stop(&repo)? {
                println!("Daemon stopped");
            } else {
                println!("Daemon not running");
            }
        }
        DaemonAction::Status => match daemon::status(&repo)? {
            DaemonStatus::Running(pid) => println!("Daemon running (pid {})", pid),
            DaemonStatus::NotRunning => println!("Daemon not running"),
        },
        DaemonAction::Restart { interval } => {
            let interval = daemon::effective_interval(interval);
            let pid = daemon::restart(&repo, interval)?;
            println!(
                "Daemon restarted (pid {}, interval {}s)",
                pid,
                interval.as_secs()
            );
        }
    }
    Ok(())
}

fn load_index(objects: &ObjectStore, snapshot: &Snapshot) -> Result<Index> {
    let bytes = objects.get(&snapshot.index_hash)?;
    Index::decode(&bytes)
        .with_context(|| format!("failed to parse index blob for snapshot {}", snapshot.id))
}

/// First 8 characters, enough to paste back as a prefix.
fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}
