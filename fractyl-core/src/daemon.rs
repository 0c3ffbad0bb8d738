//! Background snapshot daemon
//!
//! A forked child that runs the commit pipeline on a fixed interval.
//! Lifecycle is PID-file based: `start` refuses while the recorded PID is
//! live, `status` purges a stale file, `stop` escalates SIGTERM -> SIGKILL.
//!
//! Shutdown is cooperative: the SIGTERM/SIGINT handler's only job is to
//! store into a shared atomic flag, and the interval sleep runs in 10-second
//! slices so shutdown latency stays bounded. A tick that cannot take the
//! repository lock skips the period; per-tick errors never exit the loop.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::commit::{self, CommitOptions, CommitOutcome};
use crate::error::FracError;
use crate::repo::Repository;
use crate::snapshot::TIMESTAMP_FORMAT;

/// Floor for the capture interval.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(180);

/// Sleep granularity; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_secs(10);

/// How long `stop` waits for a clean exit before SIGKILL.
const STOP_WAIT: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(100);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(i32),
    NotRunning,
}

/// Clamp a user-supplied interval (seconds) to the floor; None means the
/// default.
pub fn effective_interval(seconds: Option<u64>) -> Duration {
    match seconds {
        Some(secs) => Duration::from_secs(secs).max(MIN_INTERVAL),
        None => DEFAULT_INTERVAL,
    }
}

/// PID recorded in the pid file, if the file exists and parses.
pub fn read_pid(repo: &Repository) -> Result<Option<i32>> {
    let path = repo.daemon_pid_path();
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(contents.trim().parse::<i32>().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read pid file: {}", path.display())),
    }
}

/// Is the process alive? EPERM counts as alive (it exists, just not ours).
fn process_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Report the daemon's state, purging a stale pid file.
pub fn status(repo: &Repository) -> Result<DaemonStatus> {
    match read_pid(repo)? {
        Some(pid) if process_alive(pid) => Ok(DaemonStatus::Running(pid)),
        Some(_) => {
            let _ = fs::remove_file(repo.daemon_pid_path());
            Ok(DaemonStatus::NotRunning)
        }
        None => Ok(DaemonStatus::NotRunning),
    }
}

/// Fork the capture loop into the background. Returns the child PID.
pub fn start(repo: &Repository, interval: Duration) -> Result<i32> {
    if let Some(pid) = read_pid(repo)? {
        if process_alive(pid) {
            anyhow::bail!("daemon already running (pid {})", pid);
        }
        let _ = fs::remove_file(repo.daemon_pid_path());
    }

    let interval = interval.max(MIN_INTERVAL);
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("fork failed"),
        0 => run_child(repo, interval),
        child => Ok(child),
    }
}

/// Stop the daemon: SIGTERM, poll for exit, SIGKILL as a last resort.
/// Returns false when no daemon was running.
pub fn stop(repo: &Repository) -> Result<bool> {
    let Some(pid) = read_pid(repo)? else {
        return Ok(false);
    };
    if !process_alive(pid) {
        let _ = fs::remove_file(repo.daemon_pid_path());
        return Ok(false);
    }

    unsafe { libc::kill(pid, libc::SIGTERM) };
    let deadline = Instant::now() + STOP_WAIT;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            let _ = fs::remove_file(repo.daemon_pid_path());
            return Ok(true);
        }
        std::thread::sleep(STOP_POLL);
    }

    log::warn!("daemon (pid {}) ignored SIGTERM, sending SIGKILL", pid);
    unsafe { libc::kill(pid, libc::SIGKILL) };
    let _ = fs::remove_file(repo.daemon_pid_path());
    Ok(true)
}

pub fn restart(repo: &Repository, interval: Duration) -> Result<i32> {
    stop(repo)?;
    start(repo, interval)
}

/// The forked child: detach, redirect stdio to the daemon log, record the
/// PID, and loop until the shutdown flag flips. Never returns.
fn run_child(repo: &Repository, interval: Duration) -> ! {
    unsafe { libc::setsid() };

    if let Ok(log_file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(repo.daemon_log_path())
    {
        unsafe {
            libc::dup2(log_file.as_raw_fd(), libc::STDOUT_FILENO);
            libc::dup2(log_file.as_raw_fd(), libc::STDERR_FILENO);
        }
    }
    if let Ok(devnull) = File::open("/dev/null") {
        unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) };
    }

    let _ = fs::write(
        repo.daemon_pid_path(),
        format!("{}\n", std::process::id()),
    );

    let handler = handle_shutdown as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }

    println!(
        "daemon started (pid {}, interval {}s)",
        std::process::id(),
        interval.as_secs()
    );

    while !SHUTDOWN.load(Ordering::SeqCst) {
        tick(repo);

        let mut slept = Duration::ZERO;
        while slept < interval && !SHUTDOWN.load(Ordering::SeqCst) {
            let slice = SLEEP_SLICE.min(interval - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
    }

    println!("daemon shutting down");
    let _ = fs::remove_file(repo.daemon_pid_path());
    std::process::exit(0);
}

/// One capture attempt. Lock contention skips the period; any other error is
/// reported and the loop continues.
fn tick(repo: &Repository) {
    let options = CommitOptions {
        description: Some(format!(
            "Auto-snapshot {}",
            Utc::now().format(TIMESTAMP_FORMAT)
        )),
        // One immediate attempt; a held lock means a foreground operation is
        // in flight and this period is skipped.
        lock_timeout: Duration::ZERO,
        ..CommitOptions::default()
    };

    match commit::commit(repo, &options, None) {
        Ok(CommitOutcome::Created { snapshot, .. }) => {
            println!("captured {} ({})", snapshot.id, snapshot.description);
        }
        Ok(CommitOutcome::NoChanges) => {}
        Err(e) => match e.downcast_ref::<FracError>() {
            Some(FracError::LockBusy) | Some(FracError::LockTimeout(_)) => {
                println!("repository busy, skipping this period");
            }
            _ => eprintln!("snapshot attempt failed: {:#}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_interval() {
        assert_eq!(effective_interval(None), DEFAULT_INTERVAL);
        assert_eq!(effective_interval(Some(5)), MIN_INTERVAL);
        assert_eq!(effective_interval(Some(30)), Duration::from_secs(30));
        assert_eq!(effective_interval(Some(600)), Duration::from_secs(600));
    }

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        assert_eq!(read_pid(&repo).unwrap(), None);

        fs::write(repo.daemon_pid_path(), b"1234\n").unwrap();
        assert_eq!(read_pid(&repo).unwrap(), Some(1234));

        fs::write(repo.daemon_pid_path(), b"not a pid\n").unwrap();
        assert_eq!(read_pid(&repo).unwrap(), None);
    }

    #[test]
    fn test_process_alive_self() {
        assert!(process_alive(std::process::id() as i32));
    }

    #[test]
    fn test_status_purges_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        // i32::MAX is far beyond any real pid range.
        fs::write(repo.daemon_pid_path(), format!("{}\n", i32::MAX)).unwrap();
        assert_eq!(status(&repo).unwrap(), DaemonStatus::NotRunning);
        assert!(!repo.daemon_pid_path().exists());
    }

    #[test]
    fn test_start_refuses_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        // Our own (live) pid stands in for a running daemon.
        fs::write(
            repo.daemon_pid_path(),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        assert!(start(&repo, DEFAULT_INTERVAL).is_err());
    }

    #[test]
    fn test_stop_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(!stop(&repo).unwrap());
    }
}
