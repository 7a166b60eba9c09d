//! `sftd start|stop|restart`.
//!
//! The running daemon holds an exclusive lock on the pid file for its whole
//! lifetime; the file's content is only used by `stop` to find the process.

use anyhow::{bail, Context};
use sft_core::{Config, SftRuntime};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

/// How long `restart` waits for the old daemon to release the pid file.
const RESTART_TIMEOUT: Duration = Duration::from_secs(120);
const RESTART_POLL: Duration = Duration::from_millis(500);

pub async fn start(config: &Config) -> anyhow::Result<()> {
    let pid_path = &config.daemon.pid_file;
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(pid_path)
        .with_context(|| format!("cannot open pid file {}", pid_path.display()))?;

    let mut lock = fd_lock::RwLock::new(file);
    let mut guard = match lock.try_write() {
        Ok(guard) => guard,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            bail!(
                "sftd is already running (pid file {} is locked)",
                pid_path.display()
            )
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot lock {}", pid_path.display()));
        }
    };
    guard.set_len(0)?;
    writeln!(guard, "{}", std::process::id())?;
    guard.flush()?;

    let runtime = SftRuntime::new(config)?;
    tracing::info!(
        pid = std::process::id(),
        workers = config.scheduler.workers,
        database = %config.database_path().display(),
        "sftd started"
    );
    println!("✓ sftd running (pid {})", std::process::id());

    let scheduler = runtime.scheduler.clone();
    let mut runner = tokio::spawn(async move { scheduler.run().await });

    let stop_signal = tokio::select! {
        result = wait_for_stop_signal() => Some(result),
        result = &mut runner => {
            if let Err(e) = result {
                tracing::error!("Scheduler task failed: {}", e);
            }
            None
        }
    };
    if let Some(result) = stop_signal {
        result.context("cannot install signal handlers")?;
        tracing::info!("Stop signal received, finishing in-flight runs");
        runtime.scheduler.shutdown();
        if let Err(e) = runner.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
    }

    let metrics = runtime.scheduler.metrics();
    tracing::info!(
        cycles = metrics.cycles,
        runs = metrics.runs_completed,
        panicked = metrics.runs_panicked,
        "sftd stopped"
    );

    guard.set_len(0)?;
    drop(guard);
    let _ = fs::remove_file(pid_path);
    Ok(())
}

async fn wait_for_stop_signal() -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Send SIGTERM to the daemon named in the pid file.
///
/// Returns the pid that was signalled, or `None` when no daemon is running.
pub fn stop(config: &Config) -> anyhow::Result<Option<libc::pid_t>> {
    let pid_path = &config.daemon.pid_file;
    let text = match fs::read_to_string(pid_path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("sftd is not running");
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read {}", pid_path.display()));
        }
    };
    let Some(pid) = parse_pid(&text)? else {
        println!("sftd is not running");
        return Ok(None);
    };

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            println!("sftd is not running (stale pid {})", pid);
            return Ok(None);
        }
        return Err(err).with_context(|| format!("cannot signal pid {}", pid));
    }
    println!("✓ Sent stop signal to sftd (pid {})", pid);
    Ok(Some(pid))
}

pub async fn restart(config: &Config) -> anyhow::Result<()> {
    if stop(config)?.is_some() {
        let deadline = tokio::time::Instant::now() + RESTART_TIMEOUT;
        while !lock_released(&config.daemon.pid_file)? {
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "sftd did not stop within {}s",
                    RESTART_TIMEOUT.as_secs()
                );
            }
            tokio::time::sleep(RESTART_POLL).await;
        }
    }
    start(config).await
}

fn parse_pid(text: &str) -> anyhow::Result<Option<libc::pid_t>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let pid = text
        .parse::<libc::pid_t>()
        .with_context(|| format!("invalid pid file content '{}'", text))?;
    if pid <= 0 {
        bail!("invalid pid {}", pid);
    }
    Ok(Some(pid))
}

fn lock_released(path: &Path) -> anyhow::Result<bool> {
    let file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e).with_context(|| format!("cannot open {}", path.display())),
    };
    let mut lock = fd_lock::RwLock::new(file);
    let released = lock.try_write().is_ok();
    Ok(released)
}
