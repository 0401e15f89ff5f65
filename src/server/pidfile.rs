// src/server/pidfile.rs

//! PID-file supervision for `start`, `stop` and `restart`.

use anyhow::{Context, Result, anyhow};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The result of asking a running relay to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(i32),
    NotRunning,
}

/// Reads the PID stored in `path`. A missing or unparsable file yields `None`.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Unable to read pid file {}", path.display())),
    }
}

/// True if a process with this PID exists.
pub fn is_running(pid: i32) -> bool {
    // Signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Fails if the PID file names a live process; removes it if it is stale.
pub fn ensure_not_running(path: &Path) -> Result<()> {
    match read_pid(path)? {
        Some(pid) if is_running(pid) => Err(anyhow!("Server already started (pid {pid})")),
        Some(pid) => {
            warn!("Removing stale pid file {} (pid {pid}).", path.display());
            remove(path)
        }
        None if path.exists() => remove(path),
        None => Ok(()),
    }
}

pub fn write_pid(path: &Path) -> Result<()> {
    fs::write(path, std::process::id().to_string())
        .with_context(|| format!("Unable to write pid to {}", path.display()))
}

pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Unable to remove pid file {}", path.display())),
    }
}

/// Sends SIGTERM to the process named in the PID file and waits for it to exit.
pub async fn stop(path: &Path) -> Result<StopOutcome> {
    let Some(pid) = read_pid(path)?.filter(|pid| is_running(*pid)) else {
        return Ok(StopOutcome::NotRunning);
    };

    info!("Sending SIGTERM to pid {pid}.");
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(anyhow!(
            "Unable to stop server: {}",
            io::Error::last_os_error()
        ));
    }

    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    while is_running(pid) {
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("Unable to stop server (pid {pid} is still running)"));
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
    debug!("Process {pid} exited.");
    remove(path)?;
    Ok(StopOutcome::Stopped(pid))
}
