use super::{append_runtime_log, now_secs, RuntimeError, StatePaths};
use crate::lock::{is_process_alive, FileLock, LockGuard};
use crate::runtime::supervisor::{load_supervisor_state, save_supervisor_state};
use std::fs;
#[cfg(unix)]
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

/// Lock resource held by the running supervisor for its whole lifetime.
pub const SUPERVISOR_LOCK: &str = "supervisor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    NotRunning,
    Running { pid: u32 },
    Stale,
}

#[derive(Debug, Clone)]
pub struct StopResult {
    pub pid: u32,
    pub forced: bool,
}

/// Takes the supervisor lock or reports who holds it.
pub fn reserve_supervisor_lock(locks: &FileLock) -> Result<LockGuard, RuntimeError> {
    match locks.try_acquire(SUPERVISOR_LOCK)? {
        Some(guard) => Ok(guard),
        None => Err(RuntimeError::AlreadyRunning {
            pid: locks
                .holder(SUPERVISOR_LOCK)
                .map(|holder| holder.pid)
                .unwrap_or_default(),
        }),
    }
}

pub fn supervisor_ownership_state(
    paths: &StatePaths,
    locks: &FileLock,
) -> Result<OwnershipState, RuntimeError> {
    if locks.is_held(SUPERVISOR_LOCK) {
        if let Some(holder) = locks.holder(SUPERVISOR_LOCK) {
            return Ok(OwnershipState::Running { pid: holder.pid });
        }
    }

    let state = load_supervisor_state(paths)?;
    if let Some(pid) = state.pid {
        if state.running && is_process_alive(pid) {
            return Ok(OwnershipState::Running { pid });
        }
    }
    if state.running || state.pid.is_some() || locks.holder(SUPERVISOR_LOCK).is_some() {
        return Ok(OwnershipState::Stale);
    }
    Ok(OwnershipState::NotRunning)
}

pub fn cleanup_stale_supervisor(paths: &StatePaths, locks: &FileLock) -> Result<(), RuntimeError> {
    let _ = fs::remove_file(locks.lock_path(SUPERVISOR_LOCK));
    let _ = fs::remove_file(paths.stop_signal_path());
    let mut state = load_supervisor_state(paths)?;
    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(paths, &state)
}

pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Asks the running supervisor to stop via the stop file, escalating to
/// TERM and then KILL if it is still alive after `timeout`.
pub fn stop_active_supervisor(
    paths: &StatePaths,
    locks: &FileLock,
    timeout: Duration,
) -> Result<StopResult, RuntimeError> {
    let pid = match supervisor_ownership_state(paths, locks)? {
        OwnershipState::Running { pid } => pid,
        OwnershipState::Stale => {
            cleanup_stale_supervisor(paths, locks)?;
            return Err(RuntimeError::NotRunning);
        }
        OwnershipState::NotRunning => return Err(RuntimeError::NotRunning),
    };

    signal_stop(paths)?;
    append_runtime_log(
        paths,
        "info",
        "supervisor.stop.requested",
        &format!("pid={pid}"),
    );

    // The supervisor may be a thread of this very process (tests, `supervise` in the foreground).
    if pid == std::process::id() {
        return Ok(StopResult { pid, forced: false });
    }

    let gone = |pid: u32, within: Duration| {
        let start = Instant::now();
        while is_process_alive(pid) && start.elapsed() < within {
            thread::sleep(Duration::from_millis(100));
        }
        !is_process_alive(pid)
    };

    let mut forced = false;
    if !gone(pid, timeout) {
        send_signal(pid, "-TERM");
        if !gone(pid, Duration::from_secs(2)) {
            forced = true;
            append_runtime_log(
                paths,
                "warn",
                "supervisor.stop.force_kill",
                &format!("pid={pid}"),
            );
            send_signal(pid, "-KILL");
            if !gone(pid, Duration::from_secs(2)) {
                append_runtime_log(
                    paths,
                    "error",
                    "supervisor.stop.failed",
                    &format!("pid={pid} remained alive after TERM/KILL"),
                );
                return Err(RuntimeError::StopFailedAlive { pid });
            }
        }
        cleanup_stale_supervisor(paths, locks)?;
    }
    Ok(StopResult { pid, forced })
}

fn send_signal(pid: u32, signal: &str) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
