use super::ownership_lock::reserve_supervisor_lock;
use super::watcher_worker::{build_worker_specs, run_watcher};
use super::worker_registry::apply_worker_event;
use super::{
    append_runtime_log, atomic_write_file, now_secs, RuntimeContext, RuntimeError, StatePaths,
    WorkerEvent, WorkerState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use super::worker_registry::WorkerHealth;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);
const STOP_FILE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub workers: BTreeMap<String, WorkerHealth>,
    pub last_error: Option<String>,
}

/// Runs every enabled watcher on its own thread until the stop file appears
/// or `stop` is set. The archive session is left open so the next start
/// resumes it.
pub fn run_supervisor(ctx: &RuntimeContext, stop: Arc<AtomicBool>) -> Result<(), RuntimeError> {
    let paths = &ctx.paths;
    let lock = reserve_supervisor_lock(ctx.store.locks())?;
    if let Some(previous) = lock.stale_override() {
        append_runtime_log(
            paths,
            "warn",
            "supervisor.recovered",
            &format!("previous supervisor pid {} did not shut down", previous.pid),
        );
    }
    let _ = fs::remove_file(paths.stop_signal_path());

    let specs = build_worker_specs(&ctx.settings);
    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        workers: BTreeMap::new(),
        last_error: None,
    };
    for spec in &specs {
        state
            .workers
            .insert(spec.kind.to_string(), WorkerHealth::default());
    }
    save_supervisor_state(paths, &state)?;
    append_runtime_log(
        paths,
        "info",
        "supervisor.started",
        &format!("pid={} workers={}", std::process::id(), specs.len()),
    );

    let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
    let mut handles = Vec::new();
    let mut active = BTreeSet::new();

    for spec in specs {
        active.insert(spec.kind.to_string());
        let tx = events_tx.clone();
        let stop_flag = Arc::clone(&stop);
        let worker_ctx = ctx.clone();
        handles.push(thread::spawn(move || {
            let result = run_watcher(&worker_ctx, spec.kind, spec.options, stop_flag, Some(&tx));
            if let Err(err) = result {
                let _ = tx.send(WorkerEvent::Error {
                    worker_id: spec.kind.to_string(),
                    at: now_secs(),
                    message: err.to_string(),
                    fatal: true,
                });
                let _ = tx.send(WorkerEvent::Stopped {
                    worker_id: spec.kind.to_string(),
                    at: now_secs(),
                });
            }
        }));
    }
    drop(events_tx);

    let lease_every = ctx.store.locks().policy().stale_after / 3;
    let mut last_lease = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            append_runtime_log(paths, "info", "supervisor.stop.signal", "stop file detected");
        }
        if last_lease.elapsed() >= lease_every {
            last_lease = Instant::now();
            if let Err(err) = lock.refresh() {
                tracing::warn!("failed to refresh supervisor lock: {err}");
            }
        }

        match events_rx.recv_timeout(STOP_FILE_POLL) {
            Ok(event) => handle_worker_event(paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stop.store(true, Ordering::Relaxed);

    let deadline = Instant::now() + SHUTDOWN_WAIT;
    while !active.is_empty() && Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(event) => handle_worker_event(paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        let message = format!(
            "shutdown timeout waiting for watchers: {}",
            active.iter().cloned().collect::<Vec<_>>().join(",")
        );
        state.last_error = Some(message.clone());
        for worker_id in &active {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.state = WorkerState::Error;
                worker.last_error = Some("shutdown timeout".to_string());
            }
        }
        append_runtime_log(paths, "warn", "supervisor.shutdown.timeout", &message);
    }

    for handle in handles {
        let _ = handle.join();
    }

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(paths, &state)?;

    let _ = fs::remove_file(paths.stop_signal_path());
    lock.release()?;
    append_runtime_log(paths, "info", "supervisor.stopped", "watchers stopped cleanly");
    Ok(())
}

/// Sets `stop` once the stop file shows up. Used by single-watcher runs,
/// which have no supervisor loop to notice it.
pub fn watch_stop_signal(paths: &StatePaths, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    let path = paths.stop_signal_path();
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            if path.exists() {
                stop.store(true, Ordering::Relaxed);
                break;
            }
            thread::sleep(STOP_FILE_POLL);
        }
    })
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

fn handle_worker_event(
    paths: &StatePaths,
    state: &mut SupervisorState,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) {
    if let Some(log) = apply_worker_event(&mut state.workers, active, event) {
        append_runtime_log(paths, log.level, log.event, &log.message);
    }
    if let Err(err) = save_supervisor_state(paths, state) {
        tracing::warn!("failed to save supervisor state: {err}");
    }
}
