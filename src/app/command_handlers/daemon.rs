use crate::app::command_support::{
    load_root_settings, open_context, or_none, state_paths, GlobalOptions,
};
use crate::archive::list_sessions;
use crate::lock::{FileLock, LockPolicy};
use crate::runtime::{
    cleanup_stale_supervisor, load_supervisor_state, loop_options, run_supervisor, run_watcher,
    stop_active_supervisor, supervisor_ownership_state, tail_runtime_log, watch_stop_signal,
    OwnershipState, RuntimeContext, RuntimeError,
};
use crate::sequencer::{parse_turn_record, TurnStatus};
use crate::store::records;
use crate::watchers::WatcherKind;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOG_LINES: usize = 20;

pub fn cmd_status(options: &GlobalOptions) -> Result<String, String> {
    let ctx = open_context(options)?;
    let mut lines = vec![format!("state_root={}", ctx.paths.root.display())];
    lines.extend(gate_lines(&ctx)?);
    lines.extend(turn_lines(&ctx)?);
    lines.extend(automation_lines(&ctx)?);
    lines.extend(archive_lines(&ctx)?);
    lines.extend(supervisor_lines(&ctx)?);
    Ok(lines.join("\n"))
}

fn gate_lines(ctx: &RuntimeContext) -> Result<Vec<String>, String> {
    let status = ctx.gate().status().map_err(|e| e.to_string())?;
    let mut lines = vec![
        format!("gate.state={}", if status.is_idle() { "idle" } else { "busy" }),
        format!("gate.owner={}", or_none(status.owner.as_deref())),
        format!("gate.trigger={}", or_none(status.trigger.as_deref())),
    ];
    if status.is_orphaned() {
        lines.push("gate.orphaned=true (run `jobloop reset-gate`)".to_string());
    }
    Ok(lines)
}

fn turn_lines(ctx: &RuntimeContext) -> Result<Vec<String>, String> {
    let Some(raw) = ctx
        .store
        .read(records::TURN_RECORD)
        .map_err(|e| e.to_string())?
    else {
        return Ok(vec!["turn.status=none".to_string()]);
    };
    let turn = parse_turn_record(&raw);
    let status = match &turn.status {
        TurnStatus::InProgress => "in_progress".to_string(),
        TurnStatus::Complete => "complete".to_string(),
        TurnStatus::Incomplete(reason) => format!("incomplete ({reason})"),
    };
    Ok(vec![
        format!("turn.status={status}"),
        format!(
            "turn.jobs={}",
            turn.jobs
                .iter()
                .map(|segment| segment.name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        ),
    ])
}

fn automation_lines(ctx: &RuntimeContext) -> Result<Vec<String>, String> {
    let mut lines = Vec::new();
    match ctx.cycles.active().map_err(|e| e.to_string())? {
        Some(active) => {
            lines.push(format!("cycle.name={}", active.name));
            lines.push(format!("cycle.status={}", active.status.as_str()));
            lines.push(format!("cycle.step={}", active.current_step));
            lines.push(format!("cycle.rounds={}", active.rounds));
            if let Some(error) = active.last_error {
                lines.push(format!("cycle.last_error={error}"));
            }
        }
        None => lines.push("cycle.name=none".to_string()),
    }
    let queued = ctx.queue.pending().map_err(|e| e.to_string())?;
    lines.push(format!("queue.pending={}", queued.len()));
    let unfired = ctx
        .schedules
        .list()
        .map_err(|e| e.to_string())?
        .into_iter()
        .filter(|entry| entry.fired_at.is_none())
        .count();
    lines.push(format!("schedule.pending={unfired}"));
    Ok(lines)
}

fn archive_lines(ctx: &RuntimeContext) -> Result<Vec<String>, String> {
    let enabled = ctx.inbox.enabled().map_err(|e| e.to_string())?;
    let pending = ctx.inbox.pending().map_err(|e| e.to_string())?;
    let sessions = list_sessions(&ctx.paths.archive_dir()).map_err(|e| e.to_string())?;
    let open = sessions.iter().find(|session| session.meta.is_open());
    Ok(vec![
        format!("archive.enabled={enabled}"),
        format!("archive.pending={}", pending.len()),
        format!("archive.sessions={}", sessions.len()),
        format!(
            "archive.open_session={}",
            or_none(open.map(|session| session.meta.id.as_str()))
        ),
    ])
}

fn supervisor_lines(ctx: &RuntimeContext) -> Result<Vec<String>, String> {
    let locks = ctx.store.locks();
    let ownership = supervisor_ownership_state(&ctx.paths, locks).map_err(|e| e.to_string())?;
    let label = match ownership {
        OwnershipState::Running { .. } => "running",
        OwnershipState::Stale => {
            cleanup_stale_supervisor(&ctx.paths, locks).map_err(|e| e.to_string())?;
            "stale"
        }
        OwnershipState::NotRunning => "not_running",
    };
    let state = load_supervisor_state(&ctx.paths).map_err(|e| e.to_string())?;
    let mut lines = vec![
        format!("supervisor={label}"),
        format!("supervisor.pid={}", or_none(state.pid)),
        format!("supervisor.last_error={}", or_none(state.last_error)),
    ];
    for (id, worker) in &state.workers {
        lines.push(format!("watcher:{id}.state={:?}", worker.state).to_lowercase());
        lines.push(format!(
            "watcher:{id}.last_heartbeat={}",
            or_none(worker.last_heartbeat)
        ));
        lines.push(format!("watcher:{id}.errors={}", worker.error_count));
        if let Some(error) = &worker.last_error {
            lines.push(format!("watcher:{id}.last_error={error}"));
        }
    }
    Ok(lines)
}

pub fn cmd_logs(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let limit = match args.first() {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("invalid line count `{raw}`"))?,
        None => DEFAULT_LOG_LINES,
    };
    let paths = state_paths(options)?;
    let lines = tail_runtime_log(&paths, limit);
    if lines.is_empty() {
        return Ok("no logs".to_string());
    }
    Ok(lines.join("\n"))
}

/// Runs one watcher in the foreground until the stop file appears.
pub fn cmd_watch(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let [kind] = args else {
        return Err(format!(
            "usage: watch <{}>",
            WatcherKind::ALL.map(WatcherKind::as_str).join("|")
        ));
    };
    let kind = WatcherKind::parse(kind)?;
    let ctx = open_context(options)?;
    let stop = Arc::new(AtomicBool::new(false));
    let monitor = watch_stop_signal(&ctx.paths, Arc::clone(&stop));
    let result = run_watcher(
        &ctx,
        kind,
        loop_options(&ctx.settings, kind),
        Arc::clone(&stop),
        None,
    );
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let _ = monitor.join();
    let report = result.map_err(|e| e.to_string())?;
    Ok(format!(
        "watcher stopped\nwatcher={kind}\nticks={}\napplied={}\nfailures={}",
        report.ticks, report.applied, report.failures
    ))
}

pub fn cmd_supervise(options: &GlobalOptions) -> Result<String, String> {
    let ctx = open_context(options)?;
    run_supervisor(&ctx, Arc::new(AtomicBool::new(false))).map_err(|e| e.to_string())?;
    Ok("supervisor exited".to_string())
}

pub fn cmd_stop(options: &GlobalOptions) -> Result<String, String> {
    let paths = state_paths(options)?;
    let settings = load_root_settings(&paths)?;
    let locks = FileLock::new(&paths, LockPolicy::from(&settings.locks));
    match stop_active_supervisor(&paths, &locks, Duration::from_secs(5)) {
        Ok(result) => Ok(format!("stopped\npid={}\nforced={}", result.pid, result.forced)),
        Err(RuntimeError::NotRunning) => Ok("stopped\nrunning=false".to_string()),
        Err(err) => Err(err.to_string()),
    }
}
