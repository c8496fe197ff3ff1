use super::{Watcher, WatcherError};
use crate::config::{WatcherConfig, WatcherSettings};
use crate::runtime::{append_runtime_log, sleep_with_stop, StatePaths, WorkerEvent};
use crate::shared::time::now_secs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Consecutive failures before the loop backs off.
    pub failure_threshold: u32,
    pub backoff_factor: u32,
}

impl LoopOptions {
    pub fn from_settings(config: &WatcherConfig, settings: &WatcherSettings) -> Self {
        Self {
            interval: config.interval(),
            failure_threshold: settings.failure_threshold.max(1),
            backoff_factor: settings.error_backoff_factor.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Applied,
}

#[derive(Debug, thiserror::Error)]
pub enum TickFailure {
    #[error("poll failed: {0}")]
    Poll(#[source] WatcherError),
    #[error("apply failed: {0}")]
    Apply(#[source] WatcherError),
}

impl TickFailure {
    fn event(&self) -> &'static str {
        match self {
            Self::Poll(_) => "watcher.poll_failed",
            Self::Apply(_) => "watcher.apply_failed",
        }
    }
}

/// One poll and, when it finds work, one apply.
pub fn tick<W: Watcher>(watcher: &mut W) -> Result<TickOutcome, TickFailure> {
    let Some(action) = watcher.poll().map_err(TickFailure::Poll)? else {
        return Ok(TickOutcome::Idle);
    };
    watcher.apply(action).map_err(TickFailure::Apply)?;
    Ok(TickOutcome::Applied)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub ticks: u64,
    pub applied: u64,
    pub failures: u64,
}

/// Drives `watcher` until `stop` is set or the watcher asks to exit. Failures
/// never end the loop; after `failure_threshold` consecutive ones the watcher
/// is degraded and polls at `interval * backoff_factor` until a tick succeeds.
pub fn run_watcher_loop<W: Watcher>(
    watcher: &mut W,
    paths: &StatePaths,
    options: LoopOptions,
    stop: &AtomicBool,
    events: Option<&Sender<WorkerEvent>>,
) -> LoopReport {
    let worker_id = watcher.kind().as_str().to_string();
    let send = |event: WorkerEvent| {
        if let Some(events) = events {
            let _ = events.send(event);
        }
    };
    send(WorkerEvent::Started {
        worker_id: worker_id.clone(),
        at: now_secs(),
    });
    append_runtime_log(
        paths,
        "info",
        "watcher.started",
        &format!(
            "watcher={worker_id} interval_ms={}",
            options.interval.as_millis()
        ),
    );

    let mut report = LoopReport::default();
    let mut consecutive_failures = 0u32;
    let mut degraded = false;

    while !stop.load(Ordering::Relaxed) && !watcher.wants_exit() {
        report.ticks += 1;
        match tick(watcher) {
            Ok(outcome) => {
                if degraded {
                    append_runtime_log(
                        paths,
                        "info",
                        "watcher.recovered",
                        &format!("watcher={worker_id} after {consecutive_failures} failures"),
                    );
                }
                consecutive_failures = 0;
                degraded = false;
                if outcome == TickOutcome::Applied {
                    report.applied += 1;
                }
                send(WorkerEvent::Heartbeat {
                    worker_id: worker_id.clone(),
                    at: now_secs(),
                });
            }
            Err(failure) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                report.failures += 1;
                append_runtime_log(
                    paths,
                    "error",
                    failure.event(),
                    &format!("watcher={worker_id} error={failure}"),
                );
                send(WorkerEvent::Error {
                    worker_id: worker_id.clone(),
                    at: now_secs(),
                    message: failure.to_string(),
                    fatal: false,
                });
                if !degraded && consecutive_failures >= options.failure_threshold {
                    degraded = true;
                    append_runtime_log(
                        paths,
                        "warn",
                        "watcher.degraded",
                        &format!(
                            "watcher={worker_id} failures={consecutive_failures} backing off"
                        ),
                    );
                }
            }
        }

        if watcher.wants_exit() {
            break;
        }
        let wait = if degraded {
            options.interval.saturating_mul(options.backoff_factor)
        } else {
            options.interval
        };
        if !sleep_with_stop(stop, wait) {
            break;
        }
    }

    append_runtime_log(
        paths,
        "info",
        "watcher.stopped",
        &format!(
            "watcher={worker_id} ticks={} applied={} failures={}",
            report.ticks, report.applied, report.failures
        ),
    );
    send(WorkerEvent::Stopped {
        worker_id,
        at: now_secs(),
    });
    report
}
