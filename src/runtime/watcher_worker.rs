use super::{append_runtime_log, RuntimeContext, RuntimeError, WorkerEvent};
use crate::config::{Settings, WatcherConfig, WatcherSettings};
use crate::lock::{LockError, LockGuard};
use crate::watchers::{
    run_watcher_loop, CycleWatcher, JobQueueWatcher, LoopOptions, LoopReport, SchedulerWatcher,
    TaskGoalWatcher, TopicWatcher, VerbatimWatcher, Watcher, WatcherError, WatcherKind,
};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSpec {
    pub kind: WatcherKind,
    pub options: LoopOptions,
}

pub fn watcher_config(settings: &WatcherSettings, kind: WatcherKind) -> &WatcherConfig {
    match kind {
        WatcherKind::Cycle => &settings.cycle,
        WatcherKind::Scheduler => &settings.scheduler,
        WatcherKind::Topic => &settings.topic,
        WatcherKind::TaskGoal => &settings.task_goal,
        WatcherKind::Verbatim => &settings.verbatim,
        WatcherKind::JobQueue => &settings.job_queue,
    }
}

pub fn loop_options(settings: &Settings, kind: WatcherKind) -> LoopOptions {
    LoopOptions::from_settings(watcher_config(&settings.watchers, kind), &settings.watchers)
}

/// Enabled watchers, in a fixed order.
pub fn build_worker_specs(settings: &Settings) -> Vec<WatcherSpec> {
    WatcherKind::ALL
        .into_iter()
        .filter(|kind| watcher_config(&settings.watchers, *kind).enabled)
        .map(|kind| WatcherSpec {
            kind,
            options: loop_options(settings, kind),
        })
        .collect()
}

/// Runs one watcher until `stop` is set. Fails fast when another instance of
/// the same watcher already holds its instance lock.
pub fn run_watcher(
    ctx: &RuntimeContext,
    kind: WatcherKind,
    options: LoopOptions,
    stop: Arc<AtomicBool>,
    events: Option<&Sender<WorkerEvent>>,
) -> Result<LoopReport, RuntimeError> {
    let locks = ctx.store.locks();
    let Some(guard) = locks.try_acquire(&kind.instance_lock())? else {
        let pid = locks
            .holder(&kind.instance_lock())
            .map(|holder| holder.pid)
            .unwrap_or_default();
        return Err(RuntimeError::WatcherAlreadyRunning {
            kind: kind.to_string(),
            pid,
        });
    };
    let lease_every = locks.policy().stale_after / 3;

    let report = match kind {
        WatcherKind::Cycle => {
            let watcher = CycleWatcher::new(
                ctx.store.clone(),
                ctx.cycles.advancer(),
                ctx.sequencer.dispatcher().clone(),
                Arc::clone(&stop),
            );
            drive(ctx, watcher, guard, lease_every, options, &stop, events)
        }
        WatcherKind::Scheduler => drive(
            ctx,
            SchedulerWatcher::new(ctx.store.clone()),
            guard,
            lease_every,
            options,
            &stop,
            events,
        ),
        WatcherKind::Topic => drive(
            ctx,
            TopicWatcher::new(ctx.store.clone()),
            guard,
            lease_every,
            options,
            &stop,
            events,
        ),
        WatcherKind::TaskGoal => drive(
            ctx,
            TaskGoalWatcher::new(ctx.store.clone()),
            guard,
            lease_every,
            options,
            &stop,
            events,
        ),
        WatcherKind::Verbatim => drive(
            ctx,
            VerbatimWatcher::new(
                ctx.inbox.clone(),
                &ctx.paths,
                ctx.settings.archive.block_capacity,
            ),
            guard,
            lease_every,
            options,
            &stop,
            events,
        ),
        WatcherKind::JobQueue => drive(
            ctx,
            JobQueueWatcher::new(ctx.queue.clone(), Arc::clone(&ctx.sequencer)),
            guard,
            lease_every,
            options,
            &stop,
            events,
        ),
    };
    Ok(report)
}

fn drive<W: Watcher>(
    ctx: &RuntimeContext,
    watcher: W,
    guard: LockGuard,
    lease_every: Duration,
    options: LoopOptions,
    stop: &AtomicBool,
    events: Option<&Sender<WorkerEvent>>,
) -> LoopReport {
    let mut leased = Leased {
        inner: watcher,
        guard,
        every: lease_every,
        last_refresh: Instant::now(),
        lost: false,
        ctx,
    };
    let report = run_watcher_loop(&mut leased, &ctx.paths, options, stop, events);
    if let Err(err) = leased.guard.release() {
        tracing::warn!("failed to release watcher instance lock: {err}");
    }
    report
}

/// Keeps the instance lock fresh while the watcher runs, and stops the
/// watcher if the lock was taken over.
struct Leased<'a, W> {
    inner: W,
    guard: LockGuard,
    every: Duration,
    last_refresh: Instant,
    lost: bool,
    ctx: &'a RuntimeContext,
}

impl<W: Watcher> Leased<'_, W> {
    fn renew(&mut self) -> Result<(), LockError> {
        if self.last_refresh.elapsed() < self.every {
            return Ok(());
        }
        self.last_refresh = Instant::now();
        if !self.guard.refresh()? {
            self.lost = true;
            append_runtime_log(
                &self.ctx.paths,
                "error",
                "watcher.instance_lock_lost",
                &format!("watcher={}", self.inner.kind()),
            );
        }
        Ok(())
    }
}

impl<W: Watcher> Watcher for Leased<'_, W> {
    type Action = W::Action;

    fn kind(&self) -> WatcherKind {
        self.inner.kind()
    }

    fn poll(&mut self) -> Result<Option<W::Action>, WatcherError> {
        if let Err(err) = self.renew() {
            return Err(WatcherError::Store(err.into()));
        }
        if self.lost {
            return Ok(None);
        }
        self.inner.poll()
    }

    fn apply(&mut self, action: W::Action) -> Result<(), WatcherError> {
        self.inner.apply(action)
    }

    fn wants_exit(&self) -> bool {
        self.lost || self.inner.wants_exit()
    }
}
