use jobloop::config::Settings;
use jobloop::cycles::CycleStatus;
use jobloop::jobs::QueuedJob;
use jobloop::model::{ModelBackend, ModelContext, ModelError};
use jobloop::runtime::{run_watcher, tail_runtime_log, RuntimeContext, RuntimeError, StatePaths};
use jobloop::sequencer::TurnRecord;
use jobloop::shared::ids::{CycleName, TriggerName};
use jobloop::store::{records, StoreError};
use jobloop::watchers::cycle::CycleAction;
use jobloop::watchers::{
    run_watcher_loop, tick, CycleWatcher, JobQueueWatcher, LoopOptions, TaskGoalWatcher,
    TickOutcome, TopicWatcher, Watcher, WatcherError, WatcherKind, WorkItemKind,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

struct EchoModel {
    triggers: Mutex<Vec<String>>,
}

impl EchoModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            triggers: Mutex::new(Vec::new()),
        })
    }

    fn triggers(&self) -> Vec<String> {
        self.triggers.lock().expect("triggers").clone()
    }
}

impl ModelBackend for EchoModel {
    fn generate(&self, _context: &ModelContext, trigger: &str) -> Result<String, ModelError> {
        self.triggers.lock().expect("triggers").push(trigger.to_string());
        Ok(format!("out:{trigger}"))
    }
}

fn open(model: Arc<dyn ModelBackend>) -> (tempfile::TempDir, RuntimeContext) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    let mut settings = Settings::default();
    settings.sequencer.busy_poll_ms = 10;
    settings.sequencer.busy_wait_timeout_seconds = 2;
    let ctx = RuntimeContext::open(paths, settings, model).expect("open");
    (dir, ctx)
}

fn cycle_watcher(ctx: &RuntimeContext) -> CycleWatcher {
    CycleWatcher::new(
        ctx.store.clone(),
        ctx.cycles.advancer(),
        ctx.sequencer.dispatcher().clone(),
        Arc::new(AtomicBool::new(false)),
    )
}

fn define_cycle(ctx: &RuntimeContext, name: &str, triggers: &[(&str, &str)], repeat: bool) {
    let editor = ctx.cycles.editor();
    editor
        .create(&CycleName::parse(name).expect("cycle name"), "prompt", "test cycle")
        .expect("create");
    for (trigger, prompt) in triggers {
        editor
            .add_trigger(name, &TriggerName::parse(trigger).expect("trigger name"), prompt)
            .expect("add trigger");
    }
    editor.set_loop(name, repeat).expect("loop");
}

fn write_turn(ctx: &RuntimeContext, user: &str, output: &str) {
    let mut record = TurnRecord::begin(user);
    record.push_job("reply_job", output);
    record.complete();
    ctx.store
        .write(records::TURN_RECORD, record.as_str())
        .expect("write turn record");
}

/// Fails its first `failures` polls, then applies until `applies` is reached.
struct FlakyWatcher {
    failures: u32,
    applies: u32,
    applied: u32,
}

impl Watcher for FlakyWatcher {
    type Action = ();

    fn kind(&self) -> WatcherKind {
        WatcherKind::Topic
    }

    fn poll(&mut self) -> Result<Option<()>, WatcherError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(WatcherError::Store(StoreError::InvalidName(
                "simulated".to_string(),
            )));
        }
        Ok(Some(()))
    }

    fn apply(&mut self, _action: ()) -> Result<(), WatcherError> {
        self.applied += 1;
        Ok(())
    }

    fn wants_exit(&self) -> bool {
        self.applied >= self.applies
    }
}

#[test]
fn watcher_loop_survives_failures_and_recovers() {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    let mut watcher = FlakyWatcher {
        failures: 3,
        applies: 2,
        applied: 0,
    };
    let options = LoopOptions {
        interval: Duration::from_millis(1),
        failure_threshold: 2,
        backoff_factor: 2,
    };
    let stop = AtomicBool::new(false);
    let report = run_watcher_loop(&mut watcher, &paths, options, &stop, None);

    assert_eq!(report.failures, 3);
    assert_eq!(report.applied, 2);
    assert_eq!(report.ticks, 5);
    let log = tail_runtime_log(&paths, 50).join("\n");
    assert!(log.contains("watcher.poll_failed"));
    assert!(log.contains("watcher.degraded"));
    assert!(log.contains("watcher.recovered"));
    assert!(log.contains("watcher.stopped"));
}

#[test]
fn watcher_loop_exits_immediately_when_stop_is_set() {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    let mut watcher = FlakyWatcher {
        failures: 0,
        applies: u32::MAX,
        applied: 0,
    };
    let stop = AtomicBool::new(true);
    let options = LoopOptions {
        interval: Duration::from_secs(60),
        failure_threshold: 1,
        backoff_factor: 1,
    };
    let report = run_watcher_loop(&mut watcher, &paths, options, &stop, None);
    assert_eq!(report.ticks, 0);
}

#[test]
fn cycle_runs_each_trigger_once_then_completes() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "morning", &[("plan", "Plan the day"), ("review", "Review")], false);
    ctx.cycles.editor().activate("morning").expect("activate");
    let mut watcher = cycle_watcher(&ctx);

    assert_eq!(tick(&mut watcher).expect("step 1"), TickOutcome::Applied);
    assert_eq!(ctx.cycles.active().expect("active").expect("some").current_step, 1);
    assert_eq!(tick(&mut watcher).expect("step 2"), TickOutcome::Applied);
    let active = ctx.cycles.active().expect("active").expect("some");
    assert_eq!(active.status, CycleStatus::Complete);
    assert_eq!(tick(&mut watcher).expect("done"), TickOutcome::Idle);

    assert_eq!(model.triggers(), vec!["Plan the day", "Review"]);
    let transcript = ctx
        .store
        .read(records::CYCLE_TRANSCRIPT)
        .expect("read")
        .expect("transcript");
    assert_eq!(transcript.lines().count(), 2);
    assert!(transcript.contains("out:Review"));
    assert!(ctx.gate().is_idle().expect("idle"));
}

#[test]
fn looping_cycle_wraps_to_the_first_trigger() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "loop", &[("a", "A"), ("b", "B")], true);
    ctx.cycles.editor().activate("loop").expect("activate");
    let mut watcher = cycle_watcher(&ctx);

    for _ in 0..3 {
        tick(&mut watcher).expect("tick");
    }
    let active = ctx.cycles.active().expect("active").expect("some");
    assert_eq!(active.status, CycleStatus::Running);
    assert_eq!(active.current_step, 1);
    assert_eq!(active.rounds, 1);
    assert_eq!(model.triggers(), vec!["A", "B", "A"]);
}

#[test]
fn cycle_waits_while_the_model_is_busy() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "wait", &[("a", "A")], false);
    ctx.cycles.editor().activate("wait").expect("activate");
    let mut watcher = cycle_watcher(&ctx);

    let claim = ctx
        .gate()
        .try_claim("interactive", "user turn")
        .expect("claim")
        .expect("granted");
    assert_eq!(watcher.poll().expect("poll"), None);
    claim.release().expect("release");
    assert!(matches!(
        watcher.poll().expect("poll"),
        Some(CycleAction::Dispatch(_))
    ));
}

#[test]
fn step_planned_before_a_restart_is_discarded() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "restart", &[("a", "A"), ("b", "B")], false);
    ctx.cycles.editor().activate("restart").expect("activate");
    let mut watcher = cycle_watcher(&ctx);

    let action = watcher.poll().expect("poll").expect("step");
    std::thread::sleep(Duration::from_millis(5));
    ctx.cycles.editor().activate("restart").expect("restart");
    watcher.apply(action).expect("apply");

    let active = ctx.cycles.active().expect("active").expect("some");
    assert_eq!(active.current_step, 0);
    assert_eq!(active.status, CycleStatus::Running);
}

#[test]
fn cycle_without_triggers_is_halted() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "empty", &[("only", "Only")], false);
    ctx.cycles.editor().activate("empty").expect("activate");
    ctx.cycles
        .editor()
        .delete_trigger("empty", "only")
        .expect("delete trigger");
    let mut watcher = cycle_watcher(&ctx);

    tick(&mut watcher).expect("tick");
    let active = ctx.cycles.active().expect("active").expect("some");
    assert_eq!(active.status, CycleStatus::Stopped);
    assert!(active.last_error.is_some());
    assert!(model.triggers().is_empty());
}

#[test]
fn topic_blocks_are_queued_once() {
    let (_dir, ctx) = open(EchoModel::new());
    write_turn(
        &ctx,
        "tell me about systems",
        "Sure.\n###TOPICS_START###\n- File locks\n- Atomic rename\n###TOPICS_END###",
    );
    let mut watcher = TopicWatcher::new(ctx.store.clone());

    assert_eq!(tick(&mut watcher).expect("tick"), TickOutcome::Applied);
    let pending: Vec<String> = ctx
        .topics()
        .pending()
        .expect("pending")
        .into_iter()
        .map(|topic| topic.name)
        .collect();
    assert_eq!(pending, vec!["File locks", "Atomic rename"]);
    assert_eq!(tick(&mut watcher).expect("again"), TickOutcome::Idle);

    assert!(ctx.topics().mark_indexed("file locks").expect("index"));
    assert_eq!(ctx.topics().pending().expect("pending").len(), 1);
    assert_eq!(ctx.topics().enqueue(&["File Locks".to_string()]).expect("enqueue").len(), 0);
}

#[test]
fn task_and_goal_blocks_become_work_items() {
    let (_dir, ctx) = open(EchoModel::new());
    write_turn(
        &ctx,
        "plan",
        "###TASK_START###\nWrite tests\ncover the lock\n###TASK_END###\n###GOAL_START###\nShip v1\n###GOAL_END###",
    );
    let mut watcher = TaskGoalWatcher::new(ctx.store.clone());

    assert_eq!(tick(&mut watcher).expect("tick"), TickOutcome::Applied);
    assert_eq!(tick(&mut watcher).expect("again"), TickOutcome::Idle);

    let tasks = ctx.work_items().list(WorkItemKind::Task).expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Write tests");
    assert_eq!(tasks[0].body, "cover the lock");
    let goals = ctx.work_items().list(WorkItemKind::Goal).expect("goals");
    assert_eq!(goals.len(), 1);
    assert_eq!(goals[0].title, "Ship v1");
}

#[test]
fn job_queue_runs_jobs_and_drops_unknown_ones() {
    let model = EchoModel::new();
    let (_dir, ctx) = open(model.clone());
    ctx.queue.push(QueuedJob::new("missing_job", "cli")).expect("push");
    ctx.queue.push(QueuedJob::new("summary_job", "cli")).expect("push");
    let mut watcher = JobQueueWatcher::new(ctx.queue.clone(), Arc::clone(&ctx.sequencer));

    assert_eq!(tick(&mut watcher).expect("unknown"), TickOutcome::Applied);
    assert_eq!(tick(&mut watcher).expect("summary"), TickOutcome::Applied);
    assert_eq!(tick(&mut watcher).expect("empty"), TickOutcome::Idle);

    assert_eq!(model.triggers(), vec!["Summarize the previous text."]);
    let log = tail_runtime_log(&ctx.paths, 50).join("\n");
    assert!(log.contains("job_queue.unknown_job_dropped"));
    assert!(log.contains("job_queue.completed"));
}

#[test]
fn a_second_instance_of_a_watcher_is_refused() {
    let (_dir, ctx) = open(EchoModel::new());
    let _held = ctx
        .store
        .locks()
        .acquire(&WatcherKind::Scheduler.instance_lock())
        .expect("hold instance lock");

    let err = run_watcher(
        &ctx,
        WatcherKind::Scheduler,
        LoopOptions {
            interval: Duration::from_millis(10),
            failure_threshold: 1,
            backoff_factor: 1,
        },
        Arc::new(AtomicBool::new(false)),
        None,
    )
    .expect_err("second instance");
    assert!(matches!(err, RuntimeError::WatcherAlreadyRunning { .. }));
}

#[test]
fn identical_blocks_in_a_later_turn_are_picked_up_again() {
    let (_dir, ctx) = open(EchoModel::new());
    let mut tasks = TaskGoalWatcher::new(ctx.store.clone());
    let mut topics = TopicWatcher::new(ctx.store.clone());
    let output = "###TASK_START###\nWater plants\n###TASK_END###\n###TOPICS_START###\nGardening\n###TOPICS_END###";

    write_turn(&ctx, "what now?", output);
    assert_eq!(tick(&mut tasks).expect("first turn"), TickOutcome::Applied);
    assert_eq!(tick(&mut topics).expect("first turn"), TickOutcome::Applied);
    assert_eq!(tick(&mut tasks).expect("same turn"), TickOutcome::Idle);

    write_turn(&ctx, "what now?", output);
    assert_eq!(tick(&mut tasks).expect("second turn"), TickOutcome::Applied);
    assert_eq!(tick(&mut topics).expect("second turn"), TickOutcome::Applied);

    let items = ctx.work_items().list(WorkItemKind::Task).expect("tasks");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.title == "Water plants"));
    let sightings = ctx
        .store
        .read(records::TOPIC_SEEN)
        .expect("read")
        .expect("audit trail");
    assert_eq!(sightings.lines().count(), 2);
    assert_eq!(ctx.topics().pending().expect("pending").len(), 1);
}

/// Tracks how many generations overlap.
#[derive(Default)]
struct OverlapModel {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ModelBackend for OverlapModel {
    fn generate(&self, _context: &ModelContext, trigger: &str) -> Result<String, ModelError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(15));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("out:{trigger}"))
    }
}

#[test]
fn turns_cycles_and_queued_jobs_never_reach_the_model_together() {
    let model = Arc::new(OverlapModel::default());
    let (_dir, ctx) = open(model.clone());
    define_cycle(&ctx, "busy", &[("a", "A"), ("b", "B"), ("c", "C")], false);
    ctx.cycles.editor().activate("busy").expect("activate");
    for _ in 0..3 {
        ctx.queue.push(QueuedJob::new("summary_job", "cli")).expect("push");
    }

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for n in 0..3 {
                let outcome = ctx.sequencer.run_turn(&format!("turn {n}")).expect("turn");
                assert!(outcome.is_complete());
            }
        });
        scope.spawn(|| {
            let mut watcher = cycle_watcher(&ctx);
            for _ in 0..500 {
                let _ = tick(&mut watcher);
                let active = ctx.cycles.active().expect("active").expect("some");
                if active.status == CycleStatus::Complete {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        scope.spawn(|| {
            let mut watcher = JobQueueWatcher::new(ctx.queue.clone(), Arc::clone(&ctx.sequencer));
            for _ in 0..500 {
                let _ = tick(&mut watcher);
                if ctx.queue.pending().expect("pending").is_empty() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        });
    });

    assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(model.calls.load(Ordering::SeqCst), 9);
    let active = ctx.cycles.active().expect("active").expect("some");
    assert_eq!(active.status, CycleStatus::Complete);
    assert!(ctx.gate().is_idle().expect("idle"));
}
