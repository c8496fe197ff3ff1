use super::{Watcher, WatcherError, WatcherKind};
use crate::jobs::{JobQueue, QueuedJob};
use crate::runtime::append_runtime_log;
use crate::schedule::ScheduleBook;
use crate::store::StateStore;
use chrono::{DateTime, Utc};

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireDue {
    pub now: DateTime<Utc>,
    pub ids: Vec<String>,
}

/// Moves due schedule entries into the job queue, each exactly once.
pub struct SchedulerWatcher {
    store: StateStore,
    book: ScheduleBook,
    queue: JobQueue,
    clock: Clock,
}

impl SchedulerWatcher {
    pub fn new(store: StateStore) -> Self {
        Self {
            book: ScheduleBook::new(store.clone()),
            queue: JobQueue::new(store.clone()),
            store,
            clock: Box::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

impl Watcher for SchedulerWatcher {
    type Action = FireDue;

    fn kind(&self) -> WatcherKind {
        WatcherKind::Scheduler
    }

    fn poll(&mut self) -> Result<Option<FireDue>, WatcherError> {
        let now = (self.clock)();
        let ids: Vec<String> = self
            .book
            .due(now)?
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(FireDue { now, ids }))
    }

    fn apply(&mut self, action: FireDue) -> Result<(), WatcherError> {
        // Marked first: a crash between the two steps loses the run rather than repeating it.
        let fired = self.book.mark_fired(&action.ids, action.now)?;
        for entry in fired {
            let depth = self
                .queue
                .push(QueuedJob::new(&entry.job_name, "scheduler"))?;
            append_runtime_log(
                self.store.paths(),
                "info",
                "schedule.fired",
                &format!(
                    "id={} job={} due_at={} queue_depth={depth}",
                    entry.id,
                    entry.job_name,
                    entry.due_at.to_rfc3339()
                ),
            );
        }
        Ok(())
    }
}
