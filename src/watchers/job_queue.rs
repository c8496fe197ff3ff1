use super::{Watcher, WatcherError, WatcherKind};
use crate::jobs::{JobError, JobQueue, QueuedJob};
use crate::runtime::append_runtime_log;
use crate::sequencer::{Sequencer, SequencerError};
use std::sync::Arc;

/// Runs queued jobs one at a time, oldest first, whenever the model is idle.
pub struct JobQueueWatcher {
    queue: JobQueue,
    sequencer: Arc<Sequencer>,
}

impl JobQueueWatcher {
    pub fn new(queue: JobQueue, sequencer: Arc<Sequencer>) -> Self {
        Self { queue, sequencer }
    }
}

impl Watcher for JobQueueWatcher {
    type Action = QueuedJob;

    fn kind(&self) -> WatcherKind {
        WatcherKind::JobQueue
    }

    fn poll(&mut self) -> Result<Option<QueuedJob>, WatcherError> {
        if !self.sequencer.dispatcher().gate().is_idle()? {
            return Ok(None);
        }
        Ok(self.queue.peek()?)
    }

    fn apply(&mut self, _peeked: QueuedJob) -> Result<(), WatcherError> {
        // Another consumer may have taken the peeked job; run whatever is first now.
        let Some(job) = self.queue.pop()? else {
            return Ok(());
        };
        let paths = self.sequencer.dispatcher().paths();
        match self.sequencer.run_queued(&job) {
            Ok(output) => {
                append_runtime_log(
                    paths,
                    "info",
                    "job_queue.completed",
                    &format!(
                        "job={} source={} chars={}",
                        job.name,
                        job.source,
                        output.chars().count()
                    ),
                );
                Ok(())
            }
            Err(SequencerError::Jobs(JobError::Unknown(name))) => {
                append_runtime_log(
                    paths,
                    "warn",
                    "job_queue.unknown_job_dropped",
                    &format!("job={name} source={}", job.source),
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
