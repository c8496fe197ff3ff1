//! Runs one user turn: the job sequence, in order, each job through the gate.

pub mod dispatch;
pub mod turn_record;

pub use dispatch::{DispatchError, DispatchRequest, Dispatcher};
pub use turn_record::{parse_turn_record, JobSegment, ParsedTurn, TurnRecord, TurnStatus};

use crate::archive::{ArchiveInbox, Pair};
use crate::jobs::{render_job_prompt, JobCatalog, JobDefinition, JobError, QueuedJob};
use crate::lock::LockError;
use crate::runtime::append_runtime_log;
use crate::shared::time::now_millis;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Lock held for the whole accumulation of one Turn Record.
pub const TURN_LOCK: &str = "turn";
const SEQUENCER_OWNER: &str = "sequencer";

#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("another turn is still in progress: {0}")]
    TurnBusy(#[source] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Jobs(#[from] JobError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("turn thread exited without reporting an outcome")]
    Aborted,
}

impl From<LockError> for SequencerError {
    fn from(err: LockError) -> Self {
        Self::TurnBusy(err)
    }
}

/// Why a turn stopped before its terminal job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    EmptySequence,
    UnknownJob { trigger: String },
    Dispatch { trigger: String, message: String },
    Cancelled { next_trigger: String },
}

impl StepFailure {
    pub fn reason(&self) -> String {
        match self {
            Self::EmptySequence => "job sequence is empty".to_string(),
            Self::UnknownJob { trigger } => format!("job `{trigger}` is not defined"),
            Self::Dispatch { trigger, message } => format!("`{trigger}` failed: {message}"),
            Self::Cancelled { next_trigger } => format!("cancelled before `{next_trigger}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub user_input: String,
    /// Terminal job output; only set when every job ran.
    pub reply: Option<String>,
    pub outputs: Vec<JobSegment>,
    pub failure: Option<StepFailure>,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(StepFailure::Cancelled { .. }))
    }

    /// What the user sees: the reply, or the partial accumulation tagged incomplete.
    pub fn display_text(&self) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let mut out = String::new();
        for segment in &self.outputs {
            out.push_str(&format!("[{}]\n{}\n\n", segment.name, segment.output));
        }
        let reason = self
            .failure
            .as_ref()
            .map(StepFailure::reason)
            .unwrap_or_default();
        out.push_str(&format!("[incomplete: {reason}]"));
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CancelRequest {
    requested_at_ms: i64,
    pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerOptions {
    /// How long `run_turn` waits for a turn already in progress.
    pub turn_wait: Duration,
}

impl From<&crate::config::SequencerSettings> for SequencerOptions {
    fn from(settings: &crate::config::SequencerSettings) -> Self {
        Self {
            turn_wait: Duration::from_secs(settings.turn_wait_timeout_seconds),
        }
    }
}

pub struct Sequencer {
    store: StateStore,
    jobs: JobCatalog,
    dispatcher: Dispatcher,
    archive: ArchiveInbox,
    options: SequencerOptions,
    cancel: Arc<AtomicBool>,
}

impl Sequencer {
    pub fn new(
        store: StateStore,
        dispatcher: Dispatcher,
        archive: ArchiveInbox,
        options: SequencerOptions,
    ) -> Self {
        Self {
            jobs: JobCatalog::new(store.clone()),
            store,
            dispatcher,
            archive,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn jobs(&self) -> &JobCatalog {
        &self.jobs
    }

    /// Asks the running turn (in this or another process) to stop at its next
    /// step boundary.
    pub fn cancel(&self) -> Result<(), SequencerError> {
        self.cancel.store(true, Ordering::SeqCst);
        request_cancel(&self.store)?;
        Ok(())
    }

    pub fn run_turn(&self, user_input: &str) -> Result<TurnOutcome, SequencerError> {
        let turn_lock = self
            .store
            .locks()
            .acquire_within(TURN_LOCK, self.options.turn_wait)?;
        let started_ms = now_millis();
        self.reset_cancel()?;

        let mut record = TurnRecord::begin(user_input);
        self.store.write(records::TURN_RECORD, record.as_str())?;
        append_runtime_log(
            self.store.paths(),
            "info",
            "turn.started",
            &format!("input_chars={}", user_input.chars().count()),
        );

        let sequence = self.jobs.load_sequence()?;
        let catalog = self.jobs.load_all()?;
        let mut outcome = TurnOutcome {
            user_input: user_input.to_string(),
            reply: None,
            outputs: Vec::new(),
            failure: None,
        };
        if sequence.is_empty() {
            outcome.failure = Some(StepFailure::EmptySequence);
        }

        let should_stop = || self.cancel_requested(started_ms);
        let lease_every = self.store.locks().policy().stale_after / 3;
        turn_lock.keep_alive(lease_every, || -> Result<(), SequencerError> {
            for trigger in &sequence {
                if should_stop() {
                    outcome.failure = Some(StepFailure::Cancelled {
                        next_trigger: trigger.clone(),
                    });
                    break;
                }
                let Some(definition) = catalog.get(trigger) else {
                    outcome.failure = Some(StepFailure::UnknownJob {
                        trigger: trigger.clone(),
                    });
                    break;
                };
                let request = DispatchRequest {
                    owner: SEQUENCER_OWNER,
                    label: trigger,
                    trigger: definition.trigger_text(trigger),
                    instructions: Some(render_job_prompt(trigger, definition, &BTreeMap::new())),
                    transcript: record.as_str().to_string(),
                };
                match self.dispatcher.dispatch(request, &should_stop) {
                    Ok(output) => {
                        record.push_job(trigger, &output);
                        self.store.write(records::TURN_RECORD, record.as_str())?;
                        self.route_output(trigger, definition, &output);
                        outcome.outputs.push(JobSegment {
                            name: trigger.clone(),
                            output,
                        });
                    }
                    Err(err) if err.is_cancelled() => {
                        outcome.failure = Some(StepFailure::Cancelled {
                            next_trigger: trigger.clone(),
                        });
                        break;
                    }
                    Err(err) => {
                        outcome.failure = Some(StepFailure::Dispatch {
                            trigger: trigger.clone(),
                            message: err.to_string(),
                        });
                        break;
                    }
                }
            }
            Ok(())
        })?;

        match &outcome.failure {
            None => {
                record.complete();
                outcome.reply = outcome.outputs.last().map(|segment| segment.output.clone());
            }
            Some(failure) => record.incomplete(&failure.reason()),
        }
        self.store.write(records::TURN_RECORD, record.as_str())?;
        drop(turn_lock);

        match &outcome.failure {
            None => append_runtime_log(
                self.store.paths(),
                "info",
                "turn.completed",
                &format!("jobs={}", outcome.outputs.len()),
            ),
            Some(failure) => append_runtime_log(
                self.store.paths(),
                "warn",
                "turn.incomplete",
                &format!(
                    "jobs_done={} reason={}",
                    outcome.outputs.len(),
                    failure.reason()
                ),
            ),
        }

        if !outcome.is_cancelled() {
            let pair = Pair::new(user_input, outcome.display_text());
            if let Err(err) = self.archive.submit(pair) {
                append_runtime_log(
                    self.store.paths(),
                    "error",
                    "turn.archive_submit_failed",
                    &err.to_string(),
                );
            }
        }
        Ok(outcome)
    }

    /// Runs one job outside the sequence. The Turn Record is context only.
    pub fn run_trigger(&self, name: &str) -> Result<String, SequencerError> {
        self.run_job(name, &BTreeMap::new(), "manual")
    }

    pub fn run_queued(&self, job: &QueuedJob) -> Result<String, SequencerError> {
        let source = if job.source.is_empty() {
            "queue"
        } else {
            job.source.as_str()
        };
        self.run_job(&job.name, &job.args, source)
    }

    fn run_job(
        &self,
        name: &str,
        args: &BTreeMap<String, String>,
        source: &str,
    ) -> Result<String, SequencerError> {
        let definition = self
            .jobs
            .get(name)?
            .ok_or_else(|| JobError::Unknown(name.to_string()))?;
        let started_ms = now_millis();
        let transcript = self.store.read(records::TURN_RECORD)?.unwrap_or_default();
        let owner = format!("trigger:{source}");
        let request = DispatchRequest {
            owner: &owner,
            label: name,
            trigger: definition.trigger_text(name),
            instructions: Some(render_job_prompt(name, &definition, args)),
            transcript,
        };
        let output = self
            .dispatcher
            .dispatch(request, &|| self.cancel_recorded_since(started_ms))?;
        self.store.write(records::LAST_TRIGGER_OUTPUT, &output)?;
        self.route_output(name, &definition, &output);
        append_runtime_log(
            self.store.paths(),
            "info",
            "trigger.completed",
            &format!("job={name} source={source}"),
        );
        Ok(output)
    }

    fn route_output(&self, name: &str, definition: &JobDefinition, output: &str) {
        let Some(target) = definition.output.as_deref() else {
            return;
        };
        if let Err(err) = self.store.write(&records::job_output(target), output) {
            append_runtime_log(
                self.store.paths(),
                "warn",
                "job.output_route_failed",
                &format!("job={name} target={target} error={err}"),
            );
        }
    }

    fn reset_cancel(&self) -> Result<(), StoreError> {
        self.cancel.store(false, Ordering::SeqCst);
        self.store.remove(records::CANCEL_REQUEST)?;
        Ok(())
    }

    fn cancel_requested(&self, since_ms: i64) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.cancel_recorded_since(since_ms)
    }

    fn cancel_recorded_since(&self, since_ms: i64) -> bool {
        match self.store.read_json::<CancelRequest>(records::CANCEL_REQUEST) {
            Ok(Some(request)) => request.requested_at_ms >= since_ms,
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("failed to read cancel request: {err}");
                false
            }
        }
    }
}

/// Writes the cross-process cancel request observed by a running turn.
pub fn request_cancel(store: &StateStore) -> Result<(), StoreError> {
    store.write_json(
        records::CANCEL_REQUEST,
        &CancelRequest {
            requested_at_ms: now_millis(),
            pid: std::process::id(),
        },
    )?;
    append_runtime_log(store.paths(), "info", "turn.cancel_requested", "");
    Ok(())
}

/// A turn running on a background thread.
pub struct TurnHandle {
    receiver: mpsc::Receiver<Result<TurnOutcome, SequencerError>>,
    sequencer: Arc<Sequencer>,
    finished: Option<Result<TurnOutcome, SequencerError>>,
}

impl TurnHandle {
    pub fn cancel(&self) -> Result<(), SequencerError> {
        self.sequencer.cancel()
    }

    /// Non-blocking; true once the outcome is available.
    pub fn is_finished(&mut self) -> bool {
        if self.finished.is_none() {
            match self.receiver.try_recv() {
                Ok(result) => self.finished = Some(result),
                Err(mpsc::TryRecvError::Empty) => return false,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.finished = Some(Err(SequencerError::Aborted))
                }
            }
        }
        true
    }

    pub fn wait(mut self) -> Result<TurnOutcome, SequencerError> {
        if let Some(result) = self.finished.take() {
            return result;
        }
        self.receiver.recv().unwrap_or(Err(SequencerError::Aborted))
    }
}

/// Runs `run_turn` on its own thread so the caller never blocks on the model.
pub fn spawn_turn(sequencer: &Arc<Sequencer>, user_input: String) -> TurnHandle {
    let (sender, receiver) = mpsc::channel();
    let worker = Arc::clone(sequencer);
    thread::spawn(move || {
        let _ = sender.send(worker.run_turn(&user_input));
    });
    TurnHandle {
        receiver,
        sequencer: Arc::clone(sequencer),
        finished: None,
    }
}
