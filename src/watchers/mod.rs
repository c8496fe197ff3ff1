//! Background watchers.
//!
//! Each watcher is a poll/apply pair: `poll` inspects shared state and decides
//! whether there is work, `apply` performs it. [`run_watcher_loop`] drives a
//! watcher on an interval, logging failures and backing off instead of
//! exiting.

pub mod cycle;
pub mod job_queue;
pub mod runner;
pub mod scheduler;
pub mod task_goal;
pub mod topic;
pub mod verbatim;

pub use cycle::CycleWatcher;
pub use job_queue::JobQueueWatcher;
pub use runner::{run_watcher_loop, tick, LoopOptions, LoopReport, TickFailure, TickOutcome};
pub use scheduler::SchedulerWatcher;
pub use task_goal::{TaskGoalWatcher, WorkItem, WorkItemBook, WorkItemKind, WorkItemStatus};
pub use topic::{TopicIndex, TopicWatcher};
pub use verbatim::VerbatimWatcher;

use crate::archive::ArchiveError;
use crate::cycles::CycleError;
use crate::gate::GateError;
use crate::sequencer::{DispatchError, SequencerError};
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatcherKind {
    Cycle,
    Scheduler,
    Topic,
    TaskGoal,
    Verbatim,
    JobQueue,
}

impl WatcherKind {
    pub const ALL: [WatcherKind; 6] = [
        Self::Cycle,
        Self::Scheduler,
        Self::Topic,
        Self::TaskGoal,
        Self::Verbatim,
        Self::JobQueue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cycle => "cycle",
            Self::Scheduler => "scheduler",
            Self::Topic => "topic",
            Self::TaskGoal => "task_goal",
            Self::Verbatim => "verbatim",
            Self::JobQueue => "job_queue",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown watcher `{raw}`; expected one of: {}",
                    Self::ALL.map(Self::as_str).join(", ")
                )
            })
    }

    /// Lock that keeps a second instance of this watcher from starting.
    pub fn instance_lock(self) -> String {
        format!("watcher:{}", self.as_str())
    }

    /// Gate owner name used when this watcher dispatches to the model.
    pub fn owner(self) -> String {
        format!("watcher:{}", self.as_str())
    }
}

impl std::fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
}

pub trait Watcher {
    type Action;

    fn kind(&self) -> WatcherKind;

    /// Looks at shared state; `None` means nothing to do this round.
    fn poll(&mut self) -> Result<Option<Self::Action>, WatcherError>;

    fn apply(&mut self, action: Self::Action) -> Result<(), WatcherError>;

    /// Set once the watcher has been asked to shut itself down.
    fn wants_exit(&self) -> bool {
        false
    }
}

const CURSOR_CAPACITY: usize = 512;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DigestCursor {
    #[serde(default)]
    digests: VecDeque<String>,
}

/// Content fingerprints a watcher has already reacted to, persisted so a
/// restart does not react twice.
#[derive(Debug, Clone)]
pub(crate) struct SeenDigests {
    store: StateStore,
    record: String,
}

impl SeenDigests {
    pub(crate) fn new(store: StateStore, kind: WatcherKind) -> Self {
        Self {
            store,
            record: records::watcher_cursor(kind.as_str()),
        }
    }

    pub(crate) fn load(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .read_json::<DigestCursor>(&self.record)?
            .unwrap_or_default()
            .digests
            .into())
    }

    pub(crate) fn remember(&self, digests: &[String]) -> Result<(), StoreError> {
        self.store
            .update_json(&self.record, |cursor: &mut DigestCursor| {
                for digest in digests {
                    if !cursor.digests.contains(digest) {
                        cursor.digests.push_back(digest.clone());
                    }
                }
                while cursor.digests.len() > CURSOR_CAPACITY {
                    cursor.digests.pop_front();
                }
            })
    }
}
