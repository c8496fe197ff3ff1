use crate::shared::time::now_millis;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    pub enqueued_at_ms: i64,
    /// Who queued it, e.g. `scheduler` or `cli`.
    #[serde(default)]
    pub source: String,
}

impl QueuedJob {
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            name: name.to_string(),
            args: BTreeMap::new(),
            enqueued_at_ms: now_millis(),
            source: source.to_string(),
        }
    }
}

/// FIFO of jobs waiting for the model, shared across processes.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: StateStore,
}

impl JobQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Appends and returns the new queue length.
    pub fn push(&self, job: QueuedJob) -> Result<usize, StoreError> {
        self.store
            .update_json(records::JOB_QUEUE, |queue: &mut VecDeque<QueuedJob>| {
                queue.push_back(job);
                queue.len()
            })
    }

    pub fn pop(&self) -> Result<Option<QueuedJob>, StoreError> {
        self.store
            .update_json(records::JOB_QUEUE, |queue: &mut VecDeque<QueuedJob>| {
                queue.pop_front()
            })
    }

    pub fn peek(&self) -> Result<Option<QueuedJob>, StoreError> {
        Ok(self.pending()?.into_iter().next())
    }

    pub fn pending(&self) -> Result<Vec<QueuedJob>, StoreError> {
        Ok(self
            .store
            .read_json::<Vec<QueuedJob>>(records::JOB_QUEUE)?
            .unwrap_or_default())
    }
}
