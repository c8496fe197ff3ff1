use super::WorkerEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_count: u64,
}

/// Log line produced by a state transition worth recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLog {
    pub level: &'static str,
    pub event: &'static str,
    pub message: String,
}

/// Folds one event into the per-worker health map. `active` tracks workers
/// that have not reported `Stopped` yet.
pub fn apply_worker_event(
    workers: &mut BTreeMap<String, WorkerHealth>,
    active: &mut BTreeSet<String>,
    event: WorkerEvent,
) -> Option<WorkerLog> {
    match event {
        WorkerEvent::Started { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Running;
            entry.last_heartbeat = Some(at);
            Some(WorkerLog {
                level: "info",
                event: "worker.started",
                message: worker_id,
            })
        }
        WorkerEvent::Heartbeat { worker_id, at } => {
            let entry = workers.entry(worker_id).or_default();
            entry.state = WorkerState::Running;
            entry.last_heartbeat = Some(at);
            None
        }
        WorkerEvent::Error {
            worker_id,
            at,
            message,
            fatal,
        } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(message.clone());
            entry.error_count += 1;
            // Non-fatal errors are already in the runtime log from the watcher loop.
            fatal.then(|| WorkerLog {
                level: "error",
                event: "worker.error",
                message: format!("{worker_id}: {message}"),
            })
        }
        WorkerEvent::Stopped { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Stopped;
            }
            entry.last_heartbeat = Some(at);
            active.remove(&worker_id);
            Some(WorkerLog {
                level: "info",
                event: "worker.stopped",
                message: worker_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_after_error_marks_worker_running_again() {
        let mut workers = BTreeMap::new();
        let mut active = BTreeSet::from(["cycle".to_string()]);
        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Error {
                worker_id: "cycle".to_string(),
                at: 1,
                message: "boom".to_string(),
                fatal: false,
            },
        );
        assert_eq!(workers["cycle"].state, WorkerState::Error);
        assert_eq!(workers["cycle"].error_count, 1);

        apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Heartbeat {
                worker_id: "cycle".to_string(),
                at: 2,
            },
        );
        assert_eq!(workers["cycle"].state, WorkerState::Running);
        assert_eq!(workers["cycle"].last_error.as_deref(), Some("boom"));

        let log = apply_worker_event(
            &mut workers,
            &mut active,
            WorkerEvent::Stopped {
                worker_id: "cycle".to_string(),
                at: 3,
            },
        )
        .expect("stop is logged");
        assert_eq!(log.event, "worker.stopped");
        assert!(active.is_empty());
        assert_eq!(workers["cycle"].state, WorkerState::Stopped);
    }
}
