//! Named records under the state root.
//!
//! Every read and write of a record holds the advisory lock scoped to that
//! record's name, and writes replace the whole file through a temp file and
//! rename, so no reader ever observes a partial write. JSON reads that fail to
//! parse are treated as absent (logged as a malformed record) instead of
//! crashing the caller.

use crate::lock::{FileLock, LockError, LockGuard};
use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::fs_atomic::{atomic_write_file, is_temp_artifact};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

/// Well-known record names, relative to the state root.
pub mod records {
    pub const MODEL_STATE: &str = "state/model_state.json";
    pub const TURN_RECORD: &str = "state/turn_record.txt";
    pub const CANCEL_REQUEST: &str = "state/cancel_request.json";
    pub const LAST_TRIGGER_OUTPUT: &str = "state/last_trigger_output.txt";
    pub const ACTIVE_CYCLE: &str = "state/active_cycle.json";
    pub const CYCLE_TRANSCRIPT: &str = "state/cycle_transcript.jsonl";
    pub const ARCHIVE_SWITCH: &str = "state/archive_switch.json";
    pub const ARCHIVE_PENDING: &str = "state/archive_pending.json";
    pub const ARCHIVE_CONTROL: &str = "state/archive_control.json";

    pub const JOBS: &str = "automation/jobs.json";
    pub const JOB_SEQUENCE: &str = "automation/job_sequence.json";
    pub const JOB_QUEUE: &str = "automation/job_queue.json";
    pub const CYCLES: &str = "automation/cycles.json";
    pub const SCHEDULES: &str = "automation/schedules.json";

    pub const TOPIC_INDEX: &str = "topics/index.json";
    pub const TOPIC_PENDING: &str = "topics/pending.json";
    pub const TOPIC_SEEN: &str = "topics/seen.jsonl";

    pub fn watcher_cursor(kind: &str) -> String {
        format!("state/watchers/{kind}.json")
    }

    pub fn job_output(record: &str) -> String {
        format!("outputs/{record}.txt")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("invalid record name `{0}`")]
    InvalidName(String),
    #[error("failed to read record {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write record {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StateStore {
    paths: StatePaths,
    locks: FileLock,
}

impl StateStore {
    pub fn new(paths: &StatePaths, locks: FileLock) -> Self {
        Self {
            paths: paths.clone(),
            locks,
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn locks(&self) -> &FileLock {
        &self.locks
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.paths.root.join(relative))
    }

    pub fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        read_path(&path)
    }

    pub fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        write_path(&path, content.as_bytes())
    }

    /// Returns whether a record was removed.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Write {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.path_of(name)?.exists())
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.read(name)? else {
            return Ok(None);
        };
        Ok(self.decode(name, &raw))
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let encoded = encode(name, value)?;
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        write_path(&path, &encoded)
    }

    /// Read-modify-write under one lock hold. Absent or malformed records start
    /// from `T::default()`; the record is only rewritten when the value changed.
    pub fn update_json<T, R>(&self, name: &str, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        self.try_update_json(name, |value: &mut T| Ok::<R, StoreError>(f(value)))
    }

    /// Like [`StateStore::update_json`]; an `Err` from `f` leaves the record untouched.
    pub fn try_update_json<T, R, E>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<R, E>
    where
        T: Serialize + DeserializeOwned + Default,
        E: From<StoreError>,
    {
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        let existing = read_path(&path)?;
        let (mut value, healed) = match existing.as_deref() {
            Some(raw) => match self.decode::<T>(name, raw) {
                Some(value) => (value, false),
                None => (T::default(), true),
            },
            None => (T::default(), false),
        };
        let before = encode(name, &value)?;
        let result = f(&mut value)?;
        let after = encode(name, &value)?;
        if healed || before != after {
            write_path(&path, &after)?;
        }
        Ok(result)
    }

    /// Appends one line to an audit-style record.
    pub fn append_line(&self, name: &str, line: &str) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        let _guard = self.lock_record(name)?;
        let io_err = |source| StoreError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        writeln!(file, "{}", line.trim_end_matches('\n')).map_err(io_err)
    }

    /// Names of the `.json` records directly inside `dir`, sorted.
    pub fn list(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        let path = self.path_of(dir)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(".json") && !is_temp_artifact(file_name) {
                names.push(format!("{}/{file_name}", dir.trim_end_matches('/')));
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock_record(&self, name: &str) -> Result<LockGuard, StoreError> {
        Ok(self.locks.acquire(&format!("record:{name}"))?)
    }

    fn decode<T: DeserializeOwned>(&self, name: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                append_runtime_log(
                    &self.paths,
                    "warn",
                    "store.malformed_record",
                    &format!("record={name} error={err}"),
                );
                None
            }
        }
    }
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        name: name.to_string(),
        source,
    })
}

fn read_path(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn write_path(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    atomic_write_file(path, content).map_err(|source| StoreError::Write {
        path: path.display().to_string(),
        source,
    })
}
