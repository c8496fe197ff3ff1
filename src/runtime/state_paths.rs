use super::RuntimeError;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.state_dir(),
            self.locks_dir(),
            self.root.join("automation"),
            self.archive_dir(),
            self.root.join("topics"),
            self.root.join("tasks"),
            self.root.join("goals"),
            self.root.join("logs"),
        ]
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Session directories live here.
    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn supervisor_state_path(&self) -> PathBuf {
        self.state_dir().join("supervisor.json")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.state_dir().join("stop")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.root.join("logs/runtime.log")
    }
}

pub fn default_state_root_path() -> Result<PathBuf, RuntimeError> {
    Ok(crate::config::default_state_root()?)
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        fs::create_dir_all(&path).map_err(|source| RuntimeError::CreateDir {
            path: path.display().to_string(),
            source,
        })?;
    }
    Ok(())
}
