use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub locks: LockSettings,
    #[serde(default)]
    pub sequencer: SequencerSettings,
    #[serde(default)]
    pub archive: ArchiveSettings,
    #[serde(default)]
    pub watchers: WatcherSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelSettings {
    /// Executable that receives the assembled context on stdin and prints the reply.
    #[serde(default = "default_model_command")]
    pub command: String,
    /// Extra arguments; `{trigger}` is replaced with the dispatched trigger.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_model_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            command: default_model_command(),
            args: Vec::new(),
            timeout_seconds: default_model_timeout_seconds(),
            system_prompt_file: None,
        }
    }
}

impl ModelSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LockSettings {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    /// A lock held longer than this is considered abandoned and overridden.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            stale_after_ms: default_stale_after_ms(),
            poll_ms: default_lock_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SequencerSettings {
    #[serde(default = "default_busy_poll_ms")]
    pub busy_poll_ms: u64,
    /// How long a dispatch waits for the model to become idle before giving up.
    #[serde(default = "default_busy_wait_timeout_seconds")]
    pub busy_wait_timeout_seconds: u64,
    /// How long `run_turn` waits for a previous turn to finish.
    #[serde(default = "default_turn_wait_timeout_seconds")]
    pub turn_wait_timeout_seconds: u64,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            busy_poll_ms: default_busy_poll_ms(),
            busy_wait_timeout_seconds: default_busy_wait_timeout_seconds(),
            turn_wait_timeout_seconds: default_turn_wait_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArchiveSettings {
    /// Switch position used until the switch is toggled at runtime.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_block_capacity")]
    pub block_capacity: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            block_capacity: default_block_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl WatcherConfig {
    fn enabled_every(poll_interval_ms: u64) -> Self {
        Self {
            enabled: true,
            poll_interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatcherSettings {
    #[serde(default = "default_cycle_watcher")]
    pub cycle: WatcherConfig,
    #[serde(default = "default_scheduler_watcher")]
    pub scheduler: WatcherConfig,
    #[serde(default = "default_topic_watcher")]
    pub topic: WatcherConfig,
    #[serde(default = "default_task_goal_watcher")]
    pub task_goal: WatcherConfig,
    #[serde(default = "default_verbatim_watcher")]
    pub verbatim: WatcherConfig,
    #[serde(default = "default_job_queue_watcher")]
    pub job_queue: WatcherConfig,
    /// Consecutive failures after which a watcher backs off.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Backoff multiplier applied to the poll interval while failing.
    #[serde(default = "default_error_backoff_factor")]
    pub error_backoff_factor: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            cycle: default_cycle_watcher(),
            scheduler: default_scheduler_watcher(),
            topic: default_topic_watcher(),
            task_goal: default_task_goal_watcher(),
            verbatim: default_verbatim_watcher(),
            job_queue: default_job_queue_watcher(),
            failure_threshold: default_failure_threshold(),
            error_backoff_factor: default_error_backoff_factor(),
        }
    }
}

impl WatcherSettings {
    pub fn entries(&self) -> [(&'static str, &WatcherConfig); 6] {
        [
            ("cycle", &self.cycle),
            ("scheduler", &self.scheduler),
            ("topic", &self.topic),
            ("task_goal", &self.task_goal),
            ("verbatim", &self.verbatim),
            ("job_queue", &self.job_queue),
        ]
    }
}

fn default_true() -> bool {
    true
}

fn default_model_command() -> String {
    "llm-generate".to_string()
}

fn default_model_timeout_seconds() -> u64 {
    300
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_lock_poll_ms() -> u64 {
    50
}

fn default_busy_poll_ms() -> u64 {
    100
}

fn default_busy_wait_timeout_seconds() -> u64 {
    600
}

fn default_turn_wait_timeout_seconds() -> u64 {
    30
}

fn default_block_capacity() -> usize {
    50
}

fn default_cycle_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(1_000)
}

fn default_scheduler_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(500)
}

fn default_topic_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(2_000)
}

fn default_task_goal_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(2_000)
}

fn default_verbatim_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(250)
}

fn default_job_queue_watcher() -> WatcherConfig {
    WatcherConfig::enabled_every(1_000)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_error_backoff_factor() -> u32 {
    5
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.command.trim().is_empty() {
            return Err(ConfigError::Settings(
                "model.command must be non-empty".to_string(),
            ));
        }
        if self.model.timeout_seconds == 0 {
            return Err(ConfigError::Settings(
                "model.timeout_seconds must be >= 1".to_string(),
            ));
        }
        if self.locks.stale_after_ms == 0 {
            return Err(ConfigError::Settings(
                "locks.stale_after_ms must be >= 1".to_string(),
            ));
        }
        if self.locks.poll_ms == 0 {
            return Err(ConfigError::Settings(
                "locks.poll_ms must be >= 1".to_string(),
            ));
        }
        if self.sequencer.busy_poll_ms == 0 {
            return Err(ConfigError::Settings(
                "sequencer.busy_poll_ms must be >= 1".to_string(),
            ));
        }
        if self.archive.block_capacity == 0 {
            return Err(ConfigError::Settings(
                "archive.block_capacity must be >= 1".to_string(),
            ));
        }
        for (name, watcher) in self.watchers.entries() {
            if watcher.poll_interval_ms == 0 {
                return Err(ConfigError::Settings(format!(
                    "watchers.{name}.poll_interval_ms must be >= 1"
                )));
            }
        }
        if self.watchers.error_backoff_factor == 0 {
            return Err(ConfigError::Settings(
                "watchers.error_backoff_factor must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
