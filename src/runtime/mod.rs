pub mod context;
pub mod logging;
pub mod ownership_lock;
pub mod state_paths;
pub mod supervisor;
pub mod watcher_worker;
pub mod worker_primitives;
pub mod worker_registry;

pub use crate::shared::errors::RuntimeError;
pub(crate) use crate::shared::fs_atomic::atomic_write_file;
pub(crate) use crate::shared::time::now_secs;
pub use context::RuntimeContext;
pub use logging::{append_runtime_log, init_tracing, tail_runtime_log};
pub use ownership_lock::{
    cleanup_stale_supervisor, reserve_supervisor_lock, signal_stop, stop_active_supervisor,
    supervisor_ownership_state, OwnershipState, StopResult, SUPERVISOR_LOCK,
};
pub use state_paths::{bootstrap_state_root, default_state_root_path, StatePaths};
pub use supervisor::{
    load_supervisor_state, run_supervisor, save_supervisor_state, watch_stop_signal,
    SupervisorState, WorkerHealth,
};
pub use watcher_worker::{build_worker_specs, loop_options, run_watcher, WatcherSpec};
pub use worker_primitives::{sleep_with_stop, WorkerEvent};
pub use worker_registry::WorkerState;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::lock::{FileLock, LockPolicy};
    use crate::watchers::WatcherKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn settings_file_uses_config_yaml_under_state_root() {
        let paths = StatePaths::new("/tmp/.jobloop");
        assert_eq!(paths.settings_file(), PathBuf::from("/tmp/.jobloop/config.yaml"));
    }

    #[test]
    fn default_state_root_path_uses_home_jobloop() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let dir = tempdir().expect("temp dir");
        let old_home = std::env::var_os("HOME");
        let old_root = std::env::var_os(crate::config::STATE_ROOT_ENV);
        std::env::set_var("HOME", dir.path());
        std::env::remove_var(crate::config::STATE_ROOT_ENV);

        let root = default_state_root_path().expect("resolve state root");
        assert_eq!(root, dir.path().join(".jobloop"));

        match old_home {
            Some(value) => std::env::set_var("HOME", value),
            None => std::env::remove_var("HOME"),
        }
        if let Some(value) = old_root {
            std::env::set_var(crate::config::STATE_ROOT_ENV, value);
        }
    }

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(required.is_dir(), "missing directory: {}", required.display());
        }
    }

    #[test]
    fn stale_state_is_cleaned_when_pid_not_running() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path().join(".jobloop"));
        bootstrap_state_root(&paths).expect("bootstrap");
        let locks = FileLock::new(&paths, LockPolicy::default());

        let stale = SupervisorState {
            running: true,
            pid: Some(999_999),
            started_at: Some(1),
            stopped_at: None,
            workers: BTreeMap::new(),
            last_error: None,
        };
        save_supervisor_state(&paths, &stale).expect("save stale");

        let ownership = supervisor_ownership_state(&paths, &locks).expect("ownership");
        assert_eq!(ownership, OwnershipState::Stale);

        cleanup_stale_supervisor(&paths, &locks).expect("cleanup stale");
        assert_eq!(
            supervisor_ownership_state(&paths, &locks).expect("ownership after"),
            OwnershipState::NotRunning
        );

        let cleaned = load_supervisor_state(&paths).expect("load cleaned");
        assert!(!cleaned.running);
        assert!(cleaned.pid.is_none());
    }

    #[test]
    fn supervisor_lock_is_exclusive_until_released() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let locks = FileLock::new(&paths, LockPolicy::default());

        let guard = reserve_supervisor_lock(&locks).expect("first reservation");
        match reserve_supervisor_lock(&locks) {
            Err(RuntimeError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(
            supervisor_ownership_state(&paths, &locks).expect("ownership"),
            OwnershipState::Running {
                pid: std::process::id()
            }
        );
        guard.release().expect("release");
        reserve_supervisor_lock(&locks).expect("reservation after release");
    }

    #[test]
    fn worker_specs_skip_disabled_watchers() {
        let mut settings = Settings::default();
        settings.watchers.topic.enabled = false;
        settings.watchers.scheduler.poll_interval_ms = 750;

        let specs = build_worker_specs(&settings);
        let kinds: Vec<WatcherKind> = specs.iter().map(|spec| spec.kind).collect();
        assert!(!kinds.contains(&WatcherKind::Topic));
        assert_eq!(kinds.len(), WatcherKind::ALL.len() - 1);

        let scheduler = specs
            .iter()
            .find(|spec| spec.kind == WatcherKind::Scheduler)
            .expect("scheduler spec");
        assert_eq!(scheduler.options.interval.as_millis(), 750);
    }
}
