//! Cross-process advisory locks.
//!
//! A lock is a file under the locks directory created with `create_new`; its
//! body is a JSON [`LockHolder`]. Contenders poll until the file disappears or
//! the timeout elapses. A holder is treated as abandoned, and its lock
//! overridden, when its pid is on this host and no longer alive, or when it has
//! held the lock longer than `stale_after`. Overrides are logged and reported
//! on the returned guard so the caller can validate what it protects.
//!
//! Two windows remain where plain files cannot give a guarantee. Breaking a
//! stale lock moves it aside and links it back if it turned out to be fresh;
//! a third contender that creates the lock inside that window can lose its
//! file to the link-back. `LockGuard::refresh` reads and then rewrites the
//! holder, so it can overwrite a lock that was broken and re-created between
//! the two steps. Both need a holder to be overridden as stale while it is
//! still active, which keeping long holds refreshed well under `stale_after`
//! rules out in practice.

use crate::runtime::{append_runtime_log, StatePaths};
use crate::shared::digest::sha256_hex;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::random_hex;
use crate::shared::time::now_millis;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Liveness of a holder pid is re-probed at most this often while waiting.
const LIVENESS_RECHECK: Duration = Duration::from_millis(500);
const KEEP_ALIVE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock `{resource}` (held by {holder})")]
    Timeout {
        resource: String,
        waited_ms: u64,
        holder: String,
    },
    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from(&crate::config::LockSettings::default())
    }
}

impl From<&crate::config::LockSettings> for LockPolicy {
    fn from(settings: &crate::config::LockSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            stale_after: Duration::from_millis(settings.stale_after_ms),
            poll_interval: Duration::from_millis(settings.poll_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub resource: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at_ms: i64,
    pub token: String,
}

impl LockHolder {
    fn describe(&self) -> String {
        format!("pid {} on {}", self.pid, self.host)
    }
}

#[derive(Debug, Clone)]
pub struct FileLock {
    paths: StatePaths,
    policy: LockPolicy,
}

impl FileLock {
    pub fn new(paths: &StatePaths, policy: LockPolicy) -> Self {
        Self {
            paths: paths.clone(),
            policy,
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Acquires `resource` using the configured timeout.
    pub fn acquire(&self, resource: &str) -> Result<LockGuard, LockError> {
        self.acquire_within(resource, self.policy.timeout)
    }

    /// Single attempt; abandoned holders are still overridden.
    pub fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>, LockError> {
        match self.acquire_within(resource, Duration::ZERO) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Timeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn acquire_within(&self, resource: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let path = self.lock_path(resource);
        let dir = self.paths.locks_dir();
        fs::create_dir_all(&dir).map_err(|source| LockError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let started = Instant::now();
        let mut overridden = None;
        let mut liveness: Option<(String, Instant, bool)> = None;
        let mut last_holder = String::from("unknown holder");

        loop {
            let holder = LockHolder {
                resource: resource.to_string(),
                pid: std::process::id(),
                host: local_host().to_string(),
                acquired_at_ms: now_millis(),
                token: random_hex(8),
            };
            match create_lock_file(&path, &holder) {
                Ok(()) => {
                    return Ok(LockGuard {
                        path,
                        resource: resource.to_string(),
                        token: holder.token,
                        overridden,
                        released: false,
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }

            match read_holder(&path) {
                HolderRead::Missing => continue,
                HolderRead::Held(current) => {
                    last_holder = current.describe();
                    if let Some(reason) = self.abandoned_reason(&current, &mut liveness) {
                        if self.break_lock(&path, &current)? {
                            append_runtime_log(
                                &self.paths,
                                "warn",
                                "lock.stale_override",
                                &format!(
                                    "resource={resource} holder_pid={} holder_host={} reason={reason}",
                                    current.pid, current.host
                                ),
                            );
                            overridden = Some(current);
                        }
                        continue;
                    }
                }
                HolderRead::Unreadable { age } => {
                    // Creator may be between create and write; only an old one is abandoned.
                    if age >= self.policy.stale_after {
                        remove_if_unreadable(&path);
                        append_runtime_log(
                            &self.paths,
                            "warn",
                            "lock.stale_override",
                            &format!("resource={resource} reason=unreadable lock file"),
                        );
                        continue;
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                    holder: last_holder,
                });
            }
            thread::sleep(self.policy.poll_interval.min(timeout - elapsed));
        }
    }

    /// Current holder of `resource`, if any.
    pub fn holder(&self, resource: &str) -> Option<LockHolder> {
        match read_holder(&self.lock_path(resource)) {
            HolderRead::Held(holder) => Some(holder),
            _ => None,
        }
    }

    /// True when `resource` is held by a holder that would not be overridden.
    pub fn is_held(&self, resource: &str) -> bool {
        match self.holder(resource) {
            Some(holder) => self.abandoned_reason(&holder, &mut None).is_none(),
            None => false,
        }
    }

    pub fn lock_path(&self, resource: &str) -> PathBuf {
        let readable: String = resource
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .take(48)
            .collect();
        let digest = sha256_hex(resource.as_bytes());
        self.paths
            .locks_dir()
            .join(format!("{readable}-{}.lock", &digest[..12]))
    }

    fn abandoned_reason(
        &self,
        holder: &LockHolder,
        liveness: &mut Option<(String, Instant, bool)>,
    ) -> Option<&'static str> {
        if holder.host == local_host() && holder.pid != std::process::id() {
            let alive = match liveness {
                Some((token, checked, alive))
                    if *token == holder.token && checked.elapsed() < LIVENESS_RECHECK =>
                {
                    *alive
                }
                _ => {
                    let alive = process_liveness(holder.pid).unwrap_or(true);
                    *liveness = Some((holder.token.clone(), Instant::now(), alive));
                    alive
                }
            };
            if !alive {
                return Some("holder process is not alive");
            }
        }
        let age_ms = now_millis().saturating_sub(holder.acquired_at_ms);
        if age_ms >= 0 && age_ms as u128 >= self.policy.stale_after.as_millis() {
            return Some("held longer than the staleness threshold");
        }
        None
    }

    /// Removes the lock file only if it still belongs to `stale`. Returns false
    /// when another contender replaced it first.
    fn break_lock(&self, path: &Path, stale: &LockHolder) -> Result<bool, LockError> {
        let tomb = path.with_extension(format!("stale-{}", random_hex(4)));
        match fs::rename(path, &tomb) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
        let moved = match read_holder(&tomb) {
            HolderRead::Held(holder) => holder.token == stale.token,
            _ => false,
        };
        if !moved {
            // A fresh lock was moved aside; put it back unless someone already re-created it.
            let _ = fs::hard_link(&tomb, path);
        }
        let _ = fs::remove_file(&tomb);
        Ok(moved)
    }
}

/// Held lock; removed on [`LockGuard::release`] or drop if still owned.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    resource: String,
    token: String,
    overridden: Option<LockHolder>,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The abandoned holder this acquisition displaced, if any.
    pub fn stale_override(&self) -> Option<&LockHolder> {
        self.overridden.as_ref()
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    /// Runs `body` on the current thread while a scoped helper refreshes the
    /// lock every `every`.
    pub fn keep_alive<R>(&self, every: Duration, body: impl FnOnce() -> R) -> R {
        let every = every.max(Duration::from_millis(10));
        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                let mut last = Instant::now();
                while !done.load(Ordering::Relaxed) {
                    thread::sleep(KEEP_ALIVE_TICK.min(every));
                    if last.elapsed() < every {
                        continue;
                    }
                    last = Instant::now();
                    match self.refresh() {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(resource = %self.resource, "lock lost while held");
                            return;
                        }
                        Err(err) => {
                            tracing::warn!(resource = %self.resource, "failed to refresh lock: {err}");
                        }
                    }
                }
            });
            let _finish = SetOnDrop(&done);
            body()
        })
    }

    /// Restamps `acquired_at_ms` so a long-lived holder is not taken for
    /// stale. Returns false when the lock was lost to someone else.
    pub fn refresh(&self) -> Result<bool, LockError> {
        let mut holder = match read_holder(&self.path) {
            HolderRead::Held(holder) if holder.token == self.token => holder,
            _ => return Ok(false),
        };
        holder.acquired_at_ms = now_millis();
        let io_err = |source| LockError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let body = serde_json::to_vec(&holder).map_err(|err| io_err(std::io::Error::other(err)))?;
        atomic_write_file(&self.path, &body).map_err(io_err)?;
        Ok(matches!(
            read_holder(&self.path),
            HolderRead::Held(current) if current.token == self.token
        ))
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_holder(&self.path) {
            HolderRead::Held(holder) if holder.token == self.token => {
                match fs::remove_file(&self.path) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(LockError::Io {
                        path: self.path.display().to_string(),
                        source,
                    }),
                }
            }
            _ => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::warn!(resource = %self.resource, "failed to release lock: {err}");
        }
    }
}

enum HolderRead {
    Missing,
    Held(LockHolder),
    Unreadable { age: Duration },
}

fn create_lock_file(path: &Path, holder: &LockHolder) -> std::io::Result<()> {
    let body = serde_json::to_vec(holder).map_err(std::io::Error::other)?;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    if let Err(err) = file.write_all(&body).and_then(|_| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn read_holder(path: &Path) -> HolderRead {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return HolderRead::Missing,
        Err(_) => return HolderRead::Unreadable { age: file_age(path) },
    };
    match serde_json::from_slice::<LockHolder>(&raw) {
        Ok(holder) => HolderRead::Held(holder),
        Err(_) => HolderRead::Unreadable { age: file_age(path) },
    }
}

fn remove_if_unreadable(path: &Path) {
    if matches!(read_holder(path), HolderRead::Unreadable { .. }) {
        let _ = fs::remove_file(path);
    }
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

pub fn local_host() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        std::env::var("HOSTNAME")
            .ok()
            .or_else(|| fs::read_to_string("/etc/hostname").ok())
            .map(|raw| raw.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

/// `Some(alive)` where the platform can tell, `None` otherwise.
pub fn process_liveness(pid: u32) -> Option<bool> {
    if pid == 0 {
        return Some(false);
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .ok()
    }

    #[cfg(not(unix))]
    {
        None
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    process_liveness(pid).unwrap_or(false)
}

struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
