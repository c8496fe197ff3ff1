//! Busy/idle coordination for the single shared model.
//!
//! The flag lives in one store record. Moving from idle to busy is a single
//! locked check-and-set, so two contenders can never both observe idle and
//! both claim. A successful claim returns a [`BusyClaim`] that resets the flag
//! to idle when released or dropped, which covers every exit path of a
//! dispatch including panics and early returns.

use crate::lock::{is_process_alive, local_host};
use crate::runtime::append_runtime_log;
use crate::shared::ids::random_hex;
use crate::shared::time::now_millis;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

const RELEASE_ATTEMPTS: u32 = 6;
const RELEASE_BACKOFF: Duration = Duration::from_millis(50);
const RELEASE_BACKOFF_CAP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Idle,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl ModelStatus {
    pub fn is_idle(&self) -> bool {
        self.state == ModelState::Idle
    }

    /// A busy flag whose claimant process on this host is gone.
    pub fn is_orphaned(&self) -> bool {
        self.state == ModelState::Busy
            && self.host.as_deref() == Some(local_host())
            && self.pid.is_some_and(|pid| !is_process_alive(pid))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("model stayed busy (owner {owner}) for {waited_ms}ms")]
    WaitTimeout { owner: String, waited_ms: u64 },
    #[error("cancelled while waiting for the model")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl From<&crate::config::SequencerSettings> for GateWait {
    fn from(settings: &crate::config::SequencerSettings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.busy_poll_ms),
            timeout: Duration::from_secs(settings.busy_wait_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelGate {
    store: StateStore,
}

impl ModelGate {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn status(&self) -> Result<ModelStatus, GateError> {
        Ok(self
            .store
            .read_json::<ModelStatus>(records::MODEL_STATE)?
            .unwrap_or_default())
    }

    pub fn is_idle(&self) -> Result<bool, GateError> {
        Ok(self.status()?.is_idle())
    }

    /// One locked check-and-set; `None` when the model is already busy.
    pub fn try_claim(&self, owner: &str, trigger: &str) -> Result<Option<BusyClaim>, GateError> {
        let claim_id = random_hex(8);
        let claimed = self
            .store
            .update_json(records::MODEL_STATE, |status: &mut ModelStatus| {
                if !status.is_idle() {
                    return false;
                }
                *status = ModelStatus {
                    state: ModelState::Busy,
                    owner: Some(owner.to_string()),
                    trigger: Some(trigger.to_string()),
                    since_ms: Some(now_millis()),
                    claim_id: Some(claim_id.clone()),
                    pid: Some(std::process::id()),
                    host: Some(local_host().to_string()),
                };
                true
            })?;
        if !claimed {
            return Ok(None);
        }
        Ok(Some(BusyClaim {
            store: self.store.clone(),
            claim_id,
            owner: owner.to_string(),
            released: false,
        }))
    }

    /// Waits for idle and claims. `should_stop` is polled between attempts.
    pub fn claim(
        &self,
        owner: &str,
        trigger: &str,
        wait: GateWait,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<BusyClaim, GateError> {
        let started = Instant::now();
        let mut orphan_reported = false;
        loop {
            if should_stop() {
                return Err(GateError::Cancelled);
            }
            if let Some(claim) = self.try_claim(owner, trigger)? {
                return Ok(claim);
            }
            let current = self.status()?;
            if !orphan_reported && current.is_orphaned() {
                orphan_reported = true;
                append_runtime_log(
                    self.store.paths(),
                    "warn",
                    "gate.orphaned_claim",
                    &format!(
                        "owner={} pid={:?} claimant is gone; run `jobloop reset-gate` to clear",
                        current.owner.as_deref().unwrap_or("unknown"),
                        current.pid
                    ),
                );
            }
            let elapsed = started.elapsed();
            if elapsed >= wait.timeout {
                return Err(GateError::WaitTimeout {
                    owner: current.owner.unwrap_or_else(|| "unknown".to_string()),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            thread::sleep(wait.poll_interval.min(wait.timeout - elapsed));
        }
    }

    /// Unconditionally resets the flag to idle.
    pub fn force_idle(&self) -> Result<ModelStatus, GateError> {
        let previous = self
            .store
            .update_json(records::MODEL_STATE, |status: &mut ModelStatus| {
                std::mem::take(status)
            })?;
        if !previous.is_idle() {
            append_runtime_log(
                self.store.paths(),
                "warn",
                "gate.forced_idle",
                &format!(
                    "owner={} trigger={}",
                    previous.owner.as_deref().unwrap_or("unknown"),
                    previous.trigger.as_deref().unwrap_or("unknown")
                ),
            );
        }
        Ok(previous)
    }
}

/// Proof of ownership of the busy flag.
#[derive(Debug)]
pub struct BusyClaim {
    store: StateStore,
    claim_id: String,
    owner: String,
    released: bool,
}

impl BusyClaim {
    pub fn claim_id(&self) -> &str {
        &self.claim_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn release(mut self) -> Result<(), GateError> {
        self.release_inner()
    }

    /// Resets the flag if this claim still owns it. Lock contention on the
    /// flag record is retried with backoff; `released` is only set once the
    /// reset has been written.
    fn release_inner(&mut self) -> Result<(), GateError> {
        if self.released {
            return Ok(());
        }
        let mut backoff = RELEASE_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.reset_if_owned() {
                Ok(()) => {
                    self.released = true;
                    return Ok(());
                }
                Err(err) if attempt < RELEASE_ATTEMPTS => {
                    append_runtime_log(
                        self.store.paths(),
                        "warn",
                        "gate.release_retry",
                        &format!("owner={} attempt={attempt} error={err}", self.owner),
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(RELEASE_BACKOFF_CAP);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn reset_if_owned(&self) -> Result<(), GateError> {
        let claim_id = self.claim_id.as_str();
        self.store
            .update_json(records::MODEL_STATE, |status: &mut ModelStatus| {
                if status.claim_id.as_deref() == Some(claim_id) {
                    *status = ModelStatus::default();
                }
            })?;
        Ok(())
    }
}

impl Drop for BusyClaim {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            append_runtime_log(
                self.store.paths(),
                "error",
                "gate.release_failed",
                &format!("owner={} error={err}", self.owner),
            );
        }
    }
}
