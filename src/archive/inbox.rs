use super::Pair;
use crate::shared::time::now_millis;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSwitch {
    pub enabled: bool,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveControl {
    /// Close the open session; the next archived pair starts a new one.
    CloseSession,
    /// Close the open session and immediately start a new one.
    ForceNewSession,
    /// Close the open session and stop the verbatim watcher.
    Shutdown,
}

impl ArchiveControl {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloseSession => "close_session",
            Self::ForceNewSession => "force_new_session",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ControlQueue {
    #[serde(default)]
    requests: Vec<ArchiveControl>,
}

/// Hand-off between the processes that produce pairs and the verbatim watcher
/// that writes them: the switch, the pending pairs, and control requests.
#[derive(Debug, Clone)]
pub struct ArchiveInbox {
    store: StateStore,
    default_enabled: bool,
}

impl ArchiveInbox {
    pub fn new(store: StateStore, default_enabled: bool) -> Self {
        Self {
            store,
            default_enabled,
        }
    }

    pub fn enabled(&self) -> Result<bool, StoreError> {
        Ok(self
            .store
            .read_json::<ArchiveSwitch>(records::ARCHIVE_SWITCH)?
            .map_or(self.default_enabled, |switch| switch.enabled))
    }

    /// Returns the previous position.
    pub fn set_enabled(&self, enabled: bool) -> Result<bool, StoreError> {
        let previous = self.enabled()?;
        self.store.write_json(
            records::ARCHIVE_SWITCH,
            &ArchiveSwitch {
                enabled,
                updated_at_ms: now_millis(),
            },
        )?;
        Ok(previous)
    }

    /// Queues `pair` for archival; dropped (and `false`) while the switch is off.
    pub fn submit(&self, pair: Pair) -> Result<bool, StoreError> {
        if !self.enabled()? {
            return Ok(false);
        }
        self.store
            .update_json(records::ARCHIVE_PENDING, |pending: &mut Vec<Pair>| {
                pending.push(pair);
            })?;
        Ok(true)
    }

    pub fn pending(&self) -> Result<Vec<Pair>, StoreError> {
        Ok(self
            .store
            .read_json::<Vec<Pair>>(records::ARCHIVE_PENDING)?
            .unwrap_or_default())
    }

    /// Drops the first `count` pending pairs once they are safely archived.
    pub fn acknowledge(&self, count: usize) -> Result<(), StoreError> {
        self.store
            .update_json(records::ARCHIVE_PENDING, |pending: &mut Vec<Pair>| {
                let count = count.min(pending.len());
                pending.drain(..count);
            })
    }

    pub fn request(&self, control: ArchiveControl) -> Result<(), StoreError> {
        self.store
            .update_json(records::ARCHIVE_CONTROL, |queue: &mut ControlQueue| {
                queue.requests.push(control);
            })
    }

    pub fn take_requests(&self) -> Result<Vec<ArchiveControl>, StoreError> {
        if !self.store.exists(records::ARCHIVE_CONTROL)? {
            return Ok(Vec::new());
        }
        self.store
            .update_json(records::ARCHIVE_CONTROL, |queue: &mut ControlQueue| {
                std::mem::take(&mut queue.requests)
            })
    }

    pub fn has_requests(&self) -> Result<bool, StoreError> {
        Ok(!self
            .store
            .read_json::<ControlQueue>(records::ARCHIVE_CONTROL)?
            .unwrap_or_default()
            .requests
            .is_empty())
    }
}
