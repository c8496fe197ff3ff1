//! Cycle definitions and the active-cycle record.
//!
//! Content (definitions and their trigger lists) is only changed through a
//! [`CycleEditor`]; the step index of the running cycle is only moved through a
//! [`CycleAdvancer`]. Both work on the same store records under the store's
//! per-record locks, so an edit never clobbers an advance and vice versa.

pub mod advancer;
pub mod editor;

pub use advancer::{CycleAdvancer, CyclePlan, PlannedStep};
pub use editor::CycleEditor;

use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTrigger {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleDefinition {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<CycleTrigger>,
    /// Restart from the first trigger after the last one instead of completing.
    #[serde(default, rename = "loop")]
    pub repeat: bool,
}

fn default_kind() -> String {
    "prompt".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Stopped,
    Complete,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCycle {
    pub name: String,
    pub status: CycleStatus,
    pub current_step: usize,
    /// Identifies one activation; an advance planned for an older activation is discarded.
    pub started_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub(crate) type CycleMap = BTreeMap<String, CycleDefinition>;

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cycle `{0}` does not exist")]
    NotFound(String),
    #[error("cycle `{0}` already exists")]
    AlreadyExists(String),
    #[error("cycle `{cycle}` has no trigger named `{trigger}`")]
    TriggerNotFound { cycle: String, trigger: String },
    #[error("invalid trigger order: {0}")]
    InvalidOrder(String),
    #[error("no cycle is active")]
    NoActiveCycle,
}

/// Read access plus the two capabilities.
#[derive(Debug, Clone)]
pub struct CycleBook {
    store: StateStore,
}

impl CycleBook {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<CycleDefinition>, CycleError> {
        Ok(self
            .store
            .read_json::<CycleMap>(records::CYCLES)?
            .unwrap_or_default()
            .into_values()
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<CycleDefinition>, CycleError> {
        Ok(self
            .store
            .read_json::<CycleMap>(records::CYCLES)?
            .unwrap_or_default()
            .remove(name))
    }

    pub fn active(&self) -> Result<Option<ActiveCycle>, CycleError> {
        Ok(self.store.read_json::<ActiveCycle>(records::ACTIVE_CYCLE)?)
    }

    pub fn editor(&self) -> CycleEditor {
        CycleEditor::new(self.store.clone())
    }

    pub fn advancer(&self) -> CycleAdvancer {
        CycleAdvancer::new(self.store.clone())
    }
}
