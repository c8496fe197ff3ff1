//! One-shot schedule entries that queue a job once their due time passes.

use crate::shared::ids::new_record_id;
use crate::store::{records, StateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub job_name: String,
    pub due_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fired_at.is_none() && self.due_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleBook {
    store: StateStore,
}

impl ScheduleBook {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn add(&self, job_name: &str, due_at: DateTime<Utc>) -> Result<ScheduleEntry, StoreError> {
        // Millisecond precision is what the record promises.
        let due_at = DateTime::from_timestamp_millis(due_at.timestamp_millis()).unwrap_or(due_at);
        let entry = ScheduleEntry {
            id: new_record_id("sched"),
            job_name: job_name.to_string(),
            due_at,
            fired_at: None,
            created_at: Utc::now(),
        };
        let stored = entry.clone();
        self.store
            .update_json(records::SCHEDULES, |entries: &mut Vec<ScheduleEntry>| {
                entries.push(stored);
                entries.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
            })?;
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self
            .store
            .read_json::<Vec<ScheduleEntry>>(records::SCHEDULES)?
            .unwrap_or_default())
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store
            .update_json(records::SCHEDULES, |entries: &mut Vec<ScheduleEntry>| {
                let before = entries.len();
                entries.retain(|entry| entry.id != id);
                entries.len() != before
            })
    }

    /// Entries due at `now` and not yet fired. Read-only.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect())
    }

    /// Marks the given entries fired in one locked update and returns only
    /// those this call fired; an entry already fired by anyone is skipped.
    pub fn mark_fired(
        &self,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, StoreError> {
        self.store
            .update_json(records::SCHEDULES, |entries: &mut Vec<ScheduleEntry>| {
                let mut fired = Vec::new();
                for entry in entries.iter_mut() {
                    if ids.contains(&entry.id) && entry.is_due(now) {
                        entry.fired_at = Some(now);
                        fired.push(entry.clone());
                    }
                }
                fired
            })
    }

    /// Drops fired entries older than `keep`; returns how many were removed.
    pub fn prune_fired(&self, now: DateTime<Utc>, keep: Duration) -> Result<usize, StoreError> {
        self.store
            .update_json(records::SCHEDULES, |entries: &mut Vec<ScheduleEntry>| {
                let before = entries.len();
                entries.retain(|entry| match entry.fired_at {
                    Some(fired_at) => now - fired_at < keep,
                    None => true,
                });
                before - entries.len()
            })
    }
}
