use super::{SeenDigests, Watcher, WatcherError, WatcherKind};
use crate::runtime::append_runtime_log;
use crate::sequencer::parse_turn_record;
use crate::shared::digest::fingerprint;
use crate::shared::ids::new_record_id;
use crate::shared::tagged::extract_blocks;
use crate::store::{records, StateStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Task,
    Goal,
}

impl WorkItemKind {
    pub const ALL: [WorkItemKind; 2] = [Self::Task, Self::Goal];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Goal => "goal",
        }
    }

    pub fn dir(self) -> &'static str {
        match self {
            Self::Task => "tasks",
            Self::Goal => "goals",
        }
    }

    pub fn markers(self) -> (&'static str, &'static str) {
        match self {
            Self::Task => ("###TASK_START###", "###TASK_END###"),
            Self::Goal => ("###GOAL_START###", "###GOAL_END###"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Open,
    Done,
}

impl WorkItemStatus {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim() {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown status `{other}`; expected open or done")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkItemKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub status: WorkItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
}

/// One JSON file per task or goal under `tasks/` and `goals/`.
#[derive(Debug, Clone)]
pub struct WorkItemBook {
    store: StateStore,
}

impl WorkItemBook {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        kind: WorkItemKind,
        title: &str,
        body: &str,
        source_digest: Option<String>,
    ) -> Result<WorkItem, StoreError> {
        let now = Utc::now();
        let item = WorkItem {
            id: new_record_id(kind.as_str()),
            kind,
            title: title.trim().to_string(),
            body: body.trim().to_string(),
            status: WorkItemStatus::Open,
            created_at: now,
            updated_at: now,
            source_digest,
        };
        self.store.write_json(&record_name(kind, &item.id), &item)?;
        Ok(item)
    }

    pub fn get(&self, kind: WorkItemKind, id: &str) -> Result<Option<WorkItem>, StoreError> {
        self.store.read_json(&record_name(kind, id))
    }

    /// Every readable item of `kind`, oldest first.
    pub fn list(&self, kind: WorkItemKind) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = Vec::new();
        for name in self.store.list(kind.dir())? {
            if let Some(item) = self.store.read_json::<WorkItem>(&name)? {
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    pub fn set_status(
        &self,
        kind: WorkItemKind,
        id: &str,
        status: WorkItemStatus,
    ) -> Result<Option<WorkItem>, StoreError> {
        let name = record_name(kind, id);
        if !self.store.exists(&name)? {
            return Ok(None);
        }
        self.store
            .update_json(&name, |slot: &mut Option<WorkItem>| {
                let item = slot.as_mut()?;
                if item.status != status {
                    item.status = status;
                    item.updated_at = Utc::now();
                }
                Some(item.clone())
            })
    }

    pub fn delete(&self, kind: WorkItemKind, id: &str) -> Result<bool, StoreError> {
        self.store.remove(&record_name(kind, id))
    }
}

fn record_name(kind: WorkItemKind, id: &str) -> String {
    format!("{}/{id}.json", kind.dir())
}

/// A block found in the Turn Record: first line is the title, the rest the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedItem {
    pub kind: WorkItemKind,
    pub digest: String,
    pub title: String,
    pub body: String,
}

pub fn split_title_body(block: &str) -> (String, String) {
    let mut lines = block.trim().splitn(2, '\n');
    let title = lines.next().unwrap_or_default().trim().to_string();
    let body = lines.next().unwrap_or_default().trim().to_string();
    (title, body)
}

pub struct TaskGoalWatcher {
    store: StateStore,
    book: WorkItemBook,
    seen: SeenDigests,
}

impl TaskGoalWatcher {
    pub fn new(store: StateStore) -> Self {
        Self {
            book: WorkItemBook::new(store.clone()),
            seen: SeenDigests::new(store.clone(), WatcherKind::TaskGoal),
            store,
        }
    }
}

impl Watcher for TaskGoalWatcher {
    type Action = Vec<ExtractedItem>;

    fn kind(&self) -> WatcherKind {
        WatcherKind::TaskGoal
    }

    fn poll(&mut self) -> Result<Option<Vec<ExtractedItem>>, WatcherError> {
        let Some(raw) = self.store.read(records::TURN_RECORD)? else {
            return Ok(None);
        };
        let seen = self.seen.load()?;
        let turn = parse_turn_record(&raw);
        let turn_id = turn.turn_id.as_deref().unwrap_or_default();
        let mut fresh: Vec<ExtractedItem> = Vec::new();
        for content in turn.contents() {
            for kind in WorkItemKind::ALL {
                let (start, end) = kind.markers();
                for block in extract_blocks(content, start, end) {
                    let digest = fingerprint(&format!("{turn_id}:{}:{block}", kind.as_str()));
                    if seen.contains(&digest) || fresh.iter().any(|item| item.digest == digest) {
                        continue;
                    }
                    let (title, body) = split_title_body(&block);
                    fresh.push(ExtractedItem {
                        kind,
                        digest,
                        title,
                        body,
                    });
                }
            }
        }
        Ok((!fresh.is_empty()).then_some(fresh))
    }

    fn apply(&mut self, items: Vec<ExtractedItem>) -> Result<(), WatcherError> {
        for extracted in items {
            let item = self.book.create(
                extracted.kind,
                &extracted.title,
                &extracted.body,
                Some(extracted.digest.clone()),
            )?;
            append_runtime_log(
                self.store.paths(),
                "info",
                "work_item.created",
                &format!("kind={} id={} title={}", item.kind.as_str(), item.id, item.title),
            );
            // Remembered per item so a later failure does not duplicate earlier records.
            self.seen.remember(&[extracted.digest])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_is_title_and_rest_is_body() {
        let (title, body) = split_title_body("Ship v1\n\nwrite docs\nadd tests");
        assert_eq!(title, "Ship v1");
        assert_eq!(body, "write docs\nadd tests");
        assert_eq!(split_title_body("Only a title"), ("Only a title".to_string(), String::new()));
    }
}
