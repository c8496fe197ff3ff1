use super::{SeenDigests, Watcher, WatcherError, WatcherKind};
use crate::runtime::append_runtime_log;
use crate::sequencer::parse_turn_record;
use crate::shared::digest::fingerprint;
use crate::shared::tagged::extract_blocks;
use crate::shared::time::now_millis;
use crate::store::{records, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const TOPICS_START: &str = "###TOPICS_START###";
pub const TOPICS_END: &str = "###TOPICS_END###";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct IndexRecord {
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTopic {
    pub name: String,
    pub queued_at_ms: i64,
}

/// Topics already elaborated (`index.json`) and topics waiting for it (`pending.json`).
#[derive(Debug, Clone)]
pub struct TopicIndex {
    store: StateStore,
}

impl TopicIndex {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn indexed(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .read_json::<IndexRecord>(records::TOPIC_INDEX)?
            .unwrap_or_default()
            .names)
    }

    pub fn pending(&self) -> Result<Vec<PendingTopic>, StoreError> {
        Ok(self
            .store
            .read_json(records::TOPIC_PENDING)?
            .unwrap_or_default())
    }

    /// Queues every name that is neither indexed nor already pending and
    /// returns the ones that were added. Names compare case-insensitively.
    pub fn enqueue(&self, names: &[String]) -> Result<Vec<String>, StoreError> {
        let indexed: BTreeSet<String> = self
            .indexed()?
            .iter()
            .map(|name| name.to_lowercase())
            .collect();
        self.store
            .update_json(records::TOPIC_PENDING, |pending: &mut Vec<PendingTopic>| {
                let mut known: BTreeSet<String> =
                    pending.iter().map(|topic| topic.name.to_lowercase()).collect();
                known.extend(indexed.iter().cloned());
                let mut added = Vec::new();
                for name in names {
                    if known.insert(name.to_lowercase()) {
                        pending.push(PendingTopic {
                            name: name.clone(),
                            queued_at_ms: now_millis(),
                        });
                        added.push(name.clone());
                    }
                }
                added
            })
    }

    /// Moves `name` from pending into the index. Returns false if it was already indexed.
    pub fn mark_indexed(&self, name: &str) -> Result<bool, StoreError> {
        let key = name.to_lowercase();
        self.store
            .update_json(records::TOPIC_PENDING, |pending: &mut Vec<PendingTopic>| {
                pending.retain(|topic| topic.name.to_lowercase() != key);
            })?;
        self.store
            .update_json(records::TOPIC_INDEX, |index: &mut IndexRecord| {
                if index.names.iter().any(|known| known.to_lowercase() == key) {
                    return false;
                }
                index.names.push(name.trim().to_string());
                true
            })
    }
}

/// Splits a topics block into names: one per line or comma, list bullets and
/// numbering stripped, duplicates dropped.
pub fn parse_topic_names(block: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut names = Vec::new();
    for piece in block.split(['\n', ',']) {
        let name = strip_list_marker(piece.trim()).trim();
        if name.is_empty() {
            continue;
        }
        if seen.insert(name.to_lowercase()) {
            names.push(name.to_string());
        }
    }
    names
}

fn strip_list_marker(item: &str) -> &str {
    if let Some(rest) = item
        .strip_prefix("- ")
        .or_else(|| item.strip_prefix("* "))
        .or_else(|| item.strip_prefix("• "))
    {
        return rest;
    }
    let digits = item.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &item[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest;
        }
    }
    item
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBlock {
    pub digest: String,
    pub names: Vec<String>,
}

pub struct TopicWatcher {
    store: StateStore,
    index: TopicIndex,
    seen: SeenDigests,
}

impl TopicWatcher {
    pub fn new(store: StateStore) -> Self {
        Self {
            index: TopicIndex::new(store.clone()),
            seen: SeenDigests::new(store.clone(), WatcherKind::Topic),
            store,
        }
    }

    pub fn index(&self) -> &TopicIndex {
        &self.index
    }
}

impl Watcher for TopicWatcher {
    type Action = Vec<TopicBlock>;

    fn kind(&self) -> WatcherKind {
        WatcherKind::Topic
    }

    fn poll(&mut self) -> Result<Option<Vec<TopicBlock>>, WatcherError> {
        let Some(raw) = self.store.read(records::TURN_RECORD)? else {
            return Ok(None);
        };
        let seen = self.seen.load()?;
        let turn = parse_turn_record(&raw);
        let turn_id = turn.turn_id.as_deref().unwrap_or_default();
        let mut fresh: Vec<TopicBlock> = Vec::new();
        for content in turn.contents() {
            for block in extract_blocks(content, TOPICS_START, TOPICS_END) {
                let digest = fingerprint(&format!("{turn_id}:{block}"));
                if seen.contains(&digest) || fresh.iter().any(|b| b.digest == digest) {
                    continue;
                }
                fresh.push(TopicBlock {
                    digest,
                    names: parse_topic_names(&block),
                });
            }
        }
        Ok((!fresh.is_empty()).then_some(fresh))
    }

    fn apply(&mut self, blocks: Vec<TopicBlock>) -> Result<(), WatcherError> {
        let mut digests = Vec::with_capacity(blocks.len());
        for block in blocks {
            for name in &block.names {
                let line = serde_json::json!({
                    "at_ms": now_millis(),
                    "digest": block.digest,
                    "topic": name,
                });
                self.store.append_line(records::TOPIC_SEEN, &line.to_string())?;
            }
            let added = self.index.enqueue(&block.names)?;
            append_runtime_log(
                self.store.paths(),
                "info",
                "topic.block_indexed",
                &format!(
                    "digest={} names={} queued={}",
                    block.digest,
                    block.names.len(),
                    added.join("|")
                ),
            );
            digests.push(block.digest);
        }
        self.seen.remember(&digests)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_strip_bullets_numbering_and_duplicates() {
        let block = "- Rust\n2. Tokio, serde\n* rust\n\n3) File locks";
        assert_eq!(
            parse_topic_names(block),
            vec!["Rust", "Tokio", "serde", "File locks"]
        );
    }
}
