//! Conversation archive: Session → Block → Pair on disk.
//!
//! ```text
//! <archive root>/
//!   Session_20260131_090000/
//!     session.json          {id, started_at, ended_at?}
//!     Block_1/
//!       0001_20260131_090005_123456.txt
//!       ...
//!     Block_2/
//! ```
//!
//! A session is open while `session.json` has no `ended_at`. At most one
//! session is open; resuming picks it up together with its last block and the
//! number of pairs already in it.

pub mod inbox;

pub use inbox::{ArchiveControl, ArchiveInbox, ArchiveSwitch};

use crate::shared::fs_atomic::{atomic_write_file, is_temp_artifact};
use crate::shared::tagged::{join_content, push_segment};
use crate::shared::time::{compact_stamp, compact_stamp_micros};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SESSION_PREFIX: &str = "Session_";
pub const BLOCK_PREFIX: &str = "Block_";
pub const SESSION_META_FILE: &str = "session.json";

const PAIR_AT_PREFIX: &str = "#PAIR_AT:";
const INPUT_START: &str = "#INPUT_START#";
const INPUT_END: &str = "#INPUT_END#";
const OUTPUT_START: &str = "#OUTPUT_START#";
const OUTPUT_END: &str = "#OUTPUT_END#";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode session metadata {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One user input and the reply shown for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub input: String,
    pub output: String,
    pub at: DateTime<Utc>,
}

impl Pair {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            at: Utc::now(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{PAIR_AT_PREFIX}{}#\n", self.at.to_rfc3339());
        push_segment(&mut out, INPUT_START, INPUT_END, &self.input);
        push_segment(&mut out, OUTPUT_START, OUTPUT_END, &self.output);
        out
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let lines: Vec<&str> = raw.split('\n').collect();
        let at = lines
            .first()?
            .strip_prefix(PAIR_AT_PREFIX)?
            .strip_suffix('#')
            .and_then(|stamp| DateTime::parse_from_rfc3339(stamp).ok())?
            .with_timezone(&Utc);
        let input = segment(&lines, INPUT_START, INPUT_END)?;
        let output = segment(&lines, OUTPUT_START, OUTPUT_END)?;
        Some(Self { input, output, at })
    }
}

fn segment(lines: &[&str], start: &str, end: &str) -> Option<String> {
    let open = lines.iter().position(|line| *line == start)?;
    let close = open + 1 + lines[open + 1..].iter().position(|line| *line == end)?;
    Some(join_content(&lines[open + 1..close]))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionMeta {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairLocation {
    pub session_id: String,
    pub block: u32,
    /// 1-based position inside the block.
    pub position: usize,
    pub path: PathBuf,
    /// The pair was already the last one on disk and was not written again.
    pub already_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub meta: SessionMeta,
    pub blocks: u32,
    pub pairs: usize,
}

#[derive(Debug)]
struct OpenSession {
    dir: PathBuf,
    meta: SessionMeta,
    block: u32,
    pairs_in_block: usize,
}

impl OpenSession {
    fn block_dir(&self) -> PathBuf {
        self.dir.join(format!("{BLOCK_PREFIX}{}", self.block))
    }
}

#[derive(Debug)]
pub struct ArchiveManager {
    root: PathBuf,
    capacity: usize,
    open: Option<OpenSession>,
    orphans_closed: Vec<String>,
}

impl ArchiveManager {
    /// Resumes the open session or creates a new one with `Block_1`.
    pub fn open(root: &Path, capacity: usize) -> Result<Self, ArchiveError> {
        let mut manager = Self::resume(root, capacity)?;
        if manager.open.is_none() {
            manager.start_session()?;
        }
        Ok(manager)
    }

    /// Resumes the open session if there is one; never creates anything.
    /// Extra open sessions left behind by a crash are closed.
    pub fn resume(root: &Path, capacity: usize) -> Result<Self, ArchiveError> {
        let mut manager = Self {
            root: root.to_path_buf(),
            capacity: capacity.max(1),
            open: None,
            orphans_closed: Vec::new(),
        };
        let mut open_sessions: Vec<(PathBuf, SessionMeta)> = scan_sessions(root)?
            .into_iter()
            .filter(|(_, meta)| meta.is_open())
            .collect();
        open_sessions.sort_by(|a, b| {
            a.1.started_at
                .cmp(&b.1.started_at)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        let Some((dir, meta)) = open_sessions.pop() else {
            return Ok(manager);
        };
        for (orphan_dir, mut orphan) in open_sessions {
            orphan.ended_at = Some(Utc::now());
            write_meta(&orphan_dir, &orphan)?;
            manager.orphans_closed.push(orphan.id);
        }

        let mut session = OpenSession {
            dir,
            meta,
            block: 0,
            pairs_in_block: 0,
        };
        match last_block(&session.dir)? {
            Some(block) => {
                session.block = block;
                session.pairs_in_block = count_pairs(&session.block_dir())?;
            }
            None => {
                session.block = 1;
                create_dir(&session.block_dir())?;
            }
        }
        manager.open = Some(session);
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn session_id(&self) -> Option<&str> {
        self.open.as_ref().map(|session| session.meta.id.as_str())
    }

    pub fn current_block(&self) -> Option<u32> {
        self.open.as_ref().map(|session| session.block)
    }

    pub fn pairs_in_block(&self) -> usize {
        self.open.as_ref().map_or(0, |session| session.pairs_in_block)
    }

    /// Ids of extra open sessions that `resume` had to close.
    pub fn orphans_closed(&self) -> &[String] {
        &self.orphans_closed
    }

    /// Writes `pair` into the current block, starting a session or rolling to
    /// the next block first when needed. A pair identical to the last one on
    /// disk (same text and stamp) is not written twice, so a retried hand-off
    /// stays idempotent.
    pub fn archive(&mut self, pair: &Pair) -> Result<PairLocation, ArchiveError> {
        if self.open.is_none() {
            self.start_session()?;
        }
        let capacity = self.capacity;
        let session = self
            .open
            .as_mut()
            .ok_or_else(|| ArchiveError::Io {
                path: self.root.display().to_string(),
                source: std::io::Error::other("no open session"),
            })?;
        if let Some(last) = block_pairs(&session.block_dir())?.pop() {
            if read_pair(&last)?.as_ref() == Some(pair) {
                return Ok(PairLocation {
                    session_id: session.meta.id.clone(),
                    block: session.block,
                    position: session.pairs_in_block,
                    path: last,
                    already_archived: true,
                });
            }
        }
        if session.pairs_in_block >= capacity {
            session.block += 1;
            session.pairs_in_block = 0;
            create_dir(&session.block_dir())?;
        }

        let position = session.pairs_in_block + 1;
        let block_dir = session.block_dir();
        let mut path = block_dir.join(format!("{position:04}_{}.txt", compact_stamp_micros(pair.at)));
        let mut attempt = 1;
        while path.exists() {
            attempt += 1;
            path = block_dir.join(format!(
                "{position:04}_{}_{attempt}.txt",
                compact_stamp_micros(pair.at)
            ));
        }
        atomic_write_file(&path, pair.render().as_bytes()).map_err(io_err(&path))?;
        session.pairs_in_block = position;

        Ok(PairLocation {
            session_id: session.meta.id.clone(),
            block: session.block,
            position,
            path,
            already_archived: false,
        })
    }

    /// Stamps the open session's end marker. Returns the closed session id.
    pub fn close_session(&mut self) -> Result<Option<String>, ArchiveError> {
        let Some(mut session) = self.open.take() else {
            return Ok(None);
        };
        session.meta.ended_at = Some(Utc::now());
        if let Err(err) = write_meta(&session.dir, &session.meta) {
            let id = session.meta.id.clone();
            session.meta.ended_at = None;
            self.open = Some(session);
            tracing::warn!(session = %id, "failed to close session: {err}");
            return Err(err);
        }
        Ok(Some(session.meta.id))
    }

    /// Closes the current session (if any) and starts a fresh one.
    pub fn force_new_session(&mut self) -> Result<String, ArchiveError> {
        self.close_session()?;
        self.start_session()
    }

    fn start_session(&mut self) -> Result<String, ArchiveError> {
        create_dir(&self.root)?;
        let started_at = Utc::now();
        let base = format!("{SESSION_PREFIX}{}", compact_stamp(started_at));
        let mut id = base.clone();
        let mut suffix = 1;
        while self.root.join(&id).exists() {
            suffix += 1;
            id = format!("{base}_{suffix}");
        }
        let dir = self.root.join(&id);
        create_dir(&dir)?;
        let meta = SessionMeta {
            id: id.clone(),
            started_at,
            ended_at: None,
        };
        write_meta(&dir, &meta)?;
        let session = OpenSession {
            dir,
            meta,
            block: 1,
            pairs_in_block: 0,
        };
        create_dir(&session.block_dir())?;
        self.open = Some(session);
        Ok(id)
    }
}

/// Closes every open session under `root` without creating anything.
pub fn close_open_sessions(root: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut closed = Vec::new();
    for (dir, mut meta) in scan_sessions(root)? {
        if meta.is_open() {
            meta.ended_at = Some(Utc::now());
            write_meta(&dir, &meta)?;
            closed.push(meta.id);
        }
    }
    Ok(closed)
}

/// Every session under `root`, oldest first.
pub fn list_sessions(root: &Path) -> Result<Vec<SessionSummary>, ArchiveError> {
    let mut summaries = Vec::new();
    for (dir, meta) in scan_sessions(root)? {
        let blocks = block_numbers(&dir)?;
        let mut pairs = 0;
        for block in &blocks {
            pairs += count_pairs(&dir.join(format!("{BLOCK_PREFIX}{block}")))?;
        }
        summaries.push(SessionSummary {
            meta,
            blocks: blocks.len() as u32,
            pairs,
        });
    }
    summaries.sort_by(|a, b| {
        a.meta
            .started_at
            .cmp(&b.meta.started_at)
            .then_with(|| a.meta.id.cmp(&b.meta.id))
    });
    Ok(summaries)
}

pub fn read_pair(path: &Path) -> Result<Option<Pair>, ArchiveError> {
    let raw = fs::read_to_string(path).map_err(io_err(path))?;
    Ok(Pair::parse(&raw))
}

/// Pair files of one block in position order.
pub fn block_pairs(block_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files: Vec<PathBuf> = match fs::read_dir(block_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_pair_file(path))
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(source) => return Err(io_err(block_dir)(source)),
    };
    files.sort();
    Ok(files)
}

fn scan_sessions(root: &Path) -> Result<Vec<(PathBuf, SessionMeta)>, ArchiveError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_err(root)(source)),
    };
    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let is_session = dir.is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SESSION_PREFIX));
        if !is_session {
            continue;
        }
        let meta_path = dir.join(SESSION_META_FILE);
        let Ok(raw) = fs::read_to_string(&meta_path) else {
            tracing::warn!(path = %meta_path.display(), "session without metadata skipped");
            continue;
        };
        match serde_json::from_str::<SessionMeta>(&raw) {
            Ok(meta) => sessions.push((dir, meta)),
            Err(err) => {
                tracing::warn!(path = %meta_path.display(), "malformed session metadata skipped: {err}")
            }
        }
    }
    Ok(sessions)
}

fn block_numbers(session_dir: &Path) -> Result<Vec<u32>, ArchiveError> {
    let entries = match fs::read_dir(session_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(io_err(session_dir)(source)),
    };
    let mut numbers: Vec<u32> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name();
            let digits: String = name
                .to_str()?
                .strip_prefix(BLOCK_PREFIX)?
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();
            digits.parse().ok()
        })
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

fn last_block(session_dir: &Path) -> Result<Option<u32>, ArchiveError> {
    Ok(block_numbers(session_dir)?.last().copied())
}

fn count_pairs(block_dir: &Path) -> Result<usize, ArchiveError> {
    Ok(block_pairs(block_dir)?.len())
}

fn is_pair_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    path.is_file() && name.ends_with(".txt") && !is_temp_artifact(name)
}

fn create_dir(path: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(path).map_err(io_err(path))
}

fn write_meta(dir: &Path, meta: &SessionMeta) -> Result<(), ArchiveError> {
    let path = dir.join(SESSION_META_FILE);
    let encoded = serde_json::to_vec_pretty(meta).map_err(|source| ArchiveError::Encode {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(io_err(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_text_round_trips_tag_like_content() {
        let pair = Pair::new("#INPUT_END#\nsecond line", "answer\n\\escaped");
        let parsed = Pair::parse(&pair.render()).expect("parse");
        assert_eq!(parsed, pair);
    }

    #[test]
    fn pair_text_round_trips_crlf_content() {
        let pair = Pair::new("line one\r\nline two", "ok\r");
        let parsed = Pair::parse(&pair.render()).expect("parse");
        assert_eq!(parsed.input, "line one\r\nline two");
        assert_eq!(parsed, pair);
    }
}
