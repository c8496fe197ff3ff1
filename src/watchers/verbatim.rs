use super::{Watcher, WatcherError, WatcherKind};
use crate::archive::{ArchiveControl, ArchiveInbox, ArchiveManager, Pair};
use crate::runtime::{append_runtime_log, StatePaths};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbatimAction {
    /// Control requests are waiting; they run before any pair is archived.
    Control,
    Archive(Vec<Pair>),
}

/// Drains pending pairs into the session/block/pair archive.
pub struct VerbatimWatcher {
    inbox: ArchiveInbox,
    paths: StatePaths,
    root: PathBuf,
    capacity: usize,
    exit: bool,
}

impl VerbatimWatcher {
    pub fn new(inbox: ArchiveInbox, paths: &StatePaths, capacity: usize) -> Self {
        Self {
            inbox,
            root: paths.archive_dir(),
            paths: paths.clone(),
            capacity,
            exit: false,
        }
    }

    /// Picks up whatever session is open on disk, so sessions closed or
    /// started by another process are respected.
    fn manager(&self) -> Result<ArchiveManager, WatcherError> {
        let manager = ArchiveManager::resume(&self.root, self.capacity)?;
        if !manager.orphans_closed().is_empty() {
            append_runtime_log(
                &self.paths,
                "warn",
                "archive.orphan_sessions_closed",
                &manager.orphans_closed().join(","),
            );
        }
        Ok(manager)
    }

    fn run_controls(&mut self) -> Result<(), WatcherError> {
        let requests = self.inbox.take_requests()?;
        if requests.is_empty() {
            return Ok(());
        }
        let mut manager = self.manager()?;
        for control in requests {
            let detail = match control {
                ArchiveControl::CloseSession => manager.close_session()?,
                ArchiveControl::ForceNewSession => Some(manager.force_new_session()?),
                ArchiveControl::Shutdown => {
                    self.exit = true;
                    manager.close_session()?
                }
            };
            append_runtime_log(
                &self.paths,
                "info",
                "archive.control",
                &format!(
                    "request={} session={}",
                    control.as_str(),
                    detail.as_deref().unwrap_or("none")
                ),
            );
        }
        Ok(())
    }

    fn archive_pairs(&mut self, pairs: Vec<Pair>) -> Result<(), WatcherError> {
        let mut manager = self.manager()?;
        for pair in pairs {
            let location = manager.archive(&pair)?;
            self.inbox.acknowledge(1)?;
            let event = if location.already_archived {
                "archive.pair_already_written"
            } else {
                "archive.pair_written"
            };
            append_runtime_log(
                &self.paths,
                "info",
                event,
                &format!(
                    "session={} block={} position={}",
                    location.session_id, location.block, location.position
                ),
            );
        }
        Ok(())
    }
}

impl Watcher for VerbatimWatcher {
    type Action = VerbatimAction;

    fn kind(&self) -> WatcherKind {
        WatcherKind::Verbatim
    }

    fn poll(&mut self) -> Result<Option<VerbatimAction>, WatcherError> {
        if self.inbox.has_requests()? {
            return Ok(Some(VerbatimAction::Control));
        }
        if !self.inbox.enabled()? {
            return Ok(None);
        }
        let pending = self.inbox.pending()?;
        Ok((!pending.is_empty()).then_some(VerbatimAction::Archive(pending)))
    }

    fn apply(&mut self, action: VerbatimAction) -> Result<(), WatcherError> {
        match action {
            VerbatimAction::Control => self.run_controls(),
            VerbatimAction::Archive(pairs) => self.archive_pairs(pairs),
        }
    }

    fn wants_exit(&self) -> bool {
        self.exit
    }
}
