use jobloop::archive::{
    block_pairs, close_open_sessions, list_sessions, read_pair, ArchiveControl, ArchiveInbox,
    ArchiveManager, Pair, SessionMeta, SESSION_META_FILE,
};
use jobloop::lock::{FileLock, LockPolicy};
use jobloop::runtime::{bootstrap_state_root, StatePaths};
use jobloop::store::StateStore;
use jobloop::watchers::runner::{tick, TickOutcome};
use jobloop::watchers::verbatim::VerbatimAction;
use jobloop::watchers::{VerbatimWatcher, Watcher};
use std::fs;
use tempfile::tempdir;

fn pair(n: usize) -> Pair {
    Pair::new(format!("question {n}"), format!("answer {n}"))
}

fn read_meta(dir: &std::path::Path) -> SessionMeta {
    let raw = fs::read_to_string(dir.join(SESSION_META_FILE)).expect("session meta");
    serde_json::from_str(&raw).expect("parse meta")
}

#[test]
fn pairs_fill_blocks_and_roll_over_at_capacity() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("archive");
    let mut manager = ArchiveManager::open(&root, 3).expect("open");
    let session = manager.session_id().expect("session").to_string();
    assert!(session.starts_with("Session_"));

    let mut locations = Vec::new();
    for n in 1..=4 {
        locations.push(manager.archive(&pair(n)).expect("archive"));
    }
    assert_eq!(
        locations.iter().map(|l| (l.block, l.position)).collect::<Vec<_>>(),
        vec![(1, 1), (1, 2), (1, 3), (2, 1)]
    );
    assert!(locations.iter().all(|l| l.session_id == session));

    let block_one = root.join(&session).join("Block_1");
    let files = block_pairs(&block_one).expect("block files");
    assert_eq!(files.len(), 3);
    let first = read_pair(&files[0]).expect("read").expect("parse");
    assert_eq!(first.input, "question 1");
    assert_eq!(first.output, "answer 1");
    assert!(files[0]
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("0001_")));
}

#[test]
fn pair_text_with_tag_like_lines_survives_the_file_format() {
    let dir = tempdir().expect("tempdir");
    let mut manager = ArchiveManager::open(&dir.path().join("archive"), 10).expect("open");
    let tricky = Pair::new("#INPUT_END#\n\\escaped", "# heading\n#OUTPUT_END#");
    let location = manager.archive(&tricky).expect("archive");
    let read = read_pair(&location.path).expect("read").expect("parse");
    assert_eq!(read.input, tricky.input);
    assert_eq!(read.output, tricky.output);
}

#[test]
fn resume_continues_the_open_session_and_block() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("archive");
    let session = {
        let mut manager = ArchiveManager::open(&root, 2).expect("open");
        manager.archive(&pair(1)).expect("archive");
        manager.session_id().expect("session").to_string()
    };

    let mut resumed = ArchiveManager::resume(&root, 2).expect("resume");
    assert_eq!(resumed.session_id(), Some(session.as_str()));
    assert_eq!(resumed.current_block(), Some(1));
    assert_eq!(resumed.pairs_in_block(), 1);

    let next = resumed.archive(&pair(2)).expect("archive");
    assert_eq!((next.block, next.position), (1, 2));
    let rolled = resumed.archive(&pair(3)).expect("archive");
    assert_eq!((rolled.block, rolled.position), (2, 1));
}

#[test]
fn closing_stamps_the_end_marker_and_next_pair_opens_a_new_session() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("archive");
    let mut manager = ArchiveManager::open(&root, 5).expect("open");
    manager.archive(&pair(1)).expect("archive");
    let first = manager.close_session().expect("close").expect("was open");
    assert!(!read_meta(&root.join(&first)).is_open());
    assert!(ArchiveManager::resume(&root, 5)
        .expect("resume")
        .session_id()
        .is_none());

    let location = manager.archive(&pair(2)).expect("archive");
    assert_ne!(location.session_id, first);
    assert_eq!((location.block, location.position), (1, 1));

    let sessions = list_sessions(&root).expect("list");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s.meta.is_open()).count(), 1);
    assert_eq!(sessions.iter().map(|s| s.pairs).sum::<usize>(), 2);
}

#[test]
fn resume_closes_extra_open_sessions_and_keeps_the_newest() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("archive");
    let mut first = ArchiveManager::open(&root, 5).expect("first");
    first.archive(&pair(1)).expect("archive");
    // Simulate a second writer that started its own session.
    let mut second = ArchiveManager::resume(&root, 5).expect("second");
    let newest = second.force_new_session().expect("new session");
    let older = first.session_id().expect("older").to_string();
    fs::write(
        root.join(&older).join(SESSION_META_FILE),
        serde_json::to_string(&SessionMeta {
            ended_at: None,
            ..read_meta(&root.join(&older))
        })
        .expect("encode"),
    )
    .expect("reopen older");

    let resumed = ArchiveManager::resume(&root, 5).expect("resume");
    assert_eq!(resumed.session_id(), Some(newest.as_str()));
    assert_eq!(resumed.orphans_closed(), &[older.clone()]);
    assert!(!read_meta(&root.join(&older)).is_open());
}

#[test]
fn close_open_sessions_creates_nothing_when_the_archive_is_empty() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path().join("archive");
    assert!(close_open_sessions(&root).expect("close").is_empty());
    assert!(!root.exists());
}

fn watcher_setup(capacity: usize) -> (tempfile::TempDir, StatePaths, ArchiveInbox, VerbatimWatcher) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let store = StateStore::new(&paths, FileLock::new(&paths, LockPolicy::default()));
    let inbox = ArchiveInbox::new(store, true);
    let watcher = VerbatimWatcher::new(inbox.clone(), &paths, capacity);
    (dir, paths, inbox, watcher)
}

#[test]
fn verbatim_watcher_drains_pending_pairs_into_one_session() {
    let (_dir, paths, inbox, mut watcher) = watcher_setup(2);
    for n in 1..=3 {
        assert!(inbox.submit(pair(n)).expect("submit"));
    }
    assert_eq!(tick(&mut watcher).expect("tick"), TickOutcome::Applied);
    assert!(inbox.pending().expect("pending").is_empty());
    assert_eq!(tick(&mut watcher).expect("idle tick"), TickOutcome::Idle);

    let sessions = list_sessions(&paths.archive_dir()).expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].blocks, 2);
    assert_eq!(sessions[0].pairs, 3);
}

#[test]
fn toggling_the_switch_off_and_on_keeps_the_same_session() {
    let (_dir, paths, inbox, mut watcher) = watcher_setup(10);
    inbox.submit(pair(1)).expect("submit");
    tick(&mut watcher).expect("tick");

    assert!(inbox.set_enabled(false).expect("off"));
    assert!(!inbox.submit(pair(2)).expect("submit while off"));
    assert_eq!(watcher.poll().expect("poll"), None);

    assert!(!inbox.set_enabled(true).expect("on"));
    inbox.submit(pair(3)).expect("submit");
    tick(&mut watcher).expect("tick");

    let sessions = list_sessions(&paths.archive_dir()).expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].pairs, 2);
    assert!(sessions[0].meta.is_open());
}

#[test]
fn control_requests_run_before_pending_pairs() {
    let (_dir, paths, inbox, mut watcher) = watcher_setup(10);
    inbox.submit(pair(1)).expect("submit");
    tick(&mut watcher).expect("tick");
    inbox.submit(pair(2)).expect("submit");
    inbox.request(ArchiveControl::ForceNewSession).expect("request");

    assert_eq!(watcher.poll().expect("poll"), Some(VerbatimAction::Control));
    tick(&mut watcher).expect("control tick");
    tick(&mut watcher).expect("archive tick");

    let sessions = list_sessions(&paths.archive_dir()).expect("list");
    assert_eq!(sessions.len(), 2);
    assert!(!sessions[0].meta.is_open());
    assert_eq!(sessions[0].pairs, 1);
    assert_eq!(sessions[1].pairs, 1);
}

#[test]
fn shutdown_closes_the_session_and_asks_the_loop_to_exit() {
    let (_dir, paths, inbox, mut watcher) = watcher_setup(10);
    inbox.submit(pair(1)).expect("submit");
    tick(&mut watcher).expect("tick");
    assert!(!watcher.wants_exit());

    inbox.request(ArchiveControl::Shutdown).expect("request");
    tick(&mut watcher).expect("shutdown tick");
    assert!(watcher.wants_exit());
    let sessions = list_sessions(&paths.archive_dir()).expect("list");
    assert!(sessions.iter().all(|session| !session.meta.is_open()));
}

#[test]
fn archiving_the_same_pair_again_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let mut manager = ArchiveManager::open(&dir.path().join("archive"), 5).expect("open");
    let first = pair(1);
    let written = manager.archive(&first).expect("write");
    assert!(!written.already_archived);

    let again = manager.archive(&first).expect("retry");
    assert!(again.already_archived);
    assert_eq!(again.path, written.path);
    assert_eq!(manager.pairs_in_block(), 1);

    assert!(!manager.archive(&pair(2)).expect("next").already_archived);
    assert_eq!(manager.pairs_in_block(), 2);
}

#[test]
fn failed_acknowledge_does_not_duplicate_the_pair_on_retry() {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let locks = FileLock::new(
        &paths,
        LockPolicy {
            timeout: std::time::Duration::from_millis(100),
            stale_after: std::time::Duration::from_secs(60),
            poll_interval: std::time::Duration::from_millis(10),
        },
    );
    let inbox = ArchiveInbox::new(StateStore::new(&paths, locks.clone()), true);
    let mut watcher = VerbatimWatcher::new(inbox.clone(), &paths, 10);
    inbox.submit(pair(1)).expect("submit");

    let pending = inbox.pending().expect("pending");
    let held = locks
        .acquire("record:state/archive_pending.json")
        .expect("hold pending record");
    assert!(watcher.apply(VerbatimAction::Archive(pending)).is_err());
    held.release().expect("release");

    assert_eq!(tick(&mut watcher).expect("retry"), TickOutcome::Applied);
    assert!(inbox.pending().expect("pending").is_empty());
    let sessions = list_sessions(&paths.archive_dir()).expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].pairs, 1);
}
