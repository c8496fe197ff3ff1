use jobloop::lock::{FileLock, LockPolicy};
use jobloop::runtime::{bootstrap_state_root, tail_runtime_log, StatePaths};
use jobloop::store::{StateStore, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn store() -> (tempfile::TempDir, StateStore) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let store = StateStore::new(&paths, FileLock::new(&paths, LockPolicy::default()));
    (dir, store)
}

#[test]
fn absent_records_read_as_none() {
    let (_dir, store) = store();
    assert_eq!(store.read("state/nothing.txt").expect("read"), None);
    let value: Option<Vec<String>> = store.read_json("state/nothing.json").expect("read json");
    assert_eq!(value, None);
    assert!(!store.remove("state/nothing.txt").expect("remove"));
}

#[test]
fn malformed_json_reads_as_absent_and_update_heals_it() {
    let (_dir, store) = store();
    let path = store.path_of("automation/jobs.json").expect("path");
    fs::write(&path, "{ not json").expect("write garbage");

    let value: Option<BTreeMap<String, String>> =
        store.read_json("automation/jobs.json").expect("read");
    assert_eq!(value, None);
    let log = tail_runtime_log(store.paths(), 10).join("\n");
    assert!(log.contains("automation/jobs.json"), "log: {log}");

    store
        .update_json("automation/jobs.json", |jobs: &mut BTreeMap<String, String>| {
            jobs.insert("reply_job".to_string(), "answer".to_string());
        })
        .expect("update");
    let healed: BTreeMap<String, String> = store
        .read_json("automation/jobs.json")
        .expect("read healed")
        .expect("present");
    assert_eq!(healed.get("reply_job").map(String::as_str), Some("answer"));
}

#[test]
fn record_names_must_stay_under_the_root() {
    let (_dir, store) = store();
    for name in ["../escape.json", "/etc/passwd", "", "state/../../x"] {
        assert!(
            matches!(store.path_of(name), Err(StoreError::InvalidName(_))),
            "{name} should be rejected"
        );
    }
}

#[test]
fn concurrent_updates_are_not_lost() {
    let (_dir, store) = store();
    let store = Arc::new(store);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..10 {
                    store
                        .update_json("state/counter.json", |count: &mut u64| *count += 1)
                        .expect("update");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    let total: u64 = store
        .read_json("state/counter.json")
        .expect("read")
        .expect("present");
    assert_eq!(total, 40);
}

#[test]
fn list_returns_sorted_json_records_only() {
    let (_dir, store) = store();
    store.write_json("tasks/b.json", &1).expect("write b");
    store.write_json("tasks/a.json", &2).expect("write a");
    store.write("tasks/notes.txt", "ignored").expect("write txt");
    assert_eq!(
        store.list("tasks").expect("list"),
        vec!["tasks/a.json".to_string(), "tasks/b.json".to_string()]
    );
    assert!(store.list("goals/missing").expect("list missing").is_empty());
}

#[test]
fn append_line_accumulates_lines() {
    let (_dir, store) = store();
    store.append_line("topics/seen.jsonl", "one\n").expect("append one");
    store.append_line("topics/seen.jsonl", "two").expect("append two");
    assert_eq!(
        store.read("topics/seen.jsonl").expect("read").as_deref(),
        Some("one\ntwo\n")
    );
}
