use jobloop::gate::{GateError, GateWait, ModelGate, ModelState};
use jobloop::lock::{FileLock, LockPolicy};
use jobloop::runtime::{bootstrap_state_root, tail_runtime_log, StatePaths};
use jobloop::store::StateStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn gate() -> (tempfile::TempDir, ModelGate) {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let store = StateStore::new(&paths, FileLock::new(&paths, LockPolicy::default()));
    (dir, ModelGate::new(store))
}

fn short_wait() -> GateWait {
    GateWait {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(80),
    }
}

#[test]
fn gate_starts_idle_and_claim_marks_busy_until_release() {
    let (_dir, gate) = gate();
    assert!(gate.is_idle().expect("idle"));

    let claim = gate
        .try_claim("interactive", "hello")
        .expect("claim")
        .expect("granted");
    let status = gate.status().expect("status");
    assert_eq!(status.state, ModelState::Busy);
    assert_eq!(status.owner.as_deref(), Some("interactive"));
    assert_eq!(status.claim_id.as_deref(), Some(claim.claim_id()));
    assert!(gate.try_claim("watcher:cycle", "x").expect("second").is_none());

    claim.release().expect("release");
    assert!(gate.is_idle().expect("idle again"));
}

#[test]
fn dropping_a_claim_resets_the_gate() {
    let (_dir, gate) = gate();
    {
        let _claim = gate.try_claim("job_queue", "t").expect("claim").expect("granted");
        assert!(!gate.is_idle().expect("busy"));
    }
    assert!(gate.is_idle().expect("idle after drop"));
}

#[test]
fn racing_claimants_never_both_win() {
    let (_dir, gate) = gate();
    let gate = Arc::new(gate);
    let wins = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|n| {
            let gate = Arc::clone(&gate);
            let wins = Arc::clone(&wins);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if let Some(claim) = gate.try_claim(&format!("worker-{n}"), "race").expect("claim") {
                    wins.fetch_add(1, Ordering::SeqCst);
                    // Hold long enough that every other contender sees busy.
                    thread::sleep(Duration::from_millis(200));
                    std::mem::forget(claim);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("join");
    }
    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(!gate.is_idle().expect("still busy"));
}

#[test]
fn waiting_claim_times_out_and_can_be_cancelled() {
    let (_dir, gate) = gate();
    let _held = gate.try_claim("interactive", "t").expect("claim").expect("granted");

    let err = gate
        .claim("watcher:topic", "t", short_wait(), &|| false)
        .expect_err("busy gate");
    assert!(matches!(err, GateError::WaitTimeout { ref owner, .. } if owner == "interactive"));

    let err = gate
        .claim("watcher:topic", "t", short_wait(), &|| true)
        .expect_err("stop requested");
    assert!(matches!(err, GateError::Cancelled));
}

#[test]
fn waiting_claim_succeeds_once_the_holder_releases() {
    let (_dir, gate) = gate();
    let held = gate.try_claim("interactive", "t").expect("claim").expect("granted");
    let gate = Arc::new(gate);
    let waiter = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            let wait = GateWait {
                poll_interval: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
            };
            gate.claim("watcher:cycle", "next", wait, &|| false)
                .map(|claim| claim.owner().to_string())
        })
    };
    thread::sleep(Duration::from_millis(50));
    held.release().expect("release");
    let owner = waiter.join().expect("join").expect("claimed");
    assert_eq!(owner, "watcher:cycle");
}

#[test]
fn force_idle_clears_a_claim_left_by_a_dead_process() {
    let (_dir, gate) = gate();
    let claim = gate.try_claim("interactive", "t").expect("claim").expect("granted");
    std::mem::forget(claim);

    let previous = gate.force_idle().expect("force");
    assert_eq!(previous.state, ModelState::Busy);
    assert!(gate.is_idle().expect("idle"));
}

#[test]
fn release_retries_while_the_flag_record_is_locked() {
    let dir = tempdir().expect("tempdir");
    let paths = StatePaths::new(dir.path().join("root"));
    bootstrap_state_root(&paths).expect("bootstrap");
    let locks = FileLock::new(
        &paths,
        LockPolicy {
            timeout: Duration::from_millis(100),
            stale_after: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        },
    );
    let gate = ModelGate::new(StateStore::new(&paths, locks.clone()));
    let claim = gate.try_claim("sequencer", "t").expect("claim").expect("granted");

    let held = Arc::new(Barrier::new(2));
    let contender = {
        let locks = locks.clone();
        let held = Arc::clone(&held);
        thread::spawn(move || {
            let guard = locks
                .acquire("record:state/model_state.json")
                .expect("contender lock");
            held.wait();
            thread::sleep(Duration::from_millis(300));
            guard.release().expect("contender release");
        })
    };
    held.wait();
    claim.release().expect("release lands once the record is free");
    contender.join().expect("join");

    assert!(gate.is_idle().expect("idle"));
    assert!(gate.try_claim("watcher:cycle", "next").expect("claim").is_some());
    assert!(tail_runtime_log(&paths, 20)
        .iter()
        .any(|line| line.contains("gate.release_retry")));
}
