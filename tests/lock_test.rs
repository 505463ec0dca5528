//! Integration tests for the marker-file lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use batchq::Error;
use batchq::lock::{LockManager, LockOptions, LockState};

fn options(holder: &str) -> LockOptions {
    LockOptions {
        lease: Duration::from_millis(5000),
        max_retries: 10,
        backoff: Duration::from_millis(10),
        holder: holder.to_string(),
    }
}

#[test]
fn only_one_holder_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".allocation.lock");
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            std::thread::spawn(move || {
                let mut opts = options(&format!("worker-{i}"));
                opts.max_retries = 1000;
                let manager = LockManager::new(path, opts);
                for _ in 0..5 {
                    manager
                        .with_lock(|_guard| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(!path.exists());
}

#[test]
fn drop_releases_marker() {
    let dir = tempfile::tempdir().unwrap();
    let manager = LockManager::new(dir.path().join("lock"), options("a"));

    {
        let guard = manager.acquire().unwrap();
        assert!(guard.path().exists());
        assert!(matches!(manager.inspect(), LockState::Held { .. }));
        guard.verify().unwrap();
    }
    assert_eq!(manager.inspect(), LockState::Free);
}

#[test]
fn error_inside_critical_section_still_releases() {
    let dir = tempfile::tempdir().unwrap();
    let manager = LockManager::new(dir.path().join("lock"), options("a"));

    let result: batchq::Result<()> =
        manager.with_lock(|_| Err(Error::Other("worker failed".into())));
    assert!(result.is_err());
    assert_eq!(manager.inspect(), LockState::Free);
}

#[test]
fn stale_marker_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");
    std::fs::write(&path, "crashed-worker:1000").unwrap();

    let manager = LockManager::new(&path, options("fresh"));
    assert!(matches!(manager.inspect(), LockState::Stale { .. }));

    let guard = manager.acquire().unwrap();
    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("fresh:"));
    drop(guard);
    assert!(!path.exists());
}

#[test]
fn live_marker_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");
    let holder = LockManager::new(&path, options("holder"));
    let _held = holder.acquire().unwrap();

    let mut opts = options("waiter");
    opts.max_retries = 3;
    let waiter = LockManager::new(&path, opts);
    let err = waiter.acquire().unwrap_err();
    match err {
        Error::LockTimeout { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    // The holder's marker is untouched.
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("holder:"));
}

#[test]
fn release_leaves_foreign_marker_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");
    let manager = LockManager::new(&path, options("first"));

    let guard = manager.acquire().unwrap();
    // Someone reclaimed the lock behind our back.
    std::fs::write(&path, "second:99999999999999").unwrap();

    assert!(matches!(guard.verify(), Err(Error::LockLost { .. })));
    guard.release();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "second:99999999999999"
    );
}

#[test]
fn release_tolerates_missing_marker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");
    let manager = LockManager::new(&path, options("a"));

    let guard = manager.acquire().unwrap();
    std::fs::remove_file(&path).unwrap();
    guard.release();
    assert!(!path.exists());
}

#[test]
fn expired_guard_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options("a");
    opts.lease = Duration::from_millis(20);
    let manager = LockManager::new(dir.path().join("lock"), opts);

    let guard = manager.acquire().unwrap();
    std::thread::sleep(Duration::from_millis(40));
    assert!(guard.is_expired());
    assert!(matches!(guard.verify(), Err(Error::LockLost { .. })));
}

#[test]
fn waiter_takes_over_after_holder_lease_expires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");

    let mut holder_opts = options("holder");
    holder_opts.lease = Duration::from_millis(100);
    let holder = LockManager::new(&path, holder_opts);
    // A holder that never releases, like a hung or killed worker.
    std::mem::forget(holder.acquire().unwrap());
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("holder:"));

    let mut waiter_opts = options("waiter");
    waiter_opts.lease = Duration::from_millis(100);
    waiter_opts.backoff = Duration::from_millis(20);
    waiter_opts.max_retries = 50;
    let waiter = LockManager::new(&path, waiter_opts);

    let started = std::time::Instant::now();
    let guard = waiter.acquire().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("waiter:"));
    guard.verify().unwrap();
    drop(guard);
    assert!(!path.exists());
}

#[test]
fn displaced_holder_detects_loss_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lock");
    let first = LockManager::new(&path, options("first"));
    let guard = first.acquire().unwrap();
    guard.verify().unwrap();

    // A reclaimer moves the live marker aside and a third process creates a
    // fresh one before it can be restored.
    let aside = dir.path().join("lock.aside");
    std::fs::rename(&path, &aside).unwrap();
    let third = LockManager::new(&path, options("third"));
    let winner = third.acquire().unwrap();
    let _ = std::fs::hard_link(&aside, &path);
    std::fs::remove_file(&aside).unwrap();

    assert!(matches!(guard.verify(), Err(Error::LockLost { .. })));
    winner.verify().unwrap();

    drop(guard);
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("third:"));
    drop(winner);
    assert!(!path.exists());
}
