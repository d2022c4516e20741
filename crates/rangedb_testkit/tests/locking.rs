//! Lock manager scenarios driven through the environment API.

use rangedb_core::{
    CoreError, DeadlockDetection, EnvConfig, Environment, IsolationLevel, KeyBound, KeyRange,
    LockMode,
};
use rangedb_testkit::{fast_config, init_tracing, TestEnv};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn wait_for_waiters(env: &Environment, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while env.lock_waiters() < count {
        assert!(Instant::now() < deadline, "no waiter appeared");
        thread::yield_now();
    }
}

#[test]
fn deadlock_victim_is_the_latest_requester() {
    let env = TestEnv::memory_with(fast_config().lock_timeout(Duration::from_secs(5)));
    let db = env.open_db("t").unwrap();
    let a = env.begin(None, IsolationLevel::Serializable).unwrap();
    let b = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.lock_range(a, KeyRange::point(b"L"), LockMode::Write).unwrap();
    db.lock_range(b, KeyRange::point(b"M"), LockMode::Write).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| db.lock_range(a, KeyRange::point(b"M"), LockMode::Write));
        wait_for_waiters(&env, 1);

        let err = db
            .lock_range(b, KeyRange::point(b"L"), LockMode::Write)
            .unwrap_err();
        assert!(matches!(err, CoreError::Deadlock { txn } if txn == b));

        // The victim is still intact and can be aborted.
        env.abort(b).unwrap();
        waiter.join().unwrap().unwrap();
    });
    env.commit(a).unwrap();
    assert_eq!(env.stats().deadlocks, 1);
}

#[test]
fn polling_detection_breaks_cycle() {
    init_tracing();
    let env = TestEnv::memory_with(
        fast_config()
            .deadlock_detection(DeadlockDetection::Polling)
            .lock_timeout(Duration::from_secs(10)),
    );
    let db = env.open_db("t").unwrap();
    let a = env.begin(None, IsolationLevel::Serializable).unwrap();
    let b = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.lock_range(a, KeyRange::point(b"L"), LockMode::Write).unwrap();
    db.lock_range(b, KeyRange::point(b"M"), LockMode::Write).unwrap();

    thread::scope(|s| {
        let first = s.spawn(|| db.lock_range(a, KeyRange::point(b"M"), LockMode::Write));
        wait_for_waiters(&env, 1);
        let second = s.spawn(|| db.lock_range(b, KeyRange::point(b"L"), LockMode::Write));
        wait_for_waiters(&env, 2);

        let victims = env.detect_deadlocks().unwrap();
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].txn, b);

        assert!(matches!(
            second.join().unwrap(),
            Err(CoreError::Deadlock { .. })
        ));
        env.abort(b).unwrap();
        first.join().unwrap().unwrap();
    });
    env.commit(a).unwrap();
}

#[test]
fn nowait_then_retry_after_holder_finishes() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let holder = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.put(holder, b"k", b"1").unwrap();

    let other = env.begin(None, IsolationLevel::Serializable).unwrap();
    let err = db
        .try_lock_range(other, KeyRange::point(b"k"), LockMode::Write)
        .unwrap_err();
    assert!(matches!(err, CoreError::LockNotGranted { .. }));
    let err = db.put(other, b"k", b"2").unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout { .. }));
    env.abort(other).unwrap();

    env.commit(holder).unwrap();
    let retry = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.put(retry, b"k", b"2").unwrap();
    env.commit(retry).unwrap();
}

#[test]
fn write_locks_are_mutually_exclusive() {
    let env = TestEnv::memory_with(fast_config().lock_timeout(Duration::from_secs(10)));
    let db = env.open_db("t").unwrap();
    let inside = AtomicUsize::new(0);
    let entered = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    let txn = env.begin(None, IsolationLevel::Serializable).unwrap();
                    let range = KeyRange::span(
                        KeyBound::Key(b"a".to_vec()),
                        KeyBound::Key(b"m".to_vec()),
                    );
                    db.lock_range(txn, range, LockMode::Write).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::SeqCst);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    env.commit(txn).unwrap();
                }
            });
        }
    });
    assert_eq!(entered.load(Ordering::SeqCst), 100);
}

#[test]
fn unshared_reads_block_other_readers() {
    let env = TestEnv::memory_with(fast_config().shared_read_locks(false));
    let db = env.open_db("t").unwrap();
    let a = env.begin(None, IsolationLevel::Serializable).unwrap();
    let b = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.get(a, b"k").unwrap();
    assert!(db.get(b, b"k").unwrap_err().is_lock_error());
    env.commit(a).unwrap();
    env.abort(b).unwrap();

    let shared = TestEnv::memory();
    let db = shared.open_db("t").unwrap();
    let a = shared.begin(None, IsolationLevel::Serializable).unwrap();
    let b = shared.begin(None, IsolationLevel::Serializable).unwrap();
    db.get(a, b"k").unwrap();
    db.get(b, b"k").unwrap();
    shared.commit(a).unwrap();
    shared.commit(b).unwrap();
}

#[test]
fn escalation_never_covers_another_family() {
    let env = TestEnv::memory_with(EnvConfig::default().lock_escalation_threshold(1_000));
    let db = env.open_db("t").unwrap();
    let reader = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.lock_range(reader, KeyRange::point(b"m"), LockMode::Read)
        .unwrap();

    let writer = env.begin(None, IsolationLevel::Serializable).unwrap();
    for key in b'a'..=b'z' {
        if key != b'm' {
            db.put(writer, &[key], b"v").unwrap();
        }
    }
    let before = env.lock_ranges(&db).unwrap().len();
    let merged = env.escalate(&db).unwrap();
    let after = env.lock_ranges(&db).unwrap();
    assert!(merged > 0);
    assert_eq!(after.len(), before - merged);
    assert!(after.len() <= 3, "{after:?}");

    let cmp = rangedb_core::BytewiseComparator;
    for lock in after.iter().filter(|lock| lock.owner == writer) {
        assert!(!lock.range.contains_key(b"m", &cmp));
    }
    env.commit(writer).unwrap();
    env.commit(reader).unwrap();
}

#[test]
fn child_reacquires_ancestor_range_and_abort_releases_own_locks() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let parent = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.lock_range(parent, KeyRange::point(b"p"), LockMode::Write)
        .unwrap();

    let child = env
        .begin(Some(parent), IsolationLevel::Serializable)
        .unwrap();
    db.lock_range(child, KeyRange::point(b"p"), LockMode::Write)
        .unwrap();
    db.lock_range(child, KeyRange::point(b"c"), LockMode::Write)
        .unwrap();
    env.abort(child).unwrap();

    let outsider = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.try_lock_range(outsider, KeyRange::point(b"c"), LockMode::Write)
        .unwrap();
    assert!(db
        .try_lock_range(outsider, KeyRange::point(b"p"), LockMode::Write)
        .is_err());
    env.commit(outsider).unwrap();
    env.commit(parent).unwrap();
}

#[test]
fn escalated_parent_locks_leave_child_abort_intact() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let parent = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.lock_range(parent, KeyRange::point(b"a"), LockMode::Write)
        .unwrap();
    db.lock_range(parent, KeyRange::point(b"b"), LockMode::Write)
        .unwrap();
    let child = env
        .begin(Some(parent), IsolationLevel::Serializable)
        .unwrap();
    db.lock_range(child, KeyRange::point(b"c"), LockMode::Write)
        .unwrap();

    assert_eq!(env.escalate(&db).unwrap(), 1);
    env.abort(child).unwrap();
    let ranges = env.lock_ranges(&db).unwrap();
    assert!(ranges.iter().all(|lock| lock.holder == parent), "{ranges:?}");

    let outsider = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.try_lock_range(outsider, KeyRange::point(b"c"), LockMode::Write)
        .unwrap();
    assert!(db
        .try_lock_range(outsider, KeyRange::point(b"a"), LockMode::Write)
        .is_err());
    env.commit(outsider).unwrap();
    env.commit(parent).unwrap();
}
