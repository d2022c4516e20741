//! Visibility across isolation levels and nested transactions.

use rangedb_core::{CoreError, IsolationLevel, KeyBound, TxnState};
use rangedb_testkit::{read_committed, scan_all, TestEnv};

#[test]
fn each_snapshot_reader_sees_the_write_before_it() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let mut readers = Vec::new();

    for i in 0u32..1000 {
        env.transaction(IsolationLevel::Serializable, |txn| {
            db.put(txn, b"k", &i.to_be_bytes())
        })
        .unwrap();
        readers.push(
            env.begin(None, IsolationLevel::SnapshotRepeatableRead)
                .unwrap(),
        );
    }

    for (i, reader) in readers.into_iter().enumerate() {
        let value = db.get(reader, b"k").unwrap().unwrap();
        assert_eq!(value, (i as u32).to_be_bytes().to_vec());
        env.commit(reader).unwrap();
    }
}

#[test]
fn read_committed_refreshes_per_statement() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let rc = env.begin(None, IsolationLevel::ReadCommitted).unwrap();
    let snap = env
        .begin(None, IsolationLevel::SnapshotRepeatableRead)
        .unwrap();
    assert_eq!(db.get(rc, b"k").unwrap(), None);
    assert_eq!(db.get(snap, b"k").unwrap(), None);

    for round in 0u8..3 {
        env.transaction(IsolationLevel::Serializable, |txn| {
            db.put(txn, b"k", &[round])
        })
        .unwrap();
        assert_eq!(db.get(rc, b"k").unwrap(), Some(vec![round]));
        assert_eq!(db.get(snap, b"k").unwrap(), None);
    }
    env.commit(rc).unwrap();
    env.commit(snap).unwrap();
}

#[test]
fn aborted_child_leaves_parent_untouched() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let parent = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.put(parent, b"k", b"parent").unwrap();

    let child = env
        .begin(Some(parent), IsolationLevel::Serializable)
        .unwrap();
    assert_eq!(env.txn_info(parent).unwrap().children, vec![child]);
    db.put(child, b"k", b"child").unwrap();
    db.put(child, b"only-child", b"x").unwrap();
    assert_eq!(db.get(child, b"k").unwrap(), Some(b"child".to_vec()));
    env.abort(child).unwrap();

    assert_eq!(db.get(parent, b"k").unwrap(), Some(b"parent".to_vec()));
    assert_eq!(db.get(parent, b"only-child").unwrap(), None);
    env.commit(parent).unwrap();
    assert_eq!(read_committed(&env, &db, b"k"), Some(b"parent".to_vec()));
}

#[test]
fn committed_child_is_visible_only_through_parent() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let parent = env.begin(None, IsolationLevel::Serializable).unwrap();
    let child = env
        .begin(Some(parent), IsolationLevel::Serializable)
        .unwrap();
    db.put(child, b"k", b"child").unwrap();
    env.commit(child).unwrap();
    assert_eq!(env.txn_state(child), Some(TxnState::Committed));

    let outsider = env
        .begin(None, IsolationLevel::SnapshotRepeatableRead)
        .unwrap();
    assert_eq!(db.get(outsider, b"k").unwrap(), None);
    assert_eq!(db.get(parent, b"k").unwrap(), Some(b"child".to_vec()));

    env.abort(parent).unwrap();
    assert_eq!(read_committed(&env, &db, b"k"), None);
    assert_eq!(env.txn_state(child), None);
    env.commit(outsider).unwrap();
}

#[test]
fn parent_is_blocked_while_child_is_live() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let parent = env.begin(None, IsolationLevel::Serializable).unwrap();
    let child = env
        .begin(Some(parent), IsolationLevel::Serializable)
        .unwrap();
    assert!(matches!(
        db.put(parent, b"k", b"v"),
        Err(CoreError::InvalidOperation { .. })
    ));
    assert!(env
        .begin(Some(parent), IsolationLevel::ReadCommitted)
        .is_err());
    env.commit(child).unwrap();
    db.put(parent, b"k", b"v").unwrap();
    env.commit(parent).unwrap();
}

#[test]
fn serializable_range_scan_has_no_phantoms() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    env.transaction(IsolationLevel::Serializable, |txn| {
        db.put(txn, b"b", b"1")?;
        db.put(txn, b"y", b"1")
    })
    .unwrap();

    let reader = env.begin(None, IsolationLevel::Serializable).unwrap();
    let first = db
        .cursor(reader)
        .collect_range(KeyBound::Key(b"a".to_vec()), KeyBound::Key(b"z".to_vec()))
        .unwrap();

    let writer = env.begin(None, IsolationLevel::Serializable).unwrap();
    for key in [&b"a"[..], b"m", b"z"] {
        assert!(db.put(writer, key, b"phantom").unwrap_err().is_lock_error());
    }
    // Outside the scanned span is free.
    db.put(writer, b"zz", b"ok").unwrap();
    env.commit(writer).unwrap();

    let second = db
        .cursor(reader)
        .collect_range(KeyBound::Key(b"a".to_vec()), KeyBound::Key(b"z".to_vec()))
        .unwrap();
    assert_eq!(first, second);
    env.commit(reader).unwrap();

    let check = env.begin(None, IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(scan_all(&db, check).len(), 3);
    env.commit(check).unwrap();
}

#[test]
fn snapshot_reads_ignore_write_locks() {
    let env = TestEnv::memory();
    let db = env.open_db("t").unwrap();
    let reader = env
        .begin(None, IsolationLevel::SnapshotRepeatableRead)
        .unwrap();
    let writer = env.begin(None, IsolationLevel::Serializable).unwrap();
    db.put(writer, b"k", b"v").unwrap();
    // Snapshot reads take no locks, so the writer's lock does not block them.
    assert_eq!(db.get(reader, b"k").unwrap(), None);
    env.commit(writer).unwrap();
    assert_eq!(db.get(reader, b"k").unwrap(), None);
    env.commit(reader).unwrap();
}
