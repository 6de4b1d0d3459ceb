//! Crash and recovery scenarios.

use std::fs;

use bytes::Bytes;

use sable_common::{Fid, Lsn, Oid, TaggedPtr};
use sable_log::{Log, LogError};
use sable_oid::{ObjectFrame, ObjectStatus, OidError, OidManager, OidReplay, Snapshot};
use sable_test::utils::{crash, slot_states, TestDb};
use sable_test::workload::PayloadGen;

#[test]
fn test_committed_insert_survives_crash() {
    let db = TestDb::new();
    let (fid, oid, clsn) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"a")).unwrap();
        let clsn = txn.commit().unwrap();
        let durable = crash(engine);
        assert!(clsn.offset() <= durable.offset());
        (fid, oid, clsn)
    };

    let engine = db.open();
    let obj = engine
        .oids()
        .get_version(fid, oid, &Snapshot::at(clsn))
        .unwrap()
        .expect("committed version is visible at its commit LSN");
    assert_eq!(obj.clsn(), Some(clsn));
    assert_eq!(obj.data(engine.storage()).unwrap().as_deref(), Some(&b"a"[..]));
}

#[test]
fn test_uncommitted_insert_is_gone_after_crash() {
    let db = TestDb::new();
    let fid = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();

        let mut setup = engine.begin().unwrap();
        for i in 0..4u8 {
            setup.insert(fid, Bytes::from(vec![i])).unwrap();
        }
        setup.commit().unwrap();

        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"a")).unwrap();
        assert_eq!(oid, Oid::new(5));
        crash(engine);
        drop(txn);
        fid
    };

    let engine = db.open();
    assert!(engine.oids().oid_get(fid, Oid::new(5)).unwrap().is_none());
    assert_eq!(engine.read_latest(fid, Oid::new(4)).unwrap().as_deref(), Some(&[3u8][..]));

    // The lost slot is handed out again.
    let mut txn = engine.begin().unwrap();
    assert_eq!(txn.insert(fid, Bytes::from_static(b"b")).unwrap(), Oid::new(5));
    txn.commit().unwrap();
}

#[test]
fn test_visible_iff_durable_at_crash() {
    let db = TestDb::with_config(|c| c.with_sync_commit(false));
    let mut gen = PayloadGen::new(42);

    let (fid, written, durable) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut written = Vec::new();
        for i in 0..60 {
            let payload = gen.between(1, 300);
            let mut txn = engine.begin().unwrap();
            let oid = txn.insert(fid, payload.clone()).unwrap();
            let clsn = txn.commit().unwrap();
            written.push((oid, clsn, payload));
            if i == 29 {
                engine.flush().unwrap();
            }
        }
        let durable = crash(engine);
        (fid, written, durable)
    };

    let engine = db.open();
    let end = engine.recovery_report().end;
    assert!(end.offset() >= durable.offset());

    for (oid, clsn, payload) in &written[..30] {
        assert!(clsn.offset() <= durable.offset());
        assert_eq!(engine.read_latest(fid, *oid).unwrap().as_ref(), Some(payload));
    }
    for (oid, clsn, payload) in &written {
        let got = engine.read_latest(fid, *oid).unwrap();
        if clsn.offset() <= end.offset() {
            assert_eq!(got.as_ref(), Some(payload), "{oid:?} committed at {clsn:?} is durable");
        } else {
            assert_eq!(got, None, "{oid:?} committed at {clsn:?} was never durable");
        }
    }
}

#[test]
fn test_replaying_twice_changes_nothing() {
    let db = TestDb::new();
    {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut gen = PayloadGen::new(7);
        let mut oids = Vec::new();
        let mut txn = engine.begin().unwrap();
        for _ in 0..20 {
            oids.push(txn.insert(fid, gen.between(1, 64)).unwrap());
        }
        txn.commit().unwrap();

        for round in 0..5 {
            let mut txn = engine.begin().unwrap();
            for (i, oid) in oids.iter().enumerate() {
                if i % 5 == round {
                    txn.update(fid, *oid, gen.between(1, 64)).unwrap();
                }
            }
            txn.commit().unwrap();
        }
        let mut txn = engine.begin().unwrap();
        txn.delete(fid, oids[3]).unwrap();
        txn.commit().unwrap();
        engine.close().unwrap();
    }

    let log = Log::open(db.config().log.clone()).unwrap();
    let start = log.first_lsn();
    let end = log.durable_flushed_lsn().unwrap();
    let capacity = db.config().max_oids_per_file;

    let replayed = OidManager::new(capacity);
    log.redo_log(&replayed, &OidReplay, start, end).unwrap();
    let once = slot_states(&replayed);
    assert!(once.iter().any(|s| s.deleted));
    assert!(once.iter().all(|s| s.versions.len() == 1));

    log.redo_log(&replayed, &OidReplay, start, end).unwrap();
    assert_eq!(slot_states(&replayed), once);

    let fresh = OidManager::new(capacity);
    log.redo_log(&fresh, &OidReplay, start, end).unwrap();
    assert_eq!(slot_states(&fresh), once);
}

#[test]
fn test_checkpoint_then_crash() {
    let db = TestDb::new();
    let (fid, a, b, c) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        let a = txn.insert(fid, Bytes::from_static(b"a0")).unwrap();
        let b = txn.insert(fid, Bytes::from_static(b"b0")).unwrap();
        txn.commit().unwrap();

        engine.checkpoint().unwrap().expect("checkpoint written");

        let mut txn = engine.begin().unwrap();
        txn.update(fid, a, Bytes::from_static(b"a1")).unwrap();
        txn.delete(fid, b).unwrap();
        let c = txn.insert(fid, Bytes::from_static(b"c0")).unwrap();
        txn.commit().unwrap();
        crash(engine);
        (fid, a, b, c)
    };

    let engine = db.open();
    let report = engine.recovery_report();
    assert!(report.from_checkpoint);
    assert_eq!(engine.table("t"), Some(fid));
    assert_eq!(engine.read_latest(fid, a).unwrap().as_deref(), Some(&b"a1"[..]));
    assert_eq!(engine.read_latest(fid, b).unwrap(), None);
    assert_eq!(engine.read_latest(fid, c).unwrap().as_deref(), Some(&b"c0"[..]));
}

#[test]
fn test_second_checkpoint_replaces_first() {
    let db = TestDb::new();
    let (fid, a, b) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        let a = txn.insert(fid, Bytes::from_static(b"alpha")).unwrap();
        let b = txn.insert(fid, Bytes::from_static(b"beta")).unwrap();
        txn.commit().unwrap();
        engine.checkpoint().unwrap();
        engine.close().unwrap();
        (fid, a, b)
    };

    {
        let engine = db.open();
        let first = engine.log().checkpoint_mark().expect("checkpoint mark").start;

        let mut txn = engine.begin().unwrap();
        txn.update(fid, a, Bytes::from_static(b"alpha2")).unwrap();
        txn.commit().unwrap();

        let summary = engine.checkpoint().unwrap().expect("new commits since the first checkpoint");
        assert!(summary.start.offset() > first.offset());
        assert!(!engine.log().checkpoint_data_path(first).exists());

        // Versions that lived in the removed file are still readable.
        assert_eq!(engine.read_latest(fid, b).unwrap().as_deref(), Some(&b"beta"[..]));
        engine.close().unwrap();
    }

    let engine = db.open();
    assert_eq!(engine.read_latest(fid, a).unwrap().as_deref(), Some(&b"alpha2"[..]));
    assert_eq!(engine.read_latest(fid, b).unwrap().as_deref(), Some(&b"beta"[..]));
}

#[test]
fn test_checkpoint_on_close() {
    let db = TestDb::with_config(|c| c.with_checkpoint_on_close(true));
    let (fid, oid) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"kept")).unwrap();
        txn.commit().unwrap();
        (fid, oid)
    };

    let engine = db.open();
    assert!(engine.recovery_report().from_checkpoint);
    assert_eq!(engine.read_latest(fid, oid).unwrap().as_deref(), Some(&b"kept"[..]));
}

#[test]
fn test_zero_length_record_recovers_as_delete() {
    let db = TestDb::new();
    let (fid, oid) = {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        let oid = txn.insert(fid, Bytes::from_static(b"a")).unwrap();
        txn.commit().unwrap();
        engine.close().unwrap();
        (fid, oid)
    };
    {
        let log = Log::open(db.config().log.clone()).unwrap();
        let mut tx = log.new_tx_log();
        let frame = ObjectFrame::encode(Some(b""), TaggedPtr::NULL);
        tx.log_update(fid, oid, frame, db.config().align_bits).unwrap();
        let rec = tx.commit().unwrap();
        log.wait_for_durable(rec.commit_lsn).unwrap();
        log.close().unwrap();
    }

    let engine = db.open();
    let obj = engine.oids().latest_object(fid, oid).unwrap().unwrap();
    assert_eq!(obj.status(), ObjectStatus::Storage);
    assert_eq!(obj.data(engine.storage()).unwrap(), None);
    assert_eq!(obj.status(), ObjectStatus::Deleted);
    assert_eq!(engine.read_latest(fid, oid).unwrap(), None);
}

#[test]
fn test_record_for_unknown_file_fails_open() {
    let db = TestDb::new();
    {
        let log = Log::open(db.config().log.clone()).unwrap();
        let mut tx = log.new_tx_log();
        tx.log_insert(Fid::new(9), Oid::new(1), Bytes::from_static(b"orphan"), 4)
            .unwrap();
        let rec = tx.commit().unwrap();
        log.wait_for_durable(rec.commit_lsn).unwrap();
        log.close().unwrap();
    }

    let err = db.try_open().unwrap_err();
    assert!(matches!(err, OidError::Log(LogError::ReplayFailed { .. })));
    assert!(err.is_fatal());
}

#[test]
fn test_corrupt_checkpoint_fails_open() {
    let db = TestDb::new();
    {
        let engine = db.open();
        let fid = engine.create_table("t").unwrap();
        let mut txn = engine.begin().unwrap();
        txn.insert(fid, Bytes::from_static(b"x")).unwrap();
        txn.commit().unwrap();
        engine.checkpoint().unwrap();
        engine.close().unwrap();
    }

    let log = Log::open(db.config().log.clone()).unwrap();
    let start: Lsn = log.checkpoint_mark().unwrap().start;
    let path = log.checkpoint_data_path(start);
    log.close().unwrap();
    drop(log);

    let mut raw = fs::read(&path).unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xff;
    fs::write(&path, raw).unwrap();

    let err = db.try_open().unwrap_err();
    assert!(matches!(err, OidError::CorruptCheckpoint { .. }));
}
