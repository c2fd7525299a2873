//! # Log Hand-off Tests
//!
//! Transactions wired to a `LogManager` hand their redo segments over on
//! commit and abort. The manager writes them as checksummed frames and
//! returns the segments to the pool; `LogReader` reads the frames back.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use turdb_txn::mvcc::{
    BlockLayout, DataTable, LogRecord, LogRecordKind, TableRegistry, TransactionManager, TupleSlot,
};
use turdb_txn::wal::{LogFile, LogManager, LogReader};
use turdb_txn::{SegmentPool, SegmentSink};

struct Fixture {
    pool: SegmentPool,
    log: Arc<LogManager>,
    manager: TransactionManager,
    table: Arc<DataTable>,
}

fn fixture() -> Fixture {
    let pool = SegmentPool::with_limit(128);
    let tables = Arc::new(TableRegistry::new());
    let table = Arc::new(DataTable::new(2, BlockLayout::new(&[8, 2]).unwrap(), pool.clone()).unwrap());
    tables.register(Arc::clone(&table)).unwrap();
    let log = Arc::new(LogManager::new());
    let manager = TransactionManager::new(pool.clone(), tables)
        .with_log_sink(Arc::clone(&log) as Arc<dyn SegmentSink>);
    Fixture {
        pool,
        log,
        manager,
        table,
    }
}

fn insert(fx: &Fixture, value: u64) -> (u64, TupleSlot) {
    let mut txn = fx.manager.begin().unwrap();
    let begin = txn.start_time();
    let redo = {
        let mut redo = txn
            .stage_write(fx.table.id(), TupleSlot::from_raw(0), fx.table.full_row_initializer())
            .unwrap();
        redo.delta_mut().set_value(0, &value.to_le_bytes());
        redo.delta_mut().set_null(1);
        redo.ptr()
    };
    let slot = fx.table.insert(&mut txn, redo).unwrap();
    fx.manager.commit(txn).unwrap();
    (begin, slot)
}

#[test]
fn test_commit_hands_redo_segment_to_log() {
    let fx = fixture();
    let (begin, slot) = insert(&fx, 99);
    assert_eq!(fx.log.pending_segments(), 1);

    let mut seen = Vec::new();
    let processed = fx
        .log
        .process(|record| {
            assert_eq!(record.txn_begin(), begin);
            if let LogRecord::Redo(redo) = record {
                assert_eq!(redo.slot(), slot);
                assert_eq!(redo.delta().value(0), Some(&99u64.to_le_bytes()[..]));
                assert_eq!(redo.delta().value(1), None);
            }
            seen.push(record.kind());
            Ok(())
        })
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(seen, vec![LogRecordKind::Redo, LogRecordKind::Commit]);
    assert_eq!(fx.log.pending_segments(), 0);
}

#[test]
fn test_frames_round_trip_through_a_file() {
    let fx = fixture();
    let (first, slot) = insert(&fx, 1);

    let mut deleter = fx.manager.begin().unwrap();
    let second = deleter.start_time();
    assert!(fx.table.delete(&mut deleter, slot).unwrap());
    let commit_ts = fx.manager.commit(deleter).unwrap();

    let aborted = fx.manager.begin().unwrap();
    let third = aborted.start_time();
    fx.manager.abort(aborted);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("redo.log");
    let mut file = LogFile::create(&path).unwrap();
    assert_eq!(file.append_from(&fx.log).unwrap(), 5);
    assert_eq!(file.offset(), std::fs::metadata(&path).unwrap().len());
    drop(file);

    let mut reader = LogReader::open(&path).unwrap();
    let mut records = Vec::new();
    reader
        .for_each_record(|record| {
            let detail = match record {
                LogRecord::Commit { commit_ts, .. } => commit_ts,
                LogRecord::Delete { slot, .. } => slot.raw(),
                _ => 0,
            };
            records.push((record.txn_begin(), record.kind(), detail));
            Ok(())
        })
        .unwrap();

    assert_eq!(
        records,
        vec![
            (first, LogRecordKind::Redo, 0),
            (first, LogRecordKind::Commit, first + 1),
            (second, LogRecordKind::Delete, slot.raw()),
            (second, LogRecordKind::Commit, commit_ts),
            (third, LogRecordKind::Abort, 0),
        ]
    );
}

#[test]
fn test_flushed_segments_return_to_pool() {
    let fx = fixture();
    for value in 0..10 {
        insert(&fx, value);
    }
    assert_eq!(fx.log.pending_segments(), 10);

    let mut sink = Vec::new();
    assert_eq!(fx.log.flush_to(&mut sink).unwrap(), 20);
    assert_eq!(fx.log.pending_segments(), 0);

    // Only undo segments of the retired transactions remain checked out.
    assert_eq!(fx.pool.stats().outstanding, 10);
}

#[test]
fn test_corrupted_frame_is_detected() {
    let fx = fixture();
    insert(&fx, 7);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("redo.log");
    LogFile::create(&path).unwrap().append_from(&fx.log).unwrap();

    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).unwrap();
    let last = bytes.len() - 1;
    file.seek(SeekFrom::Start(last as u64)).unwrap();
    file.write_all(&[bytes[last] ^ 0x5A]).unwrap();
    drop(file);

    let mut reader = LogReader::open(&path).unwrap();
    assert!(reader.next_record().unwrap().is_some());
    let err = reader.next_record().unwrap_err();
    assert!(format!("{:#}", err).contains("checksum"));
}
