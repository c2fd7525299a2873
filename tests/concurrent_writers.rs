//! # Concurrent Writer Tests
//!
//! Several transactions stage records at the same time from different
//! threads, sharing one segment pool and one table. Every record must stay
//! attributed to the transaction that staged it, whatever order the
//! transactions commit in.

use hashbrown::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use turdb_txn::mvcc::{
    BlockLayout, DataTable, TableRegistry, TransactionManager, TupleSlot, TxnStatus, UndoKind,
};
use turdb_txn::SegmentPool;

const UPDATES_PER_THREAD: u64 = 1000;

fn setup() -> (Arc<TransactionManager>, Arc<DataTable>) {
    let pool = SegmentPool::with_limit(1024);
    let tables = Arc::new(TableRegistry::new());
    let table = Arc::new(DataTable::new(1, BlockLayout::new(&[8]).unwrap(), pool.clone()).unwrap());
    tables.register(Arc::clone(&table)).unwrap();
    (Arc::new(TransactionManager::new(pool, tables)), table)
}

fn seed_rows(manager: &TransactionManager, table: &DataTable, count: usize) -> Vec<TupleSlot> {
    let mut txn = manager.begin().unwrap();
    let slots = (0..count)
        .map(|_| {
            let redo = {
                let mut redo = txn
                    .stage_write(table.id(), TupleSlot::from_raw(0), table.full_row_initializer())
                    .unwrap();
                redo.delta_mut().set_value(0, &0u64.to_le_bytes());
                redo.ptr()
            };
            table.insert(&mut txn, redo).unwrap()
        })
        .collect();
    manager.commit(txn).unwrap();
    slots
}

struct WriterOutcome {
    records: Vec<u64>,
    commit_ts: u64,
}

#[test]
fn test_two_writers_keep_records_attributed() {
    let (manager, table) = setup();
    let slots = seed_rows(&manager, &table, 2);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = slots
        .iter()
        .map(|&slot| {
            let manager = Arc::clone(&manager);
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut txn = manager.begin().unwrap();
                let identity = Arc::clone(txn.identity());
                let init = table.initializer(&[0]).unwrap();
                barrier.wait();

                for n in 0..UPDATES_PER_THREAD {
                    let redo = {
                        let mut redo = txn.stage_write(table.id(), slot, &init).unwrap();
                        redo.delta_mut().set_value(0, &(n + 1).to_le_bytes());
                        redo.ptr()
                    };
                    assert!(table.update(&mut txn, slot, redo).unwrap());

                    // The other writer may commit at any point.
                    if n % 100 == 0 {
                        assert_eq!(identity.status(), TxnStatus::InProgress(txn.txn_id()));
                    }
                }

                let own_id = txn.txn_id();
                let records: Vec<u64> = txn
                    .undo_records()
                    .map(|record| {
                        assert_eq!(record.timestamp(), own_id);
                        assert_eq!(record.slot(), slot);
                        assert_eq!(record.kind(), UndoKind::Update);
                        record.ptr().raw()
                    })
                    .collect();
                assert_eq!(records.len() as u64, UPDATES_PER_THREAD);

                // The other writer may still be staging while this commits.
                let commit_ts = manager.commit(txn).unwrap();
                assert_eq!(identity.status(), TxnStatus::Committed(commit_ts));
                WriterOutcome { records, commit_ts }
            })
        })
        .collect();

    let outcomes: Vec<WriterOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mut distinct = HashSet::new();
    for outcome in &outcomes {
        for &raw in &outcome.records {
            assert!(distinct.insert(raw), "record {:#x} staged twice", raw);
        }
    }
    assert_eq!(distinct.len() as u64, 2 * UPDATES_PER_THREAD);
    assert_ne!(outcomes[0].commit_ts, outcomes[1].commit_ts);

    // Each chain holds every update plus the insert, newest first.
    for &slot in &slots {
        assert_eq!(
            table.version_chain_len(slot).unwrap() as u64,
            UPDATES_PER_THREAD + 1
        );
    }
}

#[test]
fn test_concurrent_readers_see_consistent_snapshots() {
    let (manager, table) = setup();
    let slot = seed_rows(&manager, &table, 1)[0];
    let init = table.initializer(&[0]).unwrap();

    let snapshot = manager.begin().unwrap();
    let view = snapshot.read_view();

    let writer = {
        let manager = Arc::clone(&manager);
        let table = Arc::clone(&table);
        let init = init.clone();
        thread::spawn(move || {
            for n in 1..=200u64 {
                let mut txn = manager.begin().unwrap();
                let redo = {
                    let mut redo = txn.stage_write(table.id(), slot, &init).unwrap();
                    redo.delta_mut().set_value(0, &n.to_le_bytes());
                    redo.ptr()
                };
                assert!(table.update(&mut txn, slot, redo).unwrap());
                manager.commit(txn).unwrap();
            }
        })
    };

    let mut buf = vec![0u8; init.projected_row_size()];
    for _ in 0..200 {
        let mut out = init.initialize(&mut buf);
        assert!(table.select(view, slot, &mut out).unwrap());
        assert_eq!(out.as_row().value(0), Some(&0u64.to_le_bytes()[..]));
    }

    writer.join().unwrap();
    manager.commit(snapshot).unwrap();
}

#[test]
fn test_identity_moves_straight_to_commit_timestamp() {
    let (manager, table) = setup();
    let slots = seed_rows(&manager, &table, 1);

    for _ in 0..50 {
        let mut txn = manager.begin().unwrap();
        let uncommitted = txn.txn_id();
        let identity = Arc::clone(txn.identity());
        let redo = {
            let init = table.full_row_initializer();
            let mut redo = txn.stage_write(table.id(), slots[0], init).unwrap();
            redo.delta_mut().set_value(0, &7u64.to_le_bytes());
            redo.ptr()
        };
        assert!(table.update(&mut txn, slots[0], redo).unwrap());

        let done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));
        let observer = {
            let identity = Arc::clone(&identity);
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut seen = HashSet::new();
                barrier.wait();
                while !done.load(Ordering::Acquire) {
                    seen.insert(identity.load());
                }
                seen.insert(identity.load());
                seen
            })
        };

        barrier.wait();
        let commit_ts = manager.commit(txn).unwrap();
        done.store(true, Ordering::Release);

        let seen = observer.join().unwrap();
        assert!(seen.contains(&commit_ts));
        for value in &seen {
            assert!(
                *value == uncommitted || *value == commit_ts,
                "observed {:#x} between {:#x} and {}",
                value,
                uncommitted,
                commit_ts
            );
        }
    }
}
