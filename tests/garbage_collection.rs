//! # Garbage Collection Tests
//!
//! Retired transactions are unlinked from version chains once every active
//! transaction can see their commit, and their segments go back to the pool
//! once no reader that started before the unlink is left.

use std::sync::Arc;
use turdb_txn::mvcc::{
    BlockLayout, DataTable, GarbageCollector, TableRegistry, TransactionManager, TupleSlot,
};
use turdb_txn::SegmentPool;

fn setup() -> (SegmentPool, Arc<TransactionManager>, Arc<DataTable>) {
    let _ = tracing_subscriber::fmt::try_init();
    let pool = SegmentPool::with_limit(128);
    let tables = Arc::new(TableRegistry::new());
    let table = Arc::new(DataTable::new(4, BlockLayout::new(&[8]).unwrap(), pool.clone()).unwrap());
    tables.register(Arc::clone(&table)).unwrap();
    let manager = Arc::new(TransactionManager::new(pool.clone(), tables));
    (pool, manager, table)
}

fn write(manager: &TransactionManager, table: &DataTable, slot: Option<TupleSlot>, value: u64) -> TupleSlot {
    let mut txn = manager.begin().unwrap();
    let redo = {
        let mut redo = txn
            .stage_write(table.id(), slot.unwrap_or(TupleSlot::from_raw(0)), table.full_row_initializer())
            .unwrap();
        redo.delta_mut().set_value(0, &value.to_le_bytes());
        redo.ptr()
    };
    let slot = match slot {
        Some(slot) => {
            assert!(table.update(&mut txn, slot, redo).unwrap());
            slot
        }
        None => table.insert(&mut txn, redo).unwrap(),
    };
    manager.commit(txn).unwrap();
    slot
}

fn read(table: &DataTable, view: turdb_txn::mvcc::ReadView, slot: TupleSlot) -> u64 {
    let init = table.full_row_initializer();
    let mut buf = vec![0u8; init.projected_row_size()];
    let mut out = init.initialize(&mut buf);
    assert!(table.select(view, slot, &mut out).unwrap());
    let value = out.as_row().value(0).unwrap();
    u64::from_le_bytes(value.try_into().unwrap())
}

#[test]
fn test_gc_returns_every_segment_to_the_pool() {
    let (pool, manager, table) = setup();
    let slot = write(&manager, &table, None, 0);
    for value in 1..=20 {
        write(&manager, &table, Some(slot), value);
    }
    let aborted = manager.begin().unwrap();
    manager.abort(aborted);
    assert!(pool.stats().outstanding > 0);

    let mut gc = GarbageCollector::new(Arc::clone(&manager));
    let first = gc.run();
    assert_eq!(first.unlinked, 21);
    assert_eq!(first.deallocated, 1);
    assert_eq!(table.version_chain_len(slot).unwrap(), 0);

    let second = gc.run();
    assert_eq!(second.deallocated, 21);
    assert_eq!(pool.stats().outstanding, 0);

    let reader = manager.begin().unwrap();
    assert_eq!(read(&table, reader.read_view(), slot), 20);
    manager.abort(reader);
}

#[test]
fn test_old_reader_keeps_its_versions() {
    let (pool, manager, table) = setup();
    let slot = write(&manager, &table, None, 1);
    let reader = manager.begin().unwrap();
    for value in 2..=5 {
        write(&manager, &table, Some(slot), value);
    }

    let mut gc = GarbageCollector::new(Arc::clone(&manager));
    for _ in 0..3 {
        gc.run();
        assert_eq!(read(&table, reader.read_view(), slot), 1);
    }
    assert_eq!(gc.pending_unlink(), 4);
    assert_eq!(table.version_chain_len(slot).unwrap(), 4);

    manager.abort(reader);
    gc.run();
    gc.run();
    assert_eq!(gc.pending_unlink(), 0);
    assert_eq!(gc.pending_deallocate(), 0);
    assert_eq!(table.version_chain_len(slot).unwrap(), 0);
    assert_eq!(pool.stats().outstanding, 0);
}

#[test]
fn test_reader_started_before_unlink_delays_deallocation() {
    let (pool, manager, table) = setup();
    let slot = write(&manager, &table, None, 1);
    write(&manager, &table, Some(slot), 2);

    let reader = manager.begin().unwrap();
    let mut gc = GarbageCollector::new(Arc::clone(&manager));
    let stats = gc.run();
    assert_eq!(stats.unlinked, 2);
    assert_eq!(gc.pending_deallocate(), 2);

    // The reader may still hold a pointer into the unlinked chain.
    let stats = gc.run();
    assert_eq!(stats.deallocated, 0);
    assert!(pool.stats().outstanding > 0);

    assert_eq!(read(&table, reader.read_view(), slot), 2);
    manager.abort(reader);
    let stats = gc.run();
    assert_eq!(stats.deallocated, 3);
    assert_eq!(pool.stats().outstanding, 0);
}
