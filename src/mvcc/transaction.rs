//! # Transaction Context
//!
//! Per-transaction state: start time, identity cell, undo buffer and redo
//! buffer. A context is created by the [`TransactionManager`] on begin and
//! handed back to it on commit or abort; afterwards the garbage collector
//! owns it until no reader can reach its undo records.
//!
//! ## Staging
//!
//! Writers stage records before touching a tuple:
//!
//! ```text
//! stage_write(table, slot, init)          -> RedoRecordMut   (after-image)
//! stage_undo_for_update(table, slot, row) -> UndoRecordMut   (before-image)
//! stage_undo_for_insert(table, slot, init)
//! stage_undo_for_delete(table, slot)
//! stage_delete(table, slot)               -> log record for the delete
//! ```
//!
//! The returned handles borrow the context mutably, so a transaction stages
//! one record at a time. [`TransactionContext::stage_undo_for_staged_write`]
//! borrows the redo and undo buffers separately so a before-image can be
//! shaped after a redo record already staged.
//!
//! ## Privileged Operations
//!
//! Publishing a commit timestamp, writing commit and abort records and
//! walking the undo buffer are reserved for the transaction manager and the
//! garbage collector. They are reached through [`TxnAdmin`], which can only
//! be obtained with an [`AdminKey`]; keys cannot be constructed outside this
//! crate.
//!
//! ## Drop Order
//!
//! Undo records point at the identity cell. Fields are declared so that the
//! undo buffer (and with it every segment holding those records) is released
//! before the context's reference to the cell goes away.
//!
//! [`TransactionManager`]: super::manager::TransactionManager

use super::projected_row::{ProjectedRow, ProjectedRowInitializer};
use super::redo_record::{RedoBuffer, RedoRecord, RedoRecordMut};
use super::table::{TableId, TupleSlot};
use super::timestamp::{is_committed, ReadView, Timestamp, TxnIdCell, TxnStatus};
use super::undo_record::{UndoBuffer, UndoRecord, UndoRecordMut, WriteDescription};
use crate::memory::{EntryPtr, SegmentPool, SegmentSink};
use eyre::{eyre, Result};
use std::sync::Arc;

/// Capability required for privileged operations on a transaction context.
pub struct AdminKey {
    _private: (),
}

impl AdminKey {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

impl std::fmt::Debug for AdminKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AdminKey")
    }
}

pub struct TransactionContext {
    undo_buffer: UndoBuffer,
    redo_buffer: RedoBuffer,
    start_time: Timestamp,
    txn_id: Arc<TxnIdCell>,
}

impl TransactionContext {
    /// Panics if `start_time` is not a committed-range timestamp or `txn_id`
    /// is not an uncommitted id.
    pub fn new(
        start_time: Timestamp,
        txn_id: Timestamp,
        pool: &SegmentPool,
        log_sink: Option<Arc<dyn SegmentSink>>,
    ) -> Self {
        assert!(
            is_committed(start_time),
            "start time {} is in the uncommitted range",
            start_time
        );
        Self {
            undo_buffer: UndoBuffer::new(pool.clone()),
            redo_buffer: RedoBuffer::new(pool.clone(), log_sink),
            start_time,
            txn_id: Arc::new(TxnIdCell::new(txn_id)),
        }
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Current identity: the uncommitted id, or the commit timestamp once
    /// the transaction has committed.
    pub fn txn_id(&self) -> Timestamp {
        self.txn_id.load()
    }

    pub fn status(&self) -> TxnStatus {
        self.txn_id.status()
    }

    pub fn identity(&self) -> &Arc<TxnIdCell> {
        &self.txn_id
    }

    pub fn read_view(&self) -> ReadView {
        ReadView {
            start_time: self.start_time,
            txn_id: self.txn_id(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.undo_buffer.is_empty() && self.redo_buffer.is_empty()
    }

    pub fn undo_buffer(&self) -> &UndoBuffer {
        &self.undo_buffer
    }

    pub fn redo_buffer(&self) -> &RedoBuffer {
        &self.redo_buffer
    }

    /// Undo records staged so far, oldest first.
    pub fn undo_records(&self) -> impl Iterator<Item = UndoRecord<'_>> + '_ {
        self.undo_buffer.records()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_buffer.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_buffer.len()
    }

    /// Stage the before-image of an update writing `new_values`.
    ///
    /// The record's delta has the columns of `new_values`, all null; fill it
    /// from the tuple before installing the record.
    pub fn stage_undo_for_update(
        &mut self,
        table: TableId,
        slot: TupleSlot,
        new_values: &ProjectedRow<'_>,
    ) -> Result<UndoRecordMut<'_>> {
        self.undo_buffer.stage(
            &self.txn_id,
            slot,
            table,
            &WriteDescription::Update(*new_values),
        )
    }

    pub fn stage_undo_for_insert(
        &mut self,
        table: TableId,
        slot: TupleSlot,
        init: &ProjectedRowInitializer,
    ) -> Result<UndoRecordMut<'_>> {
        self.undo_buffer
            .stage(&self.txn_id, slot, table, &WriteDescription::Insert(init))
    }

    pub fn stage_undo_for_delete(
        &mut self,
        table: TableId,
        slot: TupleSlot,
    ) -> Result<UndoRecordMut<'_>> {
        self.undo_buffer
            .stage(&self.txn_id, slot, table, &WriteDescription::Delete)
    }

    /// Stage an after-image for `init`'s columns, all null.
    pub fn stage_write(
        &mut self,
        table: TableId,
        slot: TupleSlot,
        init: &ProjectedRowInitializer,
    ) -> Result<RedoRecordMut<'_>> {
        self.redo_buffer
            .stage_redo(self.start_time, table, slot, init)
    }

    pub fn stage_delete(&mut self, table: TableId, slot: TupleSlot) -> Result<EntryPtr> {
        self.redo_buffer.stage_delete(self.start_time, table, slot)
    }

    /// Stage the before-image for a redo record staged earlier, returning
    /// both. The redo record must still be held by this context.
    pub fn stage_undo_for_staged_write(
        &mut self,
        table: TableId,
        slot: TupleSlot,
        redo: EntryPtr,
    ) -> Result<(RedoRecord<'_>, UndoRecordMut<'_>)> {
        let record = self
            .redo_buffer
            .get(redo)
            .ok_or_else(|| eyre!("redo record {:?} is not held by this transaction", redo))?;
        let undo = self.undo_buffer.stage(
            &self.txn_id,
            slot,
            table,
            &WriteDescription::Update(record.delta()),
        )?;
        Ok((record, undo))
    }

    /// Redo record staged by this transaction, while its segment is held.
    pub fn redo(&self, handle: EntryPtr) -> Option<RedoRecord<'_>> {
        self.redo_buffer.get(handle)
    }

    pub fn redo_mut(&mut self, handle: EntryPtr) -> Option<RedoRecordMut<'_>> {
        self.redo_buffer.get_mut(handle)
    }

    pub fn admin(&mut self, _key: &AdminKey) -> TxnAdmin<'_> {
        TxnAdmin { txn: self }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("start_time", &self.start_time)
            .field("status", &self.status())
            .field("undo_records", &self.undo_buffer.len())
            .field("redo_records", &self.redo_buffer.len())
            .finish()
    }
}

/// Privileged view of a transaction context.
pub struct TxnAdmin<'a> {
    txn: &'a mut TransactionContext,
}

impl TxnAdmin<'_> {
    pub fn txn(&self) -> &TransactionContext {
        self.txn
    }

    /// Make every undo record of the transaction committed at `commit_ts`.
    pub fn publish_commit(&self, commit_ts: Timestamp) -> Timestamp {
        self.txn.txn_id.publish_commit(commit_ts)
    }

    pub fn stage_commit_record(&mut self) -> Result<EntryPtr> {
        self.txn.redo_buffer.stage_commit(self.txn.start_time)
    }

    pub fn seal_commit_record(&mut self, record: EntryPtr, commit_ts: Timestamp) {
        self.txn.redo_buffer.seal_commit(record, commit_ts);
    }

    pub fn stage_abort_record(&mut self) -> Result<EntryPtr> {
        self.txn.redo_buffer.stage_abort(self.txn.start_time)
    }

    pub fn close_redo(&mut self) {
        self.txn.redo_buffer.close();
    }

    /// Undo records in staging order.
    pub fn undo_records(&self) -> impl Iterator<Item = UndoRecord<'_>> + '_ {
        self.txn.undo_buffer.records()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UNCOMMITTED_BASE;
    use crate::mvcc::projected_row::BlockLayout;
    use crate::mvcc::undo_record::UndoKind;

    fn context(pool: &SegmentPool) -> TransactionContext {
        TransactionContext::new(5, UNCOMMITTED_BASE + 1, pool, None)
    }

    #[test]
    fn test_new_context_is_in_progress() {
        let pool = SegmentPool::with_limit(4);
        let txn = context(&pool);
        assert_eq!(txn.start_time(), 5);
        assert_eq!(txn.txn_id(), UNCOMMITTED_BASE + 1);
        assert_eq!(txn.status(), TxnStatus::InProgress(UNCOMMITTED_BASE + 1));
        assert!(txn.is_read_only());
        assert_eq!(
            txn.read_view(),
            ReadView {
                start_time: 5,
                txn_id: UNCOMMITTED_BASE + 1
            }
        );
    }

    #[test]
    #[should_panic(expected = "uncommitted range")]
    fn test_uncommitted_start_time_panics() {
        let pool = SegmentPool::with_limit(4);
        TransactionContext::new(UNCOMMITTED_BASE, UNCOMMITTED_BASE + 1, &pool, None);
    }

    #[test]
    fn test_staged_write_shapes_undo() {
        let pool = SegmentPool::with_limit(4);
        let mut txn = context(&pool);
        let layout = BlockLayout::new(&[8, 8, 4]).unwrap();
        let init = ProjectedRowInitializer::new(&layout, &[2]).unwrap();

        let redo = {
            let mut redo = txn.stage_write(1, TupleSlot::from_raw(3), &init).unwrap();
            redo.delta_mut().set_value(0, &4u32.to_le_bytes());
            redo.ptr()
        };

        let (record, undo) = txn
            .stage_undo_for_staged_write(1, TupleSlot::from_raw(3), redo)
            .unwrap();
        assert_eq!(record.slot(), TupleSlot::from_raw(3));
        assert_eq!(undo.kind(), UndoKind::Update);
        let delta = undo.delta().unwrap();
        assert_eq!(delta.column_ids().collect::<Vec<_>>(), vec![2]);
        assert!(delta.is_null(0));
    }

    #[test]
    fn test_staged_write_requires_held_redo() {
        let pool = SegmentPool::with_limit(4);
        let mut txn = context(&pool);
        assert!(txn
            .stage_undo_for_staged_write(1, TupleSlot::from_raw(0), EntryPtr::NULL)
            .is_err());
    }

    #[test]
    fn test_undo_records_keep_staging_order() {
        let pool = SegmentPool::with_limit(4);
        let mut txn = context(&pool);
        let layout = BlockLayout::new(&[8]).unwrap();
        let init = ProjectedRowInitializer::new(&layout, &[0]).unwrap();

        txn.stage_undo_for_insert(1, TupleSlot::from_raw(0), &init).unwrap();
        txn.stage_undo_for_delete(1, TupleSlot::from_raw(1)).unwrap();

        let key = AdminKey::new();
        let admin = txn.admin(&key);
        let kinds: Vec<_> = admin.undo_records().map(|r| (r.kind(), r.slot().raw())).collect();
        assert_eq!(kinds, vec![(UndoKind::Insert, 0), (UndoKind::Delete, 1)]);
    }

    #[test]
    fn test_publish_commit_stamps_staged_records() {
        let pool = SegmentPool::with_limit(4);
        let mut txn = context(&pool);
        let ptr = txn
            .stage_undo_for_delete(1, TupleSlot::from_raw(1))
            .unwrap()
            .freeze()
            .ptr();

        let key = AdminKey::new();
        let mut admin = txn.admin(&key);
        let commit = admin.stage_commit_record().unwrap();
        assert_eq!(admin.publish_commit(12), UNCOMMITTED_BASE + 1);
        admin.seal_commit_record(commit, 12);

        assert_eq!(txn.status(), TxnStatus::Committed(12));
        assert_eq!(UndoRecord::resolve(&pool, ptr).unwrap().timestamp(), 12);
    }
}
