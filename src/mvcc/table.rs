//! # Versioned Data Table
//!
//! `DataTable` keeps the newest version of every tuple in place and older
//! versions as before-images in the writers' undo buffers, linked newest
//! first from the tuple's version chain head.
//!
//! ```text
//!   slot 7: [ newest values | present | version ]
//!                                          │
//!                                          ▼
//!            UndoRecord (owner: T2, uncommitted) ── next ──> UndoRecord (owner: T1, ts 12)
//!            before-image of T2's update                    before-image of T1's update
//! ```
//!
//! ## Read Path
//!
//! ```text
//! select(view, slot, out)
//!    │
//!    ▼
//! copy newest values + present flag, read chain head   (slot read lock)
//!    │
//!    ▼
//! walk chain without locks:
//!    record newer than view.start_time and not the reader's own?
//!       ├─ Update → apply before-image to `out`
//!       ├─ Insert → tuple did not exist yet
//!       └─ Delete → tuple still existed
//!    otherwise stop
//! ```
//!
//! Because a record's timestamp is read through its writer's identity cell,
//! a reader sees a transaction's writes all at once or not at all.
//!
//! ## Write Path
//!
//! Writers hold the slot's write lock while they check for conflicts, stage
//! the before-image, link it in front of the chain and apply the new values.
//! A write conflicts when the chain head belongs to another transaction that
//! has not committed, or committed after the writer's start time.
//!
//! ## Abort and Truncation
//!
//! `rollback` reverts the head record if it belongs to the aborting
//! transaction; calling it once per undo record reverts repeated writes to
//! the same slot in the right order. `truncate_version_chain` detaches the
//! suffix of a chain no active reader can need.
//!
//! ## Thread Safety
//!
//! Slot state is behind a per-slot `RwLock`. Chain links are atomics inside
//! undo records, so readers walk them after dropping the lock.

use super::projected_row::{BlockLayout, ColumnId, ProjectedRow, ProjectedRowInitializer, ProjectedRowMut};
use super::redo_record::RedoRecord;
use super::timestamp::{is_committed, ReadView, Timestamp};
use super::transaction::TransactionContext;
use super::undo_record::{UndoKind, UndoRecord, UndoRecordMut};
use crate::memory::{EntryPtr, SegmentPool};
use eyre::{ensure, eyre, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

pub type TableId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleSlot(u64);

impl TupleSlot {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheckResult {
    CanWrite,
    LockedByOther,
    ConcurrentModification,
}

struct TupleState {
    version: EntryPtr,
    allocated: bool,
    present: bool,
    nulls: SmallVec<[bool; 16]>,
    values: Box<[u8]>,
}

pub struct DataTable {
    id: TableId,
    layout: BlockLayout,
    column_offsets: SmallVec<[usize; 16]>,
    tuple_size: usize,
    full_row: ProjectedRowInitializer,
    pool: SegmentPool,
    slots: RwLock<Vec<Arc<RwLock<TupleState>>>>,
}

impl DataTable {
    /// `pool` must be the pool the writing transactions allocate from, since
    /// version chains are resolved through it.
    pub fn new(id: TableId, layout: BlockLayout, pool: SegmentPool) -> Result<Self> {
        let mut column_offsets = SmallVec::new();
        let mut tuple_size = 0;
        for col in 0..layout.num_columns() as ColumnId {
            let size = layout.attr_size(col);
            tuple_size = (tuple_size + size - 1) & !(size - 1);
            column_offsets.push(tuple_size);
            tuple_size += size;
        }
        let full_row = ProjectedRowInitializer::new(&layout, &layout.all_columns())?;

        Ok(Self {
            id,
            layout,
            column_offsets,
            tuple_size,
            full_row,
            pool,
            slots: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Projection over every column, as inserts need.
    pub fn full_row_initializer(&self) -> &ProjectedRowInitializer {
        &self.full_row
    }

    pub fn initializer(&self, col_ids: &[ColumnId]) -> Result<ProjectedRowInitializer> {
        ProjectedRowInitializer::new(&self.layout, col_ids)
    }

    pub fn num_slots(&self) -> usize {
        self.slots.read().len()
    }

    /// Insert the after-image staged as `redo`, returning the new tuple's slot.
    pub fn insert(&self, txn: &mut TransactionContext, redo: EntryPtr) -> Result<TupleSlot> {
        self.check_redo(txn, redo)?;

        let slot = self.allocate_slot();
        let cell = self.cell(slot)?;
        let mut state = cell.write();

        if let Some(mut record) = txn.redo_mut(redo) {
            record.set_slot(slot);
        }
        let undo = match txn.stage_undo_for_insert(self.id, slot, &self.full_row) {
            Ok(undo) => undo,
            Err(err) => {
                state.allocated = false;
                return Err(err);
            }
        };
        Self::link(&mut state, undo);

        let record = self.held_redo(txn, redo)?;
        self.apply_delta(&mut state, &record.delta());
        state.present = true;

        trace!(table = self.id, slot = slot.raw(), "inserted tuple");
        Ok(slot)
    }

    /// Apply the after-image staged as `redo` to `slot`.
    ///
    /// Returns `Ok(false)` without staging anything when the write conflicts
    /// or the tuple does not exist.
    pub fn update(&self, txn: &mut TransactionContext, slot: TupleSlot, redo: EntryPtr) -> Result<bool> {
        self.check_redo(txn, redo)?;
        let staged_for = self.held_redo(txn, redo)?.slot();
        ensure!(
            staged_for == slot,
            "redo record staged for slot {:?} applied to slot {:?}",
            staged_for,
            slot
        );

        let cell = self.cell(slot)?;
        let mut state = cell.write();
        if !state.present || self.check_write(&state, &txn.read_view()) != WriteCheckResult::CanWrite {
            return Ok(false);
        }

        let (record, mut undo) = txn.stage_undo_for_staged_write(self.id, slot, redo)?;
        if let Some(mut before) = undo.delta_mut() {
            self.copy_tuple_into(&state, &mut before);
        }
        Self::link(&mut state, undo);
        self.apply_delta(&mut state, &record.delta());

        Ok(true)
    }

    pub fn delete(&self, txn: &mut TransactionContext, slot: TupleSlot) -> Result<bool> {
        let cell = self.cell(slot)?;
        let mut state = cell.write();
        if !state.present || self.check_write(&state, &txn.read_view()) != WriteCheckResult::CanWrite {
            return Ok(false);
        }

        txn.stage_delete(self.id, slot)?;
        let undo = txn.stage_undo_for_delete(self.id, slot)?;
        Self::link(&mut state, undo);
        state.present = false;

        Ok(true)
    }

    /// Materialize the version of `slot` visible to `view` into `out`.
    ///
    /// Returns whether the tuple exists for `view`. Columns of `out` are
    /// overwritten either way.
    pub fn select(&self, view: ReadView, slot: TupleSlot, out: &mut ProjectedRowMut<'_>) -> Result<bool> {
        self.check_projection(&out.as_row())?;
        let cell = self.cell(slot)?;

        let (mut visible, mut ptr) = {
            let state = cell.read();
            self.copy_tuple_into(&state, out);
            (state.present, state.version)
        };

        while let Some(record) = self.version(ptr) {
            if !view.must_undo(record.timestamp()) {
                break;
            }
            match record.kind() {
                UndoKind::Update => {
                    if let Some(before) = record.delta() {
                        Self::apply_projection(out, &before);
                    }
                }
                UndoKind::Insert => visible = false,
                UndoKind::Delete => visible = true,
            }
            ptr = record.next();
        }

        Ok(visible)
    }

    /// Check whether a writer with `view` may write `slot` now.
    pub fn can_write(&self, view: &ReadView, slot: TupleSlot) -> Result<WriteCheckResult> {
        let cell = self.cell(slot)?;
        let state = cell.read();
        Ok(self.check_write(&state, view))
    }

    /// Link a staged undo record in front of `slot`'s chain, returning the
    /// previous head.
    pub fn install_version(&self, slot: TupleSlot, undo: UndoRecordMut<'_>) -> Result<EntryPtr> {
        ensure!(
            undo.table_id() == self.id && undo.slot() == slot,
            "undo record for table {} slot {:?} installed on table {} slot {:?}",
            undo.table_id(),
            undo.slot(),
            self.id,
            slot
        );
        let cell = self.cell(slot)?;
        let mut state = cell.write();
        Ok(Self::link(&mut state, undo))
    }

    /// Copy a redo record's after-image into `slot`'s newest version.
    pub fn apply(&self, slot: TupleSlot, redo: &RedoRecord<'_>) -> Result<()> {
        self.check_projection(&redo.delta())?;
        let cell = self.cell(slot)?;
        let mut state = cell.write();
        self.apply_delta(&mut state, &redo.delta());
        Ok(())
    }

    /// Revert the head record of `slot` if it was written by `txn_id`.
    pub fn rollback(&self, txn_id: Timestamp, slot: TupleSlot) -> Result<bool> {
        let cell = self.cell(slot)?;
        let mut state = cell.write();

        let Some(record) = self.version(state.version) else {
            return Ok(false);
        };
        if record.timestamp() != txn_id {
            return Ok(false);
        }

        match record.kind() {
            UndoKind::Update => {
                if let Some(before) = record.delta() {
                    self.apply_delta(&mut state, &before);
                }
            }
            UndoKind::Insert => {
                state.present = false;
                state.allocated = false;
                state.values.fill(0);
                state.nulls.iter_mut().for_each(|n| *n = true);
            }
            UndoKind::Delete => state.present = true,
        }
        state.version = record.next();

        trace!(table = self.id, slot = slot.raw(), kind = ?record.kind(), "rolled back version");
        Ok(true)
    }

    /// Detach every record of `slot`'s chain from the newest one committed
    /// at or before `watermark` onwards. Returns how many were detached.
    pub fn truncate_version_chain(&self, slot: TupleSlot, watermark: Timestamp) -> Result<usize> {
        let cell = self.cell(slot)?;
        let mut state = cell.write();

        let mut newer: Option<UndoRecord<'_>> = None;
        let mut ptr = state.version;
        while let Some(record) = self.version(ptr) {
            let ts = record.timestamp();
            if is_committed(ts) && ts <= watermark {
                match newer {
                    Some(newer) => newer.set_next(EntryPtr::NULL),
                    None => state.version = EntryPtr::NULL,
                }
                let mut detached = 0;
                let mut cursor = Some(record);
                while let Some(r) = cursor {
                    detached += 1;
                    cursor = self.version(r.next());
                }
                return Ok(detached);
            }
            newer = Some(record);
            ptr = record.next();
        }
        Ok(0)
    }

    /// Head of `slot`'s version chain.
    pub fn version_head(&self, slot: TupleSlot) -> Result<EntryPtr> {
        Ok(self.cell(slot)?.read().version)
    }

    pub fn version_chain_len(&self, slot: TupleSlot) -> Result<usize> {
        let mut len = 0;
        let mut ptr = self.version_head(slot)?;
        while let Some(record) = self.version(ptr) {
            len += 1;
            ptr = record.next();
        }
        Ok(len)
    }

    pub fn is_allocated(&self, slot: TupleSlot) -> Result<bool> {
        Ok(self.cell(slot)?.read().allocated)
    }

    fn allocate_slot(&self) -> TupleSlot {
        let state = TupleState {
            version: EntryPtr::NULL,
            allocated: true,
            present: false,
            nulls: SmallVec::from_elem(true, self.layout.num_columns()),
            values: vec![0u8; self.tuple_size].into_boxed_slice(),
        };
        let mut slots = self.slots.write();
        slots.push(Arc::new(RwLock::new(state)));
        TupleSlot::from_raw(slots.len() as u64 - 1)
    }

    fn cell(&self, slot: TupleSlot) -> Result<Arc<RwLock<TupleState>>> {
        self.slots
            .read()
            .get(slot.raw() as usize)
            .cloned()
            .ok_or_else(|| eyre!("slot {} out of range for table {}", slot.raw(), self.id))
    }

    fn version(&self, ptr: EntryPtr) -> Option<UndoRecord<'_>> {
        if ptr.is_null() {
            return None;
        }
        let record = UndoRecord::resolve(&self.pool, ptr).unwrap_or_else(|| {
            panic!(
                "version chain of table {} references released undo record {:?}",
                self.id, ptr
            )
        });
        Some(record)
    }

    fn check_write(&self, state: &TupleState, view: &ReadView) -> WriteCheckResult {
        let Some(head) = self.version(state.version) else {
            return WriteCheckResult::CanWrite;
        };
        let ts = head.timestamp();
        if ts == view.txn_id {
            WriteCheckResult::CanWrite
        } else if !is_committed(ts) {
            WriteCheckResult::LockedByOther
        } else if ts > view.start_time {
            WriteCheckResult::ConcurrentModification
        } else {
            WriteCheckResult::CanWrite
        }
    }

    fn check_redo(&self, txn: &TransactionContext, redo: EntryPtr) -> Result<()> {
        let record = self.held_redo(txn, redo)?;
        ensure!(
            record.table_id() == self.id,
            "redo record for table {} applied to table {}",
            record.table_id(),
            self.id
        );
        self.check_projection(&record.delta())
    }

    fn held_redo<'t>(&self, txn: &'t TransactionContext, redo: EntryPtr) -> Result<RedoRecord<'t>> {
        txn.redo(redo)
            .ok_or_else(|| eyre!("redo record {:?} is not held by the transaction", redo))
    }

    fn check_projection(&self, row: &ProjectedRow<'_>) -> Result<()> {
        for i in 0..row.num_columns() {
            let col = row.column_id(i);
            ensure!(
                (col as usize) < self.layout.num_columns() && row.attr_size(i) == self.layout.attr_size(col),
                "column {} does not match the layout of table {}",
                col,
                self.id
            );
        }
        Ok(())
    }

    fn link(state: &mut TupleState, undo: UndoRecordMut<'_>) -> EntryPtr {
        let record = undo.freeze();
        let previous = state.version;
        record.set_next(previous);
        state.version = record.ptr();
        previous
    }

    fn copy_tuple_into(&self, state: &TupleState, out: &mut ProjectedRowMut<'_>) {
        for i in 0..out.num_columns() {
            let col = out.column_id(i) as usize;
            if state.nulls[col] {
                out.set_null(i);
            } else {
                let offset = self.column_offsets[col];
                let size = self.layout.attr_size(col as ColumnId);
                out.set_value(i, &state.values[offset..offset + size]);
            }
        }
    }

    fn apply_delta(&self, state: &mut TupleState, delta: &ProjectedRow<'_>) {
        for i in 0..delta.num_columns() {
            let col = delta.column_id(i) as usize;
            match delta.value(i) {
                Some(value) => {
                    let offset = self.column_offsets[col];
                    state.values[offset..offset + value.len()].copy_from_slice(value);
                    state.nulls[col] = false;
                }
                None => state.nulls[col] = true,
            }
        }
    }

    fn apply_projection(out: &mut ProjectedRowMut<'_>, delta: &ProjectedRow<'_>) {
        for j in 0..delta.num_columns() {
            if let Some(i) = out.find(delta.column_id(j)) {
                out.copy_column_from(i, delta, j);
            }
        }
    }
}

impl std::fmt::Debug for DataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTable")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("slots", &self.num_slots())
            .finish()
    }
}

/// Tables reachable by id, for rollback and version chain truncation.
pub struct TableRegistry {
    tables: RwLock<hashbrown::HashMap<TableId, Arc<DataTable>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(hashbrown::HashMap::new()),
        }
    }

    pub fn register(&self, table: Arc<DataTable>) -> Result<()> {
        let mut tables = self.tables.write();
        ensure!(
            !tables.contains_key(&table.id()),
            "table {} already registered",
            table.id()
        );
        tables.insert(table.id(), table);
        Ok(())
    }

    pub fn get(&self, table_id: TableId) -> Option<Arc<DataTable>> {
        self.tables.read().get(&table_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}
