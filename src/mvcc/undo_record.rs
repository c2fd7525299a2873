//! # Undo Records
//!
//! An undo record is the before-image of one write. Records are staged in
//! the writing transaction's undo buffer and then published into the
//! written tuple's version chain, newest first.
//!
//! ## Record Layout
//!
//! Undo records never leave memory, so fields use native endianness.
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  ------------------------------------------------
//! 0       1     kind        Insert (1), Update (2), Delete (3)
//! 1       3     reserved
//! 4       4     table_id    Table owning the written tuple
//! 8       8     slot        Written tuple
//! 16      8     owner       Address of the writer's TxnIdCell
//! 24      8     next        Next older record in the chain (EntryPtr, atomic)
//! 32      ...   delta       Before-image projected row (Update only)
//! ```
//!
//! ## Timestamps Without Rewrites
//!
//! A record does not store a timestamp. It points at its writer's identity
//! cell, whose value is the writer's uncommitted id until commit and the
//! commit timestamp afterwards. Publishing a commit therefore stamps every
//! record of the transaction at once.
//!
//! ## Concurrency
//!
//! Once a record is installed in a version chain, readers walk it without
//! locks. Every field except `next` is immutable from that point, and `next`
//! is only accessed atomically. For this reason the crate never forms a
//! byte slice over a published undo record; [`UndoRecord`] reads it field by
//! field through the entry's raw address.

use super::projected_row::{ProjectedRow, ProjectedRowInitializer, ProjectedRowMut};
use super::table::{TableId, TupleSlot};
use super::timestamp::{Timestamp, TxnIdCell, TxnStatus};
use crate::config::RECORD_HEADER_SIZE;
use crate::memory::{Entry, EntryBuffer, EntryMut, EntryPtr, SegmentPool};
use eyre::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const KIND_OFFSET: usize = 0;
const TABLE_OFFSET: usize = 4;
const SLOT_OFFSET: usize = 8;
const OWNER_OFFSET: usize = 16;
const NEXT_OFFSET: usize = 24;
pub const UNDO_HEADER_SIZE: usize = 32;

const _: () = assert!(UNDO_HEADER_SIZE == RECORD_HEADER_SIZE);
const _: () = assert!(NEXT_OFFSET % 8 == 0, "next link must be 8-aligned for atomics");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UndoKind {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

impl UndoKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(UndoKind::Insert),
            2 => Some(UndoKind::Update),
            3 => Some(UndoKind::Delete),
            _ => None,
        }
    }
}

/// What a write does to its tuple, which decides the undo record's shape.
#[derive(Clone, Copy)]
pub enum WriteDescription<'a> {
    /// Overwrite the projected columns. The before-image has the same shape.
    Update(ProjectedRow<'a>),
    /// Create the tuple. The record is header-only: undoing an insert only
    /// needs to know the tuple was absent.
    Insert(&'a ProjectedRowInitializer),
    Delete,
}

impl WriteDescription<'_> {
    fn kind(&self) -> UndoKind {
        match self {
            WriteDescription::Update(_) => UndoKind::Update,
            WriteDescription::Insert(_) => UndoKind::Insert,
            WriteDescription::Delete => UndoKind::Delete,
        }
    }
}

impl UndoRecord<'_> {
    /// Entry size needed for the undo record of `description`.
    pub fn size_for(description: &WriteDescription<'_>) -> usize {
        match description {
            WriteDescription::Update(row) => UNDO_HEADER_SIZE + row.size(),
            WriteDescription::Insert(_) | WriteDescription::Delete => UNDO_HEADER_SIZE,
        }
    }

    /// Lay out an undo record in `entry`.
    ///
    /// The record starts unlinked (`next` is null). For updates the delta has
    /// the column list of the new values and every value null; the caller fills
    /// it with the tuple's current values before installing the record.
    pub fn initialize<'a>(
        mut entry: EntryMut<'a>,
        owner: &Arc<TxnIdCell>,
        slot: TupleSlot,
        table_id: TableId,
        description: &WriteDescription<'_>,
    ) -> UndoRecordMut<'a> {
        assert!(
            entry.len() >= Self::size_for(description),
            "entry of {} bytes too small for undo record",
            entry.len()
        );
        let owner_addr = Arc::as_ptr(owner) as usize as u64;
        let bytes = entry.bytes_mut();

        bytes[..UNDO_HEADER_SIZE].fill(0);
        bytes[KIND_OFFSET] = description.kind() as u8;
        bytes[TABLE_OFFSET..TABLE_OFFSET + 4].copy_from_slice(&table_id.to_ne_bytes());
        bytes[SLOT_OFFSET..SLOT_OFFSET + 8].copy_from_slice(&slot.raw().to_ne_bytes());
        bytes[OWNER_OFFSET..OWNER_OFFSET + 8].copy_from_slice(&owner_addr.to_ne_bytes());
        bytes[NEXT_OFFSET..NEXT_OFFSET + 8].copy_from_slice(&EntryPtr::NULL.raw().to_ne_bytes());

        if let WriteDescription::Update(row) = description {
            row.copy_layout_into(&mut bytes[UNDO_HEADER_SIZE..]);
        }

        UndoRecordMut { entry }
    }
}

/// Exclusive access to a staged, not yet published undo record.
pub struct UndoRecordMut<'a> {
    entry: EntryMut<'a>,
}

impl<'a> UndoRecordMut<'a> {
    pub fn ptr(&self) -> EntryPtr {
        self.entry.ptr()
    }

    pub fn kind(&self) -> UndoKind {
        decode_kind(self.entry.bytes()[KIND_OFFSET])
    }

    pub fn table_id(&self) -> TableId {
        let bytes = self.entry.bytes();
        TableId::from_ne_bytes([
            bytes[TABLE_OFFSET],
            bytes[TABLE_OFFSET + 1],
            bytes[TABLE_OFFSET + 2],
            bytes[TABLE_OFFSET + 3],
        ])
    }

    pub fn slot(&self) -> TupleSlot {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.entry.bytes()[SLOT_OFFSET..SLOT_OFFSET + 8]);
        TupleSlot::from_raw(u64::from_ne_bytes(raw))
    }

    pub fn delta(&self) -> Option<ProjectedRow<'_>> {
        (self.kind() == UndoKind::Update)
            .then(|| ProjectedRow::view(&self.entry.bytes()[UNDO_HEADER_SIZE..]))
    }

    pub fn delta_mut(&mut self) -> Option<ProjectedRowMut<'_>> {
        if self.kind() != UndoKind::Update {
            return None;
        }
        Some(ProjectedRowMut::view(
            &mut self.entry.bytes_mut()[UNDO_HEADER_SIZE..],
        ))
    }

    /// Give up exclusive access. After this the record may be linked into a
    /// version chain and read concurrently.
    pub fn freeze(self) -> UndoRecord<'a> {
        UndoRecord {
            entry: self.entry.freeze(),
        }
    }
}

impl std::fmt::Debug for UndoRecordMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoRecordMut")
            .field("ptr", &self.ptr())
            .field("kind", &self.kind())
            .field("table_id", &self.table_id())
            .field("slot", &self.slot())
            .finish()
    }
}

fn decode_kind(byte: u8) -> UndoKind {
    UndoKind::from_byte(byte).unwrap_or_else(|| panic!("corrupt undo record kind {:#x}", byte))
}

/// Shared view of a published undo record.
#[derive(Clone, Copy)]
pub struct UndoRecord<'a> {
    entry: Entry<'a>,
}

impl<'a> UndoRecord<'a> {
    /// Resolve a version chain link.
    ///
    /// Returns `None` for the null handle and for records whose segment has
    /// been released.
    pub fn resolve(pool: &'a SegmentPool, ptr: EntryPtr) -> Option<Self> {
        pool.resolve(ptr).map(|entry| {
            debug_assert!(entry.len() >= UNDO_HEADER_SIZE);
            Self { entry }
        })
    }

    fn read<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: header fields other than next are written before the
        // record is frozen and never modified afterwards; offsets are
        // aligned for T
        unsafe { self.entry.as_ptr().add(offset).cast::<T>().read() }
    }

    /// Panics if the record's segment was released after it was resolved.
    /// Past that point the owner cell may be freed and the bytes reused.
    fn assert_live(&self) {
        assert!(
            self.entry.is_live(),
            "undo record {:?} used after its segment was released",
            self.entry.ptr()
        );
    }

    fn next_cell(&self) -> &'a AtomicU64 {
        // SAFETY: the next link is 8-aligned, lives as long as the entry and
        // is only accessed atomically once the record is frozen
        unsafe { AtomicU64::from_ptr(self.entry.as_ptr().add(NEXT_OFFSET).cast::<u64>()) }
    }

    pub fn ptr(&self) -> EntryPtr {
        self.entry.ptr()
    }

    pub fn kind(&self) -> UndoKind {
        decode_kind(self.read::<u8>(KIND_OFFSET))
    }

    pub fn table_id(&self) -> TableId {
        self.read::<u32>(TABLE_OFFSET)
    }

    pub fn slot(&self) -> TupleSlot {
        TupleSlot::from_raw(self.read::<u64>(SLOT_OFFSET))
    }

    /// The writer's identity cell.
    pub fn owner(&self) -> &'a TxnIdCell {
        self.assert_live();
        let addr = self.read::<u64>(OWNER_OFFSET) as usize;
        // SAFETY: the segment is still held (checked above), so the context
        // owning it has not dropped its undo buffer, and the context drops
        // that buffer before the cell. The collector only releases a buffer
        // once no registered reader can still reach its records.
        unsafe { &*(addr as *const TxnIdCell) }
    }

    /// Current timestamp: the writer's uncommitted id, or its commit time.
    pub fn timestamp(&self) -> Timestamp {
        self.owner().load()
    }

    pub fn status(&self) -> TxnStatus {
        self.owner().status()
    }

    pub fn next(&self) -> EntryPtr {
        self.assert_live();
        EntryPtr::from_raw(self.next_cell().load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, next: EntryPtr) {
        self.assert_live();
        self.next_cell().store(next.raw(), Ordering::Release);
    }

    /// Before-image of an update.
    pub fn delta(&self) -> Option<ProjectedRow<'a>> {
        self.assert_live();
        if self.kind() != UndoKind::Update {
            return None;
        }
        // SAFETY: the delta region follows the header, is immutable once the
        // record is frozen and contains no atomics
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self.entry.as_ptr().add(UNDO_HEADER_SIZE),
                self.entry.len() - UNDO_HEADER_SIZE,
            )
        };
        Some(ProjectedRow::view(bytes))
    }
}

impl std::fmt::Debug for UndoRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoRecord")
            .field("ptr", &self.ptr())
            .field("kind", &self.kind())
            .field("table_id", &self.table_id())
            .field("slot", &self.slot())
            .field("timestamp", &self.timestamp())
            .field("next", &self.next())
            .finish()
    }
}

/// A transaction's undo records, in staging order.
#[derive(Debug)]
pub struct UndoBuffer {
    entries: EntryBuffer,
}

impl UndoBuffer {
    pub fn new(pool: SegmentPool) -> Self {
        Self {
            entries: EntryBuffer::new(pool),
        }
    }

    pub(crate) fn stage(
        &mut self,
        owner: &Arc<TxnIdCell>,
        slot: TupleSlot,
        table_id: TableId,
        description: &WriteDescription<'_>,
    ) -> Result<UndoRecordMut<'_>> {
        let entry = self.entries.new_entry(UndoRecord::size_for(description))?;
        Ok(UndoRecord::initialize(entry, owner, slot, table_id, description))
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = UndoRecord<'_>> + '_ {
        self.entries.entries().map(|entry| UndoRecord { entry })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.entries.bytes_used()
    }

    pub fn segment_count(&self) -> usize {
        self.entries.segment_count()
    }
}
