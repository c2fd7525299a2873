//! # Redo and Log Records
//!
//! A transaction's redo buffer holds its after-images plus the bookkeeping
//! records the log consumer needs to replay it. Closed redo segments are
//! handed to a [`SegmentSink`] (the log manager) while the transaction runs,
//! so records are laid out little-endian with zerocopy headers and can be
//! written to disk verbatim.
//!
//! ## Record Layout
//!
//! ```text
//! LogRecordHeader (16 bytes, every record)
//! Offset  Size  Field
//! 0       1     kind        Redo (1), Delete (2), Commit (3), Abort (4)
//! 1       7     reserved
//! 8       8     txn_begin   start time of the writing transaction
//!
//! Redo   = header + RedoHeader { table_id:u32, reserved:[u8;4], slot:u64 }
//!                 + projected row (after-image)
//! Delete = header + RedoHeader
//! Commit = header + CommitBody { commit_ts:u64 }
//! Abort  = header
//! ```
//!
//! `txn_begin` groups records by transaction: the start time is unique per
//! transaction and, unlike the identity cell, never changes.
//!
//! ## Staging
//!
//! A redo record is staged before the tuple it targets is known for inserts;
//! the slot is patched in afterwards with [`RedoRecordMut::set_slot`]. The
//! after-image is filled in place through [`RedoRecordMut::delta_mut`].

use super::projected_row::{ProjectedRow, ProjectedRowInitializer, ProjectedRowMut};
use super::table::{TableId, TupleSlot};
use super::timestamp::Timestamp;
use crate::config::RECORD_HEADER_SIZE;
use crate::memory::{EntryBuffer, EntryMut, EntryPtr, SegmentPool, SegmentSink};
use eyre::{bail, ensure, Result};
use std::mem::size_of;
use std::sync::Arc;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const LOG_HEADER_SIZE: usize = 16;
pub const REDO_HEADER_SIZE: usize = LOG_HEADER_SIZE + 16;
pub const DELETE_RECORD_SIZE: usize = REDO_HEADER_SIZE;
pub const COMMIT_RECORD_SIZE: usize = LOG_HEADER_SIZE + 8;
pub const ABORT_RECORD_SIZE: usize = LOG_HEADER_SIZE;

const _: () = assert!(REDO_HEADER_SIZE == RECORD_HEADER_SIZE);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    Redo = 1,
    Delete = 2,
    Commit = 3,
    Abort = 4,
}

impl LogRecordKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(LogRecordKind::Redo),
            2 => Some(LogRecordKind::Delete),
            3 => Some(LogRecordKind::Commit),
            4 => Some(LogRecordKind::Abort),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LogRecordHeader {
    kind: u8,
    reserved: [u8; 7],
    txn_begin: U64,
}

impl LogRecordHeader {
    fn new(kind: LogRecordKind, txn_begin: Timestamp) -> Self {
        Self {
            kind: kind as u8,
            reserved: [0; 7],
            txn_begin: U64::new(txn_begin),
        }
    }

    pub fn kind(&self) -> Option<LogRecordKind> {
        LogRecordKind::from_byte(self.kind)
    }

    zerocopy_accessors! {
        txn_begin: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RedoHeader {
    table_id: U32,
    reserved: [u8; 4],
    slot: U64,
}

impl RedoHeader {
    fn new(table_id: TableId, slot: TupleSlot) -> Self {
        Self {
            table_id: U32::new(table_id),
            reserved: [0; 4],
            slot: U64::new(slot.raw()),
        }
    }

    zerocopy_accessors! {
        table_id: u32,
        slot: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct CommitBody {
    commit_ts: U64,
}

impl CommitBody {
    zerocopy_accessors! {
        commit_ts: u64,
    }
}

const _: () = assert!(size_of::<LogRecordHeader>() == LOG_HEADER_SIZE);
const _: () = assert!(size_of::<RedoHeader>() == REDO_HEADER_SIZE - LOG_HEADER_SIZE);
const _: () = assert!(size_of::<CommitBody>() == COMMIT_RECORD_SIZE - LOG_HEADER_SIZE);

fn log_header(bytes: &[u8]) -> Result<&LogRecordHeader> {
    ensure!(
        bytes.len() >= LOG_HEADER_SIZE,
        "log record truncated: {} bytes",
        bytes.len()
    );
    LogRecordHeader::ref_from_bytes(&bytes[..LOG_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read LogRecordHeader: {:?}", e))
}

fn redo_header(bytes: &[u8]) -> Result<&RedoHeader> {
    ensure!(
        bytes.len() >= REDO_HEADER_SIZE,
        "redo record truncated: {} bytes",
        bytes.len()
    );
    RedoHeader::ref_from_bytes(&bytes[LOG_HEADER_SIZE..REDO_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read RedoHeader: {:?}", e))
}

/// Read-only view of a redo record: the after-image of one write.
#[derive(Clone, Copy)]
pub struct RedoRecord<'a> {
    header: &'a LogRecordHeader,
    redo: &'a RedoHeader,
    delta: ProjectedRow<'a>,
}

impl<'a> RedoRecord<'a> {
    /// Entry size needed for a redo record projecting `init`.
    pub fn size_for(init: &ProjectedRowInitializer) -> usize {
        REDO_HEADER_SIZE + init.projected_row_size()
    }

    /// Lay out a redo record with an all-null after-image in `entry`.
    pub fn initialize(
        mut entry: EntryMut<'a>,
        txn_begin: Timestamp,
        table_id: TableId,
        slot: TupleSlot,
        init: &ProjectedRowInitializer,
    ) -> RedoRecordMut<'a> {
        assert!(
            entry.len() >= Self::size_for(init),
            "entry of {} bytes too small for redo record",
            entry.len()
        );
        let bytes = entry.bytes_mut();
        bytes[..LOG_HEADER_SIZE]
            .copy_from_slice(LogRecordHeader::new(LogRecordKind::Redo, txn_begin).as_bytes());
        bytes[LOG_HEADER_SIZE..REDO_HEADER_SIZE]
            .copy_from_slice(RedoHeader::new(table_id, slot).as_bytes());
        init.initialize(&mut bytes[REDO_HEADER_SIZE..]);

        RedoRecordMut { entry }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        let header = log_header(bytes)?;
        ensure!(
            header.kind() == Some(LogRecordKind::Redo),
            "not a redo record: kind {:?}",
            header.kind()
        );
        let redo = redo_header(bytes)?;
        let delta = ProjectedRow::from_bytes(&bytes[REDO_HEADER_SIZE..])?;
        Ok(Self {
            header,
            redo,
            delta,
        })
    }

    pub fn txn_begin(&self) -> Timestamp {
        self.header.txn_begin()
    }

    pub fn table_id(&self) -> TableId {
        self.redo.table_id()
    }

    pub fn slot(&self) -> TupleSlot {
        TupleSlot::from_raw(self.redo.slot())
    }

    pub fn delta(&self) -> ProjectedRow<'a> {
        self.delta
    }
}

impl std::fmt::Debug for RedoRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoRecord")
            .field("txn_begin", &self.txn_begin())
            .field("table_id", &self.table_id())
            .field("slot", &self.slot())
            .field("delta", &self.delta)
            .finish()
    }
}

/// Exclusive access to a staged redo record.
pub struct RedoRecordMut<'a> {
    entry: EntryMut<'a>,
}

impl<'a> RedoRecordMut<'a> {
    pub fn ptr(&self) -> EntryPtr {
        self.entry.ptr()
    }

    pub fn as_record(&self) -> RedoRecord<'_> {
        // INVARIANT: the entry was laid out by RedoRecord::initialize
        RedoRecord::from_bytes(self.entry.bytes()).unwrap()
    }

    pub fn txn_begin(&self) -> Timestamp {
        self.as_record().txn_begin()
    }

    pub fn table_id(&self) -> TableId {
        self.as_record().table_id()
    }

    pub fn slot(&self) -> TupleSlot {
        self.as_record().slot()
    }

    pub fn set_slot(&mut self, slot: TupleSlot) {
        let bytes = &mut self.entry.bytes_mut()[LOG_HEADER_SIZE..REDO_HEADER_SIZE];
        // INVARIANT: slice is exactly size_of::<RedoHeader>() and RedoHeader is unaligned
        RedoHeader::mut_from_bytes(bytes).unwrap().set_slot(slot.raw());
    }

    pub fn delta(&self) -> ProjectedRow<'_> {
        ProjectedRow::view(&self.entry.bytes()[REDO_HEADER_SIZE..])
    }

    pub fn delta_mut(&mut self) -> ProjectedRowMut<'_> {
        ProjectedRowMut::view(&mut self.entry.bytes_mut()[REDO_HEADER_SIZE..])
    }
}

impl std::fmt::Debug for RedoRecordMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_record().fmt(f)
    }
}

/// Any record found in a redo segment.
#[derive(Debug, Clone, Copy)]
pub enum LogRecord<'a> {
    Redo(RedoRecord<'a>),
    Delete {
        txn_begin: Timestamp,
        table_id: TableId,
        slot: TupleSlot,
    },
    Commit {
        txn_begin: Timestamp,
        commit_ts: Timestamp,
    },
    Abort {
        txn_begin: Timestamp,
    },
}

impl<'a> LogRecord<'a> {
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let header = log_header(bytes)?;
        let txn_begin = header.txn_begin();
        match header.kind() {
            Some(LogRecordKind::Redo) => Ok(LogRecord::Redo(RedoRecord::from_bytes(bytes)?)),
            Some(LogRecordKind::Delete) => {
                let redo = redo_header(bytes)?;
                Ok(LogRecord::Delete {
                    txn_begin,
                    table_id: redo.table_id(),
                    slot: TupleSlot::from_raw(redo.slot()),
                })
            }
            Some(LogRecordKind::Commit) => {
                ensure!(
                    bytes.len() >= COMMIT_RECORD_SIZE,
                    "commit record truncated: {} bytes",
                    bytes.len()
                );
                let body = CommitBody::ref_from_bytes(&bytes[LOG_HEADER_SIZE..COMMIT_RECORD_SIZE])
                    .map_err(|e| eyre::eyre!("failed to read CommitBody: {:?}", e))?;
                Ok(LogRecord::Commit {
                    txn_begin,
                    commit_ts: body.commit_ts(),
                })
            }
            Some(LogRecordKind::Abort) => Ok(LogRecord::Abort { txn_begin }),
            None => bail!("unknown log record kind {:#x}", bytes[0]),
        }
    }

    pub fn kind(&self) -> LogRecordKind {
        match self {
            LogRecord::Redo(_) => LogRecordKind::Redo,
            LogRecord::Delete { .. } => LogRecordKind::Delete,
            LogRecord::Commit { .. } => LogRecordKind::Commit,
            LogRecord::Abort { .. } => LogRecordKind::Abort,
        }
    }

    pub fn txn_begin(&self) -> Timestamp {
        match self {
            LogRecord::Redo(redo) => redo.txn_begin(),
            LogRecord::Delete { txn_begin, .. }
            | LogRecord::Commit { txn_begin, .. }
            | LogRecord::Abort { txn_begin } => *txn_begin,
        }
    }
}

/// A transaction's redo and log records, in staging order.
pub struct RedoBuffer {
    entries: EntryBuffer,
}

impl RedoBuffer {
    pub fn new(pool: SegmentPool, sink: Option<Arc<dyn SegmentSink>>) -> Self {
        let entries = match sink {
            Some(sink) => EntryBuffer::with_sink(pool, sink),
            None => EntryBuffer::new(pool),
        };
        Self { entries }
    }

    pub(crate) fn stage_redo(
        &mut self,
        txn_begin: Timestamp,
        table_id: TableId,
        slot: TupleSlot,
        init: &ProjectedRowInitializer,
    ) -> Result<RedoRecordMut<'_>> {
        let entry = self.entries.new_entry(RedoRecord::size_for(init))?;
        Ok(RedoRecord::initialize(entry, txn_begin, table_id, slot, init))
    }

    pub(crate) fn stage_delete(
        &mut self,
        txn_begin: Timestamp,
        table_id: TableId,
        slot: TupleSlot,
    ) -> Result<EntryPtr> {
        let mut entry = self.entries.new_entry(DELETE_RECORD_SIZE)?;
        let bytes = entry.bytes_mut();
        bytes[..LOG_HEADER_SIZE]
            .copy_from_slice(LogRecordHeader::new(LogRecordKind::Delete, txn_begin).as_bytes());
        bytes[LOG_HEADER_SIZE..].copy_from_slice(RedoHeader::new(table_id, slot).as_bytes());
        Ok(entry.ptr())
    }

    /// Stage a commit record whose timestamp is filled in by `seal_commit`.
    pub(crate) fn stage_commit(&mut self, txn_begin: Timestamp) -> Result<EntryPtr> {
        let mut entry = self.entries.new_entry(COMMIT_RECORD_SIZE)?;
        let bytes = entry.bytes_mut();
        bytes[..LOG_HEADER_SIZE]
            .copy_from_slice(LogRecordHeader::new(LogRecordKind::Commit, txn_begin).as_bytes());
        bytes[LOG_HEADER_SIZE..].fill(0);
        Ok(entry.ptr())
    }

    pub(crate) fn seal_commit(&mut self, record: EntryPtr, commit_ts: Timestamp) {
        let mut entry = self
            .entries
            .get_mut(record)
            .unwrap_or_else(|| panic!("commit record {:?} not held by this buffer", record));
        let bytes = &mut entry.bytes_mut()[LOG_HEADER_SIZE..COMMIT_RECORD_SIZE];
        // INVARIANT: slice is exactly size_of::<CommitBody>() and CommitBody is unaligned
        CommitBody::mut_from_bytes(bytes).unwrap().set_commit_ts(commit_ts);
    }

    pub(crate) fn stage_abort(&mut self, txn_begin: Timestamp) -> Result<EntryPtr> {
        let mut entry = self.entries.new_entry(ABORT_RECORD_SIZE)?;
        entry
            .bytes_mut()
            .copy_from_slice(LogRecordHeader::new(LogRecordKind::Abort, txn_begin).as_bytes());
        Ok(entry.ptr())
    }

    /// Redo record behind `ptr`, if it is still held and is a redo record.
    pub fn get(&self, ptr: EntryPtr) -> Option<RedoRecord<'_>> {
        self.entries
            .get(ptr)
            .and_then(|entry| RedoRecord::from_bytes(entry.bytes()).ok())
    }

    pub(crate) fn get_mut(&mut self, ptr: EntryPtr) -> Option<RedoRecordMut<'_>> {
        let entry = self.entries.get_mut(ptr)?;
        let kind = log_header(entry.bytes()).ok()?.kind();
        match kind {
            Some(LogRecordKind::Redo) => Some(RedoRecordMut { entry }),
            _ => None,
        }
    }

    /// Records in segments still held by this buffer.
    pub fn records(&self) -> impl Iterator<Item = Result<LogRecord<'_>>> + '_ {
        self.entries.entries().map(|entry| LogRecord::decode(entry.bytes()))
    }

    /// Hand the segment being written to the sink, if any.
    pub fn close(&mut self) {
        self.entries.close_current();
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

    pub fn closed_segments(&self) -> usize {
        self.entries.closed_segments()
    }
}

impl std::fmt::Debug for RedoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoBuffer")
            .field("entries", &self.entries)
            .finish()
    }
}
