//! # Pooled Transaction Memory
//!
//! Every undo and redo record a transaction stages lives in a fixed-size
//! segment drawn from a shared, bounded [`SegmentPool`]. Buffers grow a
//! segment at a time and give segments back when they are done with them.
//!
//! ```text
//! SegmentPool (bounded, sharded free lists)
//!     │ acquire / release
//!     ▼
//! EntryBuffer ── new_entry(size) ──> EntryMut (exclusive, zero-copy)
//!     │                                   │ freeze
//!     │ closed segments                   ▼
//!     ▼                                 Entry (shared, addressed by EntryPtr)
//! SegmentSink (log manager)
//! ```
//!
//! ## Handles
//!
//! An [`EntryPtr`] names an entry by segment index, segment generation and
//! offset. It is a plain `u64`, so it can be stored in atomics (version chain
//! heads and links) and compared without touching the entry. Resolution is
//! generation-checked: a handle into a released segment never resolves.
//!
//! ## Budget
//!
//! The pool is the only bound on transaction memory. When it runs out,
//! [`ExhaustionPolicy`](crate::config::ExhaustionPolicy) decides whether
//! allocation fails with [`PoolExhausted`] or waits for a release.

mod entry_buffer;
mod segment;

pub use entry_buffer::{EntryBuffer, SegmentSink};
pub use segment::{
    Entry, EntryMut, EntryPtr, PoolExhausted, PoolStats, Segment, SegmentEntries, SegmentPool,
};
