//! # TurDB Transaction Core
//!
//! Transaction-local machinery of TurDB's MVCC engine: pooled fixed-size
//! segments, growable entry buffers carved out of them, undo records that
//! form tuple version chains, redo records handed to the log, and the
//! per-transaction context tying them together.
//!
//! - **Bounded memory**: every record lives in a segment from a bounded
//!   [`SegmentPool`]; exhaustion is reported, or waited out, per
//!   [`PoolConfig`]
//! - **Stable handles**: records are addressed by generation-checked
//!   [`EntryPtr`]s that stay valid while the owning buffer holds them
//! - **Atomic visibility**: a transaction's undo records share one identity
//!   cell, so publishing its commit timestamp commits all of them at once
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use turdb_txn::mvcc::{BlockLayout, DataTable, TableRegistry, TransactionManager};
//! use turdb_txn::SegmentPool;
//!
//! let pool = SegmentPool::with_limit(1024);
//! let tables = Arc::new(TableRegistry::new());
//! let accounts = Arc::new(DataTable::new(1, BlockLayout::new(&[8, 8])?, pool.clone())?);
//! tables.register(Arc::clone(&accounts))?;
//! let manager = TransactionManager::new(pool, tables);
//!
//! let mut txn = manager.begin()?;
//! let redo = {
//!     let mut redo = txn.stage_write(1, TupleSlot::from_raw(0), accounts.full_row_initializer())?;
//!     redo.delta_mut().set_value(0, &1u64.to_le_bytes());
//!     redo.delta_mut().set_value(1, &100u64.to_le_bytes());
//!     redo.ptr()
//! };
//! let slot = accounts.insert(&mut txn, redo)?;
//! let commit_ts = manager.commit(txn)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  TransactionManager │ GarbageCollector       │
//! ├──────────────────────────────────────────────┤
//! │  TransactionContext (undo + redo buffers)    │
//! ├───────────────────────┬──────────────────────┤
//! │  UndoRecord / chains  │ RedoRecord → wal     │
//! ├───────────────────────┴──────────────────────┤
//! │  EntryBuffer                                 │
//! ├──────────────────────────────────────────────┤
//! │  SegmentPool (bounded, generation-checked)   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: constants and pool configuration
//! - [`memory`]: segment pool and entry buffers
//! - [`mvcc`]: records, transaction context, table, manager, GC
//! - [`wal`]: log manager consuming closed redo segments

#[macro_use]
mod macros;

pub mod config;
pub mod memory;
pub mod mvcc;
pub mod wal;

pub use config::{ExhaustionPolicy, PoolConfig};
pub use memory::{EntryBuffer, EntryPtr, PoolExhausted, PoolStats, SegmentPool, SegmentSink};
pub use mvcc::{GarbageCollector, TransactionContext, TransactionManager};
pub use wal::{LogManager, LogReader};
