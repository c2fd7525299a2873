//! # Multi-Version Concurrency Control (MVCC)
//!
//! Transaction-local core of the engine: every transaction owns a context
//! with an undo buffer (before-images, linked into tuple version chains so
//! older snapshots can be reconstructed) and a redo buffer (after-images,
//! handed to the log once the transaction finishes).
//!
//! ## Design Philosophy
//!
//! ### Newest In Place, Older Versions In Undo Records
//!
//! Tables keep the newest values of a tuple in place. Each write links an
//! undo record in front of the tuple's version chain; readers whose
//! snapshot predates the write apply the record's before-image.
//!
//! ```text
//!        [ DataTable slot 7 ]
//!        +-----------------------------+
//!        | values: c = 20              |
//!        | version ───────────────────────\
//!        +-----------------------------+   \
//!                                           \   [ undo segment of T1 ]
//!                                            \  +-------------------------+
//!                                             ->| kind: Update            |
//!                                               | owner: T1 (ts 12)       |
//!                                               | next: NULL              |
//!                                               | before-image: c = 10    |
//!                                               +-------------------------+
//! ```
//!
//! ### One Identity Cell Per Transaction
//!
//! Undo records do not carry a timestamp of their own. They point at their
//! writer's identity cell, which holds an uncommitted id (at or above
//! `UNCOMMITTED_BASE`) until commit and the commit timestamp afterwards.
//! Publishing the commit timestamp makes every record of the transaction
//! committed in one atomic store.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! begin() ─────> InProgress ─────> commit() ─────> Committed(ts)
//!                    │                                  │
//!                    │                                  v
//!                    └──> abort() ──> rolled back    GarbageCollector
//!                                          │         unlinks, then frees
//!                                          └────────────────^
//! ```
//!
//! ## Visibility Rules (Snapshot Isolation)
//!
//! A reader with start time S and id I walks the chain from the head and
//! applies every record whose timestamp T satisfies `T != I && T > S`. It
//! stops at the first record that fails the test: everything behind it is
//! at least as old.
//!
//! ## Key Structures
//!
//! - `TransactionContext`: start time, identity cell, undo and redo buffers
//! - `UndoRecord` / `RedoRecord`: typed views over buffer entries
//! - `ProjectedRow`: self-describing subset of a tuple's columns
//! - `DataTable`: in-memory versioned table consuming the records
//! - `TransactionManager`: clock, active slots, commit and abort
//! - `GarbageCollector`: retires finished transactions

pub mod gc;
pub mod manager;
pub mod projected_row;
pub mod redo_record;
pub mod table;
pub mod timestamp;
pub mod transaction;
pub mod undo_record;

pub use gc::{GarbageCollector, GcStats};
pub use manager::TransactionManager;
pub use projected_row::{BlockLayout, ColumnId, ProjectedRow, ProjectedRowInitializer, ProjectedRowMut};
pub use redo_record::{LogRecord, LogRecordKind, RedoBuffer, RedoRecord, RedoRecordMut};
pub use table::{DataTable, TableId, TableRegistry, TupleSlot, WriteCheckResult};
pub use timestamp::{ReadView, Timestamp, TxnIdCell, TxnStatus};
pub use transaction::{AdminKey, TransactionContext, TxnAdmin};
pub use undo_record::{UndoBuffer, UndoKind, UndoRecord, UndoRecordMut, WriteDescription};
