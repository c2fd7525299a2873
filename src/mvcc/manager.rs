//! # Transaction Manager
//!
//! Global coordinator: hands out start times and transaction ids, tracks
//! active transactions, publishes commits and drives aborts.
//!
//! ## Memory Layout
//!
//! ```text
//! TransactionManager {
//!     clock: AtomicU64,                    // next start / commit timestamp
//!     next_txn_id: AtomicU64,              // next uncommitted id
//!     active_slots: [AtomicU64; 64],       // start times of active txns
//!     slot_lock: Mutex<()>,                // begin / commit publication
//!     completed: Mutex<Vec<TransactionContext>>,  // handed to the GC
//! }
//! ```
//!
//! ## Commit
//!
//! ```text
//! stage commit record (commit_ts pending)      may fail -> abort instead
//!    │
//!    ▼
//! slot_lock ─┬─ commit_ts = clock++
//!            └─ publish commit_ts into the identity cell
//!    │
//!    ▼
//! seal commit record, close redo buffer, free active slot, queue for GC
//! ```
//!
//! Holding `slot_lock` across allocation and publication means no
//! transaction can begin with a start time above `commit_ts` and still see
//! the committing transaction as in progress.
//!
//! ## Watermark
//!
//! The oldest active start time (or the clock, when nothing is active).
//! Every record committed at or before it is visible to every active and
//! future transaction, so older versions behind it can be detached.

use super::table::TableRegistry;
use super::timestamp::Timestamp;
use super::transaction::{AdminKey, TransactionContext};
use crate::config::{INITIAL_TIMESTAMP, MAX_CONCURRENT_TXNS, UNCOMMITTED_BASE};
use crate::memory::{SegmentPool, SegmentSink};
use eyre::{bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TransactionManager {
    pool: SegmentPool,
    log_sink: Option<Arc<dyn SegmentSink>>,
    tables: Arc<TableRegistry>,
    pub(crate) clock: AtomicU64,
    next_txn_id: AtomicU64,
    pub(crate) active_slots: [AtomicU64; MAX_CONCURRENT_TXNS],
    slot_lock: Mutex<()>,
    completed: Mutex<Vec<TransactionContext>>,
    key: AdminKey,
}

impl TransactionManager {
    pub fn new(pool: SegmentPool, tables: Arc<TableRegistry>) -> Self {
        Self::with_initial_timestamp(pool, tables, INITIAL_TIMESTAMP)
    }

    #[allow(clippy::declare_interior_mutable_const)]
    pub fn with_initial_timestamp(
        pool: SegmentPool,
        tables: Arc<TableRegistry>,
        initial: Timestamp,
    ) -> Self {
        assert!(initial > 0 && initial < UNCOMMITTED_BASE, "invalid initial timestamp {}", initial);
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            pool,
            log_sink: None,
            tables,
            clock: AtomicU64::new(initial),
            next_txn_id: AtomicU64::new(UNCOMMITTED_BASE),
            #[allow(clippy::borrow_interior_mutable_const)]
            active_slots: [INIT; MAX_CONCURRENT_TXNS],
            slot_lock: Mutex::new(()),
            completed: Mutex::new(Vec::new()),
            key: AdminKey::new(),
        }
    }

    /// Closed redo segments of every transaction go to `sink`.
    pub fn with_log_sink(mut self, sink: Arc<dyn SegmentSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn tables(&self) -> &Arc<TableRegistry> {
        &self.tables
    }

    pub fn current_time(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active_slots
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }

    pub fn begin(&self) -> Result<TransactionContext> {
        let _guard = self.slot_lock.lock();
        let Some(slot) = self
            .active_slots
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == 0)
        else {
            warn!(max = MAX_CONCURRENT_TXNS, "no free transaction slot");
            bail!(
                "too many concurrent transactions (max {})",
                MAX_CONCURRENT_TXNS
            );
        };

        let start_time = self.clock.fetch_add(1, Ordering::SeqCst);
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        slot.store(start_time, Ordering::SeqCst);

        debug!(start_time, txn_id, "transaction started");
        Ok(TransactionContext::new(
            start_time,
            txn_id,
            &self.pool,
            self.log_sink.clone(),
        ))
    }

    /// Commit `txn`, returning its commit timestamp.
    ///
    /// If the commit record cannot be staged the transaction is aborted
    /// instead and the error returned.
    pub fn commit(&self, mut txn: TransactionContext) -> Result<Timestamp> {
        let start_time = txn.start_time();
        let staged = txn.admin(&self.key).stage_commit_record();
        let record = match staged {
            Ok(record) => record,
            Err(err) => {
                self.abort(txn);
                return Err(err.wrap_err(format!(
                    "transaction {} aborted: commit record could not be staged",
                    start_time
                )));
            }
        };

        let mut admin = txn.admin(&self.key);
        let commit_ts = {
            let _guard = self.slot_lock.lock();
            let commit_ts = self.clock.fetch_add(1, Ordering::SeqCst);
            admin.publish_commit(commit_ts);
            self.release_slot(start_time);
            commit_ts
        };
        admin.seal_commit_record(record, commit_ts);
        admin.close_redo();

        debug!(start_time, commit_ts, "transaction committed");
        self.completed.lock().push(txn);
        Ok(commit_ts)
    }

    /// Revert every installed write of `txn` and retire it.
    ///
    /// Panics if a written table is no longer registered: the writes could
    /// not be reverted and would stay locked forever.
    pub fn abort(&self, mut txn: TransactionContext) {
        let start_time = txn.start_time();
        let txn_id = txn.txn_id();

        let mut reverted = 0usize;
        for record in txn.admin(&self.key).undo_records() {
            let table = self.tables.get(record.table_id()).unwrap_or_else(|| {
                panic!("table {} not registered; cannot roll back", record.table_id())
            });
            let rolled_back = table.rollback(txn_id, record.slot()).unwrap_or_else(|err| {
                panic!("rollback of {:?} failed: {:#}", record, err)
            });
            if rolled_back {
                reverted += 1;
            }
        }

        let mut admin = txn.admin(&self.key);
        if let Err(err) = admin.stage_abort_record() {
            warn!(start_time, %err, "abort record not logged");
        }
        admin.close_redo();

        self.release_slot_locked(start_time);
        debug!(start_time, reverted, "transaction aborted");
        self.completed.lock().push(txn);
    }

    /// Oldest start time among active transactions, or the clock.
    pub fn get_global_watermark(&self) -> Timestamp {
        let _guard = self.slot_lock.lock();
        let mut min_ts = self.clock.load(Ordering::SeqCst);
        for slot in &self.active_slots {
            let ts = slot.load(Ordering::Relaxed);
            if ts != 0 && ts < min_ts {
                min_ts = ts;
            }
        }
        min_ts
    }

    /// Completed transactions not yet handed to the garbage collector.
    pub fn pending_completed(&self) -> usize {
        self.completed.lock().len()
    }

    pub(crate) fn take_completed(&self) -> Vec<TransactionContext> {
        std::mem::take(&mut *self.completed.lock())
    }

    fn release_slot_locked(&self, start_time: Timestamp) {
        let _guard = self.slot_lock.lock();
        self.release_slot(start_time);
    }

    fn release_slot(&self, start_time: Timestamp) {
        match self
            .active_slots
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == start_time)
        {
            Some(slot) => slot.store(0, Ordering::SeqCst),
            None => panic!("transaction {} does not hold an active slot", start_time),
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("clock", &self.current_time())
            .field("active", &self.active_count())
            .field("pending_completed", &self.pending_completed())
            .finish()
    }
}
