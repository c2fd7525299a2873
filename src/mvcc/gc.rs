//! # Garbage Collector
//!
//! Retires completed transactions in two phases:
//!
//! ```text
//! completed ──take──> unlink ──────────────────────> deallocate
//!                       │                               │
//!   committed, commit_ts <= watermark:                  drop the context once
//!     truncate the chain of every written slot          unlinked_at <= watermark
//!   committed, commit_ts > watermark: retry next run
//!   aborted: already off every chain
//!   read-only: dropped right away
//! ```
//!
//! Unlinking only stops new readers from reaching a record. A reader that
//! loaded a chain head before the unlink may still be walking it, so the
//! context (and the segments holding its undo records) is kept until every
//! transaction active at unlink time has finished. `unlinked_at` is read
//! from the clock after the unlink; once the watermark reaches it, no such
//! reader is left.
//!
//! Readers that walk version chains concurrently with a collector must be
//! registered transactions, since only those hold the watermark back.

use super::manager::TransactionManager;
use super::timestamp::{Timestamp, TxnStatus};
use super::transaction::{AdminKey, TransactionContext};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Contexts dropped this run.
    pub deallocated: usize,
    /// Contexts whose undo records were taken off every version chain.
    pub unlinked: usize,
    /// Undo records detached from version chains.
    pub versions_detached: usize,
    /// Committed contexts still visible to some active transaction.
    pub deferred: usize,
}

pub struct GarbageCollector {
    manager: Arc<TransactionManager>,
    key: AdminKey,
    to_unlink: Vec<TransactionContext>,
    to_deallocate: Vec<(Timestamp, TransactionContext)>,
}

impl GarbageCollector {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            key: AdminKey::new(),
            to_unlink: Vec::new(),
            to_deallocate: Vec::new(),
        }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Contexts waiting for their commit to become visible to everyone.
    pub fn pending_unlink(&self) -> usize {
        self.to_unlink.len()
    }

    /// Unlinked contexts waiting for in-flight readers to finish.
    pub fn pending_deallocate(&self) -> usize {
        self.to_deallocate.len()
    }

    /// One collection pass.
    ///
    /// Panics if a table written by a retired transaction is no longer
    /// registered.
    pub fn run(&mut self) -> GcStats {
        let mut stats = GcStats::default();
        let watermark = self.manager.get_global_watermark();

        let before = self.to_deallocate.len();
        self.to_deallocate
            .retain(|(unlinked_at, _)| *unlinked_at > watermark);
        stats.deallocated = before - self.to_deallocate.len();

        let mut candidates = std::mem::take(&mut self.to_unlink);
        candidates.extend(self.manager.take_completed());

        let mut unlinked = Vec::new();
        for mut txn in candidates {
            if txn.undo_len() == 0 {
                stats.deallocated += 1;
                continue;
            }
            match txn.status() {
                TxnStatus::Committed(commit_ts) if commit_ts > watermark => {
                    stats.deferred += 1;
                    self.to_unlink.push(txn);
                }
                TxnStatus::Committed(_) => {
                    stats.versions_detached += self.unlink(&mut txn, watermark);
                    unlinked.push(txn);
                }
                TxnStatus::InProgress(_) => unlinked.push(txn),
            }
        }

        stats.unlinked = unlinked.len();
        if !unlinked.is_empty() {
            let unlinked_at = self.manager.current_time();
            self.to_deallocate
                .extend(unlinked.into_iter().map(|txn| (unlinked_at, txn)));
        }

        debug!(
            watermark,
            deallocated = stats.deallocated,
            unlinked = stats.unlinked,
            detached = stats.versions_detached,
            deferred = stats.deferred,
            "gc pass"
        );
        stats
    }

    fn unlink(&self, txn: &mut TransactionContext, watermark: Timestamp) -> usize {
        let tables = self.manager.tables();
        let admin = txn.admin(&self.key);
        let mut detached = 0;
        for record in admin.undo_records() {
            let table = tables.get(record.table_id()).unwrap_or_else(|| {
                panic!("table {} not registered; cannot unlink versions", record.table_id())
            });
            detached += table
                .truncate_version_chain(record.slot(), watermark)
                .unwrap_or_else(|err| panic!("truncation at {:?} failed: {:#}", record, err));
        }
        detached
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("pending_unlink", &self.pending_unlink())
            .field("pending_deallocate", &self.pending_deallocate())
            .finish()
    }
}
