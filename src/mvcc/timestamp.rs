//! # Timestamps and Transaction Identity
//!
//! A single 64-bit space serves both as commit timestamps and as in-flight
//! transaction ids:
//!
//! ```text
//! 0                         UNCOMMITTED_BASE (1 << 63)                u64::MAX
//! ├──── committed timestamps ────┼──── uncommitted transaction ids ────┤
//! ```
//!
//! Every undo record a transaction writes points at that transaction's
//! [`TxnIdCell`]. While the transaction runs the cell holds its uncommitted
//! id, so concurrent readers compare greater than any snapshot and skip the
//! record's effects. Commit publishes the commit timestamp into the cell with
//! one atomic store, which makes every record of the transaction committed at
//! the same instant, without touching the records.
//!
//! ## Comparisons
//!
//! Timestamps compare as plain unsigned integers. The uncommitted range sits
//! above every committed value, so "newer than my snapshot" covers both
//! "committed after I started" and "not committed yet".

use crate::config::UNCOMMITTED_BASE;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Timestamp = u64;

#[inline]
pub fn is_committed(ts: Timestamp) -> bool {
    ts < UNCOMMITTED_BASE
}

/// `a` is strictly newer than `b` under unsigned comparison.
#[inline]
pub fn newer_than(a: Timestamp, b: Timestamp) -> bool {
    a > b
}

/// Decoded value of a transaction's identity cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    InProgress(Timestamp),
    Committed(Timestamp),
}

impl TxnStatus {
    pub fn decode(raw: Timestamp) -> Self {
        if is_committed(raw) {
            TxnStatus::Committed(raw)
        } else {
            TxnStatus::InProgress(raw)
        }
    }

    pub fn timestamp(self) -> Timestamp {
        match self {
            TxnStatus::InProgress(ts) | TxnStatus::Committed(ts) => ts,
        }
    }

    pub fn is_committed(self) -> bool {
        matches!(self, TxnStatus::Committed(_))
    }
}

/// Shared cell holding a transaction's current identity.
///
/// Undo records hold a back-reference to it. The cell transitions exactly
/// once, from an uncommitted id to a committed timestamp.
#[derive(Debug)]
pub struct TxnIdCell {
    value: AtomicU64,
}

impl TxnIdCell {
    pub fn new(txn_id: Timestamp) -> Self {
        assert!(
            !is_committed(txn_id),
            "transaction id {} is in the committed range",
            txn_id
        );
        Self {
            value: AtomicU64::new(txn_id),
        }
    }

    #[inline]
    pub fn load(&self) -> Timestamp {
        self.value.load(Ordering::Acquire)
    }

    pub fn status(&self) -> TxnStatus {
        TxnStatus::decode(self.load())
    }

    /// Swap the uncommitted id for `commit_ts`, returning the id.
    ///
    /// Panics on a second publication or a commit timestamp outside the
    /// committed range.
    pub(crate) fn publish_commit(&self, commit_ts: Timestamp) -> Timestamp {
        assert!(
            is_committed(commit_ts),
            "commit timestamp {} is in the uncommitted range",
            commit_ts
        );
        let current = self.load();
        assert!(
            !is_committed(current),
            "transaction already committed at {}",
            current
        );
        match self
            .value
            .compare_exchange(current, commit_ts, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(id) => id,
            Err(actual) => panic!(
                "transaction {} published concurrently (found {})",
                current, actual
            ),
        }
    }
}

/// Snapshot a reader evaluates version chains against.
///
/// `txn_id` is the reader's own uncommitted id, so it sees its own writes.
/// Plain snapshots use 0, which no transaction ever owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    pub start_time: Timestamp,
    pub txn_id: Timestamp,
}

impl ReadView {
    pub fn snapshot(start_time: Timestamp) -> Self {
        Self {
            start_time,
            txn_id: 0,
        }
    }

    /// Whether the effects of a record stamped `ts` are hidden from this view,
    /// so its before-image must be applied.
    #[inline]
    pub fn must_undo(&self, ts: Timestamp) -> bool {
        ts != self.txn_id && newer_than(ts, self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_range_is_below_base() {
        assert!(is_committed(0));
        assert!(is_committed(UNCOMMITTED_BASE - 1));
        assert!(!is_committed(UNCOMMITTED_BASE));
        assert!(!is_committed(u64::MAX));
    }

    #[test]
    fn test_uncommitted_ids_are_newer_than_any_commit() {
        assert!(newer_than(UNCOMMITTED_BASE, UNCOMMITTED_BASE - 1));
        assert!(newer_than(UNCOMMITTED_BASE + 7, 12));
        assert!(!newer_than(5, 5));
    }

    #[test]
    fn test_status_decode() {
        assert_eq!(TxnStatus::decode(12), TxnStatus::Committed(12));
        assert_eq!(
            TxnStatus::decode(UNCOMMITTED_BASE + 3),
            TxnStatus::InProgress(UNCOMMITTED_BASE + 3)
        );
        assert_eq!(TxnStatus::decode(UNCOMMITTED_BASE + 3).timestamp(), UNCOMMITTED_BASE + 3);
    }

    #[test]
    fn test_publish_commit_swaps_identity_once() {
        let cell = TxnIdCell::new(UNCOMMITTED_BASE + 1);
        assert_eq!(cell.status(), TxnStatus::InProgress(UNCOMMITTED_BASE + 1));

        assert_eq!(cell.publish_commit(12), UNCOMMITTED_BASE + 1);
        assert_eq!(cell.status(), TxnStatus::Committed(12));
    }

    #[test]
    #[should_panic(expected = "already committed")]
    fn test_double_publish_panics() {
        let cell = TxnIdCell::new(UNCOMMITTED_BASE);
        cell.publish_commit(3);
        cell.publish_commit(4);
    }

    #[test]
    #[should_panic(expected = "committed range")]
    fn test_committed_value_is_not_an_identity() {
        TxnIdCell::new(42);
    }

    #[test]
    fn test_read_view_hides_newer_and_foreign_uncommitted() {
        let view = ReadView {
            start_time: 8,
            txn_id: UNCOMMITTED_BASE + 2,
        };
        assert!(view.must_undo(12));
        assert!(view.must_undo(UNCOMMITTED_BASE + 5));
        assert!(!view.must_undo(UNCOMMITTED_BASE + 2));
        assert!(!view.must_undo(8));
        assert!(!view.must_undo(3));

        assert!(ReadView::snapshot(15).must_undo(UNCOMMITTED_BASE));
        assert!(!ReadView::snapshot(15).must_undo(12));
    }
}
