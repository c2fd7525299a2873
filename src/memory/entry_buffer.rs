//! # Growable Entry Buffer
//!
//! Append-only sequence of variable-size entries backed by pooled segments.
//! Undo and redo buffers are both built on it.
//!
//! ## Growth
//!
//! ```text
//! new_entry(size)
//!   ├── current segment fits header + aligned size -> reserve in place
//!   └── otherwise
//!         ├── acquire a fresh segment from the pool   (may fail: PoolExhausted)
//!         ├── close the full segment                  (sink, or keep it)
//!         └── reserve in the fresh segment
//! ```
//!
//! A failed acquisition leaves the buffer exactly as it was. Entries never
//! straddle segments, so their handles stay valid and their addresses stable
//! until the buffer (or the sink that took the segment) releases it.
//!
//! ## Segment Sinks
//!
//! A buffer created with a [`SegmentSink`] hands every closed segment to the
//! sink instead of retaining it. Redo buffers use this to stream full
//! segments to the log manager while the transaction is still running; such
//! a buffer only iterates the entries of segments it still holds.

use super::segment::{Entry, EntryMut, EntryPtr, Segment, SegmentPool};
use crate::config::MAX_ENTRY_SIZE;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::trace;

/// Receiver for segments an [`EntryBuffer`] has finished writing.
pub trait SegmentSink: Send + Sync {
    fn segment_closed(&self, segment: Segment);
}

pub struct EntryBuffer {
    pool: SegmentPool,
    sink: Option<Arc<dyn SegmentSink>>,
    segments: Vec<Segment>,
    entries: usize,
    bytes_used: usize,
    closed_segments: usize,
}

impl EntryBuffer {
    pub fn new(pool: SegmentPool) -> Self {
        Self {
            pool,
            sink: None,
            segments: Vec::new(),
            entries: 0,
            bytes_used: 0,
            closed_segments: 0,
        }
    }

    pub fn with_sink(pool: SegmentPool, sink: Arc<dyn SegmentSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(pool)
        }
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Reserve a region of `size` bytes at the end of the buffer.
    ///
    /// The region may hold bytes from a previous user of the segment; callers
    /// overwrite every byte they later read. Panics if `size` exceeds
    /// [`MAX_ENTRY_SIZE`].
    pub fn new_entry(&mut self, size: usize) -> Result<EntryMut<'_>> {
        assert!(
            size <= MAX_ENTRY_SIZE,
            "entry of {} bytes exceeds the segment capacity of {} bytes",
            size,
            MAX_ENTRY_SIZE
        );

        if !self.segments.last().is_some_and(|s| s.fits(size)) {
            self.grow()?;
        }

        self.entries += 1;
        self.bytes_used += size;
        Ok(self.current_mut().reserve(size))
    }

    /// Close the segment currently being written.
    ///
    /// With a sink the segment is handed over (or returned to the pool when
    /// empty); without one this is a no-op because every segment is retained.
    pub fn close_current(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if let Some(segment) = self.segments.pop() {
            self.hand_off(&*sink, segment);
        }
    }

    pub fn get(&self, ptr: EntryPtr) -> Option<Entry<'_>> {
        self.segments.iter().find_map(|s| s.entry(ptr))
    }

    pub(crate) fn get_mut(&mut self, ptr: EntryPtr) -> Option<EntryMut<'_>> {
        self.segments.iter_mut().find_map(|s| s.entry_mut(ptr))
    }

    /// Entries of every retained segment, in write order.
    pub fn entries(&self) -> impl Iterator<Item = Entry<'_>> + '_ {
        self.segments.iter().flat_map(Segment::entries)
    }

    /// Number of entries ever written, including those in closed segments.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Payload bytes ever requested, excluding headers and padding.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Segments currently held by this buffer.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn closed_segments(&self) -> usize {
        self.closed_segments
    }

    fn grow(&mut self) -> Result<()> {
        let fresh = self
            .pool
            .acquire()
            .wrap_err_with(|| format!("failed to grow entry buffer past {} segments", self.segments.len()))?;

        if let Some(sink) = self.sink.clone() {
            if let Some(full) = self.segments.pop() {
                self.hand_off(&*sink, full);
            }
        }

        self.segments.push(fresh);
        Ok(())
    }

    fn hand_off(&mut self, sink: &dyn SegmentSink, segment: Segment) {
        if segment.is_empty() {
            return;
        }
        trace!(
            index = segment.index(),
            entries = segment.entry_count(),
            "handing closed segment to sink"
        );
        self.closed_segments += 1;
        sink.segment_closed(segment);
    }

    fn current_mut(&mut self) -> &mut Segment {
        // INVARIANT: new_entry grows the buffer before reserving, so there is
        // always a current segment here
        self.segments.last_mut().unwrap()
    }
}

impl std::fmt::Debug for EntryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryBuffer")
            .field("entries", &self.entries)
            .field("bytes_used", &self.bytes_used)
            .field("segments", &self.segments.len())
            .field("closed_segments", &self.closed_segments)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ENTRY_HEADER_SIZE, SEGMENT_SIZE};
    use crate::memory::PoolExhausted;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        segments: Mutex<Vec<Segment>>,
    }

    impl SegmentSink for CollectingSink {
        fn segment_closed(&self, segment: Segment) {
            self.segments.lock().push(segment);
        }
    }

    fn write(buffer: &mut EntryBuffer, fill: u8, size: usize) -> EntryPtr {
        let mut entry = buffer.new_entry(size).unwrap();
        entry.bytes_mut().fill(fill);
        entry.ptr()
    }

    #[test]
    fn test_entries_are_aligned_and_stable() {
        let pool = SegmentPool::with_limit(16);
        let mut buffer = EntryBuffer::new(pool);

        let ptrs: Vec<_> = (0..200u8).map(|i| write(&mut buffer, i, 37)).collect();

        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(ptr.offset() % 8, 0);
            let entry = buffer.get(*ptr).unwrap();
            assert_eq!(entry.len(), 37);
            assert!(entry.bytes().iter().all(|b| *b == i as u8));
        }
        assert!(buffer.segment_count() > 1);
    }

    #[test]
    fn test_iteration_matches_write_order() {
        let pool = SegmentPool::with_limit(16);
        let mut buffer = EntryBuffer::new(pool);

        let sizes = [1usize, 8, 500, 3000, 17, 4000, 2];
        for (i, size) in sizes.iter().enumerate() {
            write(&mut buffer, i as u8, *size);
        }

        let seen: Vec<(usize, u8)> = buffer.entries().map(|e| (e.len(), e.bytes()[0])).collect();
        let expected: Vec<(usize, u8)> = sizes.iter().enumerate().map(|(i, s)| (*s, i as u8)).collect();
        assert_eq!(seen, expected);

        // restartable
        assert_eq!(buffer.entries().count(), sizes.len());
        assert_eq!(buffer.len(), sizes.len());
        assert_eq!(buffer.bytes_used(), sizes.iter().sum::<usize>());
    }

    #[test]
    fn test_largest_entry_fills_one_segment() {
        let pool = SegmentPool::with_limit(4);
        let mut buffer = EntryBuffer::new(pool.clone());

        write(&mut buffer, 1, SEGMENT_SIZE - ENTRY_HEADER_SIZE);
        write(&mut buffer, 2, SEGMENT_SIZE - ENTRY_HEADER_SIZE);
        assert_eq!(buffer.segment_count(), 2);
        assert_eq!(pool.stats().outstanding, 2);
    }

    #[test]
    #[should_panic(expected = "exceeds the segment capacity")]
    fn test_oversized_entry_panics() {
        let pool = SegmentPool::with_limit(4);
        let mut buffer = EntryBuffer::new(pool);
        let _ = buffer.new_entry(SEGMENT_SIZE);
    }

    #[test]
    fn test_exhaustion_leaves_buffer_unchanged() {
        let pool = SegmentPool::new(PoolConfig::new().size_limit(1));
        let mut buffer = EntryBuffer::new(pool);

        let first = write(&mut buffer, 7, 3000);
        let err = buffer.new_entry(3000).unwrap_err();
        assert!(err.downcast_ref::<PoolExhausted>().is_some());

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.entries().count(), 1);
        assert!(buffer.get(first).is_some());

        // smaller entries still fit in the current segment
        write(&mut buffer, 8, 64);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drop_returns_segments_to_pool() {
        let pool = SegmentPool::with_limit(8);
        {
            let mut buffer = EntryBuffer::new(pool.clone());
            for _ in 0..5 {
                write(&mut buffer, 0, 3000);
            }
            assert_eq!(pool.stats().outstanding, 5);
        }
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_full_segments_go_to_sink() {
        let pool = SegmentPool::with_limit(8);
        let sink = Arc::new(CollectingSink::default());
        let mut buffer = EntryBuffer::with_sink(pool.clone(), sink.clone());

        write(&mut buffer, 1, 3000);
        write(&mut buffer, 2, 3000);
        write(&mut buffer, 3, 3000);

        assert_eq!(sink.segments.lock().len(), 2);
        assert_eq!(buffer.segment_count(), 1);
        assert_eq!(buffer.closed_segments(), 2);
        assert_eq!(buffer.entries().count(), 1);

        buffer.close_current();
        assert_eq!(sink.segments.lock().len(), 3);
        assert_eq!(buffer.segment_count(), 0);

        let firsts: Vec<u8> = sink
            .segments
            .lock()
            .iter()
            .map(|s| s.entries().next().unwrap().bytes()[0])
            .collect();
        assert_eq!(firsts, vec![1, 2, 3]);

        sink.segments.lock().clear();
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_close_without_sink_keeps_segments() {
        let pool = SegmentPool::with_limit(4);
        let mut buffer = EntryBuffer::new(pool);
        write(&mut buffer, 1, 10);
        buffer.close_current();
        assert_eq!(buffer.segment_count(), 1);
        assert_eq!(buffer.entries().count(), 1);
    }
}
