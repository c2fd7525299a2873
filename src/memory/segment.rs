//! # Segment Pool
//!
//! Bounded, lock-sharded pool of fixed-size segments shared by every live
//! transaction, the garbage collector and the log flusher.
//!
//! ## Purpose
//!
//! Undo and redo buffers grow by whole segments. Drawing segments from a
//! shared pool keeps staging a write allocation-free once the pool is warm,
//! and gives every entry a stable address for as long as its segment is
//! checked out.
//!
//! ## Segment Arena
//!
//! The pool owns every segment it ever created. A segment is identified by its
//! index in the arena and a generation counter that is bumped on release:
//!
//! ```text
//! slots: [ SegmentSlot; size_limit ]
//!          ├── memory: OnceLock<Box<SegmentMemory>>   (allocated on first use)
//!          └── generation: AtomicU32                  (bumped on release)
//!
//! EntryPtr (u64) = index:24 | generation:24 | offset:16
//! ```
//!
//! Resolving an [`EntryPtr`] checks the generation, so a handle into a segment
//! that has been released (and maybe reused) is detected instead of silently
//! reading someone else's bytes. Memory is only freed when the pool itself is
//! dropped, so resolution never touches freed memory.
//!
//! ## Design
//!
//! Free lists use lock sharding (`POOL_SHARD_COUNT` shards) to reduce
//! contention, the same strategy as the page buffer pool. A released segment
//! goes back to the shard derived from its index; acquisition starts at a
//! round-robin shard and scans the rest before creating a fresh segment.
//!
//! `Segment` returns itself to the pool when dropped, so `release()` is only a
//! named drop.
//!
//! ## Exhaustion
//!
//! At most `size_limit` segments are ever created. Once they are all checked
//! out, [`ExhaustionPolicy`] decides between failing with [`PoolExhausted`]
//! and waiting on a condvar for a release.

use crate::config::{
    ExhaustionPolicy, PoolConfig, ENTRY_ALIGN, ENTRY_HEADER_SIZE, POOL_SHARD_COUNT,
    PTR_GENERATION_BITS, PTR_INDEX_BITS, PTR_OFFSET_BITS, SEGMENT_SIZE,
};
use eyre::Result;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

const GENERATION_MASK: u32 = (1 << PTR_GENERATION_BITS) - 1;
const OFFSET_MASK: u64 = (1 << PTR_OFFSET_BITS) - 1;
const INDEX_SHIFT: u32 = PTR_GENERATION_BITS + PTR_OFFSET_BITS;

#[inline]
pub(crate) const fn align_entry(size: usize) -> usize {
    (size + ENTRY_ALIGN - 1) & !(ENTRY_ALIGN - 1)
}

#[inline]
fn next_generation(generation: u32) -> u32 {
    match (generation + 1) & GENERATION_MASK {
        0 => 1,
        g => g,
    }
}

/// Stable handle to an entry inside a pooled segment.
///
/// `EntryPtr::NULL` (all zero bits) never names a live entry: generations
/// start at 1 and wrap around skipping 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryPtr(u64);

impl EntryPtr {
    pub const NULL: EntryPtr = EntryPtr(0);

    pub(crate) fn new(index: u32, generation: u32, offset: usize) -> Self {
        debug_assert!((index as usize) < (1 << PTR_INDEX_BITS));
        debug_assert!(generation != 0 && generation <= GENERATION_MASK);
        debug_assert!(offset < SEGMENT_SIZE);
        Self(((index as u64) << INDEX_SHIFT) | ((generation as u64) << PTR_OFFSET_BITS) | offset as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn segment_index(self) -> u32 {
        (self.0 >> INDEX_SHIFT) as u32
    }

    pub fn generation(self) -> u32 {
        ((self.0 >> PTR_OFFSET_BITS) as u32) & GENERATION_MASK
    }

    pub fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }
}

impl std::fmt::Debug for EntryPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return f.write_str("EntryPtr(null)");
        }
        write!(
            f,
            "EntryPtr({}#{}+{})",
            self.segment_index(),
            self.generation(),
            self.offset()
        )
    }
}

#[repr(C, align(8))]
struct SegmentMemory {
    bytes: UnsafeCell<[u8; SEGMENT_SIZE]>,
}

// SAFETY: all access goes through raw pointers handed out under the ownership
// rules of `Segment`: the owner writes only ranges that have not been
// published yet, and readers only read published entries.
unsafe impl Sync for SegmentMemory {}
unsafe impl Send for SegmentMemory {}

impl SegmentMemory {
    fn boxed() -> Box<Self> {
        Box::new(Self {
            bytes: UnsafeCell::new([0u8; SEGMENT_SIZE]),
        })
    }

    fn base(&self) -> NonNull<u8> {
        // INVARIANT: UnsafeCell::get never returns null
        NonNull::new(self.bytes.get().cast::<u8>()).unwrap()
    }
}

struct SegmentSlot {
    memory: OnceLock<Box<SegmentMemory>>,
    generation: AtomicU32,
}

impl SegmentSlot {
    fn new() -> Self {
        Self {
            memory: OnceLock::new(),
            generation: AtomicU32::new(1),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    slots: Box<[SegmentSlot]>,
    free: [Mutex<Vec<u32>>; POOL_SHARD_COUNT],
    /// Round-robin counter for distributing acquire requests across shards
    next_shard: AtomicUsize,
    created: AtomicUsize,
    outstanding: AtomicUsize,
    release_lock: Mutex<()>,
    released: Condvar,
}

/// Error returned when the pool cannot hand out another segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted {
    pub size_limit: usize,
    pub outstanding: usize,
    pub waited: Option<Duration>,
}

impl std::fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segment pool exhausted: {} of {} segments checked out",
            self.outstanding, self.size_limit
        )?;
        if let Some(waited) = self.waited {
            write!(f, " after waiting {:?}", waited)?;
        }
        Ok(())
    }
}

impl std::error::Error for PoolExhausted {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size_limit: usize,
    pub created: usize,
    pub outstanding: usize,
    pub reusable: usize,
}

impl PoolStats {
    pub fn available(&self) -> usize {
        self.size_limit.saturating_sub(self.outstanding)
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segments:{}/{},created:{},reusable:{}",
            self.outstanding, self.size_limit, self.created, self.reusable
        )
    }
}

/// Shared handle to a segment pool. Cloning is cheap and shares segments.
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl SegmentPool {
    pub fn new(config: PoolConfig) -> Self {
        let slots = (0..config.size_limit).map(|_| SegmentSlot::new()).collect();
        let free: [Mutex<Vec<u32>>; POOL_SHARD_COUNT] = std::array::from_fn(|_| Mutex::new(Vec::new()));

        Self {
            inner: Arc::new(PoolInner {
                config,
                slots,
                free,
                next_shard: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                release_lock: Mutex::new(()),
                released: Condvar::new(),
            }),
        }
    }

    pub fn with_limit(size_limit: usize) -> Self {
        Self::new(PoolConfig::new().size_limit(size_limit))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a segment, reusing a released one when possible.
    ///
    /// Fails with [`PoolExhausted`] (inside the report) once `size_limit`
    /// segments are checked out, immediately or after the configured wait.
    pub fn acquire(&self) -> Result<Segment> {
        if let Some(segment) = self.try_acquire() {
            return Ok(segment);
        }

        match self.inner.config.exhaustion {
            ExhaustionPolicy::Fail => Err(self.exhausted(None)),
            ExhaustionPolicy::Block { timeout } => self.acquire_blocking(timeout),
        }
    }

    /// Return a segment to the pool. Equivalent to dropping it.
    pub fn release(&self, segment: Segment) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &segment.pool),
            "segment released into a pool that did not create it"
        );
        drop(segment);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size_limit: self.inner.config.size_limit,
            created: self.inner.created.load(Ordering::Acquire),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            reusable: self.inner.free.iter().map(|s| s.lock().len()).sum(),
        }
    }

    pub fn same_pool(&self, other: &SegmentPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve a handle to the entry it names.
    ///
    /// Returns `None` for the null handle and for handles whose segment has
    /// been released since the handle was created.
    pub(crate) fn resolve(&self, ptr: EntryPtr) -> Option<Entry<'_>> {
        if ptr.is_null() {
            return None;
        }
        let slot = self.inner.slots.get(ptr.segment_index() as usize)?;
        let memory = slot.memory.get()?;
        if slot.generation.load(Ordering::Acquire) != ptr.generation() {
            return None;
        }
        let offset = ptr.offset();
        if offset < ENTRY_HEADER_SIZE || offset % ENTRY_ALIGN != 0 {
            return None;
        }
        // SAFETY: offset - ENTRY_HEADER_SIZE is 8-aligned and inside the
        // segment; entry headers are written once before the entry is handed
        // out and never modified afterwards.
        let len = unsafe {
            memory
                .base()
                .as_ptr()
                .add(offset - ENTRY_HEADER_SIZE)
                .cast::<u32>()
                .read()
        } as usize;
        if offset + len > SEGMENT_SIZE {
            return None;
        }
        // SAFETY: offset is inside the segment (checked above)
        let data = unsafe { NonNull::new_unchecked(memory.base().as_ptr().add(offset)) };
        Some(Entry::new(ptr, data, len).tracking(&slot.generation))
    }

    fn try_acquire(&self) -> Option<Segment> {
        let inner = &*self.inner;
        let start = inner.next_shard.fetch_add(1, Ordering::Relaxed) % POOL_SHARD_COUNT;

        for i in 0..POOL_SHARD_COUNT {
            let shard = (start + i) % POOL_SHARD_COUNT;
            let reused = inner.free[shard].lock().pop();
            if let Some(index) = reused {
                return Some(self.checkout(index));
            }
        }

        let limit = inner.config.size_limit;
        let index = inner
            .created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |created| {
                (created < limit).then_some(created + 1)
            })
            .ok()?;
        Some(self.checkout(index as u32))
    }

    fn acquire_blocking(&self, timeout: Option<Duration>) -> Result<Segment> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut guard = self.inner.release_lock.lock();

        loop {
            if let Some(segment) = self.try_acquire() {
                return Ok(segment);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.released.wait_until(&mut guard, deadline).timed_out() {
                        return self
                            .try_acquire()
                            .ok_or_else(|| self.exhausted(Some(started.elapsed())));
                    }
                }
                None => self.inner.released.wait(&mut guard),
            }
        }
    }

    fn checkout(&self, index: u32) -> Segment {
        let slot = &self.inner.slots[index as usize];
        let base = slot.memory.get_or_init(SegmentMemory::boxed).base();
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        Segment {
            pool: Arc::clone(&self.inner),
            base,
            index,
            generation: slot.generation.load(Ordering::Acquire),
            used: 0,
            entries: 0,
        }
    }

    fn exhausted(&self, waited: Option<Duration>) -> eyre::Report {
        let err = PoolExhausted {
            size_limit: self.inner.config.size_limit,
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            waited,
        };
        warn!(%err, "segment acquisition failed");
        eyre::Report::new(err)
    }
}

impl Clone for SegmentPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive ownership of one pooled segment.
///
/// Entries are appended front to back, each prefixed by an 8-byte header
/// holding its length. The segment returns to its pool when dropped.
pub struct Segment {
    pool: Arc<PoolInner>,
    base: NonNull<u8>,
    index: u32,
    generation: u32,
    used: usize,
    entries: usize,
}

// SAFETY: the segment memory is owned by the pool arena and outlives every
// Segment (each holds an Arc to the pool). Only the owner of a Segment writes
// to unpublished ranges.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub const CAPACITY: usize = SEGMENT_SIZE;

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_space(&self) -> usize {
        SEGMENT_SIZE - self.used
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether an entry of `size` payload bytes fits in the remaining space.
    pub fn fits(&self, size: usize) -> bool {
        self.used + ENTRY_HEADER_SIZE + align_entry(size) <= SEGMENT_SIZE
    }

    pub fn contains(&self, ptr: EntryPtr) -> bool {
        !ptr.is_null()
            && ptr.segment_index() == self.index
            && ptr.generation() == self.generation
            && ptr.offset() < self.used
    }

    pub(crate) fn reserve(&mut self, size: usize) -> EntryMut<'_> {
        assert!(
            self.fits(size),
            "entry of {} bytes does not fit in segment with {} bytes free",
            size,
            self.free_space()
        );

        let header_offset = self.used;
        let offset = header_offset + ENTRY_HEADER_SIZE;

        // SAFETY: [header_offset, offset + size) lies inside the segment
        // (fits() above) and past every entry handed out so far, so nothing
        // else references it. header_offset is 8-aligned.
        let data = unsafe {
            let header = self.base.as_ptr().add(header_offset);
            header.cast::<u32>().write(size as u32);
            header.add(4).cast::<u32>().write(0);
            NonNull::new_unchecked(self.base.as_ptr().add(offset))
        };

        self.used = offset + align_entry(size);
        self.entries += 1;

        EntryMut::new(EntryPtr::new(self.index, self.generation, offset), data, size)
    }

    pub fn entry(&self, ptr: EntryPtr) -> Option<Entry<'_>> {
        if !self.contains(ptr) || ptr.offset() < ENTRY_HEADER_SIZE {
            return None;
        }
        let offset = ptr.offset();
        // SAFETY: offset names an entry of this segment (contains() above)
        let (data, len) = unsafe { self.entry_parts(offset) };
        Some(Entry::new(ptr, data, len))
    }

    pub(crate) fn entry_mut(&mut self, ptr: EntryPtr) -> Option<EntryMut<'_>> {
        if !self.contains(ptr) || ptr.offset() < ENTRY_HEADER_SIZE {
            return None;
        }
        // SAFETY: as in entry(); &mut self guarantees exclusive access
        let (data, len) = unsafe { self.entry_parts(ptr.offset()) };
        Some(EntryMut::new(ptr, data, len))
    }

    pub fn entries(&self) -> SegmentEntries<'_> {
        SegmentEntries {
            segment: self,
            cursor: 0,
        }
    }

    /// # Safety
    /// `offset` must be the payload offset of an entry written by `reserve`.
    unsafe fn entry_parts(&self, offset: usize) -> (NonNull<u8>, usize) {
        let len = self
            .base
            .as_ptr()
            .add(offset - ENTRY_HEADER_SIZE)
            .cast::<u32>()
            .read() as usize;
        (NonNull::new_unchecked(self.base.as_ptr().add(offset)), len)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("used", &self.used)
            .field("entries", &self.entries)
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let pool = &*self.pool;
        let slot = &pool.slots[self.index as usize];
        slot.generation
            .store(next_generation(self.generation), Ordering::Release);
        pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        pool.free[self.index as usize % POOL_SHARD_COUNT]
            .lock()
            .push(self.index);

        trace!(index = self.index, entries = self.entries, "segment released");

        if matches!(pool.config.exhaustion, ExhaustionPolicy::Block { .. }) {
            let _guard = pool.release_lock.lock();
            pool.released.notify_one();
        }
    }
}

/// Forward iterator over the entries of one segment.
pub struct SegmentEntries<'a> {
    segment: &'a Segment,
    cursor: usize,
}

impl<'a> Iterator for SegmentEntries<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.segment.used {
            return None;
        }
        let offset = self.cursor + ENTRY_HEADER_SIZE;
        // SAFETY: cursor walks entry boundaries written by reserve()
        let (data, len) = unsafe { self.segment.entry_parts(offset) };
        self.cursor = offset + align_entry(len);

        let ptr = EntryPtr::new(self.segment.index, self.segment.generation, offset);
        Some(Entry::new(ptr, data, len))
    }
}

/// Read access to a published entry.
///
/// Undo records keep atomics inside their entry, so the crate never builds a
/// byte slice over an undo entry; typed views read such entries field by
/// field instead. All other entries (redo and log records, raw buffers) are
/// written by a single owner and can be viewed as bytes.
///
/// An entry borrowed from a [`Segment`] cannot outlive it. An entry resolved
/// through the pool only borrows the pool, so it tracks its slot's generation
/// and [`Entry::is_live`] reports whether the segment is still held.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    ptr: EntryPtr,
    data: NonNull<u8>,
    len: usize,
    generation: Option<&'a AtomicU32>,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> Entry<'a> {
    fn new(ptr: EntryPtr, data: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            data,
            len,
            generation: None,
            _marker: PhantomData,
        }
    }

    fn tracking(mut self, generation: &'a AtomicU32) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Whether the segment holding this entry has not been released since
    /// the entry was obtained.
    pub fn is_live(&self) -> bool {
        self.generation
            .map_or(true, |g| g.load(Ordering::Acquire) == self.ptr.generation())
    }

    pub fn ptr(&self) -> EntryPtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &'a [u8] {
        // SAFETY: data..data+len is a published entry that nobody mutates
        // non-atomically; see the type-level docs for undo entries.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }
}

impl std::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Exclusive, zero-copy write access to a freshly reserved entry.
pub struct EntryMut<'a> {
    ptr: EntryPtr,
    data: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> EntryMut<'a> {
    fn new(ptr: EntryPtr, data: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            data,
            len,
            _marker: PhantomData,
        }
    }

    pub fn ptr(&self) -> EntryPtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the range is exclusively ours until the entry is frozen
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the range is exclusively ours until the entry is frozen
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    pub fn into_bytes(self) -> &'a mut [u8] {
        // SAFETY: consumes the exclusive handle, the slice inherits its lifetime
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// Give up exclusive access; the entry becomes readable by anyone
    /// holding its handle.
    pub fn freeze(self) -> Entry<'a> {
        Entry::new(self.ptr, self.data, self.len)
    }
}

impl std::fmt::Debug for EntryMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryMut")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_ENTRY_SIZE;

    #[test]
    fn test_entry_ptr_encoding_roundtrip() {
        let ptr = EntryPtr::new(0x00AB_CDEF, 0x0012_3456, 4088);
        assert_eq!(ptr.segment_index(), 0x00AB_CDEF);
        assert_eq!(ptr.generation(), 0x0012_3456);
        assert_eq!(ptr.offset(), 4088);
        assert!(!ptr.is_null());
        assert_eq!(EntryPtr::from_raw(ptr.raw()), ptr);
    }

    #[test]
    fn test_null_ptr_is_default() {
        assert!(EntryPtr::default().is_null());
        assert!(EntryPtr::NULL.is_null());
        assert_eq!(format!("{:?}", EntryPtr::NULL), "EntryPtr(null)");
    }

    #[test]
    fn test_generation_skips_zero_on_wrap() {
        assert_eq!(next_generation(1), 2);
        assert_eq!(next_generation(GENERATION_MASK), 1);
    }

    #[test]
    fn test_pool_acquire_and_release() {
        let pool = SegmentPool::with_limit(4);
        assert_eq!(pool.stats().outstanding, 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.stats().outstanding, 2);
        assert_eq!(pool.stats().created, 2);

        pool.release(a);
        assert_eq!(pool.stats().outstanding, 1);
        assert_eq!(pool.stats().reusable, 1);

        drop(b);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.stats().reusable, 2);
    }

    #[test]
    fn test_released_segment_is_reused_before_creating_new_ones() {
        let pool = SegmentPool::with_limit(8);
        let first = pool.acquire().unwrap();
        let index = first.index();
        drop(first);

        let again = pool.acquire().unwrap();
        assert_eq!(again.index(), index);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_fail_policy_reports_pool_exhausted() {
        let pool = SegmentPool::with_limit(2);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();

        let err = pool.acquire().unwrap_err();
        let exhausted = err.downcast_ref::<PoolExhausted>().unwrap();
        assert_eq!(exhausted.size_limit, 2);
        assert_eq!(exhausted.outstanding, 2);
        assert!(exhausted.waited.is_none());
    }

    #[test]
    fn test_block_policy_times_out() {
        let pool = SegmentPool::new(
            PoolConfig::new()
                .size_limit(1)
                .block_when_exhausted(Some(Duration::from_millis(20))),
        );
        let _held = pool.acquire().unwrap();

        let err = pool.acquire().unwrap_err();
        let exhausted = err.downcast_ref::<PoolExhausted>().unwrap();
        assert!(exhausted.waited.is_some());
    }

    #[test]
    fn test_block_policy_wakes_on_release() {
        let pool = SegmentPool::new(PoolConfig::new().size_limit(1).block_when_exhausted(None));
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|s| s.index()))
        };

        std::thread::sleep(Duration::from_millis(20));
        let index = held.index();
        drop(held);

        assert_eq!(waiter.join().unwrap().unwrap(), index);
    }

    #[test]
    fn test_reserve_writes_contiguous_aligned_entries() {
        let pool = SegmentPool::with_limit(1);
        let mut segment = pool.acquire().unwrap();

        let first = segment.reserve(5).ptr();
        let second = segment.reserve(16).ptr();

        assert_eq!(first.offset(), ENTRY_HEADER_SIZE);
        assert_eq!(second.offset(), ENTRY_HEADER_SIZE + 8 + ENTRY_HEADER_SIZE);
        assert_eq!(segment.entry_count(), 2);
        assert_eq!(segment.used(), 2 * ENTRY_HEADER_SIZE + 8 + 16);
    }

    #[test]
    fn test_entries_iterate_in_write_order() {
        let pool = SegmentPool::with_limit(1);
        let mut segment = pool.acquire().unwrap();

        for i in 0..4u8 {
            let mut entry = segment.reserve(3);
            entry.bytes_mut().copy_from_slice(&[i, i, i]);
        }

        let seen: Vec<u8> = segment.entries().map(|e| e.bytes()[0]).collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fits_accounts_for_header_and_alignment() {
        let pool = SegmentPool::with_limit(1);
        let mut segment = pool.acquire().unwrap();
        assert!(segment.fits(MAX_ENTRY_SIZE));
        assert!(!segment.fits(MAX_ENTRY_SIZE + 1));

        segment.reserve(1);
        assert!(!segment.fits(MAX_ENTRY_SIZE - 8));
        assert!(segment.fits(MAX_ENTRY_SIZE - 16));
    }

    #[test]
    fn test_resolve_detects_released_segments() {
        let pool = SegmentPool::with_limit(1);
        let mut segment = pool.acquire().unwrap();
        let ptr = {
            let mut entry = segment.reserve(4);
            entry.bytes_mut().copy_from_slice(&[9, 8, 7, 6]);
            entry.ptr()
        };

        assert_eq!(pool.resolve(ptr).unwrap().bytes(), &[9, 8, 7, 6]);

        drop(segment);
        assert!(pool.resolve(ptr).is_none());

        let reused = pool.acquire().unwrap();
        assert_eq!(reused.index(), ptr.segment_index());
        assert_ne!(reused.generation(), ptr.generation());
        assert!(pool.resolve(ptr).is_none());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_limit() {
        let pool = SegmentPool::with_limit(32);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
                        assert!(pool.stats().outstanding <= 32);
                        drop(held);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert!(stats.created <= 32);
    }
}
