//! # Transaction Core Configuration Constants
//!
//! This module centralizes the numeric constants of the transaction core,
//! grouping interdependent values together and documenting their
//! relationships. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SEGMENT_SIZE (4096 bytes)
//!       │
//!       ├─> ENTRY_HEADER_SIZE (8 bytes, prefixed to every entry)
//!       │
//!       ├─> MAX_ENTRY_SIZE (derived: SEGMENT_SIZE - ENTRY_HEADER_SIZE)
//!       │     Largest request new_entry() accepts. Anything larger is a
//!       │     precondition violation because entries never straddle segments.
//!       │
//!       └─> PTR_OFFSET_BITS (16)
//!             Entry handles encode the in-segment offset in 16 bits, so
//!             SEGMENT_SIZE must not exceed 64KB.
//!
//! DEFAULT_SEGMENT_LIMIT (16384 segments = 64MB)
//!       │
//!       └─> PTR_INDEX_BITS (24)
//!             The segment index of a handle must fit, so the pool can never
//!             hand out more than 2^24 distinct segments.
//!
//! UNCOMMITTED_BASE (1 << 63)
//!       │
//!       └─> Every committed timestamp is below it, every in-flight
//!           transaction id is at or above it.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions:
//!
//! 1. `SEGMENT_SIZE <= 1 << PTR_OFFSET_BITS` (offsets fit in a handle)
//! 2. `DEFAULT_SEGMENT_LIMIT <= 1 << PTR_INDEX_BITS` (indices fit in a handle)
//! 3. `SEGMENT_SIZE` and `ENTRY_ALIGN` agree on alignment
//! 4. `PTR_INDEX_BITS + PTR_GENERATION_BITS + PTR_OFFSET_BITS == 64`

// ============================================================================
// SEGMENT LAYOUT
// These define the unit of allocation shared by undo and redo buffers
// ============================================================================

/// Size of every pooled segment in bytes (4KB).
pub const SEGMENT_SIZE: usize = 1 << 12;

/// Alignment of every entry inside a segment.
/// Undo records keep atomics at 8-byte offsets, so entries start 8-aligned.
pub const ENTRY_ALIGN: usize = 8;

/// Size of the per-entry header: `[len:u32][reserved:u32]`.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Largest payload a single entry may request.
pub const MAX_ENTRY_SIZE: usize = SEGMENT_SIZE - ENTRY_HEADER_SIZE;

const _: () = assert!(
    SEGMENT_SIZE % ENTRY_ALIGN == 0,
    "SEGMENT_SIZE must be a multiple of ENTRY_ALIGN"
);

const _: () = assert!(
    ENTRY_HEADER_SIZE % ENTRY_ALIGN == 0,
    "ENTRY_HEADER_SIZE must keep entry payloads aligned"
);

const _: () = assert!(
    MAX_ENTRY_SIZE == SEGMENT_SIZE - ENTRY_HEADER_SIZE,
    "MAX_ENTRY_SIZE derivation mismatch"
);

// ============================================================================
// ENTRY HANDLE ENCODING
// (index << 40) | (generation << 16) | offset
// ============================================================================

/// Bits of a handle holding the segment index.
pub const PTR_INDEX_BITS: u32 = 24;

/// Bits of a handle holding the segment generation.
pub const PTR_GENERATION_BITS: u32 = 24;

/// Bits of a handle holding the offset within the segment.
pub const PTR_OFFSET_BITS: u32 = 16;

/// Largest number of distinct segments a pool can ever create.
pub const MAX_SEGMENT_LIMIT: usize = 1 << PTR_INDEX_BITS;

const _: () = assert!(
    PTR_INDEX_BITS + PTR_GENERATION_BITS + PTR_OFFSET_BITS == 64,
    "entry handle fields must fill exactly 64 bits"
);

const _: () = assert!(
    SEGMENT_SIZE <= 1 << PTR_OFFSET_BITS,
    "SEGMENT_SIZE must be addressable by PTR_OFFSET_BITS"
);

// ============================================================================
// SEGMENT POOL CONFIGURATION
// ============================================================================

/// Default upper bound on live segments (64MB with 4KB segments).
pub const DEFAULT_SEGMENT_LIMIT: usize = 16 * 1024;

/// Number of free-list shards in the segment pool.
/// Higher values reduce contention between transactions, GC and the log flusher.
pub const POOL_SHARD_COUNT: usize = 16;

const _: () = assert!(
    DEFAULT_SEGMENT_LIMIT <= MAX_SEGMENT_LIMIT,
    "DEFAULT_SEGMENT_LIMIT must fit in PTR_INDEX_BITS"
);

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// First uncommitted transaction id. Committed timestamps are always below.
pub const UNCOMMITTED_BASE: u64 = 1 << 63;

/// First timestamp handed out by a fresh transaction manager.
pub const INITIAL_TIMESTAMP: u64 = 1;

// ============================================================================
// CONCURRENCY LIMITS
// ============================================================================

/// Maximum number of concurrent transactions tracked by the manager.
pub const MAX_CONCURRENT_TXNS: usize = 64;

// ============================================================================
// LOG FRAMES
// ============================================================================

/// Size of a serialized log frame header: `[len:u32][crc64:u64]`.
pub const LOG_FRAME_HEADER_SIZE: usize = 12;

// ============================================================================
// RECORD LAYOUT
// Undo and redo records share the same fixed header size so that any row
// projection that fits one fits the other.
// ============================================================================

/// Fixed header size of undo and redo records, before the projected row.
pub const RECORD_HEADER_SIZE: usize = 32;

/// Largest projected row a record can carry.
pub const MAX_PROJECTED_ROW_SIZE: usize = MAX_ENTRY_SIZE - RECORD_HEADER_SIZE;

const _: () = assert!(
    RECORD_HEADER_SIZE % ENTRY_ALIGN == 0,
    "projected rows after the record header must stay aligned"
);
