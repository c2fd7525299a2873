//! # Projected Rows
//!
//! A projected row is a self-describing, partial tuple: a subset of a
//! table's columns with their values and null flags, laid out contiguously
//! so it can live inside an undo or redo record and be copied with one
//! `memcpy`.
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! Offset  Size        Field
//! 0       4           size         total bytes of the row
//! 4       2           num_cols     n
//! 6       2           reserved
//! 8       2n          column ids
//! A       4n          value offsets (from row start), A = align4(8 + 2n)
//! A+4n    n           attribute sizes (1, 2, 4 or 8)
//! A+5n    ceil(n/8)   presence bitmap (bit set = not null)
//! V       ...         values, each aligned to its own size, V = align8(...)
//! ```
//!
//! The metadata prefix (everything before `V`) depends only on the column
//! list, so a before-image for an update is created by copying the prefix of
//! the new values and filling the values from the current tuple.

use crate::config::MAX_PROJECTED_ROW_SIZE;
use eyre::{ensure, Result};
use smallvec::SmallVec;

pub type ColumnId = u16;

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct MetadataLayout {
    offsets_at: usize,
    sizes_at: usize,
    bitmap_at: usize,
    values_at: usize,
}

impl MetadataLayout {
    fn for_columns(n: usize) -> Self {
        let offsets_at = align_up(8 + 2 * n, 4);
        let sizes_at = offsets_at + 4 * n;
        let bitmap_at = sizes_at + n;
        let values_at = align_up(bitmap_at + n.div_ceil(8), 8);
        Self {
            offsets_at,
            sizes_at,
            bitmap_at,
            values_at,
        }
    }
}

#[inline]
fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Fixed attribute sizes of a table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    attr_sizes: SmallVec<[u8; 16]>,
}

impl BlockLayout {
    pub fn new(attr_sizes: &[u8]) -> Result<Self> {
        ensure!(!attr_sizes.is_empty(), "a table needs at least one column");
        ensure!(
            attr_sizes.len() <= ColumnId::MAX as usize,
            "too many columns: {}",
            attr_sizes.len()
        );
        for (col, size) in attr_sizes.iter().enumerate() {
            ensure!(
                matches!(size, 1 | 2 | 4 | 8),
                "column {} has unsupported attribute size {}",
                col,
                size
            );
        }
        Ok(Self {
            attr_sizes: SmallVec::from_slice(attr_sizes),
        })
    }

    pub fn num_columns(&self) -> usize {
        self.attr_sizes.len()
    }

    pub fn attr_size(&self, col: ColumnId) -> usize {
        self.attr_sizes[col as usize] as usize
    }

    pub fn all_columns(&self) -> SmallVec<[ColumnId; 16]> {
        (0..self.attr_sizes.len() as ColumnId).collect()
    }
}

/// Precomputed shape of a projected row over a fixed column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRowInitializer {
    col_ids: SmallVec<[ColumnId; 16]>,
    attr_sizes: SmallVec<[u8; 16]>,
    value_offsets: SmallVec<[u32; 16]>,
    size: usize,
}

impl ProjectedRowInitializer {
    pub fn new(layout: &BlockLayout, col_ids: &[ColumnId]) -> Result<Self> {
        ensure!(!col_ids.is_empty(), "projection needs at least one column");

        let mut attr_sizes = SmallVec::new();
        for (i, col) in col_ids.iter().enumerate() {
            ensure!(
                (*col as usize) < layout.num_columns(),
                "column {} out of range for a {}-column layout",
                col,
                layout.num_columns()
            );
            ensure!(!col_ids[..i].contains(col), "column {} projected twice", col);
            attr_sizes.push(layout.attr_size(*col) as u8);
        }

        let meta = MetadataLayout::for_columns(col_ids.len());
        let mut value_offsets = SmallVec::new();
        let mut cursor = meta.values_at;
        for size in &attr_sizes {
            let size = *size as usize;
            cursor = align_up(cursor, size);
            value_offsets.push(cursor as u32);
            cursor += size;
        }
        let size = align_up(cursor, 8);
        ensure!(
            size <= MAX_PROJECTED_ROW_SIZE,
            "projected row of {} bytes exceeds the record limit of {}",
            size,
            MAX_PROJECTED_ROW_SIZE
        );

        Ok(Self {
            col_ids: SmallVec::from_slice(col_ids),
            attr_sizes,
            value_offsets,
            size,
        })
    }

    pub fn projected_row_size(&self) -> usize {
        self.size
    }

    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    pub fn column_ids(&self) -> &[ColumnId] {
        &self.col_ids
    }

    /// Lay out an all-null row in `bytes`.
    pub fn initialize<'a>(&self, bytes: &'a mut [u8]) -> ProjectedRowMut<'a> {
        assert!(
            bytes.len() >= self.size,
            "buffer of {} bytes too small for a {}-byte projected row",
            bytes.len(),
            self.size
        );
        let bytes = &mut bytes[..self.size];
        let n = self.col_ids.len();
        let meta = MetadataLayout::for_columns(n);

        bytes.fill(0);
        bytes[0..4].copy_from_slice(&(self.size as u32).to_le_bytes());
        bytes[4..6].copy_from_slice(&(n as u16).to_le_bytes());
        for (i, col) in self.col_ids.iter().enumerate() {
            bytes[8 + 2 * i..10 + 2 * i].copy_from_slice(&col.to_le_bytes());
        }
        for (i, offset) in self.value_offsets.iter().enumerate() {
            let at = meta.offsets_at + 4 * i;
            bytes[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        }
        bytes[meta.sizes_at..meta.sizes_at + n].copy_from_slice(&self.attr_sizes);

        ProjectedRowMut { bytes }
    }
}

/// Read-only view of a projected row.
#[derive(Clone, Copy)]
pub struct ProjectedRow<'a> {
    bytes: &'a [u8],
}

impl<'a> ProjectedRow<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self> {
        ensure!(bytes.len() >= 8, "projected row truncated: {} bytes", bytes.len());
        let size = read_u32(bytes, 0) as usize;
        let n = read_u16(bytes, 4) as usize;
        ensure!(
            size <= bytes.len(),
            "projected row claims {} bytes but only {} available",
            size,
            bytes.len()
        );
        ensure!(
            MetadataLayout::for_columns(n).values_at <= size,
            "projected row of {} bytes too small for {} columns",
            size,
            n
        );
        let row = Self {
            bytes: &bytes[..size],
        };
        for i in 0..n {
            let end = row.value_offset(i) + row.attr_size(i);
            ensure!(end <= size, "column {} value overruns the projected row", i);
        }
        Ok(row)
    }

    /// View bytes the crate itself laid out.
    pub(crate) fn view(bytes: &'a [u8]) -> Self {
        let size = read_u32(bytes, 0) as usize;
        debug_assert!(size <= bytes.len());
        Self {
            bytes: &bytes[..size],
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn num_columns(&self) -> usize {
        read_u16(self.bytes, 4) as usize
    }

    pub fn column_id(&self, i: usize) -> ColumnId {
        read_u16(self.bytes, 8 + 2 * i)
    }

    pub fn column_ids(&self) -> impl Iterator<Item = ColumnId> + 'a {
        let row = *self;
        (0..row.num_columns()).map(move |i| row.column_id(i))
    }

    pub fn attr_size(&self, i: usize) -> usize {
        let meta = MetadataLayout::for_columns(self.num_columns());
        self.bytes[meta.sizes_at + i] as usize
    }

    fn value_offset(&self, i: usize) -> usize {
        let meta = MetadataLayout::for_columns(self.num_columns());
        read_u32(self.bytes, meta.offsets_at + 4 * i) as usize
    }

    pub fn is_null(&self, i: usize) -> bool {
        let meta = MetadataLayout::for_columns(self.num_columns());
        self.bytes[meta.bitmap_at + i / 8] & (1 << (i % 8)) == 0
    }

    pub fn value(&self, i: usize) -> Option<&'a [u8]> {
        if self.is_null(i) {
            return None;
        }
        let offset = self.value_offset(i);
        Some(&self.bytes[offset..offset + self.attr_size(i)])
    }

    /// Index of `col` within this projection.
    pub fn find(&self, col: ColumnId) -> Option<usize> {
        (0..self.num_columns()).find(|i| self.column_id(*i) == col)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Copy this row's column list into `dst` with every value null.
    pub fn copy_layout_into<'b>(&self, dst: &'b mut [u8]) -> ProjectedRowMut<'b> {
        let size = self.size();
        assert!(dst.len() >= size, "buffer too small for projected row layout");
        let dst = &mut dst[..size];
        let meta = MetadataLayout::for_columns(self.num_columns());

        dst[..meta.bitmap_at].copy_from_slice(&self.bytes[..meta.bitmap_at]);
        dst[meta.bitmap_at..].fill(0);
        ProjectedRowMut { bytes: dst }
    }
}

impl std::fmt::Debug for ProjectedRow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        for i in 0..self.num_columns() {
            list.entry(&self.column_id(i), &self.value(i));
        }
        list.finish()
    }
}

/// Mutable view of a projected row.
pub struct ProjectedRowMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ProjectedRowMut<'a> {
    pub(crate) fn view(bytes: &'a mut [u8]) -> Self {
        let size = read_u32(bytes, 0) as usize;
        debug_assert!(size <= bytes.len());
        Self {
            bytes: &mut bytes[..size],
        }
    }

    pub fn as_row(&self) -> ProjectedRow<'_> {
        ProjectedRow { bytes: self.bytes }
    }

    pub fn num_columns(&self) -> usize {
        self.as_row().num_columns()
    }

    pub fn column_id(&self, i: usize) -> ColumnId {
        self.as_row().column_id(i)
    }

    pub fn find(&self, col: ColumnId) -> Option<usize> {
        self.as_row().find(col)
    }

    pub fn set_value(&mut self, i: usize, value: &[u8]) {
        let row = self.as_row();
        let size = row.attr_size(i);
        assert_eq!(
            value.len(),
            size,
            "column {} holds {}-byte values",
            row.column_id(i),
            size
        );
        let offset = row.value_offset(i);
        self.bytes[offset..offset + size].copy_from_slice(value);
        self.set_present(i, true);
    }

    pub fn set_null(&mut self, i: usize) {
        self.set_present(i, false);
    }

    /// Copy column `j` of `src` (value or null) into column `i`.
    pub fn copy_column_from(&mut self, i: usize, src: &ProjectedRow<'_>, j: usize) {
        match src.value(j) {
            Some(value) => self.set_value(i, value),
            None => self.set_null(i),
        }
    }

    fn set_present(&mut self, i: usize, present: bool) {
        let meta = MetadataLayout::for_columns(self.num_columns());
        let byte = &mut self.bytes[meta.bitmap_at + i / 8];
        if present {
            *byte |= 1 << (i % 8);
        } else {
            *byte &= !(1 << (i % 8));
        }
    }
}

impl std::fmt::Debug for ProjectedRowMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_row().fmt(f)
    }
}
