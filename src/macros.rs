//! # Internal Macros
//!
//! Boilerplate reducers for the on-log record headers.
//!
//! ## zerocopy_accessors!
//!
//! Log record headers are `#[repr(C)]` zerocopy structs whose integer fields
//! use little-endian wrappers so a log written on one machine decodes on any
//! other. This macro generates a native-typed getter and setter per field.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct RedoHeader {
//!     table_id: U32,
//!     reserved: [u8; 4],
//!     slot: U64,
//! }
//!
//! impl RedoHeader {
//!     zerocopy_accessors! {
//!         table_id: u32,
//!         slot: u64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn table_id(&self) -> u32 { self.table_id.get() }
//! // pub fn set_table_id(&mut self, val: u32) { self.table_id = U32::new(val); }
//! // pub fn slot(&self) -> u64 { self.slot.get() }
//! // pub fn set_slot(&mut self, val: u64) { self.slot = U64::new(val); }
//! ```
//!
//! ## zerocopy_getters!
//!
//! Read-only variant for headers that are only ever decoded in place, such as
//! log frame headers read back from disk.

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
