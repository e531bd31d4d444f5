//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Getter and setter pairs for `#[repr(C)]` zerocopy structs whose fields
//! are little-endian wrappers (U16, U32, U64):
//!
//! ```ignore
//! #[repr(C)]
//! struct PageHeader {
//!     page_type: u8,
//!     flags: u8,
//!     lower: U16,
//!     next: U32,
//! }
//!
//! impl PageHeader {
//!     zerocopy_accessors! {
//!         lower: u16,
//!         next: u32,
//!     }
//! }
//!
//! // header.lower(), header.set_lower(8), header.next(), header.set_next(3)
//! ```
//!
//! ## zerocopy_getters!
//!
//! Getters only, for records that are built once and then read.

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
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

/// Generates only getter methods for zerocopy little-endian fields (read-only).
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
