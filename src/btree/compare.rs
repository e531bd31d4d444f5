//! # Key and Value Comparators
//!
//! Every tree is ordered by a [`Comparator`] chosen when its database is
//! opened. The tree code treats it as an opaque total order and never
//! assumes byte-lexicographic ordering; in particular no prefix tricks are
//! applied to separator keys.
//!
//! Built-in orders:
//!
//! | Comparator       | Order                                                      |
//! |------------------|------------------------------------------------------------|
//! | `Lexicographic`  | unsigned byte-wise, shorter prefix first (default)         |
//! | `ReverseBytes`   | byte-wise comparing from the last byte backwards           |
//! | `NativeInteger`  | 4- or 8-byte native-endian unsigned integers                |
//!
//! Custom orders implement the trait; their `name` identifies them when a
//! database is reopened, so two handles on one database cannot silently
//! disagree about ordering.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Stable identifier used to detect mismatched configurations.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn Comparator + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comparator({})", self.name())
    }
}

pub type SharedComparator = Arc<dyn Comparator>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Lexicographic;

impl Comparator for Lexicographic {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "lexicographic"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseBytes;

impl Comparator for ReverseBytes {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.iter().rev().cmp(b.iter().rev())
    }

    fn name(&self) -> &str {
        "reverse-bytes"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeInteger;

impl NativeInteger {
    fn decode(bytes: &[u8]) -> Option<u64> {
        match bytes.len() {
            4 => Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Some(u64::from_ne_bytes(buf))
            }
            _ => None,
        }
    }
}

impl Comparator for NativeInteger {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::decode(a), Self::decode(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        }
    }

    fn name(&self) -> &str {
        "native-integer"
    }
}

/// Adapts a plain function into a named comparator.
pub struct FnComparator {
    name: String,
    func: fn(&[u8], &[u8]) -> Ordering,
}

impl FnComparator {
    pub fn new(name: impl Into<String>, func: fn(&[u8], &[u8]) -> Ordering) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl Comparator for FnComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.func)(a, b)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn lexicographic() -> SharedComparator {
    Arc::new(Lexicographic)
}
