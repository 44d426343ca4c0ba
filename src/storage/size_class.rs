//! Size classes of free ranges

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition of free ranges by length
///
/// Ranges shorter than the fragment limit are fragments, everything else
/// is large. Allocation always tries the large class first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeClass {
    Fragment,
    Large,
}

impl SizeClass {
    /// Classes in allocation order
    pub const ALLOCATION_ORDER: [SizeClass; 2] = [SizeClass::Large, SizeClass::Fragment];

    /// Class of a range of `len` bytes under `fragment_limit`
    pub fn of(len: usize, fragment_limit: usize) -> Self {
        if len < fragment_limit {
            SizeClass::Fragment
        } else {
            SizeClass::Large
        }
    }

    /// The other class
    pub fn other(self) -> Self {
        match self {
            SizeClass::Fragment => SizeClass::Large,
            SizeClass::Large => SizeClass::Fragment,
        }
    }

    /// Slot of this class in per-buffer chain arrays
    pub fn index(self) -> usize {
        match self {
            SizeClass::Fragment => 0,
            SizeClass::Large => 1,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeClass::Fragment => write!(f, "Fragment"),
            SizeClass::Large => write!(f, "Large"),
        }
    }
}
