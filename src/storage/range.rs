//! Free byte ranges inside a buffer

use crate::index::Comparator;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Unused contiguous span `[start, end)` of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeRange {
    /// Buffer the range belongs to
    pub buffer: u32,
    /// First byte (inclusive)
    pub start: usize,
    /// Last byte (exclusive)
    pub end: usize,
}

impl FreeRange {
    /// Create a new range; callers guarantee `start < end`
    pub fn new(buffer: u32, start: usize, end: usize) -> Self {
        debug_assert!(start < end, "empty free range {}..{}", start, end);
        Self { buffer, start, end }
    }

    /// Range of `len` bytes starting at `start`
    pub fn with_len(buffer: u32, start: usize, len: usize) -> Self {
        Self::new(buffer, start, start + len)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if `other` starts exactly where `self` ends
    pub fn precedes(&self, other: &FreeRange) -> bool {
        self.buffer == other.buffer && self.end == other.start
    }

    /// Split off the first `len` bytes
    ///
    /// Returns the served prefix and the remainder, if any.
    pub fn split_at(&self, len: usize) -> (FreeRange, Option<FreeRange>) {
        if len >= self.len() {
            return (*self, None);
        }
        let head = FreeRange::new(self.buffer, self.start, self.start + len);
        let tail = FreeRange::new(self.buffer, self.start + len, self.end);
        (head, Some(tail))
    }

    /// Union of two address-contiguous ranges
    pub fn merge(&self, other: &FreeRange) -> FreeRange {
        FreeRange::new(
            self.buffer,
            self.start.min(other.start),
            self.end.max(other.end),
        )
    }

    /// Check if the two ranges share at least one byte
    pub fn overlaps(&self, other: &FreeRange) -> bool {
        self.buffer == other.buffer && self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for FreeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}[{}..{})", self.buffer, self.start, self.end)
    }
}

/// Address-major order: `(start, len)` ascending, buffer as tie-breaker
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressOrder;

impl Comparator<FreeRange> for AddressOrder {
    fn compare(&self, a: &FreeRange, b: &FreeRange) -> Ordering {
        a.start
            .cmp(&b.start)
            .then_with(|| a.len().cmp(&b.len()))
            .then_with(|| a.buffer.cmp(&b.buffer))
    }
}
