//! Opaque handles to stored blobs

use super::range::FreeRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Capability returned by `store`
///
/// Identity is `(slot, generation)`. The location fields are a snapshot
/// taken when the handle was issued; compaction may move the bytes, so the
/// cache always resolves the current location from its slot table.
/// An empty payload binds a slot without occupying any buffer bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Handle {
    pub(crate) slot: u32,
    pub(crate) generation: u64,
    pub(crate) buffer: u32,
    pub(crate) start: usize,
    pub(crate) len: usize,
}

impl Handle {
    pub(crate) fn new(slot: u32, generation: u64, range: FreeRange) -> Self {
        Self {
            slot,
            generation,
            buffer: range.buffer,
            start: range.start,
            len: range.len(),
        }
    }

    /// Binding for a zero-length payload
    pub(crate) fn empty(slot: u32, generation: u64) -> Self {
        Self {
            slot,
            generation,
            buffer: 0,
            start: 0,
            len: 0,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffer(&self) -> u32 {
        self.buffer
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte range this handle occupied when last resolved, `None` when empty
    pub fn range(&self) -> Option<FreeRange> {
        (!self.is_empty()).then(|| FreeRange::with_len(self.buffer, self.start, self.len))
    }

    /// Check that `other` names the same binding
    pub fn same_binding(&self, other: &Handle) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.same_binding(other)
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(slot={}, gen={})", self.slot, self.generation)
    }
}
