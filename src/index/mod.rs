//! Ordered indexed list
//!
//! An ordered multiset kept as a doubly-linked base chain with a sparse
//! chain of markers layered on top. Each marker points at one base entry
//! and caches its span: the number of base entries from that marker up to
//! the next one.
//!
//! # Architecture
//!
//! ```text
//! base:    HEAD ─→ [3] ─→ [5] ─→ [5] ─→ [8] ─→ [13] ─→ [21] ─→ HEAD
//!                   ▲                    ▲
//! markers: HEAD ─→ M0(span=3)  ─────→   M1(span=3) ─→ HEAD
//! ```
//!
//! Searches walk the marker chain first, then scan at most one marker
//! region of the base chain. Both chains live in index-addressed arenas,
//! so there are no ownership cycles.

pub mod comparator;
pub mod list;

pub use comparator::{Comparator, NaturalOrder};
pub use list::{OrderedIndexedList, MAX_INDEX_RANGE, MIN_INDEX_RANGE};
