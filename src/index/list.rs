//! Ordered multiset with a skip index over a linked base chain

use super::comparator::Comparator;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fmt;

/// Smallest accepted target span between markers
pub const MIN_INDEX_RANGE: usize = 100;
/// Largest accepted target span between markers
pub const MAX_INDEX_RANGE: usize = 10_000;

/// Slot 0 of both arenas is the sentinel of its cyclic chain.
const HEAD: usize = 0;

#[derive(Debug)]
struct Entry<T> {
    value: Option<T>,
    next: usize,
    prev: usize,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    /// Base entry this marker starts at
    target: usize,
    /// Base entries from `target` up to the next marker's target
    span: usize,
    next: usize,
    prev: usize,
}

impl Marker {
    fn sentinel() -> Self {
        Self {
            target: HEAD,
            span: 0,
            next: HEAD,
            prev: HEAD,
        }
    }
}

/// Both arenas plus their recycling lists
struct Chains<T> {
    entries: Vec<Entry<T>>,
    markers: Vec<Marker>,
    free_entries: Vec<usize>,
    free_markers: Vec<usize>,
    len: usize,
}

impl<T> Chains<T> {
    fn new() -> Self {
        Self {
            entries: vec![Entry {
                value: None,
                next: HEAD,
                prev: HEAD,
            }],
            markers: vec![Marker::sentinel()],
            free_entries: Vec::new(),
            free_markers: Vec::new(),
            len: 0,
        }
    }

    fn value(&self, idx: usize) -> Option<&T> {
        self.entries[idx].value.as_ref()
    }

    /// Marker whose region covers `e`: the first marker whose successor
    /// references a value greater than `e`, else the last marker.
    /// Returns `HEAD` only when the index is empty.
    fn find_marker<C: Comparator<T>>(&self, cmp: &C, e: &T) -> usize {
        let mut m = self.markers[HEAD].next;
        while m != HEAD {
            let next = self.markers[m].next;
            if next == HEAD {
                return m;
            }
            if matches!(self.value(self.markers[next].target), Some(v) if cmp.compare(e, v) == Ordering::Less)
            {
                return m;
            }
            m = next;
        }
        HEAD
    }

    /// First entry in `[from, limit)` strictly greater than `e`, else `limit`.
    fn scan<C: Comparator<T>>(&self, cmp: &C, e: &T, from: usize, limit: usize) -> usize {
        let mut cur = from;
        while cur != limit {
            if matches!(self.value(cur), Some(v) if cmp.compare(e, v) == Ordering::Less) {
                return cur;
            }
            cur = self.entries[cur].next;
        }
        cur
    }

    /// Owning marker and first entry strictly greater than `e` (`HEAD` if none).
    fn locate<C: Comparator<T>>(&self, cmp: &C, e: &T) -> (usize, usize) {
        let m = self.find_marker(cmp, e);
        if m == HEAD {
            return (HEAD, HEAD);
        }
        let limit = self.markers[self.markers[m].next].target;
        (m, self.scan(cmp, e, self.markers[m].target, limit))
    }

    /// Owning marker and entry at position `i`
    fn locate_position(&self, i: usize) -> Option<(usize, usize)> {
        let mut base = 0;
        let mut m = self.markers[HEAD].next;
        while m != HEAD {
            if self.markers[m].span > i - base {
                break;
            }
            base += self.markers[m].span;
            m = self.markers[m].next;
        }
        if m == HEAD {
            return None;
        }

        let mut cur = self.markers[m].target;
        for _ in 0..(i - base) {
            cur = self.entries[cur].next;
        }
        Some((m, cur))
    }

    fn insert<C: Comparator<T>>(&mut self, cmp: &C, e: T, index_range: usize) {
        let m = self.find_marker(cmp, &e);

        if m == HEAD {
            let pos = self.scan(cmp, &e, self.entries[HEAD].next, HEAD);
            let entry = self.add_before(e, pos);
            let marker = self.alloc_marker(Marker {
                target: entry,
                span: 1,
                ..Marker::sentinel()
            });
            self.link_marker_after(HEAD, marker);
            return;
        }

        let target = self.markers[m].target;
        let limit = self.markers[self.markers[m].next].target;
        let pos = self.scan(cmp, &e, target, limit);
        let entry = self.add_before(e, pos);
        if pos == target {
            self.markers[m].target = entry;
        }

        self.markers[m].span += 1;
        if self.markers[m].span >= index_range << 1 {
            self.split(m, limit, index_range);
        }
    }

    /// Carves a new marker `index_range` entries before the region end.
    fn split(&mut self, m: usize, limit: usize, index_range: usize) {
        let mut p = limit;
        for _ in 0..index_range {
            p = self.entries[p].prev;
        }

        let marker = self.alloc_marker(Marker {
            target: p,
            span: index_range,
            ..Marker::sentinel()
        });
        self.link_marker_after(m, marker);
        self.markers[m].span -= index_range;
    }

    fn remove_entry(&mut self, x: usize, m: usize, index_range: usize) -> Option<T> {
        if self.markers[m].target == x {
            self.markers[m].target = self.entries[x].next;
        }

        let Entry { prev, next, .. } = self.entries[x];
        self.entries[prev].next = next;
        self.entries[next].prev = prev;
        let value = self.entries[x].value.take();
        self.entries[x].next = HEAD;
        self.entries[x].prev = HEAD;
        self.free_entries.push(x);

        self.markers[m].span = self.markers[m].span.saturating_sub(1);
        if self.markers[m].span <= index_range >> 2 {
            if m == self.markers[HEAD].next {
                let next_marker = self.markers[m].next;
                if next_marker != HEAD {
                    self.markers[m].span += self.markers[next_marker].span;
                    self.unlink_marker(next_marker);
                } else if self.markers[m].span == 0 {
                    self.unlink_marker(m);
                }
            } else {
                let prev_marker = self.markers[m].prev;
                self.markers[prev_marker].span += self.markers[m].span;
                self.unlink_marker(m);
            }
        }

        self.len -= 1;
        value
    }

    fn add_before(&mut self, value: T, pos: usize) -> usize {
        let prev = self.entries[pos].prev;
        let entry = Entry {
            value: Some(value),
            next: pos,
            prev,
        };
        let idx = match self.free_entries.pop() {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.entries[prev].next = idx;
        self.entries[pos].prev = idx;
        self.len += 1;
        idx
    }

    fn alloc_marker(&mut self, marker: Marker) -> usize {
        match self.free_markers.pop() {
            Some(idx) => {
                self.markers[idx] = marker;
                idx
            }
            None => {
                self.markers.push(marker);
                self.markers.len() - 1
            }
        }
    }

    fn link_marker_after(&mut self, at: usize, marker: usize) {
        let next = self.markers[at].next;
        self.markers[marker].prev = at;
        self.markers[marker].next = next;
        self.markers[at].next = marker;
        self.markers[next].prev = marker;
    }

    fn unlink_marker(&mut self, marker: usize) {
        let Marker { prev, next, .. } = self.markers[marker];
        self.markers[prev].next = next;
        self.markers[next].prev = prev;
        self.markers[marker] = Marker::sentinel();
        self.free_markers.push(marker);
    }

    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cur = self.entries[HEAD].next;
        std::iter::from_fn(move || {
            while cur != HEAD {
                let idx = cur;
                cur = self.entries[idx].next;
                if let Some(v) = self.entries[idx].value.as_ref() {
                    return Some(v);
                }
            }
            None
        })
    }
}

/// Totally-ordered multiset with near sub-linear positional and value search.
///
/// Equal values keep FIFO order: a new value lands after every existing
/// equal one. Every operation runs under the instance's own lock; there is
/// no live iteration view, only [`OrderedIndexedList::to_vec`] snapshots.
pub struct OrderedIndexedList<T, C> {
    index_range: usize,
    cmp: C,
    chains: Mutex<Chains<T>>,
}

impl<T, C: Comparator<T>> OrderedIndexedList<T, C> {
    /// Create an empty list
    ///
    /// # Arguments
    /// * `index_range` - Target span between markers, within `[100, 10000]`
    /// * `cmp` - Total order over the stored values
    pub fn new(index_range: usize, cmp: C) -> Result<Self> {
        if !(MIN_INDEX_RANGE..=MAX_INDEX_RANGE).contains(&index_range) {
            return Err(Error::InvalidArgument(format!(
                "index range {} outside [{}, {}]",
                index_range, MIN_INDEX_RANGE, MAX_INDEX_RANGE
            )));
        }

        Ok(Self {
            index_range,
            cmp,
            chains: Mutex::new(Chains::new()),
        })
    }

    /// Insert a value after all existing equal values
    pub fn insert(&self, e: T) {
        self.chains.lock().insert(&self.cmp, e, self.index_range);
    }

    /// Remove one instance equal to `e`
    ///
    /// Returns `true` if a matching value was found and removed.
    pub fn remove(&self, e: &T) -> bool {
        let mut chains = self.chains.lock();
        let (m, pos) = chains.locate(&self.cmp, e);
        if m == HEAD {
            return false;
        }

        let candidate = chains.entries[pos].prev;
        if candidate == HEAD {
            return false;
        }
        let matched = matches!(chains.value(candidate), Some(v) if self.cmp.compare(v, e) == Ordering::Equal);
        if matched {
            chains.remove_entry(candidate, m, self.index_range);
        }
        matched
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.chains.lock().len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every value and marker
    pub fn clear(&self) {
        *self.chains.lock() = Chains::new();
    }

    /// Target span between markers
    pub fn index_range(&self) -> usize {
        self.index_range
    }

    /// Spans cached by each marker, in chain order
    pub fn marker_spans(&self) -> Vec<usize> {
        let chains = self.chains.lock();
        let mut spans = Vec::new();
        let mut m = chains.markers[HEAD].next;
        while m != HEAD {
            spans.push(chains.markers[m].span);
            m = chains.markers[m].next;
        }
        spans
    }
}

impl<T: Clone, C: Comparator<T>> OrderedIndexedList<T, C> {
    /// First value strictly greater than `e`
    pub fn successor(&self, e: &T) -> Option<T> {
        let chains = self.chains.lock();
        let (_, pos) = chains.locate(&self.cmp, e);
        chains.value(pos).cloned()
    }

    /// Last value less than or equal to `e`, and first value strictly greater.
    pub fn neighbors(&self, e: &T) -> (Option<T>, Option<T>) {
        let chains = self.chains.lock();
        if chains.len == 0 {
            return (None, None);
        }
        let (_, pos) = chains.locate(&self.cmp, e);
        let floor = chains.entries[pos].prev;
        (chains.value(floor).cloned(), chains.value(pos).cloned())
    }

    /// Check whether a value equal to `e` is stored
    pub fn contains(&self, e: &T) -> bool {
        let chains = self.chains.lock();
        let (_, pos) = chains.locate(&self.cmp, e);
        let floor = chains.entries[pos].prev;
        matches!(chains.value(floor), Some(v) if self.cmp.compare(v, e) == Ordering::Equal)
    }

    /// Value at position `i`
    pub fn get(&self, i: usize) -> Result<T> {
        let chains = self.chains.lock();
        if i >= chains.len {
            return Err(out_of_range(i, chains.len));
        }
        chains
            .locate_position(i)
            .and_then(|(_, entry)| chains.value(entry).cloned())
            .ok_or_else(|| out_of_range(i, chains.len))
    }

    /// Lowest value
    pub fn first(&self) -> Option<T> {
        let chains = self.chains.lock();
        let head = chains.entries[HEAD].next;
        chains.value(head).cloned()
    }

    /// Remove and return the value at position `i`
    pub fn remove_at(&self, i: usize) -> Result<T> {
        let mut chains = self.chains.lock();
        if i >= chains.len {
            return Err(out_of_range(i, chains.len));
        }
        let (m, entry) = chains
            .locate_position(i)
            .ok_or_else(|| out_of_range(i, chains.len))?;
        chains
            .remove_entry(entry, m, self.index_range)
            .ok_or_else(|| out_of_range(i, chains.len))
    }

    /// Snapshot of all values in ascending order
    pub fn to_vec(&self) -> Vec<T> {
        self.chains.lock().iter().cloned().collect()
    }
}

fn out_of_range(i: usize, len: usize) -> Error {
    Error::InvalidArgument(format!("position {} out of range (size {})", i, len))
}

impl<T, C> fmt::Debug for OrderedIndexedList<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chains = self.chains.lock();
        f.debug_struct("OrderedIndexedList")
            .field("len", &chains.len)
            .field("index_range", &self.index_range)
            .finish()
    }
}

#[cfg(test)]
impl<T: Clone, C: Comparator<T>> OrderedIndexedList<T, C> {
    /// Panics if the marker chain disagrees with the base chain.
    pub(crate) fn assert_consistent(&self) {
        let chains = self.chains.lock();
        let values: Vec<&T> = chains.iter().collect();
        assert_eq!(values.len(), chains.len, "base chain length");
        for pair in values.windows(2) {
            assert_ne!(
                self.cmp.compare(pair[0], pair[1]),
                Ordering::Greater,
                "base chain out of order"
            );
        }

        let mut position = 0;
        let mut m = chains.markers[HEAD].next;
        while m != HEAD {
            let marker = chains.markers[m];
            let mut cur = chains.entries[HEAD].next;
            for _ in 0..position {
                cur = chains.entries[cur].next;
            }
            assert_eq!(marker.target, cur, "marker target at position {}", position);
            assert!(marker.span > 0, "empty marker region");
            position += marker.span;
            m = marker.next;
        }
        assert_eq!(position, chains.len, "marker spans must cover the base chain");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::NaturalOrder;
    use proptest::prelude::*;
    use rand::seq::SliceRandom;

    fn shuffled(n: u32) -> Vec<u32> {
        let mut values: Vec<u32> = (0..n).collect();
        values.shuffle(&mut rand::thread_rng());
        values
    }

    #[test]
    fn test_rejects_index_range_out_of_bounds() {
        assert!(matches!(
            OrderedIndexedList::<u32, _>::new(99, NaturalOrder),
            Err(Error::InvalidArgument(_))
        ));
        assert!(OrderedIndexedList::<u32, _>::new(10_001, NaturalOrder).is_err());
        assert!(OrderedIndexedList::<u32, _>::new(100, NaturalOrder).is_ok());
        assert!(OrderedIndexedList::<u32, _>::new(10_000, NaturalOrder).is_ok());
    }

    #[test]
    fn test_sort_in_random_order() -> Result<()> {
        let list = OrderedIndexedList::new(300, NaturalOrder)?;
        for v in shuffled(200) {
            list.insert(v);
        }

        assert_eq!(list.to_vec(), (0..200).collect::<Vec<_>>());
        // 200 entries never reach 2 x 300, so a single marker covers everything
        assert_eq!(list.marker_spans(), vec![200]);
        list.assert_consistent();
        Ok(())
    }

    #[test]
    fn test_markers_split_as_list_grows() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        for v in shuffled(10_000) {
            list.insert(v);
        }

        assert_eq!(list.len(), 10_000);
        assert_eq!(list.to_vec(), (0..10_000).collect::<Vec<_>>());
        let spans = list.marker_spans();
        assert!(spans.len() > 1);
        assert!(spans.iter().all(|&s| s < 200));
        list.assert_consistent();
        Ok(())
    }

    #[test]
    fn test_get_specified_location() -> Result<()> {
        let list = OrderedIndexedList::new(1000, NaturalOrder)?;
        for v in 0..30_000u32 {
            list.insert(v);
        }

        assert_eq!(list.get(28_000)?, 28_000);
        assert_eq!(list.get(0)?, 0);
        assert_eq!(list.get(29_999)?, 29_999);
        assert!(matches!(list.get(30_000), Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn test_successor_and_neighbors() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        assert_eq!(list.successor(&5), None);
        assert_eq!(list.neighbors(&5), (None, None));

        for v in [10u32, 20, 30] {
            list.insert(v);
        }

        assert_eq!(list.successor(&5), Some(10));
        assert_eq!(list.successor(&10), Some(20));
        assert_eq!(list.successor(&30), None);
        assert_eq!(list.neighbors(&25), (Some(20), Some(30)));
        assert_eq!(list.neighbors(&20), (Some(20), Some(30)));
        assert_eq!(list.neighbors(&1), (None, Some(10)));
        assert_eq!(list.first(), Some(10));
        assert!(list.contains(&20));
        assert!(!list.contains(&21));
        Ok(())
    }

    #[test]
    fn test_duplicates_keep_fifo_order() -> Result<()> {
        let by_key = |a: &(u32, char), b: &(u32, char)| a.0.cmp(&b.0);
        let list = OrderedIndexedList::new(100, by_key)?;

        list.insert((5, 'a'));
        list.insert((1, 'x'));
        list.insert((5, 'b'));
        list.insert((9, 'y'));
        list.insert((5, 'c'));

        let order: Vec<char> = list.to_vec().into_iter().map(|(_, c)| c).collect();
        assert_eq!(order, vec!['x', 'a', 'b', 'c', 'y']);

        // The matching instance is the last equal one before the successor
        assert!(list.remove(&(5, '?')));
        let order: Vec<char> = list.to_vec().into_iter().map(|(_, c)| c).collect();
        assert_eq!(order, vec!['x', 'a', 'b', 'y']);
        Ok(())
    }

    #[test]
    fn test_remove_missing_value() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        assert!(!list.remove(&3));

        list.insert(2);
        list.insert(4);
        assert!(!list.remove(&3));
        assert!(!list.remove(&1));
        assert!(!list.remove(&5));
        assert_eq!(list.len(), 2);
        Ok(())
    }

    #[test]
    fn test_remove_all_collapses_markers() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        for v in shuffled(2_000) {
            list.insert(v);
        }
        list.assert_consistent();

        for (i, v) in shuffled(2_000).into_iter().enumerate() {
            assert!(list.remove(&v), "value {} should be present", v);
            if i % 250 == 0 {
                list.assert_consistent();
            }
        }

        assert!(list.is_empty());
        assert!(list.marker_spans().is_empty());

        // The list is reusable after draining
        list.insert(7);
        assert_eq!(list.to_vec(), vec![7]);
        list.assert_consistent();
        Ok(())
    }

    #[test]
    fn test_remove_at() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        for v in shuffled(500) {
            list.insert(v);
        }

        assert_eq!(list.remove_at(0)?, 0);
        assert_eq!(list.remove_at(10)?, 11);
        assert_eq!(list.remove_at(list.len() - 1)?, 499);
        assert!(matches!(list.remove_at(497), Err(Error::InvalidArgument(_))));
        assert_eq!(list.len(), 497);
        list.assert_consistent();
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<()> {
        let list = OrderedIndexedList::new(100, NaturalOrder)?;
        for v in 0..300u32 {
            list.insert(v);
        }
        list.clear();

        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert!(list.marker_spans().is_empty());
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16),
        Remove(u16),
        RemoveAt(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0u16..400).prop_map(Op::Insert),
            3 => (0u16..400).prop_map(Op::Remove),
            1 => any::<usize>().prop_map(Op::RemoveAt),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_matches_sorted_vec_model(ops in prop::collection::vec(op(), 0..1500)) {
            let list = OrderedIndexedList::new(100, NaturalOrder).unwrap();
            let mut model: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    Op::Insert(v) => {
                        list.insert(v);
                        let at = model.partition_point(|&x| x <= v);
                        model.insert(at, v);
                    }
                    Op::Remove(v) => {
                        let expected = model.binary_search(&v).is_ok();
                        prop_assert_eq!(list.remove(&v), expected);
                        if expected {
                            let at = model.partition_point(|&x| x <= v) - 1;
                            model.remove(at);
                        }
                    }
                    Op::RemoveAt(i) => {
                        if model.is_empty() {
                            prop_assert!(list.remove_at(0).is_err());
                        } else {
                            let i = i % model.len();
                            prop_assert_eq!(list.remove_at(i).unwrap(), model.remove(i));
                        }
                    }
                }
            }

            prop_assert_eq!(list.to_vec(), model.clone());
            prop_assert_eq!(list.len(), model.len());
            list.assert_consistent();
        }
    }
}
