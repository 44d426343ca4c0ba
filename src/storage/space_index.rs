//! Free-space allocator over a pool of buffers
//!
//! Every buffer owns two address-ordered chains of free ranges, one per
//! size class. All chains of all buffers mutate under one allocator-wide
//! lock, so a released range is visible to the very next allocation.
//!
//! # Architecture
//!
//! ```text
//! MemorySpaceIndex
//!   ├─→ buffer 0 ─→ Large:    [0..4096) [9000..65536)
//!   │            └→ Fragment: [5000..5230)
//!   └─→ buffer 1 ─→ Large:    [0..65536)
//!                └→ Fragment: -
//! ```
//!
//! Allocation inspects only the lowest-address range of each chain.

use super::range::{AddressOrder, FreeRange};
use super::size_class::SizeClass;
use crate::error::{Error, Result};
use crate::index::OrderedIndexedList;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

type RangeList = OrderedIndexedList<FreeRange, AddressOrder>;

/// Entry count and byte total of one chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub ranges: usize,
    pub bytes: usize,
}

impl ChainStats {
    fn add(&mut self, range: &FreeRange) {
        self.ranges += 1;
        self.bytes += range.len();
    }

    fn sub(&mut self, range: &FreeRange) {
        self.ranges = self.ranges.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(range.len());
    }

    fn absorb(&mut self, other: ChainStats) {
        self.ranges += other.ranges;
        self.bytes += other.bytes;
    }
}

/// Free-space statistics of one buffer, or of the whole pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStats {
    pub fragment: ChainStats,
    pub large: ChainStats,
}

impl SpaceStats {
    pub fn free_bytes(&self) -> usize {
        self.fragment.bytes + self.large.bytes
    }

    pub fn get(&self, class: SizeClass) -> ChainStats {
        match class {
            SizeClass::Fragment => self.fragment,
            SizeClass::Large => self.large,
        }
    }
}

/// Outcome of one coalescing pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoalesceReport {
    /// Buffers that passed the threshold gate
    pub buffers: Vec<u32>,
    /// Fragments folded into large ranges
    pub merged: usize,
    pub fragments_before: usize,
    pub fragments_after: usize,
    pub elapsed: Duration,
}

struct BufferChains {
    id: u32,
    capacity: usize,
    /// Indexed by `SizeClass::index`
    chains: [RangeList; 2],
    stats: [ChainStats; 2],
}

impl BufferChains {
    fn new(id: u32, capacity: usize, index_range: usize) -> Result<Self> {
        Ok(Self {
            id,
            capacity,
            chains: [
                RangeList::new(index_range, AddressOrder)?,
                RangeList::new(index_range, AddressOrder)?,
            ],
            stats: [ChainStats::default(); 2],
        })
    }

    fn chain(&self, class: SizeClass) -> &RangeList {
        &self.chains[class.index()]
    }

    fn insert(&mut self, class: SizeClass, range: FreeRange) {
        self.chains[class.index()].insert(range);
        self.stats[class.index()].add(&range);
    }

    fn remove(&mut self, class: SizeClass, range: &FreeRange) -> bool {
        let removed = self.chains[class.index()].remove(range);
        if removed {
            self.stats[class.index()].sub(range);
        }
        removed
    }

    fn take_head(&mut self, class: SizeClass) -> Result<FreeRange> {
        let head = self.chains[class.index()].remove_at(0)?;
        self.stats[class.index()].sub(&head);
        Ok(head)
    }

    /// Insert `range`, merging with its address neighbours in the chain
    /// of `class`. A merged range that changes class moves to the other
    /// chain and merges there as well.
    fn place_in(&mut self, class: SizeClass, range: FreeRange, fragment_limit: usize) {
        let mut merged = range;
        let (floor, successor) = self.chain(class).neighbors(&range);

        if let Some(prev) = floor.filter(|prev| prev.precedes(&range)) {
            if self.remove(class, &prev) {
                merged = prev.merge(&merged);
            }
        }
        if let Some(next) = successor.filter(|next| range.precedes(next)) {
            if self.remove(class, &next) {
                merged = merged.merge(&next);
            }
        }

        let target = SizeClass::of(merged.len(), fragment_limit);
        if target != class {
            debug!(buffer = self.id, range = %merged, from = %class, to = %target, "Relocating merged range");
            self.place_in(target, merged, fragment_limit);
        } else {
            self.insert(class, merged);
        }
    }

    fn place(&mut self, range: FreeRange, fragment_limit: usize) {
        self.place_in(SizeClass::of(range.len(), fragment_limit), range, fragment_limit);
    }

    /// Fold fragments that touch a large range into the large chain
    fn coalesce(&mut self, fragment_limit: usize) -> usize {
        let mut merged = 0;
        for fragment in self.chain(SizeClass::Fragment).to_vec() {
            let (floor, successor) = self.chain(SizeClass::Large).neighbors(&fragment);
            let touches = floor.is_some_and(|prev| prev.precedes(&fragment))
                || successor.is_some_and(|next| fragment.precedes(&next));
            if touches && self.remove(SizeClass::Fragment, &fragment) {
                self.place_in(SizeClass::Large, fragment, fragment_limit);
                merged += 1;
            }
        }
        merged
    }

    fn clear(&mut self) {
        for chain in &self.chains {
            chain.clear();
        }
        self.stats = [ChainStats::default(); 2];
    }

    fn stats(&self) -> SpaceStats {
        SpaceStats {
            fragment: self.stats[SizeClass::Fragment.index()],
            large: self.stats[SizeClass::Large.index()],
        }
    }

    fn free_ranges(&self) -> Vec<FreeRange> {
        let mut ranges = self.chain(SizeClass::Fragment).to_vec();
        ranges.extend(self.chain(SizeClass::Large).to_vec());
        ranges.sort_by_key(|r| r.start);
        ranges
    }
}

/// Per-buffer, per-size-class free-range allocator
pub struct MemorySpaceIndex {
    fragment_limit: usize,
    active: AtomicBool,
    buffers: Mutex<Vec<BufferChains>>,
}

impl MemorySpaceIndex {
    /// Create an index where every buffer starts as one free range
    ///
    /// # Arguments
    /// * `capacities` - Logical capacity of each buffer
    /// * `fragment_limit` - Ranges shorter than this are fragments
    /// * `index_range` - Target marker span of every chain
    pub fn new(capacities: &[usize], fragment_limit: usize, index_range: usize) -> Result<Self> {
        if fragment_limit == 0 {
            return Err(Error::InvalidArgument("fragment limit must be positive".to_string()));
        }

        let mut buffers = Vec::with_capacity(capacities.len());
        for (id, &capacity) in capacities.iter().enumerate() {
            let id = u32::try_from(id)
                .map_err(|_| Error::InvalidArgument(format!("too many buffers: {}", capacities.len())))?;
            let mut chains = BufferChains::new(id, capacity, index_range)?;
            if capacity > 0 {
                chains.place(FreeRange::new(id, 0, capacity), fragment_limit);
            }
            buffers.push(chains);
        }

        info!(
            buffers = buffers.len(),
            fragment_limit,
            index_range,
            "Memory space index initialized"
        );

        Ok(Self {
            fragment_limit,
            active: AtomicBool::new(true),
            buffers: Mutex::new(buffers),
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Inactive)
        }
    }

    /// Allocate `len` bytes
    ///
    /// Tries the large class, then the fragment class. Buffers are visited
    /// in random order and only each chain's head range is considered, so
    /// this can fail while a deeper range would fit.
    pub fn allocate(&self, len: usize) -> Result<FreeRange> {
        self.ensure_active()?;
        if len == 0 {
            return Err(Error::InvalidArgument("cannot allocate 0 bytes".to_string()));
        }

        let mut buffers = self.buffers.lock();
        let mut order: Vec<usize> = (0..buffers.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for class in SizeClass::ALLOCATION_ORDER {
            for &b in &order {
                let chains = &mut buffers[b];
                let fits = chains
                    .chain(class)
                    .first()
                    .is_some_and(|head| head.len() >= len);
                if !fits {
                    continue;
                }

                let head = chains.take_head(class)?;
                let (served, remainder) = head.split_at(len);
                if let Some(remainder) = remainder {
                    chains.place(remainder, self.fragment_limit);
                }
                debug!(buffer = b, range = %served, class = %class, "Allocated range");
                return Ok(served);
            }
        }

        Err(Error::AllocationFailed { requested: len })
    }

    /// Return a range to its buffer, merging with address neighbours
    pub fn release(&self, range: FreeRange) -> Result<()> {
        self.ensure_active()?;
        let mut buffers = self.buffers.lock();
        let chains = buffers
            .get_mut(range.buffer as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown buffer {}", range.buffer)))?;
        if range.is_empty() || range.end > chains.capacity {
            return Err(Error::InvalidArgument(format!(
                "range {} outside buffer capacity {}",
                range, chains.capacity
            )));
        }

        chains.place(range, self.fragment_limit);
        debug!(range = %range, "Released range");
        Ok(())
    }

    /// Coalescing pass over buffers whose fragment chain reaches either
    /// threshold
    pub fn coalesce(&self, min_ranges: usize, min_bytes: usize) -> Result<CoalesceReport> {
        self.ensure_active()?;
        let start = Instant::now();
        let mut report = CoalesceReport::default();
        let mut buffers = self.buffers.lock();

        for chains in buffers.iter_mut() {
            let fragments = chains.stats[SizeClass::Fragment.index()];
            if fragments.ranges == 0
                || (fragments.ranges < min_ranges && fragments.bytes < min_bytes)
            {
                continue;
            }
            report.buffers.push(chains.id);
            report.fragments_before += fragments.ranges;
            report.merged += chains.coalesce(self.fragment_limit);
            report.fragments_after += chains.stats[SizeClass::Fragment.index()].ranges;
        }

        report.elapsed = start.elapsed();
        if !report.buffers.is_empty() {
            info!(
                buffers = report.buffers.len(),
                merged = report.merged,
                fragments_before = report.fragments_before,
                fragments_after = report.fragments_after,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Coalesced free ranges"
            );
        }
        Ok(report)
    }

    /// Coalescing pass over one buffer, ignoring thresholds
    ///
    /// Returns the number of fragments folded into large ranges.
    pub fn coalesce_buffer(&self, buffer: u32) -> Result<usize> {
        self.ensure_active()?;
        let mut buffers = self.buffers.lock();
        let chains = buffers
            .get_mut(buffer as usize)
            .ok_or_else(|| unknown_buffer(buffer))?;
        Ok(chains.coalesce(self.fragment_limit))
    }

    /// Forget every free range of `buffer` and mark `[used, capacity)` free
    pub fn reset_buffer(&self, buffer: u32, used: usize) -> Result<()> {
        self.ensure_active()?;
        let mut buffers = self.buffers.lock();
        let chains = buffers
            .get_mut(buffer as usize)
            .ok_or_else(|| unknown_buffer(buffer))?;
        if used > chains.capacity {
            return Err(Error::InvalidArgument(format!(
                "used bytes {} exceed buffer capacity {}",
                used, chains.capacity
            )));
        }

        chains.clear();
        if used < chains.capacity {
            chains.place(FreeRange::new(buffer, used, chains.capacity), self.fragment_limit);
        }
        debug!(buffer, used, capacity = chains.capacity, "Reset free ranges");
        Ok(())
    }

    /// Free-space statistics of one buffer
    pub fn buffer_stats(&self, buffer: u32) -> Result<SpaceStats> {
        self.buffers
            .lock()
            .get(buffer as usize)
            .map(BufferChains::stats)
            .ok_or_else(|| unknown_buffer(buffer))
    }

    /// Free-space statistics of every buffer, in buffer order
    pub fn all_stats(&self) -> Vec<SpaceStats> {
        self.buffers.lock().iter().map(BufferChains::stats).collect()
    }

    /// Free-space statistics summed over all buffers
    pub fn totals(&self) -> SpaceStats {
        self.all_stats()
            .into_iter()
            .fold(SpaceStats::default(), |mut acc, s| {
                acc.fragment.absorb(s.fragment);
                acc.large.absorb(s.large);
                acc
            })
    }

    /// Bytes held in the fragment chain of `buffer`
    pub fn fragment_bytes(&self, buffer: u32) -> Result<usize> {
        Ok(self.buffer_stats(buffer)?.fragment.bytes)
    }

    /// Address-ordered free ranges of `buffer` across both chains
    pub fn free_ranges(&self, buffer: u32) -> Result<Vec<FreeRange>> {
        self.buffers
            .lock()
            .get(buffer as usize)
            .map(BufferChains::free_ranges)
            .ok_or_else(|| unknown_buffer(buffer))
    }

    pub fn capacity(&self, buffer: u32) -> Result<usize> {
        self.buffers
            .lock()
            .get(buffer as usize)
            .map(|c| c.capacity)
            .ok_or_else(|| unknown_buffer(buffer))
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn fragment_limit(&self) -> usize {
        self.fragment_limit
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Drop every free range; later calls fail with `Inactive`
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            for chains in self.buffers.lock().iter_mut() {
                chains.clear();
            }
            debug!("Memory space index closed");
        }
    }
}

fn unknown_buffer(buffer: u32) -> Error {
    Error::InvalidArgument(format!("unknown buffer {}", buffer))
}
