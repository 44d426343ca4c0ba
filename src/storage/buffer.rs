//! Per-buffer raw byte storage
//!
//! Each buffer wraps one raw region behind its own lock, independent of
//! the cache-wide lock. When compaction is enabled one extra scratch region
//! sits outside the addressable capacity and trades places with a buffer
//! every time that buffer is repacked.

use super::handle::Handle;
use super::range::FreeRange;
use super::region::{RawRegion, RegionProvider};
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type Region = Box<dyn RawRegion>;

/// Live data held by one buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferUsage {
    pub entries: usize,
    pub bytes: usize,
    pub capacity: usize,
}

/// Result of repacking one buffer
#[derive(Debug, Clone, Default)]
pub struct Repack {
    /// `(slot, new start)` for every handle that was copied
    pub moves: Vec<(u32, usize)>,
    /// End of the packed prefix
    pub packed: usize,
}

struct Buffer {
    capacity: usize,
    region: Mutex<Option<Region>>,
    entries: AtomicUsize,
    bytes: AtomicUsize,
}

/// Raw byte I/O over the cache's regions
pub struct BufferDataStore {
    provider: Arc<dyn RegionProvider>,
    buffers: Vec<Buffer>,
    scratch: Mutex<Option<Region>>,
}

impl BufferDataStore {
    /// Obtain one region per entry of `sizes`, plus a scratch region of
    /// `scratch_size` bytes if given
    ///
    /// Either every region is obtained or none is kept.
    pub fn new(
        provider: Arc<dyn RegionProvider>,
        sizes: &[usize],
        scratch_size: Option<usize>,
    ) -> Result<Self> {
        let mut regions: Vec<Region> = Vec::with_capacity(sizes.len() + 1);
        let wanted = sizes.iter().copied().chain(scratch_size);

        for size in wanted {
            match provider.allocate_region(size) {
                Ok(region) => regions.push(region),
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        size,
                        obtained = regions.len(),
                        error = %e,
                        "Region allocation failed, releasing partial set"
                    );
                    for region in regions {
                        provider.release_region(region);
                    }
                    return Err(Error::ConstructionFailed(format!(
                        "{} provider cannot supply {} bytes: {}",
                        provider.name(),
                        size,
                        e
                    )));
                }
            }
        }

        let scratch = if scratch_size.is_some() { regions.pop() } else { None };
        let buffers = regions
            .into_iter()
            .zip(sizes)
            .map(|(region, &capacity)| Buffer {
                capacity,
                region: Mutex::new(Some(region)),
                entries: AtomicUsize::new(0),
                bytes: AtomicUsize::new(0),
            })
            .collect::<Vec<_>>();

        info!(
            provider = provider.name(),
            buffers = buffers.len(),
            scratch = scratch_size.unwrap_or(0),
            "Buffer regions ready"
        );

        Ok(Self {
            provider,
            buffers,
            scratch: Mutex::new(scratch),
        })
    }

    fn buffer(&self, id: u32) -> Result<&Buffer> {
        self.buffers
            .get(id as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown buffer {}", id)))
    }

    /// Write `data` at the start of `range` and count it as live
    pub fn store(&self, range: &FreeRange, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(range.buffer)?;
        if data.len() > range.len() || range.end > buffer.capacity {
            return Err(Error::Region(format!(
                "{} bytes do not fit {} (capacity {})",
                data.len(),
                range,
                buffer.capacity
            )));
        }

        let mut region = buffer.region.lock();
        region
            .as_mut()
            .ok_or(Error::Inactive)?
            .write(range.start, data)?;
        buffer.entries.fetch_add(1, Ordering::AcqRel);
        buffer.bytes.fetch_add(data.len(), Ordering::AcqRel);
        Ok(())
    }

    /// Copy the bytes of `range`
    pub fn read(&self, range: &FreeRange) -> Result<Bytes> {
        let buffer = self.buffer(range.buffer)?;
        let region = buffer.region.lock();
        region
            .as_ref()
            .ok_or(Error::Inactive)?
            .read(range.start, range.len())
    }

    /// Stop counting `range` as live
    pub fn forget(&self, range: &FreeRange) -> Result<()> {
        let buffer = self.buffer(range.buffer)?;
        let _ = buffer
            .entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        let _ = buffer
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(range.len()))
            });
        Ok(())
    }

    /// Pack `live` contiguously from offset 0 into the scratch region, in
    /// the given order, then swap scratch and buffer
    ///
    /// A buffer backed by a smaller region than the scratch gets the packed
    /// bytes copied back instead of swapped.
    ///
    /// The caller must keep every other mutator out for the duration.
    pub fn repack(&self, id: u32, live: &[Handle]) -> Result<Repack> {
        let buffer = self.buffer(id)?;
        let mut scratch_guard = self.scratch.lock();
        let mut region_guard = buffer.region.lock();

        let scratch = scratch_guard
            .as_mut()
            .ok_or_else(|| Error::Region("no scratch region reserved".to_string()))?;
        let region = region_guard.as_mut().ok_or(Error::Inactive)?;

        if scratch.capacity() < buffer.capacity {
            return Err(Error::Region(format!(
                "scratch region of {} bytes cannot cover buffer {} of {} bytes",
                scratch.capacity(),
                id,
                buffer.capacity
            )));
        }

        let mut repack = Repack::default();
        for handle in live {
            let data = region.read(handle.start, handle.len)?;
            scratch.write(repack.packed, &data)?;
            if handle.start != repack.packed {
                repack.moves.push((handle.slot, repack.packed));
            }
            repack.packed += handle.len;
        }

        if region.capacity() >= scratch.capacity() {
            std::mem::swap(scratch, region);
        } else {
            // Keep the larger region as scratch so every buffer stays compactable
            let packed = scratch.read(0, repack.packed)?;
            region.write(0, &packed)?;
        }
        debug!(
            buffer = id,
            entries = live.len(),
            moved = repack.moves.len(),
            packed = repack.packed,
            "Repacked buffer through scratch region"
        );
        Ok(repack)
    }

    /// Live data per buffer, in buffer order
    pub fn usage(&self) -> Vec<BufferUsage> {
        self.buffers
            .iter()
            .map(|b| BufferUsage {
                entries: b.entries.load(Ordering::Acquire),
                bytes: b.bytes.load(Ordering::Acquire),
                capacity: b.capacity,
            })
            .collect()
    }

    /// Logical capacity of each buffer
    pub fn capacities(&self) -> Vec<usize> {
        self.buffers.iter().map(|b| b.capacity).collect()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn has_scratch(&self) -> bool {
        self.scratch.lock().is_some()
    }

    /// Hand every region back to the provider and zero the counters
    pub fn close(&self) {
        let mut released = 0;
        for buffer in &self.buffers {
            if let Some(region) = buffer.region.lock().take() {
                self.provider.release_region(region);
                released += 1;
            }
            buffer.entries.store(0, Ordering::Release);
            buffer.bytes.store(0, Ordering::Release);
        }
        if let Some(region) = self.scratch.lock().take() {
            self.provider.release_region(region);
            released += 1;
        }
        if released > 0 {
            debug!(released, provider = self.provider.name(), "Released buffer regions");
        }
    }
}

impl Drop for BufferDataStore {
    fn drop(&mut self) {
        self.close();
    }
}
