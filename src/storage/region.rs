//! Raw memory regions
//!
//! Providers hand out fixed-size byte regions that live outside the
//! cache's own bookkeeping. Two providers ship with the crate:
//! - `AnonymousRegionProvider`: anonymous memory maps, the off-heap default
//! - `HeapRegionProvider`: plain vectors, handy for small caches and tests
//!
//! Both charge every region against a [`MemoryBudget`].

use crate::error::{Error, Result};
use bytes::Bytes;
use memmap2::MmapMut;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Fixed-capacity byte region
pub trait RawRegion: Send {
    fn capacity(&self) -> usize;

    /// Copy `len` bytes starting at `offset`
    fn read(&self, offset: usize, len: usize) -> Result<Bytes>;

    /// Overwrite bytes starting at `offset`
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

/// Source of raw regions
pub trait RegionProvider: Send + Sync + fmt::Debug {
    /// Obtain a region of exactly `size` bytes
    fn allocate_region(&self, size: usize) -> Result<Box<dyn RawRegion>>;

    /// Give a region back
    fn release_region(&self, region: Box<dyn RawRegion>);

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

fn check_bounds(capacity: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::Region(format!(
            "access {}+{} beyond region capacity {}",
            offset, len, capacity
        ))),
    }
}

/// Upper bound on bytes a provider may hand out
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    reserved: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            reserved: AtomicUsize::new(0),
        }
    }

    /// Budget without an upper bound
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Budget equal to the memory the host currently reports as available
    pub fn from_available_memory() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let available = usize::try_from(sys.available_memory()).unwrap_or(usize::MAX);
        debug!(available, "Sized memory budget from host");
        Self::new(available)
    }

    /// Reserve `bytes`, failing if the budget would be exceeded
    pub fn try_reserve(&self, bytes: usize) -> Result<()> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_add(bytes).filter(|&total| total <= self.limit)
            })
            .map(|_| ())
            .map_err(|reserved| {
                Error::Region(format!(
                    "memory budget exceeded: {} reserved, {} requested, limit {}",
                    reserved, bytes, self.limit
                ))
            })
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                Some(reserved.saturating_sub(bytes))
            });
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

/// Region backed by an anonymous memory map
pub struct MappedRegion {
    map: MmapMut,
}

impl RawRegion for MappedRegion {
    fn capacity(&self) -> usize {
        self.map.len()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        check_bounds(self.map.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&self.map[offset..offset + len]))
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(self.map.len(), offset, data.len())?;
        self.map[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Off-heap regions from anonymous memory maps
#[derive(Debug)]
pub struct AnonymousRegionProvider {
    budget: MemoryBudget,
}

impl AnonymousRegionProvider {
    pub fn new(budget: MemoryBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

impl Default for AnonymousRegionProvider {
    fn default() -> Self {
        Self::new(MemoryBudget::from_available_memory())
    }
}

impl RegionProvider for AnonymousRegionProvider {
    fn allocate_region(&self, size: usize) -> Result<Box<dyn RawRegion>> {
        if size == 0 {
            return Err(Error::Region("cannot map an empty region".to_string()));
        }
        self.budget.try_reserve(size)?;

        match MmapMut::map_anon(size) {
            Ok(map) => {
                debug!(size, "Mapped anonymous region");
                Ok(Box::new(MappedRegion { map }))
            }
            Err(e) => {
                self.budget.release(size);
                warn!(size, error = %e, "Anonymous mapping failed");
                Err(Error::Region(format!("cannot map {} bytes: {}", size, e)))
            }
        }
    }

    fn release_region(&self, region: Box<dyn RawRegion>) {
        self.budget.release(region.capacity());
    }

    fn name(&self) -> &'static str {
        "anonymous-mmap"
    }
}

/// Region backed by a heap vector
pub struct HeapRegion {
    bytes: Vec<u8>,
}

impl RawRegion for HeapRegion {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        check_bounds(self.bytes.len(), offset, len)?;
        Ok(Bytes::copy_from_slice(&self.bytes[offset..offset + len]))
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(self.bytes.len(), offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Heap-allocated regions
#[derive(Debug)]
pub struct HeapRegionProvider {
    budget: MemoryBudget,
}

impl HeapRegionProvider {
    pub fn new(budget: MemoryBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }
}

impl Default for HeapRegionProvider {
    fn default() -> Self {
        Self::new(MemoryBudget::unlimited())
    }
}

impl RegionProvider for HeapRegionProvider {
    fn allocate_region(&self, size: usize) -> Result<Box<dyn RawRegion>> {
        self.budget.try_reserve(size)?;

        let mut bytes = Vec::new();
        if let Err(e) = bytes.try_reserve_exact(size) {
            self.budget.release(size);
            return Err(Error::Region(format!("cannot allocate {} bytes: {}", size, e)));
        }
        bytes.resize(size, 0);
        Ok(Box::new(HeapRegion { bytes }))
    }

    fn release_region(&self, region: Box<dyn RawRegion>) {
        self.budget.release(region.capacity());
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_reserve_and_release() -> Result<()> {
        let budget = MemoryBudget::new(100);
        budget.try_reserve(60)?;
        assert!(matches!(budget.try_reserve(41), Err(Error::Region(_))));
        assert_eq!(budget.reserved(), 60);

        budget.release(60);
        budget.try_reserve(100)?;
        assert_eq!(budget.reserved(), 100);
        Ok(())
    }

    #[test]
    fn test_budget_from_host_is_positive() {
        assert!(MemoryBudget::from_available_memory().limit() > 0);
    }

    #[test]
    fn test_anonymous_region_io() -> Result<()> {
        let provider = AnonymousRegionProvider::new(MemoryBudget::new(1 << 20));
        let mut region = provider.allocate_region(4096)?;

        region.write(100, b"haha")?;
        assert_eq!(&region.read(100, 4)?[..], b"haha");
        assert_eq!(&region.read(0, 2)?[..], &[0, 0]);
        assert!(region.read(4094, 4).is_err());
        assert!(region.write(4095, b"xy").is_err());

        assert_eq!(provider.budget().reserved(), 4096);
        provider.release_region(region);
        assert_eq!(provider.budget().reserved(), 0);
        Ok(())
    }

    #[test]
    fn test_heap_region_io() -> Result<()> {
        let provider = HeapRegionProvider::default();
        let mut region = provider.allocate_region(64)?;
        assert_eq!(region.capacity(), 64);

        region.write(60, &[1, 2, 3, 4])?;
        assert_eq!(&region.read(58, 6)?[..], &[0, 0, 1, 2, 3, 4]);
        assert!(region.read(usize::MAX, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_provider_respects_budget() {
        let provider = HeapRegionProvider::new(MemoryBudget::new(1000));
        assert!(provider.allocate_region(1001).is_err());
        assert_eq!(provider.budget().reserved(), 0);

        let provider = AnonymousRegionProvider::new(MemoryBudget::new(1000));
        assert!(provider.allocate_region(4096).is_err());
        assert!(provider.allocate_region(0).is_err());
    }
}
