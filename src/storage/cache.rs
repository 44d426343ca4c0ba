//! Cache facade
//!
//! `DirectCache` ties the pieces together:
//! - `SlotTable` issues handles and bounds the number of live entries
//! - `MemorySpaceIndex` hands out free byte ranges
//! - `BufferDataStore` holds the bytes in raw regions
//!
//! store/get/release take the shared side of one cache-wide lock.
//! Compaction takes the exclusive side, because moving bytes rewrites
//! locations that a concurrent reader could be using.

use super::buffer::{BufferDataStore, BufferUsage};
use super::compaction::CompactionReport;
use super::handle::Handle;
use super::maintenance::Maintenance;
use super::metrics::CacheMetrics;
use super::range::FreeRange;
use super::region::{AnonymousRegionProvider, RegionProvider};
use super::slot::SlotTable;
use super::space_index::{CoalesceReport, MemorySpaceIndex, SpaceStats};
use super::status;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub running: bool,
    pub entries: usize,
    pub capacity: usize,
    pub total_memory: usize,
    pub live_bytes: usize,
    pub free: SpaceStats,
    pub buffers: Vec<BufferUsage>,
}

/// Off-heap, fixed-capacity blob cache
pub struct DirectCache {
    name: String,
    config: CacheConfig,
    gate: RwLock<()>,
    active: AtomicBool,
    slots: SlotTable,
    spaces: MemorySpaceIndex,
    data: BufferDataStore,
    metrics: CacheMetrics,
    maintenance: Mutex<Option<Maintenance>>,
}

impl DirectCache {
    /// Create a cache backed by anonymous memory maps
    ///
    /// No background task is started; see [`DirectCache::start`].
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_provider(config, Arc::new(AnonymousRegionProvider::default()))
    }

    /// Create a cache whose regions come from `provider`
    pub fn with_provider(config: CacheConfig, provider: Arc<dyn RegionProvider>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConstructionFailed(e.to_string()))?;

        let name = format!("DM-{}", uuid::Uuid::new_v4());
        let sizes = config.region_sizes();
        let scratch = sizes.first().copied().filter(|_| config.compaction_enabled);

        let data = BufferDataStore::new(provider, &sizes, scratch)?;
        let spaces = MemorySpaceIndex::new(&sizes, config.fragment_limit, config.index_range)
            .map_err(|e| Error::ConstructionFailed(e.to_string()))?;
        let slots = SlotTable::new(config.capacity)
            .map_err(|e| Error::ConstructionFailed(e.to_string()))?;
        let metrics =
            CacheMetrics::new(&name).map_err(|e| Error::ConstructionFailed(e.to_string()))?;

        info!(
            cache = %name,
            total_memory = config.total_memory,
            buffers = sizes.len(),
            capacity = config.capacity,
            fragment_limit = config.fragment_limit,
            compaction = config.compaction_enabled,
            "Direct cache created"
        );

        Ok(Self {
            name,
            config,
            gate: RwLock::new(()),
            active: AtomicBool::new(true),
            slots,
            spaces,
            data,
            metrics,
            maintenance: Mutex::new(None),
        })
    }

    /// Create a cache and start its maintenance tasks on the current
    /// tokio runtime
    pub fn start(config: CacheConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(Self::new(config)?);
        cache.start_maintenance()?;
        Ok(cache)
    }

    /// Start compaction and coalescing loops, if enabled and not running
    pub fn start_maintenance(self: &Arc<Self>) -> Result<()> {
        self.ensure_active()?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidArgument("maintenance tasks need a tokio runtime".to_string())
        })?;

        let mut maintenance = self.maintenance.lock();
        if maintenance.is_none() {
            *maintenance = Some(Maintenance::spawn(self));
        }
        Ok(())
    }

    /// Store a copy of `data` and return its handle
    pub fn store(&self, data: &[u8]) -> Result<Handle> {
        let started = Instant::now();
        let result = self.store_inner(data);
        self.metrics.record("store", started.elapsed(), &result);
        result
    }

    fn store_inner(&self, data: &[u8]) -> Result<Handle> {
        let _shared = self.shared()?;
        let slot = self.slots.acquire(self.config.slot_wait())?;

        // Empty payloads take a slot but no buffer bytes
        if data.is_empty() {
            return match self.slots.bind_empty(slot) {
                Ok(handle) => {
                    self.metrics.entry_added(0);
                    debug!(cache = %self.name, handle = %handle, "Stored empty entry");
                    Ok(handle)
                }
                Err(e) => {
                    self.slots.give_back(slot);
                    Err(e)
                }
            };
        }

        let range = match self.spaces.allocate(data.len()) {
            Ok(range) => range,
            Err(e) => {
                self.slots.give_back(slot);
                return Err(e);
            }
        };

        if let Err(e) = self.data.store(&range, data) {
            self.rollback(slot, range);
            return Err(e);
        }
        match self.slots.bind(slot, range) {
            Ok(handle) => {
                self.metrics.entry_added(data.len());
                debug!(cache = %self.name, handle = %handle, range = %range, "Stored entry");
                Ok(handle)
            }
            Err(e) => {
                let _ = self.data.forget(&range);
                self.rollback(slot, range);
                Err(e)
            }
        }
    }

    fn rollback(&self, slot: u32, range: FreeRange) {
        if let Err(e) = self.spaces.release(range) {
            warn!(cache = %self.name, range = %range, error = %e, "Failed to return range");
        }
        self.slots.give_back(slot);
    }

    /// Copy of the bytes stored under `handle`
    pub fn get(&self, handle: &Handle) -> Result<Bytes> {
        let started = Instant::now();
        let result = self.get_inner(handle);
        self.metrics.record("get", started.elapsed(), &result);
        result
    }

    fn get_inner(&self, handle: &Handle) -> Result<Bytes> {
        let _shared = self.shared()?;
        match self.slots.resolve(handle)?.range() {
            Some(range) => self.data.read(&range),
            None => Ok(Bytes::new()),
        }
    }

    /// Drop the entry behind `handle`; the handle becomes invalid
    pub fn release(&self, handle: &Handle) -> Result<()> {
        let started = Instant::now();
        let result = self.release_inner(handle);
        self.metrics.record("release", started.elapsed(), &result);
        result
    }

    fn release_inner(&self, handle: &Handle) -> Result<()> {
        let _shared = self.shared()?;
        let bound = self.slots.unbind(handle)?;

        let released = match bound.range() {
            Some(range) => {
                self.data.forget(&range)?;
                self.spaces.release(range)
            }
            None => Ok(()),
        };
        self.slots.give_back(bound.slot);
        self.metrics.entry_removed(bound.len());
        debug!(cache = %self.name, handle = %bound, len = bound.len(), "Released entry");
        released
    }

    /// Repack one buffer's live entries to its start
    ///
    /// Holds the exclusive lock for the whole copy. Afterwards the buffer's
    /// free space is the single range `[packed, capacity)`.
    pub fn compact_buffer(&self, buffer: u32) -> Result<CompactionReport> {
        self.ensure_active()?;
        if !self.config.compaction_enabled {
            return Err(Error::InvalidArgument("compaction is disabled".to_string()));
        }
        let _exclusive = self.exclusive()?;

        let started = Instant::now();
        let live = self.slots.bound_in(buffer);
        let repack = self.data.repack(buffer, &live)?;
        for &(slot, start) in &repack.moves {
            self.slots.relocate(slot, start)?;
        }
        self.spaces.reset_buffer(buffer, repack.packed)?;

        let report = CompactionReport {
            buffer,
            entries: live.len(),
            moved: repack.moves.len(),
            copied_bytes: repack.packed,
            packed: repack.packed,
            elapsed: started.elapsed(),
        };
        self.metrics.compacted(report.copied_bytes);
        info!(
            cache = %self.name,
            buffer,
            entries = report.entries,
            moved = report.moved,
            packed = report.packed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Compacted buffer"
        );
        Ok(report)
    }

    /// Merge fragments into adjacent large ranges in every buffer that
    /// crosses the configured thresholds
    pub fn coalesce(&self) -> Result<CoalesceReport> {
        self.ensure_active()?;
        let report = self
            .spaces
            .coalesce(self.config.coalesce_min_ranges, self.config.coalesce_min_bytes)?;
        self.metrics.coalesced(report.merged);
        Ok(report)
    }

    /// Fragment bytes of `buffer` as a share of its capacity
    pub fn fragmentation(&self, buffer: u32) -> Option<f64> {
        let capacity = self.spaces.capacity(buffer).ok()?;
        let fragmented = self.spaces.fragment_bytes(buffer).ok()?;
        (capacity > 0).then(|| fragmented as f64 / capacity as f64)
    }

    /// Stop maintenance, drop every entry and hand the regions back
    ///
    /// Later calls fail with `Inactive`. Calling it again is a no-op.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let maintenance = self.maintenance.lock().take();
        if let Some(maintenance) = maintenance {
            maintenance.shutdown().await;
        }

        let exclusive = self.gate.try_write_for(self.config.lock_wait());
        if exclusive.is_none() {
            warn!(cache = %self.name, "Closing while operations are still in flight");
        }
        self.slots.clear();
        self.spaces.close();
        self.data.close();
        self.metrics.reset_live();
        drop(exclusive);

        info!(cache = %self.name, "Direct cache closed");
    }

    /// Diagnostic text: per-buffer usage and free space per size class
    pub fn status(&self) -> String {
        status::render(
            &self.name,
            &self.data.usage(),
            &self.spaces.all_stats(),
            self.config.fragment_limit,
        )
    }

    pub fn stats(&self) -> CacheStats {
        let buffers = self.data.usage();
        CacheStats {
            name: self.name.clone(),
            running: self.is_running(),
            entries: self.size(),
            capacity: self.config.capacity,
            total_memory: self.config.total_memory,
            live_bytes: buffers.iter().map(|b| b.bytes).sum(),
            free: self.spaces.totals(),
            buffers,
        }
    }

    /// Metrics in Prometheus text format
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics.export()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of live entries
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn buffer_count(&self) -> usize {
        self.data.buffer_count()
    }

    /// Address-ordered free ranges of one buffer
    pub fn free_ranges(&self, buffer: u32) -> Result<Vec<FreeRange>> {
        self.spaces.free_ranges(buffer)
    }

    /// Current location of a live handle; `None` for an empty payload
    pub fn locate(&self, handle: &Handle) -> Result<Option<FreeRange>> {
        Ok(self.slots.resolve(handle)?.range())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::Inactive)
        }
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.ensure_active()?;
        let guard = self.gate.try_read_for(self.config.lock_wait()).ok_or_else(|| {
            Error::LockTimeout(format!("shared lock of {} after {:?}", self.name, self.config.lock_wait()))
        })?;
        // close() may have won the race while we waited
        self.ensure_active()?;
        Ok(guard)
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        let guard = self.gate.try_write_for(self.config.lock_wait()).ok_or_else(|| {
            Error::LockTimeout(format!(
                "exclusive lock of {} after {:?}",
                self.name,
                self.config.lock_wait()
            ))
        })?;
        self.ensure_active()?;
        Ok(guard)
    }
}

impl std::fmt::Debug for DirectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectCache")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("entries", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteUnit;
    use crate::storage::region::{HeapRegionProvider, MemoryBudget};
    use std::time::Duration;

    fn heap_cache(config: CacheConfig) -> Result<DirectCache> {
        DirectCache::with_provider(config, Arc::new(HeapRegionProvider::default()))
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            total_memory: 100_000,
            slice_size: ByteUnit::Mb.bytes(10),
            capacity: 1024,
            fragment_limit: ByteUnit::Kb.bytes(1),
            slot_wait_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_store_get_release() -> Result<()> {
        let cache = heap_cache(small_config())?;
        assert!(cache.name().starts_with("DM-"));

        let handle = cache.store(b"haha")?;
        assert_eq!(&cache.get(&handle)?[..], b"haha");
        assert_eq!(cache.size(), 1);

        cache.release(&handle)?;
        assert_eq!(cache.size(), 0);
        assert!(matches!(cache.get(&handle), Err(Error::InvalidHandle(_))));
        assert!(matches!(cache.release(&handle), Err(Error::InvalidHandle(_))));
        Ok(())
    }

    #[test]
    fn test_empty_payload_round_trip() -> Result<()> {
        let cache = heap_cache(small_config())?;
        let before = cache.free_ranges(0)?;

        let handle = cache.store(b"")?;
        assert!(handle.is_empty());
        assert_eq!(cache.size(), 1);
        assert!(cache.get(&handle)?.is_empty());
        assert_eq!(cache.locate(&handle)?, None);
        // No buffer bytes were taken
        assert_eq!(cache.free_ranges(0)?, before);
        assert_eq!(cache.stats().live_bytes, 0);

        cache.release(&handle)?;
        assert_eq!(cache.size(), 0);
        assert!(matches!(cache.get(&handle), Err(Error::InvalidHandle(_))));
        assert!(matches!(cache.release(&handle), Err(Error::InvalidHandle(_))));
        assert_eq!(cache.free_ranges(0)?, before);
        Ok(())
    }

    #[test]
    fn test_failed_bind_leaves_no_ghost_entry() -> Result<()> {
        let cache = heap_cache(CacheConfig {
            capacity: 1,
            ..small_config()
        })?;
        // Occupy the only slot's record behind the pool's back
        cache.slots.bind(0, FreeRange::new(0, 0, 1))?;

        assert!(matches!(cache.store(b"ghost"), Err(Error::InvalidArgument(_))));
        let usage = &cache.data.usage()[0];
        assert_eq!(usage.entries, 0);
        assert_eq!(usage.bytes, 0);
        let free: usize = cache.free_ranges(0)?.iter().map(|r| r.len()).sum();
        assert_eq!(free, 100_000);
        assert_eq!(cache.slots.free_count(), 1);
        Ok(())
    }

    #[test]
    fn test_allocation_failure_returns_slot() -> Result<()> {
        let cache = heap_cache(CacheConfig {
            capacity: 1,
            ..small_config()
        })?;

        assert!(matches!(
            cache.store(&vec![0u8; 200_000]),
            Err(Error::AllocationFailed { requested: 200_000 })
        ));
        // The single slot went back to the pool
        let handle = cache.store(b"fits")?;
        assert_eq!(&cache.get(&handle)?[..], b"fits");
        Ok(())
    }

    #[test]
    fn test_construction_fails_without_memory() {
        let provider = Arc::new(HeapRegionProvider::new(MemoryBudget::new(1000)));
        let result = DirectCache::with_provider(small_config(), provider.clone());
        assert!(matches!(result, Err(Error::ConstructionFailed(_))));
        assert_eq!(provider.budget().reserved(), 0);

        let invalid = CacheConfig {
            capacity: 0,
            ..small_config()
        };
        assert!(matches!(heap_cache(invalid), Err(Error::ConstructionFailed(_))));
    }

    #[test]
    fn test_compaction_requires_scratch() -> Result<()> {
        let cache = heap_cache(small_config())?;
        assert!(matches!(cache.compact_buffer(0), Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn test_compaction_packs_and_rewrites_locations() -> Result<()> {
        let cache = heap_cache(CacheConfig {
            compaction_enabled: true,
            slice_size: 100_000,
            ..small_config()
        })?;

        let handles: Vec<Handle> = (0..20u8)
            .map(|i| cache.store(&vec![i; 100 + i as usize]))
            .collect::<Result<_>>()?;
        for h in handles.iter().step_by(2) {
            cache.release(h)?;
        }
        let survivors: Vec<&Handle> = handles.iter().skip(1).step_by(2).collect();

        let report = cache.compact_buffer(0)?;
        assert_eq!(report.entries, survivors.len());
        let live_bytes: usize = survivors.iter().map(|h| h.len()).sum();
        assert_eq!(report.packed, live_bytes);
        assert_eq!(cache.free_ranges(0)?, vec![FreeRange::new(0, live_bytes, 100_000)]);

        // Bytes survive the move and handles resolve to the new place
        let mut locations: Vec<FreeRange> = Vec::new();
        for h in &survivors {
            let i = h.len() as u8 - 100;
            assert_eq!(cache.get(h)?.to_vec(), vec![i; h.len()]);
            locations.extend(cache.locate(h)?);
        }
        locations.sort_by_key(|r| r.start);
        assert_eq!(locations[0].start, 0);
        assert!(locations.windows(2).all(|w| w[0].end == w[1].start));
        Ok(())
    }

    #[test]
    fn test_status_and_stats() -> Result<()> {
        let cache = heap_cache(small_config())?;
        cache.store(&[7u8; 230])?;

        let status = cache.status();
        assert!(status.contains("MEMORY"));
        assert!(status.contains("memory#0 - 1 entries use 230 bytes"));
        assert!(status.contains("Fragment"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.live_bytes, 230);
        assert_eq!(stats.free.free_bytes(), 100_000 - 230);
        let json = serde_json::to_string(&stats).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        assert!(json.contains("\"entries\":1"));

        let text = cache.metrics_text()?;
        assert!(text.contains("directcache_operations_total"));
        assert_eq!(cache.metrics().operation_count("store", "ok"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_is_idempotent() -> Result<()> {
        let cache = heap_cache(small_config())?;
        let handle = cache.store(b"bye")?;

        cache.close().await;
        cache.close().await;

        assert!(!cache.is_running());
        assert_eq!(cache.size(), 0);
        assert!(matches!(cache.store(b"x"), Err(Error::Inactive)));
        assert!(matches!(cache.get(&handle), Err(Error::Inactive)));
        assert!(matches!(cache.release(&handle), Err(Error::Inactive)));
        assert!(matches!(cache.coalesce(), Err(Error::Inactive)));
        Ok(())
    }

    #[test]
    fn test_lock_timeout() -> Result<()> {
        let cache = heap_cache(CacheConfig {
            lock_wait_ms: 20,
            ..small_config()
        })?;
        let handle = cache.store(b"early")?;
        let exclusive = cache.gate.write();

        let started = Instant::now();
        assert!(matches!(cache.store(b"late"), Err(Error::LockTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(matches!(cache.get(&handle), Err(Error::LockTimeout(_))));
        assert!(matches!(cache.release(&handle), Err(Error::LockTimeout(_))));
        assert_eq!(cache.metrics().operation_count("get", "lock_timeout"), 1);
        assert_eq!(cache.metrics().operation_count("release", "lock_timeout"), 1);

        // The entry is untouched once the lock is free again
        drop(exclusive);
        assert_eq!(&cache.get(&handle)?[..], b"early");
        Ok(())
    }

    #[test]
    fn test_compaction_lock_timeout() -> Result<()> {
        let cache = heap_cache(CacheConfig {
            lock_wait_ms: 20,
            compaction_enabled: true,
            ..small_config()
        })?;
        let handle = cache.store(b"pinned")?;
        let shared = cache.gate.read();

        let started = Instant::now();
        assert!(matches!(cache.compact_buffer(0), Err(Error::LockTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(20));

        drop(shared);
        cache.compact_buffer(0)?;
        assert_eq!(&cache.get(&handle)?[..], b"pinned");
        Ok(())
    }

    #[test]
    fn test_start_needs_runtime() {
        let result = DirectCache::start(CacheConfig {
            total_memory: 4096,
            slice_size: 4096,
            capacity: 16,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
