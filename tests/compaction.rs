//! Background maintenance and compaction through the public API

use directcache::error::{Error, Result};
use bytes::Bytes;
use directcache::storage::{
    BufferDataStore, FreeRange, HeapRegionProvider, RawRegion, RegionProvider,
};
use directcache::{ByteUnit, CacheConfig, DirectCache, Handle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn maintained_config() -> CacheConfig {
    CacheConfig {
        total_memory: ByteUnit::Kb.bytes(64),
        slice_size: ByteUnit::Kb.bytes(64),
        capacity: 256,
        // Every free range is a fragment, so a mostly empty buffer qualifies
        fragment_limit: ByteUnit::Kb.bytes(128),
        compaction_enabled: true,
        compaction_tick_ms: 20,
        coalesce_interval_ms: 20,
        ..Default::default()
    }
}

async fn wait_for_compaction(cache: &DirectCache) -> bool {
    for _ in 0..200 {
        if cache.metrics().compaction_count() > 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Waits until `op` has ended with `status` at least once
async fn wait_for_outcome(cache: &DirectCache, op: &str, status: &str) -> bool {
    for _ in 0..200 {
        if cache.metrics().operation_count(op, status) > 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Region that can be read but refuses every write
struct ReadOnlyRegion(Box<dyn RawRegion>);

impl RawRegion for ReadOnlyRegion {
    fn capacity(&self) -> usize {
        self.0.capacity()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        self.0.read(offset, len)
    }

    fn write(&mut self, _offset: usize, _data: &[u8]) -> Result<()> {
        Err(Error::Region("region is read-only".to_string()))
    }
}

/// Heap provider whose regions turn read-only after the first `healthy`
///
/// Buffers are allocated before the scratch region, so `healthy` equal to
/// the buffer count leaves only the scratch broken.
#[derive(Debug)]
struct BrokenScratchProvider {
    inner: HeapRegionProvider,
    healthy: usize,
    handed_out: AtomicUsize,
}

impl BrokenScratchProvider {
    fn new(healthy: usize) -> Self {
        Self {
            inner: HeapRegionProvider::default(),
            healthy,
            handed_out: AtomicUsize::new(0),
        }
    }
}

impl RegionProvider for BrokenScratchProvider {
    fn allocate_region(&self, size: usize) -> Result<Box<dyn RawRegion>> {
        let region = self.inner.allocate_region(size)?;
        if self.handed_out.fetch_add(1, Ordering::SeqCst) < self.healthy {
            Ok(region)
        } else {
            Ok(Box::new(ReadOnlyRegion(region)))
        }
    }

    fn release_region(&self, region: Box<dyn RawRegion>) {
        self.inner.release_region(region);
    }

    fn name(&self) -> &'static str {
        "broken-scratch"
    }
}

#[tokio::test]
async fn test_maintenance_compacts_fragmented_buffer() -> Result<()> {
    let cache = DirectCache::start(maintained_config())?;

    // No await before the first tick, so the loops see the final layout
    let handles: Vec<Handle> = (0..16u8)
        .map(|i| cache.store(&vec![i; 64 + i as usize]))
        .collect::<Result<_>>()?;
    for h in handles.iter().step_by(2) {
        cache.release(h)?;
    }
    let mut survivors: Vec<Handle> = handles.iter().skip(1).step_by(2).copied().collect();

    assert!(wait_for_compaction(&cache).await, "compaction loop never ran");

    // Entries are packed in slot order
    survivors.sort_by_key(|h| h.slot());
    let mut packed = 0;
    for h in &survivors {
        let fill = (h.len() - 64) as u8;
        assert_eq!(cache.get(h)?.to_vec(), vec![fill; h.len()]);
        let location = cache.locate(h)?.expect("entry holds bytes");
        assert_eq!(location.start, packed, "{} was not packed", h);
        packed = location.end;
    }
    assert_eq!(
        cache.free_ranges(0)?,
        vec![FreeRange::new(0, packed, ByteUnit::Kb.bytes(64))]
    );

    cache.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_stops_maintenance() -> Result<()> {
    let cache = DirectCache::start(maintained_config())?;
    cache.store(b"short-lived")?;

    cache.close().await;
    assert!(!cache.is_running());
    assert_eq!(cache.size(), 0);
    assert!(matches!(cache.start_maintenance(), Err(Error::Inactive)));
    assert!(matches!(cache.compact_buffer(0), Err(Error::Inactive)));

    // Nothing runs against the closed cache afterwards
    let compactions = cache.metrics().compaction_count();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.metrics().compaction_count(), compactions);
    Ok(())
}

#[tokio::test]
async fn test_dropping_cache_ends_loops() -> Result<()> {
    let cache = DirectCache::start(maintained_config())?;
    let weak = Arc::downgrade(&cache);
    drop(cache);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test]
fn test_compaction_keeps_handles_valid_across_rounds() -> Result<()> {
    let cache = DirectCache::with_provider(
        CacheConfig {
            total_memory: ByteUnit::Kb.bytes(256),
            slice_size: ByteUnit::Kb.bytes(128),
            capacity: 1024,
            fragment_limit: ByteUnit::Kb.bytes(2),
            compaction_enabled: true,
            ..Default::default()
        },
        Arc::new(HeapRegionProvider::default()),
    )?;

    let mut live: Vec<(Handle, Vec<u8>)> = Vec::new();
    for round in 0..4usize {
        for i in 0..100usize {
            let payload: Vec<u8> = (0..(i % 37) + 1).map(|b| (b + round) as u8).collect();
            live.push((cache.store(&payload)?, payload));
        }
        // Drop every third entry, then pack both buffers
        let mut index = 0;
        live.retain(|(handle, _)| {
            index += 1;
            index % 3 != 0 || cache.release(handle).is_err()
        });
        for buffer in 0..2 {
            cache.compact_buffer(buffer)?;
        }

        for (handle, payload) in &live {
            assert_eq!(&cache.get(handle)?[..], &payload[..]);
        }
    }
    assert_eq!(cache.size(), live.len());
    Ok(())
}

#[tokio::test]
async fn test_failed_compaction_tick_keeps_loop_running() -> Result<()> {
    let cache = Arc::new(DirectCache::with_provider(
        CacheConfig {
            coalesce_enabled: false,
            ..maintained_config()
        },
        Arc::new(BrokenScratchProvider::new(1)),
    )?);
    let handle = cache.store(b"survivor")?;
    cache.start_maintenance()?;

    // The first compaction fails writing into the scratch region
    assert!(
        wait_for_outcome(&cache, "compaction", "region").await,
        "compaction never failed"
    );
    // Later ticks still run, sitting out the cooldown
    assert!(
        wait_for_outcome(&cache, "compaction", "ok").await,
        "compaction loop stopped after a failed tick"
    );
    assert!(cache.is_running());
    assert_eq!(cache.metrics().compaction_count(), 0);
    assert_eq!(&cache.get(&handle)?[..], b"survivor");

    cache.close().await;
    Ok(())
}

#[test]
fn test_scratch_must_cover_buffer() {
    let provider = Arc::new(HeapRegionProvider::default());
    let store = BufferDataStore::new(provider, &[4096], Some(1024)).expect("regions");

    assert!(matches!(store.repack(0, &[]), Err(Error::Region(_))));

    let without_scratch = BufferDataStore::new(Arc::new(HeapRegionProvider::default()), &[4096], None)
        .expect("regions");
    assert!(!without_scratch.has_scratch());
    assert!(matches!(without_scratch.repack(0, &[]), Err(Error::Region(_))));
}
