//! Cache configuration
//!
//! Defaults mirror a 1 GiB cache made of a single region. Values can be
//! loaded from TOML or from `DIRECTCACHE_*` environment variables.

use crate::error::{Error, Result};
use crate::index::{MAX_INDEX_RANGE, MIN_INDEX_RANGE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Minimum time between two compactions
pub const COMPACTION_COOLDOWN: Duration = Duration::from_secs(10);

/// Fragmented share of a buffer above which it gets compacted
pub const COMPACTION_TRIGGER_RATIO: f64 = 0.8;

/// Binary byte units for sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    Kb,
    Mb,
    Gb,
}

impl ByteUnit {
    /// Convert `n` units into bytes
    pub const fn bytes(self, n: usize) -> usize {
        match self {
            ByteUnit::Kb => n << 10,
            ByteUnit::Mb => n << 20,
            ByteUnit::Gb => n << 30,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total addressable bytes across all regions
    pub total_memory: usize,
    /// Bytes per region; the last region may be smaller
    pub slice_size: usize,
    /// Maximum number of live entries
    pub capacity: usize,
    /// Free ranges shorter than this are fragments
    pub fragment_limit: usize,
    /// Reserve a scratch region and run the compaction loop
    pub compaction_enabled: bool,
    /// Period of the coalescing pass
    pub coalesce_interval_ms: u64,
    /// Run the coalescing pass in the background
    pub coalesce_enabled: bool,
    /// Fragment entry count that makes a buffer eligible for coalescing
    pub coalesce_min_ranges: usize,
    /// Fragment byte total that makes a buffer eligible for coalescing
    pub coalesce_min_bytes: usize,
    /// Target marker span of the free-range indexes
    pub index_range: usize,
    /// Polling period of the compaction loop
    pub compaction_tick_ms: u64,
    /// Bounded wait for a free slot
    pub slot_wait_ms: u64,
    /// Bounded wait for the facade lock
    pub lock_wait_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_memory: ByteUnit::Gb.bytes(1),
            slice_size: ByteUnit::Gb.bytes(1),
            capacity: 1_000_000,
            fragment_limit: ByteUnit::Mb.bytes(1),
            compaction_enabled: false,
            coalesce_interval_ms: 1000,
            coalesce_enabled: true,
            coalesce_min_ranges: 100,
            coalesce_min_bytes: ByteUnit::Mb.bytes(10),
            index_range: MIN_INDEX_RANGE,
            compaction_tick_ms: 1000,
            slot_wait_ms: 1000,
            lock_wait_ms: 10_000,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&input)
    }

    /// Load from environment variables
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `DIRECTCACHE_*` environment variables over `self`
    pub fn with_env_overrides(self) -> Self {
        Self {
            total_memory: env_or("DIRECTCACHE_TOTAL_MEMORY", self.total_memory),
            slice_size: env_or("DIRECTCACHE_SLICE_SIZE", self.slice_size),
            capacity: env_or("DIRECTCACHE_CAPACITY", self.capacity),
            fragment_limit: env_or("DIRECTCACHE_FRAGMENT_LIMIT", self.fragment_limit),
            compaction_enabled: env_or("DIRECTCACHE_COMPACTION", self.compaction_enabled),
            coalesce_interval_ms: env_or("DIRECTCACHE_COALESCE_INTERVAL_MS", self.coalesce_interval_ms),
            coalesce_enabled: env_or("DIRECTCACHE_COALESCE", self.coalesce_enabled),
            coalesce_min_ranges: env_or("DIRECTCACHE_COALESCE_MIN_RANGES", self.coalesce_min_ranges),
            coalesce_min_bytes: env_or("DIRECTCACHE_COALESCE_MIN_BYTES", self.coalesce_min_bytes),
            index_range: env_or("DIRECTCACHE_INDEX_RANGE", self.index_range),
            compaction_tick_ms: env_or("DIRECTCACHE_COMPACTION_TICK_MS", self.compaction_tick_ms),
            slot_wait_ms: env_or("DIRECTCACHE_SLOT_WAIT_MS", self.slot_wait_ms),
            lock_wait_ms: env_or("DIRECTCACHE_LOCK_WAIT_MS", self.lock_wait_ms),
        }
    }

    /// Check every field for a usable value
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("total_memory", self.total_memory as u64),
            ("slice_size", self.slice_size as u64),
            ("capacity", self.capacity as u64),
            ("fragment_limit", self.fragment_limit as u64),
            ("coalesce_interval_ms", self.coalesce_interval_ms),
            ("compaction_tick_ms", self.compaction_tick_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if !(MIN_INDEX_RANGE..=MAX_INDEX_RANGE).contains(&self.index_range) {
            return Err(Error::Config(format!(
                "index_range {} outside [{}, {}]",
                self.index_range, MIN_INDEX_RANGE, MAX_INDEX_RANGE
            )));
        }
        if self.capacity > u32::MAX as usize {
            return Err(Error::Config(format!("capacity {} exceeds slot space", self.capacity)));
        }
        if self.region_count() > u32::MAX as usize {
            return Err(Error::Config("too many regions".to_string()));
        }
        Ok(())
    }

    /// Number of addressable regions, `ceil(total_memory / slice_size)`
    pub fn region_count(&self) -> usize {
        if self.slice_size == 0 {
            return 0;
        }
        self.total_memory.div_ceil(self.slice_size)
    }

    /// Capacity of each addressable region, in order
    pub fn region_sizes(&self) -> Vec<usize> {
        let mut remaining = self.total_memory;
        let mut sizes = Vec::with_capacity(self.region_count());
        while remaining > 0 && self.slice_size > 0 {
            let size = remaining.min(self.slice_size);
            sizes.push(size);
            remaining -= size;
        }
        sizes
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_interval_ms)
    }

    pub fn compaction_tick(&self) -> Duration {
        Duration::from_millis(self.compaction_tick_ms)
    }

    pub fn slot_wait(&self) -> Duration {
        Duration::from_millis(self.slot_wait_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
