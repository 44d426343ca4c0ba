//! Compaction policy
//!
//! A tick compacts at most one buffer, and only when the previous run is
//! older than the cooldown. The first buffer (in index order) whose
//! fragmented share of capacity exceeds the trigger ratio is chosen.

use super::cache::DirectCache;
use crate::config::{COMPACTION_COOLDOWN, COMPACTION_TRIGGER_RATIO};
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of compacting one buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionReport {
    pub buffer: u32,
    /// Live entries in the buffer
    pub entries: usize,
    /// Entries whose start offset changed
    pub moved: usize,
    /// Bytes copied into the scratch region
    pub copied_bytes: usize,
    /// Start of the free tail after compaction
    pub packed: usize,
    pub elapsed: Duration,
}

/// Decides when and which buffer to compact
#[derive(Debug)]
pub struct CompactionDriver {
    cooldown: Duration,
    trigger_ratio: f64,
    last_run: Mutex<Option<Instant>>,
}

impl Default for CompactionDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionDriver {
    /// Driver with the fixed 10s cooldown and 0.8 trigger ratio
    pub fn new() -> Self {
        Self::with_policy(COMPACTION_COOLDOWN, COMPACTION_TRIGGER_RATIO)
    }

    pub fn with_policy(cooldown: Duration, trigger_ratio: f64) -> Self {
        Self {
            cooldown,
            trigger_ratio,
            last_run: Mutex::new(None),
        }
    }

    /// Check whether the cooldown window has passed
    pub fn is_due(&self) -> bool {
        self.last_run
            .lock()
            .map_or(true, |last| last.elapsed() >= self.cooldown)
    }

    /// First buffer whose fragment bytes exceed the trigger ratio
    pub fn pick(&self, cache: &DirectCache) -> Option<u32> {
        (0..cache.buffer_count() as u32).find(|&buffer| {
            cache
                .fragmentation(buffer)
                .is_some_and(|ratio| ratio > self.trigger_ratio)
        })
    }

    /// One tick: cooldown check, buffer pick, compaction
    ///
    /// A failed compaction still starts a new cooldown window.
    pub fn run_once(&self, cache: &DirectCache) -> Result<Option<CompactionReport>> {
        if !self.is_due() {
            return Ok(None);
        }
        let Some(buffer) = self.pick(cache) else {
            debug!(cache = cache.name(), "No buffer needs compaction");
            return Ok(None);
        };

        *self.last_run.lock() = Some(Instant::now());
        cache.compact_buffer(buffer).map(Some)
    }
}
