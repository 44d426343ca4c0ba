//! Slot table binding small integers to live handles

use super::handle::Handle;
use super::range::FreeRange;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Fixed-capacity table of slot records with a recycling pool
///
/// A slot goes back to the pool only after its record was unbound.
/// Generations are never reused within a table.
#[derive(Debug)]
pub struct SlotTable {
    records: Vec<Mutex<Option<Handle>>>,
    pool: Mutex<Vec<u32>>,
    available: Condvar,
    live: AtomicUsize,
    next_generation: AtomicU64,
}

impl SlotTable {
    /// Create a table with `capacity` free slots
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > u32::MAX as usize {
            return Err(Error::InvalidArgument(format!("slot capacity {} out of range", capacity)));
        }

        Ok(Self {
            records: (0..capacity).map(|_| Mutex::new(None)).collect(),
            pool: Mutex::new((0..capacity as u32).collect()),
            available: Condvar::new(),
            live: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Take a random free slot, waiting at most `wait` for one
    pub fn acquire(&self, wait: Duration) -> Result<u32> {
        let mut pool = self.pool.lock();
        if pool.is_empty() {
            self.available
                .wait_while_for(&mut pool, |pool| pool.is_empty(), wait);
        }
        if pool.is_empty() {
            return Err(Error::CapacityExhausted {
                capacity: self.records.len(),
                waited: wait,
            });
        }

        let pick = rand::thread_rng().gen_range(0..pool.len());
        Ok(pool.swap_remove(pick))
    }

    /// Return an unbound slot to the pool
    pub fn give_back(&self, slot: u32) {
        self.pool.lock().push(slot);
        self.available.notify_one();
    }

    /// Bind `slot` to `range` under a fresh generation
    pub fn bind(&self, slot: u32, range: FreeRange) -> Result<Handle> {
        self.bind_with(slot, |generation| Handle::new(slot, generation, range))
    }

    /// Bind `slot` to a zero-length payload under a fresh generation
    pub fn bind_empty(&self, slot: u32) -> Result<Handle> {
        self.bind_with(slot, |generation| Handle::empty(slot, generation))
    }

    fn bind_with(&self, slot: u32, make: impl FnOnce(u64) -> Handle) -> Result<Handle> {
        let record = self.record(slot)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = make(generation);

        let mut record = record.lock();
        if record.is_some() {
            return Err(Error::InvalidArgument(format!("slot {} is already bound", slot)));
        }
        *record = Some(handle);
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    /// Current binding for `handle`, with up-to-date location
    pub fn resolve(&self, handle: &Handle) -> Result<Handle> {
        let record = self.record(handle.slot).map_err(|_| invalid(handle))?;
        match *record.lock() {
            Some(bound) if bound.same_binding(handle) => Ok(bound),
            _ => Err(invalid(handle)),
        }
    }

    /// Clear the binding for `handle` and return it
    ///
    /// The slot stays out of the pool until [`SlotTable::give_back`].
    pub fn unbind(&self, handle: &Handle) -> Result<Handle> {
        let record = self.record(handle.slot).map_err(|_| invalid(handle))?;
        let mut record = record.lock();
        let bound = match *record {
            Some(bound) if bound.same_binding(handle) => bound,
            _ => return Err(invalid(handle)),
        };
        *record = None;
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(bound)
    }

    /// Move the binding of `slot` to a new start offset
    pub fn relocate(&self, slot: u32, start: usize) -> Result<()> {
        let mut record = self.record(slot)?.lock();
        match record.as_mut() {
            Some(bound) => {
                bound.start = start;
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!("slot {} is not bound", slot))),
        }
    }

    /// Live handles holding bytes in `buffer`, in slot order
    pub fn bound_in(&self, buffer: u32) -> Vec<Handle> {
        self.records
            .iter()
            .filter_map(|record| *record.lock())
            .filter(|handle| handle.buffer == buffer && !handle.is_empty())
            .collect()
    }

    /// Unbind every slot and refill the pool
    pub fn clear(&self) {
        for record in &self.records {
            *record.lock() = None;
        }
        let mut pool = self.pool.lock();
        *pool = (0..self.records.len() as u32).collect();
        self.live.store(0, Ordering::Release);
        self.available.notify_all();
    }

    /// Number of bound slots
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Slots currently waiting in the pool
    pub fn free_count(&self) -> usize {
        self.pool.lock().len()
    }

    fn record(&self, slot: u32) -> Result<&Mutex<Option<Handle>>> {
        self.records
            .get(slot as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("slot {} out of range", slot)))
    }
}

fn invalid(handle: &Handle) -> Error {
    Error::InvalidHandle(handle.to_string())
}
