//! Write Barriers - SATB and Generational
//!
//! Every pointer store into a reference slot runs both barriers:
//!
//! 1. **SATB** (snapshot at the beginning): while marking is active the
//!    value being overwritten is pushed to the SATB queue unless it is
//!    already marked. Anything reachable when marking started is therefore
//!    either traced through the graph or through this queue.
//! 2. **Generational**: a store of a young pointer into a field of an old
//!    object records the field in the target region's remembered set.
//!
//! On the no-op path (marking inactive, young field or old value) both
//! barriers are a flag load and a comparison.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::queue::SegQueue;
use serde::Serialize;

use super::colored_ptr::ColoredPointer;
use super::remembered_set::RememberedSets;

/// SATB queue - overwritten pointers recorded while marking
///
/// Unbounded lock-free queue shared by all mutators; drained by marking
/// workers and finally by remark.
pub struct SatbQueue {
    queue: SegQueue<usize>,
    active: AtomicBool,
    enqueued: AtomicU64,
}

impl SatbQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            active: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Start recording (initial mark pause)
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Stop recording (remark pause)
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Record an object address
    pub fn push(&self, object: usize) {
        self.queue.push(object);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<usize> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard leftovers (a cycle never leaves entries behind)
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}

impl Default for SatbQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// SATB pre-write barrier
///
/// Enqueues `old_value` when marking is active and `is_marked` reports the
/// object unmarked. Returns true if the value was enqueued.
#[inline]
pub fn satb(
    queue: &SatbQueue,
    old_value: ColoredPointer,
    gc_active: bool,
    is_marked: impl FnOnce(usize) -> bool,
) -> bool {
    if !gc_active || old_value.is_null() {
        return false;
    }
    let object = old_value.address();
    if is_marked(object) {
        return false;
    }
    queue.push(object);
    true
}

/// Generational post-write barrier
///
/// Records `field_address` in the remembered set of the young region that
/// `new_value` points into. `young_region_of` maps an object address to its
/// region index when that region is young. Returns true if recorded.
#[inline]
pub fn generational(
    remembered_sets: &RememberedSets,
    field_address: usize,
    new_value: ColoredPointer,
    is_old_generation_field: bool,
    young_region_of: impl FnOnce(usize) -> Option<usize>,
) -> bool {
    if !is_old_generation_field || new_value.is_null() {
        return false;
    }
    match young_region_of(new_value.address()) {
        Some(region) => remembered_sets.record(region, field_address),
        None => false,
    }
}

/// Write barrier counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteBarrierStats {
    pub stores: u64,
    pub satb_enqueued: u64,
    pub remembered: u64,
}

/// WriteBarrier - the SATB queue plus barrier counters
pub struct WriteBarrier {
    satb: SatbQueue,
    stores: AtomicU64,
    satb_enqueued: AtomicU64,
    remembered: AtomicU64,
}

impl WriteBarrier {
    pub fn new() -> Self {
        Self {
            satb: SatbQueue::new(),
            stores: AtomicU64::new(0),
            satb_enqueued: AtomicU64::new(0),
            remembered: AtomicU64::new(0),
        }
    }

    pub fn satb_queue(&self) -> &SatbQueue {
        &self.satb
    }

    /// Pre-write half; call with the value about to be overwritten
    #[inline]
    pub fn pre_write(&self, old_value: ColoredPointer, is_marked: impl FnOnce(usize) -> bool) {
        self.stores.fetch_add(1, Ordering::Relaxed);
        if satb(&self.satb, old_value, self.satb.is_active(), is_marked) {
            self.satb_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Post-write half; call with the stored value
    #[inline]
    pub fn post_write(
        &self,
        remembered_sets: &RememberedSets,
        field_address: usize,
        new_value: ColoredPointer,
        is_old_generation_field: bool,
        young_region_of: impl FnOnce(usize) -> Option<usize>,
    ) {
        if generational(
            remembered_sets,
            field_address,
            new_value,
            is_old_generation_field,
            young_region_of,
        ) {
            self.remembered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> WriteBarrierStats {
        WriteBarrierStats {
            stores: self.stores.load(Ordering::Relaxed),
            satb_enqueued: self.satb_enqueued.load(Ordering::Relaxed),
            remembered: self.remembered.load(Ordering::Relaxed),
        }
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}
