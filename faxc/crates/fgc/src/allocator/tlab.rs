//! TLAB - Thread-Local Allocation Buffer
//!
//! TLAB reduces contention in multi-threaded allocation.
//! Each thread gets a private buffer for bump-pointer allocation.
//!
//! ## How it works
//!
//! 1. Thread requests a slice from the heap's current small region
//! 2. Thread allocates from its own slice (bump pointer, no shared state)
//! 3. Slice exhausted: retire and refill if the leftover tail is within the
//!    waste limit, otherwise allocate this object on the shared slow path
//! 4. Initial mark: the collector retires every TLAB so post-mark objects
//!    land in regions stamped with the new cycle
//!
//! ## Adaptive Sizing
//!
//! A thread starts with `tlab_min_size` and doubles on every refill up to
//! `tlab_max_size`; busy allocators quickly reach large buffers while idle
//! threads waste little.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::heap::Heap;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// This thread's TLAB per manager (one manager per collector instance)
    static TLAB_CACHE: RefCell<Vec<(u64, Arc<Mutex<Tlab>>)>> = RefCell::new(Vec::new());
}

/// TLAB - Thread-Local Allocation Buffer
///
/// Invariant: `start <= top <= limit`.
#[derive(Debug)]
pub struct Tlab {
    start: usize,
    top: usize,
    limit: usize,

    /// Size requested on the next refill
    next_size: usize,

    refills: u64,
    allocations: u64,
    wasted: u64,
}

impl Tlab {
    /// Empty TLAB; the first allocation refills it
    pub fn new(initial_size: usize) -> Self {
        Self {
            start: 0,
            top: 0,
            limit: 0,
            next_size: initial_size,
            refills: 0,
            allocations: 0,
            wasted: 0,
        }
    }

    /// Bump-allocate `size` bytes; `None` when the buffer is too small
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if self.limit - self.top < size {
            return None;
        }
        let address = self.top;
        self.top += size;
        self.allocations += 1;
        Some(address)
    }

    /// Replace the buffer with a fresh slice able to hold `min_size` bytes
    ///
    /// On failure the old buffer is kept and the caller falls back to the
    /// slow path or a collection.
    pub fn refill(&mut self, heap: &Heap, min_size: usize, max_size: usize) -> Result<()> {
        let desired = self.next_size.max(min_size);
        let (start, len) = heap.allocate_tlab(min_size, desired)?;

        self.retire();
        self.start = start;
        self.top = start;
        self.limit = start + len;
        self.next_size = (self.next_size * 2).min(max_size);
        self.refills += 1;
        Ok(())
    }

    /// Give up the remaining space; returns the wasted tail
    pub fn retire(&mut self) -> usize {
        let wasted = self.remaining();
        self.wasted += wasted as u64;
        self.start = self.top;
        self.limit = self.top;
        wasted
    }

    /// Whether the tail is small enough to throw away on refill
    pub fn within_waste_limit(&self, waste_ratio: f64) -> bool {
        let capacity = (self.limit - self.start).max(self.next_size);
        (self.remaining() as f64) <= capacity as f64 * waste_ratio
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.top
    }

    pub fn refills(&self) -> u64 {
        self.refills
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn wasted(&self) -> u64 {
        self.wasted
    }

    pub fn next_size(&self) -> usize {
        self.next_size
    }
}

/// Result of a TLAB allocation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlabAllocation {
    /// Served from the TLAB; header address
    Allocated(usize),
    /// TLAB kept (tail too large to waste); use the shared slow path
    SlowPath,
}

/// TlabManager - owns every thread's TLAB for one collector
pub struct TlabManager {
    id: u64,
    min_size: usize,
    max_size: usize,
    waste_ratio: f64,

    tlabs: Mutex<IndexMap<ThreadId, Arc<Mutex<Tlab>>>>,

    fast_hits: AtomicU64,
    misses: AtomicU64,
    refills: AtomicU64,
}

impl TlabManager {
    pub fn new(min_size: usize, max_size: usize, waste_ratio: f64) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            min_size,
            max_size,
            waste_ratio,
            tlabs: Mutex::new(IndexMap::new()),
            fast_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refills: AtomicU64::new(0),
        }
    }

    /// Largest object served by TLABs
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Run `f` on the calling thread's TLAB
    ///
    /// The per-TLAB lock is only contended while the collector retires
    /// buffers inside a pause.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Tlab) -> R) -> R {
        let tlab = TLAB_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some((_, tlab)) = cache.iter().find(|(id, _)| *id == self.id) {
                return Arc::clone(tlab);
            }
            let tlab = Arc::new(Mutex::new(Tlab::new(self.min_size)));
            self.tlabs
                .lock()
                .insert(std::thread::current().id(), Arc::clone(&tlab));
            cache.push((self.id, Arc::clone(&tlab)));
            tlab
        });
        let mut guard = tlab.lock();
        f(&mut guard)
    }

    /// Allocate `size` bytes from the calling thread's TLAB, refilling it
    /// from `heap` when the tail is within the waste limit
    pub fn allocate(&self, heap: &Heap, size: usize) -> Result<TlabAllocation> {
        self.with_current(|tlab| {
            if let Some(address) = tlab.allocate(size) {
                self.fast_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(TlabAllocation::Allocated(address));
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            if !tlab.within_waste_limit(self.waste_ratio) {
                return Ok(TlabAllocation::SlowPath);
            }

            tlab.refill(heap, size.max(self.min_size), self.max_size)?;
            self.refills.fetch_add(1, Ordering::Relaxed);
            Ok(tlab
                .allocate(size)
                .map(TlabAllocation::Allocated)
                .unwrap_or(TlabAllocation::SlowPath))
        })
    }

    /// Retire every thread's buffer; returns the total wasted bytes
    ///
    /// Also forgets TLABs of threads that have exited.
    pub fn retire_all(&self) -> usize {
        let mut tlabs = self.tlabs.lock();
        tlabs.retain(|_, tlab| Arc::strong_count(tlab) > 1);
        tlabs.values().map(|tlab| tlab.lock().retire()).sum()
    }

    pub fn active_count(&self) -> usize {
        self.tlabs.lock().len()
    }

    /// Fraction of allocation attempts served by the bump fast path
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.fast_hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn total_refills(&self) -> u64 {
        self.refills.load(Ordering::Relaxed)
    }

    pub(crate) fn record_bypass(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for TlabManager {
    fn drop(&mut self) {
        let id = self.id;
        let _ = TLAB_CACHE.try_with(|cache| {
            if let Ok(mut cache) = cache.try_borrow_mut() {
                cache.retain(|(owner, _)| *owner != id);
            }
        });
    }
}
