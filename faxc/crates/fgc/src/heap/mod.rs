//! Heap Management Module - Region-Based Memory Management
//!
//! The heap is a single reservation of `max_heap_size` bytes split into a
//! fixed pool of equally sized regions at init. Regions move between the
//! free set and the used set under one narrow lock; everything else about a
//! region (bump pointer, state, live bytes) is atomic.
//!
//! Allocation entry points:
//! - `allocate_tlab` - carve a slice for a thread-local buffer (Small regions)
//! - `allocate_medium` - shared bump allocation for objects above the TLAB
//!   limit; their headers live in the region's side table, so the region
//!   holds payload bytes only
//! - `allocate_large` - contiguous run of regions for one humongous object
//! - `reserve_relocation` - destination slices for the relocation phase
//!
//! Lock order: `shared` before `sets`.

pub mod region;
pub mod virtual_memory;

pub use region::{Generation, Region, RegionBitmaps, RegionState, SizeClass};
pub use virtual_memory::VirtualMemory;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::GcConfig;
use crate::error::{FgcError, Result};
use crate::object::header::{self, ObjectHeader, HEADER_SIZE, OBJECT_ALIGNMENT};
use crate::util::Alignment;

/// Free/used bookkeeping; every region index is in exactly one set
struct RegionSets {
    free: BTreeSet<usize>,
    used: IndexSet<usize>,
    /// Regions whose pages are currently backed by the OS
    resident: Vec<bool>,
    resident_count: usize,
}

/// Regions currently serving shared bump allocation
#[derive(Default)]
struct SharedAllocators {
    tlab: Option<usize>,
    medium: Option<usize>,
    survivor: Option<usize>,
    promotion: Option<usize>,
}

/// Heap - owner of every region
///
/// Heap Structure:
/// ```text
/// ┌─────────────────────────────────────────────────────┐
/// │                      Heap                            │
/// │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌─────────┐ │
/// │  │ Region 0 │ │ Region 1 │ │ Region 2 │ │   ...   │ │
/// │  │ (Small)  │ │ (Medium) │ │ (Large)  │ │         │ │
/// │  └──────────┘ └──────────┘ └──────────┘ └─────────┘ │
/// └─────────────────────────────────────────────────────┘
/// ```
pub struct Heap {
    config: Arc<GcConfig>,
    memory: VirtualMemory,
    region_size: usize,
    regions: Box<[Region]>,

    sets: Mutex<RegionSets>,
    shared: Mutex<SharedAllocators>,

    /// Bytes of regions outside the free set
    committed: AtomicUsize,
    /// Bytes handed out by bump allocation in non-free regions
    used: AtomicUsize,
    /// Cycle stamped on newly activated regions
    cycle: AtomicU64,

    total_allocated: AtomicU64,
}

impl Heap {
    /// Reserve the heap and build the region pool
    pub fn new(config: Arc<GcConfig>) -> Result<Self> {
        config.validate()?;

        let region_size = config.region_size;
        let region_count = config.region_count();
        let memory = VirtualMemory::reserve(region_count * region_size, region_size)?;
        let base = memory.base_address();

        let granule = side_header_granule(&config);
        let regions: Box<[Region]> = (0..region_count)
            .map(|index| Region::new(index, base + index * region_size, region_size, granule))
            .collect();

        log::debug!(
            "Heap initialized: {} regions of {} bytes at {:#x}",
            region_count,
            region_size,
            base
        );

        Ok(Self {
            config,
            memory,
            region_size,
            regions,
            sets: Mutex::new(RegionSets {
                free: (0..region_count).collect(),
                used: IndexSet::new(),
                resident: vec![false; region_count],
                resident_count: 0,
            }),
            shared: Mutex::new(SharedAllocators::default()),
            committed: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            cycle: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
        })
    }

    // ------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn base_address(&self) -> usize {
        self.memory.base_address()
    }

    pub fn end_address(&self) -> usize {
        self.memory.end_address()
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn max_size(&self) -> usize {
        self.regions.len() * self.region_size
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address() && address < self.end_address()
    }

    /// Region whose address range holds `address`
    pub fn region_of(&self, address: usize) -> Option<&Region> {
        if !self.contains(address) {
            return None;
        }
        self.regions
            .get((address - self.base_address()) / self.region_size)
    }

    /// Region owning the object at `object`; large continuations resolve
    /// to their head region
    pub fn object_region(&self, object: usize) -> Option<&Region> {
        let region = self.region_of(object)?;
        if region.is_large_continuation() {
            self.regions.get(region.head())
        } else {
            Some(region)
        }
    }

    /// Header of the object whose payload starts at `object`
    ///
    /// # Safety
    /// `object` must be an initialized object in a region that holds objects.
    pub unsafe fn header(&self, object: usize) -> &ObjectHeader {
        match self.region_of(object).and_then(|region| region.side_header(object)) {
            Some(header) => header,
            None => ObjectHeader::of(object),
        }
    }

    // ------------------------------------------------------------------
    // Cycle stamping
    // ------------------------------------------------------------------

    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    pub(crate) fn set_cycle(&self, cycle: u64) {
        self.cycle.store(cycle, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Region allocation
    // ------------------------------------------------------------------

    /// Take one empty region for `size_class` in `generation`
    pub fn allocate_region(&self, size_class: SizeClass, generation: Generation) -> Result<&Region> {
        let index = self.take_run(1, size_class, generation)?;
        Ok(&self.regions[index])
    }

    fn take_run(&self, count: usize, size_class: SizeClass, generation: Generation) -> Result<usize> {
        let mut sets = self.sets.lock();

        let committed = self.committed.load(Ordering::Acquire);
        if committed + count * self.region_size > self.max_size() {
            return Err(FgcError::RegionAllocationFailed {
                reason: format!(
                    "committing {} more regions would exceed max heap size {}",
                    count,
                    self.max_size()
                ),
            });
        }

        let head = Self::find_free_run(&sets.free, count).ok_or_else(|| {
            FgcError::RegionAllocationFailed {
                reason: format!(
                    "no run of {} free regions ({} free)",
                    count,
                    sets.free.len()
                ),
            }
        })?;

        let cycle = self.cycle();
        for index in head..head + count {
            sets.free.remove(&index);
            sets.used.insert(index);
            if !sets.resident[index] {
                sets.resident[index] = true;
                sets.resident_count += 1;
            }
            self.regions[index].activate(size_class, generation, cycle, head, count)?;
        }
        self.committed
            .fetch_add(count * self.region_size, Ordering::AcqRel);

        log::trace!(
            "Activated regions {}..{} as {:?}/{:?}",
            head,
            head + count,
            size_class,
            generation
        );
        Ok(head)
    }

    /// Lowest index starting `count` consecutive free regions
    fn find_free_run(free: &BTreeSet<usize>, count: usize) -> Option<usize> {
        let mut run_start = None;
        let mut run_len = 0;
        let mut previous = None;

        for &index in free {
            if previous.map_or(false, |p: usize| p + 1 == index) {
                run_len += 1;
            } else {
                run_start = Some(index);
                run_len = 1;
            }
            if run_len == count {
                return run_start;
            }
            previous = Some(index);
        }
        None
    }

    /// Carve a TLAB slice of `min..=desired` bytes
    pub fn allocate_tlab(&self, min: usize, desired: usize) -> Result<(usize, usize)> {
        let mut shared = self.shared.lock();

        if let Some(index) = shared.tlab {
            if let Some(slice) = self.regions[index].bump_range(min, desired) {
                self.used.fetch_add(slice.1, Ordering::Relaxed);
                return Ok(slice);
            }
        }

        let region = self.allocate_region(SizeClass::Small, Generation::Young)?;
        shared.tlab = Some(region.index());
        let slice = region
            .bump_range(min, desired)
            .ok_or_else(|| FgcError::RegionAllocationFailed {
                reason: format!("TLAB of {} bytes does not fit a region", min),
            })?;
        self.used.fetch_add(slice.1, Ordering::Relaxed);
        Ok(slice)
    }

    /// Shared bump allocation of an object of `size` bytes (header
    /// included); returns the object address. Only the payload is bumped,
    /// the header goes to the region's side table.
    pub fn allocate_medium(&self, size: usize) -> Result<usize> {
        if size <= self.config.tlab_max_size {
            return Err(FgcError::InvalidArgument(format!(
                "medium object of {} bytes is within the TLAB limit {}",
                size, self.config.tlab_max_size
            )));
        }
        let payload = size - HEADER_SIZE;
        let mut shared = self.shared.lock();
        let object = self.bump_shared(&mut shared.medium, payload, Generation::Young, true)?;
        self.total_allocated.fetch_add(payload as u64, Ordering::Relaxed);
        Ok(object)
    }

    /// Allocate a humongous object over whole regions; returns the header
    /// address
    pub fn allocate_large(&self, size: usize) -> Result<usize> {
        let count = Alignment::blocks(size, self.region_size);
        let head = self.take_run(count, SizeClass::Large, Generation::Young)?;
        let region = &self.regions[head];
        region.set_large_top(region.start() + size);
        self.used.fetch_add(size, Ordering::Relaxed);
        self.total_allocated.fetch_add(size as u64, Ordering::Relaxed);
        Ok(region.start())
    }

    /// Reserve a contiguous destination slice for relocated objects
    pub fn reserve_relocation(&self, generation: Generation, bytes: usize) -> Result<usize> {
        if bytes > self.region_size {
            return Err(FgcError::InvalidArgument(format!(
                "relocation slice of {} bytes exceeds region size",
                bytes
            )));
        }
        let mut shared = self.shared.lock();
        let current = match generation {
            Generation::Young => &mut shared.survivor,
            Generation::Old => &mut shared.promotion,
        };
        self.bump_shared(current, bytes, generation, false)
    }

    fn bump_shared(
        &self,
        current: &mut Option<usize>,
        size: usize,
        generation: Generation,
        side_headers: bool,
    ) -> Result<usize> {
        if let Some(index) = *current {
            if let Some(address) = self.regions[index].bump(size) {
                self.used.fetch_add(size, Ordering::Relaxed);
                return Ok(address);
            }
        }

        let region = self.allocate_region(SizeClass::Medium, generation)?;
        if side_headers {
            region.enable_side_headers();
        }
        *current = Some(region.index());
        let address = region
            .bump(size)
            .ok_or_else(|| FgcError::RegionAllocationFailed {
                reason: format!("{} bytes do not fit a region", size),
            })?;
        self.used.fetch_add(size, Ordering::Relaxed);
        Ok(address)
    }

    /// Stop bump-allocating from every shared region
    pub(crate) fn retire_allocation_regions(&self) {
        *self.shared.lock() = SharedAllocators::default();
    }

    /// Write a fresh header for the object at `object` and publish its start
    ///
    /// # Safety
    /// The object's payload (and its inline header, outside side-header
    /// regions) must be freshly allocated heap memory owned by the caller.
    pub(crate) unsafe fn initialize_object(
        &self,
        object: usize,
        size: usize,
        ref_slots: usize,
        zero_payload: bool,
    ) {
        let zeroed = if zero_payload {
            size - HEADER_SIZE
        } else {
            ref_slots * header::WORD_SIZE
        };
        header::zero_bytes(object, zeroed);
        let region = self.region_of(object);
        match region.and_then(|region| region.side_header(object)) {
            Some(side) => side.reset(size, ref_slots),
            None => ObjectHeader::initialize(object - HEADER_SIZE, size, ref_slots),
        }
        if let Some(region) = region {
            region.record_object_start(object);
        }
    }

    pub(crate) fn note_allocation(&self, size: usize) {
        self.total_allocated.fetch_add(size as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------

    /// Return a region (a whole span for a large head) to the free set.
    /// Returns the bytes reclaimed.
    pub fn release_region(&self, index: usize) -> Result<usize> {
        let head = &self.regions[index];
        let span = if head.size_class() == SizeClass::Large {
            head.span()
        } else {
            1
        };

        let mut sets = self.sets.lock();
        let mut reclaimed = 0;
        for i in index..index + span {
            let region = &self.regions[i];
            let bytes = region.used_bytes();
            region.release()?;
            reclaimed += bytes;

            sets.used.swap_remove(&i);
            sets.free.insert(i);

            let resident_bytes = sets.resident_count * self.region_size;
            if sets.resident[i] && resident_bytes > self.config.min_heap_size {
                self.memory.uncommit(region.start(), self.region_size)?;
                sets.resident[i] = false;
                sets.resident_count -= 1;
            }
        }
        self.committed
            .fetch_sub(span * self.region_size, Ordering::AcqRel);
        self.used.fetch_sub(reclaimed, Ordering::AcqRel);
        Ok(reclaimed)
    }

    /// Used regions whose live ratio is below `threshold`, sparsest first
    ///
    /// Regions allocated during `cycle`, large spans and pinned regions are
    /// never candidates; neither are regions with nothing live (sweep frees
    /// them without copying).
    pub fn reclaim_candidates(&self, threshold: f64, young_only: bool, cycle: u64) -> Vec<usize> {
        let mut candidates: Vec<usize> = self
            .used_region_indices()
            .into_iter()
            .filter(|&index| {
                let region = &self.regions[index];
                region.state() == RegionState::Used
                    && region.size_class() != SizeClass::Large
                    && !region.allocated_during(cycle)
                    && region.live_bytes() > 0
                    && region.live_ratio() < threshold
                    && (!young_only || region.generation() == Generation::Young)
            })
            .collect();
        candidates.sort_by_key(|&index| self.regions[index].live_bytes());
        candidates
    }

    /// Concurrent sweep of cycle `cycle`
    ///
    /// - traced regions with no live bytes (and dead large spans) are freed
    /// - regions relocated by an earlier cycle are freed once no stale
    ///   reference can remain: young ones after any later cycle, old ones
    ///   after a later full cycle
    /// - every other traced region publishes its live estimate and clears
    ///   its marks
    ///
    /// Regions allocated during `cycle` are left alone.
    pub fn sweep(&self, cycle: u64, full: bool) -> Result<SweepResult> {
        let mut result = SweepResult::default();

        for index in self.used_region_indices() {
            let region = &self.regions[index];
            if region.allocated_during(cycle) || region.is_large_continuation() {
                continue;
            }
            let traced = full || region.generation() == Generation::Young;

            let free = match region.state() {
                RegionState::Used => traced && region.live_bytes() == 0,
                RegionState::Relocated => {
                    region.relocated_cycle() < cycle && (region.relocated_young() || full)
                }
                RegionState::Relocating => {
                    return Err(FgcError::invalid_state(
                        "no relocating region at sweep",
                        format!("region {} relocating", index),
                    ))
                }
                RegionState::Pinned | RegionState::Empty => false,
            };

            if free {
                let span = region.span();
                let start = region.start();
                result.reclaimed_bytes += self.release_region(index)?;
                result.freed_regions.extend(index..index + span);
                result.freed_ranges.push((start, start + span * self.region_size));
            } else if traced {
                region.finish_marking();
            }
        }

        log::debug!(
            "Sweep of cycle {} freed {} regions ({} bytes)",
            cycle,
            result.freed_regions.len(),
            result.reclaimed_bytes
        );
        Ok(result)
    }

    pub fn used_region_indices(&self) -> Vec<usize> {
        self.sets.lock().used.iter().copied().collect()
    }

    pub fn free_region_count(&self) -> usize {
        self.sets.lock().free.len()
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes obtainable from free regions
    pub fn available_bytes(&self) -> usize {
        self.max_size().saturating_sub(self.committed_bytes())
    }

    /// Used bytes over maximum heap size
    pub fn occupancy(&self) -> f64 {
        self.used_bytes() as f64 / self.max_size() as f64
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            max_bytes: self.max_size(),
            committed_bytes: self.committed_bytes(),
            used_bytes: self.used_bytes(),
            region_size: self.region_size,
            ..HeapStats::default()
        };

        for region in self.regions.iter() {
            match region.state() {
                RegionState::Empty => {
                    stats.free_regions += 1;
                    continue;
                }
                RegionState::Used => stats.used_regions += 1,
                RegionState::Relocating => stats.relocating_regions += 1,
                RegionState::Relocated => stats.relocated_regions += 1,
                RegionState::Pinned => stats.pinned_regions += 1,
            }
            match region.generation() {
                Generation::Young => stats.young_regions += 1,
                Generation::Old => stats.old_regions += 1,
            }
            if region.size_class() == SizeClass::Large {
                stats.large_regions += 1;
            }
        }
        stats.occupancy = stats.used_bytes as f64 / stats.max_bytes as f64;
        stats
    }

    /// Check the free/used partition against region states
    pub fn verify(&self) -> Result<()> {
        let sets = self.sets.lock();
        for region in self.regions.iter() {
            let index = region.index();
            let in_free = sets.free.contains(&index);
            let in_used = sets.used.contains(&index);
            let empty = region.state() == RegionState::Empty;

            if in_free == in_used || in_free != empty {
                return Err(FgcError::concurrent_modification(format!(
                    "region {} state {:?} free={} used={}",
                    index,
                    region.state(),
                    in_free,
                    in_used
                )));
            }
        }

        let committed = sets.used.len() * self.region_size;
        if committed != self.committed_bytes() || committed > self.max_size() {
            return Err(FgcError::concurrent_modification(format!(
                "committed bytes {} disagree with {} used regions",
                self.committed_bytes(),
                sets.used.len()
            )));
        }
        Ok(())
    }

    /// Unmap the heap; all object addresses become invalid
    pub(crate) fn release_memory(&self) {
        self.memory.release();
    }
}

/// Regions returned to the free list by one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub freed_regions: Vec<usize>,
    /// Address ranges of the freed regions
    pub freed_ranges: Vec<(usize, usize)>,
    pub reclaimed_bytes: usize,
}

/// Point-in-time heap statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeapStats {
    pub max_bytes: usize,
    pub committed_bytes: usize,
    pub used_bytes: usize,
    pub region_size: usize,
    pub free_regions: usize,
    pub used_regions: usize,
    pub relocating_regions: usize,
    pub relocated_regions: usize,
    pub pinned_regions: usize,
    pub young_regions: usize,
    pub old_regions: usize,
    pub large_regions: usize,
    pub occupancy: f64,
}

/// Side-table slot width: the largest power of two not above the smallest
/// medium payload, so two medium objects never share a slot
fn side_header_granule(config: &GcConfig) -> usize {
    let min_payload = config
        .tlab_max_size
        .saturating_sub(HEADER_SIZE)
        .max(OBJECT_ALIGNMENT);
    1 << (usize::BITS - 1 - min_payload.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    fn heap(max: usize) -> Heap {
        let config = GcConfig {
            min_heap_size: 2 * MB,
            max_heap_size: max,
            ..GcConfig::default()
        };
        Heap::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn test_region_pool() {
        let heap = heap(8 * MB);
        assert_eq!(heap.regions().len(), 4);
        assert_eq!(heap.free_region_count(), 4);
        assert_eq!(heap.base_address() % (2 * MB), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn test_out_of_regions() {
        let heap = heap(4 * MB);
        heap.allocate_region(SizeClass::Medium, Generation::Young).unwrap();
        heap.allocate_region(SizeClass::Medium, Generation::Old).unwrap();
        let err = heap
            .allocate_region(SizeClass::Medium, Generation::Young)
            .unwrap_err();
        assert!(matches!(err, FgcError::RegionAllocationFailed { .. }));
        assert_eq!(heap.committed_bytes(), 4 * MB);
        heap.verify().unwrap();
    }

    #[test]
    fn test_medium_allocation_fills_regions() {
        let heap = heap(8 * MB);
        let size = MB + HEADER_SIZE;
        let a = heap.allocate_medium(size).unwrap();
        let b = heap.allocate_medium(size).unwrap();
        let c = heap.allocate_medium(size).unwrap();
        let d = heap.allocate_medium(size).unwrap();
        assert_eq!(b, a + MB);
        assert_eq!(d, c + MB);
        assert_eq!(heap.region_of(a).unwrap().index(), heap.region_of(b).unwrap().index());
        assert_ne!(heap.region_of(a).unwrap().index(), heap.region_of(c).unwrap().index());
        assert!(heap.region_of(a).unwrap().has_side_headers());
        assert_eq!(heap.used_bytes(), 4 * MB);
        assert_eq!(heap.stats().used_regions, 2);
    }

    #[test]
    fn test_medium_allocation_rejects_tlab_sizes() {
        let heap = heap(8 * MB);
        let limit = heap.config().tlab_max_size;
        assert!(matches!(
            heap.allocate_medium(limit),
            Err(FgcError::InvalidArgument(_))
        ));
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn test_side_header_granule_separates_medium_objects() {
        let config = GcConfig::default();
        let granule = side_header_granule(&config);
        assert_eq!(granule, config.tlab_max_size / 2);

        let tiny = GcConfig {
            tlab_min_size: 8,
            tlab_max_size: 8,
            ..GcConfig::default()
        };
        assert_eq!(side_header_granule(&tiny), OBJECT_ALIGNMENT);
    }

    #[test]
    fn test_large_allocation_and_release() {
        let heap = heap(8 * MB);
        let header = heap.allocate_large(3 * MB).unwrap();
        let head = heap.region_of(header).unwrap();
        assert_eq!(head.span(), 2);
        assert_eq!(heap.committed_bytes(), 4 * MB);
        assert_eq!(
            heap.object_region(header + 2 * MB + HEADER_SIZE).map(|r| r.index()),
            Some(head.index())
        );

        let reclaimed = heap.release_region(head.index()).unwrap();
        assert_eq!(reclaimed, 3 * MB);
        assert_eq!(heap.committed_bytes(), 0);
        assert_eq!(heap.used_bytes(), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn test_tlab_slices_are_disjoint() {
        let heap = heap(8 * MB);
        let (a, a_len) = heap.allocate_tlab(4096, 64 * 1024).unwrap();
        let (b, _) = heap.allocate_tlab(4096, 64 * 1024).unwrap();
        assert_eq!(a_len, 64 * 1024);
        assert!(b >= a + a_len);
    }

    #[test]
    fn test_reclaim_candidates_sorted() {
        let heap = heap(8 * MB);
        heap.set_cycle(1);
        let r0 = heap.allocate_region(SizeClass::Medium, Generation::Young).unwrap();
        let r1 = heap.allocate_region(SizeClass::Medium, Generation::Old).unwrap();
        r0.record_live(200 * 1024, false);
        r1.record_live(100 * 1024, false);

        assert!(heap.reclaim_candidates(0.25, false, 1).is_empty());
        assert_eq!(heap.reclaim_candidates(0.25, false, 2), vec![r1.index(), r0.index()]);
        assert_eq!(heap.reclaim_candidates(0.25, true, 2), vec![r0.index()]);
    }

    #[test]
    fn test_sweep_frees_dead_regions() {
        let heap = heap(8 * MB);
        let dead = heap.allocate_region(SizeClass::Medium, Generation::Young).unwrap();
        let live = heap.allocate_region(SizeClass::Medium, Generation::Young).unwrap();
        let old = heap.allocate_region(SizeClass::Medium, Generation::Old).unwrap();
        dead.bump(4096).unwrap();
        live.bump(4096).unwrap();
        live.mark(live.start());
        live.record_live(4096, false);
        heap.set_cycle(1);

        // Young sweep leaves the untraced old region alone
        let result = heap.sweep(1, false).unwrap();
        assert_eq!(result.freed_regions, vec![dead.index()]);
        assert_eq!(result.reclaimed_bytes, 4096);
        assert_eq!(old.state(), RegionState::Used);
        assert_eq!(live.live_estimate(), 4096);
        assert!(!live.is_marked(live.start()));

        let result = heap.sweep(2, true).unwrap();
        assert_eq!(result.freed_regions.len(), 2);
        assert_eq!(old.state(), RegionState::Empty);
        heap.verify().unwrap();
    }

    #[test]
    fn test_initialize_object() {
        let heap = heap(8 * MB);
        let (header_address, _) = heap.allocate_tlab(64, 64).unwrap();
        let object = header_address + HEADER_SIZE;
        unsafe { heap.initialize_object(object, 64, 2, false) };
        let header = unsafe { heap.header(object) };
        assert_eq!(header.size(), 64);
        assert_eq!(header.ref_slots(), 2);
        assert_eq!(unsafe { ObjectHeader::at(header_address) }.size(), 64);
        assert!(heap.region_of(object).unwrap().is_object_start(object));
        assert_eq!(unsafe { header::ref_slot(object, 1) }.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_initialize_medium_object_uses_side_header() {
        let heap = heap(8 * MB);
        let size = MB + HEADER_SIZE;
        let object = heap.allocate_medium(size).unwrap();
        let region = heap.region_of(object).unwrap();
        assert_eq!(object, region.start());

        unsafe { heap.initialize_object(object, size, 3, false) };
        let header = unsafe { heap.header(object) };
        assert_eq!(header.payload_size(), MB);
        assert_eq!(header.ref_slots(), 3);
        assert!(std::ptr::eq(header, region.side_header(object).unwrap()));
        assert!(region.is_object_start(object));
        assert_eq!(heap.object_region(object).map(|r| r.index()), Some(region.index()));
    }
}
