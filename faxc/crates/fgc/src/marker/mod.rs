//! Marker Module - Concurrent Marking System
//!
//! This module implements concurrent marking to identify which objects are
//! still "alive" (referenced) and which are garbage.
//!
//! Marking Algorithm:
//! - Tri-color marking over per-region mark bitmaps (white = unmarked,
//!   gray = marked and queued, black = marked and scanned)
//! - Snapshot at the beginning: the SATB write barrier queues overwritten
//!   references, objects allocated during the cycle are implicitly live
//! - Parallel work-stealing workers; setting a mark bit is an atomic
//!   fetch-or, so workers never share a lock
//!
//! Marking Phases:
//! 1. Initial Mark (pause) - heal and scan roots, seed remembered sets
//! 2. Concurrent Mark - drain the queue and SATB buffers with mutators running
//! 3. Remark (pause) - drain what mutators recorded since
//!
//! Young cycles only mark objects in young regions; old objects act as
//! roots through the remembered sets. Full cycles rebuild the remembered
//! sets as a side effect of tracing.

pub mod bitmap;
pub mod mark_queue;
pub mod roots;

pub use bitmap::MarkBitmap;
pub use mark_queue::MarkQueue;
pub use roots::RootSet;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_deque::{Stealer, Worker};
use serde::Serialize;

use crate::allocator::{GcGeneration, GenerationalPolicy};
use crate::barrier::{heal_slot, ColoredPointer, ForwardingLookup, Parity, RememberedSets, SatbQueue};
use crate::heap::{Generation, Heap, Region, RegionState, SizeClass};
use crate::object::header;

/// MarkContext - per-cycle state shared by all marking workers
pub struct MarkContext<'a> {
    pub heap: &'a Heap,
    pub lookup: &'a (dyn ForwardingLookup + Sync),
    pub remembered_sets: &'a RememberedSets,
    pub satb: &'a SatbQueue,
    pub policy: &'a GenerationalPolicy,
    pub parity: Parity,
    pub scope: GcGeneration,
    pub cycle: u64,
}

impl MarkContext<'_> {
    /// Region of `object` if this cycle traces it
    fn traced_region(&self, object: usize) -> Option<&Region> {
        let region = self.heap.object_region(object)?;
        if !region.state().holds_objects()
            || region.allocated_during(self.cycle)
            || !self.policy.traces(self.scope, region.generation())
        {
            return None;
        }
        Some(region)
    }

    /// Young region index holding `object`, if any
    fn young_region_of(&self, object: usize) -> Option<usize> {
        self.heap
            .object_region(object)
            .filter(|region| region.generation() == Generation::Young)
            .map(Region::index)
    }
}

/// Marking counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarkStats {
    pub marked_objects: u64,
    pub marked_bytes: u64,
    pub roots_scanned: u64,
    pub remembered_fields_scanned: u64,
    pub satb_processed: u64,
}

/// MarkEngine - root seeding, tracing and liveness queries
pub struct MarkEngine {
    queue: MarkQueue,
    workers: usize,

    marked_objects: AtomicU64,
    marked_bytes: AtomicU64,
    roots_scanned: AtomicU64,
    remembered_fields_scanned: AtomicU64,
    satb_processed: AtomicU64,
}

impl MarkEngine {
    pub fn new(workers: usize) -> Self {
        Self {
            queue: MarkQueue::new(),
            workers: workers.max(1),
            marked_objects: AtomicU64::new(0),
            marked_bytes: AtomicU64::new(0),
            roots_scanned: AtomicU64::new(0),
            remembered_fields_scanned: AtomicU64::new(0),
            satb_processed: AtomicU64::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue(&self) -> &MarkQueue {
        &self.queue
    }

    /// Mark the object at `object` (a healed address); returns it when it
    /// was newly marked and must be scanned
    pub fn mark_object(&self, ctx: &MarkContext<'_>, object: usize) -> Option<usize> {
        if object == 0 {
            return None;
        }
        let region = ctx.traced_region(object)?;
        if !region.is_object_start(object) {
            log::trace!("Ignoring non-object address {:#x}", object);
            return None;
        }
        if !region.mark(object) {
            return None;
        }

        // SAFETY: the start bitmap says an object lives here and the region
        // holds objects
        let header = unsafe { ctx.heap.header(object) };
        let size = header.size();
        let promote = region.size_class() != SizeClass::Large
            && ctx
                .policy
                .should_promote(ctx.scope, region.generation(), header.age());
        region.record_live(size, promote);
        self.marked_objects.fetch_add(1, Ordering::Relaxed);
        self.marked_bytes.fetch_add(size as u64, Ordering::Relaxed);
        Some(object)
    }

    /// Heal a possibly stale address, then mark it
    pub fn mark_address(&self, ctx: &MarkContext<'_>, address: usize) -> Option<usize> {
        let healed = ColoredPointer::from_raw(address).heal(ctx.parity, ctx.lookup);
        self.mark_object(ctx, healed.address())
    }

    /// Whether `object` is live for the current cycle (marked, allocated
    /// during the cycle, or outside the traced generation)
    pub fn is_marked(&self, heap: &Heap, scope: GcGeneration, cycle: u64, object: usize) -> bool {
        let Some(region) = heap.object_region(object) else {
            return true;
        };
        if region.allocated_during(cycle)
            || (scope == GcGeneration::Young && region.generation() == Generation::Old)
            || !region.state().holds_objects()
        {
            return true;
        }
        region.is_marked(object)
    }

    /// Heal every reference slot of `object` and mark what they point to
    pub fn scan_object(&self, ctx: &MarkContext<'_>, object: usize, mut push: impl FnMut(usize)) {
        // SAFETY: `object` was marked through its start bit
        let header = unsafe { ctx.heap.header(object) };
        let rebuild_remembered = ctx.scope == GcGeneration::Full
            && ctx
                .heap
                .object_region(object)
                .map_or(false, |region| region.generation() == Generation::Old);

        for index in 0..header.ref_slots() {
            // SAFETY: index < ref_slots
            let slot = unsafe { header::ref_slot(object, index) };
            let (target, _) = heal_slot(slot, ctx.parity, ctx.lookup);
            if target.is_null() {
                continue;
            }
            if rebuild_remembered {
                if let Some(young) = ctx.young_region_of(target.address()) {
                    ctx.remembered_sets
                        .record(young, slot as *const AtomicUsize as usize);
                }
            }
            if let Some(child) = self.mark_object(ctx, target.address()) {
                push(child);
            }
        }
    }

    /// Heal one root slot in place and queue its target
    pub fn mark_root(&self, ctx: &MarkContext<'_>, slot: &AtomicUsize) {
        self.roots_scanned.fetch_add(1, Ordering::Relaxed);
        let (target, _) = heal_slot(slot, ctx.parity, ctx.lookup);
        if let Some(object) = self.mark_object(ctx, target.address()) {
            self.queue.push(object);
        }
    }

    /// Queue an already healed object (reference keep-alive, pinned roots)
    pub fn mark_and_push(&self, ctx: &MarkContext<'_>, object: usize) -> bool {
        match self.mark_address(ctx, object) {
            Some(object) => {
                self.queue.push(object);
                true
            }
            None => false,
        }
    }

    /// Young cycles: treat every remembered old field as a root
    ///
    /// Drained entries are re-recorded when their target is still young.
    /// Fields that no longer sit in a plain old region are dropped; their
    /// objects were relocated and the copies re-recorded themselves.
    pub fn seed_remembered_sets(&self, ctx: &MarkContext<'_>) -> usize {
        let mut scanned = 0;
        for (_, fields) in ctx.remembered_sets.drain() {
            for field in fields {
                let valid = ctx.heap.region_of(field).map_or(false, |region| {
                    region.generation() == Generation::Old
                        && matches!(region.state(), RegionState::Used | RegionState::Pinned)
                });
                if !valid {
                    continue;
                }
                scanned += 1;
                // SAFETY: recorded fields are reference slots of old objects;
                // regions freed since were purged from the sets
                let slot = unsafe { &*(field as *const AtomicUsize) };
                let (target, _) = heal_slot(slot, ctx.parity, ctx.lookup);
                if target.is_null() {
                    continue;
                }
                if let Some(young) = ctx.young_region_of(target.address()) {
                    ctx.remembered_sets.record(young, field);
                }
                if let Some(object) = self.mark_object(ctx, target.address()) {
                    self.queue.push(object);
                }
            }
        }
        self.remembered_fields_scanned
            .fetch_add(scanned as u64, Ordering::Relaxed);
        scanned
    }

    /// Drain the queue and the SATB buffers with `workers` threads
    ///
    /// Returns when no work is pending and the SATB queue is empty. Called
    /// concurrently during ConcurrentMark and again inside the remark pause,
    /// where mutators cannot add SATB entries.
    pub fn trace(&self, ctx: &MarkContext<'_>) {
        if self.workers == 1 {
            self.work(ctx, Worker::new_lifo(), &[]);
            return;
        }

        let locals: Vec<Worker<usize>> = (0..self.workers).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<usize>> = locals.iter().map(Worker::stealer).collect();
        std::thread::scope(|scope| {
            for local in locals {
                let stealers = &stealers;
                scope.spawn(move || self.work(ctx, local, stealers));
            }
        });
    }

    fn work(&self, ctx: &MarkContext<'_>, local: Worker<usize>, stealers: &[Stealer<usize>]) {
        let mut idle_rounds = 0u32;
        loop {
            if let Some(object) = self.queue.find_task(&local, stealers) {
                idle_rounds = 0;
                self.scan_object(ctx, object, |child| self.queue.push_local(&local, child));
                self.queue.complete();
                continue;
            }

            if let Some(address) = ctx.satb.pop() {
                idle_rounds = 0;
                self.satb_processed.fetch_add(1, Ordering::Relaxed);
                if let Some(object) = self.mark_address(ctx, address) {
                    self.queue.push_local(&local, object);
                }
                continue;
            }

            if self.queue.is_idle() && ctx.satb.is_empty() {
                break;
            }
            idle_rounds += 1;
            if idle_rounds < 32 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn stats(&self) -> MarkStats {
        MarkStats {
            marked_objects: self.marked_objects.load(Ordering::Relaxed),
            marked_bytes: self.marked_bytes.load(Ordering::Relaxed),
            roots_scanned: self.roots_scanned.load(Ordering::Relaxed),
            remembered_fields_scanned: self.remembered_fields_scanned.load(Ordering::Relaxed),
            satb_processed: self.satb_processed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{Color, NoForwarding};
    use crate::config::{GcConfig, MB};
    use crate::object::header::HEADER_SIZE;
    use std::sync::Arc;

    struct Fixture {
        heap: Heap,
        remembered_sets: RememberedSets,
        satb: SatbQueue,
        policy: GenerationalPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let config = GcConfig {
                min_heap_size: 2 * MB,
                max_heap_size: 8 * MB,
                ..GcConfig::default()
            };
            let heap = Heap::new(Arc::new(config)).unwrap();
            let region_count = heap.regions().len();
            Self {
                heap,
                remembered_sets: RememberedSets::new(region_count, 64),
                satb: SatbQueue::new(),
                policy: GenerationalPolicy::new(true, 2),
            }
        }

        fn context(&self, scope: GcGeneration, cycle: u64) -> MarkContext<'_> {
            MarkContext {
                heap: &self.heap,
                lookup: &NoForwarding,
                remembered_sets: &self.remembered_sets,
                satb: &self.satb,
                policy: &self.policy,
                parity: Parity::for_cycle(cycle),
                scope,
                cycle,
            }
        }

        fn object(&self, ref_slots: usize) -> usize {
            let size = header::object_size(ref_slots * 8, ref_slots).unwrap();
            let (header_address, _) = self.heap.allocate_tlab(size, size).unwrap();
            let object = header_address + HEADER_SIZE;
            unsafe { self.heap.initialize_object(object, size, ref_slots, true) };
            object
        }

        fn link(&self, from: usize, slot: usize, to: usize) {
            let pointer = ColoredPointer::encode(to, Color::Uncolored).unwrap();
            unsafe { header::ref_slot(from, slot) }.store(pointer.raw(), Ordering::Relaxed);
        }
    }

    #[test]
    fn test_trace_marks_reachable_graph() {
        let fx = Fixture::new();
        let a = fx.object(2);
        let b = fx.object(1);
        let c = fx.object(0);
        let garbage = fx.object(1);
        fx.link(a, 0, b);
        fx.link(a, 1, c);
        fx.link(b, 0, a); // cycle
        fx.link(garbage, 0, c);

        let ctx = fx.context(GcGeneration::Full, 1);
        let engine = MarkEngine::new(2);
        let root = AtomicUsize::new(ColoredPointer::encode(a, Color::Uncolored).unwrap().raw());
        engine.mark_root(&ctx, &root);
        engine.trace(&ctx);

        for object in [a, b, c] {
            assert!(engine.is_marked(&fx.heap, GcGeneration::Full, 1, object));
        }
        assert!(!engine.is_marked(&fx.heap, GcGeneration::Full, 1, garbage));
        assert_eq!(engine.stats().marked_objects, 3);
        // Root slot healed to the cycle's color
        assert_eq!(
            ColoredPointer::from_raw(root.load(Ordering::Relaxed)).color(),
            Color::MarkedOdd
        );
    }

    #[test]
    fn test_trace_through_medium_object() {
        let fx = Fixture::new();
        let size = header::object_size(300 * 1024, 1).unwrap();
        let big = fx.heap.allocate_medium(size).unwrap();
        unsafe { fx.heap.initialize_object(big, size, 1, true) };
        let small = fx.object(0);
        fx.link(big, 0, small);

        let ctx = fx.context(GcGeneration::Full, 1);
        let engine = MarkEngine::new(1);
        let root = AtomicUsize::new(ColoredPointer::encode(big, Color::Uncolored).unwrap().raw());
        engine.mark_root(&ctx, &root);
        engine.trace(&ctx);

        assert!(engine.is_marked(&fx.heap, GcGeneration::Full, 1, big));
        assert!(engine.is_marked(&fx.heap, GcGeneration::Full, 1, small));
        let region = fx.heap.region_of(big).unwrap();
        assert_eq!(region.live_bytes(), size);
        assert_eq!(region.used_bytes(), size - HEADER_SIZE);
    }

    #[test]
    fn test_satb_entries_are_marked() {
        let fx = Fixture::new();
        let hidden = fx.object(0);
        let ctx = fx.context(GcGeneration::Full, 2);
        let engine = MarkEngine::new(1);

        fx.satb.push(hidden);
        engine.trace(&ctx);
        assert!(engine.is_marked(&fx.heap, GcGeneration::Full, 2, hidden));
        assert!(fx.satb.is_empty());
    }

    #[test]
    fn test_objects_in_new_regions_are_implicitly_live() {
        let fx = Fixture::new();
        fx.heap.set_cycle(3);
        let fresh = fx.object(0);
        let ctx = fx.context(GcGeneration::Full, 3);
        let engine = MarkEngine::new(1);

        assert_eq!(engine.mark_object(&ctx, fresh), None);
        assert!(engine.is_marked(&fx.heap, GcGeneration::Full, 3, fresh));
    }

    #[test]
    fn test_interior_pointer_ignored() {
        let fx = Fixture::new();
        let object = fx.object(2);
        let ctx = fx.context(GcGeneration::Full, 1);
        let engine = MarkEngine::new(1);
        assert_eq!(engine.mark_object(&ctx, object + 8), None);
        assert_eq!(engine.mark_object(&ctx, object), Some(object));
        assert_eq!(engine.mark_object(&ctx, object), None);
    }
}
