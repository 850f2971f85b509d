//! GC Core Module - Garbage Collection Cycle Management
//!
//! [`GarbageCollector`] is the explicit collector state: one per heap,
//! passed to every operation, never global. It owns the heap, the
//! allocator, both barriers, the marking and relocation engines, and the
//! controller thread that sequences cycles.
//!
//! Cycle (one controller request):
//!
//! ```text
//! InitialMark (pause)   flip parity, retire TLABs, scan roots
//! ConcurrentMark        parallel trace, SATB drain
//! Remark (pause)        final drain, references, relocation set
//! ConcurrentRelocate    copy live objects, mutators copy on access
//! ConcurrentSweep       free empty and old relocated regions
//! ```
//!
//! Mutator operations run under a safepoint guard and resolve every pointer
//! argument first; they never keep a raw address across operations.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::allocator::{Allocator, GcGeneration, GenerationalPolicy, GenerationalStats};
use crate::barrier::{
    self, heal_slot, ColoredPointer, ForwardingLookup, LoadBarrier, LoadBarrierStats, Parity,
    RememberedSetStats, RememberedSets, WriteBarrier, WriteBarrierStats,
};
use crate::config::GcConfig;
use crate::ensure_arg;
use crate::error::{FgcError, Result};
use crate::heap::{Generation, Heap, HeapStats, RegionState};
use crate::logging::{GcEvent, GcLogger, LoggedEvent, DEFAULT_HISTORY};
use crate::marker::{MarkContext, MarkEngine, MarkStats, RootSet};
use crate::object::header::{self, WORD_SIZE};
use crate::object::{object_size, Reference, ReferenceKind, ReferenceProcessor};
use crate::relocate::{RelocationContext, RelocationEngine, RelocationStats, Resolver};
use crate::runtime::{
    Controller, CycleRunner, FinalizerRegistry, GcPhase, GcReason, GcRequest, PauseGuard,
    PhaseTransition, Safepoint,
};
use crate::stats::{GcMetricsSnapshot, GcStats, GcTimer};

/// Full cycles run by one aggressive request; the second frees the regions
/// the first one evacuated
const AGGRESSIVE_CYCLES: usize = 2;

fn scope_to_u8(scope: GcGeneration) -> u8 {
    match scope {
        GcGeneration::Young => 0,
        GcGeneration::Full => 1,
    }
}

fn scope_from_u8(value: u8) -> GcGeneration {
    match value {
        0 => GcGeneration::Young,
        _ => GcGeneration::Full,
    }
}

/// Everything shared between mutators and the controller thread
pub(crate) struct GcCore {
    config: Arc<GcConfig>,
    heap: Heap,
    allocator: Allocator,
    policy: GenerationalPolicy,

    load_barrier: LoadBarrier,
    write_barrier: WriteBarrier,
    remembered_sets: RememberedSets,

    marker: MarkEngine,
    relocator: RelocationEngine,
    roots: RootSet,
    references: ReferenceProcessor,
    finalizers: FinalizerRegistry,

    safepoint: Safepoint,
    controller: Controller,
    stats: GcStats,
    logger: GcLogger,

    /// Cycle number of the latest InitialMark
    cycle: AtomicU64,
    /// Scope of the latest cycle
    scope: AtomicU8,
    /// `heap.total_allocated()` at the latest InitialMark
    allocated_at_cycle_start: AtomicU64,
    shut_down: AtomicBool,
}

impl GcCore {
    fn new(config: GcConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let heap = Heap::new(Arc::clone(&config))?;
        let region_count = heap.regions().len();

        Ok(Self {
            allocator: Allocator::new(&config),
            policy: GenerationalPolicy::new(config.use_generational, config.tenure_threshold),
            load_barrier: LoadBarrier::new(),
            write_barrier: WriteBarrier::new(),
            remembered_sets: RememberedSets::new(region_count, config.remembered_set_capacity),
            marker: MarkEngine::new(config.concurrent_gc_threads),
            relocator: RelocationEngine::new(config.concurrent_gc_threads),
            roots: RootSet::new(),
            references: ReferenceProcessor::new(),
            finalizers: FinalizerRegistry::new(),
            safepoint: Safepoint::new(),
            controller: Controller::new(),
            stats: GcStats::new(Duration::from_millis(config.max_pause_ms)),
            logger: GcLogger::new(DEFAULT_HISTORY, config.verbose),
            cycle: AtomicU64::new(0),
            scope: AtomicU8::new(scope_to_u8(GcGeneration::Full)),
            allocated_at_cycle_start: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            heap,
            config,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(FgcError::ShutDown);
        }
        Ok(())
    }

    fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    fn scope(&self) -> GcGeneration {
        scope_from_u8(self.scope.load(Ordering::Acquire))
    }

    fn relocation_context(&self) -> RelocationContext<'_> {
        RelocationContext {
            heap: &self.heap,
            remembered_sets: &self.remembered_sets,
            policy: &self.policy,
            scope: self.scope(),
            cycle: self.cycle(),
        }
    }

    fn resolver(&self, by_mutator: bool) -> Resolver<'_> {
        Resolver::new(self.relocation_context(), &self.relocator, by_mutator)
    }

    fn mark_context<'a>(
        &'a self,
        lookup: &'a (dyn ForwardingLookup + Sync),
        scope: GcGeneration,
        cycle: u64,
    ) -> MarkContext<'a> {
        MarkContext {
            heap: &self.heap,
            lookup,
            remembered_sets: &self.remembered_sets,
            satb: self.write_barrier.satb_queue(),
            policy: &self.policy,
            parity: Parity::for_cycle(cycle),
            scope,
            cycle,
        }
    }

    fn is_marked(&self, object: usize) -> bool {
        self.marker
            .is_marked(&self.heap, self.scope(), self.cycle(), object)
    }

    fn young_region_of(&self, object: usize) -> Option<usize> {
        self.heap
            .object_region(object)
            .filter(|region| region.generation() == Generation::Young)
            .map(|region| region.index())
    }

    /// Heal `pointer` and check that it names a heap object
    fn object_at(&self, pointer: ColoredPointer, resolver: &Resolver<'_>) -> Result<ColoredPointer> {
        ensure_arg!(!pointer.is_null(), "null object pointer");
        let healed = self.load_barrier.heal(pointer, resolver);
        let object = healed.address();
        let valid = self.heap.object_region(object).map_or(false, |region| {
            region.state().holds_objects() && region.is_object_start(object)
        });
        ensure_arg!(valid, "{} is not a heap object", pointer);
        Ok(healed)
    }

    fn old_generation_bytes(&self) -> usize {
        self.heap
            .regions()
            .iter()
            .filter(|region| {
                region.state() != RegionState::Empty && region.generation() == Generation::Old
            })
            .map(|region| region.used_bytes())
            .sum()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate and initialize an object; `publish` runs under the same
    /// mutator guard as the allocation, so no cycle can start in between
    fn allocate(
        &self,
        payload_size: usize,
        ref_slots: usize,
        zero: bool,
        publish: impl Fn(ColoredPointer),
    ) -> Result<ColoredPointer> {
        self.ensure_running()?;
        let size = object_size(payload_size, ref_slots)?;
        if size > self.heap.max_size() {
            return Err(self.out_of_memory(size));
        }

        let mut attempt = self.try_allocate(size, ref_slots, zero, &publish);
        for reason in [GcReason::AllocationFailure, GcReason::Aggressive] {
            match &attempt {
                Err(err) if err.is_recoverable() => {}
                _ => break,
            }
            if self.safepoint.is_mutator() {
                break;
            }
            log::debug!(
                "Allocation of {} bytes failed, collecting ({})",
                size,
                reason
            );
            self.controller
                .collect(GcRequest::new(GcGeneration::Full, reason))?;
            attempt = self.try_allocate(size, ref_slots, zero, &publish);
        }

        match attempt {
            Ok(pointer) => {
                self.maybe_trigger();
                Ok(pointer)
            }
            Err(err) if err.is_recoverable() => Err(self.out_of_memory(size)),
            Err(err) => Err(err),
        }
    }

    fn try_allocate(
        &self,
        size: usize,
        ref_slots: usize,
        zero: bool,
        publish: &impl Fn(ColoredPointer),
    ) -> Result<ColoredPointer> {
        let _guard = self.safepoint.enter();
        self.ensure_running()?;
        let (object, path) = self.allocator.allocate(&self.heap, size)?;
        // SAFETY: the allocator handed out a fresh object at `object`
        unsafe { self.heap.initialize_object(object, size, ref_slots, zero) };
        log::trace!("Allocated {} bytes at {:#x} via {:?}", size, object, path);
        let pointer = ColoredPointer::encode(object, self.load_barrier.parity().mark_color())?;
        publish(pointer);
        Ok(pointer)
    }

    fn out_of_memory(&self, requested: usize) -> FgcError {
        let available = self.heap.available_bytes();
        self.stats.record_out_of_memory();
        self.logger.log(GcEvent::OutOfMemory {
            requested,
            available,
        });
        FgcError::OutOfMemory {
            requested,
            available,
        }
    }

    /// Queue a background cycle once occupancy crosses the trigger and at
    /// least a region's worth was allocated since the last cycle started
    fn maybe_trigger(&self) {
        if self.heap.occupancy() <= self.config.trigger_heap_usage {
            return;
        }
        let allocated = self
            .heap
            .total_allocated()
            .saturating_sub(self.allocated_at_cycle_start.load(Ordering::Acquire));
        if allocated < self.config.region_size as u64 {
            return;
        }

        let old_occupancy = self.old_generation_bytes() as f64 / self.heap.max_size() as f64;
        let generation = self.policy.background_generation(old_occupancy);
        match self.controller.request_background(generation) {
            Ok(true) => log::debug!(
                "Heap occupancy {:.1}% above trigger, {} cycle requested",
                self.heap.occupancy() * 100.0,
                generation
            ),
            Ok(false) => {}
            Err(err) => log::debug!("Background cycle not requested: {}", err),
        }
    }

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    fn enter_phase(&self, phase: GcPhase, cycle: u64) -> Result<()> {
        let transition = self.controller.set_phase(phase, cycle)?;
        self.logger.log(GcEvent::PhaseChange {
            cycle,
            from: transition.from,
            to: transition.to,
        });
        Ok(())
    }

    fn end_pause(&self, pause: PauseGuard<'_>, phase: GcPhase, cycle: u64) {
        let duration = pause.elapsed();
        let time_to_safepoint = pause.time_to_safepoint();
        drop(pause);

        let over_target = self.stats.record_pause(duration);
        self.logger.log(GcEvent::Pause {
            cycle,
            phase,
            duration_us: duration.as_micros() as u64,
            time_to_safepoint_us: time_to_safepoint.as_micros() as u64,
            over_target,
        });
    }

    fn run_cycle_once(&self, request: &GcRequest) -> Result<()> {
        let timer = GcTimer::new();
        let aggressive = request.is_aggressive();
        let scope = self
            .policy
            .scope_for(request.generation, self.remembered_sets.has_overflowed());
        let cycle = self.cycle() + 1;

        self.logger.log(GcEvent::CycleStart {
            cycle,
            generation: scope,
            reason: request.reason.to_string(),
        });

        let result = self.run_phases(cycle, scope, aggressive);
        if result.is_err() {
            let satb = self.write_barrier.satb_queue();
            satb.deactivate();
            satb.clear();
            self.relocator.finish_cycle();
        }
        let idle = self.enter_phase(GcPhase::Idle, cycle);

        let reclaimed = match result {
            Ok(reclaimed) => reclaimed,
            Err(err) => {
                if err.is_fatal() {
                    self.logger.log(GcEvent::Fatal {
                        cycle,
                        error: err.to_string(),
                    });
                    self.controller.halt(err.clone());
                }
                return Err(err);
            }
        };
        idle?;

        let duration = timer.elapsed();
        self.stats.record_cycle(scope, aggressive, duration, reclaimed);
        self.logger.log(GcEvent::CycleEnd {
            cycle,
            generation: scope,
            duration_ms: timer.elapsed_ms(),
            reclaimed_bytes: reclaimed,
            heap_usage: self.heap.occupancy(),
        });
        Ok(())
    }

    /// Run every phase of cycle `cycle`; returns the bytes reclaimed
    fn run_phases(&self, cycle: u64, scope: GcGeneration, aggressive: bool) -> Result<usize> {
        // InitialMark
        self.enter_phase(GcPhase::InitialMark, cycle)?;
        {
            let pause = self.safepoint.pause();
            self.cycle.store(cycle, Ordering::Release);
            self.scope.store(scope_to_u8(scope), Ordering::Release);
            self.allocated_at_cycle_start
                .store(self.heap.total_allocated(), Ordering::Release);

            // New regions are stamped with `cycle` from here on: allocate black
            self.heap.set_cycle(cycle);
            self.load_barrier.set_parity(Parity::for_cycle(cycle));
            let wasted = self.allocator.tlabs().retire_all();
            self.heap.retire_allocation_regions();
            log::trace!("Retired TLABs, {} bytes of tails wasted", wasted);

            self.write_barrier.satb_queue().activate();
            let resolver = self.resolver(false);
            let ctx = self.mark_context(&resolver, scope, cycle);
            match scope {
                GcGeneration::Full => self.remembered_sets.clear_all(),
                GcGeneration::Young => {
                    let fields = self.marker.seed_remembered_sets(&ctx);
                    log::trace!("Seeded {} remembered fields", fields);
                }
            }
            // SAFETY: registered slots stay valid until unregistered, and
            // unregistering needs a mutator guard, which the pause excludes
            unsafe {
                self.roots
                    .for_each_slot(|slot| self.marker.mark_root(&ctx, slot));
            }
            if !aggressive && self.heap.occupancy() < self.config.soft_ref_clear_usage {
                for soft in self.references.soft_references() {
                    self.marker.mark_root(&ctx, soft.referent_slot());
                }
            }
            self.end_pause(pause, GcPhase::InitialMark, cycle);
        }

        // ConcurrentMark
        self.enter_phase(GcPhase::ConcurrentMark, cycle)?;
        {
            let resolver = self.resolver(false);
            let ctx = self.mark_context(&resolver, scope, cycle);
            self.marker.trace(&ctx);
        }
        if let Some(fault) = self.relocator.take_fault() {
            return Err(fault);
        }

        // Remark
        self.enter_phase(GcPhase::Remark, cycle)?;
        let aborted_before = self.relocator.stats().aborted_regions;
        let promoted_before = self.relocator.stats().promoted_objects;
        {
            let pause = self.safepoint.pause();
            let resolver = self.resolver(false);
            let ctx = self.mark_context(&resolver, scope, cycle);
            self.marker.trace(&ctx);

            let parity = ctx.parity;
            let reference_stats = self.references.process(
                |slot| heal_slot(slot, parity, &resolver).0,
                |object| self.marker.is_marked(&self.heap, scope, cycle, object),
                |object| {
                    self.marker.mark_and_push(&ctx, object);
                },
            );
            // Trace what the kept-alive referents reach
            self.marker.trace(&ctx);
            log::trace!("Reference processing: {:?}", reference_stats);

            let satb = self.write_barrier.satb_queue();
            satb.deactivate();
            satb.clear();

            let threshold = if aggressive {
                self.config.aggressive_reclaim_threshold
            } else {
                self.config.reclaim_threshold
            };
            self.relocator
                .select(&self.relocation_context(), threshold)?;
            self.end_pause(pause, GcPhase::Remark, cycle);
        }

        // ConcurrentRelocate
        self.enter_phase(GcPhase::ConcurrentRelocate, cycle)?;
        self.relocator.relocate_all(&self.relocation_context())?;
        self.relocator.finish_cycle();

        let relocation = self.relocator.stats();
        let aborted = relocation.aborted_regions - aborted_before;
        if aborted > 0 {
            self.logger.log(GcEvent::RelocationAborted {
                cycle,
                regions: aborted,
            });
        }
        let promoted = relocation.promoted_objects - promoted_before;
        if promoted > 0 {
            self.logger.log(GcEvent::Promotion {
                cycle,
                objects: promoted,
            });
        }

        // ConcurrentSweep
        self.enter_phase(GcPhase::ConcurrentSweep, cycle)?;
        let swept = self.heap.sweep(cycle, scope == GcGeneration::Full)?;
        self.remembered_sets
            .purge(&swept.freed_regions, &swept.freed_ranges);
        if !swept.freed_regions.is_empty() {
            self.logger.log(GcEvent::RegionsReclaimed {
                cycle,
                regions: swept.freed_regions.len(),
                bytes: swept.reclaimed_bytes,
            });
        }
        Ok(swept.reclaimed_bytes)
    }
}

impl CycleRunner for GcCore {
    fn run_cycle(&self, request: &GcRequest) -> Result<()> {
        self.ensure_running()?;
        let cycles = if request.is_aggressive() {
            AGGRESSIVE_CYCLES
        } else {
            1
        };
        for _ in 0..cycles {
            self.run_cycle_once(request)?;
        }
        Ok(())
    }
}

/// Root - a registered root slot that unregisters itself when dropped
///
/// The slot is healed in place by every cycle, so [`Root::get`] always
/// returns a current pointer.
pub struct Root {
    core: Arc<GcCore>,
    slot: Box<AtomicUsize>,
}

impl Root {
    fn slot_address(&self) -> usize {
        &*self.slot as *const AtomicUsize as usize
    }

    /// Current (healed) pointer held by the root
    pub fn get(&self) -> ColoredPointer {
        let _guard = self.core.safepoint.enter();
        if self.core.ensure_running().is_err() {
            return ColoredPointer::from_raw(self.slot.load(Ordering::Acquire));
        }
        let resolver = self.core.resolver(true);
        self.core.load_barrier.load(&self.slot, &resolver)
    }

    /// Point the root at another object (or null)
    pub fn set(&self, pointer: ColoredPointer) -> Result<()> {
        let _guard = self.core.safepoint.enter();
        self.core.ensure_running()?;
        let value = if pointer.is_null() {
            pointer
        } else {
            self.core.object_at(pointer, &self.core.resolver(true))?
        };
        self.slot.store(value.raw(), Ordering::Release);
        Ok(())
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        let _guard = self.core.safepoint.enter();
        if let Err(err) = self.core.roots.unregister(self.slot_address()) {
            log::warn!("Dropping root: {}", err);
        }
    }
}

impl std::fmt::Debug for Root {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("slot", &format_args!("{:#x}", self.slot_address()))
            .field("value", &ColoredPointer::from_raw(self.slot.load(Ordering::Relaxed)))
            .finish()
    }
}

/// Everything `diagnostics()` reports
#[derive(Debug, Clone, Serialize)]
pub struct GcDiagnostics {
    pub cycle: u64,
    pub phase: GcPhase,
    pub halted: Option<String>,
    pub heap: HeapStats,
    pub marking: MarkStats,
    pub relocation: RelocationStats,
    pub generational: GenerationalStats,
    pub remembered_sets: RememberedSetStats,
    pub load_barrier: LoadBarrierStats,
    pub write_barrier: WriteBarrierStats,
    pub registered_roots: usize,
    pub registered_references: usize,
    pub pending_finalizers: usize,
    pub active_tlabs: usize,
    pub phase_history: Vec<PhaseTransition>,
    pub recent_events: Vec<LoggedEvent>,
}

/// GarbageCollector - orchestrator for the entire GC cycle
///
/// Coordinates all GC components:
/// - Heap and allocator for region and TLAB management
/// - Mark and relocation engines for the concurrent phases
/// - Barriers, reference processing and finalizers
/// - The controller thread and stats for monitoring
///
/// ## Thread Safety
///
/// Shared freely between threads (`&GarbageCollector` is all any
/// operation needs). A thread blocks only while the collector is inside
/// one of its two pauses.
///
/// # Examples
///
/// ```rust
/// use fgc::{GarbageCollector, GcConfig, GcGeneration};
/// use fgc::config::MB;
///
/// let gc = GarbageCollector::new(GcConfig::for_heap(8 * MB, 1))?;
/// let node = gc.allocate_object(16, 1)?;
/// let root = gc.root(node)?;
/// gc.collect(GcGeneration::Young)?;
/// assert!(!root.get().is_null());
/// # Ok::<(), fgc::FgcError>(())
/// ```
pub struct GarbageCollector {
    core: Arc<GcCore>,
}

impl GarbageCollector {
    /// Reserve the heap and start the controller thread
    pub fn new(config: GcConfig) -> Result<Self> {
        let core = Arc::new(GcCore::new(config)?);
        let runner: Arc<dyn CycleRunner> = core.clone();
        core.controller.start(Arc::downgrade(&runner))?;
        log::info!(
            "FGC initialized: {} byte heap, {} regions, {} GC threads",
            core.heap.max_size(),
            core.heap.regions().len(),
            core.config.concurrent_gc_threads
        );
        Ok(Self { core })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(GcConfig::default())
    }

    pub fn config(&self) -> &GcConfig {
        &self.core.config
    }

    pub fn heap(&self) -> &Heap {
        &self.core.heap
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a data-only object with a `size` byte payload
    pub fn allocate(&self, size: usize) -> Result<ColoredPointer> {
        ensure_arg!(size > 0, "allocation size must be non-zero");
        self.core.allocate(size, 0, false, |_| {})
    }

    /// Allocate a data-only object with a zero-filled payload
    pub fn allocate_zeroed(&self, size: usize) -> Result<ColoredPointer> {
        ensure_arg!(size > 0, "allocation size must be non-zero");
        self.core.allocate(size, 0, true, |_| {})
    }

    /// Allocate an object whose first `ref_slots` payload words are
    /// reference slots (initially null)
    pub fn allocate_object(&self, size: usize, ref_slots: usize) -> Result<ColoredPointer> {
        self.core.allocate(size, ref_slots, false, |_| {})
    }

    /// Allocate an object and root it in the same step
    ///
    /// A pointer returned by the other allocation calls is unrooted until
    /// it is stored somewhere reachable; a cycle that starts in between may
    /// reclaim the object. Use this while collections run concurrently.
    pub fn allocate_rooted(&self, size: usize, ref_slots: usize) -> Result<Root> {
        let root = self.new_root()?;
        self.core.allocate(size, ref_slots, false, |pointer| {
            root.slot.store(pointer.raw(), Ordering::Release);
        })?;
        Ok(root)
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Heal `pointer`; an object whose region is being relocated is copied
    /// first, so the result always names the current copy
    pub fn resolve(&self, pointer: ColoredPointer) -> Result<ColoredPointer> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        if pointer.is_null() {
            return Ok(pointer);
        }
        core.object_at(pointer, &core.resolver(true))
    }

    /// Load reference slot `slot` of `object` through the load barrier
    pub fn load_ref(&self, object: ColoredPointer, slot: usize) -> Result<ColoredPointer> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let resolver = core.resolver(true);
        let object = core.object_at(object, &resolver)?;
        let slot = checked_ref_slot(&core.heap, object.address(), slot)?;
        Ok(core.load_barrier.load(slot, &resolver))
    }

    /// Store `value` into reference slot `slot` of `object` through both
    /// write barriers
    pub fn store_ref(&self, object: ColoredPointer, slot: usize, value: ColoredPointer) -> Result<()> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let resolver = core.resolver(true);
        let object = core.object_at(object, &resolver)?;
        let slot = checked_ref_slot(&core.heap, object.address(), slot)?;
        let new_value = if value.is_null() {
            ColoredPointer::NULL
        } else {
            core.object_at(value, &resolver)?
        };

        let previous = ColoredPointer::from_raw(slot.swap(new_value.raw(), Ordering::AcqRel));
        let previous = core.load_barrier.heal(previous, &resolver);
        core.write_barrier
            .pre_write(previous, |old| core.is_marked(old));

        let field = slot as *const AtomicUsize as usize;
        let old_field = core
            .heap
            .region_of(field)
            .map_or(false, |region| region.generation() == Generation::Old);
        core.write_barrier.post_write(
            &core.remembered_sets,
            field,
            new_value,
            old_field,
            |target| core.young_region_of(target),
        );
        Ok(())
    }

    /// Read the payload word at byte `offset` (past the reference slots)
    pub fn read_word(&self, object: ColoredPointer, offset: usize) -> Result<u64> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let resolver = core.resolver(true);
        let object = core.object_at(object, &resolver)?;
        let word = checked_data_word(&core.heap, object.address(), offset)?;
        Ok(word.load(Ordering::Acquire))
    }

    /// Write the payload word at byte `offset` (past the reference slots)
    pub fn write_word(&self, object: ColoredPointer, offset: usize, value: u64) -> Result<()> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let resolver = core.resolver(true);
        let object = core.object_at(object, &resolver)?;
        let word = checked_data_word(&core.heap, object.address(), offset)?;
        word.store(value, Ordering::Release);
        Ok(())
    }

    /// Payload size of `object` in bytes
    pub fn payload_size(&self, object: ColoredPointer) -> Result<usize> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let object = core.object_at(object, &core.resolver(true))?;
        // SAFETY: object_at validated the object start
        Ok(unsafe { core.heap.header(object.address()) }.payload_size())
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Register a new root holding `pointer`
    pub fn root(&self, pointer: ColoredPointer) -> Result<Root> {
        let root = self.new_root()?;
        root.set(pointer)?;
        Ok(root)
    }

    fn new_root(&self) -> Result<Root> {
        let root = Root {
            core: Arc::clone(&self.core),
            slot: Box::new(AtomicUsize::new(0)),
        };
        let _guard = self.core.safepoint.enter();
        self.core.ensure_running()?;
        self.core.roots.register(root.slot_address())?;
        Ok(root)
    }

    /// Register a raw root slot holding a colored-pointer word
    ///
    /// # Safety
    /// `slot_address` must point at a word-aligned `AtomicUsize` that stays
    /// valid until [`unregister_root`](Self::unregister_root) is called. The
    /// collector reads and heals it in place during every cycle.
    pub unsafe fn register_root(&self, slot_address: usize) -> Result<()> {
        let _guard = self.core.safepoint.enter();
        self.core.ensure_running()?;
        self.core.roots.register(slot_address)
    }

    pub fn unregister_root(&self, slot_address: usize) -> Result<()> {
        let _guard = self.core.safepoint.enter();
        self.core.ensure_running()?;
        self.core.roots.unregister(slot_address)
    }

    pub fn root_count(&self) -> usize {
        self.core.roots.len()
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    /// Pin the region holding `object`; pinned regions are never relocated
    pub fn pin(&self, object: ColoredPointer) -> Result<ColoredPointer> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let pinned = core.object_at(object, &core.resolver(true))?;
        let region = core
            .heap
            .object_region(pinned.address())
            .ok_or_else(|| FgcError::InvalidArgument(format!("{} is not a heap object", object)))?;
        region.pin().map_err(|err| {
            FgcError::invalid_state(
                "used or pinned region",
                format!("region {} {:?}: {}", region.index(), region.state(), err),
            )
        })?;
        Ok(pinned)
    }

    pub fn unpin(&self, object: ColoredPointer) -> Result<()> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let pinned = core.object_at(object, &core.resolver(true))?;
        let region = core
            .heap
            .object_region(pinned.address())
            .ok_or_else(|| FgcError::InvalidArgument(format!("{} is not a heap object", object)))?;
        region.unpin()
    }

    // ------------------------------------------------------------------
    // References and finalizers
    // ------------------------------------------------------------------

    pub fn create_reference(&self, kind: ReferenceKind, target: ColoredPointer) -> Result<Arc<Reference>> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        let referent = if target.is_null() {
            target
        } else {
            core.object_at(target, &core.resolver(true))?
        };
        Ok(core.references.register(kind, referent))
    }

    /// Referent of `reference`; None once cleared, and always None for
    /// phantom references
    ///
    /// While marking is running the referent is recorded in the SATB
    /// queue, so an object revived this way survives the cycle.
    pub fn reference_get(&self, reference: &Reference) -> Result<Option<ColoredPointer>> {
        let core = &self.core;
        let _guard = core.safepoint.enter();
        core.ensure_running()?;
        if reference.kind() == ReferenceKind::Phantom || reference.is_cleared() {
            return Ok(None);
        }
        let resolver = core.resolver(true);
        let referent = core.load_barrier.load(reference.referent_slot(), &resolver);
        if referent.is_null() {
            return Ok(None);
        }
        let satb = core.write_barrier.satb_queue();
        barrier::satb(satb, referent, satb.is_active(), |object| core.is_marked(object));
        Ok(Some(referent))
    }

    /// Next reference queued for notification
    pub fn poll_reference_queue(&self) -> Option<Arc<Reference>> {
        self.core.references.poll()
    }

    /// Run `callback` once `object` becomes unreachable
    pub fn register_finalizer<F>(&self, object: ColoredPointer, callback: F) -> Result<()>
    where
        F: FnOnce(ColoredPointer) + Send + 'static,
    {
        let reference = self.create_reference(ReferenceKind::Finalizer, object)?;
        self.core.finalizers.register(reference, Box::new(callback));
        Ok(())
    }

    /// Run the finalizers of every object found unreachable so far; returns
    /// how many ran
    pub fn run_finalizers(&self) -> Result<usize> {
        let core = &self.core;
        let mut executed = 0;
        while let Some(queued) = core.references.poll_finalizable() {
            let Some((reference, callback)) = core.finalizers.take(queued.id()) else {
                queued.clear();
                continue;
            };
            let referent = {
                let _guard = core.safepoint.enter();
                core.ensure_running()?;
                core.load_barrier
                    .load(reference.referent_slot(), &core.resolver(true))
            };
            callback(referent);
            reference.clear();
            core.finalizers.record_executed();
            executed += 1;
        }
        Ok(executed)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a collection and wait for it
    ///
    /// Fails with `InvalidState` when called while this thread is inside
    /// a mutator operation (e.g. from a callback), which would deadlock.
    pub fn collect(&self, generation: GcGeneration) -> Result<()> {
        let core = &self.core;
        core.ensure_running()?;
        if core.safepoint.is_mutator() {
            return Err(FgcError::invalid_state(
                "no mutator operation in progress",
                "collection requested inside a mutator operation",
            ));
        }
        core.controller
            .collect(GcRequest::new(generation, GcReason::Explicit))
    }

    /// Queue a collection without waiting
    pub fn request_collection(&self, generation: GcGeneration) -> Result<()> {
        self.core.ensure_running()?;
        self.core
            .controller
            .submit(GcRequest::new(generation, GcReason::Explicit))
            .map(|_| ())
    }

    /// Wait until every queued collection has finished; false on timeout
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.core.controller.wait_idle(timeout)
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> GcMetricsSnapshot {
        let core = &self.core;
        let heap = core.heap.stats();
        let relocation = core.relocator.stats();
        let uptime = core.stats.uptime().as_secs_f64();
        let allocated = core.heap.total_allocated();

        GcMetricsSnapshot {
            heap_usage_ratio: heap.occupancy,
            used_bytes: heap.used_bytes,
            committed_bytes: heap.committed_bytes,
            max_bytes: heap.max_bytes,
            allocated_bytes: allocated,
            allocation_rate_bytes_per_sec: if uptime > 0.0 {
                allocated as f64 / uptime
            } else {
                0.0
            },
            tlab_hit_ratio: core.allocator.tlabs().hit_ratio(),
            relocated_objects: relocation.relocated_objects,
            relocated_bytes: relocation.relocated_bytes,
            promoted_objects: relocation.promoted_objects,
            aborted_relocations: relocation.aborted_regions,
            cleared_references: core.references.total_cleared(),
            enqueued_references: core.references.total_enqueued(),
            ..core.stats.snapshot()
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.core.heap.stats()
    }

    pub fn phase(&self) -> GcPhase {
        self.core.controller.phase()
    }

    pub fn phase_history(&self) -> Vec<PhaseTransition> {
        self.core.controller.phase_history()
    }

    /// Number of the most recent cycle
    pub fn cycle(&self) -> u64 {
        self.core.cycle()
    }

    pub fn diagnostics(&self) -> GcDiagnostics {
        let core = &self.core;
        GcDiagnostics {
            cycle: core.cycle(),
            phase: core.controller.phase(),
            halted: core.controller.halted().map(|err| err.to_string()),
            heap: core.heap.stats(),
            marking: core.marker.stats(),
            relocation: core.relocator.stats(),
            generational: core.policy.stats(),
            remembered_sets: core.remembered_sets.stats(),
            load_barrier: core.load_barrier.stats(),
            write_barrier: core.write_barrier.stats(),
            registered_roots: core.roots.len(),
            registered_references: core.references.registered(),
            pending_finalizers: core.finalizers.pending(),
            active_tlabs: core.allocator.tlabs().active_count(),
            phase_history: core.controller.phase_history(),
            recent_events: core.logger.events(),
        }
    }

    /// Address `pointer` was forwarded to by the relocation of its region
    pub fn forwarding_of(&self, pointer: ColoredPointer) -> Option<usize> {
        let region = self.core.heap.object_region(pointer.address())?;
        region.forwarding_table()?.forwarded(pointer.address())
    }

    /// Check the region bookkeeping
    pub fn verify_heap(&self) -> Result<()> {
        self.core.heap.verify()
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.load(Ordering::Acquire)
    }

    /// Stop the controller and release the heap reservation
    ///
    /// Later calls fail with `ShutDown`. Queued collections complete with
    /// `ShutDown` too.
    pub fn shutdown(&self) -> Result<()> {
        let core = &self.core;
        if core.safepoint.is_mutator() {
            return Err(FgcError::invalid_state(
                "no mutator operation in progress",
                "shutdown requested inside a mutator operation",
            ));
        }
        if core.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        core.controller.shutdown();
        let pause = core.safepoint.pause();
        core.allocator.tlabs().retire_all();
        core.heap.retire_allocation_regions();
        core.heap.release_memory();
        drop(pause);

        log::info!(
            "FGC shut down after {} cycles",
            core.stats.total_cycles()
        );
        Ok(())
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("GC shutdown failed: {}", err);
        }
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("cycle", &self.core.cycle())
            .field("phase", &self.core.controller.phase())
            .field("occupancy", &self.core.heap.occupancy())
            .finish()
    }
}

fn checked_ref_slot<'a>(heap: &Heap, object: usize, index: usize) -> Result<&'a AtomicUsize> {
    // SAFETY: callers validated `object` as a live object start
    let slots = unsafe { heap.header(object) }.ref_slots();
    ensure_arg!(
        index < slots,
        "reference slot {} out of range ({} slots)",
        index,
        slots
    );
    // SAFETY: index < ref_slots
    Ok(unsafe { header::ref_slot(object, index) })
}

fn checked_data_word<'a>(
    heap: &Heap,
    object: usize,
    offset: usize,
) -> Result<&'a std::sync::atomic::AtomicU64> {
    // SAFETY: callers validated `object` as a live object start
    let header = unsafe { heap.header(object) };
    let data_start = header.ref_slots() * WORD_SIZE;
    ensure_arg!(offset % WORD_SIZE == 0, "offset {} is not word aligned", offset);
    ensure_arg!(
        offset >= data_start && offset + WORD_SIZE <= header.payload_size(),
        "offset {} outside the data payload [{}, {})",
        offset,
        data_start,
        header.payload_size()
    );
    // SAFETY: bounds checked above
    Ok(unsafe { header::payload_word(object, offset) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    fn gc() -> GarbageCollector {
        GarbageCollector::new(GcConfig {
            min_heap_size: 2 * MB,
            max_heap_size: 16 * MB,
            concurrent_gc_threads: 2,
            ..GcConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_store_and_load() {
        let gc = gc();
        let parent = gc.allocate_object(16, 2).unwrap();
        let child = gc.allocate(8).unwrap();
        gc.store_ref(parent, 1, child).unwrap();
        assert_eq!(gc.load_ref(parent, 1).unwrap().address(), child.address());
        assert!(gc.load_ref(parent, 0).unwrap().is_null());
        assert!(matches!(
            gc.load_ref(parent, 2),
            Err(FgcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_data_words() {
        let gc = gc();
        let object = gc.allocate_object(32, 1).unwrap();
        gc.write_word(object, 8, 0xfeed).unwrap();
        assert_eq!(gc.read_word(object, 8).unwrap(), 0xfeed);
        // Reference slots are not data
        assert!(gc.write_word(object, 0, 1).is_err());
        assert!(gc.read_word(object, 32).is_err());
        assert_eq!(gc.payload_size(object).unwrap(), 32);
    }

    #[test]
    fn test_rejects_foreign_pointers() {
        let gc = gc();
        let bogus = ColoredPointer::encode(0x1000, crate::barrier::Color::Remapped).unwrap();
        assert!(matches!(gc.resolve(bogus), Err(FgcError::InvalidArgument(_))));
        assert!(gc.allocate(0).is_err());
    }

    #[test]
    fn test_rooted_graph_survives_cycles() {
        let gc = gc();
        let head = gc.allocate_object(16, 1).unwrap();
        let tail = gc.allocate_object(16, 1).unwrap();
        gc.write_word(tail, 8, 42).unwrap();
        gc.store_ref(head, 0, tail).unwrap();
        let root = gc.root(head).unwrap();

        for generation in [GcGeneration::Young, GcGeneration::Young, GcGeneration::Full] {
            gc.collect(generation).unwrap();
        }
        let tail = gc.load_ref(root.get(), 0).unwrap();
        assert_eq!(gc.read_word(tail, 8).unwrap(), 42);
        assert_eq!(gc.metrics().cycles, 3);
        gc.verify_heap().unwrap();
    }

    #[test]
    fn test_shutdown_rejects_operations() {
        let gc = gc();
        let object = gc.allocate(8).unwrap();
        gc.shutdown().unwrap();
        assert!(gc.is_shut_down());
        assert_eq!(gc.allocate(8), Err(FgcError::ShutDown));
        assert_eq!(gc.resolve(object), Err(FgcError::ShutDown));
        assert_eq!(gc.collect(GcGeneration::Full), Err(FgcError::ShutDown));
        // Idempotent
        gc.shutdown().unwrap();
    }
}
