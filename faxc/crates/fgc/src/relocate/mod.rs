//! Relocate Module - Concurrent Object Relocation
//!
//! Relocation evacuates the live objects of sparse regions so the regions
//! can return to the free list.
//!
//! Concurrent Relocation Strategy:
//! 1. Remark selects the relocation set and moves it to `Relocating`
//! 2. The first thread to touch a region builds its forwarding table,
//!    reserving destination space sized by the marked live bytes
//! 3. GC workers copy every entry; a mutator touching a not-yet-copied
//!    object copies it itself (relocate on access)
//! 4. A region whose table is complete becomes `Relocated`
//!
//! References are never rewritten eagerly: load barriers heal them lazily
//! through [`Resolver`], so pause time is bounded by root scanning.
//!
//! Failure: when destination space cannot be reserved the region's
//! relocation is aborted before any object moved (`Relocating -> Used`) and
//! retried next cycle. A region is never partially relocated.

pub mod forwarding;

pub use forwarding::{ForwardingEntry, ForwardingSlot, ForwardingTable, LiveObject};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::allocator::{GcGeneration, GenerationalPolicy};
use crate::barrier::{ColoredPointer, ForwardingLookup, RememberedSets};
use crate::error::{FgcError, Result};
use crate::heap::{Generation, Heap, Region, RegionState};
use crate::object::header::{self, ObjectHeader, HEADER_SIZE};

/// Longest forwarding chain followed by one lookup; regions are freed
/// before chains can grow past a few hops
const MAX_FORWARDING_HOPS: usize = 8;

/// RelocationContext - cycle state needed to build tables and copy objects
#[derive(Clone, Copy)]
pub struct RelocationContext<'a> {
    pub heap: &'a Heap,
    pub remembered_sets: &'a RememberedSets,
    pub policy: &'a GenerationalPolicy,
    pub scope: GcGeneration,
    pub cycle: u64,
}

/// Relocation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelocationStats {
    pub selected_regions: u64,
    pub relocated_regions: u64,
    pub aborted_regions: u64,
    pub relocated_objects: u64,
    pub relocated_bytes: u64,
    pub promoted_objects: u64,
    pub mutator_copies: u64,
}

/// RelocationEngine - relocation set, lazy tables and copying
pub struct RelocationEngine {
    workers: usize,
    relocation_set: Mutex<Vec<usize>>,
    /// First invariant violation seen where it could not be returned
    fault: Mutex<Option<FgcError>>,

    selected_regions: AtomicU64,
    relocated_regions: AtomicU64,
    aborted_regions: AtomicU64,
    relocated_objects: AtomicU64,
    relocated_bytes: AtomicU64,
    promoted_objects: AtomicU64,
    mutator_copies: AtomicU64,
}

impl RelocationEngine {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            relocation_set: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            selected_regions: AtomicU64::new(0),
            relocated_regions: AtomicU64::new(0),
            aborted_regions: AtomicU64::new(0),
            relocated_objects: AtomicU64::new(0),
            relocated_bytes: AtomicU64::new(0),
            promoted_objects: AtomicU64::new(0),
            mutator_copies: AtomicU64::new(0),
        }
    }

    /// Choose and transition this cycle's relocation set
    ///
    /// Young cycles take every young region with live data; full cycles
    /// take regions whose live ratio is below `threshold`, sparsest first.
    /// Selection stops once the live bytes to copy exceed the free space.
    pub fn select(&self, ctx: &RelocationContext<'_>, threshold: f64) -> Result<Vec<usize>> {
        let (threshold, young_only) = match ctx.scope {
            GcGeneration::Young => (f64::INFINITY, true),
            GcGeneration::Full => (threshold, false),
        };

        let budget = ctx.heap.available_bytes();
        let mut planned = 0;
        let mut selected = Vec::new();
        for index in ctx.heap.reclaim_candidates(threshold, young_only, ctx.cycle) {
            let region = &ctx.heap.regions()[index];
            let live = region.live_bytes();
            if planned + live > budget {
                break;
            }
            region.transition(RegionState::Used, RegionState::Relocating)?;
            planned += live;
            selected.push(index);
        }

        self.selected_regions
            .fetch_add(selected.len() as u64, Ordering::Relaxed);
        log::debug!(
            "Selected {} regions for relocation ({} live bytes)",
            selected.len(),
            planned
        );
        *self.relocation_set.lock() = selected.clone();
        Ok(selected)
    }

    pub fn relocation_set(&self) -> Vec<usize> {
        self.relocation_set.lock().clone()
    }

    /// Forwarding table of a relocating region, building it on first touch
    ///
    /// `Ok(None)` means the region's relocation was aborted.
    pub fn table_for(
        &self,
        ctx: &RelocationContext<'_>,
        region: &Region,
    ) -> Result<Option<Arc<ForwardingTable>>> {
        {
            match &*region.forwarding_slot().read() {
                ForwardingSlot::Ready(table) => return Ok(Some(Arc::clone(table))),
                ForwardingSlot::Aborted => return Ok(None),
                ForwardingSlot::Empty => {}
            }
        }

        let mut slot = region.forwarding_slot().write();
        match &*slot {
            ForwardingSlot::Ready(table) => return Ok(Some(Arc::clone(table))),
            ForwardingSlot::Aborted => return Ok(None),
            ForwardingSlot::Empty => {}
        }
        if region.state() != RegionState::Relocating {
            return Ok(None);
        }

        let generation = region.generation();
        let objects: Vec<LiveObject> = region
            .bitmaps()
            .marks
            .iter()
            .map(|object| {
                // SAFETY: marked addresses are objects of this region
                let header = unsafe { ctx.heap.header(object) };
                LiveObject {
                    address: object,
                    size: header.size(),
                    promote: ctx.policy.should_promote(ctx.scope, generation, header.age()),
                }
            })
            .collect();
        let survivor_bytes: usize = objects.iter().filter(|o| !o.promote).map(|o| o.size).sum();
        let promotion_bytes: usize = objects.iter().filter(|o| o.promote).map(|o| o.size).sum();

        let reserve = |target: Generation, bytes: usize| -> Result<usize> {
            if bytes == 0 {
                Ok(0)
            } else {
                ctx.heap.reserve_relocation(target, bytes)
            }
        };
        let bases = reserve(generation, survivor_bytes)
            .and_then(|survivor| Ok((survivor, reserve(Generation::Old, promotion_bytes)?)));

        match bases {
            Ok((survivor_base, promotion_base)) => {
                let table = Arc::new(ForwardingTable::build(
                    region.index(),
                    ctx.cycle,
                    objects,
                    survivor_base,
                    promotion_base,
                    HEADER_SIZE,
                ));
                *slot = ForwardingSlot::Ready(Arc::clone(&table));
                Ok(Some(table))
            }
            Err(err) => {
                *slot = ForwardingSlot::Aborted;
                region.transition(RegionState::Relocating, RegionState::Used)?;
                self.aborted_regions.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Relocation of region {} aborted, retrying next cycle: {}",
                    region.index(),
                    err
                );
                Ok(None)
            }
        }
    }

    /// Copy `entry` unless another thread already did
    pub fn ensure_copied(
        &self,
        ctx: &RelocationContext<'_>,
        table: &ForwardingTable,
        entry: &ForwardingEntry,
        by_mutator: bool,
    ) {
        let copied = table.ensure_copied(entry, |entry| self.copy_object(ctx, entry));
        if copied && by_mutator {
            self.mutator_copies.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copies land in survivor or promotion regions, which keep headers
    /// inline whatever the source layout was
    fn copy_object(&self, ctx: &RelocationContext<'_>, entry: &ForwardingEntry) {
        let Some(source) = ctx.heap.region_of(entry.from()) else {
            return;
        };
        let to_header = entry.to() - HEADER_SIZE;

        // SAFETY: the destination slice was reserved for this entry only and
        // the source object is live (marked)
        let (age, ref_slots) = unsafe {
            let from = ctx.heap.header(entry.from());
            let (age, ref_slots) = (from.age(), from.ref_slots());
            header::copy_payload(entry.from(), entry.to(), entry.size() - HEADER_SIZE);
            ObjectHeader::initialize(to_header, entry.size(), ref_slots);
            (age, ref_slots)
        };

        let new_age = ctx.policy.next_age(ctx.scope, source.generation(), age);
        // SAFETY: the header was written above
        unsafe { ObjectHeader::at(to_header) }.set_age(new_age);

        let destination = ctx.heap.region_of(entry.to());
        if let Some(destination) = destination {
            destination.record_object_start(entry.to());
            if destination.generation() == Generation::Old {
                self.remember_young_slots(ctx, entry.to(), ref_slots);
            }
        }

        ctx.policy.record_copy(entry.size(), entry.promote());
        self.relocated_objects.fetch_add(1, Ordering::Relaxed);
        self.relocated_bytes
            .fetch_add(entry.size() as u64, Ordering::Relaxed);
        if entry.promote() {
            self.promoted_objects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the young-pointing slots of an old copy
    fn remember_young_slots(&self, ctx: &RelocationContext<'_>, object: usize, ref_slots: usize) {
        for index in 0..ref_slots {
            // SAFETY: index < ref_slots of the freshly copied object
            let slot = unsafe { header::ref_slot(object, index) };
            let target = ColoredPointer::from_raw(slot.load(Ordering::Acquire));
            if target.is_null() {
                continue;
            }
            if let Some(region) = ctx.heap.object_region(target.address()) {
                if region.generation() == Generation::Young {
                    ctx.remembered_sets.record(
                        region.index(),
                        slot as *const std::sync::atomic::AtomicUsize as usize,
                    );
                }
            }
        }
    }

    /// Copy every object of the relocation set with the worker threads
    pub fn relocate_all(&self, ctx: &RelocationContext<'_>) -> Result<()> {
        let set = self.relocation_set();
        let next = AtomicUsize::new(0);
        let worker = || -> Result<()> {
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(&index) = set.get(i) else {
                    return Ok(());
                };
                self.relocate_region(ctx, &ctx.heap.regions()[index])?;
            }
        };

        let threads = self.workers.min(set.len()).max(1);
        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads).map(|_| scope.spawn(&worker)).collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(FgcError::concurrent_modification("relocation worker panicked"))
                    })
                })
                .collect()
        });
        results.into_iter().collect::<Result<Vec<()>>>()?;

        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        Ok(())
    }

    fn relocate_region(&self, ctx: &RelocationContext<'_>, region: &Region) -> Result<()> {
        let Some(table) = self.table_for(ctx, region)? else {
            return Ok(());
        };
        for entry in table.entries() {
            self.ensure_copied(ctx, &table, entry, false);
        }
        region.mark_relocated(ctx.cycle)?;
        self.relocated_regions.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Region {} relocated: {} objects, {} bytes",
            region.index(),
            table.len(),
            table.bytes()
        );
        Ok(())
    }

    /// Forget the relocation set once the cycle ends
    pub fn finish_cycle(&self) {
        self.relocation_set.lock().clear();
    }

    pub(crate) fn record_fault(&self, err: FgcError) {
        log::error!("Relocation fault: {}", err);
        self.fault.lock().get_or_insert(err);
    }

    pub fn take_fault(&self) -> Option<FgcError> {
        self.fault.lock().take()
    }

    pub fn stats(&self) -> RelocationStats {
        RelocationStats {
            selected_regions: self.selected_regions.load(Ordering::Relaxed),
            relocated_regions: self.relocated_regions.load(Ordering::Relaxed),
            aborted_regions: self.aborted_regions.load(Ordering::Relaxed),
            relocated_objects: self.relocated_objects.load(Ordering::Relaxed),
            relocated_bytes: self.relocated_bytes.load(Ordering::Relaxed),
            promoted_objects: self.promoted_objects.load(Ordering::Relaxed),
            mutator_copies: self.mutator_copies.load(Ordering::Relaxed),
        }
    }
}

/// Resolver - forwarding lookup that relocates on access
///
/// Follows forwarding chains through `Relocating` and `Relocated` regions.
/// An entry that is not copied yet is copied by the calling thread before
/// its new address is returned, so the caller never sees an address whose
/// object is still in flight.
pub struct Resolver<'a> {
    ctx: RelocationContext<'a>,
    engine: &'a RelocationEngine,
    by_mutator: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: RelocationContext<'a>, engine: &'a RelocationEngine, by_mutator: bool) -> Self {
        Self {
            ctx,
            engine,
            by_mutator,
        }
    }

    fn step(&self, address: usize) -> Option<usize> {
        let region = self.ctx.heap.object_region(address)?;
        let table = match region.state() {
            RegionState::Relocating => match self.engine.table_for(&self.ctx, region) {
                Ok(table) => table?,
                Err(err) => {
                    self.engine.record_fault(err);
                    return None;
                }
            },
            RegionState::Relocated => region.forwarding_table()?,
            _ => return None,
        };
        let entry = table.lookup(address)?;
        self.engine
            .ensure_copied(&self.ctx, &table, entry, self.by_mutator);
        Some(entry.to())
    }
}

impl ForwardingLookup for Resolver<'_> {
    fn forwarded(&self, address: usize) -> Option<usize> {
        let mut current = self.step(address)?;
        for _ in 1..MAX_FORWARDING_HOPS {
            match self.step(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }
}
