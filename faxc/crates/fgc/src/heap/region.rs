//! Region Implementation - Unit of Heap Management
//!
//! Region is a contiguous block of memory with fixed size, carved out of the
//! heap reservation at init. Every region has a defined lifecycle state.
//!
//! Size classes:
//! - Small: backs thread-local allocation buffers
//! - Medium: shared bump allocation and relocation destinations. Regions
//!   serving medium objects keep headers in a side table.
//! - Large: one object spanning one or more contiguous regions, never moved
//!
//! Region Lifecycle:
//! ```text
//! Empty ──▶ Used ──▶ Relocating ──▶ Relocated ──▶ Empty
//!             │  ▲        │
//!             ▼  │        └──(destination reservation failed)──▶ Used
//!            Pinned
//! ```
//!
//! # Memory Ordering Model
//!
//! ## Region State
//! - Transitions use `compare_exchange` with `AcqRel`. A failed transition
//!   means two actors disagreed about the lifecycle and is reported as
//!   `ConcurrentModification`.
//!
//! ## Bump Pointer
//! - CAS loop with `AcqRel`; each successful CAS hands out a disjoint range.
//!
//! ## Live Accounting
//! - `Relaxed` adds during marking. Read only after the marking phase has
//!   ended, which is ordered by the Remark pause.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::error::{FgcError, Result};
use crate::marker::bitmap::MarkBitmap;
use crate::object::ObjectHeader;
use crate::relocate::forwarding::{ForwardingSlot, ForwardingTable};

/// Region lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionState {
    Empty = 0,
    Used = 1,
    Relocating = 2,
    Relocated = 3,
    Pinned = 4,
}

impl RegionState {
    fn from_u8(value: u8) -> RegionState {
        match value {
            1 => RegionState::Used,
            2 => RegionState::Relocating,
            3 => RegionState::Relocated,
            4 => RegionState::Pinned,
            _ => RegionState::Empty,
        }
    }

    /// Regions holding objects that mutators may still reach directly
    pub fn holds_objects(self) -> bool {
        matches!(self, RegionState::Used | RegionState::Pinned | RegionState::Relocating)
    }
}

/// Region size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SizeClass {
    Small = 0,
    Medium = 1,
    Large = 2,
}

impl SizeClass {
    fn from_u8(value: u8) -> SizeClass {
        match value {
            1 => SizeClass::Medium,
            2 => SizeClass::Large,
            _ => SizeClass::Small,
        }
    }
}

/// Generation a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Generation {
    Young = 0,
    Old = 1,
}

impl Generation {
    fn from_u8(value: u8) -> Generation {
        if value == 1 {
            Generation::Old
        } else {
            Generation::Young
        }
    }
}

/// Per-region side bitmaps, keyed by object (payload) address
pub struct RegionBitmaps {
    /// Objects marked live in the current cycle
    pub marks: MarkBitmap,
    /// Objects ever allocated in the region since it was last freed
    pub starts: MarkBitmap,
}

/// Region - unit of heap management
///
/// Thread Safety:
/// Every mutable attribute is atomic; the forwarding slot is behind a
/// read-mostly lock.
pub struct Region {
    index: usize,
    start: usize,
    size: usize,

    state: AtomicU8,
    size_class: AtomicU8,
    generation: AtomicU8,

    /// Bump pointer; for a large head region the end of the large object
    top: AtomicUsize,

    /// Head region index of a large span (self for every other region)
    head: AtomicUsize,
    /// Number of regions in a large span (1 otherwise)
    span: AtomicUsize,

    /// Cycle during which the region was taken from the free set
    alloc_cycle: AtomicU64,

    live_bytes: AtomicUsize,
    survivor_bytes: AtomicUsize,
    promote_bytes: AtomicUsize,
    live_estimate: AtomicUsize,

    relocated_cycle: AtomicU64,
    relocated_young: AtomicBool,
    pin_count: AtomicUsize,

    bitmaps: OnceLock<RegionBitmaps>,
    forwarding: RwLock<ForwardingSlot>,

    /// Object starts in a side-header region are at least this far apart
    header_granule: usize,
    side_headers_enabled: AtomicBool,
    side_headers: OnceLock<Box<[ObjectHeader]>>,
}

impl Region {
    pub fn new(index: usize, start: usize, size: usize, header_granule: usize) -> Self {
        Self {
            index,
            start,
            size,
            state: AtomicU8::new(RegionState::Empty as u8),
            size_class: AtomicU8::new(SizeClass::Small as u8),
            generation: AtomicU8::new(Generation::Young as u8),
            top: AtomicUsize::new(start),
            head: AtomicUsize::new(index),
            span: AtomicUsize::new(1),
            alloc_cycle: AtomicU64::new(0),
            live_bytes: AtomicUsize::new(0),
            survivor_bytes: AtomicUsize::new(0),
            promote_bytes: AtomicUsize::new(0),
            live_estimate: AtomicUsize::new(0),
            relocated_cycle: AtomicU64::new(0),
            relocated_young: AtomicBool::new(false),
            pin_count: AtomicUsize::new(0),
            bitmaps: OnceLock::new(),
            forwarding: RwLock::new(ForwardingSlot::Empty),
            header_granule: header_granule.max(1),
            side_headers_enabled: AtomicBool::new(false),
            side_headers: OnceLock::new(),
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing if another actor changed the state
    pub fn transition(&self, from: RegionState, to: RegionState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                FgcError::concurrent_modification(format!(
                    "region {} transition {:?} -> {:?} (found {:?})",
                    self.index,
                    from,
                    to,
                    RegionState::from_u8(actual)
                ))
            })
    }

    /// Prepare a region just taken from the free set
    pub(crate) fn activate(
        &self,
        size_class: SizeClass,
        generation: Generation,
        cycle: u64,
        head: usize,
        span: usize,
    ) -> Result<()> {
        self.transition(RegionState::Empty, RegionState::Used)?;
        self.size_class.store(size_class as u8, Ordering::Relaxed);
        self.generation.store(generation as u8, Ordering::Relaxed);
        self.top.store(self.start, Ordering::Release);
        self.head.store(head, Ordering::Relaxed);
        self.span.store(span, Ordering::Relaxed);
        self.alloc_cycle.store(cycle, Ordering::Release);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.survivor_bytes.store(0, Ordering::Relaxed);
        self.promote_bytes.store(0, Ordering::Relaxed);
        self.live_estimate.store(0, Ordering::Relaxed);
        self.pin_count.store(0, Ordering::Relaxed);
        self.bitmaps();
        Ok(())
    }

    /// Return the region to `Empty`, dropping all per-cycle metadata
    pub(crate) fn release(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, RegionState::Used | RegionState::Relocated) {
            return Err(FgcError::concurrent_modification(format!(
                "releasing region {} in state {:?}",
                self.index, state
            )));
        }
        if let Some(bitmaps) = self.bitmaps.get() {
            bitmaps.marks.clear();
            bitmaps.starts.clear();
        }
        *self.forwarding.write() = ForwardingSlot::Empty;
        self.top.store(self.start, Ordering::Release);
        self.head.store(self.index, Ordering::Relaxed);
        self.span.store(1, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.live_estimate.store(0, Ordering::Relaxed);
        self.relocated_young.store(false, Ordering::Relaxed);
        self.side_headers_enabled.store(false, Ordering::Release);
        self.transition(state, RegionState::Empty)
    }

    pub fn size_class(&self) -> SizeClass {
        SizeClass::from_u8(self.size_class.load(Ordering::Relaxed))
    }

    pub fn generation(&self) -> Generation {
        Generation::from_u8(self.generation.load(Ordering::Relaxed))
    }

    pub fn alloc_cycle(&self) -> u64 {
        self.alloc_cycle.load(Ordering::Acquire)
    }

    /// Regions taken during `cycle` are implicitly live for that cycle
    pub fn allocated_during(&self, cycle: u64) -> bool {
        self.alloc_cycle() == cycle
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    pub fn span(&self) -> usize {
        self.span.load(Ordering::Relaxed)
    }

    pub fn is_large_continuation(&self) -> bool {
        self.size_class() == SizeClass::Large && self.head() != self.index
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Bump-allocate exactly `size` bytes
    pub fn bump(&self, size: usize) -> Option<usize> {
        self.bump_range(size, size).map(|(address, _)| address)
    }

    /// Bump-allocate between `min` and `desired` bytes, taking whatever is
    /// left if it is at least `min`
    pub fn bump_range(&self, min: usize, desired: usize) -> Option<(usize, usize)> {
        let limit = self.end();
        let mut top = self.top.load(Ordering::Acquire);
        loop {
            let available = limit.saturating_sub(top);
            if available < min {
                return None;
            }
            let len = desired.min(available);
            match self
                .top
                .compare_exchange_weak(top, top + len, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((top, len)),
                Err(current) => top = current,
            }
        }
    }

    /// Record the end of the large object headed by this region
    pub(crate) fn set_large_top(&self, top: usize) {
        self.top.store(top, Ordering::Release);
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Bytes handed out from this region (whole object for a large head)
    pub fn used_bytes(&self) -> usize {
        self.top() - self.start
    }

    pub fn remaining(&self) -> usize {
        self.end().saturating_sub(self.top())
    }

    // ------------------------------------------------------------------
    // Marking
    // ------------------------------------------------------------------

    pub fn bitmaps(&self) -> &RegionBitmaps {
        self.bitmaps.get_or_init(|| RegionBitmaps {
            marks: MarkBitmap::new(self.start, self.size),
            starts: MarkBitmap::new(self.start, self.size),
        })
    }

    /// Mark the object at `object`; true if newly marked
    pub fn mark(&self, object: usize) -> bool {
        self.bitmaps().marks.mark(object)
    }

    pub fn is_marked(&self, object: usize) -> bool {
        self.bitmaps().marks.is_marked(object)
    }

    /// Whether an object was ever placed at `object`
    pub fn is_object_start(&self, object: usize) -> bool {
        self.bitmaps().starts.is_marked(object)
    }

    pub(crate) fn record_object_start(&self, object: usize) {
        self.bitmaps().starts.mark(object);
    }

    // ------------------------------------------------------------------
    // Side headers
    // ------------------------------------------------------------------

    /// Keep the headers of objects allocated from now on in the side table.
    /// Must be called before the first bump after activation.
    pub(crate) fn enable_side_headers(&self) {
        self.side_headers.get_or_init(|| {
            (0..self.size / self.header_granule)
                .map(|_| ObjectHeader::empty())
                .collect()
        });
        self.side_headers_enabled.store(true, Ordering::Release);
    }

    pub fn has_side_headers(&self) -> bool {
        self.side_headers_enabled.load(Ordering::Acquire)
    }

    /// Side-table header of the object at `object`, `None` when the region
    /// stores headers inline
    pub fn side_header(&self, object: usize) -> Option<&ObjectHeader> {
        if !self.has_side_headers() || !self.contains(object) {
            return None;
        }
        self.side_headers
            .get()?
            .get((object - self.start) / self.header_granule)
    }

    /// Account a newly marked object
    pub(crate) fn record_live(&self, size: usize, promote: bool) {
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        if promote {
            self.promote_bytes.fetch_add(size, Ordering::Relaxed);
        } else {
            self.survivor_bytes.fetch_add(size, Ordering::Relaxed);
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn survivor_bytes(&self) -> usize {
        self.survivor_bytes.load(Ordering::Acquire)
    }

    pub fn promote_bytes(&self) -> usize {
        self.promote_bytes.load(Ordering::Acquire)
    }

    /// Live bytes measured by the last completed marking
    pub fn live_estimate(&self) -> usize {
        self.live_estimate.load(Ordering::Relaxed)
    }

    pub fn live_ratio(&self) -> f64 {
        self.live_bytes() as f64 / self.size as f64
    }

    /// Publish this cycle's live bytes as the estimate and clear marks
    pub(crate) fn finish_marking(&self) {
        self.live_estimate
            .store(self.live_bytes.swap(0, Ordering::AcqRel), Ordering::Relaxed);
        self.survivor_bytes.store(0, Ordering::Relaxed);
        self.promote_bytes.store(0, Ordering::Relaxed);
        if let Some(bitmaps) = self.bitmaps.get() {
            bitmaps.marks.clear();
        }
    }

    // ------------------------------------------------------------------
    // Relocation
    // ------------------------------------------------------------------

    pub(crate) fn forwarding_slot(&self) -> &RwLock<ForwardingSlot> {
        &self.forwarding
    }

    /// Forwarding table, once built
    pub fn forwarding_table(&self) -> Option<Arc<ForwardingTable>> {
        match &*self.forwarding.read() {
            ForwardingSlot::Ready(table) => Some(Arc::clone(table)),
            _ => None,
        }
    }

    pub(crate) fn mark_relocated(&self, cycle: u64) -> Result<()> {
        self.relocated_cycle.store(cycle, Ordering::Relaxed);
        self.relocated_young
            .store(self.generation() == Generation::Young, Ordering::Relaxed);
        self.transition(RegionState::Relocating, RegionState::Relocated)
    }

    pub fn relocated_cycle(&self) -> u64 {
        self.relocated_cycle.load(Ordering::Relaxed)
    }

    /// Generation of the region when it was relocated
    pub fn relocated_young(&self) -> bool {
        self.relocated_young.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    pub(crate) fn pin(&self) -> Result<()> {
        if self.pin_count.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(err) = self.transition(RegionState::Used, RegionState::Pinned) {
                self.pin_count.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn unpin(&self) -> Result<()> {
        let previous = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| FgcError::InvalidArgument(format!("region {} is not pinned", self.index)))?;
        if previous == 1 {
            self.transition(RegionState::Pinned, RegionState::Used)?;
        }
        Ok(())
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("start", &format_args!("{:#x}", self.start))
            .field("state", &self.state())
            .field("size_class", &self.size_class())
            .field("generation", &self.generation())
            .field("used", &self.used_bytes())
            .field("live", &self.live_bytes())
            .finish()
    }
}
