//! Load Barrier Implementation
//!
//! Every reference load from the heap (and every root read) goes through
//! the load barrier. The loaded word is healed against the current parity
//! and the forwarding tables; when healing changed it, the corrected word is
//! written back to the slot with a CAS so the next load takes the fast path.
//!
//! Load Barrier Pseudocode:
//! ```text
//! function LOAD_BARRIER(slot):
//!     loop:
//!         raw = LOAD(slot)
//!         healed = HEAL(raw, parity, forwarding)
//!         if healed == raw: return raw          // fast path
//!         if CAS(slot, raw, healed): return healed
//!         // a mutator stored a new value: heal that one
//! ```
//!
//! Healing is idempotent, so any number of threads may race on one slot.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

use super::colored_ptr::{ColoredPointer, ForwardingLookup, Parity};

/// Heal the pointer stored in `slot`, writing the healed word back
///
/// Returns the healed pointer and whether this call updated the slot.
pub fn heal_slot<L>(slot: &AtomicUsize, parity: Parity, lookup: &L) -> (ColoredPointer, bool)
where
    L: ForwardingLookup + ?Sized,
{
    let mut raw = slot.load(Ordering::Acquire);
    loop {
        let pointer = ColoredPointer::from_raw(raw);
        let healed = pointer.heal(parity, lookup);
        if healed == pointer {
            return (pointer, false);
        }
        match slot.compare_exchange(raw, healed.raw(), Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return (healed, true),
            Err(current) => raw = current,
        }
    }
}

/// Load barrier counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadBarrierStats {
    pub loads: u64,
    pub healed: u64,
}

/// LoadBarrier - current parity plus counters
///
/// Thread Safety:
/// Lock-free; the parity only changes inside the initial mark pause.
pub struct LoadBarrier {
    parity: AtomicU8,
    loads: AtomicU64,
    healed: AtomicU64,
}

impl LoadBarrier {
    pub fn new() -> Self {
        Self {
            parity: AtomicU8::new(Parity::Even.as_u8()),
            loads: AtomicU64::new(0),
            healed: AtomicU64::new(0),
        }
    }

    pub fn parity(&self) -> Parity {
        Parity::from_u8(self.parity.load(Ordering::Acquire))
    }

    pub(crate) fn set_parity(&self, parity: Parity) {
        self.parity.store(parity.as_u8(), Ordering::Release);
    }

    /// Load and heal a reference slot
    #[inline]
    pub fn load<L>(&self, slot: &AtomicUsize, lookup: &L) -> ColoredPointer
    where
        L: ForwardingLookup + ?Sized,
    {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let (pointer, updated) = heal_slot(slot, self.parity(), lookup);
        if updated {
            self.healed.fetch_add(1, Ordering::Relaxed);
        }
        pointer
    }

    /// Heal a pointer value that does not live in a slot
    #[inline]
    pub fn heal<L>(&self, pointer: ColoredPointer, lookup: &L) -> ColoredPointer
    where
        L: ForwardingLookup + ?Sized,
    {
        pointer.heal(self.parity(), lookup)
    }

    pub fn stats(&self) -> LoadBarrierStats {
        LoadBarrierStats {
            loads: self.loads.load(Ordering::Relaxed),
            healed: self.healed.load(Ordering::Relaxed),
        }
    }
}

impl Default for LoadBarrier {
    fn default() -> Self {
        Self::new()
    }
}
