//! Root Registry - GC Root Slot Management
//!
//! Roots are starting points for marking. A root is a word-sized slot
//! outside the heap (a global, a stack spill slot, a `Root` handle) holding
//! a raw colored-pointer word. The compiled program registers the slot
//! address; the collector reads and heals the slot at initial mark.
//!
//! # Thread Safety
//!
//! Registration may happen from any thread at any time. Registration is
//! counted, so the same slot may be registered twice and must then be
//! unregistered twice.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{FgcError, Result};
use crate::object::header::WORD_SIZE;

/// RootSet - registered root slots
pub struct RootSet {
    slots: Mutex<IndexMap<usize, usize>>,
    registrations: AtomicU64,
}

impl RootSet {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(IndexMap::new()),
            registrations: AtomicU64::new(0),
        }
    }

    /// Register the slot at `slot_address`
    pub fn register(&self, slot_address: usize) -> Result<()> {
        if slot_address == 0 || slot_address % WORD_SIZE != 0 {
            return Err(FgcError::InvalidArgument(format!(
                "root slot {:#x} is null or misaligned",
                slot_address
            )));
        }
        *self.slots.lock().entry(slot_address).or_insert(0) += 1;
        self.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop one registration of `slot_address`
    pub fn unregister(&self, slot_address: usize) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&slot_address) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                slots.swap_remove(&slot_address);
            }
            None => {
                return Err(FgcError::InvalidArgument(format!(
                    "root slot {:#x} is not registered",
                    slot_address
                )))
            }
        }
        Ok(())
    }

    pub fn contains(&self, slot_address: usize) -> bool {
        self.slots.lock().contains_key(&slot_address)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Slot addresses registered right now
    pub fn snapshot(&self) -> Vec<usize> {
        self.slots.lock().keys().copied().collect()
    }

    /// Run `f` on every registered slot
    ///
    /// # Safety
    /// Every registered slot must still be a valid, word-aligned
    /// `AtomicUsize` (the registration contract).
    pub unsafe fn for_each_slot(&self, mut f: impl FnMut(&AtomicUsize)) {
        for slot_address in self.snapshot() {
            f(&*(slot_address as *const AtomicUsize));
        }
    }

    pub fn total_registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_counted() {
        let roots = RootSet::new();
        let slot = Box::new(AtomicUsize::new(0));
        let address = &*slot as *const AtomicUsize as usize;

        roots.register(address).unwrap();
        roots.register(address).unwrap();
        assert_eq!(roots.len(), 1);
        roots.unregister(address).unwrap();
        assert!(roots.contains(address));
        roots.unregister(address).unwrap();
        assert!(roots.is_empty());
        assert!(roots.unregister(address).is_err());
    }

    #[test]
    fn test_rejects_bad_slots() {
        let roots = RootSet::new();
        assert!(matches!(roots.register(0), Err(FgcError::InvalidArgument(_))));
        assert!(roots.register(0x1003).is_err());
    }

    #[test]
    fn test_for_each_slot_reads_values() {
        let roots = RootSet::new();
        let slots: Vec<Box<AtomicUsize>> = (1..=3).map(|v| Box::new(AtomicUsize::new(v))).collect();
        for slot in &slots {
            roots.register(&**slot as *const AtomicUsize as usize).unwrap();
        }
        let mut sum = 0;
        unsafe { roots.for_each_slot(|slot| sum += slot.load(Ordering::Relaxed)) };
        assert_eq!(sum, 6);
    }
}
