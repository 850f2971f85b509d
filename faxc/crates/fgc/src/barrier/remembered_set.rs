//! Remembered Sets - Old-to-Young Pointer Tracking
//!
//! One set per heap region, keyed by the *target* young region. Each entry
//! is the address of a reference slot inside an old object that held a
//! pointer into that region when it was recorded.
//!
//! Young collections drain these sets at initial mark instead of scanning
//! the old generation.
//!
//! ## Eviction policy
//!
//! A set holds at most `capacity` field addresses. Recording into a full
//! set drops every entry of that region and flags the overflow. Until the
//! next full collection (which clears and rebuilds all sets while tracing)
//! every young collection request runs as a full collection, so a dropped
//! entry can never hide a live young object.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Default)]
struct RememberedSet {
    fields: IndexSet<usize>,
    overflowed: bool,
}

/// Remembered set counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RememberedSetStats {
    pub entries: usize,
    pub records: u64,
    pub overflows: u64,
    pub overflowed: bool,
}

/// RememberedSets - per-region old-to-young field lists
pub struct RememberedSets {
    capacity: usize,
    sets: Box<[Mutex<RememberedSet>]>,
    overflowed: AtomicBool,

    records: AtomicU64,
    overflows: AtomicU64,
}

impl RememberedSets {
    pub fn new(region_count: usize, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sets: (0..region_count)
                .map(|_| Mutex::new(RememberedSet::default()))
                .collect(),
            overflowed: AtomicBool::new(false),
            records: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record `field` as pointing into young region `target_region`
    ///
    /// Returns false when the entry was dropped by the eviction policy.
    pub fn record(&self, target_region: usize, field: usize) -> bool {
        let Some(set) = self.sets.get(target_region) else {
            return false;
        };
        let mut set = set.lock();
        if set.overflowed {
            return false;
        }
        if set.fields.contains(&field) {
            return true;
        }
        if set.fields.len() >= self.capacity {
            set.fields.clear();
            set.overflowed = true;
            self.overflowed.store(true, Ordering::Release);
            self.overflows.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Remembered set of region {} overflowed at {} entries",
                target_region,
                self.capacity
            );
            return false;
        }
        set.fields.insert(field);
        self.records.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take all entries of every region, paired with their target region
    pub fn drain(&self) -> Vec<(usize, Vec<usize>)> {
        self.sets
            .iter()
            .enumerate()
            .filter_map(|(index, set)| {
                let mut set = set.lock();
                if set.fields.is_empty() {
                    None
                } else {
                    Some((index, std::mem::take(&mut set.fields).into_iter().collect()))
                }
            })
            .collect()
    }

    /// Forget every entry and the overflow flags; used when a full
    /// collection starts rebuilding the sets
    pub fn clear_all(&self) {
        for set in self.sets.iter() {
            *set.lock() = RememberedSet::default();
        }
        self.overflowed.store(false, Ordering::Release);
    }

    /// Drop the set of a region that went back to the free list, and every
    /// field that lived inside one of `freed` (start, end) ranges
    pub fn purge(&self, freed_regions: &[usize], freed: &[(usize, usize)]) {
        for &index in freed_regions {
            if let Some(set) = self.sets.get(index) {
                set.lock().fields.clear();
            }
        }
        if freed.is_empty() {
            return;
        }
        for set in self.sets.iter() {
            set.lock()
                .fields
                .retain(|field| !freed.iter().any(|&(start, end)| *field >= start && *field < end));
        }
    }

    /// Whether an overflow happened since the last `clear_all`
    pub fn has_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn len(&self, target_region: usize) -> usize {
        self.sets
            .get(target_region)
            .map_or(0, |set| set.lock().fields.len())
    }

    pub fn contains(&self, target_region: usize, field: usize) -> bool {
        self.sets
            .get(target_region)
            .map_or(false, |set| set.lock().fields.contains(&field))
    }

    pub fn total_entries(&self) -> usize {
        self.sets.iter().map(|set| set.lock().fields.len()).sum()
    }

    pub fn stats(&self) -> RememberedSetStats {
        RememberedSetStats {
            entries: self.total_entries(),
            records: self.records.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            overflowed: self.has_overflowed(),
        }
    }
}
