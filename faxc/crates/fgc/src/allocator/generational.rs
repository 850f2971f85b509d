//! Generational Policy - Young/Old Generation Management
//!
//! Based on the observation that:
//! - Most objects die young
//! - Objects that survive tend to live long
//!
//! Every object starts young with age 0. A young collection copies each
//! surviving young object with age + 1; once the new age reaches the tenure
//! threshold the copy goes to an old region instead. Full collections keep
//! ages and generations unchanged.
//!
//! Young collections trace only young regions. Old-to-young edges are
//! found through the remembered sets, so the pause is independent of the
//! old generation's size.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::MAX_TENURE_THRESHOLD;
use crate::heap::Generation;

/// Collection scope requested from the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GcGeneration {
    /// Young regions only (roots + remembered sets)
    Young,
    /// Whole heap
    Full,
}

impl std::fmt::Display for GcGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcGeneration::Young => write!(f, "young"),
            GcGeneration::Full => write!(f, "full"),
        }
    }
}

/// GenerationalStats - counters kept by the policy
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationalStats {
    pub young_collections: u64,
    pub full_collections: u64,
    pub upgraded_collections: u64,
    pub promoted_objects: u64,
    pub promoted_bytes: u64,
    pub survivor_objects: u64,
    pub survivor_bytes: u64,
}

/// GenerationalPolicy - ages, promotion and collection scope
pub struct GenerationalPolicy {
    enabled: bool,
    tenure_threshold: u8,

    young_collections: AtomicU64,
    full_collections: AtomicU64,
    upgraded_collections: AtomicU64,
    promoted_objects: AtomicU64,
    promoted_bytes: AtomicU64,
    survivor_objects: AtomicU64,
    survivor_bytes: AtomicU64,
}

impl GenerationalPolicy {
    pub fn new(enabled: bool, tenure_threshold: u8) -> Self {
        Self {
            enabled,
            tenure_threshold: tenure_threshold.clamp(1, MAX_TENURE_THRESHOLD),
            young_collections: AtomicU64::new(0),
            full_collections: AtomicU64::new(0),
            upgraded_collections: AtomicU64::new(0),
            promoted_objects: AtomicU64::new(0),
            promoted_bytes: AtomicU64::new(0),
            survivor_objects: AtomicU64::new(0),
            survivor_bytes: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tenure_threshold(&self) -> u8 {
        self.tenure_threshold
    }

    /// Scope actually run for a request
    ///
    /// Young requests become full collections when generational mode is off
    /// or a remembered set lost entries since the last full collection.
    pub fn scope_for(&self, requested: GcGeneration, remembered_sets_overflowed: bool) -> GcGeneration {
        let scope = match requested {
            GcGeneration::Young if self.enabled && !remembered_sets_overflowed => GcGeneration::Young,
            GcGeneration::Young => {
                self.upgraded_collections.fetch_add(1, Ordering::Relaxed);
                GcGeneration::Full
            }
            GcGeneration::Full => GcGeneration::Full,
        };
        match scope {
            GcGeneration::Young => self.young_collections.fetch_add(1, Ordering::Relaxed),
            GcGeneration::Full => self.full_collections.fetch_add(1, Ordering::Relaxed),
        };
        scope
    }

    /// Generation to request when the occupancy trigger fires
    pub fn background_generation(&self, old_occupancy: f64) -> GcGeneration {
        if self.enabled && old_occupancy < 0.5 {
            GcGeneration::Young
        } else {
            GcGeneration::Full
        }
    }

    /// Whether objects in a `generation` region are traced by `scope`
    pub fn traces(&self, scope: GcGeneration, generation: Generation) -> bool {
        scope == GcGeneration::Full || generation == Generation::Young
    }

    /// Whether a young survivor of age `age` is promoted by `scope`
    pub fn should_promote(&self, scope: GcGeneration, generation: Generation, age: u8) -> bool {
        self.enabled
            && scope == GcGeneration::Young
            && generation == Generation::Young
            && age.saturating_add(1) >= self.tenure_threshold
    }

    /// Age stored in the copy of a relocated object
    pub fn next_age(&self, scope: GcGeneration, generation: Generation, age: u8) -> u8 {
        if scope == GcGeneration::Young && generation == Generation::Young {
            age.saturating_add(1).min(MAX_TENURE_THRESHOLD)
        } else {
            age
        }
    }

    /// Destination generation of a relocated object
    pub fn destination(&self, source: Generation, promote: bool) -> Generation {
        if promote {
            Generation::Old
        } else {
            source
        }
    }

    pub(crate) fn record_copy(&self, size: usize, promoted: bool) {
        if promoted {
            self.promoted_objects.fetch_add(1, Ordering::Relaxed);
            self.promoted_bytes.fetch_add(size as u64, Ordering::Relaxed);
        } else {
            self.survivor_objects.fetch_add(1, Ordering::Relaxed);
            self.survivor_bytes.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> GenerationalStats {
        GenerationalStats {
            young_collections: self.young_collections.load(Ordering::Relaxed),
            full_collections: self.full_collections.load(Ordering::Relaxed),
            upgraded_collections: self.upgraded_collections.load(Ordering::Relaxed),
            promoted_objects: self.promoted_objects.load(Ordering::Relaxed),
            promoted_bytes: self.promoted_bytes.load(Ordering::Relaxed),
            survivor_objects: self.survivor_objects.load(Ordering::Relaxed),
            survivor_bytes: self.survivor_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_after_two_young_collections() {
        let policy = GenerationalPolicy::new(true, 2);
        let scope = GcGeneration::Young;

        // First survival: age 0 -> 1, stays young
        assert!(!policy.should_promote(scope, Generation::Young, 0));
        assert_eq!(policy.next_age(scope, Generation::Young, 0), 1);

        // Second survival: age 1 -> 2, promoted
        assert!(policy.should_promote(scope, Generation::Young, 1));
        assert_eq!(policy.destination(Generation::Young, true), Generation::Old);
    }

    #[test]
    fn test_full_collection_keeps_age() {
        let policy = GenerationalPolicy::new(true, 2);
        assert!(!policy.should_promote(GcGeneration::Full, Generation::Young, 5));
        assert_eq!(policy.next_age(GcGeneration::Full, Generation::Young, 1), 1);
        assert!(!policy.should_promote(GcGeneration::Young, Generation::Old, 5));
    }

    #[test]
    fn test_scope_upgrades() {
        let enabled = GenerationalPolicy::new(true, 2);
        assert_eq!(enabled.scope_for(GcGeneration::Young, false), GcGeneration::Young);
        assert_eq!(enabled.scope_for(GcGeneration::Young, true), GcGeneration::Full);
        assert_eq!(enabled.stats().upgraded_collections, 1);

        let disabled = GenerationalPolicy::new(false, 2);
        assert_eq!(disabled.scope_for(GcGeneration::Young, false), GcGeneration::Full);
        assert!(!disabled.should_promote(GcGeneration::Young, Generation::Young, 9));
    }

    #[test]
    fn test_tracing_scope() {
        let policy = GenerationalPolicy::new(true, 2);
        assert!(policy.traces(GcGeneration::Young, Generation::Young));
        assert!(!policy.traces(GcGeneration::Young, Generation::Old));
        assert!(policy.traces(GcGeneration::Full, Generation::Old));
    }
}
