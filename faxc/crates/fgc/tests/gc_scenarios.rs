//! End-to-End Scenarios
//!
//! Each test drives a fresh collector through one complete user-visible
//! workflow:
//! - Medium objects packed two per region
//! - Heap-threshold trigger starting a background cycle
//! - Weak reference cleared by a full collection
//! - Stale pointer healed to its forwarded copy

mod common;

use common::*;
use fgc::barrier::Color;
use fgc::config::{KB, MB};
use fgc::{GcConfig, GcGeneration, GcPhase, ReferenceKind};

// ============================================================================
// ALLOCATION PACKING
// ============================================================================

/// Four 1MB objects on an 8MB heap with 2MB regions fit in two regions
#[test]
fn test_four_megabyte_objects_share_two_regions() {
    // Arrange
    let gc = GcFixture::with_config(GcConfig::for_heap(8 * MB, 1));
    assert_eq!(gc.config().region_size, 2 * MB);

    // Act
    let objects: Vec<_> = (0..4)
        .map(|_| gc.allocate(MB).expect("1MB allocation should succeed"))
        .collect();

    // Assert: medium headers live beside the region, not in it
    let stats = gc.heap_stats();
    assert!(
        stats.used_regions <= 2,
        "four 1MB objects used {} regions",
        stats.used_regions
    );
    assert_eq!(stats.used_bytes, 4 * MB);
    for (i, object) in objects.iter().enumerate() {
        assert_eq!(gc.payload_size(*object).unwrap(), MB);
        gc.write_word(*object, 0, i as u64).unwrap();
        gc.write_word(*object, MB - 8, i as u64).unwrap();
    }
    // Neighbouring payloads do not overlap
    for (i, object) in objects.iter().enumerate() {
        assert_eq!(gc.read_word(*object, 0).unwrap(), i as u64);
        assert_eq!(gc.read_word(*object, MB - 8).unwrap(), i as u64);
    }
    assert_healthy(&gc);
}

// ============================================================================
// HEAP THRESHOLD TRIGGER
// ============================================================================

/// Crossing trigger_heap_usage starts a background cycle on its own
#[test]
fn test_allocation_past_threshold_starts_cycle() {
    // Arrange
    let gc = GcFixture::with_config(GcConfig {
        trigger_heap_usage: 0.75,
        ..GcConfig::for_heap(8 * MB, 1)
    });
    assert_eq!(gc.phase(), GcPhase::Idle);

    // Act: unrooted 900KB objects until more than 6MB is in use
    while gc.heap_stats().used_bytes <= 6 * MB {
        gc.allocate(900 * KB).expect("allocation below the heap limit");
    }
    assert!(gc.wait_for_idle(TEST_TIMEOUT));

    // Assert
    let history = gc.phase_history();
    assert!(
        history
            .iter()
            .any(|t| t.from == GcPhase::Idle && t.to == GcPhase::InitialMark),
        "no cycle started: {:?}",
        history
    );
    assert!(gc.metrics().cycles >= 1);
    assert_healthy(&gc);
}

/// Below the trigger nothing runs
#[test]
fn test_allocation_below_threshold_stays_idle() {
    let gc = GcFixture::with_config(GcConfig::for_heap(8 * MB, 1));
    allocate_garbage(&gc, 4, 900 * KB);
    assert!(gc.wait_for_idle(TEST_TIMEOUT));
    assert!(gc.phase_history().is_empty());
    assert_eq!(gc.metrics().cycles, 0);
}

// ============================================================================
// WEAK REFERENCES
// ============================================================================

/// A weak reference to an unrooted object reads cleared after a full cycle
#[test]
fn test_weak_reference_cleared_after_full_collection() {
    // Arrange
    let gc = GcFixture::with_defaults();
    let target = node(&gc, 0, 7);
    let weak = gc
        .create_reference(ReferenceKind::Weak, target)
        .expect("weak reference creation should succeed");
    assert_eq!(
        gc.reference_get(&weak).unwrap().map(|p| p.address()),
        Some(target.address())
    );

    // Act: target was never rooted
    gc.collect(GcGeneration::Full).unwrap();

    // Assert
    assert!(weak.is_cleared());
    assert_eq!(gc.reference_get(&weak).unwrap(), None);
    let queued = gc
        .poll_reference_queue()
        .expect("cleared weak reference should be queued");
    assert_eq!(queued.id(), weak.id());
    assert!(gc.metrics().cleared_references >= 1);
    assert_healthy(&gc);
}

/// A weak reference to a rooted object survives
#[test]
fn test_weak_reference_to_rooted_object_kept() {
    let gc = GcFixture::with_defaults();
    let target = node(&gc, 0, 9);
    let root = gc.root(target).unwrap();
    let weak = gc.create_reference(ReferenceKind::Weak, target).unwrap();

    gc.collect(GcGeneration::Full).unwrap();

    let referent = gc.reference_get(&weak).unwrap().expect("referent kept");
    assert_eq!(referent.address(), root.get().address());
    assert_eq!(value_of(&gc, referent, 0), 9);
    assert!(gc.poll_reference_queue().is_none());
}

// ============================================================================
// POINTER HEALING
// ============================================================================

/// A pointer held across relocation heals to the forwarding entry
#[test]
fn test_stale_pointer_heals_to_forwarded_copy() {
    // Arrange: one small live object in an otherwise empty young region
    let gc = GcFixture::with_defaults();
    let stale = node(&gc, 0, 1234);
    let root = gc.root(stale).unwrap();

    // Act
    gc.collect(GcGeneration::Young).unwrap();

    // Assert
    let forwarded = gc
        .forwarding_of(stale)
        .expect("sparse region should have been relocated");
    assert_ne!(forwarded, stale.address());

    let healed = gc.resolve(stale).unwrap();
    assert_eq!(healed.address(), forwarded);
    assert_eq!(healed.color(), Color::Remapped);
    assert!(healed.is_remapped());
    assert_eq!(root.get().address(), forwarded);
    assert_eq!(value_of(&gc, healed, 0), 1234);
    assert!(gc.metrics().relocated_objects >= 1);
    assert_healthy(&gc);
}
