//! Generational Collection Tests
//!
//! Survivors age once per young cycle and are promoted at the tenure
//! threshold. Old-to-young pointers are found through remembered sets, so a
//! young cycle never frees an object only an old object points to.

mod common;

use common::*;
use fgc::config::MB;
use fgc::heap::Generation;
use fgc::{GcConfig, GcGeneration};

fn region_generation(gc: &fgc::GarbageCollector, object: fgc::ColoredPointer) -> Generation {
    gc.heap()
        .region_of(object.address())
        .expect("object should be inside the heap")
        .generation()
}

// ============================================================================
// PROMOTION
// ============================================================================

#[test]
fn test_survivor_promoted_at_tenure_threshold() {
    // Arrange
    let gc = GcFixture::with_config(GcConfig {
        tenure_threshold: 2,
        ..GcConfig::for_heap(16 * MB, 2)
    });
    let root = rooted_list(&gc, 4);
    assert_eq!(region_generation(&gc, root.get()), Generation::Young);

    // Act: first young cycle only ages the list
    gc.collect(GcGeneration::Young).unwrap();
    assert_eq!(region_generation(&gc, root.get()), Generation::Young);
    assert_eq!(gc.diagnostics().generational.promoted_objects, 0);

    // Second young cycle promotes it
    gc.collect(GcGeneration::Young).unwrap();

    // Assert
    assert_eq!(region_generation(&gc, root.get()), Generation::Old);
    assert_eq!(gc.diagnostics().generational.promoted_objects, 4);
    assert_eq!(gc.metrics().promoted_objects, 4);
    assert_eq!(list_values(&gc, &root), vec![0, 1, 2, 3]);
    assert!(gc.heap_stats().old_regions >= 1);
    assert_healthy(&gc);
}

#[test]
fn test_full_collection_does_not_age_objects() {
    let gc = GcFixture::with_defaults();
    let root = rooted_list(&gc, 2);

    for _ in 0..3 {
        gc.collect(GcGeneration::Full).unwrap();
    }

    assert_eq!(region_generation(&gc, root.get()), Generation::Young);
    assert_eq!(gc.metrics().promoted_objects, 0);
    assert_eq!(list_values(&gc, &root), vec![0, 1]);
}

// ============================================================================
// REMEMBERED SETS
// ============================================================================

#[test]
fn test_old_to_young_reference_keeps_child_alive() {
    // Arrange: promote a parent into the old generation
    let gc = GcFixture::with_config(GcConfig {
        tenure_threshold: 1,
        ..GcConfig::for_heap(16 * MB, 2)
    });
    let parent = node(&gc, 1, 100);
    let root = gc.root(parent).unwrap();
    gc.collect(GcGeneration::Young).unwrap();
    let parent = root.get();
    assert_eq!(region_generation(&gc, parent), Generation::Old);

    // Act: a young child reachable only through the old parent
    let child = node(&gc, 0, 200);
    gc.store_ref(parent, 0, child).unwrap();
    assert!(gc.diagnostics().remembered_sets.entries >= 1);
    gc.collect(GcGeneration::Young).unwrap();

    // Assert
    let child = gc.load_ref(root.get(), 0).unwrap();
    assert!(!child.is_null());
    assert_eq!(value_of(&gc, child, 0), 200);
    assert_healthy(&gc);
}

#[test]
fn test_young_cycle_leaves_old_garbage() {
    let gc = GcFixture::with_config(GcConfig {
        tenure_threshold: 1,
        ..GcConfig::for_heap(16 * MB, 2)
    });
    let garbage = node(&gc, 0, 1);
    let root = gc.root(garbage).unwrap();
    gc.collect(GcGeneration::Young).unwrap();
    let promoted = root.get();
    assert_eq!(region_generation(&gc, promoted), Generation::Old);

    // Unrooted old objects survive young cycles and die in a full one
    root.set(fgc::ColoredPointer::NULL).unwrap();
    gc.collect(GcGeneration::Young).unwrap();
    assert_eq!(gc.heap_stats().old_regions, 1);

    gc.collect(GcGeneration::Full).unwrap();
    gc.collect(GcGeneration::Full).unwrap();
    assert_eq!(gc.heap_stats().old_regions, 0);
    assert_healthy(&gc);
}

#[test]
fn test_young_request_upgraded_when_not_generational() {
    let gc = GcFixture::non_generational(16 * MB);
    let root = rooted_list(&gc, 3);

    gc.collect(GcGeneration::Young).unwrap();
    gc.collect(GcGeneration::Young).unwrap();

    let metrics = gc.metrics();
    assert_eq!(metrics.full_cycles, 2);
    assert_eq!(metrics.young_cycles, 0);
    assert_eq!(gc.diagnostics().generational.upgraded_collections, 2);
    assert_eq!(region_generation(&gc, root.get()), Generation::Young);
    assert_eq!(list_values(&gc, &root), vec![0, 1, 2]);
}
