//! GC Lifecycle Tests
//!
//! Initialization errors, roots, pinning, monitoring output and shutdown.

mod common;

use common::*;
use fgc::config::{KB, MB};
use fgc::{FgcError, GarbageCollector, GcConfig, GcGeneration, GcPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// INITIALIZATION
// ============================================================================

#[test]
fn test_invalid_config_rejected_at_init() {
    let zero_threads = GcConfig {
        concurrent_gc_threads: 0,
        ..GcConfig::for_heap(8 * MB, 1)
    };
    assert!(matches!(
        GarbageCollector::new(zero_threads),
        Err(FgcError::Configuration(_))
    ));

    let odd_region = GcConfig {
        region_size: 3 * MB,
        ..GcConfig::for_heap(8 * MB, 1)
    };
    assert!(matches!(
        GarbageCollector::new(odd_region),
        Err(FgcError::Configuration(_))
    ));

    let inverted = GcConfig {
        min_heap_size: 16 * MB,
        ..GcConfig::for_heap(8 * MB, 1)
    };
    assert!(matches!(
        GarbageCollector::new(inverted),
        Err(FgcError::HeapInitialization(_))
    ));
}

#[test]
fn test_fresh_collector_is_idle() {
    let gc = GcFixture::with_defaults();
    assert_eq!(gc.phase(), GcPhase::Idle);
    assert_eq!(gc.cycle(), 0);
    assert_eq!(gc.root_count(), 0);
    assert!(gc.phase_history().is_empty());
    assert_eq!(gc.heap_stats().used_bytes, 0);
    assert_healthy(&gc);
}

// ============================================================================
// ROOTS
// ============================================================================

#[test]
fn test_dropping_root_unregisters_it() {
    let gc = GcFixture::with_defaults();
    let first = rooted_node(&gc, 0, 1);
    let second = gc.root(first.get()).unwrap();
    assert_eq!(gc.root_count(), 2);

    drop(first);
    assert_eq!(gc.root_count(), 1);
    // The object is still reachable through the other root
    gc.collect(GcGeneration::Full).unwrap();
    assert_eq!(value_of(&gc, second.get(), 0), 1);

    drop(second);
    assert_eq!(gc.root_count(), 0);
}

#[test]
fn test_raw_root_slot_registration() {
    let gc = GcFixture::with_defaults();
    let slot = Box::new(std::sync::atomic::AtomicUsize::new(0));
    let address = &*slot as *const _ as usize;

    // SAFETY: the slot outlives both registrations
    unsafe {
        gc.register_root(address).unwrap();
        gc.register_root(address).unwrap();
    }
    // Registrations are counted per slot
    assert_eq!(gc.root_count(), 1);
    assert!(matches!(
        unsafe { gc.register_root(address + 1) },
        Err(FgcError::InvalidArgument(_))
    ));

    let object = node(&gc, 0, 42);
    slot.store(object.raw(), Ordering::Release);
    gc.collect(GcGeneration::Young).unwrap();
    let current = gc
        .resolve(fgc::ColoredPointer::from_raw(slot.load(Ordering::Acquire)))
        .unwrap();
    assert_eq!(value_of(&gc, current, 0), 42);

    gc.unregister_root(address).unwrap();
    assert_eq!(gc.root_count(), 1);
    gc.unregister_root(address).unwrap();
    assert!(gc.unregister_root(address).is_err());
    assert_eq!(gc.root_count(), 0);
}

// ============================================================================
// PINNING
// ============================================================================

#[test]
fn test_pinned_object_never_moves() {
    let gc = GcFixture::with_defaults();
    let root = rooted_node(&gc, 0, 9);
    let pinned = gc.pin(root.get()).unwrap();
    assert_eq!(gc.heap_stats().pinned_regions, 1);

    gc.collect(GcGeneration::Young).unwrap();
    gc.collect(GcGeneration::Full).unwrap();

    assert_eq!(root.get().address(), pinned.address());
    assert_eq!(value_of(&gc, root.get(), 0), 9);

    gc.unpin(pinned).unwrap();
    assert_eq!(gc.heap_stats().pinned_regions, 0);
    assert!(matches!(
        gc.unpin(pinned),
        Err(FgcError::InvalidArgument(_))
    ));
    assert_healthy(&gc);
}

// ============================================================================
// MONITORING
// ============================================================================

#[test]
fn test_metrics_export_formats() {
    let gc = GcFixture::with_defaults();
    let _root = rooted_list(&gc, 4);
    allocate_garbage(&gc, 16, 4 * KB);
    gc.collect(GcGeneration::Full).unwrap();

    let metrics = gc.metrics();
    assert_eq!(metrics.cycles, 1);
    assert_eq!(metrics.full_cycles, 1);
    assert_eq!(metrics.max_bytes, 16 * MB);
    assert!(metrics.allocated_bytes > 0);

    let json: serde_json::Value = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
    assert_eq!(json["cycles"], 1);
    let text = metrics.to_prometheus().unwrap();
    assert!(text.contains("fgc_full_cycles 1\n"));
    assert!(text.lines().all(|line| line.starts_with("fgc_")));
}

#[test]
fn test_diagnostics_describe_last_cycle() {
    let gc = GcFixture::with_defaults();
    let _root = rooted_list(&gc, 4);
    gc.collect(GcGeneration::Full).unwrap();

    let diagnostics = gc.diagnostics();
    assert_eq!(diagnostics.cycle, 1);
    assert_eq!(diagnostics.phase, GcPhase::Idle);
    assert_eq!(diagnostics.registered_roots, 1);
    assert!(diagnostics.halted.is_none());
    assert!(!diagnostics.recent_events.is_empty());

    let phases: Vec<_> = diagnostics.phase_history.iter().map(|t| t.to).collect();
    assert_eq!(
        phases,
        vec![
            GcPhase::InitialMark,
            GcPhase::ConcurrentMark,
            GcPhase::Remark,
            GcPhase::ConcurrentRelocate,
            GcPhase::ConcurrentSweep,
            GcPhase::Idle,
        ]
    );

    let json = serde_json::to_value(&diagnostics).unwrap();
    assert_eq!(json["cycle"], 1);
    assert!(json["recent_events"].is_array());
}

// ============================================================================
// FINALIZERS AND COLLECTION REQUESTS
// ============================================================================

#[test]
fn test_finalizer_may_request_collection() {
    let gc = GcFixture::with_defaults();
    let target = node(&gc, 0, 1);
    let collector = Arc::clone(&gc.gc);
    let collected = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&collected);
    gc.register_finalizer(target, move |_| {
        flag.store(
            collector.collect(GcGeneration::Young).is_ok(),
            Ordering::SeqCst,
        );
    })
    .unwrap();

    gc.collect(GcGeneration::Full).unwrap();
    assert_eq!(gc.run_finalizers().unwrap(), 1);
    assert!(collected.load(Ordering::SeqCst));
    assert_eq!(gc.metrics().cycles, 2);
}

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn test_operations_fail_after_shutdown() {
    let gc = GcFixture::with_defaults();
    let root = rooted_node(&gc, 1, 3);
    let object = root.get();

    gc.shutdown().unwrap();
    assert!(gc.is_shut_down());
    // A second shutdown is a no-op
    gc.shutdown().unwrap();

    assert_eq!(gc.allocate(16), Err(FgcError::ShutDown));
    assert_eq!(gc.collect(GcGeneration::Full), Err(FgcError::ShutDown));
    assert_eq!(gc.request_collection(GcGeneration::Young), Err(FgcError::ShutDown));
    assert_eq!(gc.load_ref(object, 0), Err(FgcError::ShutDown));
    assert!(matches!(gc.root(object), Err(FgcError::ShutDown)));

    // Roots can still be dropped and read without touching the heap
    assert_eq!(root.get().raw(), object.raw());
    drop(root);
}
