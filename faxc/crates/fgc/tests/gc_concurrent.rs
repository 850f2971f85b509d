//! GC Concurrency Tests
//!
//! Mutator threads keep allocating, linking and reading objects while the
//! controller runs cycles. Every rooted structure must read back intact.

mod common;

use common::*;
use fgc::config::{KB, MB};
use fgc::{GcConfig, GcGeneration, GcPhase};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 4;

// ============================================================================
// MUTATORS DURING COLLECTION
// ============================================================================

/// Lists built concurrently survive background and explicit cycles
#[test]
fn test_concurrent_lists_survive_collections() {
    let gc = GcFixture::with_heap_size(32 * MB);
    let start = Arc::new(Barrier::new(THREADS + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let gc = Arc::clone(&gc.gc);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let root = rooted_list(&gc, 64);
                let mut rng = rand::thread_rng();
                for round in 0..200 {
                    // Short-lived garbage keeps the trigger busy
                    gc.allocate(rng.gen_range(16..4 * KB)).unwrap();
                    if round % 50 == 0 {
                        assert_eq!(
                            list_values(&gc, &root),
                            (0..64).collect::<Vec<_>>(),
                            "thread {} list corrupted in round {}",
                            t,
                            round
                        );
                    }
                }
                list_values(&gc, &root)
            })
        })
        .collect();

    let collector = {
        let gc = Arc::clone(&gc.gc);
        let stop = Arc::clone(&stop);
        let start = Arc::clone(&start);
        thread::spawn(move || {
            start.wait();
            let mut generation = GcGeneration::Young;
            while !stop.load(Ordering::Acquire) {
                gc.collect(generation).unwrap();
                generation = match generation {
                    GcGeneration::Young => GcGeneration::Full,
                    GcGeneration::Full => GcGeneration::Young,
                };
            }
        })
    };

    for handle in handles {
        assert_eq!(handle.join().unwrap(), (0..64).collect::<Vec<_>>());
    }
    stop.store(true, Ordering::Release);
    collector.join().unwrap();

    assert!(gc.metrics().cycles >= 1);
    assert_healthy(&gc);
}

/// Stores racing with marking never lose a reachable object
#[test]
fn test_pointer_swaps_during_marking() {
    let gc = GcFixture::with_heap_size(16 * MB);
    let root = Arc::new(rooted_node(&gc, 2, 0));
    {
        let first = rooted_node(&gc, 0, 1);
        let second = rooted_node(&gc, 0, 2);
        gc.store_ref(root.get(), 0, first.get()).unwrap();
        gc.store_ref(root.get(), 1, second.get()).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let swapper = {
        let gc = Arc::clone(&gc.gc);
        let done = Arc::clone(&done);
        let root = Arc::clone(&root);
        thread::spawn(move || {
            let mut swaps = 0u64;
            while !done.load(Ordering::Acquire) {
                // Move the two children between slots through locals
                let cycle = gc.cycle();
                let holder = root.get();
                let a = gc.load_ref(holder, 0).unwrap();
                let b = gc.load_ref(holder, 1).unwrap();
                if gc.cycle() != cycle {
                    continue;
                }
                gc.store_ref(holder, 0, b).unwrap();
                gc.store_ref(holder, 1, a).unwrap();
                swaps += 1;
            }
            swaps
        })
    };

    for i in 0..20 {
        let generation = if i % 2 == 0 {
            GcGeneration::Young
        } else {
            GcGeneration::Full
        };
        gc.collect(generation).unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(swapper.join().unwrap() > 0);

    let holder = root.get();
    let mut values = vec![
        value_of(&gc, gc.load_ref(holder, 0).unwrap(), 0),
        value_of(&gc, gc.load_ref(holder, 1).unwrap(), 0),
    ];
    values.sort_unstable();
    assert_eq!(values, vec![1, 2]);
    assert_healthy(&gc);
}

/// An object allocated while cycles run is never reclaimed before it is
/// linked
#[test]
fn test_allocate_rooted_during_collections() {
    let gc = GcFixture::with_heap_size(16 * MB);
    let stop = Arc::new(AtomicBool::new(false));
    let collector = {
        let gc = Arc::clone(&gc.gc);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                gc.collect(GcGeneration::Young).unwrap();
            }
        })
    };

    let roots: Vec<_> = (0..500u64).map(|i| rooted_node(&gc, 0, i)).collect();
    stop.store(true, Ordering::Release);
    collector.join().unwrap();

    for (i, root) in roots.iter().enumerate() {
        assert_eq!(value_of(&gc, root.get(), 0), i as u64);
    }
    assert_healthy(&gc);
}

// ============================================================================
// COLLECTION REQUESTS
// ============================================================================

#[test]
fn test_concurrent_collect_calls_all_complete() {
    let gc = GcFixture::with_defaults();
    let root = rooted_list(&gc, 8);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gc = Arc::clone(&gc.gc);
            thread::spawn(move || gc.collect(GcGeneration::Full))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(gc.metrics().cycles, THREADS as u64);
    assert_eq!(list_values(&gc, &root), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_request_collection_is_asynchronous() {
    let gc = GcFixture::with_defaults();
    gc.request_collection(GcGeneration::Young).unwrap();
    gc.request_collection(GcGeneration::Full).unwrap();
    assert!(gc.wait_for_idle(TEST_TIMEOUT));

    assert_eq!(gc.metrics().cycles, 2);
    let history = gc.phase_history();
    let starts = history
        .iter()
        .filter(|t| t.to == GcPhase::InitialMark)
        .count();
    assert_eq!(starts, 2);
    // Every cycle walked the phases in order
    for pair in history.windows(2) {
        assert_eq!(pair[0].to, pair[1].from);
    }
    assert_eq!(history.last().map(|t| t.to), Some(GcPhase::Idle));
}

#[test]
fn test_pauses_are_recorded() {
    let gc = GcFixture::with_config(GcConfig {
        max_pause_ms: 50,
        ..GcConfig::for_heap(16 * MB, 2)
    });
    let _root = rooted_list(&gc, 32);
    gc.collect(GcGeneration::Full).unwrap();

    let metrics = gc.metrics();
    // InitialMark and Remark
    assert_eq!(metrics.pauses, 2);
    assert!(metrics.max_pause_ms >= 0.0);
    assert!(metrics.pause_p99_us >= metrics.pause_p50_us);
}
