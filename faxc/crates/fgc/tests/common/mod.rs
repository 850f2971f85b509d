//! Test Utilities for the FGC Integration Suite
//!
//! Small heaps and few GC threads keep every test fast; helpers build
//! rooted object graphs and check them after collections.

#![allow(dead_code)]

use fgc::config::MB;
use fgc::{ColoredPointer, FgcError, GarbageCollector, GcConfig, GcPhase, Root};
use std::sync::Arc;
use std::time::Duration;

/// Default heap size for tests (16MB)
pub const DEFAULT_HEAP_SIZE: usize = 16 * MB;

/// Maximum time to wait for background collections
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// ============================================================================
/// GC FIXTURE
/// ============================================================================

/// Test fixture for GC operations
///
/// The collector shuts down when the fixture is dropped.
pub struct GcFixture {
    pub gc: Arc<GarbageCollector>,
    pub config: GcConfig,
}

impl GcFixture {
    /// Create fixture with the default test heap
    pub fn with_defaults() -> Self {
        Self::with_heap_size(DEFAULT_HEAP_SIZE)
    }

    /// Create fixture with a custom heap size
    pub fn with_heap_size(heap_size: usize) -> Self {
        Self::with_config(GcConfig::for_heap(heap_size, 2))
    }

    /// Create fixture with a full custom configuration
    pub fn with_config(config: GcConfig) -> Self {
        let gc = Arc::new(
            GarbageCollector::new(config.clone())
                .expect("GC initialization should succeed with valid config"),
        );
        Self { gc, config }
    }

    /// Create fixture whose collections are always full
    pub fn non_generational(heap_size: usize) -> Self {
        Self::with_config(GcConfig {
            use_generational: false,
            ..GcConfig::for_heap(heap_size, 2)
        })
    }
}

impl std::ops::Deref for GcFixture {
    type Target = GarbageCollector;

    fn deref(&self) -> &GarbageCollector {
        &self.gc
    }
}

/// ============================================================================
/// OBJECT GRAPH HELPERS
/// ============================================================================

/// Allocate a node with `slots` reference slots and one data word holding
/// `value`
pub fn node(gc: &GarbageCollector, slots: usize, value: u64) -> ColoredPointer {
    let object = gc
        .allocate_object(slots * 8 + 8, slots)
        .expect("node allocation should succeed");
    gc.write_word(object, slots * 8, value)
        .expect("data word should be writable");
    object
}

/// Data word of a node built by [`node`]
pub fn value_of(gc: &GarbageCollector, object: ColoredPointer, slots: usize) -> u64 {
    gc.read_word(object, slots * 8)
        .expect("data word should be readable")
}

/// Like [`node`], but rooted from the moment it exists, so it is safe while
/// other threads run cycles
pub fn rooted_node(gc: &GarbageCollector, slots: usize, value: u64) -> Root {
    let root = gc
        .allocate_rooted(slots * 8 + 8, slots)
        .expect("node allocation should succeed");
    gc.write_word(root.get(), slots * 8, value)
        .expect("data word should be writable");
    root
}

/// Build a rooted singly linked list; node `i` holds value `i`
pub fn rooted_list(gc: &GarbageCollector, len: usize) -> Root {
    let head = rooted_node(gc, 1, 0);
    let mut tail = gc.root(head.get()).expect("root registration should succeed");
    for i in 1..len {
        let next = rooted_node(gc, 1, i as u64);
        gc.store_ref(tail.get(), 0, next.get())
            .expect("store should succeed");
        tail = next;
    }
    head
}

/// Walk a list built by [`rooted_list`], returning its values
pub fn list_values(gc: &GarbageCollector, root: &Root) -> Vec<u64> {
    let mut values = Vec::new();
    let mut current = root.get();
    while !current.is_null() {
        values.push(value_of(gc, current, 1));
        current = gc.load_ref(current, 0).expect("load should succeed");
    }
    values
}

/// Allocate `count` unrooted objects of `size` bytes
pub fn allocate_garbage(gc: &GarbageCollector, count: usize, size: usize) {
    for _ in 0..count {
        gc.allocate(size).expect("garbage allocation should succeed");
    }
}

/// ============================================================================
/// ASSERTIONS
/// ============================================================================

/// Assert the heap bookkeeping is consistent and the collector is idle
pub fn assert_healthy(gc: &GarbageCollector) {
    assert!(
        gc.wait_for_idle(TEST_TIMEOUT),
        "collector did not become idle"
    );
    gc.verify_heap().expect("heap verification should pass");
    assert_eq!(gc.phase(), GcPhase::Idle);
    assert!(
        gc.diagnostics().halted.is_none(),
        "collector halted: {:?}",
        gc.diagnostics().halted
    );
}

/// Assert `result` is `OutOfMemory`
pub fn assert_out_of_memory<T: std::fmt::Debug>(result: Result<T, FgcError>) {
    match result {
        Err(FgcError::OutOfMemory { .. }) => {}
        other => panic!("expected OutOfMemory, got {:?}", other),
    }
}
