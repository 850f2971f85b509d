//! # FGC - Concurrent Colored-Pointer Garbage Collector
//!
//! FGC is a region-based, concurrent, relocating collector for managed heaps
//! embedded in Rust programs. Pauses only scan roots and finish marking, so
//! their length does not grow with the heap.
//!
//! ## Overview
//!
//! - **Colored Pointers**: GC metadata lives in pointer bits 48-51, so a
//!   pointer tells whether it was marked or remapped in the current cycle
//! - **Load Barrier**: every reference load heals stale pointers in place
//! - **SATB Write Barrier**: overwritten references are recorded while
//!   marking so concurrent mutation never hides a live object
//! - **Concurrent Relocation**: sparse regions are evacuated while mutators
//!   run; a mutator that touches an object in flight copies it itself
//! - **Generational Collection**: young cycles trace young regions plus the
//!   remembered sets kept by the post-write barrier
//! - **Thread-Local Allocation Buffers (TLAB)**: uncontended allocation fast path
//!
//! ## Quick Start
//!
//! ```rust
//! use fgc::{GarbageCollector, GcConfig, GcGeneration};
//! use fgc::config::MB;
//!
//! fn main() -> Result<(), fgc::FgcError> {
//!     let gc = GarbageCollector::new(GcConfig::for_heap(16 * MB, 2))?;
//!
//!     // One reference slot followed by 16 bytes of data
//!     let list = gc.allocate_object(24, 1)?;
//!     let root = gc.root(list)?;
//!     gc.write_word(list, 8, 42)?;
//!
//!     gc.collect(GcGeneration::Full)?;
//!
//!     // The object may have moved; the root was healed
//!     assert_eq!(gc.read_word(root.get(), 8)?, 42);
//!     Ok(())
//! }
//! ```
//!
//! ### GC Cycle Phases
//!
//! 1. **InitialMark** (pause): flip the mark parity, retire TLABs, scan roots
//! 2. **ConcurrentMark**: parallel trace, drain SATB buffers
//! 3. **Remark** (pause): finish marking, process references, pick regions
//! 4. **ConcurrentRelocate**: copy live objects out of the selected regions
//! 5. **ConcurrentSweep**: free empty regions and regions relocated earlier
//!
//! ### Colored Pointers
//!
//! ```text
//! 64-bit Pointer Layout:
//! ┌────────────┬─────┬─────┬─────┬─────┬──────────────────────┐
//! │  Unused    │ Fin │ Rem │ M1  │ M0  │     Address          │
//! │  63-52     │ 51  │ 50  │ 49  │ 48  │       47-0           │
//! └────────────┴─────┴─────┴─────┴─────┴──────────────────────┘
//! ```
//!
//! ## Safety
//!
//! Mutators see objects only through [`ColoredPointer`] values and the
//! accessors on [`GarbageCollector`]. A pointer that is not reachable from a
//! [`Root`] (or from a reference slot of a rooted object) may be reclaimed by
//! the next cycle; using it afterwards fails with `InvalidArgument` or names
//! a different object. While other threads may start cycles, allocate with
//! [`GarbageCollector::allocate_rooted`] and link from there.
//!
//! ### Thread Safety
//!
//! - `GarbageCollector` is `Send + Sync`; all operations take `&self`
//! - Collections run on a dedicated controller thread plus
//!   `concurrent_gc_threads` workers
//! - Blocking operations (`collect`, `shutdown`) fail with `InvalidState`
//!   when called from inside a mutator operation; finalizer callbacks run
//!   outside one and may call them
//!
//! ## Modules
//!
//! - [`allocator`]: TLABs, shared allocation and the generational policy
//! - [`barrier`]: Colored pointers, load and write barriers, remembered sets
//! - [`config`]: GC configuration parameters and validation
//! - [`error`]: Error types for all FGC operations
//! - [`gc`]: The collector and its cycle
//! - [`heap`]: Region-based heap over one reserved address range
//! - [`logging`]: GC event log
//! - [`marker`]: Concurrent marking and root registration
//! - [`object`]: Object layout and reference objects
//! - [`relocate`]: Forwarding tables and concurrent relocation
//! - [`runtime`]: Controller thread, safepoints and finalizers
//! - [`stats`]: Metrics and pause histograms
//! - [`util`]: Alignment helpers

// Core GC modules
pub mod config;
pub mod error;
pub mod gc;
pub mod logging;

// Memory management subsystems
pub mod allocator;
pub mod heap;
pub mod object;

// GC algorithm components
pub mod barrier;
pub mod marker;
pub mod relocate;

// Runtime and monitoring
pub mod runtime;
pub mod stats;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use allocator::GcGeneration;
pub use barrier::{Color, ColoredPointer};
pub use config::GcConfig;
pub use error::{FgcError, Result};
pub use gc::{GarbageCollector, GcDiagnostics, Root};
pub use object::{Reference, ReferenceKind};
pub use runtime::{GcPhase, GcReason};
pub use stats::GcMetricsSnapshot;

/// FGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize FGC with default configuration
///
/// # Examples
///
/// ```rust
/// let gc = fgc::init()?;
/// let object = gc.allocate(64)?;
/// assert!(!object.is_null());
/// # Ok::<(), fgc::FgcError>(())
/// ```
pub fn init() -> Result<GarbageCollector> {
    GarbageCollector::new(GcConfig::default())
}

/// Initialize FGC with custom configuration
///
/// The configuration is validated first; invalid values are rejected with
/// `Configuration` (or `HeapInitialization` for inverted heap bounds).
pub fn init_with_config(config: GcConfig) -> Result<GarbageCollector> {
    GarbageCollector::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;

    #[test]
    fn test_init_with_config() {
        let gc = init_with_config(GcConfig::for_heap(8 * MB, 1)).unwrap();
        assert_eq!(gc.phase(), GcPhase::Idle);
    }

    #[test]
    fn test_rejects_inverted_heap_bounds() {
        let config = GcConfig {
            min_heap_size: 16 * MB,
            max_heap_size: 8 * MB,
            ..GcConfig::for_heap(8 * MB, 1)
        };
        assert!(matches!(
            init_with_config(config),
            Err(FgcError::HeapInitialization(_))
        ));
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
