//! Finalizer - Object Finalization
//!
//! A finalizer is a callback attached to a finalizer reference. When the
//! referent becomes unreachable the reference processor keeps the object
//! alive and queues the reference; `run_finalizers` then calls the
//! callback with the object and clears the reference, after which the
//! object is collected like any other garbage.
//!
//! Callbacks run on the thread that calls `run_finalizers`, never on a
//! collector thread.
//!
//! Warning: finalizers delay reclamation by at least one cycle. Use them
//! only to release native resources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::barrier::ColoredPointer;
use crate::object::Reference;

/// Callback invoked with the finalizable object
pub type FinalizerCallback = Box<dyn FnOnce(ColoredPointer) + Send>;

/// FinalizerRegistry - finalizer callbacks keyed by reference id
///
/// The registry owns the reference handle, which keeps it registered with
/// the reference processor until the finalizer ran.
#[derive(Default)]
pub struct FinalizerRegistry {
    entries: Mutex<HashMap<u64, (Arc<Reference>, FinalizerCallback)>>,
    registered: AtomicU64,
    executed: AtomicU64,
}

impl FinalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, reference: Arc<Reference>, callback: FinalizerCallback) {
        self.entries.lock().insert(reference.id(), (reference, callback));
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the callback for `reference_id`; the caller runs it
    pub fn take(&self, reference_id: u64) -> Option<(Arc<Reference>, FinalizerCallback)> {
        self.entries.lock().remove(&reference_id)
    }

    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Finalizers registered but not yet run
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn total_registered(&self) -> u64 {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn total_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}
