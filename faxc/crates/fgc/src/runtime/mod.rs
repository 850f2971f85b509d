//! Runtime Module - GC Runtime Integration
//!
//! Pieces that connect the collector to running mutator threads:
//! - Safepoint management (mutator guards, stop-the-world pauses)
//! - The controller thread and its cycle state machine
//! - Finalizer callbacks

pub mod controller;
pub mod finalizer;
pub mod safepoint;

pub use controller::{
    Controller, CycleRunner, GcPhase, GcReason, GcRequest, PhaseTransition, PHASE_HISTORY_CAPACITY,
};
pub use finalizer::{FinalizerCallback, FinalizerRegistry};
pub use safepoint::{MutatorGuard, PauseGuard, Safepoint};
