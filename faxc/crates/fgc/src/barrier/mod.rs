//! Barrier Module - Colored Pointers, Load and Write Barriers
//!
//! Colored Pointers:
//! GC metadata lives in the unused high bits of every stored reference
//! (bits 48-51): two mark colors alternating by cycle parity, `remapped`
//! after relocation, and `finalizable` for referents kept alive only for
//! finalization.
//!
//! Load Barriers:
//! Every reference load heals the stored word (current parity, forwarding)
//! and writes it back, so references are fixed lazily after relocation
//! instead of in a pause.
//!
//! Write Barriers:
//! Every reference store runs the SATB pre-write barrier and the
//! generational post-write barrier that feeds the remembered sets.

pub mod colored_ptr;
pub mod load_barrier;
pub mod remembered_set;
pub mod write_barrier;

pub use colored_ptr::{Color, ColoredPointer, ForwardingLookup, NoForwarding, Parity};
pub use load_barrier::{heal_slot, LoadBarrier, LoadBarrierStats};
pub use remembered_set::{RememberedSetStats, RememberedSets};
pub use write_barrier::{generational, satb, SatbQueue, WriteBarrier, WriteBarrierStats};
