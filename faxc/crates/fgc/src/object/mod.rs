//! Object Module - GC-managed object model
//!
//! Objects carry an inline header (age, size, reference-slot count) in
//! front of the payload. Reference objects (weak, soft, phantom, finalizer)
//! live outside the heap and are tracked by the reference processor.

pub mod header;
pub mod reference;

pub use header::{object_size, ObjectHeader, HEADER_SIZE, OBJECT_ALIGNMENT, WORD_SIZE};
pub use reference::{Reference, ReferenceKind, ReferenceProcessor, ReferenceQueue, ReferenceStats};
