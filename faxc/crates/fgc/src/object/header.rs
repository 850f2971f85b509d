//! Object Header - Metadata for GC-managed objects
//!
//! Object Header Layout (16 bytes on 64-bit):
//! ┌─────────────────────────────────────────┐
//! │         Status Word (8 bytes)           │  <- AtomicU64
//! │  - Bits 0-3: Age (survived young GCs)   │
//! ├─────────────────────────────────────────┤
//! │         Layout Word (8 bytes)           │  <- AtomicU64
//! │  - Bits 0-39: Size incl. header         │
//! │  - Bits 40-63: Reference slot count     │
//! └─────────────────────────────────────────┘
//! │  Payload: ref slots first, then data    │
//!
//! An object reference is the payload address. In TLAB, survivor and large
//! regions the header sits `HEADER_SIZE` bytes below it; medium regions keep
//! headers in a side table so a payload occupies only its own bytes (see
//! `Region::side_header`). The size word always counts `HEADER_SIZE`.
//! Reference slots hold raw colored-pointer words, 0 meaning null.
//!
//! Everything in this module dereferences raw heap addresses. Callers
//! guarantee the address lies inside a committed region of a live heap and
//! that they hold a mutator guard or run inside a collector phase.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::MAX_TENURE_THRESHOLD;
use crate::error::{FgcError, Result};
use crate::util::Alignment;

/// Size of object header in bytes
pub const HEADER_SIZE: usize = 16;

/// Object alignment (bytes)
pub const OBJECT_ALIGNMENT: usize = 8;

/// Size of one payload word / reference slot
pub const WORD_SIZE: usize = 8;

const AGE_MASK: u64 = 0b1111;
const SIZE_BITS: u32 = 40;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const MAX_REF_SLOTS: usize = (1 << (64 - SIZE_BITS)) - 1;

/// Object Header
#[repr(C)]
pub struct ObjectHeader {
    status: AtomicU64,
    layout: AtomicU64,
}

impl ObjectHeader {
    /// A blank header for side tables
    pub const fn empty() -> Self {
        Self {
            status: AtomicU64::new(0),
            layout: AtomicU64::new(0),
        }
    }

    /// View the header stored at `header_address`
    ///
    /// # Safety
    /// `header_address` must point at an initialized header inside live heap
    /// memory that outlives `'a`.
    pub unsafe fn at<'a>(header_address: usize) -> &'a ObjectHeader {
        &*(header_address as *const ObjectHeader)
    }

    /// View the header of the object whose payload starts at `object`
    ///
    /// # Safety
    /// Same as [`ObjectHeader::at`].
    pub unsafe fn of<'a>(object: usize) -> &'a ObjectHeader {
        Self::at(object - HEADER_SIZE)
    }

    /// Write a fresh header (age 0)
    ///
    /// # Safety
    /// `header_address` must point at `size` writable bytes of heap memory
    /// owned exclusively by the caller.
    pub unsafe fn initialize(header_address: usize, size: usize, ref_slots: usize) {
        Self::at(header_address).reset(size, ref_slots);
    }

    /// Overwrite the header in place (age 0)
    pub fn reset(&self, size: usize, ref_slots: usize) {
        self.status.store(0, Ordering::Relaxed);
        self.layout
            .store(size as u64 | ((ref_slots as u64) << SIZE_BITS), Ordering::Release);
    }

    /// Total object size including the header
    pub fn size(&self) -> usize {
        (self.layout.load(Ordering::Acquire) & SIZE_MASK) as usize
    }

    pub fn ref_slots(&self) -> usize {
        (self.layout.load(Ordering::Acquire) >> SIZE_BITS) as usize
    }

    pub fn age(&self) -> u8 {
        (self.status.load(Ordering::Acquire) & AGE_MASK) as u8
    }

    pub fn set_age(&self, age: u8) {
        let age = age.min(MAX_TENURE_THRESHOLD) as u64;
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |status| {
                Some((status & !AGE_MASK) | age)
            });
    }

    /// Payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.size() - HEADER_SIZE
    }
}

/// Total object size for a payload of `payload_size` bytes with `ref_slots`
/// leading reference slots
pub fn object_size(payload_size: usize, ref_slots: usize) -> Result<usize> {
    if ref_slots > MAX_REF_SLOTS {
        return Err(FgcError::InvalidArgument(format!(
            "{} reference slots exceed the maximum of {}",
            ref_slots, MAX_REF_SLOTS
        )));
    }

    let refs_bytes = ref_slots
        .checked_mul(WORD_SIZE)
        .ok_or_else(|| FgcError::InvalidArgument("reference slots overflow".to_string()))?;
    let payload = payload_size.max(refs_bytes).max(WORD_SIZE);
    let total = payload
        .checked_add(HEADER_SIZE + OBJECT_ALIGNMENT - 1)
        .map(|unaligned| Alignment::align_down(unaligned, OBJECT_ALIGNMENT))
        .ok_or_else(|| {
            FgcError::InvalidArgument(format!("object size {} overflows", payload_size))
        })?;

    if total as u64 > SIZE_MASK {
        return Err(FgcError::InvalidArgument(format!(
            "object size {} exceeds the header limit",
            total
        )));
    }
    Ok(total)
}

/// Reference slot `index` of `object`
///
/// # Safety
/// `object` must be a live object with more than `index` reference slots.
pub unsafe fn ref_slot<'a>(object: usize, index: usize) -> &'a AtomicUsize {
    &*((object + index * WORD_SIZE) as *const AtomicUsize)
}

/// Payload word at byte `offset` of `object`
///
/// # Safety
/// `object` must be live and `offset + WORD_SIZE` within its payload,
/// `offset` word aligned.
pub unsafe fn payload_word<'a>(object: usize, offset: usize) -> &'a AtomicU64 {
    &*((object + offset) as *const AtomicU64)
}

/// Copy `len` payload bytes between two objects
///
/// # Safety
/// Both ranges must be `len` bytes of heap memory, must not overlap, and
/// the destination must be owned exclusively by the caller.
pub unsafe fn copy_payload(from: usize, to: usize, len: usize) {
    std::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, len);
}

/// Zero `len` bytes at `address`
///
/// # Safety
/// The range must be writable heap memory owned by the caller.
pub unsafe fn zero_bytes(address: usize, len: usize) {
    std::ptr::write_bytes(address as *mut u8, 0, len);
}
