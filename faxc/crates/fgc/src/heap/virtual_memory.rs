//! Virtual Memory Management
//!
//! ============================================================================
//! OVERVIEW VIRTUAL MEMORY
//! ============================================================================
//!
//! The whole heap is one anonymous mapping reserved at init. The OS backs
//! pages on first touch, so reservation costs address space only. Regions
//! that are freed while the heap sits above its minimum size are handed back
//! with `madvise(MADV_DONTNEED)`.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  ┌──────────┬──────────┬──────────┬──────────┬─────────┬─────────┐ │
//! │  │ Region 0 │ Region 1 │ Region 2 │ Region 3 │   ...   │ Region N│ │
//! │  └──────────┴──────────┴──────────┴──────────┴─────────┴─────────┘ │
//! │  Base (region aligned) ────────────────────────────► max_heap_size │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The mapping must end below 2^48 so every heap address fits the address
//! field of a colored pointer.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::barrier::colored_ptr::ADDRESS_MASK;
use crate::error::{FgcError, Result};
use crate::util::Alignment;

/// VirtualMemory - the heap reservation
pub struct VirtualMemory {
    /// Mapping handle; `None` once released
    mapping: Mutex<Option<MmapMut>>,

    /// First usable address (aligned to `alignment`)
    base_address: usize,

    /// Usable bytes from `base_address`
    size: usize,
}

impl VirtualMemory {
    /// Reserve `size` bytes whose base is aligned to `alignment`
    ///
    /// # Examples
    /// ```
    /// use fgc::heap::virtual_memory::VirtualMemory;
    ///
    /// let vm = VirtualMemory::reserve(4 * 1024 * 1024, 2 * 1024 * 1024).unwrap();
    /// assert_eq!(vm.base_address() % (2 * 1024 * 1024), 0);
    /// ```
    pub fn reserve(size: usize, alignment: usize) -> Result<Self> {
        let padded = size.checked_add(alignment).ok_or_else(|| {
            FgcError::HeapInitialization(format!("reservation of {} bytes overflows", size))
        })?;

        let mapping = MmapOptions::new().len(padded).map_anon().map_err(|e| {
            FgcError::HeapInitialization(format!("Failed to reserve {} bytes: {}", padded, e))
        })?;

        let base_address = Alignment::align_up(mapping.as_ptr() as usize, alignment);
        let end = base_address + size;
        if end - 1 > ADDRESS_MASK {
            return Err(FgcError::HeapInitialization(format!(
                "heap end {:#x} does not fit in colored pointer address bits",
                end
            )));
        }

        log::debug!(
            "Reserved heap: base={:#x} size={} (mapping {} bytes)",
            base_address,
            size,
            padded
        );

        Ok(Self {
            mapping: Mutex::new(Some(mapping)),
            base_address,
            size,
        })
    }

    pub fn base_address(&self) -> usize {
        self.base_address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end_address(&self) -> usize {
        self.base_address + self.size
    }

    pub fn is_released(&self) -> bool {
        self.mapping.lock().is_none()
    }

    /// Return the physical pages behind `[address, address + len)` to the OS
    ///
    /// The range reads as zero on next touch. Address space stays reserved.
    pub fn uncommit(&self, address: usize, len: usize) -> Result<()> {
        if address < self.base_address || address + len > self.end_address() {
            return Err(FgcError::InvalidArgument(format!(
                "uncommit range {:#x}+{} outside the heap",
                address, len
            )));
        }

        let guard = self.mapping.lock();
        if guard.is_none() {
            return Err(FgcError::ShutDown);
        }

        #[cfg(unix)]
        {
            // SAFETY: the range lies inside our private anonymous mapping,
            // which stays mapped while the lock is held.
            let rc = unsafe {
                libc::madvise(address as *mut libc::c_void, len, libc::MADV_DONTNEED)
            };
            if rc != 0 {
                log::warn!(
                    "madvise(DONTNEED) failed for {:#x}+{}: {}",
                    address,
                    len,
                    std::io::Error::last_os_error()
                );
            }
        }

        #[cfg(not(unix))]
        {
            // SAFETY: as above; zeroing keeps the "reads as zero" contract.
            unsafe { std::ptr::write_bytes(address as *mut u8, 0, len) };
        }

        Ok(())
    }

    /// Unmap the reservation; every heap address becomes invalid
    pub fn release(&self) {
        if let Some(mapping) = self.mapping.lock().take() {
            log::debug!("Released heap mapping at {:#x}", self.base_address);
            drop(mapping);
        }
    }
}
