//! Allocator Module - Memory Allocation Strategies
//!
//! Routes allocation requests by total object size:
//!
//! - **TLAB**: objects up to `tlab_max_size`, bump pointer in a private slice
//! - **Medium**: larger objects up to one region, shared bump pointer
//! - **Large**: objects above one region, contiguous run of regions
//!
//! The generational policy decides where survivors go during relocation;
//! every new object starts young.

pub mod generational;
pub mod tlab;

pub use generational::{GcGeneration, GenerationalPolicy, GenerationalStats};
pub use tlab::{Tlab, TlabAllocation, TlabManager};

use crate::config::GcConfig;
use crate::error::Result;
use crate::heap::Heap;
use crate::object::HEADER_SIZE;

/// Path that served an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPath {
    Tlab,
    Medium,
    Large,
}

/// Main allocator for FGC
///
/// ## Allocation Flow
///
/// 1. Size above one region -> large span
/// 2. Size above the TLAB limit -> shared medium region
/// 3. Otherwise TLAB, refilled or bypassed per the waste limit
pub struct Allocator {
    tlabs: TlabManager,
    region_size: usize,
}

impl Allocator {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            tlabs: TlabManager::new(
                config.tlab_min_size,
                config.tlab_max_size,
                config.tlab_target_waste_ratio,
            ),
            region_size: config.region_size,
        }
    }

    /// Allocate an object of `size` bytes (header included, aligned);
    /// returns the object address and the path used
    pub fn allocate(&self, heap: &Heap, size: usize) -> Result<(usize, AllocationPath)> {
        if size > self.region_size {
            self.tlabs.record_bypass();
            let header = heap.allocate_large(size)?;
            return Ok((header + HEADER_SIZE, AllocationPath::Large));
        }

        if size <= self.tlabs.max_size() {
            if let TlabAllocation::Allocated(header) = self.tlabs.allocate(heap, size)? {
                heap.note_allocation(size);
                return Ok((header + HEADER_SIZE, AllocationPath::Tlab));
            }
        } else {
            self.tlabs.record_bypass();
        }

        Ok((heap.allocate_medium(size)?, AllocationPath::Medium))
    }

    pub fn tlabs(&self) -> &TlabManager {
        &self.tlabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KB, MB};
    use crate::heap::SizeClass;
    use std::sync::Arc;

    fn setup() -> (Heap, Allocator) {
        let config = GcConfig {
            min_heap_size: 2 * MB,
            max_heap_size: 8 * MB,
            ..GcConfig::default()
        };
        let allocator = Allocator::new(&config);
        (Heap::new(Arc::new(config)).unwrap(), allocator)
    }

    #[test]
    fn test_routing_by_size() {
        let (heap, allocator) = setup();

        let (small, path) = allocator.allocate(&heap, 64).unwrap();
        assert_eq!(path, AllocationPath::Tlab);
        assert_eq!(heap.region_of(small).unwrap().size_class(), SizeClass::Small);

        let (medium, path) = allocator.allocate(&heap, 512 * KB).unwrap();
        assert_eq!(path, AllocationPath::Medium);
        let region = heap.region_of(medium).unwrap();
        assert_eq!(region.size_class(), SizeClass::Medium);
        assert_eq!(medium, region.start());
        assert_eq!(region.used_bytes(), 512 * KB - HEADER_SIZE);

        let (large, path) = allocator.allocate(&heap, 3 * MB).unwrap();
        assert_eq!(path, AllocationPath::Large);
        assert_eq!(heap.region_of(large).unwrap().span(), 2);
    }

    #[test]
    fn test_exhaustion_reports_region_failure() {
        let (heap, allocator) = setup();
        allocator.allocate(&heap, 6 * MB).unwrap();
        let err = allocator.allocate(&heap, 4 * MB).unwrap_err();
        assert!(err.is_recoverable());
    }
}
