//! Mark Bitmap - Tracking Marked Objects
//!
//! Mark bitmap adalah struktur data untuk tracking object yang sudah marked.
//! 1 bit per 8-byte granule, one bitmap per region. The same structure also
//! records object starts so regions can be walked in address order.
//!
//! Bitmap Structure:
//! ```text
//! Region: 2MB (2,097,152 bytes)
//! Granularity: 8 bytes per bit
//! Bitmap size: 2MB / 8 = 262,144 bits = 32KB
//!
//! Object header at region_start + 0x1000:
//! - Bit index: 0x1000 / 8 = 512
//! - Word index: 512 / 64 = 8
//! - Bit offset: 512 % 64 = 0
//! ```
//!
//! Setting a bit is a single `fetch_or`; concurrent markers racing on the
//! same object agree on exactly one winner.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes covered by one bit
pub const GRANULE: usize = 8;

/// MarkBitmap - atomic bit array over one region
pub struct MarkBitmap {
    bits: Box<[AtomicU64]>,
    base_address: usize,
    covered: usize,
}

impl MarkBitmap {
    /// Create bitmap untuk region `[base_address, base_address + covered)`
    pub fn new(base_address: usize, covered: usize) -> Self {
        let bit_count = (covered + GRANULE - 1) / GRANULE;
        let word_count = (bit_count + 63) / 64;

        Self {
            bits: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            base_address,
            covered,
        }
    }

    /// Set the bit for `address`; returns true if this call set it
    pub fn mark(&self, address: usize) -> bool {
        match self.indices(address) {
            Some((word, bit)) => {
                let mask = 1u64 << bit;
                self.bits[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
            }
            None => false,
        }
    }

    /// Check jika address sudah marked
    pub fn is_marked(&self, address: usize) -> bool {
        match self.indices(address) {
            Some((word, bit)) => self.bits[word].load(Ordering::Acquire) & (1u64 << bit) != 0,
            None => false,
        }
    }

    /// Clear the bit for `address`
    pub fn unmark(&self, address: usize) {
        if let Some((word, bit)) = self.indices(address) {
            self.bits[word].fetch_and(!(1u64 << bit), Ordering::AcqRel);
        }
    }

    /// Clear semua bits
    pub fn clear(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count_marked(&self) -> usize {
        self.bits
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| word.load(Ordering::Relaxed) == 0)
    }

    /// Iterate set addresses in ascending order
    ///
    /// Bits set concurrently with the walk may or may not be observed.
    pub fn iter(&self) -> MarkedAddresses<'_> {
        MarkedAddresses {
            bitmap: self,
            word_index: 0,
            pending: self.bits.first().map(|w| w.load(Ordering::Acquire)).unwrap_or(0),
        }
    }

    /// Get bitmap size in bytes
    pub fn size_bytes(&self) -> usize {
        self.bits.len() * 8
    }

    fn indices(&self, address: usize) -> Option<(usize, usize)> {
        let offset = address.checked_sub(self.base_address)?;
        if offset >= self.covered {
            return None;
        }
        let bit_index = offset / GRANULE;
        Some((bit_index / 64, bit_index % 64))
    }
}

/// Iterator returned by [`MarkBitmap::iter`]
pub struct MarkedAddresses<'a> {
    bitmap: &'a MarkBitmap,
    word_index: usize,
    pending: u64,
}

impl Iterator for MarkedAddresses<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.pending != 0 {
                let bit = self.pending.trailing_zeros() as usize;
                self.pending &= self.pending - 1;
                let position = self.word_index * 64 + bit;
                return Some(self.bitmap.base_address + position * GRANULE);
            }

            self.word_index += 1;
            let word = self.bitmap.bits.get(self.word_index)?;
            self.pending = word.load(Ordering::Acquire);
        }
    }
}
