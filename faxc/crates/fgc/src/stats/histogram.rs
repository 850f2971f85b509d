//! Histogram - Pause Time Histogram
//!
//! Logarithmic buckets (powers of two) over nanosecond values. Percentiles
//! are reported as the upper bound of the bucket holding the rank, capped
//! at the largest recorded value, so they are accurate within 2x.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Histogram - pause time histogram
pub struct Histogram {
    /// Bucket index -> count; bucket `k` holds values in `[2^(k-1), 2^k)`
    buckets: Mutex<BTreeMap<u32, u64>>,
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record value
    pub fn record(&self, value: u64) {
        *self.buckets.lock().entry(bucket_of(value)).or_insert(0) += 1;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn min(&self) -> u64 {
        match self.count() {
            0 => 0,
            _ => self.min.load(Ordering::Relaxed),
        }
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> u64 {
        match self.count() {
            0 => 0,
            count => self.sum() / count,
        }
    }

    /// Value at percentile `p` (0.0 - 100.0)
    pub fn percentile(&self, p: f64) -> u64 {
        let buckets = self.buckets.lock();
        let total: u64 = buckets.values().sum();
        if total == 0 {
            return 0;
        }

        let rank = ((p.clamp(0.0, 100.0) / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (&bucket, &count) in buckets.iter() {
            seen += count;
            if seen >= rank {
                return bucket_upper_bound(bucket).min(self.max());
            }
        }
        self.max()
    }

    pub fn clear(&self) {
        self.buckets.lock().clear();
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_of(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

fn bucket_upper_bound(bucket: u32) -> u64 {
    match bucket {
        0 => 0,
        64.. => u64::MAX,
        k => (1u64 << k) - 1,
    }
}
