//! Stats Module - GC Performance Monitoring
//!
//! Collects collector counters for:
//! - Performance tuning
//! - Production monitoring
//! - Debugging & profiling
//!
//! Metrics:
//! - Pause time (total, max, percentiles)
//! - Cycle counts per generation
//! - Reclaimed bytes and allocation rate
//!
//! Heap-, TLAB-, relocation- and reference counters live with their
//! components; [`GcStats::snapshot`] only fills in its own fields.

pub mod histogram;
pub mod metrics;
pub mod timer;

pub use histogram::Histogram;
pub use metrics::GcMetricsSnapshot;
pub use timer::GcTimer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::allocator::GcGeneration;

/// GcStats - statistics collector for GC
pub struct GcStats {
    total_cycles: AtomicU64,
    young_cycles: AtomicU64,
    full_cycles: AtomicU64,
    aggressive_cycles: AtomicU64,
    last_cycle_ns: AtomicU64,

    /// Pause durations in nanoseconds
    pauses: Histogram,
    pause_target_ns: u64,
    pauses_over_target: AtomicU64,

    reclaimed_bytes: AtomicU64,
    out_of_memory_errors: AtomicU64,

    start_time: Instant,
}

impl GcStats {
    pub fn new(max_pause: Duration) -> Self {
        Self {
            total_cycles: AtomicU64::new(0),
            young_cycles: AtomicU64::new(0),
            full_cycles: AtomicU64::new(0),
            aggressive_cycles: AtomicU64::new(0),
            last_cycle_ns: AtomicU64::new(0),
            pauses: Histogram::new(),
            pause_target_ns: max_pause.as_nanos() as u64,
            pauses_over_target: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
            out_of_memory_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed cycle
    pub fn record_cycle(
        &self,
        generation: GcGeneration,
        aggressive: bool,
        duration: Duration,
        reclaimed: usize,
    ) {
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        match generation {
            GcGeneration::Young => self.young_cycles.fetch_add(1, Ordering::Relaxed),
            GcGeneration::Full => self.full_cycles.fetch_add(1, Ordering::Relaxed),
        };
        if aggressive {
            self.aggressive_cycles.fetch_add(1, Ordering::Relaxed);
        }
        self.last_cycle_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
        self.reclaimed_bytes
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
    }

    /// Record one global pause; returns true when it exceeded the target
    pub fn record_pause(&self, duration: Duration) -> bool {
        let nanos = duration.as_nanos() as u64;
        self.pauses.record(nanos);
        let over = nanos > self.pause_target_ns;
        if over {
            self.pauses_over_target.fetch_add(1, Ordering::Relaxed);
        }
        over
    }

    pub fn record_out_of_memory(&self) {
        self.out_of_memory_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles.load(Ordering::Relaxed)
    }

    pub fn pause_histogram(&self) -> &Histogram {
        &self.pauses
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Snapshot of the counters kept here
    pub fn snapshot(&self) -> GcMetricsSnapshot {
        let ms = |nanos: u64| nanos as f64 / 1_000_000.0;
        let us = |nanos: u64| nanos / 1_000;
        GcMetricsSnapshot {
            cycles: self.total_cycles.load(Ordering::Relaxed),
            young_cycles: self.young_cycles.load(Ordering::Relaxed),
            full_cycles: self.full_cycles.load(Ordering::Relaxed),
            aggressive_cycles: self.aggressive_cycles.load(Ordering::Relaxed),
            last_cycle_ms: ms(self.last_cycle_ns.load(Ordering::Relaxed)),
            pauses: self.pauses.count(),
            total_pause_ms: ms(self.pauses.sum()),
            max_pause_ms: ms(self.pauses.max()),
            pause_p50_us: us(self.pauses.percentile(50.0)),
            pause_p95_us: us(self.pauses.percentile(95.0)),
            pause_p99_us: us(self.pauses.percentile(99.0)),
            pauses_over_target: self.pauses_over_target.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
            out_of_memory_errors: self.out_of_memory_errors.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs_f64(),
            ..GcMetricsSnapshot::default()
        }
    }

    /// Reset statistics
    pub fn reset(&self) {
        self.total_cycles.store(0, Ordering::Relaxed);
        self.young_cycles.store(0, Ordering::Relaxed);
        self.full_cycles.store(0, Ordering::Relaxed);
        self.aggressive_cycles.store(0, Ordering::Relaxed);
        self.pauses_over_target.store(0, Ordering::Relaxed);
        self.reclaimed_bytes.store(0, Ordering::Relaxed);
        self.pauses.clear();
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}
