//! GC Logging and Tracing
//!
//! Every collector event goes to the `log` facade and into a bounded
//! in-memory history that `diagnostics()` exposes.
//!
//! Log Levels:
//! - ERROR: fatal invariant violations
//! - WARN: out of memory, aborted relocations, pauses over target
//! - INFO: cycle summaries
//! - DEBUG: cycle start, phase transitions, pauses
//! - TRACE: per-region and per-object operations (emitted by the components)

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::allocator::GcGeneration;
use crate::runtime::GcPhase;

/// Default number of events kept in memory
pub const DEFAULT_HISTORY: usize = 256;

/// GC event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    CycleStart {
        cycle: u64,
        generation: GcGeneration,
        reason: String,
    },
    PhaseChange {
        cycle: u64,
        from: GcPhase,
        to: GcPhase,
    },
    Pause {
        cycle: u64,
        phase: GcPhase,
        duration_us: u64,
        time_to_safepoint_us: u64,
        over_target: bool,
    },
    RegionsReclaimed {
        cycle: u64,
        regions: usize,
        bytes: usize,
    },
    RelocationAborted {
        cycle: u64,
        regions: u64,
    },
    Promotion {
        cycle: u64,
        objects: u64,
    },
    CycleEnd {
        cycle: u64,
        generation: GcGeneration,
        duration_ms: f64,
        reclaimed_bytes: usize,
        heap_usage: f64,
    },
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    Fatal {
        cycle: u64,
        error: String,
    },
}

impl GcEvent {
    fn level(&self, verbose: bool) -> log::Level {
        match self {
            GcEvent::Fatal { .. } => log::Level::Error,
            GcEvent::OutOfMemory { .. } | GcEvent::RelocationAborted { .. } => log::Level::Warn,
            GcEvent::Pause {
                over_target: true, ..
            } => log::Level::Warn,
            GcEvent::CycleEnd { .. } => log::Level::Info,
            GcEvent::CycleStart { .. } if verbose => log::Level::Info,
            _ => log::Level::Debug,
        }
    }
}

impl fmt::Display for GcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcEvent::CycleStart {
                cycle,
                generation,
                reason,
            } => write!(f, "GC({}) {} cycle started ({})", cycle, generation, reason),
            GcEvent::PhaseChange { cycle, from, to } => {
                write!(f, "GC({}) {} -> {}", cycle, from, to)
            }
            GcEvent::Pause {
                cycle,
                phase,
                duration_us,
                time_to_safepoint_us,
                ..
            } => write!(
                f,
                "GC({}) {} pause {}us (safepoint {}us)",
                cycle, phase, duration_us, time_to_safepoint_us
            ),
            GcEvent::RegionsReclaimed {
                cycle,
                regions,
                bytes,
            } => write!(f, "GC({}) reclaimed {} regions, {} bytes", cycle, regions, bytes),
            GcEvent::RelocationAborted { cycle, regions } => write!(
                f,
                "GC({}) relocation aborted for {} regions, retrying next cycle",
                cycle, regions
            ),
            GcEvent::Promotion { cycle, objects } => {
                write!(f, "GC({}) promoted {} objects", cycle, objects)
            }
            GcEvent::CycleEnd {
                cycle,
                generation,
                duration_ms,
                reclaimed_bytes,
                heap_usage,
            } => write!(
                f,
                "GC({}) {} cycle completed in {:.3}ms, reclaimed {} bytes, heap {:.1}%",
                cycle,
                generation,
                duration_ms,
                reclaimed_bytes,
                heap_usage * 100.0
            ),
            GcEvent::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "Out of memory: requested {} bytes, {} available",
                requested, available
            ),
            GcEvent::Fatal { cycle, error } => write!(f, "GC({}) halted: {}", cycle, error),
        }
    }
}

/// An event with its wall-clock timestamp
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GcEvent,
}

impl LoggedEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// GC Logger - event history plus forwarding to `log`
pub struct GcLogger {
    history: Mutex<VecDeque<LoggedEvent>>,
    capacity: usize,
    verbose: bool,
    enabled: AtomicBool,
}

impl GcLogger {
    pub fn new(capacity: usize, verbose: bool) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY))),
            capacity: capacity.max(1),
            verbose,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }
        log::log!(target: "fgc", event.level(self.verbose), "{}", event);

        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(LoggedEvent {
            timestamp: Utc::now(),
            event,
        });
    }

    /// Oldest-first copy of the retained events
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn event_count(&self) -> usize {
        self.history.lock().len()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }

    /// Retained events as a JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.history.lock())
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY, false)
    }
}
