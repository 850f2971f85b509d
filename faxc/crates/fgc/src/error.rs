//! Error Module - FGC Error Types
//!
//! Defines the error taxonomy shared by every FGC operation.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - unsatisfiable even after an aggressive collection pass
//! - `RegionAllocationFailed` - transient, retried internally by the allocator
//!
//! ## Setup Errors
//! - `HeapInitialization` - reservation failed or heap bounds are inverted
//! - `Configuration` - rejected at init, never deferred
//!
//! ## Collector Errors
//! - `ConcurrentModification` - invariant violation; halts the collector
//! - `InvalidState` - operation issued in the wrong phase or lifecycle state
//! - `ShutDown` - the collector was shut down
//!
//! ## Caller Errors
//! - `InvalidArgument` - bad pointer, slot index or size

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for all FGC operations
///
/// # Examples
///
/// ```rust
/// use fgc::error::FgcError;
///
/// fn handle_error(err: FgcError) {
///     match err {
///         FgcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         err if err.is_fatal() => panic!("collector defect: {}", err),
///         _ => eprintln!("Other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FgcError {
    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** Allocation still fails after one collect-and-retry
    /// cycle and one aggressive pass.
    ///
    /// **Recovery strategy:** Release roots and retry, or fail gracefully
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Heap initialization failed
    ///
    /// **When returned:** Address space reservation fails, the reservation lies
    /// outside the colored-pointer address range, or min/max heap are inverted
    ///
    /// **Recovery strategy:** Cannot recover - fix the configuration
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Region allocation failed
    ///
    /// **When returned:** No free region (or contiguous run) is available and
    /// committing another one would exceed the configured maximum
    ///
    /// **Recovery strategy:** Handled inside the allocator by collecting and retrying
    #[error("Region allocation failed: {reason}")]
    RegionAllocationFailed { reason: String },

    /// Concurrent modification detected
    ///
    /// **When returned:** A collector invariant was violated, e.g. a region
    /// state transition raced with another transition
    ///
    /// **Recovery strategy:** None. The collector halts; this is a defect
    #[error("Concurrent modification detected during {operation}")]
    ConcurrentModification { operation: String },

    /// Invalid configuration
    ///
    /// **When returned:** `GcConfig::validate` rejected a value at init
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid argument
    ///
    /// **When returned:** Null or foreign pointer, slot index out of range,
    /// zero-sized or oversized request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state
    ///
    /// **When returned:** Operation requires a different collector state,
    /// e.g. a blocking collection requested while holding a mutator guard
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The collector has been shut down
    #[error("Garbage collector has been shut down")]
    ShutDown,
}

impl FgcError {
    /// True for errors the allocator retries internally
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FgcError::OutOfMemory { .. } | FgcError::RegionAllocationFailed { .. }
        )
    }

    /// True for invariant violations that halt the collector
    pub fn is_fatal(&self) -> bool {
        matches!(self, FgcError::ConcurrentModification { .. })
    }

    /// Short helper for `ConcurrentModification`
    pub fn concurrent_modification(operation: impl Into<String>) -> Self {
        FgcError::ConcurrentModification {
            operation: operation.into(),
        }
    }

    /// Short helper for `InvalidState`
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        FgcError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<ConfigError> for FgcError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvertedHeapBounds { .. } => FgcError::HeapInitialization(err.to_string()),
            other => FgcError::Configuration(other.to_string()),
        }
    }
}

/// Result type alias for FGC operations
pub type Result<T> = std::result::Result<T, FgcError>;

/// Early-return with an `InvalidArgument` error when a condition does not hold
#[macro_export]
macro_rules! ensure_arg {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err($crate::error::FgcError::InvalidArgument(format!($($msg)+)));
        }
    };
}
