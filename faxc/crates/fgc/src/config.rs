//! Configuration Module - GC Tuning Parameters
//!
//! Manages all configuration parameters for FGC.
//! Proper configuration balances throughput, latency, and memory footprint.

/// Main configuration for Fax Garbage Collector
///
/// Stores all parameters affecting GC behavior.
/// Most parameters have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use fgc::GcConfig;
/// use fgc::config::MB;
///
/// // Small heap for a test
/// let config = GcConfig {
///     min_heap_size: 2 * MB,
///     max_heap_size: 8 * MB,
///     concurrent_gc_threads: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Minimum heap size in bytes
    ///
    /// Freed regions are returned to the OS only while committed memory
    /// stays above this size.
    /// Default: 1/4 of max_heap_size
    pub min_heap_size: usize,

    /// Maximum heap size in bytes
    ///
    /// Hard limit on committed memory. Rounded down to a whole number of
    /// regions when the heap is reserved.
    /// Default: 1/4 of physical memory, at most 4GB
    pub max_heap_size: usize,

    /// Region size in bytes
    ///
    /// Unit of allocation, relocation and reclamation. Power of two.
    /// Default: 2MB
    pub region_size: usize,

    /// Number of collector worker threads for concurrent phases
    ///
    /// Default: min(4, num_cpus / 2), at least 1
    pub concurrent_gc_threads: usize,

    /// Soft pause target in milliseconds
    ///
    /// Pauses above this are logged as warnings. FGC pauses only scan roots,
    /// so the target is normally met without tuning.
    /// Default: 1ms
    pub max_pause_ms: u64,

    /// Heap occupancy ratio that triggers a background cycle (0.0 - 1.0]
    ///
    /// Default: 0.75
    pub trigger_heap_usage: f64,

    /// Enable generational mode
    ///
    /// Young collections trace only young regions plus remembered-set
    /// entries. When false every collection is a full collection.
    ///
    /// Default: true
    pub use_generational: bool,

    /// Minimum TLAB size in bytes
    ///
    /// Default: 4KB
    pub tlab_min_size: usize,

    /// Maximum TLAB size in bytes
    ///
    /// Objects larger than this bypass the TLAB.
    /// Default: 256KB
    pub tlab_max_size: usize,

    /// Fraction of a TLAB that may be wasted when it is retired early
    ///
    /// A thread whose TLAB has more than `size * ratio` bytes left keeps it
    /// and allocates the object through the shared slow path instead.
    /// Default: 0.02
    pub tlab_target_waste_ratio: f64,

    /// Young collections an object survives before promotion
    ///
    /// Default: 2
    pub tenure_threshold: u8,

    /// Live ratio below which a region is selected for relocation
    ///
    /// Default: 0.25
    pub reclaim_threshold: f64,

    /// Relaxed live ratio used by the aggressive pass before OOM
    ///
    /// Default: 0.75
    pub aggressive_reclaim_threshold: f64,

    /// Heap occupancy at which soft references are cleared like weak ones
    ///
    /// Default: 0.90
    pub soft_ref_clear_usage: f64,

    /// Maximum field entries per remembered set before it overflows
    ///
    /// Default: 65536
    pub remembered_set_capacity: usize,

    /// Enable verbose GC logging
    ///
    /// Logs cycle summaries at info level in addition to the event history.
    /// Default: false
    pub verbose: bool,
}

impl Default for GcConfig {
    /// Default configuration for FGC
    ///
    /// Balanced for general-purpose server applications.
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        let max_heap = calculate_max_heap(get_total_memory());

        GcConfig {
            // Heap size
            min_heap_size: (max_heap / 4).max(DEFAULT_REGION_SIZE),
            max_heap_size: max_heap,
            region_size: DEFAULT_REGION_SIZE,

            // Threading and pauses
            concurrent_gc_threads: (num_cpus / 2).clamp(1, 4),
            max_pause_ms: 1,
            trigger_heap_usage: 0.75,

            // Generational
            use_generational: true,
            tenure_threshold: 2,

            // TLAB
            tlab_min_size: 4 * KB,
            tlab_max_size: 256 * KB,
            tlab_target_waste_ratio: 0.02,

            // Reclaim
            reclaim_threshold: 0.25,
            aggressive_reclaim_threshold: 0.75,
            soft_ref_clear_usage: 0.90,
            remembered_set_capacity: 64 * 1024,

            // Debug
            verbose: false,
        }
    }
}

impl GcConfig {
    /// Configuration used by `gc_init(max_heap_bytes, thread_count)`
    ///
    /// Keeps every other default. `thread_count == 0` selects the default
    /// thread count.
    pub fn for_heap(max_heap_bytes: usize, thread_count: usize) -> Self {
        let defaults = Self::default();
        GcConfig {
            min_heap_size: (max_heap_bytes / 4).min(max_heap_bytes),
            max_heap_size: max_heap_bytes,
            concurrent_gc_threads: if thread_count == 0 {
                defaults.concurrent_gc_threads
            } else {
                thread_count
            },
            ..defaults
        }
    }

    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    /// Returns error if configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fgc::GcConfig;
    ///
    /// let config = GcConfig {
    ///     max_heap_size: 0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Region size validation
        if !self.region_size.is_power_of_two() || self.region_size < 64 * KB {
            return Err(ConfigError::InvalidRegionSize(format!(
                "region_size must be a power of two >= 64KB, got {}",
                self.region_size
            )));
        }

        if self.region_size % page_size::get() != 0 {
            return Err(ConfigError::InvalidRegionSize(
                "region_size must be a multiple of the page size".to_string(),
            ));
        }

        // Heap size validation
        if self.max_heap_size == 0 {
            return Err(ConfigError::InvalidHeapSize(
                "max_heap_size must be > 0".to_string(),
            ));
        }

        if self.min_heap_size > self.max_heap_size {
            return Err(ConfigError::InvertedHeapBounds {
                min: self.min_heap_size,
                max: self.max_heap_size,
            });
        }

        if self.max_heap_size < self.region_size {
            return Err(ConfigError::InvalidHeapSize(format!(
                "max_heap_size ({}) must hold at least one region ({})",
                self.max_heap_size, self.region_size
            )));
        }

        // TLAB validation
        if self.tlab_min_size == 0 || self.tlab_min_size > self.tlab_max_size {
            return Err(ConfigError::InvalidTlabSize(
                "tlab_min_size must be > 0 and <= tlab_max_size".to_string(),
            ));
        }

        if self.tlab_max_size > self.region_size {
            return Err(ConfigError::InvalidTlabSize(
                "tlab_max_size must be <= region_size".to_string(),
            ));
        }

        if !(self.tlab_target_waste_ratio > 0.0 && self.tlab_target_waste_ratio <= 0.5) {
            return Err(ConfigError::InvalidTlabSize(
                "tlab_target_waste_ratio must be in (0, 0.5]".to_string(),
            ));
        }

        // Ratio validation
        for (name, value) in [
            ("trigger_heap_usage", self.trigger_heap_usage),
            ("reclaim_threshold", self.reclaim_threshold),
            ("aggressive_reclaim_threshold", self.aggressive_reclaim_threshold),
            ("soft_ref_clear_usage", self.soft_ref_clear_usage),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidThreshold(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.aggressive_reclaim_threshold < self.reclaim_threshold {
            return Err(ConfigError::InvalidThreshold(
                "aggressive_reclaim_threshold must be >= reclaim_threshold".to_string(),
            ));
        }

        // Generational validation
        if self.tenure_threshold == 0 || self.tenure_threshold > MAX_TENURE_THRESHOLD {
            return Err(ConfigError::InvalidThreshold(format!(
                "tenure_threshold must be in 1..={}",
                MAX_TENURE_THRESHOLD
            )));
        }

        if self.remembered_set_capacity == 0 {
            return Err(ConfigError::InvalidThreshold(
                "remembered_set_capacity must be > 0".to_string(),
            ));
        }

        // GC threads validation
        if self.concurrent_gc_threads == 0 {
            return Err(ConfigError::InvalidGcThreads(
                "concurrent_gc_threads must be > 0".to_string(),
            ));
        }

        // Pause time validation
        if self.max_pause_ms == 0 {
            return Err(ConfigError::InvalidPauseTime(
                "max_pause_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - FGC_MAX_HEAP
    /// - FGC_MIN_HEAP
    /// - FGC_REGION_SIZE
    /// - FGC_GC_THREADS
    /// - FGC_MAX_PAUSE_MS
    /// - FGC_TRIGGER_USAGE
    /// - FGC_GENERATIONAL
    /// - FGC_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export FGC_MAX_HEAP=4294967296  # 4GB
    /// export FGC_TRIGGER_USAGE=0.6
    /// export FGC_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("FGC_MAX_HEAP") {
            config.max_heap_size = size;
        }

        if let Some(size) = env_parse::<usize>("FGC_MIN_HEAP") {
            config.min_heap_size = size;
        }

        if let Some(size) = env_parse::<usize>("FGC_REGION_SIZE") {
            config.region_size = size;
        }

        if let Some(threads) = env_parse::<usize>("FGC_GC_THREADS") {
            config.concurrent_gc_threads = threads;
        }

        if let Some(ms) = env_parse::<u64>("FGC_MAX_PAUSE_MS") {
            config.max_pause_ms = ms;
        }

        if let Some(ratio) = env_parse::<f64>("FGC_TRIGGER_USAGE") {
            config.trigger_heap_usage = ratio;
        }

        if let Ok(val) = std::env::var("FGC_GENERATIONAL") {
            config.use_generational = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("FGC_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }

    /// Number of whole regions that fit in `max_heap_size`
    pub fn region_count(&self) -> usize {
        self.max_heap_size / self.region_size
    }
}

/// Error types for configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Inverted heap bounds: min_heap_size {min} exceeds max_heap_size {max}")]
    InvertedHeapBounds { min: usize, max: usize },

    #[error("Invalid TLAB size: {0}")]
    InvalidTlabSize(String),

    #[error("Invalid region size: {0}")]
    InvalidRegionSize(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),

    #[error("Invalid pause time: {0}")]
    InvalidPauseTime(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

/// 1 Kilobyte
pub const KB: usize = 1024;
/// 1 Megabyte
pub const MB: usize = 1024 * 1024;
/// 1 Gigabyte
pub const GB: usize = 1024 * 1024 * 1024;

/// Default region size: 2MB
pub const DEFAULT_REGION_SIZE: usize = 2 * MB;

/// Largest age the object header can hold
pub const MAX_TENURE_THRESHOLD: u8 = 15;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse::<T>().ok()
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Get total physical memory in bytes
fn get_total_memory() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<usize>) {
                        return kb * KB;
                    }
                }
            }
        }
    }

    8 * GB
}

/// Calculate max heap size based on available memory, rounded to regions
fn calculate_max_heap(total_memory: usize) -> usize {
    let quarter = (total_memory / 4).clamp(64 * MB, 4 * GB);
    quarter - quarter % DEFAULT_REGION_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.use_generational);
        assert_eq!(config.region_size, 2 * MB);
        assert_eq!(config.trigger_heap_usage, 0.75);
        assert_eq!(config.tlab_target_waste_ratio, 0.02);
        assert_eq!(config.tenure_threshold, 2);
        assert!((1..=4).contains(&config.concurrent_gc_threads));
    }

    #[test]
    fn test_invalid_heap_size() {
        let config = GcConfig {
            max_heap_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_heap_bounds() {
        let config = GcConfig {
            min_heap_size: 16 * MB,
            max_heap_size: 8 * MB,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvertedHeapBounds {
                min: 16 * MB,
                max: 8 * MB
            })
        );
    }

    #[test]
    fn test_invalid_region_size() {
        let config = GcConfig {
            region_size: 3 * MB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegionSize(_))
        ));
    }

    #[test]
    fn test_invalid_ratios() {
        let trigger = GcConfig {
            trigger_heap_usage: 1.5,
            ..Default::default()
        };
        assert!(trigger.validate().is_err());

        let waste = GcConfig {
            tlab_target_waste_ratio: 0.0,
            ..Default::default()
        };
        assert!(waste.validate().is_err());
    }

    #[test]
    fn test_for_heap() {
        let config = GcConfig::for_heap(8 * MB, 3);
        assert_eq!(config.max_heap_size, 8 * MB);
        assert_eq!(config.min_heap_size, 2 * MB);
        assert_eq!(config.concurrent_gc_threads, 3);
        assert_eq!(config.region_count(), 4);
        assert!(config.validate().is_ok());

        let default_threads = GcConfig::for_heap(8 * MB, 0);
        assert!(default_threads.concurrent_gc_threads > 0);
    }

    #[test]
    fn test_max_heap_is_region_multiple() {
        let max = calculate_max_heap(3 * GB + 123);
        assert_eq!(max % DEFAULT_REGION_SIZE, 0);
        assert!(max >= 64 * MB);
    }
}
