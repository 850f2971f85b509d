//! GC Metrics - Pull-Based Metrics Snapshot
//!
//! A snapshot is a plain serializable value; exporting it (JSON, Prometheus
//! text) is left to the caller.

use serde::Serialize;

/// GcMetricsSnapshot - point-in-time view of every collector counter
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcMetricsSnapshot {
    // Cycles
    pub cycles: u64,
    pub young_cycles: u64,
    pub full_cycles: u64,
    pub aggressive_cycles: u64,
    pub last_cycle_ms: f64,

    // Pauses
    pub pauses: u64,
    pub total_pause_ms: f64,
    pub max_pause_ms: f64,
    pub pause_p50_us: u64,
    pub pause_p95_us: u64,
    pub pause_p99_us: u64,
    pub pauses_over_target: u64,

    // Heap
    pub heap_usage_ratio: f64,
    pub used_bytes: usize,
    pub committed_bytes: usize,
    pub max_bytes: usize,
    pub reclaimed_bytes: u64,

    // Allocation
    pub allocated_bytes: u64,
    pub allocation_rate_bytes_per_sec: f64,
    pub tlab_hit_ratio: f64,
    pub out_of_memory_errors: u64,

    // Relocation and promotion
    pub relocated_objects: u64,
    pub relocated_bytes: u64,
    pub promoted_objects: u64,
    pub aborted_relocations: u64,

    // References
    pub cleared_references: u64,
    pub enqueued_references: u64,

    pub uptime_secs: f64,
}

impl GcMetricsSnapshot {
    /// Render as a JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Render as Prometheus text exposition, one gauge per numeric field
    pub fn to_prometheus(&self) -> serde_json::Result<String> {
        let value = serde_json::to_value(self)?;
        let mut output = String::new();
        if let serde_json::Value::Object(fields) = value {
            for (name, value) in fields {
                if let Some(number) = value.as_f64() {
                    output.push_str(&format!("fgc_{} {}\n", name, number));
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_export() {
        let snapshot = GcMetricsSnapshot {
            cycles: 3,
            heap_usage_ratio: 0.5,
            ..Default::default()
        };
        let json = snapshot.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["cycles"], 3);
        assert_eq!(parsed["heap_usage_ratio"], 0.5);
    }

    #[test]
    fn test_prometheus_export() {
        let snapshot = GcMetricsSnapshot {
            full_cycles: 2,
            ..Default::default()
        };
        let text = snapshot.to_prometheus().unwrap();
        assert!(text.contains("fgc_full_cycles 2\n"));
    }
}
