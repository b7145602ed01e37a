//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use crate::types::DeviceStatus;
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // State engine
    describe_counter!(
        "pcitrack_device_transitions_total",
        "Device state transitions attempted (by op: claim, allocate, free, remove; result)"
    );
    describe_gauge!("pcitrack_devices", "Tracked devices of the current node (by status)");

    // Persistence
    describe_counter!(
        "pcitrack_uuid_backfill_total",
        "uuid backfills on legacy rows (by outcome: assigned, lost_race, conflict)"
    );
    describe_counter!("pcitrack_db_errors_total", "Database errors (by operation)");
}

/// Helper functions for common metric patterns
pub fn record_transition<T, E>(op: &'static str, result: &Result<T, E>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    counter!("pcitrack_device_transitions_total", "op" => op, "result" => outcome).increment(1);
}

pub fn set_device_count(status: DeviceStatus, count: usize) {
    gauge!("pcitrack_devices", "status" => status.as_str()).set(count as f64);
}
