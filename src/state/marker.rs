// src/state/marker.rs
// Plain-text markers: last_sync_ts cursor and docs full-scan stamp.

use super::atomic;
use crate::error::Result;
use std::path::Path;

/// Read `last_sync_ts` (decimal float seconds). Missing or unparseable
/// content reads as 0 so the next sync considers everything.
pub fn read_last_sync_ts(path: &Path) -> f64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Atomically advance `last_sync_ts`.
pub fn write_last_sync_ts(path: &Path, ts: f64) -> Result<()> {
    atomic::write_atomic(path, format!("{}", ts).as_bytes())
}

/// Whether the docs full-scan marker exists.
pub fn full_scan_done(path: &Path) -> bool {
    path.exists()
}

/// Stamp the docs full-scan marker with the current local time (ISO 8601).
pub fn write_full_scan_marker(path: &Path) -> Result<()> {
    let stamp = chrono::Local::now().to_rfc3339();
    atomic::write_atomic(path, stamp.as_bytes())
}
