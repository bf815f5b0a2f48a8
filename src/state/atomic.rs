// src/state/atomic.rs
// Write-to-temp + rename persistence shared by every mutable document.

use crate::error::{Result, SyncError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::Path;

/// Atomically replace `path` with `bytes`.
///
/// The temp file is created in the target's directory so the rename stays on
/// one filesystem. Readers never observe a torn write. Any failure here is a
/// `CorruptState` per the error policy.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::CorruptState(format!("{} has no parent dir", path.display())))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::CorruptState(format!("create {}: {}", parent.display(), e)))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp_path, path)
    };

    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        SyncError::CorruptState(format!("persist {}: {}", path.display(), e))
    })
}

/// Serialize `value` as pretty JSON and atomically write it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| SyncError::CorruptState(format!("serialize {}: {}", path.display(), e)))?;
    write_atomic(path, &bytes)
}

/// Read a JSON document, returning `None` on missing or corrupt files.
/// Readers never fail.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring corrupt {}: {}", path.display(), e);
            None
        }
    }
}
