// src/synclog.rs
// Append-only `sync.log` sink shared by all workers, mirrored to tracing.

use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writer for `<data_dir>/sync.log`.
///
/// Lines are `[YYYY-MM-DD HH:MM:SS] message`. Logging is best-effort: a
/// missing or unwritable data dir never fails the worker.
pub struct SyncLog {
    path: Option<PathBuf>,
}

impl SyncLog {
    pub fn new(data_dir: Option<&Path>) -> Self {
        Self {
            path: data_dir.map(|d| d.join("sync.log")),
        }
    }

    /// Disabled log (no file sink), still mirrors to tracing.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn log(&self, msg: &str) {
        tracing::info!("{}", msg);
        let Some(ref path) = self.path else {
            return;
        };
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{}] {}\n", stamp, msg);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::debug!("sync.log write failed: {}", e);
        }
    }
}
