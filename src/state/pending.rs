// src/state/pending.rs
// Ordered on-disk queue of part paths awaiting dispatch.

use super::atomic;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const PENDING_VERSION: u32 = 1;

/// `pending_ingest.json` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingQueue {
    pub version: u32,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self {
            version: PENDING_VERSION,
            paths: Vec::new(),
        }
    }
}

impl PendingQueue {
    pub fn load(path: &Path) -> Self {
        atomic::read_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_json_atomic(path, self)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Append `new_paths` after the pre-existing entries, preserving order
    /// and dropping duplicates by exact path.
    pub fn merge(&mut self, new_paths: impl IntoIterator<Item = String>) {
        let mut seen: HashSet<String> = self.paths.iter().cloned().collect();
        for p in new_paths {
            if seen.insert(p.clone()) {
                self.paths.push(p);
            }
        }
    }

    /// Replace the queue contents with the paths that remain after a run.
    pub fn replace(&mut self, remaining: Vec<String>) {
        self.paths = remaining;
    }
}
