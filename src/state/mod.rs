// src/state/mod.rs
// Versioned per-session cursor store persisted as conversations/state.json.

pub mod atomic;
pub mod backoff;
pub mod marker;
pub mod pending;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 4;

/// Oldest version we migrate in place instead of discarding.
const MIGRATABLE_VERSION: u32 = 3;

/// Resumable conversion cursor for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionCursor {
    /// Path the cursor was built against; rotation is detected via identity.
    #[serde(default)]
    pub file_path: String,
    /// Filesystem identity of the session file.
    #[serde(default)]
    pub device: u64,
    #[serde(default)]
    pub inode: u64,
    /// Byte offset of the last complete JSONL line consumed.
    #[serde(default)]
    pub last_offset: u64,
    /// File stats at the cursor; fast-path skip hints.
    #[serde(default)]
    pub last_size: u64,
    #[serde(default)]
    pub last_mtime: f64,
    /// Number of finalized immutable parts emitted.
    #[serde(default)]
    pub part_count: u32,
    /// Messages staged in the tail file but not yet finalized.
    #[serde(default)]
    pub tail_part_messages: u32,
    /// Wall-clock stamp of the most recent tail growth; non-null iff the
    /// tail is non-empty.
    #[serde(default)]
    pub tail_last_activity_ts: Option<f64>,
    /// Language prefix applied when the parts were written; a change forces
    /// a full rebuild.
    #[serde(default)]
    pub lang_prefix: Option<String>,
    /// 64 KiB sample hashes guarding the append-only fast path.
    #[serde(default)]
    pub head_sha256: Option<String>,
    #[serde(default)]
    pub tail_sha256: Option<String>,
}

/// Whole-pipeline conversion state, one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionCursor>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            sessions: BTreeMap::new(),
        }
    }
}

impl SyncState {
    /// Load state from disk.
    ///
    /// Matching version loads as-is; the immediate predecessor migrates in
    /// place (cursors preserved so part sizing is not disturbed); anything
    /// else starts fresh. Never fails.
    pub fn load(path: &Path) -> Self {
        let Some(mut state) = atomic::read_json::<SyncState>(path) else {
            return Self::default();
        };

        match state.version {
            STATE_VERSION => state,
            MIGRATABLE_VERSION => {
                tracing::info!(
                    "migrating conversation state v{} -> v{} ({} sessions)",
                    MIGRATABLE_VERSION,
                    STATE_VERSION,
                    state.sessions.len()
                );
                // v3 cursors predate the sample-hash fields; serde defaults
                // leave them None, which forces one rebuild per session.
                state.version = STATE_VERSION;
                state
            }
            other => {
                tracing::warn!(
                    "unsupported conversation state v{}; starting fresh",
                    other
                );
                Self::default()
            }
        }
    }

    /// Atomically persist the state document.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_json_atomic(path, self)
    }

    pub fn cursor(&self, session_id: &str) -> Option<&SessionCursor> {
        self.sessions.get(session_id)
    }

    pub fn cursor_mut(&mut self, session_id: &str) -> &mut SessionCursor {
        self.sessions.entry(session_id.to_string()).or_default()
    }
}
