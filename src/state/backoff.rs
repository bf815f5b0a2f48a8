// src/state/backoff.rs
// Exponential rate-limit backoff persisted as pending_backoff.json.

use super::atomic;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// `pending_backoff.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackoffState {
    #[serde(default)]
    pub next_retry_ts: f64,
    #[serde(default)]
    pub consecutive_rate_limits: u32,
    #[serde(default)]
    pub reason: String,
}

impl BackoffState {
    pub fn load(path: &Path) -> Self {
        atomic::read_json(path).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic::write_json_atomic(path, self)
    }

    /// Whether a retry window is still open at `now`.
    pub fn is_active(&self, now: f64) -> bool {
        self.next_retry_ts > now
    }

    /// Seconds remaining in the current window (0 when inactive).
    pub fn remaining(&self, now: f64) -> f64 {
        (self.next_retry_ts - now).max(0.0)
    }

    /// Arm (or extend) the backoff after a rate-limited run:
    /// `next_retry_ts = now + min(max, base * 2^(n-1))`.
    pub fn arm(&mut self, now: f64, base: Duration, max: Duration) {
        self.consecutive_rate_limits += 1;
        let exp = self.consecutive_rate_limits.saturating_sub(1).min(31);
        let delay = (base.as_secs_f64() * f64::from(1u32 << exp)).min(max.as_secs_f64());
        self.next_retry_ts = now + delay;
        self.reason = "rate_limit".to_string();
    }

    /// Reset after a fully successful sync.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
