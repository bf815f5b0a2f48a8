// src/ingest/mod.rs
// Sessions sync cycle: convert, merge the pending queue, dispatch each part
// to the memory service, and advance the cursor only on full success.

pub mod docs;

use crate::clients::{MemoryBackend, MetadataStore};
use crate::config::SyncConfig;
use crate::convert::Converter;
use crate::error::Result;
use crate::lock;
use crate::state::backoff::BackoffState;
use crate::state::marker;
use crate::state::pending::PendingQueue;
use crate::synclog::SyncLog;
use crate::utils::now_ts;

/// Aggregated outcome of one sync cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Another worker held the run-lock; nothing was touched.
    pub skipped: bool,
    /// The backoff window was still open; queue persisted, cursor untouched.
    pub backed_off: bool,
    /// Parts newly finalized by the converter this cycle.
    pub converted: usize,
    /// Successful memorize dispatches.
    pub ok: usize,
    /// Paths skipped because the metadata store already knows them.
    pub existing: usize,
    /// Failed dispatches (timeout, transport, provider, rate limit).
    pub failed: usize,
}

/// Run one sessions sync cycle.
///
/// Per-item errors never propagate out of the dispatch loop; the worker
/// aggregates counts and reports them. Only state persistence failures
/// (`CorruptState`) abort the run.
pub async fn run_sessions_sync(
    cfg: &SyncConfig,
    memory: &dyn MemoryBackend,
    metadata: &MetadataStore,
    log: &SyncLog,
) -> Result<SyncReport> {
    let Some(_guard) = lock::acquire(lock::LOCK_AUTO_SYNC) else {
        log.log("sync already running; skip");
        return Ok(SyncReport {
            skipped: true,
            ..Default::default()
        });
    };

    let mut report = SyncReport::default();

    let last_sync = marker::read_last_sync_ts(&cfg.last_sync_path());
    let mut pending = PendingQueue::load(&cfg.pending_path());
    let mut backoff = BackoffState::load(&cfg.backoff_path());

    // Captured before conversion so the cursor never advances past work the
    // converter did not consider.
    let sync_start_ts = now_ts();

    let converted = Converter::new(cfg).convert(Some(last_sync))?;
    report.converted = converted.len();

    // Crash safety: the merged queue hits disk before any network call.
    pending.merge(
        converted
            .iter()
            .map(|p| p.to_string_lossy().into_owned()),
    );
    pending.save(&cfg.pending_path())?;

    if pending.is_empty() {
        marker::write_last_sync_ts(&cfg.last_sync_path(), sync_start_ts)?;
        backoff.clear();
        backoff.save(&cfg.backoff_path())?;
        log.log("sync complete. success=0, failed=0");
        return Ok(report);
    }

    let now = now_ts();
    if backoff.is_active(now) {
        log.log(&format!(
            "rate-limit backoff active; retrying in {:.0}s",
            backoff.remaining(now)
        ));
        report.backed_off = true;
        return Ok(report);
    }

    let mut remaining: Vec<String> = Vec::new();
    let mut saw_rate_limit = false;

    for path in &pending.paths {
        let exists = {
            let store = metadata.clone();
            let url = path.clone();
            let user = cfg.user_id.clone();
            tokio::task::spawn_blocking(move || store.resource_exists(&url, &user))
                .await
                .unwrap_or(false)
        };
        if exists {
            report.existing += 1;
            continue;
        }

        log.log(&format!("ingest: {path}"));
        match tokio::time::timeout(
            cfg.memorize_timeout,
            memory.memorize(path, "conversation", &cfg.user_id),
        )
        .await
        {
            Ok(Ok(())) => {
                report.ok += 1;
            }
            Ok(Err(e)) => {
                log.log(&format!("FAILED ingest {path}: {e}"));
                if e.is_rate_limit() {
                    saw_rate_limit = true;
                }
                report.failed += 1;
                remaining.push(path.clone());
            }
            Err(_elapsed) => {
                log.log(&format!(
                    "TIMEOUT ingest {path} after {}s",
                    cfg.memorize_timeout.as_secs()
                ));
                report.failed += 1;
                remaining.push(path.clone());
            }
        }
    }

    pending.replace(remaining);
    pending.save(&cfg.pending_path())?;

    if report.failed == 0 {
        marker::write_last_sync_ts(&cfg.last_sync_path(), sync_start_ts)?;
        backoff.clear();
        backoff.save(&cfg.backoff_path())?;
    } else if saw_rate_limit {
        backoff.arm(now_ts(), cfg.backoff_base, cfg.backoff_max);
        backoff.save(&cfg.backoff_path())?;
        log.log(&format!(
            "rate limit hit ({} consecutive); next retry after {:.0}s",
            backoff.consecutive_rate_limits,
            backoff.remaining(now_ts())
        ));
    }

    log.log(&format!(
        "sync complete. success={}, failed={}",
        report.ok, report.failed
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MemoryBackend;
    use crate::convert::registry;
    use crate::error::SyncError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Mutex;

    const SID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

    // The auto_sync run-lock is machine-global; serialize tests that take it.
    static SYNC_SERIAL: Mutex<()> = Mutex::new(());

    fn serialize_sync() -> std::sync::MutexGuard<'static, ()> {
        SYNC_SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scripted memory backend recording every dispatch.
    #[derive(Default)]
    struct MockMemory {
        calls: Mutex<Vec<String>>,
        // Pop-front error script; empty entry means success.
        failures: Mutex<Vec<Option<SyncError>>>,
    }

    impl MockMemory {
        fn scripted(failures: Vec<Option<SyncError>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl MemoryBackend for MockMemory {
        async fn memorize(&self, resource_url: &str, _modality: &str, _user: &str) -> crate::error::Result<()> {
            self.calls
                .lock()
                .expect("lock")
                .push(resource_url.to_string());
            let mut failures = self.failures.lock().expect("lock");
            match if failures.is_empty() { None } else { Some(failures.remove(0)) } {
                Some(Some(e)) => Err(e),
                _ => Ok(()),
            }
        }

        async fn retrieve(&self, _queries: &[String], _filter: Option<Value>) -> crate::error::Result<Value> {
            Ok(Value::Null)
        }
    }

    struct Fixture {
        _sessions: tempfile::TempDir,
        _data: tempfile::TempDir,
        cfg: SyncConfig,
        session_path: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let sessions = tempfile::tempdir().expect("sessions");
        let data = tempfile::tempdir().expect("data");
        let cfg = SyncConfig::for_dirs(sessions.path(), data.path());
        std::fs::write(
            registry::registry_path(sessions.path()),
            format!(r#"{{"main": "{SID}"}}"#),
        )
        .expect("registry");
        let session_path = sessions.path().join(format!("{SID}.jsonl"));
        Fixture {
            _sessions: sessions,
            _data: data,
            cfg,
            session_path,
        }
    }

    fn append_messages(path: &Path, count: usize) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        for i in 0..count {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            let line = serde_json::json!({
                "type": "message",
                "message": {"role": role, "content": [{"type": "text", "text": format!("m {i}")}]}
            });
            writeln!(f, "{line}").expect("write");
        }
    }

    fn store(cfg: &SyncConfig) -> MetadataStore {
        MetadataStore::new(cfg.metadata_db_path())
    }

    #[tokio::test]
    async fn test_empty_cycle_advances_cursor() {
        let _serial = serialize_sync();
        let fix = fixture();
        let memory = MockMemory::default();

        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report, SyncReport::default());
        assert!(marker::read_last_sync_ts(&fix.cfg.last_sync_path()) > 0.0);
        assert!(memory.calls().is_empty());
    }

    #[tokio::test]
    async fn test_full_cycle_dispatches_parts() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 120);
        let memory = MockMemory::default();

        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report.converted, 2);
        assert_eq!(report.ok, 2);
        assert_eq!(report.failed, 0);

        let calls = memory.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with(&format!("{SID}.part000.json")));
        assert!(calls[1].ends_with(&format!("{SID}.part001.json")));

        // Queue drained; cursor advanced.
        assert!(PendingQueue::load(&fix.cfg.pending_path()).is_empty());
        assert!(marker::read_last_sync_ts(&fix.cfg.last_sync_path()) > 0.0);
    }

    #[tokio::test]
    async fn test_failure_retains_path_and_cursor() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);
        let memory =
            MockMemory::scripted(vec![Some(SyncError::Provider("boom".into()))]);

        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report.failed, 1);
        assert_eq!(report.ok, 0);

        let pending = PendingQueue::load(&fix.cfg.pending_path());
        assert_eq!(pending.paths.len(), 1);
        assert_eq!(marker::read_last_sync_ts(&fix.cfg.last_sync_path()), 0.0);
        // Non-rate-limit failure arms no backoff.
        assert!(!BackoffState::load(&fix.cfg.backoff_path()).is_active(now_ts()));
    }

    #[tokio::test]
    async fn test_rate_limit_arms_backoff_then_skips() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);
        let memory = MockMemory::scripted(vec![Some(SyncError::RateLimited("HTTP 429".into()))]);

        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report.failed, 1);

        let backoff = BackoffState::load(&fix.cfg.backoff_path());
        assert_eq!(backoff.consecutive_rate_limits, 1);
        let wait = backoff.next_retry_ts - now_ts();
        assert!(wait > 55.0 && wait <= 60.5, "wait was {wait}");

        // Second run inside the window: queue skipped, no dispatch.
        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert!(report.backed_off);
        assert_eq!(memory.calls().len(), 1);
        assert_eq!(PendingQueue::load(&fix.cfg.pending_path()).paths.len(), 1);
    }

    #[tokio::test]
    async fn test_second_rate_limit_doubles_window() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);
        let memory = MockMemory::scripted(vec![
            Some(SyncError::RateLimited("HTTP 429".into())),
            Some(SyncError::RateLimited("HTTP 429".into())),
        ]);

        run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");

        // Expire the first window, then fail again.
        let mut backoff = BackoffState::load(&fix.cfg.backoff_path());
        backoff.next_retry_ts = now_ts() - 1.0;
        backoff.save(&fix.cfg.backoff_path()).expect("save");

        run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");

        let backoff = BackoffState::load(&fix.cfg.backoff_path());
        assert_eq!(backoff.consecutive_rate_limits, 2);
        let wait = backoff.next_retry_ts - now_ts();
        assert!(wait > 115.0 && wait <= 120.5, "wait was {wait}");
    }

    #[tokio::test]
    async fn test_existing_resources_masked() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);

        // First pass ingests normally.
        let memory = MockMemory::default();
        run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(memory.calls().len(), 1);
        let part_url = memory.calls()[0].clone();

        // Seed the metadata store with the ingested URL, then force the same
        // path back onto the queue; the existence probe masks the dispatch.
        let conn = rusqlite::Connection::open(fix.cfg.metadata_db_path()).expect("db");
        conn.execute(
            "CREATE TABLE memu_resources (url TEXT, user_id TEXT)",
            [],
        )
        .expect("create");
        conn.execute(
            "INSERT INTO memu_resources (url, user_id) VALUES (?1, ?2)",
            rusqlite::params![part_url, "default"],
        )
        .expect("insert");

        let mut pending = PendingQueue::load(&fix.cfg.pending_path());
        pending.merge([part_url]);
        pending.save(&fix.cfg.pending_path()).expect("save");

        let memory2 = MockMemory::default();
        let report = run_sessions_sync(&fix.cfg, &memory2, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report.existing, 1);
        assert_eq!(report.ok, 0);
        assert!(memory2.calls().is_empty());
        assert!(PendingQueue::load(&fix.cfg.pending_path()).is_empty());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);

        struct HangingMemory;
        #[async_trait]
        impl MemoryBackend for HangingMemory {
            async fn memorize(&self, _u: &str, _m: &str, _user: &str) -> crate::error::Result<()> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
            async fn retrieve(&self, _q: &[String], _f: Option<Value>) -> crate::error::Result<Value> {
                Ok(Value::Null)
            }
        }

        let mut cfg = fix.cfg.clone();
        cfg.memorize_timeout = std::time::Duration::from_millis(50);

        let report = run_sessions_sync(&cfg, &HangingMemory, &store(&cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert_eq!(report.failed, 1);
        assert_eq!(PendingQueue::load(&cfg.pending_path()).paths.len(), 1);
        // A timeout is not a rate limit.
        assert!(!BackoffState::load(&cfg.backoff_path()).is_active(now_ts()));
    }

    #[tokio::test]
    async fn test_concurrent_worker_skips_and_leaves_state() {
        let _serial = serialize_sync();
        let fix = fixture();
        append_messages(&fix.session_path, 60);

        // Simulate a live holder: our own PID in the run-lock file.
        let lock_file = lock::lock_path(lock::LOCK_AUTO_SYNC);
        std::fs::write(&lock_file, std::process::id().to_string()).expect("hold lock");

        let memory = MockMemory::default();
        let report = run_sessions_sync(&fix.cfg, &memory, &store(&fix.cfg), &SyncLog::disabled())
            .await
            .expect("sync");
        assert!(report.skipped);
        assert!(memory.calls().is_empty());
        assert_eq!(marker::read_last_sync_ts(&fix.cfg.last_sync_path()), 0.0);
        assert!(PendingQueue::load(&fix.cfg.pending_path()).is_empty());

        std::fs::remove_file(&lock_file).expect("cleanup");
    }
}
