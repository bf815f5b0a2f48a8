// src/watch/mod.rs
// Watcher-dispatcher: debounced filesystem observer that spawns worker
// processes, plus the periodic idle-flush poller.
//
// The watcher itself is a singleton (long-held run-lock, released on
// SIGINT/SIGTERM). Each spawned worker is a separate OS process re-invoking
// this binary with the `sync` / `docs` subcommand; workers are gated by
// their own run-locks, so the watcher never waits on them.

use crate::config::SyncConfig;
use crate::convert::registry;
use crate::error::Result;
use crate::lock;
use crate::state::marker;
use crate::synclog::SyncLog;
use crate::utils::{mtime_ts, now_ts};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Events within this window of the last spawn are dropped.
const DEBOUNCE_SECONDS: f64 = 5.0;

/// A tail file smaller than an empty JSON array is noise, not staged work.
const MIN_TAIL_BYTES: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Sessions,
    Docs,
}

impl WorkerKind {
    fn run_lock(self) -> &'static str {
        match self {
            WorkerKind::Sessions => lock::LOCK_AUTO_SYNC,
            WorkerKind::Docs => lock::LOCK_DOCS_INGEST,
        }
    }

    fn trigger_lock(self) -> &'static str {
        match self {
            WorkerKind::Sessions => "auto_sync_trigger",
            WorkerKind::Docs => "docs_ingest_trigger",
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            WorkerKind::Sessions => "sync",
            WorkerKind::Docs => "docs",
        }
    }
}

/// What a filesystem event asks the watcher to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Trigger {
    /// The session registry changed: re-resolve, then run the sessions worker.
    RegistryChanged,
    /// The main session file itself grew.
    SessionChanged,
    /// A markdown file under an extra path changed.
    DocChanged(PathBuf),
}

/// Per-handler debounce state.
#[derive(Debug, Default)]
struct Debounce {
    last_run: f64,
}

impl Debounce {
    fn ready(&mut self, now: f64) -> bool {
        if now - self.last_run < DEBOUNCE_SECONDS {
            return false;
        }
        self.last_run = now;
        true
    }
}

/// Long-running watcher entry point. Returns after SIGINT/SIGTERM.
pub async fn run_watcher(cfg: SyncConfig) -> Result<()> {
    let Some(mut singleton) = lock::acquire(lock::LOCK_WATCH_SYNC) else {
        println!("Another memu-sync watcher is already running. Exiting.");
        return Ok(());
    };

    let log = SyncLog::new(Some(&cfg.data_dir));
    let (tx, mut rx) = mpsc::channel::<PathBuf>(1024);

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                for path in event.paths {
                    // try_send keeps the notify callback thread non-blocking.
                    let _ = tx.try_send(path);
                }
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| crate::error::SyncError::Other(format!("create watcher: {e}")))?;

    if cfg.sessions_dir.is_dir() {
        if let Err(e) = watcher.watch(&cfg.sessions_dir, RecursiveMode::NonRecursive) {
            tracing::warn!("failed to watch sessions dir: {}", e);
        } else {
            tracing::info!("watching sessions: {}", cfg.sessions_dir.display());
        }
    } else {
        tracing::warn!(
            "session dir {} not found or not set",
            cfg.sessions_dir.display()
        );
    }

    for (dir, mode) in docs_watch_targets(&cfg.extra_paths) {
        match watcher.watch(&dir, mode) {
            Ok(()) => tracing::info!("watching docs: {}", dir.display()),
            Err(e) => tracing::warn!("failed to watch {}: {}", dir.display(), e),
        }
    }

    let mut service = WatchService::new(&cfg, log);

    // Initial sessions sync; docs full-scan only when the marker is absent.
    service.trigger(WorkerKind::Sessions, None);
    if !cfg.extra_paths.is_empty() && !marker::full_scan_done(&cfg.full_scan_marker_path()) {
        service.trigger(WorkerKind::Docs, None);
    }

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut poll = tokio::time::interval(cfg.flush_poll);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(path) = rx.recv() => {
                service.handle_event(&path);
            }
            _ = poll.tick() => {
                service.poll_idle_flush();
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received; shutting down watcher");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received; shutting down watcher");
                break;
            }
        }
    }

    singleton.release();
    Ok(())
}

/// Watcher state shared by the event loop.
struct WatchService<'a> {
    cfg: &'a SyncConfig,
    log: SyncLog,
    main_session: Option<(String, PathBuf)>,
    sessions_debounce: Debounce,
    docs_debounce: Debounce,
    /// Session mtime that already triggered an idle flush.
    flushed_mtime: Option<f64>,
}

impl<'a> WatchService<'a> {
    fn new(cfg: &'a SyncConfig, log: SyncLog) -> Self {
        Self {
            cfg,
            log,
            main_session: registry::resolve_main_session(&cfg.sessions_dir),
            sessions_debounce: Debounce::default(),
            docs_debounce: Debounce::default(),
            flushed_mtime: None,
        }
    }

    fn handle_event(&mut self, path: &Path) {
        let main_file = self.main_session.as_ref().map(|(_, p)| p.as_path());
        match classify_event(path, &self.cfg.sessions_dir, main_file, &self.cfg.extra_paths) {
            Some(Trigger::RegistryChanged) => {
                self.main_session = registry::resolve_main_session(&self.cfg.sessions_dir);
                self.trigger(WorkerKind::Sessions, None);
            }
            Some(Trigger::SessionChanged) => {
                self.trigger(WorkerKind::Sessions, None);
            }
            Some(Trigger::DocChanged(changed)) => {
                self.trigger(WorkerKind::Docs, Some(&changed));
            }
            None => {}
        }
    }

    /// Debounce, drop events whose worker is already running, then spawn.
    fn trigger(&mut self, kind: WorkerKind, changed: Option<&Path>) {
        let now = now_ts();
        let debounce = match kind {
            WorkerKind::Sessions => &mut self.sessions_debounce,
            WorkerKind::Docs => &mut self.docs_debounce,
        };
        if !debounce.ready(now) {
            return;
        }
        if lock::is_held(kind.run_lock()) {
            tracing::debug!("{} worker already running; event dropped", kind.subcommand());
            return;
        }

        // Trigger-lock held only across the spawn itself.
        let Some(_trigger) = lock::acquire_trigger(kind.trigger_lock()) else {
            return;
        };

        self.log.log(&format!(
            "change detected, triggering {} worker",
            kind.subcommand()
        ));
        spawn_worker(kind, changed);
    }

    /// Every poll tick: finalize a stale staged tail by spawning the
    /// sessions worker once per observed session mtime.
    fn poll_idle_flush(&mut self) {
        // Re-resolve so a registry swap between events is still honored.
        self.main_session = registry::resolve_main_session(&self.cfg.sessions_dir);
        let Some((session_id, session_path)) = self.main_session.clone() else {
            return;
        };

        let Ok(meta) = std::fs::metadata(&session_path) else {
            return;
        };
        let mtime = mtime_ts(&meta);
        if now_ts() - mtime < self.cfg.flush_idle.as_secs_f64() {
            return;
        }
        if self.flushed_mtime == Some(mtime) {
            return;
        }

        let tail_path = self
            .cfg
            .conversations_dir()
            .join(format!("{session_id}.tail.tmp.json"));
        let non_trivial = std::fs::metadata(&tail_path).is_ok_and(|m| m.len() >= MIN_TAIL_BYTES);
        if !non_trivial {
            return;
        }

        self.log.log(&format!(
            "session idle for {:.0}s with staged tail; triggering flush",
            now_ts() - mtime
        ));
        self.flushed_mtime = Some(mtime);
        self.trigger(WorkerKind::Sessions, None);
    }
}

/// Spawn a detached worker process; completion is reaped in the background.
fn spawn_worker(kind: WorkerKind, changed: Option<&Path>) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!("cannot resolve current executable: {}", e);
            return;
        }
    };

    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg(kind.subcommand());
    if let Some(changed) = changed {
        cmd.env("MEMU_CHANGED_PATH", changed);
    }

    match cmd.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => {
                        tracing::debug!("{} worker finished", kind.subcommand());
                    }
                    Ok(status) => {
                        tracing::warn!("{} worker exited with {}", kind.subcommand(), status);
                    }
                    Err(e) => {
                        tracing::warn!("failed to reap {} worker: {}", kind.subcommand(), e);
                    }
                }
            });
        }
        Err(e) => {
            tracing::error!("failed to spawn {} worker: {}", kind.subcommand(), e);
        }
    }
}

/// Watch registrations for the docs tributary: directories recursively,
/// file parents non-recursively, deduped.
fn docs_watch_targets(extra_paths: &[PathBuf]) -> Vec<(PathBuf, RecursiveMode)> {
    let mut seen = std::collections::HashSet::new();
    let mut targets = Vec::new();

    for item in extra_paths {
        let (dir, mode) = if item.is_dir() {
            (item.clone(), RecursiveMode::Recursive)
        } else if item.is_file() {
            let parent = item
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (parent, RecursiveMode::NonRecursive)
        } else {
            tracing::warn!("extra path {} not found", item.display());
            continue;
        };

        let key = (dir.clone(), matches!(mode, RecursiveMode::Recursive));
        if seen.insert(key) {
            targets.push((dir, mode));
        }
    }

    targets
}

/// Map a raw filesystem event path to a trigger, if any.
fn classify_event(
    path: &Path,
    sessions_dir: &Path,
    main_session_file: Option<&Path>,
    extra_paths: &[PathBuf],
) -> Option<Trigger> {
    if path.parent() == Some(sessions_dir) {
        if path == registry::registry_path(sessions_dir) {
            return Some(Trigger::RegistryChanged);
        }
        let ext = path.extension().and_then(|e| e.to_str())?;
        if (ext == "jsonl" || ext == "json") && Some(path) == main_session_file {
            return Some(Trigger::SessionChanged);
        }
        return None;
    }

    if path.extension().and_then(|e| e.to_str()) == Some("md")
        && extra_paths.iter().any(|p| path.starts_with(p))
    {
        return Some(Trigger::DocChanged(path.to_path_buf()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

    #[test]
    fn test_debounce_window() {
        let mut d = Debounce::default();
        assert!(d.ready(100.0));
        assert!(!d.ready(101.0));
        assert!(!d.ready(104.9));
        assert!(d.ready(105.1));
    }

    #[test]
    fn test_classify_registry_change() {
        let sessions = Path::new("/s");
        let got = classify_event(
            Path::new("/s/sessions.json"),
            sessions,
            None,
            &[],
        );
        assert_eq!(got, Some(Trigger::RegistryChanged));
    }

    #[test]
    fn test_classify_main_session_only() {
        let sessions = Path::new("/s");
        let main = PathBuf::from(format!("/s/{SID}.jsonl"));

        let got = classify_event(&main, sessions, Some(&main), &[]);
        assert_eq!(got, Some(Trigger::SessionChanged));

        // A different session file in the same dir does not trigger.
        let other = PathBuf::from("/s/other-session.jsonl");
        assert_eq!(classify_event(&other, sessions, Some(&main), &[]), None);

        // Non-jsonl noise in the sessions dir is ignored.
        let noise = PathBuf::from("/s/notes.txt");
        assert_eq!(classify_event(&noise, sessions, Some(&main), &[]), None);
    }

    #[test]
    fn test_classify_doc_change_scoped_to_extra_paths() {
        let extra = vec![PathBuf::from("/docs")];
        let got = classify_event(
            Path::new("/docs/guide/intro.md"),
            Path::new("/s"),
            None,
            &extra,
        );
        assert_eq!(
            got,
            Some(Trigger::DocChanged(PathBuf::from("/docs/guide/intro.md")))
        );

        assert_eq!(
            classify_event(Path::new("/elsewhere/a.md"), Path::new("/s"), None, &extra),
            None
        );
        assert_eq!(
            classify_event(Path::new("/docs/guide/image.png"), Path::new("/s"), None, &extra),
            None
        );
    }

    #[test]
    fn test_docs_watch_targets_dedupe() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.md"), "#").expect("write");
        std::fs::write(dir.path().join("b.md"), "#").expect("write");

        // Two files sharing a parent produce one non-recursive watch.
        let targets = docs_watch_targets(&[
            dir.path().join("a.md"),
            dir.path().join("b.md"),
        ]);
        assert_eq!(targets.len(), 1);
        assert!(matches!(targets[0].1, RecursiveMode::NonRecursive));

        // A directory is watched recursively.
        let targets = docs_watch_targets(&[dir.path().to_path_buf()]);
        assert_eq!(targets.len(), 1);
        assert!(matches!(targets[0].1, RecursiveMode::Recursive));

        // Missing paths are skipped.
        assert!(docs_watch_targets(&[PathBuf::from("/missing/x.md")]).is_empty());
    }

    #[test]
    fn test_worker_kind_wiring() {
        assert_eq!(WorkerKind::Sessions.run_lock(), lock::LOCK_AUTO_SYNC);
        assert_eq!(WorkerKind::Docs.run_lock(), lock::LOCK_DOCS_INGEST);
        assert_eq!(WorkerKind::Sessions.subcommand(), "sync");
        assert_eq!(WorkerKind::Docs.subcommand(), "docs");
    }
}
