// src/ingest/docs.rs
// Docs tributary: ingest markdown files from the configured extra paths,
// either incrementally (one changed path) or as a full scan.

use crate::clients::{MemoryBackend, MetadataStore};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::lock;
use crate::state::marker;
use crate::synclog::SyncLog;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Aggregated outcome of one docs ingest run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DocsReport {
    pub skipped: bool,
    pub ok: usize,
    pub existing: usize,
    pub failed: usize,
    pub files: usize,
}

/// Run one docs ingest cycle under its own run-lock.
pub async fn run_docs_ingest(
    cfg: &SyncConfig,
    memory: &dyn MemoryBackend,
    metadata: &MetadataStore,
    log: &SyncLog,
) -> Result<DocsReport> {
    let Some(_guard) = lock::acquire(lock::LOCK_DOCS_INGEST) else {
        log.log("docs_ingest already running; skip");
        return Ok(DocsReport {
            skipped: true,
            ..Default::default()
        });
    };

    let changed_path = cfg.changed_path.as_deref();
    let files = collect_markdown_files(&cfg.extra_paths, changed_path);

    if files.is_empty() {
        match changed_path {
            Some(p) => log.log(&format!(
                "docs_ingest: no markdown files to ingest for change: {}",
                p.display()
            )),
            None => log.log("docs_ingest: no markdown files found in extra paths"),
        }
        return Ok(DocsReport::default());
    }

    let mode = if changed_path.is_some() {
        "incremental"
    } else {
        "full-scan"
    };
    log.log(&format!(
        "docs_ingest start. mode={} files={}",
        mode,
        files.len()
    ));

    let mut report = DocsReport {
        files: files.len(),
        ..Default::default()
    };

    for file in &files {
        let url = file.to_string_lossy().into_owned();

        let exists = {
            let store = metadata.clone();
            let probe_url = url.clone();
            let user = cfg.user_id.clone();
            tokio::task::spawn_blocking(move || store.resource_exists(&probe_url, &user))
                .await
                .unwrap_or(false)
        };
        if exists {
            report.existing += 1;
            continue;
        }

        log.log(&format!("docs_ingest ingest: {url}"));
        match tokio::time::timeout(
            cfg.memorize_timeout,
            memory.memorize(&url, "document", &cfg.user_id),
        )
        .await
        {
            Ok(Ok(())) => report.ok += 1,
            Ok(Err(e)) => {
                log.log(&format!("docs_ingest failed: {url}: {e}"));
                report.failed += 1;
            }
            Err(_elapsed) => {
                log.log(&format!(
                    "docs_ingest failed: {url}: timed out after {}s",
                    cfg.memorize_timeout.as_secs()
                ));
                report.failed += 1;
            }
        }
    }

    log.log(&format!(
        "docs_ingest complete. ok={} skipped={} fail={} files={}",
        report.ok, report.existing, report.failed, report.files
    ));

    // Stamp the marker so the watcher skips startup full-scans.
    if changed_path.is_none() {
        marker::write_full_scan_marker(&cfg.full_scan_marker_path())?;
    }

    Ok(report)
}

/// Collect markdown files to ingest, sorted and deduped.
///
/// With a changed path, only that file (or the markdown under that
/// directory) is considered, and only when it lies inside a configured
/// extra path. Without one, all extra paths are scanned.
pub fn collect_markdown_files(extra_paths: &[PathBuf], changed: Option<&Path>) -> Vec<PathBuf> {
    let mut files: BTreeSet<PathBuf> = BTreeSet::new();

    if let Some(changed) = changed {
        let changed = absolute(changed);
        let allowed = extra_paths
            .iter()
            .any(|prefix| is_under_prefix(&changed, &absolute(prefix)));
        if !allowed {
            return Vec::new();
        }
        if changed.is_file() {
            add_markdown(&mut files, &changed);
        } else if changed.is_dir() {
            scan_dir(&mut files, &changed);
        }
        return files.into_iter().collect();
    }

    for item in extra_paths {
        let item = absolute(item);
        if item.is_file() {
            add_markdown(&mut files, &item);
        } else if item.is_dir() {
            scan_dir(&mut files, &item);
        }
    }

    files.into_iter().collect()
}

fn add_markdown(files: &mut BTreeSet<PathBuf>, path: &Path) {
    if path.extension().and_then(|e| e.to_str()) == Some("md") {
        files.insert(path.to_path_buf());
    }
}

fn scan_dir(files: &mut BTreeSet<PathBuf>, dir: &Path) {
    for entry in WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_file() {
            add_markdown(files, entry.path());
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_under_prefix(path: &Path, prefix: &Path) -> bool {
    path == prefix || path.starts_with(prefix)
}
