// src/convert/registry.rs
// Resolution of the active main-session file from the sessions directory.

use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Main sessions are UUID-named; sub-sessions use free-form names and are
/// never ingested.
static MAIN_SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap_or_else(|e| panic!("{e}"))
});

/// `sessions.json` registry inside the watched sessions directory.
pub fn registry_path(sessions_dir: &Path) -> PathBuf {
    sessions_dir.join("sessions.json")
}

pub fn is_main_session_id(id: &str) -> bool {
    MAIN_SESSION_ID_RE.is_match(id)
}

/// Resolve the current main session: `(session_id, jsonl_path)`.
///
/// The registry names the active session; when it is absent or unreadable
/// the newest UUID-named `.jsonl` in the directory is used instead.
pub fn resolve_main_session(sessions_dir: &Path) -> Option<(String, PathBuf)> {
    if let Some(id) = registry_session_id(&registry_path(sessions_dir)) {
        if is_main_session_id(&id) {
            let path = sessions_dir.join(format!("{id}.jsonl"));
            if path.exists() {
                return Some((id, path));
            }
            tracing::warn!("registry names session {} but {} is missing", id, path.display());
        } else {
            tracing::debug!("registry session id {} is not a main session", id);
        }
    }
    newest_main_session(sessions_dir)
}

fn registry_session_id(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let doc: Value = serde_json::from_slice(&bytes).ok()?;

    match doc.get("main") {
        Some(Value::String(id)) => return Some(id.clone()),
        Some(Value::Object(obj)) => {
            if let Some(id) = obj.get("id").and_then(Value::as_str) {
                return Some(id.to_string());
            }
        }
        _ => {}
    }
    doc.get("mainSessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn newest_main_session(sessions_dir: &Path) -> Option<(String, PathBuf)> {
    let mut best: Option<(std::time::SystemTime, String, PathBuf)> = None;

    for entry in std::fs::read_dir(sessions_dir).ok()?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_main_session_id(stem) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if best.as_ref().is_none_or(|(t, _, _)| modified > *t) {
            best = Some((modified, stem.to_string(), path));
        }
    }

    best.map(|(_, id, path)| (id, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

    #[test]
    fn test_main_session_id_shapes() {
        assert!(is_main_session_id(SID));
        assert!(is_main_session_id("00000000-0000-0000-0000-000000000000"));
        assert!(!is_main_session_id("my-sub-task"));
        assert!(!is_main_session_id("a1b2c3d4-e5f6-7890-abcd"));
        assert!(!is_main_session_id(""));
    }

    #[test]
    fn test_resolve_via_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(format!("{SID}.jsonl")), "{}\n").expect("session");
        std::fs::write(
            registry_path(dir.path()),
            format!(r#"{{"main": "{SID}"}}"#),
        )
        .expect("registry");

        let (id, path) = resolve_main_session(dir.path()).expect("resolved");
        assert_eq!(id, SID);
        assert!(path.ends_with(format!("{SID}.jsonl")));
    }

    #[test]
    fn test_resolve_via_registry_object_form() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(format!("{SID}.jsonl")), "{}\n").expect("session");
        std::fs::write(
            registry_path(dir.path()),
            format!(r#"{{"main": {{"id": "{SID}"}}}}"#),
        )
        .expect("registry");

        let (id, _) = resolve_main_session(dir.path()).expect("resolved");
        assert_eq!(id, SID);
    }

    #[test]
    fn test_fallback_newest_uuid_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = "11111111-2222-3333-4444-555555555555";
        std::fs::write(dir.path().join(format!("{old}.jsonl")), "{}\n").expect("old");
        std::fs::write(dir.path().join("sub-task.jsonl"), "{}\n").expect("sub");

        // Backdate the older session well past mtime granularity.
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let f = std::fs::File::open(dir.path().join(format!("{old}.jsonl"))).expect("open");
        f.set_modified(past).expect("set mtime");

        std::fs::write(dir.path().join(format!("{SID}.jsonl")), "{}\n").expect("new");

        let (id, _) = resolve_main_session(dir.path()).expect("resolved");
        assert_eq!(id, SID);
    }

    #[test]
    fn test_sub_sessions_never_resolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("scratch-pad.jsonl"), "{}\n").expect("sub");
        assert!(resolve_main_session(dir.path()).is_none());
    }

    #[test]
    fn test_registry_pointing_at_missing_file_falls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            registry_path(dir.path()),
            r#"{"main": "99999999-9999-9999-9999-999999999999"}"#,
        )
        .expect("registry");
        std::fs::write(dir.path().join(format!("{SID}.jsonl")), "{}\n").expect("session");

        let (id, _) = resolve_main_session(dir.path()).expect("resolved");
        assert_eq!(id, SID);
    }
}
