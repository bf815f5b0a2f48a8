// src/lock.rs
// PID-aware exclusive file locks with stale recovery.
//
// A lock is a file in the OS temp dir whose body is the holder's decimal
// PID. Exclusive creation (O_CREAT|O_EXCL) arbitrates; liveness of a
// recorded PID decides whether an existing lock is held or stale.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shared lock-file prefix; full names are `memu_sync.lock_<name>`.
const LOCK_PREFIX: &str = "memu_sync.lock";

/// Trigger-lock mtime staleness fallback (last resort when the PID inside
/// the lock file is unreadable).
const TRIGGER_STALE: Duration = Duration::from_secs(15 * 60);

/// Worker run-lock names.
pub const LOCK_WATCH_SYNC: &str = "watch_sync";
pub const LOCK_AUTO_SYNC: &str = "auto_sync";
pub const LOCK_DOCS_INGEST: &str = "docs_ingest";

/// Held exclusive lock; released (close + unlink) on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl LockGuard {
    /// Best-effort release on all exit paths, signal handlers included:
    /// callers that intercept signals call this explicitly, everyone else
    /// relies on Drop.
    pub fn release(&mut self) {
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::debug!("releasing {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Full path of the lock file for `name` in the OS temp dir.
pub fn lock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", LOCK_PREFIX, name))
}

/// Acquire a run-lock. `None` means another live holder owns it.
///
/// If the file exists but its PID is dead, the stale lock is removed and
/// exactly one retry is attempted.
pub fn acquire(name: &str) -> Option<LockGuard> {
    let path = lock_path(name);

    if let Some(guard) = try_create(&path) {
        return Some(guard);
    }

    match read_holder_pid(&path) {
        Some(pid) if pid_alive(pid) => None,
        Some(_) => {
            // Dead holder: recover and retry once.
            let _ = std::fs::remove_file(&path);
            try_create(&path)
        }
        // Unreadable PID: conservatively treat as held.
        None => None,
    }
}

/// Acquire a trigger-lock (held by the watcher only while spawning).
///
/// Same PID-aware semantics as [`acquire`], with an mtime-based staleness
/// fallback after 15 minutes for lock files whose PID cannot be read.
pub fn acquire_trigger(name: &str) -> Option<LockGuard> {
    let path = lock_path(name);

    if let Some(guard) = try_create(&path) {
        return Some(guard);
    }

    match read_holder_pid(&path) {
        Some(pid) if pid_alive(pid) => None,
        Some(_) => {
            let _ = std::fs::remove_file(&path);
            try_create(&path)
        }
        None => {
            let stale = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > TRIGGER_STALE);
            if stale {
                let _ = std::fs::remove_file(&path);
                try_create(&path)
            } else {
                None
            }
        }
    }
}

/// Whether the run-lock for `name` is currently held by a live process.
/// Used by the watcher to drop events without spawning a doomed worker.
pub fn is_held(name: &str) -> bool {
    read_holder_pid(&lock_path(name)).is_some_and(pid_alive)
}

fn try_create(path: &Path) -> Option<LockGuard> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            if let Err(e) = write!(file, "{}", std::process::id()) {
                tracing::debug!("writing pid to {}: {}", path.display(), e);
            }
            Some(LockGuard {
                path: path.to_path_buf(),
                file: Some(file),
            })
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => None,
        Err(e) => {
            tracing::warn!("creating lock {}: {}", path.display(), e);
            None
        }
    }
}

fn read_holder_pid(path: &Path) -> Option<i32> {
    let body = std::fs::read_to_string(path).ok()?;
    let pid: i32 = body.trim().parse().ok()?;
    // PID 0/1 in a lock file is never a worker of ours.
    (pid > 1).then_some(pid)
}

/// No-op signal liveness probe. Ambiguous permission errors count as alive.
fn pid_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn unique_name(tag: &str) -> String {
        format!("test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_acquire_and_release() {
        let name = unique_name("acquire");
        let guard = acquire(&name).expect("lock should be free");
        assert!(lock_path(&name).exists());

        let body = std::fs::read_to_string(lock_path(&name)).expect("read");
        assert_eq!(body.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!lock_path(&name).exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let name = unique_name("held");
        let _guard = acquire(&name).expect("first acquire");
        // Our own PID is alive, so the second acquisition reports held.
        assert!(acquire(&name).is_none());
        assert!(is_held(&name));
    }

    #[test]
    fn test_stale_lock_recovered() {
        let name = unique_name("stale");
        let path = lock_path(&name);
        // i32::MAX is above any real PID ceiling; kill() reports ESRCH.
        std::fs::write(&path, i32::MAX.to_string()).expect("write stale");

        assert!(!is_held(&name));
        let guard = acquire(&name).expect("stale lock should be recovered");
        drop(guard);
    }

    #[test]
    fn test_unreadable_pid_treated_as_held() {
        let name = unique_name("garbled");
        let path = lock_path(&name);
        std::fs::write(&path, "not-a-pid").expect("write");

        assert!(acquire(&name).is_none());
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn test_trigger_lock_mtime_fallback() {
        let name = unique_name("trigger");
        let path = lock_path(&name);
        {
            let mut f = std::fs::File::create(&path).expect("create");
            write!(f, "garbage").expect("write");
        }

        // Fresh unreadable lock: held.
        assert!(acquire_trigger(&name).is_none());
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn test_release_is_idempotent() {
        let name = unique_name("idem");
        let mut guard = acquire(&name).expect("acquire");
        guard.release();
        guard.release();
        assert!(!lock_path(&name).exists());
    }

    #[test]
    fn test_pid_alive_self() {
        assert!(pid_alive(std::process::id() as i32));
    }
}
