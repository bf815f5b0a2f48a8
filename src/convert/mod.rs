// src/convert/mod.rs
// Incremental session-to-parts converter.
//
// Orchestrates the tailer, filter, and part writer: append-only fast path
// gated by file identity and 64 KiB sample hashes, full rebuilds on any
// disagreement, idle/forced finalization of the staged tail, and atomic
// cursor advancement.

pub mod filter;
pub mod parts;
pub mod registry;
pub mod tailer;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::state::{SessionCursor, SyncState};
use crate::utils::{mtime_ts, now_ts, sha256_hex};
use filter::Message;
use parts::PartWriter;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Sample window for the head/tail guard hashes.
const SAMPLE_BYTES: u64 = 64 * 1024;

/// Converts the main session log into immutable parts plus a staged tail.
pub struct Converter<'a> {
    cfg: &'a SyncConfig,
}

impl<'a> Converter<'a> {
    pub fn new(cfg: &'a SyncConfig) -> Self {
        Self { cfg }
    }

    /// Run one conversion pass. Returns the paths of parts finalized (and
    /// actually written) in this pass, in order.
    pub fn convert(&self, since_ts: Option<f64>) -> Result<Vec<PathBuf>> {
        let conv_dir = self.cfg.conversations_dir();
        std::fs::create_dir_all(&conv_dir)?;

        let Some((session_id, session_path)) = registry::resolve_main_session(&self.cfg.sessions_dir)
        else {
            tracing::debug!("no main session resolved; nothing to convert");
            return Ok(Vec::new());
        };

        let meta = match std::fs::metadata(&session_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let state_path = self.cfg.state_path();
        let mut state = SyncState::load(&state_path);
        let cursor = state.cursor(&session_id).cloned().unwrap_or_default();
        let lang_prefix = self.cfg.lang_prefix();
        let now = now_ts();

        let idle_due = cursor.tail_part_messages > 0
            && cursor
                .tail_last_activity_ts
                .is_some_and(|t| now - t >= self.cfg.flush_idle.as_secs_f64());

        // Fast exit when the caller already knows nothing changed. Coarse
        // mtime granularity is covered by the size comparison.
        if let Some(ts) = since_ts {
            if mtime_ts(&meta) <= ts
                && meta.len() <= cursor.last_offset
                && !idle_due
                && !self.cfg.force_flush
            {
                return Ok(Vec::new());
            }
        }

        if self.cfg.max_messages <= 0 {
            return self.convert_single(&conv_dir, &session_id, &session_path, &meta, &mut state, &state_path, lang_prefix.as_deref());
        }

        let max = self.cfg.max_messages as usize;
        let writer = PartWriter::new(&conv_dir, &session_id, lang_prefix.as_deref());

        let has_history =
            cursor.last_offset > 0 || cursor.part_count > 0 || cursor.tail_part_messages > 0;

        let mut staged: Vec<Message> = Vec::new();
        let mut rebuild_reason: Option<&str> = None;

        if has_history {
            rebuild_reason = self.fast_path_violation(&cursor, &session_path, &meta, lang_prefix.as_deref());
            if rebuild_reason.is_none() {
                match writer.read_tail() {
                    Some(tail) => staged = tail,
                    None if cursor.tail_part_messages > 0 => {
                        rebuild_reason = Some("staged tail missing");
                    }
                    None => {}
                }
            }
        }

        let append_only = has_history && rebuild_reason.is_none();
        if let Some(reason) = rebuild_reason {
            tracing::info!(
                session = %session_id,
                reason,
                "append-only fast path rejected; rebuilding from offset 0"
            );
            staged.clear();
        }

        let (start_offset, mut part_index) = if append_only {
            (cursor.last_offset, cursor.part_count)
        } else {
            (0, 0)
        };
        let old_part_count = cursor.part_count;

        let tail_result = tailer::read_entries(&session_path, start_offset)?;
        let new_messages: Vec<Message> = tail_result
            .entries
            .iter()
            .filter_map(filter::filter_entry)
            .collect();
        let tail_grew = !new_messages.is_empty() || !append_only;

        let mut pending_tail = staged;
        pending_tail.extend(new_messages);

        let mut written: Vec<PathBuf> = Vec::new();
        while pending_tail.len() >= max {
            let chunk: Vec<Message> = pending_tail.drain(..max).collect();
            if let Some(path) = writer.write_part(part_index, &chunk)? {
                written.push(path);
            }
            part_index += 1;
        }

        // Remainder finalization: forced, or the idle window elapsed with no
        // growth this pass.
        let flush_remainder =
            !pending_tail.is_empty() && (self.cfg.force_flush || (idle_due && !tail_grew));
        if flush_remainder {
            let chunk: Vec<Message> = std::mem::take(&mut pending_tail);
            if let Some(path) = writer.write_part(part_index, &chunk)? {
                written.push(path);
            }
            part_index += 1;
        }

        writer.write_tail(&pending_tail)?;

        // A rebuild that shrank the part list removes the surplus.
        if part_index < old_part_count {
            let removed = writer.delete_parts_from(part_index, old_part_count)?;
            if !removed.is_empty() {
                tracing::info!(
                    session = %session_id,
                    removed = removed.len(),
                    "removed stale parts beyond rebuilt count"
                );
            }
        }

        let new_offset = tail_result.new_offset;
        let tail_count = pending_tail.len() as u32;
        let tail_activity = if tail_count == 0 {
            None
        } else if tail_grew || cursor.tail_last_activity_ts.is_none() {
            Some(now)
        } else {
            cursor.tail_last_activity_ts
        };

        let updated = SessionCursor {
            file_path: session_path.to_string_lossy().into_owned(),
            device: meta.dev(),
            inode: meta.ino(),
            last_offset: new_offset,
            last_size: meta.len(),
            last_mtime: mtime_ts(&meta),
            part_count: part_index,
            tail_part_messages: tail_count,
            tail_last_activity_ts: tail_activity,
            lang_prefix: lang_prefix.clone(),
            head_sha256: sample_sha256(&session_path, 0, new_offset.min(SAMPLE_BYTES)),
            tail_sha256: sample_sha256(
                &session_path,
                new_offset.saturating_sub(SAMPLE_BYTES),
                new_offset,
            ),
        };
        *state.cursor_mut(&session_id) = updated;
        state.save(&state_path)?;

        Ok(written)
    }

    /// Degenerate mode (`max_messages <= 0`): one `<sid>.json` mirroring the
    /// full filtered message list; no tail file.
    #[allow(clippy::too_many_arguments)]
    fn convert_single(
        &self,
        conv_dir: &Path,
        session_id: &str,
        session_path: &Path,
        meta: &std::fs::Metadata,
        state: &mut SyncState,
        state_path: &Path,
        lang_prefix: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        let writer = PartWriter::new(conv_dir, session_id, lang_prefix);
        let tail_result = tailer::read_entries(session_path, 0)?;
        let messages: Vec<Message> = tail_result
            .entries
            .iter()
            .filter_map(filter::filter_entry)
            .collect();

        let mut written = Vec::new();
        if !messages.is_empty() {
            if let Some(path) = writer.write_single(&messages)? {
                written.push(path);
            }
        }

        *state.cursor_mut(session_id) = SessionCursor {
            file_path: session_path.to_string_lossy().into_owned(),
            device: meta.dev(),
            inode: meta.ino(),
            last_offset: tail_result.new_offset,
            last_size: meta.len(),
            last_mtime: mtime_ts(meta),
            part_count: 0,
            tail_part_messages: 0,
            tail_last_activity_ts: None,
            lang_prefix: lang_prefix.map(str::to_string),
            head_sha256: None,
            tail_sha256: None,
        };
        state.save(state_path)?;

        Ok(written)
    }

    /// Returns the first violated fast-path condition, or None when the
    /// append-only path is safe.
    fn fast_path_violation(
        &self,
        cursor: &SessionCursor,
        session_path: &Path,
        meta: &std::fs::Metadata,
        lang_prefix: Option<&str>,
    ) -> Option<&'static str> {
        if meta.dev() != cursor.device || meta.ino() != cursor.inode {
            return Some("file identity changed");
        }
        if meta.len() < cursor.last_offset {
            return Some("file shrank below cursor");
        }
        if lang_prefix != cursor.lang_prefix.as_deref() {
            return Some("language prefix changed");
        }
        if cursor.last_offset > 0 {
            let head = sample_sha256(session_path, 0, cursor.last_offset.min(SAMPLE_BYTES));
            if head.is_none() || head != cursor.head_sha256 {
                return Some("head sample hash mismatch");
            }
            let tail = sample_sha256(
                session_path,
                cursor.last_offset.saturating_sub(SAMPLE_BYTES),
                cursor.last_offset,
            );
            if tail.is_none() || tail != cursor.tail_sha256 {
                return Some("tail sample hash mismatch");
            }
        }
        None
    }
}

/// SHA-256 over `[start, end)` of the file; None when the range is empty or
/// unreadable (the caller treats unreadable as a mismatch).
fn sample_sha256(path: &Path, start: u64, end: u64) -> Option<String> {
    if end <= start {
        return None;
    }
    let mut file = std::fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).ok()?;
    Some(sha256_hex(&buf))
}
