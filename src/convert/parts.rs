// src/convert/parts.rs
// Immutable part files and the staged tail.

use super::filter::{Message, Role};
use crate::error::Result;
use crate::state::atomic;
use crate::utils::sha256_hex;
use std::path::{Path, PathBuf};

/// Writes part/tail files for one session into the conversations dir.
pub struct PartWriter<'a> {
    conv_dir: &'a Path,
    session_id: &'a str,
    lang_prefix: Option<&'a str>,
}

impl<'a> PartWriter<'a> {
    pub fn new(conv_dir: &'a Path, session_id: &'a str, lang_prefix: Option<&'a str>) -> Self {
        Self {
            conv_dir,
            session_id,
            lang_prefix,
        }
    }

    /// `<sid>.partNNN.json`
    pub fn part_path(&self, index: u32) -> PathBuf {
        self.conv_dir
            .join(format!("{}.part{:03}.json", self.session_id, index))
    }

    /// `<sid>.tail.tmp.json` — staged, invisible to the ingest driver.
    pub fn tail_path(&self) -> PathBuf {
        self.conv_dir
            .join(format!("{}.tail.tmp.json", self.session_id))
    }

    /// `<sid>.json` — degenerate single-file overwrite mode.
    pub fn single_path(&self) -> PathBuf {
        self.conv_dir.join(format!("{}.json", self.session_id))
    }

    /// Render the payload: optional system prefix, then the messages,
    /// pretty-printed UTF-8 with non-ASCII preserved.
    fn render(&self, messages: &[Message]) -> Result<Vec<u8>> {
        let mut payload: Vec<&Message> = Vec::with_capacity(messages.len() + 1);
        let prefix_message = self
            .lang_prefix
            .map(|p| Message::new(Role::System, p.to_string()));
        if let Some(ref m) = prefix_message {
            payload.push(m);
        }
        payload.extend(messages.iter());
        Ok(serde_json::to_vec_pretty(&payload)?)
    }

    /// Write a finalized part at `index`. Returns the path when bytes were
    /// actually written; byte-identical rewrites are suppressed by SHA-256
    /// comparison so re-conversions stay idempotent and spawn no spurious
    /// ingest events.
    pub fn write_part(&self, index: u32, messages: &[Message]) -> Result<Option<PathBuf>> {
        let path = self.part_path(index);
        self.write_if_changed(&path, messages)
    }

    /// Write (or remove, when empty) the staged tail.
    pub fn write_tail(&self, messages: &[Message]) -> Result<()> {
        let path = self.tail_path();
        if messages.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        self.write_if_changed(&path, messages)?;
        Ok(())
    }

    /// Degenerate mode: mirror the full filtered list into `<sid>.json`.
    pub fn write_single(&self, messages: &[Message]) -> Result<Option<PathBuf>> {
        let path = self.single_path();
        self.write_if_changed(&path, messages)
    }

    /// Recover staged messages from the tail file. The system prefix is
    /// stripped; it is re-applied on render. `None` means no usable tail.
    pub fn read_tail(&self) -> Option<Vec<Message>> {
        let bytes = std::fs::read(self.tail_path()).ok()?;
        let messages: Vec<Message> = serde_json::from_slice(&bytes).ok()?;
        Some(
            messages
                .into_iter()
                .filter(|m| m.role != Role::System)
                .collect(),
        )
    }

    /// Delete finalized parts at indices `>= from`, after a rebuild emitted
    /// fewer parts than existed.
    pub fn delete_parts_from(&self, from: u32, old_count: u32) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for index in from..old_count {
            let path = self.part_path(index);
            match std::fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn write_if_changed(&self, path: &Path, messages: &[Message]) -> Result<Option<PathBuf>> {
        let bytes = self.render(messages)?;
        if let Ok(existing) = std::fs::read(path) {
            if sha256_hex(&existing) == sha256_hex(&bytes) {
                return Ok(None);
            }
        }
        atomic::write_atomic(path, &bytes)?;
        Ok(Some(path.to_path_buf()))
    }
}
