// src/convert/tailer.rs
// Byte-offset resumable JSONL reader tolerant of partial trailing writes.

use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// Result of tailing a session log from a byte offset.
#[derive(Debug, Default)]
pub struct TailResult {
    /// Parsed entries, in file order.
    pub entries: Vec<serde_json::Value>,
    /// Offset just past the last line consumed. Never points inside a
    /// partial line.
    pub new_offset: u64,
    /// A trailing line without a newline failed to parse; the next sync
    /// retries from `new_offset`.
    pub partial_tail: bool,
}

/// Read complete JSONL entries starting at `start_offset`.
///
/// Advancement rules:
/// - zero bytes read: stop;
/// - line without trailing newline that fails to parse: stop, do not
///   advance past it;
/// - line that parses (with or without newline): advance and emit;
/// - complete line that fails to parse: advance, skip the entry.
pub fn read_entries(path: &Path, start_offset: u64) -> io::Result<TailResult> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start_offset))?;
    let mut reader = BufReader::new(file);

    let mut result = TailResult {
        new_offset: start_offset,
        ..Default::default()
    };
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }

        let has_newline = buf.ends_with(b"\n");
        let line = trim_line(&buf);

        if line.is_empty() {
            // Blank line; a bare newline is still a complete line.
            if has_newline {
                result.new_offset += n as u64;
                continue;
            }
            break;
        }

        match serde_json::from_slice::<serde_json::Value>(line) {
            Ok(value) => {
                // A record without a trailing newline that still parses is a
                // writer that flushed without the terminator; consume it.
                result.new_offset += n as u64;
                result.entries.push(value);
            }
            Err(_) if has_newline => {
                result.new_offset += n as u64;
            }
            Err(_) => {
                result.partial_tail = true;
                break;
            }
        }
    }

    Ok(result)
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut line = buf;
    while let Some((last, rest)) = line.split_last() {
        if *last == b'\n' || *last == b'\r' || *last == b' ' || *last == b'\t' {
            line = rest;
        } else {
            break;
        }
    }
    while let Some((first, rest)) = line.split_first() {
        if *first == b' ' || *first == b'\t' {
            line = rest;
        } else {
            break;
        }
    }
    line
}
