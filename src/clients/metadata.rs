// src/clients/metadata.rs
// Read-only existence probe against the memory service's metadata store.

use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};

const RESOURCES_TABLE: &str = "memu_resources";

/// Read-only view of `<data_dir>/memu.db`.
///
/// Any failure — missing file, missing table, schema drift, query error —
/// degrades to "does not exist" so the pipeline re-ingests rather than
/// silently dropping a resource.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    /// Whether a resource URL was already ingested for this user.
    pub fn resource_exists(&self, resource_url: &str, user_id: &str) -> bool {
        self.try_resource_exists(resource_url, user_id)
            .unwrap_or(false)
    }

    fn try_resource_exists(&self, resource_url: &str, user_id: &str) -> Option<bool> {
        if !self.db_path.exists() {
            return Some(false);
        }
        let conn =
            Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY).ok()?;

        if !table_exists(&conn, RESOURCES_TABLE)? {
            return Some(false);
        }

        let exists = if has_column(&conn, RESOURCES_TABLE, "user_id")? {
            conn.query_row(
                &format!("SELECT 1 FROM {RESOURCES_TABLE} WHERE url = ?1 AND user_id = ?2 LIMIT 1"),
                rusqlite::params![resource_url, user_id],
                |_| Ok(()),
            )
        } else {
            conn.query_row(
                &format!("SELECT 1 FROM {RESOURCES_TABLE} WHERE url = ?1 LIMIT 1"),
                rusqlite::params![resource_url],
                |_| Ok(()),
            )
        };

        match exists {
            Ok(()) => Some(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Some(false),
            Err(e) => {
                tracing::debug!("resource existence query failed: {}", e);
                None
            }
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> Option<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        rusqlite::params![table],
        |_| Ok(()),
    )
    .map(|_| true)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(false),
        other => Err(other),
    })
    .ok()
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Option<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})")).ok()?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .ok()?
        .filter_map(|r| r.ok());
    Some(names.into_iter().any(|name| name == column))
}
