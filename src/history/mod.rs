// src/history/mod.rs

pub mod state;

pub use state::State;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

use crate::error::{EtlError, Result};

pub const HISTORY_TABLE: &str = "etl_history";

/// One row of the load history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub table: String,
    pub file: String,
    pub state: State,
    pub records: u64,
    pub inserted: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-file load history kept inside the target database, so it is committed
/// and cleared together with the rows it describes.
pub struct History<'c> {
    conn: &'c Connection,
}

impl<'c> History<'c> {
    /// Wrap `conn`, creating the history table if needed.
    pub fn open(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
                table_name TEXT NOT NULL,
                file_name  TEXT NOT NULL,
                state      TEXT NOT NULL,
                records    INTEGER NOT NULL DEFAULT 0,
                inserted   INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, file_name)
            )"
        ))?;
        Ok(Self { conn })
    }

    /// Wrap `conn` without creating anything, for read-only connections
    /// where the table is known to exist.
    pub fn existing(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Upsert the entry for (`table`, `file`), stamped with the current UTC time.
    pub fn record(
        &self,
        table: &str,
        file: &str,
        state: State,
        records: u64,
        inserted: u64,
    ) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {HISTORY_TABLE} (table_name, file_name, state, records, inserted, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(table_name, file_name) DO UPDATE SET
                    state = excluded.state,
                    records = excluded.records,
                    inserted = excluded.inserted,
                    updated_at = excluded.updated_at"
            ),
            params![
                table,
                file,
                state.as_str(),
                records as i64,
                inserted as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn is_loaded(&self, table: &str, file: &str) -> Result<bool> {
        let state: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT state FROM {HISTORY_TABLE} WHERE table_name = ?1 AND file_name = ?2"),
                params![table, file],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref().and_then(State::from_str) == Some(State::Loaded))
    }

    /// Forget every file of `table`; returns how many entries were removed.
    pub fn clear(&self, table: &str) -> Result<usize> {
        Ok(self.conn.execute(
            &format!("DELETE FROM {HISTORY_TABLE} WHERE table_name = ?1"),
            params![table],
        )?)
    }

    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT table_name, file_name, state, records, inserted, updated_at
             FROM {HISTORY_TABLE} ORDER BY table_name, file_name"
        ))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(table, file, state, records, inserted, updated_at)| {
                let state = State::from_str(&state).ok_or_else(|| {
                    EtlError::State(format!("unknown history state `{state}` for {file}"))
                })?;
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| EtlError::State(format!("bad history timestamp for {file}: {e}")))?
                    .with_timezone(&Utc);
                Ok(HistoryEntry {
                    table,
                    file,
                    state,
                    records: records as u64,
                    inserted: inserted as u64,
                    updated_at,
                })
            })
            .collect()
    }
}

/// Stable identity of an input file across runs: its canonical path when it
/// can be resolved, the path as given otherwise.
pub fn file_key(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
