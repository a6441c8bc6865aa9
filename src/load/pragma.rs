// src/load/pragma.rs
//
// Connection directives applied once, before the first batch.

use rusqlite::Connection;
use tracing::info;

use crate::config::Durability;
use crate::error::{EtlError, Result};

/// `journal_mode=WAL` keeps the file consistent under both modes. `Relaxed`
/// adds `synchronous=OFF`, so the last committed transactions can be lost to
/// an OS crash or power cut but never corrupt the database; `Strict` uses
/// `synchronous=FULL` and survives both at the cost of an fsync per commit.
pub fn apply(conn: &Connection, durability: Durability, cache_size_kib: u64) -> Result<()> {
    let journal: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    let synchronous = match durability {
        Durability::Strict => "FULL",
        Durability::Relaxed => "OFF",
    };
    conn.pragma_update(None, "synchronous", synchronous)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    let cache_kib = i64::try_from(cache_size_kib)
        .map_err(|_| EtlError::config(format!("cache_size_kib {cache_size_kib} is out of range")))?;
    // Negative means KiB rather than pages.
    conn.pragma_update(None, "cache_size", -cache_kib)?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;

    info!(journal = %journal, synchronous, cache_size_kib, "pragmas applied");
    Ok(())
}
