use anyhow::{Context, Result};
use cnpjload::history::{History, HISTORY_TABLE};
use rusqlite::{Connection, OpenFlags};
use std::{env, path::Path, process::exit};

fn main() {
    // Expect exactly one CLI argument: path to a SQLite database.
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <DATABASE>", args[0]);
        exit(1);
    }
    if let Err(e) = inspect_db(Path::new(&args[1])) {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

/// Print pragmas, every table with its row count and columns, its indexes,
/// and the load history.
fn inspect_db(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("opening {}", path.display()))?;
    let size = std::fs::metadata(path)?.len();

    let journal: String = conn.pragma_query_value(None, "journal_mode", |r| r.get(0))?;
    let page_count: i64 = conn.pragma_query_value(None, "page_count", |r| r.get(0))?;

    println!("=== SQLite database: {} ===", path.display());
    println!("Journal mode:      {}", journal);
    println!("Pages:             {}", page_count);
    println!("File-size on disk: {} bytes", size);
    println!();

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for table in &tables {
        print_table(&conn, table)?;
    }

    if tables.iter().any(|t| t == HISTORY_TABLE) {
        println!("=== Load history ===");
        let history = History::existing(&conn);
        for e in history.entries()? {
            println!(
                "- {:<18} {:<8} records {:>10} inserted {:>10} at {}  {}",
                e.table,
                e.state.as_str(),
                e.records,
                e.inserted,
                e.updated_at.format("%Y-%m-%d %H:%M:%S"),
                e.file
            );
        }
    }
    Ok(())
}

fn print_table(conn: &Connection, table: &str) -> Result<()> {
    let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0))?;
    println!("--- {} ({} rows) ---", table, rows);

    let mut cols = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let columns = cols
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (name, ty, pk) in columns {
        let key = if pk > 0 { "  (key)" } else { "" };
        println!("  - {:<30} | {}{}", name, ty, key);
    }

    let mut idx = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 ORDER BY name",
    )?;
    let indexes = idx
        .query_map([table], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if indexes.is_empty() {
        println!("  Indexes: <none>");
    } else {
        println!("  Indexes: {}", indexes.join(", "));
    }
    println!();
    Ok(())
}
