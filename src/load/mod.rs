// src/load/mod.rs
//
// The batched loader: one SQLite connection, one writer transaction per
// insert batch, indexes and statistics only after everything is committed.

pub mod pragma;
pub mod retry;

use rusqlite::{
    params, params_from_iter,
    types::{ToSql, ToSqlOutput},
    Connection, Transaction, TransactionBehavior,
};
use serde::Serialize;
use std::{fs, path::Path, time::Duration};
use tracing::{debug, info, instrument, warn};

use crate::config::{Durability, EtlConfig, RerunPolicy, RetryConfig};
use crate::error::{EtlError, Result};
use crate::history::History;
use crate::process::{Block, Row};
use crate::schema::{TableMapping, Value};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// The subset of [`EtlConfig`] the loader acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub durability: Durability,
    pub rerun: RerunPolicy,
    pub cache_size_kib: u64,
    pub busy_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl From<&EtlConfig> for LoadOptions {
    fn from(c: &EtlConfig) -> Self {
        Self {
            batch_size: c.batch_size,
            durability: c.durability,
            rerun: c.rerun,
            cache_size_kib: c.cache_size_kib,
            busy_timeout_ms: c.busy_timeout_ms,
            retry: c.retry,
        }
    }
}

/// Rows written for one block (or one file, once summed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub inserted: u64,
    /// Skipped by `INSERT OR IGNORE` because the key already existed.
    pub ignored: u64,
    pub batches: u64,
}

impl LoadStats {
    pub fn add(&mut self, other: LoadStats) {
        self.inserted += other.inserted;
        self.ignored += other.ignored;
        self.batches += other.batches;
    }
}

pub struct Loader {
    conn: Connection,
    options: LoadOptions,
}

impl Loader {
    /// Open (or create) the database at `path`. No pragma is applied yet.
    pub fn open(path: &Path, options: LoadOptions) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        Ok(Self { conn, options })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn history(&self) -> Result<History<'_>> {
        History::open(&self.conn)
    }

    /// Apply the pre-load directives and make sure the history table exists.
    pub fn configure(&mut self) -> Result<()> {
        let (durability, cache) = (self.options.durability, self.options.cache_size_kib);
        pragma::apply(&self.conn, durability, cache)?;
        History::open(&self.conn)?;
        Ok(())
    }

    /// Get `mapping`'s table ready for its first file: create it if absent,
    /// drop `idx_` indexes left by an earlier run, then apply the re-run
    /// policy (truncate empties rows and history; upsert checks the key).
    #[instrument(level = "debug", skip(self, mapping), fields(table = %mapping.table))]
    pub fn prepare_table(&mut self, mapping: &TableMapping) -> Result<()> {
        let upsert = self.options.rerun == RerunPolicy::Upsert;
        let retry = self.options.retry;
        let ddl = mapping.create_table_sql(upsert);
        retry::with_retry(retry, "creating table", || self.conn.execute_batch(&ddl))?;

        self.check_columns(mapping)?;
        if upsert {
            self.check_primary_key(mapping)?;
        }

        for index in self.indexes_of(&mapping.table)? {
            debug!(index = %index, "dropping index before load");
            retry::with_retry(retry, "dropping index", || {
                self.conn.execute_batch(&format!("DROP INDEX IF EXISTS {index}"))
            })?;
        }

        if !upsert {
            // Rows and their history go in one transaction.
            let conn = &self.conn;
            let tx = retry::with_retry(retry, "truncating table", move || {
                Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            })?;
            let removed = tx.execute(&format!("DELETE FROM {}", mapping.table), [])?;
            History::open(&tx)?.clear(&mapping.table)?;
            tx.commit()?;
            if removed > 0 {
                info!(table = %mapping.table, rows = removed, "truncated previous load");
            }
        }
        Ok(())
    }

    /// Insert one block, committing every `batch_size` rows.
    pub fn load_block(&mut self, mapping: &TableMapping, block: &Block) -> Result<LoadStats> {
        let mut stats = LoadStats::default();
        for batch in block.rows.chunks(self.options.batch_size.max(1)) {
            let inserted = self.insert_batch(mapping, batch)?;
            stats.inserted += inserted;
            stats.ignored += batch.len() as u64 - inserted;
            stats.batches += 1;
        }
        Ok(stats)
    }

    /// One transaction, one prepared statement, every row of the batch. A
    /// failing row rolls the whole batch back.
    fn insert_batch(&mut self, mapping: &TableMapping, rows: &[Row]) -> Result<u64> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(0);
        };
        if let Some(bad) = rows.iter().find(|r| r.values.len() != mapping.arity()) {
            return Err(EtlError::State(format!(
                "row from line {} has {} values, table `{}` has {} columns",
                bad.line,
                bad.values.len(),
                mapping.table,
                mapping.arity()
            )));
        }

        let sql = mapping.insert_sql(self.options.rerun == RerunPolicy::Upsert);
        let retry = self.options.retry;
        let result = retry::with_retry(retry, "inserting batch", || {
            let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in rows {
                    inserted += stmt.execute(params_from_iter(row.values.iter()))? as u64;
                }
            }
            tx.commit()?;
            Ok(inserted)
        });

        result.map_err(|e| match e {
            EtlError::Store(ref err) if retry::is_constraint(err) => {
                warn!(
                    table = %mapping.table,
                    first_line = first.line,
                    last_line = last.line,
                    error = %err,
                    "batch rolled back"
                );
                EtlError::Constraint {
                    table: mapping.table.clone(),
                    first_line: first.line,
                    last_line: last.line,
                    reason: err.to_string(),
                }
            }
            other => other,
        })
    }

    /// Build every configured index, then refresh planner statistics.
    /// Returns how many indexes were created.
    #[instrument(level = "info", skip_all)]
    pub fn finalize(&mut self, mappings: &[TableMapping]) -> Result<usize> {
        let retry = self.options.retry;
        let mut created = 0;
        for mapping in mappings {
            for column in &mapping.indexes {
                let sql = mapping.create_index_sql(column);
                retry::with_retry(retry, "creating index", || self.conn.execute_batch(&sql))?;
                debug!(index = %mapping.index_name(column), "index created");
                created += 1;
            }
        }
        retry::with_retry(retry, "analyzing", || self.conn.execute_batch("ANALYZE"))?;
        info!(indexes = created, "indexes built and statistics refreshed");
        Ok(created)
    }

    /// `idx_` indexes currently defined on `table`.
    pub fn indexes_of(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'index' AND tbl_name = ?1 AND name LIKE 'idx\\_%' ESCAPE '\\'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![table], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn row_count(&self, table: &str) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// `(name, pk position)` of every column of `table`, in table order.
    fn table_info(&self, table: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let cols = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    /// A table left by an earlier run with another selection would make the
    /// INSERT fail on the first batch; refuse it up front.
    fn check_columns(&self, mapping: &TableMapping) -> Result<()> {
        let existing: Vec<String> = self
            .table_info(&mapping.table)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let expected: Vec<&str> = mapping.column_names().collect();
        if existing != expected {
            return Err(EtlError::config(format!(
                "table `{}` already exists with columns {existing:?}, expected {expected:?}; drop it or change the selection",
                mapping.table
            )));
        }
        Ok(())
    }

    /// `INSERT OR IGNORE` only deduplicates against a real primary key.
    fn check_primary_key(&self, mapping: &TableMapping) -> Result<()> {
        let mut pk: Vec<(i64, String)> = self
            .table_info(&mapping.table)?
            .into_iter()
            .filter(|(_, pos)| *pos > 0)
            .map(|(name, pos)| (pos, name))
            .collect();
        pk.sort();
        let pk: Vec<String> = pk.into_iter().map(|(_, name)| name).collect();
        if pk != mapping.key {
            return Err(EtlError::config(format!(
                "table `{}` has primary key {pk:?} but upsert needs {:?}; it was probably created by a truncate run, drop it first",
                mapping.table, mapping.key
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, ColumnType, TableDef};
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn mapping() -> TableMapping {
        TableMapping::new(&TableDef {
            name: "cnaes".into(),
            layout: vec!["id_cnae".into(), "descricao_cnae".into()],
            columns: vec![
                ColumnSpec::new("id_cnae", ColumnType::Integer).required(),
                ColumnSpec::new("descricao_cnae", ColumnType::Text),
            ],
            key: vec!["id_cnae".into()],
            indexes: vec!["descricao_cnae".into()],
            has_headers: false,
            member_suffix: None,
        })
        .unwrap()
    }

    fn block(ids: &[i64]) -> Block {
        Block {
            index: 0,
            rows: ids
                .iter()
                .enumerate()
                .map(|(i, id)| Row {
                    line: i as u64 + 1,
                    values: vec![Value::Integer(*id), Value::Text(format!("cnae {id}"))],
                })
                .collect(),
        }
    }

    fn loader(dir: &TempDir, rerun: RerunPolicy, batch_size: usize) -> Result<Loader> {
        let options = LoadOptions {
            batch_size,
            rerun,
            ..LoadOptions::from(&EtlConfig::default())
        };
        let mut loader = Loader::open(&dir.path().join("db/cnpj.db"), options)?;
        loader.configure()?;
        Ok(loader)
    }

    #[test]
    fn splits_blocks_into_batches() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let mut l = loader(&dir, RerunPolicy::Truncate, 2)?;
        l.prepare_table(&m)?;
        let stats = l.load_block(&m, &block(&[1, 2, 3, 4, 5]))?;
        assert_eq!(stats, LoadStats { inserted: 5, ignored: 0, batches: 3 });
        assert_eq!(l.row_count("cnaes")?, 5);
        Ok(())
    }

    #[test]
    fn constraint_violation_rolls_back_the_batch() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let mut l = loader(&dir, RerunPolicy::Truncate, 10)?;
        l.prepare_table(&m)?;
        l.connection()
            .execute_batch("CREATE UNIQUE INDEX uq_cnaes ON cnaes(id_cnae)")?;

        l.load_block(&m, &block(&[1, 2]))?;
        let err = l.load_block(&m, &block(&[3, 1, 4])).unwrap_err();
        match err {
            EtlError::Constraint { table, first_line, last_line, .. } => {
                assert_eq!(table, "cnaes");
                assert_eq!((first_line, last_line), (1, 3));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Neither 3 nor 4 survived the rollback.
        assert_eq!(l.row_count("cnaes")?, 2);
        Ok(())
    }

    #[test]
    fn writer_lock_held_elsewhere_exhausts_retries_then_recovers() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let options = LoadOptions {
            batch_size: 10,
            busy_timeout_ms: 1,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
            },
            ..LoadOptions::from(&EtlConfig::default())
        };
        let mut l = Loader::open(&dir.path().join("db/cnpj.db"), options)?;
        l.configure()?;
        l.prepare_table(&m)?;

        let other = Connection::open(dir.path().join("db/cnpj.db"))?;
        other.execute_batch("BEGIN IMMEDIATE")?;

        let err = l.load_block(&m, &block(&[1, 2])).unwrap_err();
        assert!(
            matches!(err, EtlError::StoreBusy { attempts: 3, .. }),
            "unexpected error {err:?}"
        );

        other.execute_batch("COMMIT")?;
        let stats = l.load_block(&m, &block(&[1, 2]))?;
        assert_eq!(stats.inserted, 2);
        assert_eq!(l.row_count("cnaes")?, 2);
        Ok(())
    }

    #[test]
    fn upsert_ignores_existing_keys() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let mut l = loader(&dir, RerunPolicy::Upsert, 10)?;
        l.prepare_table(&m)?;
        l.load_block(&m, &block(&[1, 2]))?;
        let stats = l.load_block(&m, &block(&[2, 3]))?;
        assert_eq!((stats.inserted, stats.ignored), (1, 1));
        assert_eq!(l.row_count("cnaes")?, 3);
        Ok(())
    }

    #[test]
    fn upsert_refuses_a_table_without_primary_key() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        loader(&dir, RerunPolicy::Truncate, 10)?.prepare_table(&m)?;
        let err = loader(&dir, RerunPolicy::Upsert, 10)?.prepare_table(&m).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        Ok(())
    }

    #[test]
    fn prepare_drops_indexes_and_finalize_rebuilds_them() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let mut l = loader(&dir, RerunPolicy::Truncate, 10)?;
        l.prepare_table(&m)?;
        l.load_block(&m, &block(&[1]))?;
        assert_eq!(l.finalize(std::slice::from_ref(&m))?, 1);
        assert_eq!(l.indexes_of("cnaes")?, ["idx_cnaes_descricao_cnae"]);

        let mut again = loader(&dir, RerunPolicy::Truncate, 10)?;
        again.prepare_table(&m)?;
        assert!(again.indexes_of("cnaes")?.is_empty());
        assert_eq!(again.row_count("cnaes")?, 0);
        Ok(())
    }

    #[test]
    fn truncate_clears_history() -> Result<()> {
        let dir = tempdir()?;
        let m = mapping();
        let mut l = loader(&dir, RerunPolicy::Truncate, 10)?;
        l.history()?
            .record("cnaes", "a.zip", crate::history::State::Loaded, 1, 1)?;
        l.prepare_table(&m)?;
        assert!(l.history()?.entries()?.is_empty());
        Ok(())
    }
}
