// src/config.rs
//
// Everything a run needs, passed to the pipeline at construction time.
// Validation happens here, before any input file or database is touched.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::error::{EtlError, Result};
use crate::schema::{layouts, ColumnSpec, TableDef, TableMapping};

pub const DEFAULT_BLOCK_SIZE: usize = 50_000;
pub const DEFAULT_BATCH_SIZE: usize = 5_000;
/// 256 MiB page cache.
pub const DEFAULT_CACHE_SIZE_KIB: u64 = 256 * 1024;
/// 1 TiB; the pragma takes the size as a negative `i64`.
pub const MAX_CACHE_SIZE_KIB: u64 = 1 << 30;

/// Durability/throughput trade-off applied before the first batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// `synchronous = FULL`: every commit survives power loss.
    Strict,
    /// `synchronous = OFF`: the last commits may be lost on OS crash or power
    /// loss; the database file itself stays consistent under WAL.
    Relaxed,
}

/// How a re-run avoids double-counting rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RerunPolicy {
    /// Empty each target table before its first file is loaded.
    Truncate,
    /// Primary key on the table key plus `INSERT OR IGNORE`; files already
    /// recorded as loaded are skipped.
    Upsert,
}

/// What to do with a field (and its row) that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldAction {
    /// Discard the row, count it and log file + line.
    Drop,
    /// Abort the run.
    Fail,
    /// Store NULL in the field and keep the row.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Required field empty or absent.
    pub missing_required: FieldAction,
    /// Required field present but not coercible to its type.
    pub invalid_required: FieldAction,
    /// Optional field present but not coercible to its type.
    pub invalid_optional: FieldAction,
    /// Record whose field count differs from the layout.
    pub malformed_row: FieldAction,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            missing_required: FieldAction::Drop,
            invalid_required: FieldAction::Fail,
            invalid_optional: FieldAction::Null,
            malformed_row: FieldAction::Drop,
        }
    }
}

impl ValidationPolicy {
    fn validate(&self) -> Result<()> {
        let row_level = [
            ("missing_required", self.missing_required),
            ("invalid_required", self.invalid_required),
            ("malformed_row", self.malformed_row),
        ];
        for (name, action) in row_level {
            if action == FieldAction::Null {
                return Err(EtlError::config(format!(
                    "validation.{name} cannot be `null`; use `drop` or `fail`"
                )));
            }
        }
        Ok(())
    }
}

/// Bounded exponential backoff for busy/locked database errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
        }
    }
}

/// One input: a table name and a path or glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub table: String,
    pub path: String,
}

impl InputSpec {
    pub fn new(table: &str, path: &str) -> Self {
        Self {
            table: table.to_string(),
            path: path.to_string(),
        }
    }

    /// Parse the CLI form `table=path-or-glob`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((table, path)) if !table.is_empty() && !path.is_empty() => {
                Ok(Self::new(table.trim(), path.trim()))
            }
            _ => Err(EtlError::config(format!(
                "input `{s}` must look like `table=path`"
            ))),
        }
    }
}

/// Per-table override. For a built-in table every field is optional and
/// replaces the built-in value; a custom table needs `layout` and `columns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub layout: Option<Vec<String>>,
    pub columns: Option<Vec<ColumnSpec>>,
    /// Keep only these columns of the (built-in or overridden) selection.
    pub select: Option<Vec<String>>,
    pub key: Option<Vec<String>>,
    pub indexes: Option<Vec<String>>,
    pub has_headers: Option<bool>,
    pub member_suffix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub database: PathBuf,
    pub block_size: usize,
    pub batch_size: usize,
    pub durability: Durability,
    pub rerun: RerunPolicy,
    /// Decode the next block on a second thread while the current one is inserted.
    pub prefetch: bool,
    pub cache_size_kib: u64,
    pub busy_timeout_ms: u64,
    pub retry: RetryConfig,
    pub validation: ValidationPolicy,
    pub tables: BTreeMap<String, TableConfig>,
    pub inputs: Vec<InputSpec>,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/cnpj.db"),
            block_size: DEFAULT_BLOCK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            durability: Durability::Relaxed,
            rerun: RerunPolicy::Truncate,
            prefetch: true,
            cache_size_kib: DEFAULT_CACHE_SIZE_KIB,
            busy_timeout_ms: 1_000,
            retry: RetryConfig::default(),
            validation: ValidationPolicy::default(),
            tables: BTreeMap::new(),
            inputs: Vec::new(),
        }
    }
}

impl EtlConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EtlError::config(e.to_string()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            EtlError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check every option and resolve one mapping per distinct input table,
    /// in first-appearance order.
    pub fn validate(&self) -> Result<Vec<TableMapping>> {
        if self.block_size == 0 {
            return Err(EtlError::config("block_size must be a positive integer"));
        }
        if self.batch_size == 0 {
            return Err(EtlError::config("batch_size must be a positive integer"));
        }
        if self.cache_size_kib > MAX_CACHE_SIZE_KIB {
            return Err(EtlError::config(format!(
                "cache_size_kib must be at most {MAX_CACHE_SIZE_KIB}, got {}",
                self.cache_size_kib
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EtlError::config("retry.max_attempts must be at least 1"));
        }
        self.validation.validate()?;

        // Overrides for tables nobody loads still have to make sense.
        for name in self.tables.keys() {
            self.table_def(name)?;
        }

        let mut mappings: Vec<TableMapping> = Vec::new();
        for input in &self.inputs {
            if mappings.iter().any(|m| m.table == input.table) {
                continue;
            }
            let def = self.table_def(&input.table)?;
            let mapping = TableMapping::new(&def)?;
            if self.rerun == RerunPolicy::Upsert && mapping.key.is_empty() {
                return Err(EtlError::config(format!(
                    "table `{}` has no key; the upsert re-run policy needs one",
                    mapping.table
                )));
            }
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    /// Built-in definition merged with the table's override, or the custom
    /// definition when the name is not built in.
    pub fn table_def(&self, name: &str) -> Result<TableDef> {
        let overrides = self.tables.get(name).cloned().unwrap_or_default();
        let mut def = match layouts::builtin(name) {
            Some(def) => def,
            None => {
                let (Some(layout), Some(columns)) = (overrides.layout.clone(), overrides.columns.clone())
                else {
                    return Err(EtlError::config(format!(
                        "unknown table `{name}`: expected one of {:?} or a `tables.{name}` entry with layout and columns",
                        layouts::BUILTIN_TABLES
                    )));
                };
                TableDef {
                    name: name.to_string(),
                    layout,
                    columns,
                    key: Vec::new(),
                    indexes: Vec::new(),
                    has_headers: false,
                    member_suffix: None,
                }
            }
        };

        if let Some(layout) = overrides.layout {
            def.layout = layout;
        }
        if let Some(columns) = overrides.columns {
            def.columns = columns;
        }
        if let Some(select) = overrides.select {
            for name in &select {
                if !def.columns.iter().any(|c| &c.name == name) {
                    return Err(EtlError::config(format!(
                        "table `{}`: selected column `{name}` is not defined",
                        def.name
                    )));
                }
            }
            def.columns.retain(|c| select.contains(&c.name));
            // Keys and indexes on dropped columns go with them.
            def.key.retain(|k| select.contains(k));
            def.indexes.retain(|i| select.contains(i));
        }
        if let Some(key) = overrides.key {
            def.key = key;
        }
        if let Some(indexes) = overrides.indexes {
            def.indexes = indexes;
        }
        if let Some(has_headers) = overrides.has_headers {
            def.has_headers = has_headers;
        }
        if let Some(suffix) = overrides.member_suffix {
            def.member_suffix = Some(suffix);
        }
        Ok(def)
    }
}
