pub mod layouts;
pub mod mapping;
pub mod types;

pub use mapping::{MappedColumn, TableMapping};
pub use types::{ColumnSpec, ColumnType, Value};

use serde::{Deserialize, Serialize};

/// One source type: the documented field order of its files and the subset of
/// fields loaded into the table of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// Every field of the source file, in file order.
    pub layout: Vec<String>,
    /// Selected fields, in table column order.
    pub columns: Vec<ColumnSpec>,
    /// Uniqueness key; required by the `upsert` re-run policy.
    #[serde(default)]
    pub key: Vec<String>,
    /// Columns that get an `idx_<table>_<column>` index after the load.
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub has_headers: bool,
    /// Zip member selector, e.g. `ESTABELE` for `K3241.K03200Y0.D40511.ESTABELE`.
    #[serde(default)]
    pub member_suffix: Option<String>,
}
