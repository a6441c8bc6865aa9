// src/schema/mapping.rs
//
// The single source of truth linking a source file's field positions to the
// table's column order. The block reader projects through `columns` and the
// loader derives its DDL and INSERT from the same list, so the two can never
// disagree on arity or order.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use super::types::{ColumnSpec, ColumnType};
use super::TableDef;
use crate::error::{EtlError, Result};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid"));

/// True if `name` can be spliced into DDL unquoted.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedColumn {
    pub spec: ColumnSpec,
    /// Position of the field in the source record.
    pub source_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableMapping {
    pub table: String,
    pub layout: Vec<String>,
    pub columns: Vec<MappedColumn>,
    pub key: Vec<String>,
    pub indexes: Vec<String>,
    pub has_headers: bool,
    pub member_suffix: Option<String>,
}

impl TableMapping {
    /// Resolve every selected column against the layout. Unknown, duplicate
    /// or unsafe names are configuration errors.
    pub fn new(def: &TableDef) -> Result<Self> {
        let table = &def.name;
        if !is_identifier(table) {
            return Err(EtlError::config(format!("table name `{table}` is not a plain identifier")));
        }
        if def.layout.is_empty() {
            return Err(EtlError::config(format!("table `{table}` has an empty layout")));
        }
        if def.columns.is_empty() {
            return Err(EtlError::config(format!("table `{table}` selects no columns")));
        }

        let mut seen = HashSet::new();
        for field in &def.layout {
            if !seen.insert(field.as_str()) {
                return Err(EtlError::config(format!(
                    "table `{table}`: field `{field}` appears twice in the layout"
                )));
            }
        }

        let mut selected = HashSet::new();
        let mut columns = Vec::with_capacity(def.columns.len());
        for spec in &def.columns {
            let name = &spec.name;
            if !is_identifier(name) {
                return Err(EtlError::config(format!(
                    "table `{table}`: column `{name}` is not a plain identifier"
                )));
            }
            let source_index = def.layout.iter().position(|f| f == name).ok_or_else(|| {
                EtlError::config(format!("table `{table}`: unknown column `{name}`"))
            })?;
            if !selected.insert(name.as_str()) {
                return Err(EtlError::config(format!(
                    "table `{table}`: column `{name}` selected twice"
                )));
            }
            if spec.ty == ColumnType::FixedWidth && spec.width.unwrap_or(0) == 0 {
                return Err(EtlError::config(format!(
                    "table `{table}`: fixed_width column `{name}` needs a positive width"
                )));
            }
            columns.push(MappedColumn {
                spec: spec.clone(),
                source_index,
            });
        }

        for (what, list) in [("key", &def.key), ("index", &def.indexes)] {
            for name in list {
                if !selected.contains(name.as_str()) {
                    return Err(EtlError::config(format!(
                        "table `{table}`: {what} column `{name}` is not selected"
                    )));
                }
            }
        }

        Ok(Self {
            table: table.clone(),
            layout: def.layout.clone(),
            columns,
            key: def.key.clone(),
            indexes: def.indexes.clone(),
            has_headers: def.has_headers,
            member_suffix: def.member_suffix.clone(),
        })
    }

    /// Number of columns of every transformed row.
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.spec.name.as_str())
    }

    /// `CREATE TABLE IF NOT EXISTS`; the key becomes the primary key only
    /// when `with_key` is set.
    pub fn create_table_sql(&self, with_key: bool) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.spec.name, c.spec.ty.sql_type()))
            .collect();
        if with_key && !self.key.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", self.key.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.table,
            defs.join(",\n    ")
        )
    }

    pub fn insert_sql(&self, ignore_duplicates: bool) -> String {
        let verb = if ignore_duplicates {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let cols: Vec<&str> = self.column_names().collect();
        let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
        format!(
            "{verb} INTO {} ({}) VALUES ({})",
            self.table,
            cols.join(", "),
            placeholders.join(", ")
        )
    }

    pub fn index_name(&self, column: &str) -> String {
        format!("idx_{}_{}", self.table, column)
    }

    pub fn create_index_sql(&self, column: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            self.index_name(column),
            self.table,
            column
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::layouts::{builtin, EMPRESAS};

    fn sample_def() -> TableDef {
        TableDef {
            name: "amostra".into(),
            layout: vec![
                "cnpj_basico".into(),
                "id_municipio".into(),
                "id_cnae".into(),
                "situacao_cadastral".into(),
            ],
            columns: vec![
                ColumnSpec::new("cnpj_basico", ColumnType::Integer).required(),
                ColumnSpec::new("situacao_cadastral", ColumnType::Text),
            ],
            key: vec!["cnpj_basico".into()],
            indexes: vec!["situacao_cadastral".into()],
            has_headers: true,
            member_suffix: None,
        }
    }

    #[test]
    fn projection_follows_layout_positions() {
        let m = TableMapping::new(&sample_def()).unwrap();
        assert_eq!(m.arity(), 2);
        assert_eq!(m.columns[0].source_index, 0);
        assert_eq!(m.columns[1].source_index, 3);
    }

    #[test]
    fn ddl_and_insert_share_column_order() {
        let m = TableMapping::new(&sample_def()).unwrap();
        let ddl = m.create_table_sql(true);
        assert!(ddl.contains("cnpj_basico INTEGER,\n    situacao_cadastral TEXT"));
        assert!(ddl.contains("PRIMARY KEY (cnpj_basico)"));
        assert!(!m.create_table_sql(false).contains("PRIMARY KEY"));
        assert_eq!(
            m.insert_sql(true),
            "INSERT OR IGNORE INTO amostra (cnpj_basico, situacao_cadastral) VALUES (?1, ?2)"
        );
        assert_eq!(
            m.create_index_sql("situacao_cadastral"),
            "CREATE INDEX IF NOT EXISTS idx_amostra_situacao_cadastral ON amostra(situacao_cadastral)"
        );
    }

    #[test]
    fn unknown_column_is_rejected() {
        let mut def = sample_def();
        def.columns.push(ColumnSpec::new("uf", ColumnType::Text));
        let err = TableMapping::new(&def).unwrap_err();
        assert!(err.to_string().contains("unknown column `uf`"));
    }

    #[test]
    fn index_on_unselected_column_is_rejected() {
        let mut def = sample_def();
        def.indexes = vec!["id_cnae".into()];
        assert!(TableMapping::new(&def).is_err());
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let mut def = sample_def();
        def.name = "x; DROP TABLE empresas".into();
        assert!(TableMapping::new(&def).is_err());
        assert!(is_identifier("id_cnae"));
        assert!(!is_identifier("1abc"));
    }

    #[test]
    fn fixed_width_needs_width() {
        let mut def = builtin(EMPRESAS).unwrap();
        def.columns[0].width = None;
        assert!(TableMapping::new(&def).is_err());
    }
}
