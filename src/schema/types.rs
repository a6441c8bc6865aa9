// src/schema/types.rs

use serde::{Deserialize, Serialize};

/// Target type of a selected column.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Trimmed text, empty becomes missing.
    Text,
    /// Signed 64-bit integer.
    Integer,
    /// Floating point; accepts the RFB comma decimal separator (`"1000,00"`).
    Real,
    /// `YYYYMMDD` stored as ISO `YYYY-MM-DD`; `0` and `00000000` mean missing.
    Date,
    /// Digits only, left-padded with zeros to `width` (CNPJ parts, CEP).
    FixedWidth,
}

impl ColumnType {
    /// SQLite column affinity used in the generated DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Date | ColumnType::FixedWidth => "TEXT",
        }
    }
}

/// A single selected column: its source name, target type, and whether the
/// row is useless without it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Hash)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Only meaningful for `fixed_width`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default)]
    pub required: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            width: None,
            required: false,
        }
    }

    pub fn fixed(name: &str, width: usize) -> Self {
        Self {
            width: Some(width),
            ..Self::new(name, ColumnType::FixedWidth)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A normalized field value, ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_spec_reads_from_yaml() {
        let yaml = r#"
- name: cnpj_basico
  type: fixed_width
  width: 8
  required: true
- name: razao_social
  type: text
"#;
        let cols: Vec<ColumnSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cols[0], ColumnSpec::fixed("cnpj_basico", 8).required());
        assert_eq!(cols[1], ColumnSpec::new("razao_social", ColumnType::Text));
    }

    #[test]
    fn sql_affinity() {
        assert_eq!(ColumnType::FixedWidth.sql_type(), "TEXT");
        assert_eq!(ColumnType::Real.sql_type(), "REAL");
        assert_eq!(ColumnType::Integer.sql_type(), "INTEGER");
    }
}
