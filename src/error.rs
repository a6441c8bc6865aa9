//! Error taxonomy for a load run.
//!
//! Source and configuration errors are fatal before or during reading,
//! row errors surface only when the validation policy says `fail`, and
//! store errors are split into the transient kind (retried) and the
//! persistent kind (reported per batch).

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    /// Rejected before any file or database is opened.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unreadable, missing or corrupt input (including a broken gzip/zip stream).
    #[error("source error in {path}: {reason}")]
    Source { path: PathBuf, reason: String },

    /// A row the validation policy refuses to drop or null.
    #[error("{file}:{line}: column `{column}`: {reason}")]
    Row {
        file: String,
        line: u64,
        column: String,
        reason: String,
    },

    /// Database stayed busy/locked after every retry.
    #[error("database busy after {attempts} attempts while {operation}")]
    StoreBusy { operation: String, attempts: u32 },

    /// The whole batch was rolled back.
    #[error("constraint violation in `{table}` for source lines {first_line}..={last_line}: {reason}")]
    Constraint {
        table: String,
        first_line: u64,
        last_line: u64,
        reason: String,
    },

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Illegal pipeline state transition.
    #[error("pipeline state error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),
}

impl EtlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Source {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the inputs or the configuration caused the failure rather
    /// than the store.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::Source { .. } | Self::Row { .. } | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_message_carries_row_range() {
        let err = EtlError::Constraint {
            table: "empresas".into(),
            first_line: 11,
            last_line: 20,
            reason: "UNIQUE constraint failed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("empresas"));
        assert!(msg.contains("11..=20"));
    }

    #[test]
    fn input_errors_are_classified() {
        assert!(EtlError::config("block_size must be positive").is_input_error());
        assert!(EtlError::source("a.gz", "corrupt deflate stream").is_input_error());
        assert!(!EtlError::State("Done -> Loading".into()).is_input_error());
    }
}
