// src/process/block.rs

use csv::{ByteRecord, Reader, ReaderBuilder};
use serde::Serialize;
use std::io::Read;
use tracing::{debug, warn};

use crate::config::{FieldAction, ValidationPolicy};
use crate::error::{EtlError, Result};
use crate::process::{convert, utils};
use crate::schema::{TableMapping, Value};

/// A transformed row plus the source line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub line: u64,
    /// Exactly `mapping.arity()` values, in table column order.
    pub values: Vec<Value>,
}

/// Up to `block_size` transformed rows; the last block of a file may be shorter.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Zero-based position of the block within its file.
    pub index: usize,
    pub rows: Vec<Row>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-file transform counters. `transformed == records - dropped` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub records: u64,
    pub transformed: u64,
    pub dropped: u64,
    /// Optional fields stored as NULL after failing coercion.
    pub nulled: u64,
}

impl TransformStats {
    pub fn add(&mut self, other: TransformStats) {
        self.records += other.records;
        self.transformed += other.transformed;
        self.dropped += other.dropped;
        self.nulled += other.nulled;
    }
}

enum Verdict {
    Keep(Vec<Value>),
    Drop,
}

/// Lazy, forward-only sequence of [`Block`]s over one delimited source.
///
/// Only the columns of the mapping are decoded; every other field is skipped
/// as raw bytes. Restarting means opening the source again.
pub struct BlockReader<'m, R: Read> {
    reader: Reader<R>,
    mapping: &'m TableMapping,
    policy: ValidationPolicy,
    block_size: usize,
    file: String,
    record: ByteRecord,
    next_index: usize,
    stats: TransformStats,
    finished: bool,
}

impl<'m, R: Read> BlockReader<'m, R> {
    /// `file` only labels log lines and errors.
    pub fn new(
        source: R,
        mapping: &'m TableMapping,
        policy: ValidationPolicy,
        block_size: usize,
        file: impl Into<String>,
    ) -> Self {
        let reader = ReaderBuilder::new()
            .delimiter(b';')
            .has_headers(mapping.has_headers)
            .flexible(true)
            .from_reader(source);
        Self {
            reader,
            mapping,
            policy,
            block_size: block_size.max(1),
            file: file.into(),
            record: ByteRecord::new(),
            next_index: 0,
            stats: TransformStats::default(),
            finished: false,
        }
    }

    pub fn stats(&self) -> TransformStats {
        self.stats
    }

    fn check_headers(&mut self) -> Result<()> {
        let headers = self
            .reader
            .byte_headers()
            .map_err(|e| EtlError::source(&self.file, e))?;
        let found: Vec<String> = headers
            .iter()
            .map(|h| utils::clean_str(&utils::decode_latin1(h)).to_string())
            .collect();
        if found != self.mapping.layout {
            warn!(
                file = %self.file,
                expected = ?self.mapping.layout,
                found = ?found,
                "header differs from the layout; fields are read by position"
            );
        }
        Ok(())
    }

    /// Apply the validation policy to the current record.
    fn transform(&mut self, line: u64) -> Result<Verdict> {
        let mapping = self.mapping;
        if self.record.len() != mapping.layout.len() {
            let reason = format!(
                "expected {} fields, found {}",
                mapping.layout.len(),
                self.record.len()
            );
            return self.reject(self.policy.malformed_row, line, "<row>", reason);
        }

        let mut values = Vec::with_capacity(mapping.arity());
        for col in &mapping.columns {
            let raw = utils::decode_latin1(&self.record[col.source_index]);
            let spec = &col.spec;
            let value = match (convert::coerce(&raw, spec), spec.required) {
                (Ok(Some(v)), _) => v,
                (Ok(None), false) => Value::Null,
                (Ok(None), true) => {
                    let action = self.policy.missing_required;
                    return self.reject(action, line, &spec.name, "required value is empty".into());
                }
                (Err(reason), true) => {
                    let action = self.policy.invalid_required;
                    return self.reject(action, line, &spec.name, reason);
                }
                (Err(reason), false) => match self.policy.invalid_optional {
                    FieldAction::Null => {
                        debug!(file = %self.file, line, column = %spec.name, %reason, "value nulled");
                        self.stats.nulled += 1;
                        Value::Null
                    }
                    action => return self.reject(action, line, &spec.name, reason),
                },
            };
            values.push(value);
        }
        Ok(Verdict::Keep(values))
    }

    fn reject(&self, action: FieldAction, line: u64, column: &str, reason: String) -> Result<Verdict> {
        match action {
            FieldAction::Fail => Err(EtlError::Row {
                file: self.file.clone(),
                line,
                column: column.to_string(),
                reason,
            }),
            // Row-level: `null` is refused by config validation, treat as drop.
            FieldAction::Drop | FieldAction::Null => {
                warn!(file = %self.file, line, column, %reason, "row dropped");
                Ok(Verdict::Drop)
            }
        }
    }

    fn next_block(&mut self) -> Result<Option<Block>> {
        if self.next_index == 0 && self.mapping.has_headers {
            self.check_headers()?;
        }

        let mut rows = Vec::with_capacity(self.block_size.min(64 * 1024));
        while rows.len() < self.block_size {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|e| EtlError::source(&self.file, e))?;
            if !more {
                self.finished = true;
                break;
            }
            let line = self.record.position().map(|p| p.line()).unwrap_or(0);
            self.stats.records += 1;
            match self.transform(line)? {
                Verdict::Keep(values) => {
                    self.stats.transformed += 1;
                    rows.push(Row { line, values });
                }
                Verdict::Drop => self.stats.dropped += 1,
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }
        let block = Block {
            index: self.next_index,
            rows,
        };
        self.next_index += 1;
        Ok(Some(block))
    }
}

impl<R: Read> Iterator for BlockReader<'_, R> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
