use serde::Serialize;

use crate::load::LoadStats;
use crate::process::TransformStats;

/// Outcome of one input file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub table: String,
    pub file: String,
    /// Already loaded by an earlier upsert run.
    pub skipped: bool,
    pub blocks: u64,
    pub transform: TransformStats,
    pub load: LoadStats,
    pub elapsed_ms: u128,
}

impl FileReport {
    pub fn new(table: &str, file: &str) -> Self {
        Self {
            table: table.to_string(),
            file: file.to_string(),
            skipped: false,
            blocks: 0,
            transform: TransformStats::default(),
            load: LoadStats::default(),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub files: Vec<FileReport>,
    pub indexes_created: usize,
    pub elapsed_ms: u128,
}

impl RunReport {
    pub fn inserted(&self) -> u64 {
        self.files.iter().map(|f| f.load.inserted).sum()
    }

    pub fn transform(&self) -> TransformStats {
        let mut total = TransformStats::default();
        for f in &self.files {
            total.add(f.transform);
        }
        total
    }

    pub fn skipped(&self) -> usize {
        self.files.iter().filter(|f| f.skipped).count()
    }
}

/// Passed to the run observer after every committed block.
#[derive(Debug, Clone, Copy)]
pub struct BlockProgress<'a> {
    pub table: &'a str,
    pub file: &'a str,
    pub block: usize,
    pub rows: usize,
    pub inserted_so_far: u64,
}
