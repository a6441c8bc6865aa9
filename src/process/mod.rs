// src/process/mod.rs
//
// The bounded-memory transformer: decompress, split into `;`-delimited
// records, project the mapped columns, coerce and validate, and emit
// fixed-size blocks.

pub mod block;
pub mod convert;
pub mod date_parser;
pub mod source;
pub mod utils;

pub use block::{Block, BlockReader, Row, TransformStats};
pub use source::{with_source, Compression};

use std::path::Path;
use tracing::{info, instrument};

use crate::config::ValidationPolicy;
use crate::error::Result;
use crate::schema::TableMapping;

/// Run only the transformer over one file and return its counters.
/// Nothing is kept beyond the block being inspected.
#[instrument(level = "info", skip(mapping, policy), fields(table = %mapping.table, path = %path.display()))]
pub fn scan_file(
    path: &Path,
    mapping: &TableMapping,
    policy: ValidationPolicy,
    block_size: usize,
) -> Result<TransformStats> {
    let label = file_label(path);
    let stats = with_source(path, mapping.member_suffix.as_deref(), |reader| {
        let mut blocks = BlockReader::new(reader, mapping, policy, block_size, label.clone());
        for block in blocks.by_ref() {
            block?;
        }
        Ok(blocks.stats())
    })?;
    info!(
        records = stats.records,
        transformed = stats.transformed,
        dropped = stats.dropped,
        nulled = stats.nulled,
        "scan complete"
    );
    Ok(stats)
}

/// File name used in logs, errors and the load history.
pub fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EtlConfig;
    use crate::schema::layouts::CNAES;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn scan_counts_plain_lookup_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("F.K03200$Z.D40511.CNAECSV");
        let mut f = std::fs::File::create(&path)?;
        f.write_all(b"\"0111301\";\"Cultivo de arroz\"\n\"\";\"sem codigo\"\n\"0111302\";\"Cultivo de milho\"\n")?;
        drop(f);

        let mapping = EtlConfig::default().table_def(CNAES).map(|d| TableMapping::new(&d))??;
        let stats = scan_file(&path, &mapping, ValidationPolicy::default(), 1)?;
        assert_eq!(stats.records, 3);
        assert_eq!(stats.transformed, 2);
        assert_eq!(stats.dropped, 1);
        Ok(())
    }

    #[test]
    fn label_is_the_file_name() {
        assert_eq!(file_label(Path::new("/data/x/Empresas0.zip")), "Empresas0.zip");
    }
}
