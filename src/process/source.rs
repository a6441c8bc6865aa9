// src/process/source.rs

use flate2::read::MultiGzDecoder;
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};
use tracing::debug;
use zip::ZipArchive;

use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zip,
    Plain,
}

impl Compression {
    /// Decide by extension: `.gz`, `.zip`, anything else is read as-is.
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("gz") | Some("gzip") => Compression::Gzip,
            Some("zip") => Compression::Zip,
            _ => Compression::Plain,
        }
    }
}

/// Open `path` and hand `f` a reader over the decompressed text.
///
/// For zip archives the member is the first file whose name ends with
/// `member_suffix` (case-insensitive); without a suffix the archive must hold
/// exactly one file. The reader only lives for the duration of `f`, which is
/// what lets a zip member borrow its archive.
pub fn with_source<T>(
    path: &Path,
    member_suffix: Option<&str>,
    f: impl FnOnce(&mut dyn Read) -> Result<T>,
) -> Result<T> {
    let file = File::open(path).map_err(|e| EtlError::source(path, e))?;

    match Compression::detect(path) {
        Compression::Gzip => {
            let mut reader = MultiGzDecoder::new(BufReader::new(file));
            f(&mut reader)
        }
        Compression::Plain => {
            let mut reader = BufReader::new(file);
            f(&mut reader)
        }
        Compression::Zip => {
            let mut archive = ZipArchive::new(BufReader::new(file))
                .map_err(|e| EtlError::source(path, format!("invalid zip archive: {e}")))?;
            let index = find_member(&mut archive, member_suffix)
                .map_err(|reason| EtlError::source(path, reason))?;
            let mut entry = archive
                .by_index(index)
                .map_err(|e| EtlError::source(path, format!("zip entry #{index}: {e}")))?;
            debug!(path = %path.display(), member = entry.name(), "reading zip member");
            f(&mut entry)
        }
    }
}

fn find_member<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    member_suffix: Option<&str>,
) -> std::result::Result<usize, String> {
    // Raw access reads the central directory only, so an encrypted or
    // unsupported neighbour does not fail the lookup.
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| format!("zip entry #{i}: {e}"))?;
        if entry.is_file() {
            files.push((i, entry.name().to_string()));
        }
    }

    match member_suffix {
        Some(suffix) => {
            let suffix = suffix.to_ascii_uppercase();
            files
                .iter()
                .find(|(_, name)| name.to_ascii_uppercase().ends_with(&suffix))
                .map(|(i, _)| *i)
                .ok_or_else(|| format!("no member ending in `{suffix}`"))
        }
        None => match files.as_slice() {
            [(i, _)] => Ok(*i),
            [] => Err("archive holds no files".to_string()),
            _ => Err(format!(
                "archive holds {} files; configure a member_suffix",
                files.len()
            )),
        },
    }
}
