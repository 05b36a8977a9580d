//! StarDict codec: a bit-exact reader and writer for the legacy four-file
//! on-disk format (`.ifo` metadata, `.idx` index, `.dict[.dz]` article
//! blocks, `.syn` synonyms, plus a flat `res/` resource directory).

use std::fs;
use std::path::Path;

use log::warn;

use crate::error::Result;

pub mod reader;
pub mod writer;

pub use reader::{Reader, ReaderOptions};
pub use writer::{TypeSequence, Writer, WriterOptions};

/// Mandatory first line of every `.ifo` file.
pub const IFO_MAGIC: &str = "StarDict's dict ifo file";

/// A `sametypesequence` value is valid when empty or a single ASCII letter.
pub fn verify_sametypesequence(s: &str) -> bool {
    match s.len() {
        0 => true,
        1 => s.chars().all(|c| c.is_ascii_alphabetic()),
        _ => false,
    }
}

/// Parses an `.ifo` file into `key=value` pairs. The magic line and blank
/// lines are skipped; lines without a key and a value are logged and
/// dropped.
pub fn parse_ifo(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path)?;
    let mut items = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == IFO_MAGIC {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                items.push((key.to_string(), value.to_string()));
            }
            _ => warn!("invalid ifo file line: {line:?}"),
        }
    }
    Ok(items)
}

/// Appends a multi-part extension like `.idx.gz` to a base path without
/// disturbing dots already in the file stem.
pub(crate) fn ext_path(base: &Path, ext: &str) -> std::path::PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(ext);
    std::path::PathBuf::from(s)
}

/// Resolves a user-supplied path to the extensionless base path shared by
/// the four dictionary files.
pub(crate) fn base_path(path: &Path) -> std::path::PathBuf {
    if path.is_dir() {
        let name = path.file_name().unwrap_or_default();
        return path.join(name);
    }
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("ifo") => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}


#[cfg(test)]
#[path = "tests/reader_tests.rs"]
mod reader_tests;

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod writer_tests;

#[cfg(test)]
#[path = "tests/roundtrip_tests.rs"]
mod roundtrip_tests;
