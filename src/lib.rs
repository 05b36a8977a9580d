//! Multi-format dictionary (glossary) conversion engine.
//!
//! Readers (StarDict, IUPAC Goldbook XML, ZIM archives) produce a stream
//! of [`Entry`] values; the disk-backed [`entry_list::EntryList`] orders
//! them by a chosen collation without holding the glossary in memory; the
//! StarDict writer consumes the sorted stream and emits the four-file
//! on-disk format.

pub mod entry;
pub mod entry_list;
pub mod error;
pub mod goldbook;
pub mod stardict;
pub mod text_utils;
pub mod xdxf;
pub mod zim;

pub use entry::{DataEntry, DefiFormat, Entry, GlossaryInfo, WordEntry};
pub use error::{Error, Result};
