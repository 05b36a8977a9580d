//! The entry contract shared by every reader and writer: a glossary is a
//! stream of word entries (headwords + definition) and data entries
//! (resource files), plus a small key/value info block.

use std::fs;
use std::path::{Component, Path};

use lazy_static::lazy_static;
use log::error;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Definition markup tag: `h` = HTML, `m` = plaintext, `x` = XDXF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefiFormat {
    Html,
    Plain,
    Xdxf,
}

impl DefiFormat {
    pub fn letter(self) -> char {
        match self {
            DefiFormat::Html => 'h',
            DefiFormat::Plain => 'm',
            DefiFormat::Xdxf => 'x',
        }
    }

    pub fn from_letter(c: char) -> Option<DefiFormat> {
        match c {
            'h' => Some(DefiFormat::Html),
            'm' => Some(DefiFormat::Plain),
            'x' => Some(DefiFormat::Xdxf),
            _ => None,
        }
    }
}

/// A dictionary article: one or more headwords (the first is canonical,
/// the rest are synonyms) and a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WordEntry {
    pub words: Vec<String>,
    pub defi: String,
    /// `None` until detected or assigned by a reader.
    pub defi_format: Option<DefiFormat>,
    /// Optional `(bytes read, total bytes)` of the source, for progress
    /// reporting by callers.
    pub byte_progress: Option<(u64, u64)>,
}

/// A resource file carried alongside the articles (image, audio, CSS).
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub name: String,
    pub data: Vec<u8>,
}

impl DataEntry {
    /// Writes the blob under `res_dir/name`. Names that would escape the
    /// resource directory are refused with a log message.
    pub fn save(&self, res_dir: &Path) -> Result<()> {
        let rel = Path::new(&self.name);
        let unsafe_name = rel.components().any(|c| {
            !matches!(c, Component::Normal(_))
        });
        if unsafe_name || self.name.is_empty() {
            error!("refusing to save resource with unsafe name {:?}", self.name);
            return Ok(());
        }
        let target = res_dir.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, &self.data)?;
        Ok(())
    }
}

/// A glossary item, either an article or a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Word(WordEntry),
    Data(DataEntry),
}

lazy_static! {
    static ref RE_HTML_TAG: Regex = Regex::new(
        r"(?i)</?(b|i|u|a|p|br|hr|div|span|font|img|sup|sub|ul|ol|li|table|tr|td|pre|code|big|small|audio)(\s[^<>]*)?/?>"
    )
    .unwrap();
}

impl Entry {
    pub fn new_word(
        words: Vec<String>,
        defi: String,
        defi_format: Option<DefiFormat>,
    ) -> Entry {
        Entry::Word(WordEntry {
            words,
            defi,
            defi_format,
            byte_progress: None,
        })
    }

    pub fn new_data(name: String, data: Vec<u8>) -> Entry {
        Entry::Data(DataEntry { name, data })
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Entry::Data(_))
    }

    /// The canonical headword, or the resource file name.
    pub fn first_word(&self) -> &str {
        match self {
            Entry::Word(w) => w.words.first().map(String::as_str).unwrap_or(""),
            Entry::Data(d) => &d.name,
        }
    }

    pub fn defi(&self) -> &str {
        match self {
            Entry::Word(w) => &w.defi,
            Entry::Data(_) => "",
        }
    }

    /// Classifies the definition markup once and caches the result.
    /// Subsequent calls return the cached format.
    pub fn detect_defi_format(&mut self) -> DefiFormat {
        let w = match self {
            Entry::Word(w) => w,
            Entry::Data(_) => return DefiFormat::Plain,
        };
        if let Some(f) = w.defi_format {
            return f;
        }
        let trimmed = w.defi.trim_start();
        let format = if trimmed.starts_with("<k>") {
            DefiFormat::Xdxf
        } else if RE_HTML_TAG.is_match(&w.defi) {
            DefiFormat::Html
        } else {
            DefiFormat::Plain
        };
        w.defi_format = Some(format);
        format
    }

    /// Serializable form for the disk-backed entry store.
    pub fn to_raw(&self) -> RawEntry {
        match self {
            Entry::Word(w) => RawEntry::Word {
                words: w.words.clone(),
                defi: w.defi.clone(),
                format: w.defi_format.map(DefiFormat::letter),
            },
            Entry::Data(d) => RawEntry::Data {
                name: d.name.clone(),
                data: d.data.clone(),
            },
        }
    }

    /// Inverse of [`to_raw`](Entry::to_raw). Entries persisted without a
    /// format pick up `default_format`.
    pub fn from_raw(raw: RawEntry, default_format: Option<DefiFormat>) -> Entry {
        match raw {
            RawEntry::Word { words, defi, format } => Entry::Word(WordEntry {
                words,
                defi,
                defi_format: format.and_then(DefiFormat::from_letter).or(default_format),
                byte_progress: None,
            }),
            RawEntry::Data { name, data } => Entry::Data(DataEntry { name, data }),
        }
    }
}

/// Wire form of an [`Entry`] inside the entry store's run files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawEntry {
    Word {
        words: Vec<String>,
        defi: String,
        format: Option<char>,
    },
    Data {
        name: String,
        data: Vec<u8>,
    },
}

/// Glossary metadata: an insertion-ordered key/value list. `bookname` is
/// stored under `name`, matching how glossary titles are normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlossaryInfo {
    items: Vec<(String, String)>,
}

impl GlossaryInfo {
    pub fn new() -> GlossaryInfo {
        GlossaryInfo::default()
    }

    fn norm_key(key: &str) -> &str {
        if key.eq_ignore_ascii_case("bookname") {
            "name"
        } else {
            key
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let key = Self::norm_key(key);
        for item in &mut self.items {
            if item.0 == key {
                item.1 = value.to_string();
                return;
            }
        }
        self.items.push((key.to_string(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = Self::norm_key(key);
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
