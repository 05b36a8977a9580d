//! StarDict writer: consumes a stream of entries through an explicit
//! `open` / `feed` / `finish` protocol and emits the four dictionary
//! files. Two block layouts (compact under a fixed `sametypesequence`,
//! general with per-part type letters) crossed with two synonym layouts
//! (separate `.syn` file, or merged into `.idx`) give four output shapes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

use crate::entry::{DefiFormat, Entry, GlossaryInfo};
use crate::error::Result;
use crate::text_utils::{newlines_to_br, newlines_to_space, stardict_cmp, uint32_to_bytes};

use super::{base_path, ext_path, IFO_MAGIC};

/// Entries sampled before committing to an auto-selected layout.
const AUTO_SELECT_SAMPLE: usize = 100;

/// The `sametypesequence` write option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSequence {
    /// Sample the first entries and pick `m`, `h`, or the general layout.
    Auto,
    /// Always use the general layout.
    Disabled,
    /// Force the compact layout with this format.
    Fixed(DefiFormat),
}

impl Default for TypeSequence {
    fn default() -> Self {
        TypeSequence::Auto
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub sametypesequence: TypeSequence,
    /// Compress the final `.dict` with the external dictzip tool.
    pub dictzip: bool,
    /// Rewrite HTML paragraphs for the StarDict 3.0 desktop client.
    pub stardict_client: bool,
    /// Write alternates into `.idx` as duplicate records instead of `.syn`.
    pub merge_syns: bool,
    /// Rewrite `sound://` links to `<audio>` elements.
    pub audio_goldendict: bool,
    /// Keep the link body inside the rewritten `<audio>` element.
    pub audio_icon: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            sametypesequence: TypeSequence::Auto,
            dictzip: true,
            stardict_client: false,
            merge_syns: false,
            audio_goldendict: false,
            audio_icon: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Compact(DefiFormat),
    General,
}

lazy_static! {
    static ref RE_P_TAG: Regex = Regex::new(r"(?s)<p( [^<>]*?)?>(.*?)</p>").unwrap();
    static ref RE_BR_TAG: Regex = Regex::new(r"(?i)<br[ /]*>").unwrap();
    static ref RE_AUDIO_LINK: Regex = Regex::new(
        r#"<a (type="sound" )?([^<>]*? )?href="sound://([^<>"]+)"( .*?)?>(.*?)</a>"#
    )
    .unwrap();
}

pub struct Writer {
    info: GlossaryInfo,
    opts: WriterOptions,
    base: PathBuf,
    res_dir: PathBuf,
    dict: Option<BufWriter<File>>,
    dict_mark: u64,
    layout: Option<Layout>,
    pending: Vec<Entry>,
    /// `(word, offset, size, entry index at feed time)`.
    idx_records: Vec<(Vec<u8>, u32, u32, u32)>,
    alt_records: Vec<(Vec<u8>, u32)>,
    entry_count: u32,
}

impl Writer {
    pub fn new(info: GlossaryInfo, opts: WriterOptions) -> Writer {
        Writer {
            info,
            opts,
            base: PathBuf::new(),
            res_dir: PathBuf::new(),
            dict: None,
            dict_mark: 0,
            layout: None,
            pending: Vec::new(),
            idx_records: Vec::new(),
            alt_records: Vec::new(),
            entry_count: 0,
        }
    }

    /// Fixes the output paths and opens the `.dict` file for writing.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        let base = base_path(path);
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.res_dir = base
            .parent()
            .map(|p| p.join("res"))
            .unwrap_or_else(|| PathBuf::from("res"));
        fs::create_dir_all(&self.res_dir)?;
        self.dict = Some(BufWriter::new(File::create(ext_path(&base, ".dict"))?));
        self.base = base;
        self.layout = match self.opts.sametypesequence {
            TypeSequence::Fixed(format) => Some(Layout::Compact(format)),
            TypeSequence::Disabled => Some(Layout::General),
            TypeSequence::Auto => None,
        };
        Ok(())
    }

    /// Consumes one entry. Data entries are saved under `res/`; word
    /// entries are encoded into the `.dict` stream (buffered while the
    /// layout is still being auto-selected).
    pub fn feed(&mut self, entry: Entry) -> Result<()> {
        if let Entry::Data(data) = &entry {
            return data.save(&self.res_dir);
        }
        match self.layout {
            Some(layout) => self.write_word(entry, layout),
            None => {
                self.pending.push(entry);
                if self.pending.len() >= AUTO_SELECT_SAMPLE {
                    self.decide_layout()?;
                }
                Ok(())
            }
        }
    }

    /// Auto-selects the layout from the buffered sample: almost all
    /// plaintext picks compact `m`, a majority of HTML picks compact `h`,
    /// anything else falls back to the general layout.
    fn decide_layout(&mut self) -> Result<()> {
        let total = self.pending.len();
        let layout = if total == 0 {
            Layout::General
        } else {
            let mut plain = 0usize;
            let mut html = 0usize;
            for entry in &mut self.pending {
                match entry.detect_defi_format() {
                    DefiFormat::Plain => plain += 1,
                    DefiFormat::Html => html += 1,
                    DefiFormat::Xdxf => {}
                }
            }
            if plain as f64 / total as f64 >= 0.97 {
                info!("auto-selecting sametypesequence=m");
                Layout::Compact(DefiFormat::Plain)
            } else if html as f64 / total as f64 > 0.5 {
                info!("auto-selecting sametypesequence=h");
                Layout::Compact(DefiFormat::Html)
            } else {
                Layout::General
            }
        };
        self.layout = Some(layout);
        for entry in std::mem::take(&mut self.pending) {
            self.write_word(entry, layout)?;
        }
        Ok(())
    }

    fn write_word(&mut self, mut entry: Entry, layout: Layout) -> Result<()> {
        let entry_index = self.entry_count;
        self.entry_count += 1;

        let block = match layout {
            Layout::Compact(format) => {
                self.fix_defi(entry.defi(), format).into_bytes()
            }
            Layout::General => {
                let format = entry.detect_defi_format();
                let defi = self.fix_defi(entry.defi(), format);
                let mut block = Vec::with_capacity(defi.len() + 2);
                block.push(format.letter() as u8);
                block.extend_from_slice(defi.as_bytes());
                block.push(0);
                block
            }
        };

        let dict = match self.dict.as_mut() {
            Some(dict) => dict,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "writer is not open",
                )
                .into())
            }
        };
        dict.write_all(&block)?;

        let offset = self.dict_mark as u32;
        let size = block.len() as u32;
        self.dict_mark += block.len() as u64;

        let words = match &entry {
            Entry::Word(w) => &w.words,
            Entry::Data(_) => return Ok(()),
        };
        if self.opts.merge_syns {
            for word in words {
                self.idx_records
                    .push((word.clone().into_bytes(), offset, size, entry_index));
            }
        } else {
            let word = words.first().cloned().unwrap_or_default();
            self.idx_records
                .push((word.into_bytes(), offset, size, entry_index));
            for alt in words.iter().skip(1) {
                self.alt_records
                    .push((alt.clone().into_bytes(), entry_index));
            }
        }
        Ok(())
    }

    /// Post-processes a definition before it hits the `.dict` stream.
    fn fix_defi(&self, defi: &str, format: DefiFormat) -> String {
        let mut defi = defi.to_string();
        if self.opts.stardict_client && format == DefiFormat::Html {
            defi = RE_P_TAG.replace_all(&defi, "${2}<br>").into_owned();
            // An orphan closing tag still needs to break the line.
            defi = defi.replace("</p>", "<br>");
            defi = RE_BR_TAG.replace_all(&defi, "<br>").into_owned();
        }
        if self.opts.audio_goldendict {
            let replacement = if self.opts.audio_icon {
                r#"<audio src="${3}">${5}</audio>"#
            } else {
                r#"<audio src="${3}"></audio>"#
            };
            defi = RE_AUDIO_LINK.replace_all(&defi, replacement).into_owned();
        }
        defi
    }

    /// Terminates the stream: writes `.idx`, `.syn`, `.ifo`, drops an
    /// empty `res/` directory, and runs dictzip when requested.
    pub fn finish(&mut self) -> Result<()> {
        if self.layout.is_none() {
            self.decide_layout()?;
        }
        if let Some(dict) = self.dict.take() {
            dict.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }

        self.idx_records
            .sort_by(|a, b| stardict_cmp(&a.0, &b.0));
        // Sorting reorders the records, so synonym references must be
        // rewritten from feed-time entry indexes to index positions.
        let mut remap = vec![0u32; self.entry_count as usize];
        let mut idx_bytes = Vec::new();
        for (position, (word, offset, size, entry_index)) in
            self.idx_records.iter().enumerate()
        {
            if let Some(slot) = remap.get_mut(*entry_index as usize) {
                *slot = position as u32;
            }
            idx_bytes.extend_from_slice(word);
            idx_bytes.push(0);
            idx_bytes.extend_from_slice(&uint32_to_bytes(*offset));
            idx_bytes.extend_from_slice(&uint32_to_bytes(*size));
        }
        fs::write(ext_path(&self.base, ".idx"), &idx_bytes)?;

        let syn_count = if self.opts.merge_syns {
            0
        } else {
            self.alt_records.len()
        };
        if !self.opts.merge_syns && !self.alt_records.is_empty() {
            self.alt_records.sort_by(|a, b| stardict_cmp(&a.0, &b.0));
            let mut syn_bytes = Vec::new();
            for (alt, entry_index) in &self.alt_records {
                syn_bytes.extend_from_slice(alt);
                syn_bytes.push(0);
                let position = remap
                    .get(*entry_index as usize)
                    .copied()
                    .unwrap_or(*entry_index);
                syn_bytes.extend_from_slice(&uint32_to_bytes(position));
            }
            fs::write(ext_path(&self.base, ".syn"), &syn_bytes)?;
        }

        self.write_ifo(idx_bytes.len(), syn_count)?;

        if fs::read_dir(&self.res_dir)?.next().is_none() {
            fs::remove_dir(&self.res_dir)?;
        }

        if self.opts.dictzip {
            self.run_dictzip();
        }
        Ok(())
    }

    fn write_ifo(&self, idx_size: usize, syn_count: usize) -> Result<()> {
        let mut bookname = newlines_to_space(self.info.get("name").unwrap_or(""));
        if let (Some(src), Some(tgt)) = (
            self.info.get("sourceLang"),
            self.info.get("targetLang"),
        ) {
            if !src.is_empty() && !tgt.is_empty() {
                let langs = format!("{src}-{tgt}");
                if !bookname.to_lowercase().contains(&langs.to_lowercase()) {
                    bookname = format!("{bookname} ({langs})");
                }
                info!("bookname: {bookname}");
            }
        }

        let mut ifo: Vec<(&str, String)> = vec![
            ("version", "3.0.0".to_string()),
            ("bookname", bookname),
            ("wordcount", self.entry_count.to_string()),
            ("idxfilesize", idx_size.to_string()),
        ];
        if let Some(Layout::Compact(format)) = self.layout {
            ifo.push(("sametypesequence", format.letter().to_string()));
        }
        if syn_count > 0 {
            ifo.push(("synwordcount", syn_count.to_string()));
        }
        for key in ["author", "email", "website", "date"] {
            if let Some(value) = self.info.get(key) {
                if !value.is_empty() {
                    ifo.push((key, newlines_to_space(value)));
                }
            }
        }

        let mut desc = self.info.get("description").unwrap_or("").to_string();
        if let Some(copyright) = self.info.get("copyright") {
            if !copyright.is_empty() {
                desc = format!("{copyright}\n{desc}");
            }
        }
        if let Some(publisher) = self.info.get("publisher") {
            if !publisher.is_empty() {
                desc = format!("Publisher: {publisher}\n{desc}");
            }
        }
        ifo.push(("description", newlines_to_br(&desc)));

        let mut out = BufWriter::new(File::create(ext_path(&self.base, ".ifo"))?);
        writeln!(out, "{IFO_MAGIC}")?;
        for (key, value) in ifo {
            writeln!(out, "{key}={value}")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Best effort: a missing or failing dictzip binary only logs.
    fn run_dictzip(&self) {
        let dict_path = ext_path(&self.base, ".dict");
        match Command::new("dictzip").arg(&dict_path).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("dictzip exited with {status}"),
            Err(e) => warn!("dictzip failed to run: {e}"),
        }
    }
}
