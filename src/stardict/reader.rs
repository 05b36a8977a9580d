//! StarDict reader: parses `.ifo`/`.idx`/`.syn`/`.dict[.dz]` and yields
//! entries with synonyms merged, followed by one data entry per file in
//! the `res/` directory.
//!
//! Per-record corruption is logged and the record skipped, so a partially
//! damaged dictionary still converts most of its content.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::{error, warn};

use crate::entry::{DefiFormat, Entry, GlossaryInfo};
use crate::error::{Error, Result};
use crate::text_utils::{decode_utf8, find_nul, uint32_from_bytes, UnicodeErrors};
use crate::xdxf::xdxf_to_html;

use super::{base_path, ext_path, verify_sametypesequence};

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Convert XDXF definition parts to HTML while reading.
    pub xdxf_to_html: bool,
    pub unicode_errors: UnicodeErrors,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            xdxf_to_html: true,
            unicode_errors: UnicodeErrors::Strict,
        }
    }
}

/// One `.idx` record: headword bytes and the definition block location.
#[derive(Debug, Clone)]
struct IdxRecord {
    word: Vec<u8>,
    offset: u32,
    size: u32,
}

/// Random access into the article blocks. `.dict.dz` is gzip-compressed
/// and index order visits offsets out of order, so it is decompressed into
/// memory up front; a plain `.dict` stays on disk.
enum DictData {
    File { file: File, size: u64 },
    Mem(Vec<u8>),
}

impl DictData {
    fn read_block(&mut self, offset: u64, len: usize) -> std::io::Result<Option<Vec<u8>>> {
        let end = offset + len as u64;
        match self {
            DictData::File { file, size } => {
                if end > *size {
                    return Ok(None);
                }
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(Some(buf))
            }
            DictData::Mem(data) => {
                if end > data.len() as u64 {
                    return Ok(None);
                }
                Ok(Some(data[offset as usize..end as usize].to_vec()))
            }
        }
    }
}

pub struct Reader {
    info: GlossaryInfo,
    sametypesequence: String,
    index: Vec<IdxRecord>,
    syn: HashMap<u32, Vec<String>>,
    dict: DictData,
    res_dir: Option<PathBuf>,
    res_files: Vec<String>,
    opts: ReaderOptions,
    cursor: usize,
    res_cursor: usize,
}

impl Reader {
    /// Opens the dictionary rooted at `path` (with or without the `.ifo`
    /// extension) and pre-scans the index and synonym files.
    pub fn open(path: &Path, opts: ReaderOptions) -> Result<Reader> {
        let base = base_path(path);

        let mut info = GlossaryInfo::new();
        for (key, value) in super::parse_ifo(&ext_path(&base, ".ifo"))? {
            info.set(&key, &value);
        }

        let sametypesequence = info.get("sametypesequence").unwrap_or("").to_string();
        if !verify_sametypesequence(&sametypesequence) {
            return Err(Error::InvalidSameTypeSequence(sametypesequence));
        }

        let idx_gz = ext_path(&base, ".idx.gz");
        let idx_bytes = if idx_gz.is_file() {
            let mut buf = Vec::new();
            GzDecoder::new(File::open(idx_gz)?).read_to_end(&mut buf)?;
            buf
        } else {
            fs::read(ext_path(&base, ".idx"))?
        };
        let index = parse_idx(&idx_bytes);

        let syn_path = ext_path(&base, ".syn");
        let syn = if syn_path.is_file() {
            parse_syn(&fs::read(syn_path)?, index.len(), opts.unicode_errors)?
        } else {
            HashMap::new()
        };

        let dz_path = ext_path(&base, ".dict.dz");
        let dict = if dz_path.is_file() {
            let mut buf = Vec::new();
            GzDecoder::new(File::open(dz_path)?).read_to_end(&mut buf)?;
            DictData::Mem(buf)
        } else {
            let file = File::open(ext_path(&base, ".dict"))?;
            let size = file.metadata()?.len();
            DictData::File { file, size }
        };

        let mut res_dir = None;
        let mut res_files = Vec::new();
        if let Some(parent) = base.parent() {
            let dir = parent.join("res");
            if dir.is_dir() {
                for item in fs::read_dir(&dir)? {
                    let item = item?;
                    if item.file_type()?.is_file() {
                        res_files.push(item.file_name().to_string_lossy().into_owned());
                    }
                }
                res_files.sort();
                res_dir = Some(dir);
            }
        }

        Ok(Reader {
            info,
            sametypesequence,
            index,
            syn,
            dict,
            res_dir,
            res_files,
            opts,
            cursor: 0,
            res_cursor: 0,
        })
    }

    pub fn info(&self) -> &GlossaryInfo {
        &self.info
    }

    /// Word entries plus resource files.
    pub fn len(&self) -> usize {
        self.index.len() + self.res_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decode_part(&self, bytes: &[u8], letter: u8) -> Result<(Option<DefiFormat>, String)> {
        let mut format = match letter {
            b'm' | b't' | b'y' => Some(DefiFormat::Plain),
            b'g' | b'h' => Some(DefiFormat::Html),
            b'x' => Some(DefiFormat::Xdxf),
            _ => {
                warn!("definition type {:?} is not supported", letter as char);
                None
            }
        };
        let mut defi = decode_utf8(bytes, self.opts.unicode_errors)?;
        if format == Some(DefiFormat::Xdxf) && self.opts.xdxf_to_html {
            defi = xdxf_to_html(&defi);
            format = Some(DefiFormat::Html);
        }
        Ok((format, defi))
    }
}

impl Iterator for Reader {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        while self.cursor < self.index.len() {
            let entry_index = self.cursor;
            self.cursor += 1;

            let rec = self.index[entry_index].clone();
            if rec.word.is_empty() {
                continue;
            }

            let block = match self.dict.read_block(rec.offset as u64, rec.size as usize) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    error!(
                        "unable to read definition for word {:?}",
                        String::from_utf8_lossy(&rec.word)
                    );
                    continue;
                }
                Err(e) => return Some(Err(e.into())),
            };

            let raw_parts = if self.sametypesequence.is_empty() {
                parse_defi_block_general(&block)
            } else {
                parse_defi_block_compact(&block, self.sametypesequence.as_bytes())
            };
            let raw_parts = match raw_parts {
                Some(parts) => parts,
                None => {
                    error!(
                        "dict file is corrupted, word {:?}",
                        String::from_utf8_lossy(&rec.word)
                    );
                    continue;
                }
            };

            let mut parts = Vec::with_capacity(raw_parts.len());
            for (bytes, letter) in raw_parts {
                match self.decode_part(&bytes, letter) {
                    Ok(part) => parts.push(part),
                    Err(e) => return Some(Err(e)),
                }
            }

            let word = match decode_utf8(&rec.word, self.opts.unicode_errors) {
                Ok(word) => word,
                Err(e) => return Some(Err(e)),
            };
            let mut words = vec![word];
            if let Some(alts) = self.syn.get(&(entry_index as u32)) {
                words.extend(alts.iter().cloned());
            }

            let (defi, format) = render_parts(parts);
            return Some(Ok(Entry::new_word(words, defi, format)));
        }

        // All words done; emit the resource files.
        while self.res_cursor < self.res_files.len() {
            let name = self.res_files[self.res_cursor].clone();
            self.res_cursor += 1;
            let dir = match &self.res_dir {
                Some(dir) => dir,
                None => break,
            };
            return Some(match fs::read(dir.join(&name)) {
                Ok(data) => Ok(Entry::new_data(name, data)),
                Err(e) => Err(e.into()),
            });
        }

        None
    }
}

fn read_u32_at(bytes: &[u8], pos: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[pos..pos + 4]);
    uint32_from_bytes(buf)
}

/// Scans the `.idx` byte stream into records. A malformed tail is logged
/// and parsing stops there.
fn parse_idx(bytes: &[u8]) -> Vec<IdxRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let nul = match find_nul(bytes, pos) {
            Some(nul) => nul,
            None => {
                error!("index file is corrupted");
                break;
            }
        };
        let word = bytes[pos..nul].to_vec();
        pos = nul + 1;
        if pos + 8 > bytes.len() {
            error!("index file is corrupted");
            break;
        }
        let offset = read_u32_at(bytes, pos);
        let size = read_u32_at(bytes, pos + 4);
        pos += 8;
        records.push(IdxRecord { word, offset, size });
    }
    records
}

/// Scans the `.syn` byte stream into `entry index -> alternates`. Records
/// that reference an entry index past the end of the index are dropped.
fn parse_syn(
    bytes: &[u8],
    word_count: usize,
    unicode_errors: UnicodeErrors,
) -> Result<HashMap<u32, Vec<String>>> {
    let mut syn: HashMap<u32, Vec<String>> = HashMap::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let nul = match find_nul(bytes, pos) {
            Some(nul) => nul,
            None => {
                error!("synonym file is corrupted");
                break;
            }
        };
        let alt = &bytes[pos..nul];
        pos = nul + 1;
        if pos + 4 > bytes.len() {
            error!("synonym file is corrupted");
            break;
        }
        let entry_index = read_u32_at(bytes, pos);
        pos += 4;
        if entry_index as usize >= word_count {
            error!(
                "corrupted synonym file: word {:?} references invalid item",
                String::from_utf8_lossy(alt)
            );
            continue;
        }
        syn.entry(entry_index)
            .or_default()
            .push(decode_utf8(alt, unicode_errors)?);
    }
    Ok(syn)
}

/// Splits a definition block under a fixed `sametypesequence`: every
/// letter but the last is NUL-terminated (lowercase) or length-prefixed
/// (uppercase); the last letter claims the rest of the block. Returns
/// `None` when any bound check fails.
pub(crate) fn parse_defi_block_compact(block: &[u8], seq: &[u8]) -> Option<Vec<(Vec<u8>, u8)>> {
    let (&last, head) = seq.split_last()?;
    let mut parts = Vec::with_capacity(seq.len());
    let mut i = 0usize;
    for &letter in head {
        if i >= block.len() {
            return None;
        }
        if letter.is_ascii_lowercase() {
            let end = find_nul(block, i)?;
            parts.push((block[i..end].to_vec(), letter));
            i = end + 1;
        } else {
            if i + 4 > block.len() {
                return None;
            }
            let size = read_u32_at(block, i) as usize;
            i += 4;
            if i + size > block.len() {
                return None;
            }
            parts.push((block[i..i + size].to_vec(), letter));
            i += size;
        }
    }
    if i >= block.len() {
        return None;
    }
    let rest = &block[i..];
    if last.is_ascii_lowercase() && rest.contains(&0) {
        return None;
    }
    parts.push((rest.to_vec(), last));
    Some(parts)
}

/// Splits a definition block where every part carries its own type
/// letter. A non-alphabetic type byte means the block is corrupted.
pub(crate) fn parse_defi_block_general(block: &[u8]) -> Option<Vec<(Vec<u8>, u8)>> {
    let mut parts = Vec::new();
    let mut i = 0usize;
    while i < block.len() {
        let letter = block[i];
        if !letter.is_ascii_alphabetic() {
            return None;
        }
        i += 1;
        if letter.is_ascii_lowercase() {
            let end = find_nul(block, i)?;
            parts.push((block[i..end].to_vec(), letter));
            i = end + 1;
        } else {
            if i + 4 > block.len() {
                return None;
            }
            let size = read_u32_at(block, i) as usize;
            i += 4;
            if i + size > block.len() {
                return None;
            }
            parts.push((block[i..i + size].to_vec(), letter));
            i += size;
        }
    }
    Some(parts)
}

/// Folds decoded definition parts into one `(defi, format)` pair.
///
/// A single part passes through. Parts sharing one format are joined
/// (`\n<hr>` for HTML, `\n` otherwise). Mixed formats are promoted to
/// HTML: plaintext is wrapped in `<pre>`, XDXF transformed, and the
/// pieces joined by `\n<hr>\n`.
fn render_parts(parts: Vec<(Option<DefiFormat>, String)>) -> (String, Option<DefiFormat>) {
    if parts.is_empty() {
        error!("definition block decoded to no parts");
        return (String::new(), None);
    }
    if parts.len() == 1 {
        let (format, defi) = parts.into_iter().next().unwrap_or((None, String::new()));
        return (defi, format);
    }

    let first_format = parts[0].0;
    if parts.iter().all(|(f, _)| *f == first_format) {
        let sep = if first_format == Some(DefiFormat::Html) {
            "\n<hr>"
        } else {
            "\n"
        };
        let defi = parts
            .iter()
            .map(|(_, d)| d.as_str())
            .collect::<Vec<_>>()
            .join(sep);
        return (defi, first_format);
    }

    let converted: Vec<String> = parts
        .into_iter()
        .map(|(format, defi)| match format {
            Some(DefiFormat::Plain) => format!("<pre>{}</pre>", defi.replace('\n', "<br/>")),
            Some(DefiFormat::Xdxf) => xdxf_to_html(&defi),
            _ => defi,
        })
        .collect();
    (converted.join("\n<hr>\n"), Some(DefiFormat::Html))
}
