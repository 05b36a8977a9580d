//! ZIM archive reader.
//!
//! Two layers: [`Archive`] is a minimal pure-Rust parser for the ZIM
//! container (header, MIME list, URL pointer list, directory entries,
//! clusters with uncompressed or XZ blobs), and [`Reader`] sits on top of
//! it classifying every archive entry as a redirect, an HTML/plaintext
//! article, or a resource blob.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{error, info, warn};
use memmap2::Mmap;
use thiserror::Error;
use xz2::read::XzDecoder;

use crate::entry::{DefiFormat, Entry};
use crate::error::Result;

const ZIM_MAGIC: u32 = 0x044D_495A;
const HEADER_LEN: usize = 80;

const MIME_REDIRECT: u16 = 0xFFFF;
const MIME_LINKTARGET: u16 = 0xFFFE;
const MIME_DELETED: u16 = 0xFFFD;

#[derive(Debug, Error)]
pub enum ZimError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a zim file (bad magic)")]
    InvalidMagic,
    #[error("malformed zim archive: {0}")]
    Malformed(&'static str),
    #[error("unsupported cluster compression {0}")]
    UnsupportedCompression(u8),
    #[error("cluster decompression failed: {0}")]
    Decompress(String),
}

#[derive(Debug)]
struct Header {
    entry_count: u32,
    cluster_count: u32,
    url_ptr_pos: u64,
    cluster_ptr_pos: u64,
    mime_list_pos: u64,
    checksum_pos: u64,
}

/// One directory entry: either an article/resource pointing into a
/// cluster, or a redirect to another entry.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub mime_id: u16,
    pub namespace: u8,
    pub redirect_index: Option<u32>,
    pub cluster: u32,
    pub blob: u32,
    pub url: String,
    pub title: String,
}

impl Dirent {
    pub fn is_redirect(&self) -> bool {
        self.redirect_index.is_some()
    }

    /// The display title, falling back to the URL path when no title is
    /// stored.
    pub fn title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }
}

fn read_nul_string(slice: &[u8], pos: &mut usize) -> Result<String, ZimError> {
    let start = *pos;
    let mut end = start;
    while end < slice.len() && slice[end] != 0 {
        end += 1;
    }
    if end >= slice.len() {
        return Err(ZimError::Malformed("unterminated string"));
    }
    *pos = end + 1;
    Ok(String::from_utf8_lossy(&slice[start..end]).into_owned())
}

pub struct Archive {
    mmap: Mmap,
    header: Header,
    mime_types: Vec<String>,
    url_ptrs: Vec<u64>,
    cluster_ptrs: Vec<u64>,
    /// Last decompressed cluster: `(number, blob area, extended offsets)`.
    /// Consecutive entries usually share a cluster.
    cluster_cache: Option<(u32, Vec<u8>, bool)>,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Archive, ZimError> {
        let file = File::open(path)?;
        // The file is mapped read-only and never written through.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(ZimError::Malformed("file shorter than header"));
        }

        let mut cur = Cursor::new(&mmap[..HEADER_LEN]);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != ZIM_MAGIC {
            return Err(ZimError::InvalidMagic);
        }
        let _major = cur.read_u16::<LittleEndian>()?;
        let _minor = cur.read_u16::<LittleEndian>()?;
        let mut uuid = [0u8; 16];
        cur.read_exact(&mut uuid)?;
        let entry_count = cur.read_u32::<LittleEndian>()?;
        let cluster_count = cur.read_u32::<LittleEndian>()?;
        let url_ptr_pos = cur.read_u64::<LittleEndian>()?;
        let _title_ptr_pos = cur.read_u64::<LittleEndian>()?;
        let cluster_ptr_pos = cur.read_u64::<LittleEndian>()?;
        let mime_list_pos = cur.read_u64::<LittleEndian>()?;
        let _main_page = cur.read_u32::<LittleEndian>()?;
        let _layout_page = cur.read_u32::<LittleEndian>()?;
        let checksum_pos = cur.read_u64::<LittleEndian>()?;

        let header = Header {
            entry_count,
            cluster_count,
            url_ptr_pos,
            cluster_ptr_pos,
            mime_list_pos,
            checksum_pos,
        };

        // MIME list: NUL-terminated strings up to an empty one.
        let mut mime_types = Vec::new();
        let mut pos = mime_list_pos as usize;
        if pos >= mmap.len() {
            return Err(ZimError::Malformed("mime list out of bounds"));
        }
        loop {
            let s = read_nul_string(&mmap, &mut pos)?;
            if s.is_empty() {
                break;
            }
            mime_types.push(s);
        }

        let url_ptrs = read_u64_list(&mmap, header.url_ptr_pos, entry_count as usize)
            .ok_or(ZimError::Malformed("url pointer list out of bounds"))?;
        let cluster_ptrs = read_u64_list(&mmap, header.cluster_ptr_pos, cluster_count as usize)
            .ok_or(ZimError::Malformed("cluster pointer list out of bounds"))?;

        Ok(Archive {
            mmap,
            header,
            mime_types,
            url_ptrs,
            cluster_ptrs,
            cluster_cache: None,
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    /// Parses the directory entry with the given id (URL pointer order).
    pub fn entry_by_id(&self, id: u32) -> Result<Dirent, ZimError> {
        let offset = *self
            .url_ptrs
            .get(id as usize)
            .ok_or(ZimError::Malformed("entry id out of range"))? as usize;
        let slice = self
            .mmap
            .get(offset..)
            .ok_or(ZimError::Malformed("dirent offset out of bounds"))?;

        let mut cur = Cursor::new(slice);
        let mime_id = cur.read_u16::<LittleEndian>()?;
        let _param_len = cur.read_u8()?;
        let namespace = cur.read_u8()?;
        let _revision = cur.read_u32::<LittleEndian>()?;
        let (redirect_index, cluster, blob) = match mime_id {
            MIME_REDIRECT => (Some(cur.read_u32::<LittleEndian>()?), 0, 0),
            MIME_LINKTARGET | MIME_DELETED => (None, 0, 0),
            _ => {
                let cluster = cur.read_u32::<LittleEndian>()?;
                let blob = cur.read_u32::<LittleEndian>()?;
                (None, cluster, blob)
            }
        };
        let mut pos = cur.position() as usize;
        let url = read_nul_string(slice, &mut pos)?;
        let title = read_nul_string(slice, &mut pos)?;

        Ok(Dirent {
            mime_id,
            namespace,
            redirect_index,
            cluster,
            blob,
            url,
            title,
        })
    }

    /// The MIME type string of a content entry, if its MIME record is
    /// valid.
    pub fn mimetype(&self, dirent: &Dirent) -> Option<&str> {
        if dirent.mime_id >= MIME_DELETED {
            return None;
        }
        self.mime_types.get(dirent.mime_id as usize).map(String::as_str)
    }

    /// Loads the blob a content entry points at.
    pub fn content(&mut self, dirent: &Dirent) -> Result<Vec<u8>, ZimError> {
        self.ensure_cluster(dirent.cluster)?;
        let (area, extended) = match &self.cluster_cache {
            Some((number, area, extended)) if *number == dirent.cluster => {
                (area.as_slice(), *extended)
            }
            _ => return Err(ZimError::Malformed("cluster cache miss")),
        };

        let off_size = if extended { 8usize } else { 4 };
        let first = read_offset(area, 0, extended)
            .ok_or(ZimError::Malformed("cluster blob table truncated"))?;
        let offset_count = (first as usize) / off_size;
        let blob = dirent.blob as usize;
        if blob + 1 >= offset_count {
            return Err(ZimError::Malformed("blob index out of range"));
        }
        let start = read_offset(area, blob, extended)
            .ok_or(ZimError::Malformed("cluster blob table truncated"))? as usize;
        let end = read_offset(area, blob + 1, extended)
            .ok_or(ZimError::Malformed("cluster blob table truncated"))? as usize;
        if start > end || end > area.len() {
            return Err(ZimError::Malformed("blob bounds out of range"));
        }
        Ok(area[start..end].to_vec())
    }

    fn ensure_cluster(&mut self, cluster: u32) -> Result<(), ZimError> {
        if matches!(&self.cluster_cache, Some((number, _, _)) if *number == cluster) {
            return Ok(());
        }
        let idx = cluster as usize;
        let start = *self
            .cluster_ptrs
            .get(idx)
            .ok_or(ZimError::Malformed("cluster index out of range"))? as usize;
        let end = if idx + 1 < self.cluster_ptrs.len() {
            self.cluster_ptrs[idx + 1] as usize
        } else {
            self.header.checksum_pos as usize
        };
        let end = end.min(self.mmap.len());
        if start + 1 > end {
            return Err(ZimError::Malformed("cluster bounds out of range"));
        }

        let info = self.mmap[start];
        let compression = info & 0x0F;
        let extended = info & 0x10 != 0;
        let raw = &self.mmap[start + 1..end];
        let area = match compression {
            0 | 1 => raw.to_vec(),
            4 => {
                let mut out = Vec::new();
                XzDecoder::new(raw)
                    .read_to_end(&mut out)
                    .map_err(|e| ZimError::Decompress(e.to_string()))?;
                out
            }
            other => return Err(ZimError::UnsupportedCompression(other)),
        };
        self.cluster_cache = Some((cluster, area, extended));
        Ok(())
    }
}

fn read_u64_list(data: &[u8], pos: u64, count: usize) -> Option<Vec<u64>> {
    let start = pos as usize;
    let end = start.checked_add(count.checked_mul(8)?)?;
    let slice = data.get(start..end)?;
    let mut cur = Cursor::new(slice);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(cur.read_u64::<LittleEndian>().ok()?);
    }
    Some(out)
}

fn read_offset(area: &[u8], index: usize, extended: bool) -> Option<u64> {
    if extended {
        let start = index.checked_mul(8)?;
        let slice = area.get(start..start + 8)?;
        Cursor::new(slice).read_u64::<LittleEndian>().ok()
    } else {
        let start = index.checked_mul(4)?;
        let slice = area.get(start..start + 4)?;
        Cursor::new(slice).read_u32::<LittleEndian>().ok().map(u64::from)
    }
}

/// MIME types emitted as resource files rather than articles.
pub const RESOURCE_MIME_TYPES: [&str; 15] = [
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/svg+xml",
    "image/webp",
    "image/x-icon",
    "text/css",
    "text/javascript",
    "application/javascript",
    "application/json",
    "application/octet-stream",
    "application/octet-stream+xapian",
    "application/x-chrome-extension",
    "application/warc-headers",
    "application/font-woff",
];

/// Longest entry title (in characters) accepted as a resource file name.
const FILENAME_MAX: usize = 255;

/// Glossary producer over a ZIM archive: iterates entries in id order and
/// yields redirects as linking articles, HTML and plaintext content as
/// word entries, and everything else as resources.
pub struct Reader {
    archive: Archive,
    cursor: u32,
    redirect_count: usize,
    empty_content_count: usize,
    invalid_mime_count: usize,
    name_too_long_count: usize,
    summary_logged: bool,
}

impl Reader {
    pub fn open(path: &Path) -> Result<Reader> {
        Ok(Reader {
            archive: Archive::open(path)?,
            cursor: 0,
            redirect_count: 0,
            empty_content_count: 0,
            invalid_mime_count: 0,
            name_too_long_count: 0,
            summary_logged: false,
        })
    }

    pub fn len(&self) -> usize {
        self.archive.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn log_summary(&mut self) {
        if self.summary_logged {
            return;
        }
        self.summary_logged = true;
        info!("zim entry count: {}", self.archive.entry_count());
        if self.name_too_long_count > 0 {
            error!("files with name too long: {}", self.name_too_long_count);
        }
        if self.empty_content_count > 0 {
            info!("empty content count: {}", self.empty_content_count);
        }
        if self.invalid_mime_count > 0 {
            info!("invalid mime-type count: {}", self.invalid_mime_count);
        }
        if self.redirect_count > 0 {
            info!("redirect count: {}", self.redirect_count);
        }
    }
}

impl Iterator for Reader {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        while self.cursor < self.archive.entry_count() {
            let id = self.cursor;
            self.cursor += 1;

            let dirent = match self.archive.entry_by_id(id) {
                Ok(dirent) => dirent,
                Err(e) => {
                    error!("entry {id}: {e}");
                    continue;
                }
            };
            let word = dirent.title().to_string();

            if let Some(target_id) = dirent.redirect_index {
                self.redirect_count += 1;
                let target = match self.archive.entry_by_id(target_id) {
                    Ok(target) => target.title().to_string(),
                    Err(e) => {
                        error!("redirect target of {word:?}: {e}");
                        continue;
                    }
                };
                let defi = format!("Redirect: <a href=\"bword://{target}\">{target}</a>");
                return Some(Ok(Entry::new_word(
                    vec![word],
                    defi,
                    Some(DefiFormat::Html),
                )));
            }
            if dirent.mime_id == MIME_LINKTARGET || dirent.mime_id == MIME_DELETED {
                continue;
            }

            let content = match self.archive.content(&dirent) {
                Ok(content) => content,
                Err(e) => {
                    error!("content of {word:?}: {e}");
                    continue;
                }
            };
            if content.is_empty() {
                self.empty_content_count += 1;
                continue;
            }

            let mimetype = match self.archive.mimetype(&dirent) {
                Some(mimetype) => mimetype.to_string(),
                None => {
                    // A broken MIME record still carries usable bytes;
                    // emit them as a resource and move on.
                    self.invalid_mime_count += 1;
                    return Some(Ok(Entry::new_data(word, content)));
                }
            };

            // Can be "text/html;raw=true".
            if mimetype.starts_with("text/html") {
                let defi = match String::from_utf8(content) {
                    Ok(defi) => defi,
                    Err(_) => {
                        error!("invalid utf-8 in html content of {word:?}");
                        continue;
                    }
                };
                let defi = defi.replace(" src=\"../I/", " src=\"./");
                return Some(Ok(Entry::new_word(
                    vec![word],
                    defi,
                    Some(DefiFormat::Html),
                )));
            }
            if mimetype == "text/plain" {
                let defi = match String::from_utf8(content) {
                    Ok(defi) => defi,
                    Err(_) => {
                        error!("invalid utf-8 in plain content of {word:?}");
                        continue;
                    }
                };
                return Some(Ok(Entry::new_word(
                    vec![word],
                    defi,
                    Some(DefiFormat::Plain),
                )));
            }

            if !RESOURCE_MIME_TYPES.contains(&mimetype.as_str()) {
                warn!("unrecognized mimetype {mimetype:?}");
            }
            if word.chars().count() > FILENAME_MAX {
                self.name_too_long_count += 1;
                continue;
            }
            if word.contains('|') {
                error!("resource title: {word}");
            }
            return Some(Ok(Entry::new_data(word, content)));
        }

        self.log_summary();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    enum TestDirent {
        Content {
            mime: u16,
            url: &'static str,
            title: &'static str,
            blob: u32,
        },
        Redirect {
            target: u32,
            url: &'static str,
            title: &'static str,
        },
    }

    /// Builds a single-cluster archive with uncompressed blobs.
    fn build_archive(mimes: &[&str], dirents: &[TestDirent], blobs: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];

        let mime_list_pos = out.len() as u64;
        for mime in mimes {
            out.extend_from_slice(mime.as_bytes());
            out.push(0);
        }
        out.push(0);

        let mut dirent_offsets = Vec::new();
        for dirent in dirents {
            dirent_offsets.push(out.len() as u64);
            match dirent {
                TestDirent::Content { mime, url, title, blob } => {
                    out.write_u16::<LittleEndian>(*mime).unwrap();
                    out.push(0); // parameter len
                    out.push(b'A'); // namespace
                    out.write_u32::<LittleEndian>(0).unwrap(); // revision
                    out.write_u32::<LittleEndian>(0).unwrap(); // cluster
                    out.write_u32::<LittleEndian>(*blob).unwrap();
                    out.extend_from_slice(url.as_bytes());
                    out.push(0);
                    out.extend_from_slice(title.as_bytes());
                    out.push(0);
                }
                TestDirent::Redirect { target, url, title } => {
                    out.write_u16::<LittleEndian>(MIME_REDIRECT).unwrap();
                    out.push(0);
                    out.push(b'A');
                    out.write_u32::<LittleEndian>(0).unwrap();
                    out.write_u32::<LittleEndian>(*target).unwrap();
                    out.extend_from_slice(url.as_bytes());
                    out.push(0);
                    out.extend_from_slice(title.as_bytes());
                    out.push(0);
                }
            }
        }

        let url_ptr_pos = out.len() as u64;
        for offset in &dirent_offsets {
            out.write_u64::<LittleEndian>(*offset).unwrap();
        }

        let cluster_ptr_pos = out.len() as u64;
        let cluster_pos = cluster_ptr_pos + 8;
        out.write_u64::<LittleEndian>(cluster_pos).unwrap();

        // Cluster: info byte (uncompressed), u32 blob offset table, data.
        out.push(0x01);
        let table_len = (blobs.len() + 1) * 4;
        let mut offset = table_len as u32;
        for blob in blobs {
            out.write_u32::<LittleEndian>(offset).unwrap();
            offset += blob.len() as u32;
        }
        out.write_u32::<LittleEndian>(offset).unwrap();
        for blob in blobs {
            out.extend_from_slice(blob);
        }

        let checksum_pos = out.len() as u64;

        let mut header = Cursor::new(&mut out[..HEADER_LEN]);
        header.write_u32::<LittleEndian>(ZIM_MAGIC).unwrap();
        header.write_u16::<LittleEndian>(6).unwrap();
        header.write_u16::<LittleEndian>(0).unwrap();
        header.write_all(&[0u8; 16]).unwrap(); // uuid
        header
            .write_u32::<LittleEndian>(dirents.len() as u32)
            .unwrap();
        header.write_u32::<LittleEndian>(1).unwrap(); // cluster count
        header.write_u64::<LittleEndian>(url_ptr_pos).unwrap();
        header.write_u64::<LittleEndian>(url_ptr_pos).unwrap(); // title ptr (unused)
        header.write_u64::<LittleEndian>(cluster_ptr_pos).unwrap();
        header.write_u64::<LittleEndian>(mime_list_pos).unwrap();
        header.write_u32::<LittleEndian>(u32::MAX).unwrap(); // main page
        header.write_u32::<LittleEndian>(u32::MAX).unwrap(); // layout page
        header.write_u64::<LittleEndian>(checksum_pos).unwrap();

        out
    }

    fn open_reader(bytes: &[u8]) -> (tempfile::TempDir, Reader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.zim");
        std::fs::write(&path, bytes).unwrap();
        (dir, Reader::open(&path).unwrap())
    }

    #[test]
    fn redirect_becomes_linking_article() {
        let bytes = build_archive(
            &["text/html"],
            &[
                TestDirent::Redirect {
                    target: 1,
                    url: "A/Foo",
                    title: "Foo",
                },
                TestDirent::Content {
                    mime: 0,
                    url: "A/Bar",
                    title: "Bar",
                    blob: 0,
                },
            ],
            &[b"<p>bar</p>"],
        );
        let (_dir, reader) = open_reader(&bytes);
        let entries: Vec<Entry> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            Entry::Word(w) => {
                assert_eq!(w.words, vec!["Foo"]);
                assert_eq!(w.defi, "Redirect: <a href=\"bword://Bar\">Bar</a>");
                assert_eq!(w.defi_format, Some(DefiFormat::Html));
            }
            _ => panic!("expected a word entry"),
        }
    }

    #[test]
    fn html_content_gets_src_rewrite() {
        let bytes = build_archive(
            &["text/html;raw=true"],
            &[TestDirent::Content {
                mime: 0,
                url: "A/Pic",
                title: "Pic",
                blob: 0,
            }],
            &[b"<img src=\"../I/x.png\">"],
        );
        let (_dir, reader) = open_reader(&bytes);
        let entries: Vec<Entry> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries[0].defi(), "<img src=\"./x.png\">");
    }

    #[test]
    fn plain_resource_and_empty_classification() {
        let bytes = build_archive(
            &["text/plain", "image/png", "application/weird"],
            &[
                TestDirent::Content {
                    mime: 0,
                    url: "A/txt",
                    title: "txt",
                    blob: 0,
                },
                TestDirent::Content {
                    mime: 1,
                    url: "I/icon.png",
                    title: "icon.png",
                    blob: 1,
                },
                TestDirent::Content {
                    mime: 0,
                    url: "A/empty",
                    title: "empty",
                    blob: 2,
                },
                TestDirent::Content {
                    mime: 2,
                    url: "A/blob",
                    title: "blob.bin",
                    blob: 3,
                },
            ],
            &[b"plain text", b"\x89PNG", b"", b"data"],
        );
        let (_dir, reader) = open_reader(&bytes);
        let entries: Vec<Entry> = reader.map(|e| e.unwrap()).collect();
        // The empty-content entry disappears.
        assert_eq!(entries.len(), 3);
        match &entries[0] {
            Entry::Word(w) => {
                assert_eq!(w.defi, "plain text");
                assert_eq!(w.defi_format, Some(DefiFormat::Plain));
            }
            _ => panic!("expected a word entry"),
        }
        match &entries[1] {
            Entry::Data(d) => {
                assert_eq!(d.name, "icon.png");
                assert_eq!(d.data, b"\x89PNG");
            }
            _ => panic!("expected a data entry"),
        }
        // Unknown mimetype is logged but still emitted as a resource.
        assert!(matches!(&entries[2], Entry::Data(d) if d.name == "blob.bin"));
    }

    #[test]
    fn title_falls_back_to_url() {
        let bytes = build_archive(
            &["text/plain"],
            &[TestDirent::Content {
                mime: 0,
                url: "A/word",
                title: "",
                blob: 0,
            }],
            &[b"defi"],
        );
        let (_dir, reader) = open_reader(&bytes);
        let entries: Vec<Entry> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries[0].first_word(), "A/word");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.zim");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(
            Archive::open(&path),
            Err(ZimError::InvalidMagic)
        ));
    }
}
