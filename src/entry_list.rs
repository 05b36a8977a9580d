//! A disk-backed, sortable list of glossary entries.
//!
//! Formats like StarDict require the output sorted by a collation the input
//! almost never arrives in, and glossaries can be far larger than memory.
//! `EntryList` accepts entries in any order with O(1) appends, spills them
//! to a temp directory, and hands them back in key order through a single
//! streaming pass: appended entries are cut into bounded sorted runs at
//! `sort()` time and the runs are k-way merged with a heap on iteration.
//!
//! The list moves through strict phases (building, sorted, iterating) and
//! rejects calls that arrive out of phase.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::entry::{DefiFormat, Entry, RawEntry};
use crate::error::{Error, Result};

/// Entries held in memory before spilling to disk, and the size of each
/// sorted run.
pub const DEFAULT_RUN_SIZE: usize = 32 * 1024;

/// One sortable column value derived from an entry's headword list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SortValue {
    Number(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// A named column of a sort key: the extractor derives one [`SortValue`]
/// from the headword list.
pub struct SortColumn {
    pub name: &'static str,
    pub extract: fn(&[String]) -> SortValue,
}

/// An ordered list of sort columns, compared left to right.
pub struct NamedSortKey {
    pub name: &'static str,
    pub columns: Vec<SortColumn>,
}

/// The StarDict collation as a named key: ASCII-lowercased first headword,
/// then the raw headword as tiebreak.
pub fn stardict_sort_key() -> NamedSortKey {
    NamedSortKey {
        name: "stardict",
        columns: vec![
            SortColumn {
                name: "wordlower",
                extract: |words| {
                    SortValue::Bytes(
                        words
                            .first()
                            .map(|w| w.to_ascii_lowercase().into_bytes())
                            .unwrap_or_default(),
                    )
                },
            },
            SortColumn {
                name: "word",
                extract: |words| {
                    SortValue::Bytes(
                        words
                            .first()
                            .map(|w| w.clone().into_bytes())
                            .unwrap_or_default(),
                    )
                },
            },
        ],
    }
}

/// On-disk record: sort key columns, insertion sequence, raw entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    key: Vec<SortValue>,
    seq: u64,
    raw: RawEntry,
}

fn cmp_frames(a: &Frame, b: &Frame, reverse: bool) -> Ordering {
    let by_key = if reverse {
        b.key.cmp(&a.key)
    } else {
        a.key.cmp(&b.key)
    };
    // Insertion order always breaks ties, so equal keys stay stable even
    // in descending order.
    by_key.then_with(|| a.seq.cmp(&b.seq))
}

pub struct EntryList {
    dir: Option<TempDir>,
    dir_path: PathBuf,
    spill_path: PathBuf,
    spill: Option<BufWriter<File>>,
    mem: Vec<Frame>,
    runs: Vec<PathBuf>,
    key: Option<NamedSortKey>,
    run_size: usize,
    persist: bool,
    len: usize,
    sorted: bool,
    reverse: bool,
    default_format: Option<DefiFormat>,
}

impl EntryList {
    /// Creates an empty list backed by a fresh temp directory. `run_size`
    /// bounds how many entries are held in memory at once; `persist` keeps
    /// the backing directory on close instead of deleting it.
    pub fn new(run_size: usize, persist: bool) -> Result<EntryList> {
        let dir = TempDir::new()?;
        let dir_path = dir.path().to_path_buf();
        let spill_path = dir_path.join("spill.bin");
        Ok(EntryList {
            dir: Some(dir),
            dir_path,
            spill_path,
            spill: None,
            mem: Vec::new(),
            runs: Vec::new(),
            key: None,
            run_size: run_size.max(1),
            persist,
            len: 0,
            sorted: false,
            reverse: false,
            default_format: None,
        })
    }

    /// The backing directory.
    pub fn path(&self) -> &Path {
        &self.dir_path
    }

    /// Format assigned to iterated entries that were appended without one.
    pub fn set_default_format(&mut self, format: Option<DefiFormat>) {
        self.default_format = format;
    }

    /// Installs the sort key. May be called once, before `sort()`.
    pub fn set_sort_key(&mut self, key: NamedSortKey) -> Result<()> {
        if self.key.is_some() || self.sorted {
            return Err(Error::SetSortKeyTwice);
        }
        self.key = Some(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one entry. Amortized O(1): full memory buffers are flushed
    /// to an append-only spill file in insertion order.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        if self.sorted {
            return Err(Error::AppendAfterSort);
        }
        self.mem.push(Frame {
            key: Vec::new(),
            seq: self.len as u64,
            raw: entry.to_raw(),
        });
        self.len += 1;
        if self.mem.len() >= self.run_size {
            self.flush_mem()?;
        }
        Ok(())
    }

    fn flush_mem(&mut self) -> Result<()> {
        if self.spill.is_none() {
            self.spill = Some(BufWriter::new(File::create(&self.spill_path)?));
        }
        if let Some(w) = self.spill.as_mut() {
            for frame in self.mem.drain(..) {
                write_frame(w, &frame)?;
            }
        }
        Ok(())
    }

    fn compute_key(&self, raw: &RawEntry) -> Vec<SortValue> {
        let key = match &self.key {
            Some(k) => k,
            None => return Vec::new(),
        };
        let data_words;
        let words: &[String] = match raw {
            RawEntry::Word { words, .. } => words,
            RawEntry::Data { name, .. } => {
                data_words = [name.clone()];
                &data_words
            }
        };
        key.columns.iter().map(|col| (col.extract)(words)).collect()
    }

    /// Sorts the list. May be called once, after all appends. The appended
    /// stream is cut into runs of at most `run_size` entries, each sorted
    /// in memory and written to its own file.
    pub fn sort(&mut self, reverse: bool) -> Result<()> {
        if self.sorted {
            return Err(Error::SortTwice);
        }
        self.reverse = reverse;

        // Frames arrive in insertion order: spilled buffers first, then
        // whatever is still in memory.
        let spilled = match self.spill.take() {
            Some(w) => {
                w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                Some(FrameReader::open(&self.spill_path)?)
            }
            None => None,
        };

        let mut chunk: Vec<Frame> = Vec::new();
        if let Some(mut reader) = spilled {
            while let Some(mut frame) = reader.next_frame()? {
                frame.key = self.compute_key(&frame.raw);
                chunk.push(frame);
                if chunk.len() >= self.run_size {
                    self.write_run(&mut chunk)?;
                }
            }
        }
        for mut frame in std::mem::take(&mut self.mem) {
            frame.key = self.compute_key(&frame.raw);
            chunk.push(frame);
            if chunk.len() >= self.run_size {
                self.write_run(&mut chunk)?;
            }
        }
        if !chunk.is_empty() {
            self.write_run(&mut chunk)?;
        }

        if self.spill_path.exists() {
            std::fs::remove_file(&self.spill_path)?;
        }
        debug!(
            "sorted {} entries into {} runs (reverse={})",
            self.len,
            self.runs.len(),
            reverse
        );
        self.sorted = true;
        Ok(())
    }

    fn write_run(&mut self, chunk: &mut Vec<Frame>) -> Result<()> {
        let reverse = self.reverse;
        chunk.sort_by(|a, b| cmp_frames(a, b, reverse));
        let path = self.dir_path.join(format!("run-{:05}.bin", self.runs.len()));
        let mut w = BufWriter::new(File::create(&path)?);
        for frame in chunk.drain(..) {
            write_frame(&mut w, &frame)?;
        }
        w.flush()?;
        self.runs.push(path);
        Ok(())
    }

    /// A single ordered pass over the entries: ascending by
    /// `(key, insertion index)`, or descending by key (insertion index
    /// still ascending within equal keys) after `sort(true)`.
    ///
    /// Without a sort key the list may be iterated unsorted, in insertion
    /// order; with a key installed, `sort()` must run first.
    pub fn iter(&mut self) -> Result<EntryIter> {
        let mut sources: Vec<RunSource> = Vec::new();
        if self.sorted {
            for path in &self.runs {
                sources.push(RunSource::File(FrameReader::open(path)?));
            }
        } else {
            if self.key.is_some() {
                return Err(Error::IterateBeforeSort);
            }
            if let Some(w) = self.spill.as_mut() {
                w.flush()?;
                sources.push(RunSource::File(FrameReader::open(&self.spill_path)?));
            }
            sources.push(RunSource::Mem(self.mem.clone().into_iter()));
        }
        EntryIter::new(sources, self.reverse, self.default_format)
    }

    /// Releases the backing directory. Without the `persist` flag the
    /// directory and all run files are deleted.
    pub fn close(mut self) -> Result<()> {
        self.spill = None;
        if let Some(dir) = self.dir.take() {
            if self.persist {
                let _ = dir.into_path();
            } else {
                dir.close()?;
            }
        }
        Ok(())
    }
}

fn write_frame(w: &mut impl Write, frame: &Frame) -> Result<()> {
    let body = serde_json::to_vec(frame)?;
    w.write_u32::<LittleEndian>(body.len() as u32)?;
    w.write_all(&body)?;
    Ok(())
}

struct FrameReader {
    inner: BufReader<File>,
}

impl FrameReader {
    fn open(path: &Path) -> Result<FrameReader> {
        Ok(FrameReader {
            inner: BufReader::new(File::open(path)?),
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let len = match self.inner.read_u32::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }
}

enum RunSource {
    File(FrameReader),
    Mem(std::vec::IntoIter<Frame>),
}

impl RunSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            RunSource::File(r) => r.next_frame(),
            RunSource::Mem(it) => Ok(it.next()),
        }
    }
}

struct HeapItem {
    frame: Frame,
    source: usize,
    reverse: bool,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.frame.seq == other.frame.seq && self.source == other.source
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the next frame in output
        // order pops first.
        cmp_frames(&other.frame, &self.frame, self.reverse)
    }
}

/// Streaming k-way merge over the sorted runs.
pub struct EntryIter {
    sources: Vec<RunSource>,
    heap: BinaryHeap<HeapItem>,
    reverse: bool,
    default_format: Option<DefiFormat>,
}

impl EntryIter {
    fn new(
        mut sources: Vec<RunSource>,
        reverse: bool,
        default_format: Option<DefiFormat>,
    ) -> Result<EntryIter> {
        let mut heap = BinaryHeap::new();
        for (i, source) in sources.iter_mut().enumerate() {
            if let Some(frame) = source.next_frame()? {
                heap.push(HeapItem {
                    frame,
                    source: i,
                    reverse,
                });
            }
        }
        Ok(EntryIter {
            sources,
            heap,
            reverse,
            default_format,
        })
    }
}

impl Iterator for EntryIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        let top = self.heap.pop()?;
        match self.sources[top.source].next_frame() {
            Ok(Some(frame)) => self.heap.push(HeapItem {
                frame,
                source: top.source,
                reverse: self.reverse,
            }),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        Some(Ok(Entry::from_raw(top.frame.raw, self.default_format)))
    }
}
