//! IUPAC Goldbook reader.
//!
//! The source is one large XML document: a metadata header followed by an
//! `<entries>` block whose entries cross-reference each other by code,
//! including codes declared later in the file. The file is therefore
//! stream-parsed twice: `open` builds the complete `code -> term` map (and
//! captures the header metadata), and iteration re-parses the file to emit
//! entries with every `replacedby`/`related` link already resolvable.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::warn;
use quick_xml::events::{BytesStart, BytesText, Event};
use xz2::read::XzDecoder;

use crate::entry::{DefiFormat, Entry, GlossaryInfo, WordEntry};
use crate::error::Result;

type XmlReader = quick_xml::Reader<Box<dyn BufRead>>;

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    Ok(match ext {
        "gz" => Box::new(BufReader::new(GzDecoder::new(file))),
        "xz" => Box::new(BufReader::new(XzDecoder::new(file))),
        _ => Box::new(BufReader::new(file)),
    })
}

fn text_of(t: &BytesText) -> String {
    match t.unescape() {
        Ok(cow) => cow.into_owned(),
        // Unknown entity references: fall back to the raw bytes.
        Err(_) => String::from_utf8_lossy(&t.clone().into_inner()).into_owned(),
    }
}

fn push_opt(slot: &mut Option<String>, text: &str) {
    slot.get_or_insert_with(String::new).push_str(text);
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn push_open_tag(out: &mut String, e: &BytesStart, self_closing: bool) {
    out.push('<');
    out.push_str(&String::from_utf8_lossy(e.name().as_ref()));
    for attr in e.attributes().flatten() {
        out.push(' ');
        out.push_str(&String::from_utf8_lossy(attr.key.as_ref()));
        out.push_str("=\"");
        out.push_str(&String::from_utf8_lossy(&attr.value));
        out.push('"');
    }
    if self_closing {
        out.push('/');
    }
    out.push('>');
}

/// Collects the inner markup of the element whose start tag was just read,
/// consuming events through the matching end tag.
fn read_inner_xml(xml: &mut XmlReader, tag: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => {
                depth += 1;
                push_open_tag(&mut out, &e, false);
            }
            Event::Empty(e) => push_open_tag(&mut out, &e, true),
            Event::Text(t) => out.push_str(&text_of(&t)),
            Event::End(e) => {
                if depth == 0 && e.name().as_ref() == tag {
                    break;
                }
                depth = depth.saturating_sub(1);
                out.push_str("</");
                out.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                out.push('>');
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// A term is the inner markup of `<term>` with italics dropped.
fn clean_term(inner: &str) -> String {
    inner.replace("<i>", "").replace("</i>", "").trim().to_string()
}

pub struct Reader {
    path: PathBuf,
    info: GlossaryInfo,
    term_by_code: HashMap<String, String>,
    file_size: Option<u64>,
}

impl Reader {
    /// Phase 1: streams the whole file once, capturing the header metadata
    /// and the complete `code -> term` map before any entry is emitted.
    pub fn open(path: &Path) -> Result<Reader> {
        let file_size = match path.extension().and_then(|e| e.to_str()) {
            Some("gz") | Some("xz") => None,
            _ => Some(fs::metadata(path)?.len()),
        };

        let mut xml: XmlReader = quick_xml::Reader::from_reader(open_input(path)?);
        let mut buf = Vec::new();

        let mut info = GlossaryInfo::new();
        let mut term_by_code = HashMap::new();

        let mut in_entries = false;
        let mut header_field: Option<&'static str> = None;
        let mut header_text = String::new();
        // Entry nesting depth: sub-entries appear inside definitions.
        let mut nesting = 0usize;
        // Depth below the current entry, so only direct children match.
        let mut elem_depth = 0usize;
        let mut in_code = false;
        let mut cur_code: Option<String> = None;
        let mut cur_term: Option<String> = None;

        loop {
            buf.clear();
            match xml.read_event_into(&mut buf)? {
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    if nesting > 0 {
                        match name.as_slice() {
                            b"entry" => {
                                nesting += 1;
                                elem_depth += 1;
                            }
                            b"term" if nesting == 1
                                && elem_depth == 0
                                && cur_term.is_none() =>
                            {
                                let inner = read_inner_xml(&mut xml, b"term")?;
                                cur_term = Some(clean_term(&inner));
                            }
                            b"code" if nesting == 1 && elem_depth == 0 => {
                                in_code = true;
                                elem_depth += 1;
                            }
                            _ => elem_depth += 1,
                        }
                    } else if in_entries {
                        if name == b"entry" {
                            nesting = 1;
                            elem_depth = 0;
                            in_code = false;
                            cur_code = None;
                            cur_term = None;
                        }
                    } else {
                        match name.as_slice() {
                            b"entries" => in_entries = true,
                            b"title" => header_field = Some("name"),
                            b"publisher" => header_field = Some("publisher"),
                            b"isbn" => header_field = Some("isbn"),
                            b"doi" => header_field = Some("doi"),
                            b"accessdate" => header_field = Some("creationTime"),
                            _ => {}
                        }
                        header_text.clear();
                    }
                }
                Event::Text(t) => {
                    if in_code {
                        push_opt(&mut cur_code, &text_of(&t));
                    } else if header_field.is_some() {
                        header_text.push_str(&text_of(&t));
                    }
                }
                Event::End(e) => {
                    let name = e.name().as_ref().to_vec();
                    if nesting > 0 {
                        if name == b"code" {
                            in_code = false;
                        }
                        if name == b"entry" && elem_depth == 0 {
                            if let (Some(code), Some(term)) = (&cur_code, &cur_term) {
                                term_by_code.insert(code.trim().to_string(), term.clone());
                            }
                            nesting -= 1;
                        } else {
                            elem_depth = elem_depth.saturating_sub(1);
                            if name == b"entry" {
                                nesting = nesting.saturating_sub(1);
                            }
                        }
                    } else if let Some(key) = header_field.take() {
                        info.set(key, header_text.trim());
                    } else if name == b"entries" {
                        // Everything after the entries block is closing
                        // markup; phase 1 is done.
                        break;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Reader {
            path: path.to_path_buf(),
            info,
            term_by_code,
            file_size,
        })
    }

    pub fn info(&self) -> &GlossaryInfo {
        &self.info
    }

    /// The entry count is unknown until the emit pass completes.
    pub fn len(&self) -> usize {
        0
    }

    pub fn term_by_code(&self, code: &str) -> Option<&str> {
        self.term_by_code.get(code).map(String::as_str)
    }

    /// Phase 2: re-opens the file and emits one entry per `<entry>` that
    /// carries a `<term>`.
    pub fn entries(&self) -> Result<EntryIter<'_>> {
        Ok(EntryIter {
            reader: self,
            xml: quick_xml::Reader::from_reader(open_input(&self.path)?),
            buf: Vec::new(),
            in_entry: false,
            fields: EntryFields::default(),
            done: false,
        })
    }
}

/// Everything captured from one `<entry>` element during the emit pass.
#[derive(Default)]
struct EntryFields {
    id: Option<String>,
    code: Option<String>,
    term: Option<String>,
    ident_term: Option<String>,
    ident_synonym: Option<String>,
    definition: Option<String>,
    /// Set once `<definition>` has a child element; only text before the
    /// first child belongs to the definition itself.
    definition_done: bool,
    definition_items: Vec<String>,
    replacedby: Option<String>,
    related: Vec<String>,
    lastupdated: Option<String>,
    url: Option<String>,
    stack: Vec<String>,
    cur_item: String,
}

impl EntryFields {
    fn on_start(&mut self, name: &str) {
        if self.stack.last().map(String::as_str) == Some("definition") {
            self.definition_done = true;
        }
        if name == "entry" {
            self.cur_item.clear();
        }
        self.stack.push(name.to_string());
    }

    fn on_empty(&mut self) {
        if self.stack.last().map(String::as_str) == Some("definition") {
            self.definition_done = true;
        }
    }

    fn on_text(&mut self, text: &str) {
        let path: Vec<&str> = self.stack.iter().map(String::as_str).collect();
        match path.as_slice() {
            ["code"] => push_opt(&mut self.code, text),
            ["identifiers", "term"] => push_opt(&mut self.ident_term, text),
            ["identifiers", "synonym"] => push_opt(&mut self.ident_synonym, text),
            ["definition"] if !self.definition_done => {
                push_opt(&mut self.definition, text)
            }
            ["definition", "entry"] | ["related", "entry"] => {
                self.cur_item.push_str(text)
            }
            ["replacedby"] => push_opt(&mut self.replacedby, text),
            ["lastupdated"] => push_opt(&mut self.lastupdated, text),
            ["url"] => push_opt(&mut self.url, text),
            _ => {}
        }
    }

    /// Returns true when the closing tag ends the entry itself.
    fn on_end(&mut self, name: &str) -> bool {
        if self.stack.is_empty() {
            return name == "entry";
        }
        let path: Vec<&str> = self.stack.iter().map(String::as_str).collect();
        match path.as_slice() {
            ["definition", "entry"] => {
                if !self.cur_item.is_empty() {
                    self.definition_items.push(self.cur_item.clone());
                }
            }
            ["related", "entry"] => {
                if !self.cur_item.is_empty() {
                    self.related.push(self.cur_item.clone());
                }
            }
            _ => {}
        }
        self.stack.pop();
        false
    }
}

pub struct EntryIter<'a> {
    reader: &'a Reader,
    xml: XmlReader,
    buf: Vec<u8>,
    in_entry: bool,
    fields: EntryFields,
    done: bool,
}

fn build_entry(
    term_by_code: &HashMap<String, String>,
    fields: EntryFields,
    byte_progress: Option<(u64, u64)>,
) -> Option<Entry> {
    let code = fields.code?.trim().to_string();
    let term = match &fields.term {
        Some(term) => term.clone(),
        None => {
            warn!("no term, code={code}, id={:?}", fields.id);
            return None;
        }
    };

    let mut words = Vec::new();
    if !term.is_empty() {
        words.push(term.clone());
    }
    if !code.is_empty() {
        words.push(code);
    }
    if let Some(ident_term) = fields.ident_term {
        if !ident_term.is_empty() {
            words.push(ident_term);
        }
    }
    if let Some(synonym) = fields.ident_synonym {
        if !synonym.is_empty() {
            words.push(synonym);
        }
    }

    let mut parts: Vec<String> = Vec::new();
    if let Some(definition) = fields.definition {
        if !definition.is_empty() {
            parts.push(definition);
        }
    }
    if !fields.definition_items.is_empty() {
        let mut list = String::from("<ol>");
        for item in &fields.definition_items {
            list.push_str("<li>");
            list.push_str(&html_escape(item));
            list.push_str("</li>");
        }
        list.push_str("</ol>");
        parts.push(list);
    }
    if let Some(replacedby) = fields.replacedby {
        let replacedby = replacedby.trim();
        let code = replacedby.rsplit('.').next().unwrap_or(replacedby);
        let target = match term_by_code.get(code) {
            Some(target) => target.clone(),
            None => {
                warn!("{term}: replacedby={replacedby}");
                code.to_string()
            }
        };
        parts.push(format!(
            "Replaced by: <a href=\"bword://{target}\">{target}</a>"
        ));
    }
    if !fields.related.is_empty() {
        let links: Vec<String> = fields
            .related
            .iter()
            .map(|url| {
                let url = url.trim();
                let code = url.rsplit('/').next().unwrap_or(url);
                let target = match term_by_code.get(code) {
                    Some(target) if !target.is_empty() => target.clone(),
                    _ => {
                        warn!("{term}: related={url}");
                        code.to_string()
                    }
                };
                format!("<a href=\"bword://{target}\">{target}</a>")
            })
            .collect();
        parts.push(format!("Related: {}", links.join(", ")));
    }
    if let Some(lastupdated) = fields.lastupdated {
        parts.push(format!("Last updated: {}", lastupdated.trim()));
    }
    if let Some(url) = fields.url {
        parts.push(format!("<a href=\"{}\">More info.</a>", url.trim()));
    }

    // A blank spacer line between the definition and the trailing
    // metadata parts.
    if parts.len() > 1 {
        parts.insert(1, String::new());
    }
    let defi = parts.join("<br/>");

    Some(Entry::Word(WordEntry {
        words,
        defi,
        defi_format: Some(DefiFormat::Html),
        byte_progress,
    }))
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        if self.done {
            return None;
        }
        loop {
            self.buf.clear();
            let event = match self.xml.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            match event {
                Event::Eof => {
                    self.done = true;
                    return None;
                }
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if !self.in_entry {
                        if name == "entry" {
                            self.in_entry = true;
                            self.fields = EntryFields::default();
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"id" {
                                    self.fields.id =
                                        Some(String::from_utf8_lossy(&attr.value).into_owned());
                                }
                            }
                        }
                        continue;
                    }
                    if self.fields.stack.is_empty()
                        && name == "term"
                        && self.fields.term.is_none()
                    {
                        drop(e);
                        match read_inner_xml(&mut self.xml, b"term") {
                            Ok(inner) => self.fields.term = Some(clean_term(&inner)),
                            Err(err) => {
                                self.done = true;
                                return Some(Err(err));
                            }
                        }
                        continue;
                    }
                    self.fields.on_start(&name);
                }
                Event::Empty(_) => {
                    if self.in_entry {
                        self.fields.on_empty();
                    }
                }
                Event::Text(t) => {
                    if self.in_entry {
                        let text = text_of(&t);
                        self.fields.on_text(&text);
                    }
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    drop(e);
                    if !self.in_entry {
                        continue;
                    }
                    if self.fields.on_end(&name) {
                        self.in_entry = false;
                        let fields = std::mem::take(&mut self.fields);
                        let progress = self
                            .reader
                            .file_size
                            .map(|size| (self.xml.buffer_position() as u64, size));
                        if let Some(entry) =
                            build_entry(&self.reader.term_by_code, fields, progress)
                        {
                            return Some(Ok(entry));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
