//! End-to-end pipeline tests: reader -> sortable entry list -> StarDict
//! writer -> StarDict reader.

use std::fs;
use std::io::Write;
use std::path::Path;

use glosconv::entry_list::{stardict_sort_key, EntryList};
use glosconv::stardict::{Reader, ReaderOptions, TypeSequence, Writer, WriterOptions};
use glosconv::{goldbook, DefiFormat, Entry, GlossaryInfo};

use tempfile::tempdir;

fn writer_options() -> WriterOptions {
    WriterOptions {
        dictzip: false,
        ..WriterOptions::default()
    }
}

fn word(words: &[&str], defi: &str, format: DefiFormat) -> Entry {
    Entry::new_word(
        words.iter().map(|w| w.to_string()).collect(),
        defi.to_string(),
        Some(format),
    )
}

fn convert(entries: Vec<Entry>, info: GlossaryInfo, base: &Path, options: WriterOptions) {
    let mut list = EntryList::new(4, false).unwrap();
    list.set_sort_key(stardict_sort_key()).unwrap();
    for entry in entries {
        list.append(entry).unwrap();
    }
    list.sort(false).unwrap();

    let mut writer = Writer::new(info, options);
    writer.open(base).unwrap();
    for entry in list.iter().unwrap() {
        writer.feed(entry.unwrap()).unwrap();
    }
    writer.finish().unwrap();
    list.close().unwrap();
}

#[test]
fn unsorted_input_comes_out_in_collation_order() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("out").join("dict");
    let mut info = GlossaryInfo::new();
    info.set("name", "Fruit");

    convert(
        vec![
            word(&["Quince"], "q", DefiFormat::Plain),
            word(&["apple"], "a", DefiFormat::Plain),
            word(&["Banana"], "b", DefiFormat::Plain),
            word(&["cherry"], "c", DefiFormat::Plain),
            word(&["date"], "d", DefiFormat::Plain),
        ],
        info,
        &base,
        writer_options(),
    );

    let reader = Reader::open(&base, ReaderOptions::default()).unwrap();
    let words: Vec<String> = reader
        .map(|e| e.unwrap().first_word().to_string())
        .collect();
    assert_eq!(words, vec!["apple", "Banana", "cherry", "date", "Quince"]);
}

#[test]
fn goldbook_to_stardict() {
    let dir = tempdir().unwrap();
    let xml_path = dir.path().join("gold.xml");
    let mut f = fs::File::create(&xml_path).unwrap();
    write!(
        f,
        r#"<?xml version="1.0"?>
<vocabulary>
  <title>Tiny Gold</title>
  <publisher>IUPAC</publisher>
  <isbn>1</isbn>
  <doi>2</doi>
  <accessdate>2023</accessdate>
  <entries>
    <entry id="1"><code>Z</code><term>zwitterion</term><definition>dipolar ion</definition></entry>
    <entry id="2"><code>A</code><term>anion</term><definition>negative ion</definition><replacedby>c.Z</replacedby></entry>
  </entries>
</vocabulary>"#
    )
    .unwrap();
    drop(f);

    let reader = goldbook::Reader::open(&xml_path).unwrap();
    let info = reader.info().clone();
    assert_eq!(info.get("name"), Some("Tiny Gold"));

    let base = dir.path().join("out").join("gold");
    let mut list = EntryList::new(64, false).unwrap();
    list.set_sort_key(stardict_sort_key()).unwrap();
    for entry in reader.entries().unwrap() {
        list.append(entry.unwrap()).unwrap();
    }
    list.sort(false).unwrap();

    let options = WriterOptions {
        sametypesequence: TypeSequence::Fixed(DefiFormat::Html),
        ..writer_options()
    };
    let mut writer = Writer::new(info, options);
    writer.open(&base).unwrap();
    for entry in list.iter().unwrap() {
        writer.feed(entry.unwrap()).unwrap();
    }
    writer.finish().unwrap();

    let ifo = fs::read_to_string(dir.path().join("out").join("gold.ifo")).unwrap();
    assert!(ifo.contains("bookname=Tiny Gold"));
    assert!(ifo.contains("wordcount=2"));

    let back = Reader::open(&base, ReaderOptions::default()).unwrap();
    let entries: Vec<Entry> = back.map(|e| e.unwrap()).collect();
    assert_eq!(entries[0].first_word(), "anion");
    // The forward reference resolved during phase 1.
    assert!(entries[0]
        .defi()
        .contains(r#"Replaced by: <a href="bword://zwitterion">zwitterion</a>"#));
    assert_eq!(entries[1].first_word(), "zwitterion");
}

#[test]
fn spilled_list_and_merge_syns_pipeline() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    let mut info = GlossaryInfo::new();
    info.set("name", "Merged");

    let mut entries = Vec::new();
    for i in 0..20 {
        entries.push(word(
            &[&format!("word{:02}", 19 - i), &format!("alias{:02}", 19 - i)],
            &format!("defi {i}"),
            DefiFormat::Plain,
        ));
    }
    let options = WriterOptions {
        sametypesequence: TypeSequence::Fixed(DefiFormat::Plain),
        merge_syns: true,
        ..writer_options()
    };
    convert(entries, info, &base, options);

    let mut idx_path = base.as_os_str().to_os_string();
    idx_path.push(".idx");
    let idx = fs::read(&idx_path).unwrap();
    // One record per headword and per alias.
    let record_count = idx.iter().filter(|&&b| b == 0).count();
    assert_eq!(record_count, 40);

    let reader = Reader::open(&base, ReaderOptions::default()).unwrap();
    assert_eq!(reader.len(), 40);
    let entries: Vec<Entry> = reader.map(|e| e.unwrap()).collect();
    assert_eq!(entries.len(), 40);
    // Aliases sort before their headwords and share the definitions.
    assert_eq!(entries[0].first_word(), "alias00");
    assert_eq!(entries[0].defi(), "defi 19");
}
