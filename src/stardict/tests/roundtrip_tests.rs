use std::fs;
use std::path::Path;

use crate::entry::{DefiFormat, Entry};
use crate::stardict::{
    ext_path, Reader, ReaderOptions, TypeSequence, Writer, WriterOptions,
};
use crate::text_utils::{stardict_cmp, uint32_from_bytes};

use tempfile::tempdir;

fn options(sametypesequence: TypeSequence) -> WriterOptions {
    WriterOptions {
        sametypesequence,
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

fn write_all(base: &Path, options: WriterOptions, entries: Vec<Entry>) {
    let mut info = crate::entry::GlossaryInfo::new();
    info.set("name", "Round Trip");
    let mut writer = Writer::new(info, options);
    writer.open(base).unwrap();
    for entry in entries {
        writer.feed(entry).unwrap();
    }
    writer.finish().unwrap();
}

fn read_all(base: &Path) -> Vec<Entry> {
    Reader::open(base, ReaderOptions::default())
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
}

fn idx_words(base: &Path) -> Vec<Vec<u8>> {
    let bytes = fs::read(ext_path(base, ".idx")).unwrap();
    let mut words = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let nul = bytes[pos..].iter().position(|&b| b == 0).unwrap() + pos;
        words.push(bytes[pos..nul].to_vec());
        pos = nul + 9;
    }
    words
}

#[test]
fn compact_html_round_trip() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Fixed(DefiFormat::Html)),
        vec![
            word(&["cat"], "<b>feline</b>", DefiFormat::Html),
            word(&["dog"], "<b>canine</b>", DefiFormat::Html),
        ],
    );

    let entries = read_all(&base);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].first_word(), "cat");
    assert_eq!(entries[0].defi(), "<b>feline</b>");
    assert_eq!(entries[1].first_word(), "dog");
    assert_eq!(entries[1].defi(), "<b>canine</b>");
}

#[test]
fn synonyms_rematerialize_from_syn_file() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Fixed(DefiFormat::Plain)),
        vec![
            word(&["colour", "color"], "a hue", DefiFormat::Plain),
            word(&["dog"], "a canine", DefiFormat::Plain),
        ],
    );

    let entries = read_all(&base);
    assert_eq!(entries.len(), 2);
    match &entries[0] {
        Entry::Word(w) => assert_eq!(w.words, vec!["colour", "color"]),
        _ => panic!("expected a word entry"),
    }
}

#[test]
fn synonyms_follow_their_entry_after_index_sorting() {
    // Fed out of collation order: sorting the index moves "zebra" behind
    // "apple", and the .syn record has to follow it there.
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Fixed(DefiFormat::Plain)),
        vec![
            word(&["zebra", "stripes"], "striped", DefiFormat::Plain),
            word(&["apple"], "fruit", DefiFormat::Plain),
        ],
    );

    let entries = read_all(&base);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].first_word(), "apple");
    match &entries[1] {
        Entry::Word(w) => assert_eq!(w.words, vec!["zebra", "stripes"]),
        _ => panic!("expected a word entry"),
    }
}

#[test]
fn general_layout_preserves_per_entry_formats() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Disabled),
        vec![
            word(&["plain"], "just text", DefiFormat::Plain),
            word(&["rich"], "<b>markup</b>", DefiFormat::Html),
        ],
    );

    let entries = read_all(&base);
    let formats: Vec<Option<DefiFormat>> = entries
        .iter()
        .map(|e| match e {
            Entry::Word(w) => w.defi_format,
            _ => None,
        })
        .collect();
    assert_eq!(
        formats,
        vec![Some(DefiFormat::Plain), Some(DefiFormat::Html)]
    );
    assert_eq!(entries[0].defi(), "just text");
    assert_eq!(entries[1].defi(), "<b>markup</b>");
}

#[test]
fn idx_is_sorted_and_resorting_is_idempotent() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Fixed(DefiFormat::Plain)),
        vec![
            word(&["Zebra"], "z", DefiFormat::Plain),
            word(&["apple"], "a", DefiFormat::Plain),
            word(&["Apple"], "A", DefiFormat::Plain),
            word(&["banana"], "b", DefiFormat::Plain),
        ],
    );

    let words = idx_words(&base);
    let mut resorted = words.clone();
    resorted.sort_by(|a, b| stardict_cmp(a, b));
    assert_eq!(words, resorted);
    assert_eq!(
        words,
        vec![
            b"Apple".to_vec(),
            b"apple".to_vec(),
            b"banana".to_vec(),
            b"Zebra".to_vec(),
        ]
    );
}

#[test]
fn every_index_record_stays_inside_the_dict_file() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Disabled),
        vec![
            word(&["a"], "first", DefiFormat::Plain),
            word(&["b"], "<i>second</i>", DefiFormat::Html),
            word(&["c"], "third", DefiFormat::Plain),
        ],
    );

    let dict_size = fs::metadata(ext_path(&base, ".dict")).unwrap().len();
    let bytes = fs::read(ext_path(&base, ".idx")).unwrap();
    let mut pos = 0;
    let mut checked = 0;
    while pos < bytes.len() {
        let nul = bytes[pos..].iter().position(|&b| b == 0).unwrap() + pos;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[nul + 1..nul + 5]);
        let offset = uint32_from_bytes(buf) as u64;
        buf.copy_from_slice(&bytes[nul + 5..nul + 9]);
        let size = uint32_from_bytes(buf) as u64;
        assert!(offset + size <= dict_size);
        pos = nul + 9;
        checked += 1;
    }
    assert_eq!(checked, 3);
}

#[test]
fn merged_synonyms_read_back_as_separate_records() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    let mut opts = options(TypeSequence::Fixed(DefiFormat::Plain));
    opts.merge_syns = true;
    write_all(
        &base,
        opts,
        vec![word(&["colour", "color"], "a hue", DefiFormat::Plain)],
    );

    // No .syn file; both index records decode to the shared definition.
    assert!(!ext_path(&base, ".syn").exists());
    let entries = read_all(&base);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.defi() == "a hue"));
}

#[test]
fn resources_round_trip_through_res_dir() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("dict");
    write_all(
        &base,
        options(TypeSequence::Fixed(DefiFormat::Plain)),
        vec![
            word(&["w"], "defi", DefiFormat::Plain),
            Entry::new_data("logo.svg".to_string(), b"<svg/>".to_vec()),
        ],
    );

    let entries = read_all(&base);
    assert_eq!(entries.len(), 2);
    match &entries[1] {
        Entry::Data(d) => {
            assert_eq!(d.name, "logo.svg");
            assert_eq!(d.data, b"<svg/>".to_vec());
        }
        _ => panic!("expected a data entry"),
    }
}
