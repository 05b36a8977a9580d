use std::path::Path;
use std::time::Instant;

use anyhow::bail;

use glosconv::entry_list::{stardict_sort_key, EntryList, DEFAULT_RUN_SIZE};
use glosconv::stardict::{self, ReaderOptions, TypeSequence, WriterOptions};
use glosconv::text_utils::UnicodeErrors;
use glosconv::{goldbook, zim, DefiFormat, GlossaryInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Stardict,
    Goldbook,
    Zim,
}

fn detect_format(path: &Path, explicit: Option<&str>) -> anyhow::Result<InputFormat> {
    if let Some(name) = explicit {
        return match name {
            "stardict" => Ok(InputFormat::Stardict),
            "goldbook" => Ok(InputFormat::Goldbook),
            "zim" => Ok(InputFormat::Zim),
            other => bail!("unknown input format {other:?}"),
        };
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".ifo") || path.is_dir() {
        Ok(InputFormat::Stardict)
    } else if name.ends_with(".zim") {
        Ok(InputFormat::Zim)
    } else if name.ends_with(".xml") || name.ends_with(".xml.gz") || name.ends_with(".xml.xz") {
        Ok(InputFormat::Goldbook)
    } else {
        bail!(
            "cannot detect the input format of {:?}; pass --input-format",
            path
        )
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = clap::Command::new("Glossary Converter")
        .version(clap::crate_version!())
        .arg(
            clap::Arg::new("INPUT")
                .help("The glossary to read: a StarDict .ifo, an IUPAC Goldbook .xml[.gz|.xz], or a .zim archive.")
                .required(true)
                .index(1),
        )
        .arg(
            clap::Arg::new("OUTPUT")
                .help("The StarDict output path (with or without the .ifo extension).")
                .required(true)
                .index(2),
        )
        .arg(
            clap::Arg::new("input_format")
                .long("input-format")
                .help("Force the input format instead of detecting it from the file extension: stardict, goldbook, or zim.")
                .value_name("FORMAT")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sametypesequence")
                .short('s')
                .long("sametypesequence")
                .help("Definition format for the output: h, m, or x forces the compact layout; \"auto\" samples the input; \"none\" forces the general layout.")
                .value_name("VALUE")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("no_dictzip")
                .long("no-dictzip")
                .help("Skip compressing the .dict file with dictzip."),
        )
        .arg(
            clap::Arg::new("merge_syns")
                .long("merge-syns")
                .help("Write synonyms into the .idx as duplicate records instead of a separate .syn file."),
        )
        .arg(
            clap::Arg::new("stardict_client")
                .long("stardict-client")
                .help("Rewrite HTML paragraphs for the StarDict 3.0 desktop client."),
        )
        .arg(
            clap::Arg::new("audio_goldendict")
                .long("audio-goldendict")
                .help("Rewrite sound:// links to <audio> elements for GoldenDict."),
        )
        .arg(
            clap::Arg::new("no_audio_icon")
                .long("no-audio-icon")
                .help("Drop the link body when rewriting audio links."),
        )
        .arg(
            clap::Arg::new("raw_xdxf")
                .long("raw-xdxf")
                .help("Keep XDXF definitions as-is instead of converting them to HTML while reading."),
        )
        .arg(
            clap::Arg::new("unicode_errors")
                .long("unicode-errors")
                .help("What to do with invalid UTF-8 in the input: strict, ignore, replace, or backslashreplace.")
                .value_name("POLICY")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("book_name")
                .short('n')
                .long("book-name")
                .help("Override the glossary name written to the .ifo file.")
                .value_name("NAME")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("source_lang")
                .long("source-lang")
                .help("Source language code, appended to the book name.")
                .value_name("CODE")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("target_lang")
                .long("target-lang")
                .help("Target language code, appended to the book name.")
                .value_name("CODE")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("run_size")
                .long("run-size")
                .help("Entries held in memory before spilling a sorted run to disk.")
                .value_name("N")
                .takes_value(true),
        )
        .get_matches();

    let input = Path::new(matches.value_of("INPUT").unwrap());
    let output = Path::new(matches.value_of("OUTPUT").unwrap());
    let format = detect_format(input, matches.value_of("input_format"))?;

    let unicode_errors: UnicodeErrors = matches
        .value_of("unicode_errors")
        .unwrap_or("strict")
        .parse()
        .map_err(anyhow::Error::msg)?;
    let run_size = match matches.value_of("run_size") {
        Some(n) => n.parse()?,
        None => DEFAULT_RUN_SIZE,
    };

    let writer_options = WriterOptions {
        sametypesequence: match matches.value_of("sametypesequence") {
            None | Some("auto") | Some("") => TypeSequence::Auto,
            Some("none") => TypeSequence::Disabled,
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next().and_then(DefiFormat::from_letter), chars.next()) {
                    (Some(format), None) => TypeSequence::Fixed(format),
                    _ => bail!("invalid sametypesequence {s:?}; expected h, m, x, auto, or none"),
                }
            }
        },
        dictzip: !matches.is_present("no_dictzip"),
        stardict_client: matches.is_present("stardict_client"),
        merge_syns: matches.is_present("merge_syns"),
        audio_goldendict: matches.is_present("audio_goldendict"),
        audio_icon: !matches.is_present("no_audio_icon"),
    };

    //----------------------------------------------------------------
    // Read the input glossary into the sortable entry list.

    let mut list = EntryList::new(run_size, false)?;
    list.set_sort_key(stardict_sort_key())?;
    let mut info = GlossaryInfo::new();

    println!("Reading {}...", input.display());
    let t0 = Instant::now();
    match format {
        InputFormat::Stardict => {
            let reader_options = ReaderOptions {
                xdxf_to_html: !matches.is_present("raw_xdxf"),
                unicode_errors,
            };
            let reader = stardict::Reader::open(input, reader_options)?;
            info = reader.info().clone();
            println!("    Index entries: {}", reader.len());
            for entry in reader {
                list.append(entry?)?;
            }
        }
        InputFormat::Goldbook => {
            let reader = goldbook::Reader::open(input)?;
            info = reader.info().clone();
            for entry in reader.entries()? {
                list.append(entry?)?;
            }
        }
        InputFormat::Zim => {
            let reader = zim::Reader::open(input)?;
            println!("    Archive entries: {}", reader.len());
            for entry in reader {
                list.append(entry?)?;
            }
        }
    }
    println!("    Read {} entries in {:.2?}.", list.len(), t0.elapsed());

    if let Some(name) = matches.value_of("book_name") {
        info.set("name", name);
    }
    if let Some(code) = matches.value_of("source_lang") {
        info.set("sourceLang", code);
    }
    if let Some(code) = matches.value_of("target_lang") {
        info.set("targetLang", code);
    }

    //----------------------------------------------------------------
    // Sort, then stream into the StarDict writer.

    println!("Sorting...");
    let t0 = Instant::now();
    list.sort(false)?;
    println!("    Sorted in {:.2?}.", t0.elapsed());

    println!("Writing {}...", output.display());
    let t0 = Instant::now();
    let mut writer = stardict::Writer::new(info, writer_options);
    writer.open(output)?;
    let mut written = 0usize;
    for entry in list.iter()? {
        writer.feed(entry?)?;
        written += 1;
    }
    writer.finish()?;
    list.close()?;
    println!("    Wrote {} entries in {:.2?}.", written, t0.elapsed());

    Ok(())
}
