//! Byte-level primitives shared by the format codecs: big-endian u32
//! packing, NUL-terminated field scanning, the StarDict case-folded sort
//! key, and newline/unicode normalization helpers.

use std::cmp::Ordering;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

/// Packs a `u32` as 4 big-endian bytes, the integer encoding used
/// throughout the StarDict on-disk format.
pub fn uint32_to_bytes(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Reads a big-endian `u32` from 4 bytes.
pub fn uint32_from_bytes(buf: [u8; 4]) -> u32 {
    u32::from_be_bytes(buf)
}

/// Returns the position of the first NUL byte at or after `start`.
pub fn find_nul(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?
        .iter()
        .position(|&b| b == 0)
        .map(|i| start + i)
}

/// The historical StarDict collation: compare by ASCII-lowercased bytes,
/// break ties by the raw bytes. `.idx` and `.syn` files are sorted with
/// this ordering.
pub fn stardict_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let lowered = a
        .iter()
        .map(u8::to_ascii_lowercase)
        .cmp(b.iter().map(u8::to_ascii_lowercase));
    match lowered {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

/// The key form of [`stardict_cmp`]: `(lowercased bytes, raw bytes)`.
pub fn byte_sort_key(word: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (word.to_ascii_lowercase(), word.to_vec())
}

lazy_static! {
    static ref RE_NEWLINE: Regex = Regex::new("\n\r?|\r\n?").unwrap();
}

/// Collapses any newline convention to a single space. Used for
/// single-line `.ifo` values.
pub fn newlines_to_space(text: &str) -> String {
    RE_NEWLINE.replace_all(text, " ").into_owned()
}

/// Replaces newlines with `<br>`. Used for the `.ifo` description value.
pub fn newlines_to_br(text: &str) -> String {
    RE_NEWLINE.replace_all(text, "<br>").into_owned()
}

/// What to do with invalid UTF-8 in index words and definition blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicodeErrors {
    /// Fail the conversion.
    Strict,
    /// Drop the offending bytes.
    Ignore,
    /// Substitute U+FFFD.
    Replace,
    /// Substitute a `\xNN` escape per offending byte.
    BackslashReplace,
}

impl Default for UnicodeErrors {
    fn default() -> Self {
        UnicodeErrors::Strict
    }
}

impl std::str::FromStr for UnicodeErrors {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "strict" => Ok(UnicodeErrors::Strict),
            "ignore" => Ok(UnicodeErrors::Ignore),
            "replace" => Ok(UnicodeErrors::Replace),
            "backslashreplace" => Ok(UnicodeErrors::BackslashReplace),
            _ => Err(format!("unknown unicode-errors policy: {s:?}")),
        }
    }
}

/// Decodes bytes as UTF-8 under the given policy. Only `Strict` can fail.
pub fn decode_utf8(bytes: &[u8], policy: UnicodeErrors) -> Result<String> {
    match policy {
        UnicodeErrors::Strict => String::from_utf8(bytes.to_vec()).map_err(Error::from),
        UnicodeErrors::Replace => Ok(String::from_utf8_lossy(bytes).into_owned()),
        UnicodeErrors::Ignore | UnicodeErrors::BackslashReplace => {
            let escape = policy == UnicodeErrors::BackslashReplace;
            let mut out = String::with_capacity(bytes.len());
            let mut rest = bytes;
            loop {
                match std::str::from_utf8(rest) {
                    Ok(s) => {
                        out.push_str(s);
                        break;
                    }
                    Err(e) => {
                        let (valid, tail) = rest.split_at(e.valid_up_to());
                        out.push_str(&String::from_utf8_lossy(valid));
                        let bad_len = e.error_len().unwrap_or(tail.len());
                        if escape {
                            for b in &tail[..bad_len] {
                                out.push_str(&format!("\\x{b:02x}"));
                            }
                        }
                        rest = &tail[bad_len..];
                    }
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint32_known_vectors() {
        assert_eq!(uint32_to_bytes(0), [0, 0, 0, 0]);
        assert_eq!(uint32_to_bytes(1), [0, 0, 0, 1]);
        assert_eq!(uint32_to_bytes(0xDEAD_BEEF), [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(uint32_from_bytes([0, 0, 1, 0]), 256);
        assert_eq!(uint32_from_bytes(uint32_to_bytes(0x1234_5678)), 0x1234_5678);
    }

    #[test]
    fn find_nul_scans_from_start() {
        let buf = b"abc\x00def\x00";
        assert_eq!(find_nul(buf, 0), Some(3));
        assert_eq!(find_nul(buf, 3), Some(3));
        assert_eq!(find_nul(buf, 4), Some(7));
        assert_eq!(find_nul(buf, 8), None);
        assert_eq!(find_nul(buf, 100), None);
    }

    #[test]
    fn stardict_cmp_folds_case_then_raw() {
        assert_eq!(stardict_cmp(b"apple", b"Banana"), Ordering::Less);
        assert_eq!(stardict_cmp(b"Banana", b"Zebra"), Ordering::Less);
        // Same folded form: raw bytes break the tie, uppercase first.
        assert_eq!(stardict_cmp(b"Abc", b"abc"), Ordering::Less);
        assert_eq!(stardict_cmp(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn byte_sort_key_matches_comparator() {
        let words: &[&[u8]] = &[b"Abc", b"abc", b"aBd", b"zz"];
        for a in words {
            for b in words {
                assert_eq!(
                    byte_sort_key(a).cmp(&byte_sort_key(b)),
                    stardict_cmp(a, b)
                );
            }
        }
    }

    #[test]
    fn sort_words_like_stardict() {
        let mut words: Vec<&[u8]> = vec![b"Zebra", b"apple", b"Banana"];
        words.sort_by(|a, b| stardict_cmp(a, b));
        assert_eq!(words, vec![&b"apple"[..], b"Banana", b"Zebra"]);
    }

    #[test]
    fn newline_normalization() {
        assert_eq!(newlines_to_space("a\nb\r\nc\rd"), "a b c d");
        assert_eq!(newlines_to_br("a\nb"), "a<br>b");
    }

    #[test]
    fn decode_policies() {
        let bad = b"ab\xffcd";
        assert!(decode_utf8(bad, UnicodeErrors::Strict).is_err());
        assert_eq!(decode_utf8(bad, UnicodeErrors::Ignore).unwrap(), "abcd");
        assert_eq!(
            decode_utf8(bad, UnicodeErrors::Replace).unwrap(),
            "ab\u{fffd}cd"
        );
        assert_eq!(
            decode_utf8(bad, UnicodeErrors::BackslashReplace).unwrap(),
            "ab\\xffcd"
        );
        assert_eq!(decode_utf8(b"ok", UnicodeErrors::Strict).unwrap(), "ok");
    }
}
