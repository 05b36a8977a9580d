//! Crate-wide error type.
//!
//! Per-record defects (corrupt index records, unreadable definition blocks,
//! unknown MIME types) are logged and skipped by the readers and never show
//! up here. `Error` is reserved for conditions that abort an open or a whole
//! conversion.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The `sametypesequence` value in an `.ifo` file is not empty or a
    /// single ASCII letter.
    #[error("invalid sametypesequence = {0:?}")]
    InvalidSameTypeSequence(String),

    /// `EntryList::set_sort_key` was called twice, or after entries were
    /// already appended.
    #[error("sort key was already set")]
    SetSortKeyTwice,

    #[error("append() called after sort()")]
    AppendAfterSort,

    #[error("sort() called more than once")]
    SortTwice,

    /// An `EntryList` with a sort key was iterated before `sort()`.
    #[error("iterated before sort() while a sort key is set")]
    IterateBeforeSort,

    /// Invalid UTF-8 under the `strict` unicode-errors policy.
    #[error("invalid utf-8: {0}")]
    UnicodeDecode(#[from] std::string::FromUtf8Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Zim(#[from] crate::zim::ZimError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
