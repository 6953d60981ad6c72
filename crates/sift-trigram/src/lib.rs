//! The `.csi` trigram index.
//!
//! A code-search index maps every 3-byte substring of the indexed files to
//! the set of files containing it. At query time a regular expression is
//! compiled into a conservative boolean query over trigrams; evaluating the
//! query against the posting lists yields a shortlist of candidate files that
//! the regex engine then scans for real.

mod index;
mod query;

pub use index::{FileId, Index, IndexBuilder};
pub use query::{compile, from_hir, Query};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("not a csi index (bad magic)")]
    BadMagic,
    #[error("csi index is truncated or corrupt: {0}")]
    Corrupt(&'static str),
    #[error("file name is not valid UTF-8")]
    BadName,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
