//! Extraction, tree walking and index construction for upstream source
//! packages.
//!
//! The pipeline turns one upstream package into a content-addressed
//! [`tree::Directory`] plus four derived artifacts: the fuzzy-path tree, the
//! trigram index with its source tar, a ctags index and a symbols digest.

pub mod archive;
pub mod codesearch;
pub mod ctags;
pub mod fzf;
pub mod package;
pub mod symbols;
pub mod tree;

pub use archive::{download_extract_and_walk, Archive};
pub use package::{Package, SourceFile};
pub use tree::{Directory, FileNode, Inode, SymlinkNode};
