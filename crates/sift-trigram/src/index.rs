//! On-disk format, little-endian throughout:
//!
//! ```text
//! magic    b"csi1"
//! u32      file count
//! per file u16 name length, name bytes (UTF-8)
//! u32      trigram count
//! per tri  3 bytes trigram, u32 posting length, u32 file ids (ascending)
//! ```
//!
//! File ids are indexes into the name table. Trigrams are emitted in
//! ascending byte order so the format is deterministic for a given input set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};

use crate::query::Query;
use crate::IndexError;

const MAGIC: &[u8; 4] = b"csi1";

pub type FileId = u32;

/// Accumulates files and their trigrams, then serializes the index.
#[derive(Default)]
pub struct IndexBuilder {
    names: Vec<String>,
    postings: BTreeMap<[u8; 3], Vec<FileId>>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file and indexes every distinct trigram of `data`. Files
    /// shorter than three bytes are recorded in the name table only.
    pub fn add(&mut self, name: &str, data: &[u8]) -> FileId {
        let id = self.names.len() as FileId;
        self.names.push(name.to_string());

        let mut seen = BTreeSet::new();
        for window in data.windows(3) {
            seen.insert([window[0], window[1], window[2]]);
        }
        for trigram in seen {
            self.postings.entry(trigram).or_default().push(id);
        }
        id
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn write<W: Write>(&self, mut out: W) -> Result<(), IndexError> {
        out.write_all(MAGIC)?;
        out.write_all(&(self.names.len() as u32).to_le_bytes())?;
        for name in &self.names {
            let bytes = name.as_bytes();
            out.write_all(&(bytes.len() as u16).to_le_bytes())?;
            out.write_all(bytes)?;
        }
        out.write_all(&(self.postings.len() as u32).to_le_bytes())?;
        for (trigram, ids) in &self.postings {
            out.write_all(trigram)?;
            out.write_all(&(ids.len() as u32).to_le_bytes())?;
            for id in ids {
                out.write_all(&id.to_le_bytes())?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(buf)
    }
}

/// A loaded index: the name table plus the trigram posting lists.
pub struct Index {
    names: Vec<String>,
    postings: HashMap<[u8; 3], Vec<FileId>>,
}

impl Index {
    pub fn read<R: Read>(mut input: R) -> Result<Self, IndexError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(IndexError::BadMagic);
        }

        let file_count = read_u32(&mut input)? as usize;
        let mut names = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let len = read_u16(&mut input)? as usize;
            let mut raw = vec![0u8; len];
            input.read_exact(&mut raw)?;
            names.push(String::from_utf8(raw).map_err(|_| IndexError::BadName)?);
        }

        let trigram_count = read_u32(&mut input)? as usize;
        let mut postings = HashMap::with_capacity(trigram_count);
        for _ in 0..trigram_count {
            let mut trigram = [0u8; 3];
            input.read_exact(&mut trigram)?;
            let len = read_u32(&mut input)? as usize;
            let mut ids = Vec::with_capacity(len);
            for _ in 0..len {
                let id = read_u32(&mut input)?;
                if id as usize >= file_count {
                    return Err(IndexError::Corrupt("posting id out of range"));
                }
                ids.push(id);
            }
            postings.insert(trigram, ids);
        }
        Ok(Index { names, postings })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IndexError> {
        Self::read(data)
    }

    pub fn name(&self, id: FileId) -> &str {
        &self.names[id as usize]
    }

    pub fn file_count(&self) -> usize {
        self.names.len()
    }

    fn posting(&self, trigram: [u8; 3]) -> &[FileId] {
        self.postings.get(&trigram).map_or(&[], Vec::as_slice)
    }

    /// Evaluates a compiled trigram query, returning candidate file ids in
    /// ascending order. [`Query::All`] matches every file in the index.
    pub fn posting_query(&self, query: &Query) -> Vec<FileId> {
        match query {
            Query::All => (0..self.names.len() as FileId).collect(),
            Query::None => Vec::new(),
            Query::Trigrams(set) => {
                let mut iter = set.iter();
                let first = match iter.next() {
                    Some(t) => self.posting(*t).to_vec(),
                    None => return Vec::new(),
                };
                iter.fold(first, |acc, t| intersect(&acc, self.posting(*t)))
            }
            Query::And(subs) => {
                let mut iter = subs.iter();
                let first = match iter.next() {
                    Some(q) => self.posting_query(q),
                    None => return (0..self.names.len() as FileId).collect(),
                };
                iter.fold(first, |acc, q| intersect(&acc, &self.posting_query(q)))
            }
            Query::Or(subs) => {
                let mut acc = Vec::new();
                for sub in subs {
                    acc = union(&acc, &self.posting_query(sub));
                }
                acc
            }
        }
    }
}

fn read_u16<R: Read>(input: &mut R) -> Result<u16, IndexError> {
    let mut raw = [0u8; 2];
    input.read_exact(&mut raw)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32, IndexError> {
    let mut raw = [0u8; 4];
    input.read_exact(&mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn intersect(a: &[FileId], b: &[FileId]) -> Vec<FileId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union(a: &[FileId], b: &[FileId]) -> Vec<FileId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}
