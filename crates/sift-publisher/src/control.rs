//! Debian control-file parsing.
//!
//! Control stanzas are RFC 822-style `Field: value` lines; a line starting
//! with a space or tab continues the previous field. File lists (`Files`,
//! `SHA256`, ...) are multi-line fields whose continuation lines each carry
//! `<hash> <size> <name>`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

#[derive(Debug, Clone, Default)]
pub struct Stanza {
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub hash: String,
    pub size: u64,
    pub name: String,
}

pub fn parse(raw: &str) -> Result<Stanza> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for line in raw.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let key = current
                .as_ref()
                .ok_or_else(|| anyhow!("continuation line with no preceding field: {line:?}"))?;
            let value = fields
                .get_mut(key)
                .ok_or_else(|| anyhow!("missing field {key}"))?;
            value.push('\n');
            value.push_str(line.trim_start());
        } else {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed control line: {line:?}"))?;
            fields.insert(key.to_string(), value.trim_start().to_string());
            current = Some(key.to_string());
        }
    }
    Ok(Stanza { fields })
}

impl Stanza {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn get_required(&self, field: &str) -> Result<&str> {
        self.get(field)
            .ok_or_else(|| anyhow!("control stanza is missing {field}"))
    }

    /// Parses a multi-line file list field into its entries.
    pub fn get_files(&self, field: &str) -> Result<Vec<FileEntry>> {
        let raw = self.get(field).unwrap_or("");
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (hash, size, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(hash), Some(size), Some(name)) => (hash, size, name),
                _ => bail!("malformed file entry in {field}: {line:?}"),
            };
            entries.push(FileEntry {
                hash: hash.to_string(),
                size: size
                    .parse()
                    .map_err(|_| anyhow!("bad size in {field}: {line:?}"))?,
                name: name.to_string(),
            });
        }
        Ok(entries)
    }

    /// Finds a named file in a list field, e.g. the `Sources.xz` for one
    /// component inside a `Release` stanza.
    pub fn find_file(&self, field: &str, name: &str) -> Result<Option<FileEntry>> {
        Ok(self
            .get_files(field)?
            .into_iter()
            .find(|entry| entry.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Package: zlib\n\
        Version: 1:1.2.11.dfsg-2ubuntu6\n\
        Directory: pool/main/z/zlib\n\
        Files:\n \
        abcdef0123 2455 zlib_1.2.11.dfsg-2ubuntu6.dsc\n \
        123456abcd 370248 zlib_1.2.11.dfsg.orig.tar.gz\n";

    #[test]
    fn parses_simple_fields() {
        let stanza = parse(SAMPLE).unwrap();
        assert_eq!(Some("zlib"), stanza.get("Package"));
        assert_eq!(
            "1:1.2.11.dfsg-2ubuntu6",
            stanza.get_required("Version").unwrap()
        );
        assert!(stanza.get("Missing").is_none());
    }

    #[test]
    fn parses_file_lists() {
        let stanza = parse(SAMPLE).unwrap();
        let files = stanza.get_files("Files").unwrap();
        assert_eq!(2, files.len());
        assert_eq!(
            FileEntry {
                hash: "abcdef0123".into(),
                size: 2455,
                name: "zlib_1.2.11.dfsg-2ubuntu6.dsc".into(),
            },
            files[0]
        );
    }

    #[test]
    fn finds_named_entries() {
        let release = "SHA256:\n \
            aaaa 123 main/source/Sources.xz\n \
            bbbb 456 universe/source/Sources.xz\n";
        let stanza = parse(release).unwrap();
        let entry = stanza
            .find_file("SHA256", "universe/source/Sources.xz")
            .unwrap()
            .unwrap();
        assert_eq!("bbbb", entry.hash);
        assert!(stanza
            .find_file("SHA256", "missing/source/Sources.xz")
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("no colon here\n").is_err());
        let stanza = parse("Files:\n bad-entry\n").unwrap();
        assert!(stanza.get_files("Files").is_err());
    }
}
