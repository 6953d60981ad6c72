//! The symbols digest: demangled shared-library symbol tables cross-linked
//! with the ctags index.
//!
//! Debian packages that ship shared libraries carry `debian/*symbols` files.
//! Each one is piped through `c++filt --no-params`; every demangled line is
//! emitted, followed by the ctags locations of the bare symbol token when the
//! package defines it.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

// TODO: nested angle brackets in C++ template symbols defeat this pattern;
// see exiv2 for examples.
fn symbol_extractor() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ ([^@]+::)?([A-Za-z0-9_~]+)(<[^@]+>)?@.*$").unwrap_or_else(|err| {
            panic!("invalid symbol extractor pattern: {err}");
        })
    })
}

pub fn build(
    package_name: &str,
    dir: &Path,
    tag_index: &HashMap<String, Vec<String>>,
) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    for filename in symbols_files(dir)? {
        let base = filename
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(result, "### {package_name} {base}")?;

        let demangled = demangle(&filename)?;
        for line in String::from_utf8_lossy(&demangled).lines() {
            result.extend_from_slice(line.as_bytes());
            result.push(b'\n');
            if let Some(captures) = symbol_extractor().captures(line) {
                let token = &captures[2];
                if let Some(tags) = tag_index.get(token) {
                    for tag in tags {
                        writeln!(result, " - {tag}")?;
                    }
                }
            }
        }
        result.push(b'\n');
    }
    Ok(result)
}

/// Globs `debian/*symbols` inside the extracted archive, sorted by name.
fn symbols_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let debian = dir.join("debian");
    let entries = match fs::read_dir(&debian) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to list {}", debian.display()))
        }
    };
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with("symbols") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Runs one symbols file through the external C++ demangler. Parameters are
/// stripped so the bare function name lines up with the ctags token.
fn demangle(filename: &Path) -> Result<Vec<u8>> {
    let contents = fs::read(filename)
        .with_context(|| format!("failed to read {}", filename.display()))?;

    let mut child = Command::new("c++filt")
        .arg("--no-params")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to invoke c++filt")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&contents)
            .context("failed to write to c++filt")?;
    }
    let output = child.wait_with_output().context("c++filt did not exit")?;
    if !output.status.success() {
        bail!(
            "c++filt failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_captures_bare_token() {
        let captures = symbol_extractor()
            .captures(" ZSTD_compress@Base 1.4.8")
            .unwrap();
        assert_eq!("ZSTD_compress", &captures[2]);

        let captures = symbol_extractor()
            .captures(" std::vector::push_back<int>@Base 1.0")
            .unwrap();
        assert_eq!("push_back", &captures[2]);
    }

    #[test]
    fn extractor_rejects_header_lines() {
        assert!(symbol_extractor()
            .captures("libzstd.so.1 libzstd1 #MINVER#")
            .is_none());
    }

    #[test]
    fn missing_debian_directory_yields_empty_digest() {
        let temp = tempfile::tempdir().unwrap();
        let digest = build("demo", temp.path(), &HashMap::new()).unwrap();
        assert!(digest.is_empty());
    }
}
