//! Ctags index construction: the external tag extractor is run over the
//! extracted sources and its byte output is passed through verbatim.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

pub fn build(dir: &Path) -> Result<Vec<u8>> {
    let output = Command::new("ctags")
        .args([
            "-f",
            "-",
            "--recurse",
            "--links=no",
            "--excmd=number",
            // Segfaults on pathological JSON test fixtures; patches carry
            // garbled tags; markdown is noise.
            "--exclude=*.json",
            "--exclude=*.patch",
            "--exclude=*.md",
        ])
        // Paths in the output are relative to this directory.
        .current_dir(dir)
        .output()
        .context("failed to invoke ctags")?;
    if !output.status.success() {
        bail!(
            "ctags failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

/// Groups a raw ctags dump by tag token. The remainder of each line (the
/// tab-separated location fields) is kept verbatim.
pub fn parse(ctags: &[u8]) -> HashMap<String, Vec<String>> {
    let mut result: HashMap<String, Vec<String>> = HashMap::new();
    for line in String::from_utf8_lossy(ctags).lines() {
        if let Some((tag, rest)) = line.split_once('\t') {
            result
                .entry(tag.to_string())
                .or_default()
                .push(rest.to_string());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_groups_by_token() {
        let raw = b"deflate\tdeflate.c\t42;\"\tf\n\
                    deflate\tdeflate.h\t10;\"\tp\n\
                    inflate\tinflate.c\t7;\"\tf\n";
        let parsed = parse(raw);
        assert_eq!(2, parsed["deflate"].len());
        assert_eq!("inflate.c\t7;\"\tf", parsed["inflate"][0]);
    }

    #[test]
    fn parse_skips_malformed_lines() {
        let parsed = parse(b"no-tab-here\n");
        assert!(parsed.is_empty());
    }
}
