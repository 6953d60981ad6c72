//! The trigram index and source tar for one package.
//!
//! A second walk over the extracted directory selects the searchable subset:
//! regular files no larger than 1 MiB whose first kilobyte contains no NUL
//! byte. Every surviving file is written to a zstd-compressed tar archive
//! and added to the trigram index under `<package>/<relative-path>`.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sift_trigram::IndexBuilder;
use walkdir::WalkDir;

/// Files over this size are assumed not to be code and are skipped.
const LARGE_FILE_SIZE: u64 = 1024 * 1024;

/// A file is binary if its first kilobyte contains a NUL byte.
const BINARY_SNIFFING_WINDOW: usize = 1024;

/// Returns `(csi_bytes, tar_zst_bytes)` for the extracted sources at `dir`.
pub fn build(package_name: &str, dir: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut index = IndexBuilder::new();
    let encoder = zstd::Encoder::new(Vec::new(), 0).context("failed to start zstd stream")?;
    let mut tar = tar::Builder::new(encoder);

    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk error under {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        if meta.len() > LARGE_FILE_SIZE {
            continue;
        }

        // Per-file read errors skip the file; the walk continues.
        let data = match fs::read(entry.path()) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(
                    path = %entry.path().display(),
                    error = %err,
                    "skipping unreadable file"
                );
                continue;
            }
        };
        let window = &data[..data.len().min(BINARY_SNIFFING_WINDOW)];
        if window.contains(&0) {
            continue;
        }

        let name = archive_path(package_name, dir, entry.path())?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(file_mode(&meta));
        header.set_cksum();
        tar.append_data(&mut header, &name, data.as_slice())
            .with_context(|| format!("failed to archive {name}"))?;
        index.add(&name, &data);
    }

    let encoder = tar.into_inner().context("failed to finish tar stream")?;
    let tar_zst = encoder.finish().context("failed to finish zstd stream")?;
    let csi = index.to_bytes().context("failed to encode trigram index")?;
    Ok((csi, tar_zst))
}

fn archive_path(pkg: &str, root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| anyhow!("{} escapes {}", path.display(), root.display()))?;
    Ok(format!("{}/{}", pkg, rel.to_string_lossy()))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn indexes_text_and_skips_binaries() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/main.c"), b"int main(void) { return 0; }\n").unwrap();
        fs::write(dir.join("blob.bin"), b"\x00\x01\x02binary").unwrap();

        let (csi, tar_zst) = build("demo", dir).unwrap();

        let index = sift_trigram::Index::from_bytes(&csi).unwrap();
        assert_eq!(1, index.file_count());
        assert_eq!("demo/src/main.c", index.name(0));
        let query = sift_trigram::compile("return").unwrap();
        assert_eq!(vec![0], index.posting_query(&query));

        let decoder = zstd::Decoder::new(tar_zst.as_slice()).unwrap();
        let mut tar = tar::Archive::new(decoder);
        let mut names = Vec::new();
        let mut body = String::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().into_owned());
            entry.read_to_string(&mut body).unwrap();
        }
        assert_eq!(vec!["demo/src/main.c"], names);
        assert!(body.contains("return 0"));
    }

    #[test]
    fn oversize_files_are_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path();
        fs::write(
            dir.join("big.txt"),
            vec![b'a'; (LARGE_FILE_SIZE + 1) as usize],
        )
        .unwrap();
        fs::write(dir.join("ok.txt"), b"hello there\n").unwrap();

        let (csi, _) = build("demo", dir).unwrap();
        let index = sift_trigram::Index::from_bytes(&csi).unwrap();
        assert_eq!(1, index.file_count());
        assert_eq!("demo/ok.txt", index.name(0));
    }
}
