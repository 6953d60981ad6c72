//! Download, extraction and cleanup of one package's source archives.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::package::Package;
use crate::tree::{self, Directory};

/// A package extracted to the local filesystem. The backing temporary
/// directory is removed when the archive is dropped.
pub struct Archive {
    pub pkg: Package,
    /// Directory the sources were extracted into.
    pub dir: PathBuf,
    /// Content-addressed index of the extracted contents.
    pub tree: Directory,
    _temp: TempDir,
}

/// Creates an [`Archive`] from a package: downloads the files listed in the
/// control stanza, verifies their hashes, combines them with
/// `dpkg-source --extract`, and walks the result.
pub fn download_extract_and_walk(pkg: Package) -> Result<Archive> {
    let temp = tempfile::Builder::new()
        .prefix(&format!("sift-{}-", pkg.name))
        .tempdir()
        .context("failed to create extraction directory")?;

    let mut dsc: Option<PathBuf> = None;
    for file in &pkg.files {
        let data = sift_internal::download(&pkg.mirror, &[&pkg.directory, &file.name])
            .with_context(|| format!("failed to download {}", file.name))?;
        let digest = hex::encode(Sha256::digest(&data));
        if digest != file.sha256 {
            bail!(
                "hash mismatch for {}: expected {}, got {}",
                file.name,
                file.sha256,
                digest
            );
        }

        let base = file
            .name
            .rsplit('/')
            .next()
            .unwrap_or(file.name.as_str());
        let local = temp.path().join(base);
        fs::write(&local, &data)
            .with_context(|| format!("failed to write {}", local.display()))?;

        if base.ends_with(".dsc") {
            if let Some(existing) = &dsc {
                bail!(
                    "duplicate *.dsc files: {}, {}",
                    existing.display(),
                    local.display()
                );
            }
            dsc = Some(local);
        }
    }
    let dsc = dsc.ok_or_else(|| anyhow!("source package is missing a *.dsc"))?;

    let extracted = temp.path().join("source");
    let output = Command::new("dpkg-source")
        .arg("--extract")
        .arg(&dsc)
        .arg(&extracted)
        .output()
        .context("failed to invoke dpkg-source")?;
    if !output.status.success() {
        bail!(
            "dpkg-source failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let tree = tree::walk(&extracted)
        .with_context(|| format!("failed to walk extracted sources for {}", pkg.slug()))?;

    Ok(Archive {
        pkg,
        dir: extracted,
        tree,
        _temp: temp,
    })
}
