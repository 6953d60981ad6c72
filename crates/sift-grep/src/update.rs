//! Local index synchronization.
//!
//! `update` brings the serving disks in line with the published artifacts:
//! for every package in a distribution's `packages.json`, the trigram index
//! is fetched to the fast disk and the zstd source tar to the bulk disk,
//! where it is unpacked for the scanner. Packages whose files are already
//! present are skipped, so reruns only fetch what changed.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::layout;

pub const DOWNLOAD_THREADS: usize = 16;

#[derive(Debug, Clone)]
struct PackageRef {
    distro: String,
    name: String,
    version: String,
    epoch: i64,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    version: String,
    epoch: i64,
}

pub struct UpdateOptions {
    pub meta: Url,
    pub ls: Url,
    pub fast_dir: PathBuf,
    pub bulk_dir: PathBuf,
}

/// Synchronizes every configured distribution. Returns `Ok(false)` when any
/// package failed so the caller can exit non-zero after finishing the rest.
pub fn update(options: &UpdateOptions, distros: &[String]) -> Result<bool> {
    let mut clean = true;
    for distro in distros {
        if !update_distro(options, distro)? {
            clean = false;
        }
    }
    Ok(clean)
}

fn update_distro(options: &UpdateOptions, distro: &str) -> Result<bool> {
    let packages = list_packages(&options.meta, distro)?;
    tracing::info!(distro, packages = packages.len(), "syncing");

    let errored = Arc::new(AtomicBool::new(false));
    let (job_tx, job_rx) = mpsc::channel::<PackageRef>();
    for package in packages {
        // Receiver outlives the loop; the send cannot fail.
        let _ = job_tx.send(package);
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));

    thread::scope(|scope| {
        for _ in 0..DOWNLOAD_THREADS {
            let job_rx = Arc::clone(&job_rx);
            let errored = Arc::clone(&errored);
            scope.spawn(move || loop {
                let package = {
                    let Ok(guard) = job_rx.lock() else { break };
                    match guard.recv() {
                        Ok(package) => package,
                        Err(_) => break,
                    }
                };
                if let Err(err) = update_package(options, &package) {
                    tracing::error!(
                        package = package.slug(),
                        error = ?err,
                        "package sync failed"
                    );
                    errored.store(true, Ordering::Relaxed);
                }
            });
        }
    });

    Ok(!errored.load(Ordering::Relaxed))
}

fn list_packages(meta: &Url, distro: &str) -> Result<Vec<PackageRef>> {
    let raw = sift_internal::download(meta, &[distro, "packages.json"])
        .with_context(|| format!("failed to fetch package list for {distro}"))?;
    let entries: std::collections::BTreeMap<String, PackageEntry> =
        serde_json::from_slice(&raw).context("failed to parse packages.json")?;
    Ok(entries
        .into_iter()
        .map(|(name, entry)| PackageRef {
            distro: distro.to_string(),
            name,
            version: entry.version,
            epoch: entry.epoch,
        })
        .collect())
}

impl PackageRef {
    fn slug(&self) -> String {
        format!("{}/{}", self.distro, self.name)
    }

    fn filename(&self, ext: &str) -> String {
        layout::artifact_filename(&self.name, &self.version, self.epoch, ext)
    }
}

fn update_package(options: &UpdateOptions, package: &PackageRef) -> Result<()> {
    download_artifact(options, package, &options.fast_dir, "csi")?;
    let fetched = download_artifact(options, package, &options.bulk_dir, "tar.zst")?;
    if fetched {
        tracing::debug!(package = package.slug(), "unpacking sources");
        unpack_sources(options, package)?;
    }
    Ok(())
}

/// Downloads one artifact unless it is already on disk. Returns whether a
/// download happened.
fn download_artifact(
    options: &UpdateOptions,
    package: &PackageRef,
    base: &Path,
    ext: &str,
) -> Result<bool> {
    let dir = layout::local_dir(base, &package.distro, &package.name);
    let local = dir.join(package.filename(ext));
    if local.exists() {
        return Ok(false);
    }
    sift_internal::save_file(
        &local,
        &options.ls,
        &[&package.distro, &package.name, &package.filename(ext)],
    )
    .with_context(|| format!("failed to download {}", package.filename(ext)))?;
    Ok(true)
}

fn unpack_sources(options: &UpdateOptions, package: &PackageRef) -> Result<()> {
    let dir = layout::local_dir(&options.bulk_dir, &package.distro, &package.name);
    let archive_path = dir.join(package.filename("tar.zst"));
    let file = File::open(&archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let decoder = zstd::Decoder::new(file).context("failed to start zstd decoder")?;
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries().context("failed to read tar")? {
        let mut entry = entry.context("failed to read tar entry")?;
        let name = entry.path()?.to_string_lossy().into_owned();
        // Entries are keyed `<package>/<relative-path>`; the directory we
        // unpack into already names the package.
        let rel = name
            .strip_prefix(&format!("{}/", package.name))
            .unwrap_or(&name)
            .to_string();
        let dest = dir.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to write {}", dest.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_list_parses() {
        let raw = br#"{
            "zlib": { "version": "1.2.11", "epoch": 4 },
            "acl": { "version": "2.2.53", "epoch": 4 }
        }"#;
        let entries: std::collections::BTreeMap<String, PackageEntry> =
            serde_json::from_slice(raw).unwrap();
        assert_eq!(2, entries.len());
        assert_eq!("1.2.11", entries["zlib"].version);
        assert_eq!(4, entries["acl"].epoch);
    }

    #[test]
    fn artifact_paths_follow_the_layout() {
        let package = PackageRef {
            distro: "hirsute".into(),
            name: "libzstd".into(),
            version: "1.4.8".into(),
            epoch: 4,
        };
        assert_eq!("libzstd_1.4.8:4.csi", package.filename("csi"));
        assert_eq!("hirsute/libzstd", package.slug());
    }
}
