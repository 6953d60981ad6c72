//! The per-distribution ingestion driver.
//!
//! Packages are processed by a fixed worker pool; a failure in one package
//! is logged, marks the run as errored and lets the worker move on. When at
//! least one package was reprocessed, the distribution's table of contents
//! and consolidated indexes are rebuilt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use sift_analysis::{archive, codesearch, ctags, fzf, symbols, Package};
use sift_internal::DistroConfig;

use crate::apt;
use crate::database::{Database, PackageVersion};
use crate::upload::Uploader;

pub const PKG_THREADS: usize = 8;
pub const UPLOAD_THREADS: usize = 4;

/// Hashes accumulated per upload worker before a `record_hashes` flush.
const CHECKPOINT_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Reprocess every package and reupload index files, skipping file
    /// dedup and content uploads. Development knob; similar in effect to
    /// bumping the epoch.
    pub reindex_pkgs: bool,
    /// Rebuild the consolidated indexes even when no package changed.
    pub reindex_distro: bool,
}

/// Processes one distribution end to end. Returns `true` when any package
/// errored; the caller exits non-zero after all distributions finish.
pub fn process_distro(
    db: &Database,
    up: &Uploader,
    name: &str,
    config: &DistroConfig,
    epoch: i64,
    flags: RunFlags,
) -> bool {
    match process_distro_inner(db, up, name, config, epoch, flags) {
        Ok(errored) => errored,
        Err(err) => {
            tracing::error!(distro = name, error = ?err, "distribution failed");
            true
        }
    }
}

fn process_distro_inner(
    db: &Database,
    up: &Uploader,
    name: &str,
    config: &DistroConfig,
    epoch: i64,
    flags: RunFlags,
) -> Result<bool> {
    // Sources are in priority order, so the first occurrence of a package
    // wins.
    let mut packages: HashMap<String, Package> = HashMap::new();
    for source in apt::fetch_sources(name, config)? {
        for pkg in apt::fetch_packages(&source)? {
            packages.entry(pkg.name.clone()).or_insert(pkg);
        }
    }
    tracing::info!(distro = name, packages = packages.len(), "enumerated");

    let existing = db.list_existing(name, &packages)?;

    let errored = Arc::new(AtomicBool::new(false));
    let (job_tx, job_rx) = mpsc::channel::<Package>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, result_rx) = mpsc::sync_channel::<PackageVersion>(packages.len().max(1));

    let mut pkgvers: Vec<PackageVersion> = Vec::new();
    thread::scope(|scope| {
        for _ in 0..PKG_THREADS {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let errored = Arc::clone(&errored);
            scope.spawn(move || loop {
                let pkg = {
                    let Ok(guard) = job_rx.lock() else { break };
                    match guard.recv() {
                        Ok(pkg) => pkg,
                        Err(_) => break,
                    }
                };
                let slug = pkg.slug();
                match process_package(db, up, pkg, epoch, flags) {
                    Ok(pv) => {
                        if result_tx.send(pv).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!(package = slug, error = ?err, "package failed");
                        errored.store(true, Ordering::Relaxed);
                    }
                }
            });
        }
        drop(result_tx);

        let total = packages.len();
        let mut count = 0;
        for (_, pkg) in packages.drain() {
            count += 1;
            match existing.get(&pkg.name) {
                // Already processed at this version on a previous run.
                Some(ex)
                    if ex.version == pkg.version
                        && ex.epoch >= epoch
                        && !flags.reindex_pkgs =>
                {
                    pkgvers.push(ex.clone())
                }
                _ => {
                    tracing::info!(distro = name, "feed: {count:5} / {total:5}");
                    // Workers only stop after this channel closes.
                    let _ = job_tx.send(pkg);
                }
            }
        }
        drop(job_tx);

        let mut processed = false;
        for pv in result_rx {
            pkgvers.push(pv);
            processed = true;
        }

        if !processed && !flags.reindex_distro {
            tracing::info!(distro = name, "no new packages, skipping index creation");
            return Ok(errored.load(Ordering::Relaxed));
        }

        tracing::info!(distro = name, "updating table of contents");
        db.update_distro_contents(name, &pkgvers)?;

        tracing::info!(distro = name, "publishing package list");
        let contents = db.list_distro_contents(name)?;
        up.upload_package_list(name, &contents)?;

        tracing::info!(distro = name, "consolidating fuzzy index");
        up.consolidate_fzf(name, &contents)?;

        tracing::info!(distro = name, "consolidating symbols index");
        up.consolidate_symbols(name, &contents)?;

        tracing::info!(distro = name, "done");
        Ok(errored.load(Ordering::Relaxed))
    })
}

/// The per-package pipeline: download + extract + walk, dedup, upload file
/// contents, then build and upload the four indexes and record the version.
fn process_package(
    db: &Database,
    up: &Uploader,
    pkg: Package,
    epoch: i64,
    flags: RunFlags,
) -> Result<PackageVersion> {
    let slug = pkg.slug();
    tracing::info!(package = slug, "downloading and extracting");
    let archive = archive::download_extract_and_walk(pkg)?;

    let files = if flags.reindex_pkgs {
        Vec::new()
    } else {
        db.dedup(&archive.tree.files())?
    };
    tracing::info!(package = slug, new_files = files.len(), "uploading contents");
    upload_files(db, up, &slug, files)?;

    tracing::info!(package = slug, "uploading tree");
    up.upload_tree(&archive)?;

    tracing::info!(package = slug, "computing fuzzy index");
    let index = fzf::build(&archive.pkg.name, &archive.tree);
    up.upload_fzf(&archive.pkg, &index)?;

    tracing::info!(package = slug, "computing ctags index");
    let tags = ctags::build(&archive.dir)?;
    up.upload_ctags(&archive.pkg, &tags)?;

    tracing::info!(package = slug, "computing symbols index");
    let digest = symbols::build(&archive.pkg.name, &archive.dir, &ctags::parse(&tags))?;
    up.upload_symbols(&archive.pkg, &digest)?;

    tracing::info!(package = slug, "computing codesearch index");
    let (csi, tar_zst) = codesearch::build(&archive.pkg.name, &archive.dir)?;
    up.upload_codesearch(&archive.pkg, &csi, tar_zst)?;

    let pv = db.record_package_version(&archive.pkg, epoch)?;
    tracing::info!(package = slug, "done");
    Ok(pv)
}

/// Uploads deduplicated files with a small worker pool. Each worker batches
/// the hashes of files it has uploaded and checkpoints them to the dedup
/// table, so a crashed run never records bytes it did not store.
fn upload_files(
    db: &Database,
    up: &Uploader,
    slug: &str,
    files: Vec<sift_analysis::FileNode>,
) -> Result<()> {
    let total = files.len();
    let (job_tx, job_rx) = mpsc::channel::<sift_analysis::FileNode>();
    for file in files {
        // Receiver outlives the loop; the send cannot fail.
        let _ = job_tx.send(file);
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let uploaded = Arc::new(Mutex::new(0usize));

    let mut first_error: Option<anyhow::Error> = None;
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..UPLOAD_THREADS {
            let job_rx = Arc::clone(&job_rx);
            let uploaded = Arc::clone(&uploaded);
            handles.push(scope.spawn(move || -> Result<()> {
                let mut hashes: Vec<[u8; 32]> = Vec::with_capacity(CHECKPOINT_LIMIT);
                loop {
                    let file = {
                        let Ok(guard) = job_rx.lock() else { break };
                        match guard.recv() {
                            Ok(file) => file,
                            Err(_) => break,
                        }
                    };
                    up.upload_file(&file)?;
                    hashes.push(file.sha256);
                    if hashes.len() >= CHECKPOINT_LIMIT {
                        if let Ok(mut uploaded) = uploaded.lock() {
                            *uploaded += hashes.len();
                            tracing::debug!(package = slug, "progress: {} / {total}", *uploaded);
                        }
                        db.record_hashes(&hashes)?;
                        hashes.clear();
                    }
                }
                db.record_hashes(&hashes)?;
                Ok(())
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("upload worker panicked"));
                    }
                }
            }
        }
    });

    match first_error {
        Some(err) => Err(err).context(format!("file upload failed for {slug}")),
        None => Ok(()),
    }
}
