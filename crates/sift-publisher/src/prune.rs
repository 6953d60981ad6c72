//! The pruning tool: enumerate the per-package artifact bucket, classify
//! every key, and delete the stale ones after interactive confirmation.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};

use crate::upload::Uploader;

/// Extensions the publisher writes. Everything else in the bucket is junk.
pub const KNOWN_EXTENSIONS: &[&str] = &["csi", "fzf", "json", "symbols", "tags", "zst"];

#[derive(Debug, Default)]
pub struct Classification {
    pub corrupted: Vec<String>,
    pub unknown_distro: Vec<String>,
    pub unknown_extension: Vec<String>,
    pub wrong_epoch: Vec<String>,
    pub current: usize,
}

impl Classification {
    pub fn stale_count(&self) -> usize {
        self.corrupted.len()
            + self.unknown_distro.len()
            + self.unknown_extension.len()
            + self.wrong_epoch.len()
    }

    fn stale_keys(self) -> Vec<String> {
        let mut keys = self.corrupted;
        keys.extend(self.unknown_distro);
        keys.extend(self.unknown_extension);
        keys.extend(self.wrong_epoch);
        keys
    }
}

/// Buckets every key by the first rule it violates.
pub fn classify<I>(keys: I, distros: &HashSet<String>, epoch: i64) -> Classification
where
    I: IntoIterator<Item = String>,
{
    let mut result = Classification::default();
    for key in keys {
        if key == "robots.txt" {
            continue;
        }
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 3 {
            result.corrupted.push(key);
        } else if !distros.contains(parts[0]) {
            result.unknown_distro.push(key);
        } else if !KNOWN_EXTENSIONS.contains(&extension(&key)) {
            result.unknown_extension.push(key);
        } else if epoch_from_key(&key) != Some(epoch) {
            result.wrong_epoch.push(key);
        } else {
            result.current += 1;
        }
    }
    result
}

fn extension(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or("")
}

/// Parses the trailing `:<n>.<ext>` of an artifact key.
fn epoch_from_key(key: &str) -> Option<i64> {
    let after_colon = key.rsplit(':').next()?;
    let digits = after_colon.split('.').next()?;
    digits.parse().ok()
}

pub fn run(uploader: &Uploader, distros: &HashSet<String>, epoch: i64) -> Result<()> {
    let keys = uploader.ls.list().context("failed to list artifacts")?;
    let classified = classify(keys, distros, epoch);
    report(&classified);

    let total = classified.stale_count();
    if total == 0 {
        println!("Nothing to do!");
        return Ok(());
    }

    println!("Press ENTER to delete {total} files!");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read confirmation")?;

    println!("Deleting...");
    delete_parallel(uploader, classified.stale_keys())?;
    println!("Done!");
    Ok(())
}

fn report(classified: &Classification) {
    if !classified.corrupted.is_empty() {
        println!(
            "Corrupted:      {:6}  {}...",
            classified.corrupted.len(),
            classified.corrupted[0]
        );
    }
    if !classified.unknown_distro.is_empty() {
        let mut by_distro: BTreeMap<&str, usize> = BTreeMap::new();
        for key in &classified.unknown_distro {
            let distro = key.split('/').next().unwrap_or("");
            *by_distro.entry(distro).or_default() += 1;
        }
        for (distro, count) in by_distro {
            println!("Unknown Distro: {count:6}  {distro}");
        }
    }
    if !classified.unknown_extension.is_empty() {
        let mut by_ext: BTreeMap<&str, usize> = BTreeMap::new();
        for key in &classified.unknown_extension {
            *by_ext.entry(extension(key)).or_default() += 1;
        }
        for (ext, count) in by_ext {
            println!("Unknown Extn:   {count:6}  .{ext}");
        }
    }
    if !classified.wrong_epoch.is_empty() {
        let mut by_epoch: BTreeMap<i64, usize> = BTreeMap::new();
        for key in &classified.wrong_epoch {
            *by_epoch.entry(epoch_from_key(key).unwrap_or(-1)).or_default() += 1;
        }
        for (epoch, count) in by_epoch {
            println!("Wrong Epoch:    {count:6}  {epoch}");
        }
    }
    println!();
    println!("To Keep:        {:6}", classified.current);
    println!();
}

fn delete_parallel(uploader: &Uploader, keys: Vec<String>) -> Result<()> {
    let total = keys.len();
    let (job_tx, job_rx) = mpsc::channel::<String>();
    for key in keys {
        // Receiver outlives the loop; the send cannot fail.
        let _ = job_tx.send(key);
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));
    let progress = Arc::new(Mutex::new(0usize));

    let mut failed = false;
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..uploader.download_threads {
            let job_rx = Arc::clone(&job_rx);
            let progress = Arc::clone(&progress);
            handles.push(scope.spawn(move || -> Result<()> {
                loop {
                    let key = {
                        let Ok(guard) = job_rx.lock() else { break };
                        match guard.recv() {
                            Ok(key) => key,
                            Err(_) => break,
                        }
                    };
                    uploader.ls.delete(&key)?;
                    if let Ok(mut progress) = progress.lock() {
                        *progress += 1;
                        if *progress % 1000 == 0 {
                            println!("{:6} / {total:6}", *progress);
                        }
                    }
                }
                Ok(())
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = ?err, "delete worker failed");
                    failed = true;
                }
                Err(_) => failed = true,
            }
        }
    });
    if failed {
        anyhow::bail!("errors while deleting files");
    }
    Ok(())
}
