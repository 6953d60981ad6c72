//! The object-store uploader.
//!
//! Three buckets: `cat` holds content-addressed file bytes, `ls` holds
//! per-package named artifacts, `meta` holds per-distribution consolidated
//! artifacts. Uploads are idempotent by key; rewriting an identical blob is
//! a no-op from the consumer's perspective.
//!
//! The publisher is thread-based; the S3 client is async, so the uploader
//! owns a private runtime and blocks on each call.

use std::env;
use std::io::Write;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use flate2::write::GzEncoder;
use flate2::Compression;
use sift_analysis::tree::EMPTY_SHA256;
use sift_analysis::{fzf, Archive, FileNode, Package};
use tokio::runtime::Runtime;

use crate::database::PackageVersion;

pub const DOWNLOAD_THREADS: usize = 16;

pub struct Bucket {
    client: aws_sdk_s3::Client,
    bucket: String,
    runtime: Arc<Runtime>,
}

impl Bucket {
    /// Opens the bucket named by an environment variable holding a
    /// `key_id:secret:bucket` triple. Endpoint and region come from
    /// `SIFT_S3_ENDPOINT` / `SIFT_S3_REGION`.
    pub fn from_env(envvar: &str, runtime: Arc<Runtime>) -> Result<Bucket> {
        let raw = env::var(envvar)
            .map_err(|_| anyhow!("expected credentials in {envvar}"))?;
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            bail!("could not parse {envvar}: expected key_id:secret:bucket");
        }
        let credentials = Credentials::new(parts[0], parts[1], None, None, "sift-config");
        let region = env::var("SIFT_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region))
            // Path-style addressing for S3-compatible stores.
            .force_path_style(true);
        if let Ok(endpoint) = env::var("SIFT_S3_ENDPOINT") {
            builder = builder.endpoint_url(endpoint);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(Bucket {
            client,
            bucket: parts[2].to_string(),
            runtime,
        })
    }

    pub fn put_file(&self, key: &str, local: &Path) -> Result<()> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(local)
                .await
                .with_context(|| format!("failed to read {}", local.display()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .with_context(|| format!("failed to upload {key}"))?;
            Ok(())
        })
    }

    pub fn put_bytes(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        content_encoding: Option<&str>,
    ) -> Result<()> {
        self.runtime.block_on(async {
            let mut request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data));
            if let Some(content_type) = content_type {
                request = request.content_type(content_type);
            }
            if let Some(content_encoding) = content_encoding {
                request = request.content_encoding(content_encoding);
            }
            request
                .send()
                .await
                .with_context(|| format!("failed to upload {key}"))?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .with_context(|| format!("failed to fetch {key}"))?;
            let data = output
                .body
                .collect()
                .await
                .with_context(|| format!("stream error for {key}"))?;
            Ok(data.into_bytes().to_vec())
        })
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let mut request = self.client.list_objects_v2().bucket(&self.bucket);
                if let Some(token) = token.take() {
                    request = request.continuation_token(token);
                }
                let output = request
                    .send()
                    .await
                    .context("failed to list bucket")?;
                for object in output.contents() {
                    if let Some(key) = object.key() {
                        keys.push(key.to_string());
                    }
                }
                if output.is_truncated() == Some(true) {
                    token = output.next_continuation_token().map(String::from);
                } else {
                    break;
                }
            }
            Ok(keys)
        })
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .with_context(|| format!("failed to delete {key}"))?;
            Ok(())
        })
    }
}

pub struct Uploader {
    pub ls: Bucket,
    pub cat: Bucket,
    pub meta: Bucket,
    pub download_threads: usize,
    epoch: i64,
}

impl Uploader {
    pub fn from_env(epoch: i64) -> Result<Uploader> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .context("failed to start uploader runtime")?,
        );
        Ok(Uploader {
            ls: Bucket::from_env("SIFT_LS_BUCKET", Arc::clone(&runtime))?,
            cat: Bucket::from_env("SIFT_CAT_BUCKET", Arc::clone(&runtime))?,
            meta: Bucket::from_env("SIFT_META_BUCKET", Arc::clone(&runtime))?,
            download_threads: DOWNLOAD_THREADS,
            epoch,
        })
    }

    /// Uploads one file to the content-addressed bucket under
    /// `<hh>/<hhhh>/<full-hex>`.
    pub fn upload_file(&self, file: &FileNode) -> Result<()> {
        let hex = hex::encode(file.sha256);
        if file.size == 0 && hex != EMPTY_SHA256 {
            bail!("unexpected empty file at {}", file.local_path.display());
        }
        self.cat.put_file(&cat_key(&hex), &file.local_path)
    }

    pub fn upload_tree(&self, archive: &Archive) -> Result<()> {
        let data = serde_json::to_vec_pretty(&archive.tree).context("failed to encode tree")?;
        self.ls.put_bytes(
            &self.ls_key(&archive.pkg, "json"),
            gzip(&data)?,
            Some("application/json"),
            Some("gzip"),
        )
    }

    pub fn upload_fzf(&self, pkg: &Package, index: &fzf::Node) -> Result<()> {
        let data = fzf::encode(index)?;
        self.ls.put_bytes(&self.ls_key(pkg, "fzf"), data, None, None)
    }

    pub fn upload_ctags(&self, pkg: &Package, ctags: &[u8]) -> Result<()> {
        self.ls.put_bytes(
            &self.ls_key(pkg, "tags"),
            gzip(ctags)?,
            Some("text/plain"),
            Some("gzip"),
        )
    }

    pub fn upload_symbols(&self, pkg: &Package, symbols: &[u8]) -> Result<()> {
        self.ls.put_bytes(
            &self.ls_key(pkg, "symbols"),
            gzip(symbols)?,
            Some("text/plain"),
            Some("gzip"),
        )
    }

    pub fn upload_codesearch(&self, pkg: &Package, csi: &[u8], tar_zst: Vec<u8>) -> Result<()> {
        self.ls.put_bytes(
            &self.ls_key(pkg, "csi"),
            gzip(csi)?,
            None,
            Some("gzip"),
        )?;
        self.ls
            .put_bytes(&self.ls_key(pkg, "tar.zst"), tar_zst, None, None)
    }

    /// `{pkg_name: {version, epoch}}` for every package in the distribution,
    /// alphabetical on disk.
    pub fn upload_package_list(&self, distro: &str, pkgvers: &[PackageVersion]) -> Result<()> {
        let mut list = std::collections::BTreeMap::new();
        for pv in pkgvers {
            list.insert(
                pv.name.clone(),
                serde_json::json!({ "version": pv.version, "epoch": pv.epoch }),
            );
        }
        let data = serde_json::to_vec_pretty(&list).context("failed to encode package list")?;
        self.meta.put_bytes(
            &format!("{distro}/packages.json"),
            data,
            Some("application/json"),
            None,
        )
    }

    /// Downloads every package's `.fzf` in parallel and wraps them in one
    /// outer MessagePack sequence keyed `<distro>/paths.fzf`.
    pub fn consolidate_fzf(&self, distro: &str, pkgvers: &[PackageVersion]) -> Result<()> {
        let blobs = self.download_artifacts(distro, pkgvers, "fzf")?;

        let mut consolidated = Vec::new();
        rmp::encode::write_array_len(&mut consolidated, blobs.len() as u32)
            .context("failed to encode index header")?;
        for blob in &blobs {
            rmp::encode::write_bin(&mut consolidated, blob)
                .context("failed to encode package index")?;
        }
        self.meta
            .put_bytes(&format!("{distro}/paths.fzf"), consolidated, None, None)
    }

    /// Downloads every package's `.symbols` in parallel and publishes the
    /// gzip-compressed concatenation as `<distro>/symbols.txt`.
    pub fn consolidate_symbols(&self, distro: &str, pkgvers: &[PackageVersion]) -> Result<()> {
        let blobs = self.download_artifacts(distro, pkgvers, "symbols")?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for blob in &blobs {
            encoder.write_all(blob)?;
        }
        let compressed = encoder.finish().context("failed to compress symbols")?;
        self.meta.put_bytes(
            &format!("{distro}/symbols.txt"),
            compressed,
            Some("text/plain"),
            Some("gzip"),
        )
    }

    /// Fetches one artifact per package version with a pool of download
    /// workers, preserving package order.
    fn download_artifacts(
        &self,
        distro: &str,
        pkgvers: &[PackageVersion],
        ext: &str,
    ) -> Result<Vec<Vec<u8>>> {
        let (job_tx, job_rx) = mpsc::channel::<(usize, String)>();
        for (index, pv) in pkgvers.iter().enumerate() {
            let key = format!(
                "{distro}/{}/{}_{}:{}.{ext}",
                pv.name, pv.name, pv.version, pv.epoch
            );
            // Receiver outlives the loop; the send cannot fail.
            let _ = job_tx.send((index, key));
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let results: Mutex<Vec<Option<Result<Vec<u8>>>>> =
            Mutex::new((0..pkgvers.len()).map(|_| None).collect());

        thread::scope(|scope| {
            for _ in 0..self.download_threads {
                let job_rx = Arc::clone(&job_rx);
                let results = &results;
                scope.spawn(move || loop {
                    let (index, key) = {
                        let Ok(guard) = job_rx.lock() else { break };
                        match guard.recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        }
                    };
                    tracing::debug!(key, "downloading");
                    let blob = self.ls.get(&key);
                    if let Ok(mut results) = results.lock() {
                        results[index] = Some(blob);
                    }
                });
            }
        });

        let results = results
            .into_inner()
            .map_err(|_| anyhow!("download results mutex poisoned"))?;
        let mut blobs = Vec::with_capacity(results.len());
        for (index, slot) in results.into_iter().enumerate() {
            let blob = slot
                .ok_or_else(|| anyhow!("artifact {index} was never downloaded"))??;
            blobs.push(blob);
        }
        Ok(blobs)
    }

    pub fn ls_key(&self, pkg: &Package, ext: &str) -> String {
        format!(
            "{}/{}/{}",
            pkg.distro,
            pkg.name,
            pkg.artifact_name(self.epoch, ext)
        )
    }
}

/// `<hh>/<hhhh>/<full-hex-sha256>`.
pub fn cat_key(hex: &str) -> String {
    format!("{}/{}/{}", &hex[0..2], &hex[0..4], hex)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish().context("gzip failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_keys_shard_by_hash_prefix() {
        let hex = "52fdfc072182654f163f5f0f487f69999a621d729566c74d10037c4d7bbb0407";
        assert_eq!(
            "52/52fd/52fdfc072182654f163f5f0f487f69999a621d729566c74d10037c4d7bbb0407",
            cat_key(hex)
        );
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"symbols and more symbols";
        let compressed = gzip(data).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert_eq!(data.to_vec(), out);
    }
}
