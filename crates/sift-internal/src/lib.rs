//! Shared helpers for the sift services: URL joining, retried downloads and
//! the distribution configuration file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

pub mod config;

pub use config::{load_config, Config, DistroConfig, DEFAULT_EPOCH};

const DOWNLOAD_ATTEMPTS: usize = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Parses a URL, panicking on failure. For constants only.
pub fn url_must_parse(s: &str) -> Url {
    match Url::parse(s) {
        Ok(u) => u,
        Err(err) => panic!("invalid constant URL {s}: {err}"),
    }
}

/// Joins path segments onto a base URL with forward-slash separators,
/// preserving any path already present on the base.
pub fn url_with_path(base: &Url, segments: &[&str]) -> Url {
    let mut out = base.clone();
    let mut path = base.path().trim_end_matches('/').to_string();
    for segment in segments {
        for part in segment.split('/') {
            if part.is_empty() {
                continue;
            }
            path.push('/');
            path.push_str(part);
        }
    }
    out.set_path(&path);
    out
}

pub fn http_client() -> Result<&'static reqwest::blocking::Client> {
    static CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();
    if let Some(client) = CLIENT.get() {
        return Ok(client);
    }
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("sift/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to construct HTTP client")?;
    Ok(CLIENT.get_or_init(|| client))
}

/// Downloads a URL into memory, retrying transient failures. Non-200
/// responses are errors. Callers may pass extra path segments as in
/// [`url_with_path`].
pub fn download(base: &Url, segments: &[&str]) -> Result<Vec<u8>> {
    let url = url_with_path(base, segments);
    let mut last_err = None;
    for attempt in 0..DOWNLOAD_ATTEMPTS {
        match download_once(&url) {
            Ok(data) => return Ok(data),
            Err(err) => {
                tracing::debug!(%url, attempt, error = ?err, "download failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("failed to download {url}")))
}

fn download_once(url: &Url) -> Result<Vec<u8>> {
    let response = http_client()?
        .get(url.clone())
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {url}"))?;
    let bytes = response
        .bytes()
        .with_context(|| format!("stream error for {url}"))?;
    Ok(bytes.to_vec())
}

/// Downloads a URL to `dest` atomically: the body is streamed to a temporary
/// file in the destination directory, then renamed into place.
pub fn save_file(dest: &Path, base: &Url, segments: &[&str]) -> Result<()> {
    let url = url_with_path(base, segments);
    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("destination {} has no parent", dest.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut response = http_client()?
        .get(url.clone())
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {url}"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("stream error for {url}"))?;
        if read == 0 {
            break;
        }
        tmp.write_all(&buffer[..read])?;
    }
    persist_or_copy(tmp, dest)?;
    Ok(())
}

fn persist_or_copy(tmp: tempfile::NamedTempFile, dest: &Path) -> io::Result<()> {
    match tmp.persist(dest) {
        Ok(_) => Ok(()),
        Err(err) => {
            // EXDEV: the temp dir and destination are on different devices.
            if err.error.raw_os_error() == Some(18) {
                let mut reader = err.file.reopen()?;
                let mut writer = File::create(dest)?;
                io::copy(&mut reader, &mut writer)?;
                Ok(())
            } else {
                Err(err.error)
            }
        }
    }
}

/// Renders the plain-text error body used by all sift HTTP services, e.g.
/// `"404 Not Found\n"`.
pub fn http_error_body(code: u16) -> String {
    let reason = match code {
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "Error",
    };
    format!("{code} {reason}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_with_path_joins_segments() {
        let base = url_must_parse("https://meta.sift.codes");
        let joined = url_with_path(&base, &["hirsute", "paths.fzf"]);
        assert_eq!("https://meta.sift.codes/hirsute/paths.fzf", joined.as_str());
    }

    #[test]
    fn url_with_path_preserves_base_path() {
        let base = url_must_parse("https://mirror.example.org/ubuntu/");
        let joined = url_with_path(&base, &["dists/hirsute", "Release"]);
        assert_eq!(
            "https://mirror.example.org/ubuntu/dists/hirsute/Release",
            joined.as_str()
        );
    }

    #[test]
    fn url_with_path_skips_empty_segments() {
        let base = url_must_parse("https://ls.sift.codes");
        let joined = url_with_path(&base, &["", "hirsute//zlib", "zlib_1:4.fzf"]);
        assert_eq!(
            "https://ls.sift.codes/hirsute/zlib/zlib_1:4.fzf",
            joined.as_str()
        );
    }

    #[test]
    fn error_body_matches_wire_format() {
        assert_eq!("404 Not Found\n", http_error_body(404));
        assert_eq!("400 Bad Request\n", http_error_body(400));
    }
}
