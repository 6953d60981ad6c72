//! Upstream repository enumeration: the `Release` control file names each
//! component's source index, which in turn lists every package with its
//! constituent files.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use sift_analysis::{Package, SourceFile};
use sift_internal::DistroConfig;
use url::Url;

use crate::control;

/// One (area, component) axis of a distribution, with the resolved by-hash
/// URL of its source index.
#[derive(Debug, Clone)]
pub struct Source {
    pub distro: String,
    pub area: String,
    pub component: String,
    pub source_index: Url,
    pub download_base: Url,
}

impl Source {
    pub fn slug(&self) -> String {
        let mut slug = self.distro.clone();
        if !self.area.is_empty() {
            slug.push('-');
            slug.push_str(&self.area);
        }
        slug.push(':');
        slug.push_str(&self.component);
        slug
    }
}

/// Enumerates a distribution's sources (areas × components). Components
/// whose source index is empty are skipped with a warning.
pub fn fetch_sources(distro_name: &str, config: &DistroConfig) -> Result<Vec<Source>> {
    let mirror = Url::parse(&config.mirror)
        .with_context(|| format!("invalid mirror URL for {distro_name}"))?;

    let mut sources = Vec::new();
    for area in &config.areas {
        let mut slug = distro_name.to_string();
        if !area.is_empty() {
            slug.push('-');
            slug.push_str(area);
        }

        let release = sift_internal::download(&mirror, &["dists", &slug, "Release"])
            .with_context(|| format!("failed to fetch Release for {slug}"))?;
        let release = control::parse(&String::from_utf8_lossy(&release))
            .with_context(|| format!("failed to parse Release for {slug}"))?;

        for component in &config.components {
            let index_name = format!("{component}/source/Sources.xz");
            let entry = release
                .find_file("SHA256", &index_name)?
                .filter(|entry| entry.size > 0);
            let Some(entry) = entry else {
                tracing::warn!(slug, component, "source index missing or empty, skipping");
                continue;
            };
            let source_index = sift_internal::url_with_path(
                &mirror,
                &[
                    "dists",
                    &slug,
                    component,
                    "source",
                    "by-hash",
                    "SHA256",
                    &entry.hash,
                ],
            );
            sources.push(Source {
                distro: distro_name.to_string(),
                area: area.clone(),
                component: component.clone(),
                source_index,
                download_base: mirror.clone(),
            });
        }
    }
    Ok(sources)
}

/// Downloads and parses one source index into its package list.
pub fn fetch_packages(source: &Source) -> Result<Vec<Package>> {
    let compressed = sift_internal::download(&source.source_index, &[])
        .with_context(|| format!("failed to fetch source index for {}", source.slug()))?;

    let mut decoder = xz2::read::XzDecoder::new(compressed.as_slice());
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .with_context(|| format!("failed to decompress source index for {}", source.slug()))?;

    parse_packages(source, &text)
}

fn parse_packages(source: &Source, text: &str) -> Result<Vec<Package>> {
    let mut packages = Vec::new();
    for raw in text.split("\n\n") {
        if raw.trim().is_empty() {
            continue;
        }
        let stanza = control::parse(raw)
            .with_context(|| format!("malformed stanza in {}", source.slug()))?;
        let name = stanza.get_required("Package")?.to_string();
        let files = stanza
            .get_files("Checksums-Sha256")?
            .into_iter()
            .map(|entry| SourceFile {
                name: entry.name,
                size: entry.size,
                sha256: entry.hash,
            })
            .collect();
        packages.push(Package {
            distro: source.distro.clone(),
            name,
            version: stanza.get_required("Version")?.to_string(),
            files,
            directory: stanza.get_required("Directory")?.to_string(),
            mirror: source.download_base.clone(),
        });
    }
    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Source {
        Source {
            distro: "hirsute".into(),
            area: "updates".into(),
            component: "main".into(),
            source_index: Url::parse("https://mirror.example.org/x").unwrap(),
            download_base: Url::parse("https://mirror.example.org/ubuntu").unwrap(),
        }
    }

    #[test]
    fn slug_includes_area_and_component() {
        assert_eq!("hirsute-updates:main", source().slug());
        let mut bare = source();
        bare.area = String::new();
        assert_eq!("hirsute:main", bare.slug());
    }

    #[test]
    fn parses_a_source_index() {
        let text = "Package: zlib\n\
            Version: 1.2.11\n\
            Directory: pool/main/z/zlib\n\
            Checksums-Sha256:\n \
            aaaa 100 zlib_1.2.11.dsc\n \
            bbbb 2000 zlib_1.2.11.orig.tar.gz\n\
            \n\
            Package: acl\n\
            Version: 2.2.53\n\
            Directory: pool/main/a/acl\n\
            Checksums-Sha256:\n \
            cccc 300 acl_2.2.53.dsc\n";
        let packages = parse_packages(&source(), text).unwrap();
        assert_eq!(2, packages.len());
        assert_eq!("zlib", packages[0].name);
        assert_eq!(2, packages[0].files.len());
        assert_eq!("aaaa", packages[0].files[0].sha256);
        assert_eq!("pool/main/a/acl", packages[1].directory);
    }

    #[test]
    fn stanza_without_package_field_is_an_error() {
        assert!(parse_packages(&source(), "Version: 1\nDirectory: d\n").is_err());
    }
}
