use url::Url;

/// An upstream source package as described by the distribution's package
/// index: version-stamped metadata plus the control-file list of constituent
/// archive files.
#[derive(Debug, Clone)]
pub struct Package {
    pub distro: String,
    pub name: String,
    pub version: String,
    /// Archive files listed in the package's control stanza.
    pub files: Vec<SourceFile>,
    /// Path of the package directory relative to the mirror root.
    pub directory: String,
    /// Mirror base URL the files are downloaded from.
    pub mirror: Url,
}

/// One constituent archive file (name, size and SHA-256 from the control
/// stanza).
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

impl Package {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.distro, self.name)
    }

    /// Artifact filename in the `ls` bucket, e.g. `zlib_1.2.11:4.fzf`.
    pub fn artifact_name(&self, epoch: i64, ext: &str) -> String {
        format!("{}_{}:{}.{}", self.name, self.version, epoch, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_embeds_version_and_epoch() {
        let pkg = Package {
            distro: "hirsute".into(),
            name: "zlib".into(),
            version: "1.2.11".into(),
            files: Vec::new(),
            directory: "pool/main/z/zlib".into(),
            mirror: Url::parse("https://mirror.example.org/ubuntu").unwrap(),
        };
        assert_eq!("zlib_1.2.11:4.fzf", pkg.artifact_name(4, "fzf"));
        assert_eq!("hirsute/zlib", pkg.slug());
    }
}
