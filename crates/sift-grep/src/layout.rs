//! On-disk layout of the serving data directories.
//!
//! Indexes live on the fast disk, extracted sources on the bulk disk, both
//! under `grep/<distro>/<prefix>/<package>/`. The prefix shard is the first
//! byte of the package name, or the first four bytes for the very large
//! `lib*` namespace.

use std::path::{Path, PathBuf};

pub fn package_prefix(name: &str) -> &str {
    if name.starts_with("lib") && name.len() > 3 {
        &name[0..4]
    } else {
        &name[0..name.len().min(1)]
    }
}

pub fn local_dir(base: &Path, distro: &str, package: &str) -> PathBuf {
    base.join("grep")
        .join(distro)
        .join(package_prefix(package))
        .join(package)
}

pub fn artifact_filename(package: &str, version: &str, epoch: i64, ext: &str) -> String {
    format!("{package}_{version}:{epoch}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_one_byte_except_lib() {
        assert_eq!("z", package_prefix("zlib"));
        assert_eq!("libf", package_prefix("libfoo"));
        assert_eq!("l", package_prefix("lib"));
        assert_eq!("", package_prefix(""));
    }

    #[test]
    fn local_dir_shards_by_prefix() {
        let dir = local_dir(Path::new("/data"), "hirsute", "libzstd");
        assert_eq!(Path::new("/data/grep/hirsute/libz/libzstd"), dir);
    }

    #[test]
    fn artifact_filename_carries_epoch() {
        assert_eq!(
            "zlib_1.2.11:4.tar.zst",
            artifact_filename("zlib", "1.2.11", 4, "tar.zst")
        );
    }
}
