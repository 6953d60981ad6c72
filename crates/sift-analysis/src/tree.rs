//! The content-addressed directory tree.
//!
//! A single depth-first walk of an extracted package hashes every regular
//! file exactly once and produces a tree of [`Inode`] values. The tree is a
//! pure function of the filesystem contents, modulo skipped special files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the empty byte string.
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Anything a directory can contain. A closed, tagged sum; consumers dispatch
/// on the tag.
#[derive(Debug, Clone)]
pub enum Inode {
    File(FileNode),
    Directory(Directory),
    Symlink(SymlinkNode),
}

#[derive(Debug, Clone)]
pub struct Directory {
    pub contents: BTreeMap<String, Inode>,
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub size: u64,
    pub sha256: [u8; 32],
    /// Absolute path on the local filesystem, for the later upload pass.
    pub local_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SymlinkNode {
    /// Raw link target with the extraction-root prefix stripped. Broken
    /// targets are preserved as-is.
    pub target: String,
    pub is_dir: bool,
}

impl Directory {
    /// Recursively enumerates the directory and returns a flattened list of
    /// its regular files, sorted ascending by name within each directory,
    /// depth-first.
    pub fn files(&self) -> Vec<FileNode> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files(&self, out: &mut Vec<FileNode>) {
        for node in self.contents.values() {
            match node {
                Inode::Directory(dir) => dir.collect_files(out),
                Inode::File(file) => out.push(file.clone()),
                Inode::Symlink(_) => {}
            }
        }
    }
}

/// Walks `root` and produces the [`Directory`] representing it. Symbolic
/// links are recorded as values, never followed; FIFOs, sockets and devices
/// are skipped with a warning.
pub fn walk(root: &Path) -> Result<Directory> {
    let root_str = root
        .to_string_lossy()
        .trim_end_matches('/')
        .to_string();
    walk_dir(root, &root_str)
}

fn walk_dir(dir: &Path, root: &str) -> Result<Directory> {
    let mut contents = BTreeMap::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = meta.file_type();

        let node = if file_type.is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("failed to read link {}", path.display()))?;
            let target = target.to_string_lossy().into_owned();
            let target = target.strip_prefix(root).unwrap_or(&target).to_string();
            // Broken links stat to an error and are kept as file symlinks.
            let is_dir = fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
            Inode::Symlink(SymlinkNode { target, is_dir })
        } else if file_type.is_dir() {
            Inode::Directory(walk_dir(&path, root)?)
        } else if file_type.is_file() {
            let (size, sha256) = hash_file(&path)?;
            Inode::File(FileNode {
                size,
                sha256,
                local_path: path,
            })
        } else {
            tracing::warn!(path = %path.display(), "skipping special file");
            continue;
        };
        contents.insert(name, node);
    }
    Ok(Directory { contents })
}

fn hash_file(path: &Path) -> Result<(u64, [u8; 32])> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("read error in {}", path.display()))?;
        if read == 0 {
            break;
        }
        size += read as u64;
        hasher.update(&buffer[..read]);
    }
    Ok((size, hasher.finalize().into()))
}

impl Serialize for Inode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Inode::File(f) => f.serialize(serializer),
            Inode::Directory(d) => d.serialize(serializer),
            Inode::Symlink(s) => s.serialize(serializer),
        }
    }
}

impl Serialize for Directory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "directory")?;
        map.serialize_entry("contents", &self.contents)?;
        map.end()
    }
}

impl Serialize for FileNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", "file")?;
        map.serialize_entry("size", &self.size)?;
        map.serialize_entry("sha256", &hex::encode(self.sha256))?;
        map.end()
    }
}

impl Serialize for SymlinkNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", "symlink")?;
        map.serialize_entry("symlink_to", &self.target)?;
        map.serialize_entry("is_directory", &self.is_dir)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn serializes_with_type_discriminators() {
        let mut sha256 = [0u8; 32];
        hex::decode_to_slice(
            "52fdfc072182654f163f5f0f487f69999a621d729566c74d10037c4d7bbb0407",
            &mut sha256,
        )
        .unwrap();
        let mut contents = BTreeMap::new();
        contents.insert(
            "file.txt".to_string(),
            Inode::File(FileNode {
                size: 123,
                sha256,
                local_path: PathBuf::new(),
            }),
        );
        let root = Directory { contents };

        let expected = r#"{
  "type": "directory",
  "contents": {
    "file.txt": {
      "type": "file",
      "size": 123,
      "sha256": "52fdfc072182654f163f5f0f487f69999a621d729566c74d10037c4d7bbb0407"
    }
  }
}"#;
        assert_eq!(expected, serde_json::to_string_pretty(&root).unwrap());
    }

    #[test]
    fn walk_hashes_files_and_records_links() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        let mut f = File::create(root.join("hello.txt")).unwrap();
        f.write_all(b"Hello, World!\n").unwrap();
        fs::create_dir(root.join("somedir")).unwrap();
        let mut f = File::create(root.join("somedir/foo.bar")).unwrap();
        f.write_all(b"Buzz\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("../hello.txt", root.join("somedir/somelink")).unwrap();

        let tree = walk(root).unwrap();
        let files = tree.files();
        assert_eq!(2, files.len());
        assert!(files[0].local_path.ends_with("hello.txt"));
        assert!(files[1].local_path.ends_with("somedir/foo.bar"));

        assert_eq!(
            "c98c24b677eff44860afea6f493bbaec5bb1c4cbb209c6fc2bbb47f66ff2ad31",
            hex::encode(files[0].sha256)
        );
        assert_eq!(14, files[0].size);
        let foo = hex::encode(files[1].sha256);
        assert!(foo.starts_with("49753fbc"), "got {foo}");
        assert!(foo.ends_with("e192"), "got {foo}");
        assert_eq!(5, files[1].size);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_targets_are_classified() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("to_dir")).unwrap();
        std::os::unix::fs::symlink("missing", root.join("dangling")).unwrap();

        let tree = walk(root).unwrap();
        match &tree.contents["to_dir"] {
            Inode::Symlink(link) => {
                assert!(link.is_dir);
                // Absolute target inside the package has the root stripped.
                assert_eq!("/real", link.target);
            }
            other => panic!("expected symlink, got {other:?}"),
        }
        match &tree.contents["dangling"] {
            Inode::Symlink(link) => {
                assert!(!link.is_dir);
                assert_eq!("missing", link.target);
            }
            other => panic!("expected symlink, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_has_the_empty_hash() {
        let temp = tempfile::tempdir().unwrap();
        File::create(temp.path().join("empty")).unwrap();
        let tree = walk(temp.path()).unwrap();
        let files = tree.files();
        assert_eq!(0, files[0].size);
        assert_eq!(EMPTY_SHA256, hex::encode(files[0].sha256));
    }

    #[test]
    fn files_are_sorted_within_each_directory() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        for name in ["zeta", "alpha", "mid"] {
            File::create(root.join(name)).unwrap();
        }
        fs::create_dir(root.join("bdir")).unwrap();
        File::create(root.join("bdir/inner")).unwrap();

        let names: Vec<String> = walk(root)
            .unwrap()
            .files()
            .iter()
            .map(|f| {
                f.local_path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(vec!["alpha", "inner", "mid", "zeta"], names);
    }
}
