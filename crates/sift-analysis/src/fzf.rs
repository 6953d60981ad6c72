//! The per-package fuzzy-path tree.
//!
//! A recursive transform of the content tree into `(name, files, children)`
//! nodes, encoded as MessagePack. Each node is a 3-element array; the outer
//! consolidated index wraps the per-package encodings in binary blobs (see
//! the publisher's consolidation pass).

use anyhow::Result;

use crate::tree::{Directory, Inode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub files: Vec<String>,
    pub children: Vec<Node>,
}

/// Builds the fuzzy-path tree for an extracted package. Files keep their
/// leaf names, symlinks are skipped, and the root node is named after the
/// package.
pub fn build(package_name: &str, tree: &Directory) -> Node {
    index_directory(package_name, tree)
}

fn index_directory(name: &str, dir: &Directory) -> Node {
    let mut node = Node {
        name: name.to_string(),
        files: Vec::new(),
        children: Vec::new(),
    };
    for (entry_name, value) in &dir.contents {
        match value {
            Inode::File(_) => node.files.push(entry_name.clone()),
            Inode::Directory(sub) => node.children.push(index_directory(entry_name, sub)),
            Inode::Symlink(_) => {}
        }
    }
    node
}

/// Encodes a node tree as MessagePack: `[name, [files...], [children...]]`,
/// recursively.
pub fn encode(node: &Node) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(node, &mut buf)?;
    Ok(buf)
}

fn encode_into(node: &Node, buf: &mut Vec<u8>) -> Result<()> {
    rmp::encode::write_array_len(buf, 3)?;
    rmp::encode::write_str(buf, &node.name)?;
    rmp::encode::write_array_len(buf, node.files.len() as u32)?;
    for file in &node.files {
        rmp::encode::write_str(buf, file)?;
    }
    rmp::encode::write_array_len(buf, node.children.len() as u32)?;
    for child in &node.children {
        encode_into(child, buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{FileNode, SymlinkNode};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn file() -> Inode {
        Inode::File(FileNode {
            size: 1,
            sha256: [0u8; 32],
            local_path: PathBuf::new(),
        })
    }

    #[test]
    fn transforms_tree_and_skips_symlinks() {
        let mut inner = BTreeMap::new();
        inner.insert("deflate.c".to_string(), file());
        let mut contents = BTreeMap::new();
        contents.insert("README".to_string(), file());
        contents.insert(
            "link".to_string(),
            Inode::Symlink(SymlinkNode {
                target: "README".into(),
                is_dir: false,
            }),
        );
        contents.insert(
            "src".to_string(),
            Inode::Directory(Directory { contents: inner }),
        );

        let node = build("zlib", &Directory { contents });
        assert_eq!("zlib", node.name);
        assert_eq!(vec!["README"], node.files);
        assert_eq!(1, node.children.len());
        assert_eq!("src", node.children[0].name);
        assert_eq!(vec!["deflate.c"], node.children[0].files);
    }

    #[test]
    fn encodes_as_three_element_arrays() {
        let node = Node {
            name: "root".into(),
            files: vec!["foo".into()],
            children: vec![Node {
                name: "sub".into(),
                files: Vec::new(),
                children: Vec::new(),
            }],
        };
        let data = encode(&node).unwrap();
        // fixarray(3), fixstr "root", fixarray(1), fixstr "foo",
        // fixarray(1), then the child node.
        assert_eq!(0x93, data[0]);
        assert_eq!(0xa4, data[1]);
        assert_eq!(b"root", &data[2..6]);
        assert_eq!(0x91, data[6]);
        assert_eq!(0xa3, data[7]);
        assert_eq!(b"foo", &data[8..11]);
        assert_eq!(0x91, data[11]);
        assert_eq!(0x93, data[12]);
    }
}
