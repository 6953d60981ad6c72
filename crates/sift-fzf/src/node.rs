//! Decoding of the consolidated fuzzy-path index.
//!
//! `paths.fzf` is a MessagePack array of binary blobs, one per package; each
//! blob decodes to a `[name, files, children]` node tree. Names are
//! normalized for matching as they are decoded: a leading `/` is prepended
//! and every byte outside printable ASCII is replaced by a zero sentinel.
//!
//! The sentinel means files with non-ASCII names cannot be opened via the
//! reported path. That is a known property of the index format; downstream
//! consumers rely on the 7-bit invariant, so it must not be changed here.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid fuzzy index: {0}")]
pub struct DecodeError(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: Vec<u8>,
    pub files: Vec<Vec<u8>>,
    pub children: Vec<Node>,
}

/// Decodes the outer consolidated index into per-package root nodes.
pub fn decode_index(data: &[u8]) -> Result<Vec<Node>, DecodeError> {
    let mut cur = data;
    let count = rmp::decode::read_array_len(&mut cur)
        .map_err(|err| DecodeError(format!("outer array: {err}")))?;
    let mut roots = Vec::with_capacity(count as usize);
    for i in 0..count {
        let len = rmp::decode::read_bin_len(&mut cur)
            .map_err(|err| DecodeError(format!("package {i} framing: {err}")))?
            as usize;
        if cur.len() < len {
            return Err(DecodeError(format!("package {i} truncated")));
        }
        let (blob, rest) = cur.split_at(len);
        let (node, remainder) = decode_node(blob)?;
        if !remainder.is_empty() {
            return Err(DecodeError(format!(
                "package {i} has {} trailing bytes",
                remainder.len()
            )));
        }
        roots.push(node);
        cur = rest;
    }
    Ok(roots)
}

/// Decodes a single node and its contents, recursively, returning the node
/// and the remaining input.
pub fn decode_node(cur: &[u8]) -> Result<(Node, &[u8]), DecodeError> {
    let mut cur = cur;
    let arity = rmp::decode::read_array_len(&mut cur)
        .map_err(|err| DecodeError(format!("node header: {err}")))?;
    if arity != 3 {
        return Err(DecodeError(format!("node arity {arity}, expected 3")));
    }

    let (name, mut cur) = rmp::decode::read_str_from_slice(cur)
        .map_err(|err| DecodeError(format!("node name: {err}")))?;

    let file_count = rmp::decode::read_array_len(&mut cur)
        .map_err(|err| DecodeError(format!("file list: {err}")))?;
    let mut files = Vec::with_capacity(file_count as usize);
    for _ in 0..file_count {
        let (file, rest) = rmp::decode::read_str_from_slice(cur)
            .map_err(|err| DecodeError(format!("file name: {err}")))?;
        files.push(component(file));
        cur = rest;
    }

    let child_count = rmp::decode::read_array_len(&mut cur)
        .map_err(|err| DecodeError(format!("child list: {err}")))?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        let (child, rest) = decode_node(cur)?;
        children.push(child);
        cur = rest;
    }

    Ok((
        Node {
            name: component(name),
            files,
            children,
        },
        cur,
    ))
}

/// `/` plus the text with every non-ASCII character replaced by the zero
/// sentinel, which no query can match.
fn component(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.push(b'/');
    for c in text.chars() {
        if (c as u32) > 0 && (c as u32) < 128 {
            out.push(c as u8);
        } else {
            out.push(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_analysis::fzf;

    fn encoded(name: &str, files: &[&str], children: Vec<fzf::Node>) -> Vec<u8> {
        fzf::encode(&fzf::Node {
            name: name.into(),
            files: files.iter().map(|f| f.to_string()).collect(),
            children,
        })
        .unwrap()
    }

    #[test]
    fn decodes_a_package_tree() {
        let blob = encoded(
            "zlib",
            &["README"],
            vec![fzf::Node {
                name: "src".into(),
                files: vec!["deflate.c".into()],
                children: Vec::new(),
            }],
        );
        let (node, rest) = decode_node(&blob).unwrap();
        assert!(rest.is_empty());
        assert_eq!(b"/zlib".to_vec(), node.name);
        assert_eq!(vec![b"/README".to_vec()], node.files);
        assert_eq!(b"/src".to_vec(), node.children[0].name);
        assert_eq!(vec![b"/deflate.c".to_vec()], node.children[0].files);
    }

    #[test]
    fn non_ascii_bytes_become_the_zero_sentinel() {
        let blob = encoded("b🦀c", &[], Vec::new());
        let (node, _) = decode_node(&blob).unwrap();
        assert_eq!(vec![b'/', b'b', 0, b'c'], node.name);
    }

    #[test]
    fn decodes_the_outer_sequence() {
        let one = encoded("pkg1", &["foo"], Vec::new());
        let two = encoded("pkg2", &["bar"], Vec::new());
        let mut outer = Vec::new();
        rmp::encode::write_array_len(&mut outer, 2).unwrap();
        rmp::encode::write_bin(&mut outer, &one).unwrap();
        rmp::encode::write_bin(&mut outer, &two).unwrap();

        let roots = decode_index(&outer).unwrap();
        assert_eq!(2, roots.len());
        assert_eq!(b"/pkg1".to_vec(), roots[0].name);
        assert_eq!(b"/pkg2".to_vec(), roots[1].name);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let blob = encoded("pkg", &[], Vec::new());
        let mut outer = Vec::new();
        rmp::encode::write_array_len(&mut outer, 1).unwrap();
        rmp::encode::write_bin(&mut outer, &blob).unwrap();
        outer.truncate(outer.len() - 2);
        assert!(decode_index(&outer).is_err());
    }
}
