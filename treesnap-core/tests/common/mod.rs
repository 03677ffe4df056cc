#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub kind: &'static str,
    /// `None` for symlinks.
    pub mode: Option<u32>,
    pub mtime: (i64, i64),
    pub content: Option<Vec<u8>>,
    pub link: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Tree {
    pub nodes: BTreeMap<Vec<u8>, Node>,
    /// Paths that share an inode with another path in the same tree.
    pub link_groups: Vec<Vec<Vec<u8>>>,
}

/// Everything about `root` that a manifest is supposed to preserve.
pub fn snapshot(root: &Path) -> Tree {
    let mut nodes = BTreeMap::new();
    let mut inodes: HashMap<(u64, u64), Vec<Vec<u8>>> = HashMap::new();
    for ent in walkdir::WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let ent = ent.unwrap();
        let rel = ent.path().strip_prefix(root).unwrap().as_os_str().as_bytes().to_vec();
        let md = fs::symlink_metadata(ent.path()).unwrap();
        let ft = md.file_type();
        let mut node = Node {
            kind: "dir",
            mode: Some(md.mode() & 0o7777),
            mtime: (md.mtime(), md.mtime_nsec()),
            content: None,
            link: None,
        };
        if ft.is_symlink() {
            node.kind = "link";
            node.mode = None;
            node.link = Some(fs::read_link(ent.path()).unwrap().as_os_str().as_bytes().to_vec());
        } else if ft.is_file() {
            node.kind = "file";
            node.content = Some(fs::read(ent.path()).unwrap());
            inodes.entry((md.dev(), md.ino())).or_default().push(rel.clone());
        }
        nodes.insert(rel, node);
    }
    let mut link_groups: Vec<Vec<Vec<u8>>> = inodes.into_values().filter(|g| g.len() > 1).collect();
    for g in &mut link_groups {
        g.sort();
    }
    link_groups.sort();
    Tree { nodes, link_groups }
}

pub fn assert_same_tree(expected: &Tree, actual: &Tree) {
    for (path, node) in &expected.nodes {
        match actual.nodes.get(path) {
            Some(other) => assert_eq!(node, other, "{}", String::from_utf8_lossy(path)),
            None => panic!("{} missing", String::from_utf8_lossy(path)),
        }
    }
    for path in actual.nodes.keys() {
        assert!(expected.nodes.contains_key(path), "unexpected {}", String::from_utf8_lossy(path));
    }
    assert_eq!(expected.link_groups, actual.link_groups);
}

pub fn write_file(path: &Path, data: &[u8], mode: u32, mtime: (i64, u32)) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime.0, mtime.1)).unwrap();
}

pub fn set_dir(path: &Path, mode: u32, mtime: (i64, u32)) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime.0, mtime.1)).unwrap();
}

/// A small tree with every kind of entry a runtime snapshot tends to have:
/// nested directories with odd modes, empty files, hard links, absolute,
/// relative and dangling symlinks, and a name that is not UTF-8.
pub fn sample_tree(root: &Path) {
    use std::ffi::OsStr;
    use std::os::unix::fs::symlink;

    fs::create_dir_all(root.join("usr/bin")).unwrap();
    fs::create_dir_all(root.join("usr/lib/empty")).unwrap();
    fs::create_dir_all(root.join("etc")).unwrap();
    write_file(&root.join("usr/bin/tool"), b"#!/bin/sh\necho tool\n", 0o755, (1_600_000_000, 123_456_789));
    write_file(&root.join("usr/lib/libfoo.so.1"), &vec![7u8; 10_000], 0o644, (1_600_000_001, 1));
    write_file(&root.join("etc/config"), b"key = value\n", 0o640, (1_600_000_002, 999_999_999));
    write_file(&root.join("etc/empty"), b"", 0o600, (1_600_000_003, 0));
    write_file(&root.join("etc/same-as-config"), b"key = value\n", 0o444, (1_600_000_004, 5));
    fs::hard_link(root.join("usr/bin/tool"), root.join("usr/bin/tool-alias")).unwrap();
    write_file(&root.join(OsStr::from_bytes(b"etc/caf\xe9 menu")), b"latin-1 name", 0o644, (1_600_000_005, 0));
    write_file(&root.join(".ref"), b"", 0o644, (1_600_000_006, 0));
    symlink("libfoo.so.1", root.join("usr/lib/libfoo.so")).unwrap();
    symlink("/usr/bin/tool", root.join("etc/abs-link")).unwrap();
    symlink("../nowhere/at/all", root.join("etc/dangling")).unwrap();
    set_dir(&root.join("usr/lib/empty"), 0o2750, (1_500_000_000, 42));
    set_dir(&root.join("usr/lib"), 0o755, (1_500_000_001, 0));
    set_dir(&root.join("usr/bin"), 0o755, (1_500_000_002, 7));
    set_dir(&root.join("usr"), 0o755, (1_500_000_003, 0));
    set_dir(&root.join("etc"), 0o750, (1_500_000_004, 0));
    set_dir(root, 0o755, (1_500_000_005, 0));
}
