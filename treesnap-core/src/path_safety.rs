use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Turn a manifest path into a relative `Path`, refusing anything that could
/// land outside the destination: absolute paths and `..` components.
pub fn relative_path(rel: &[u8]) -> Result<&Path> {
    let p = Path::new(OsStr::from_bytes(rel));
    if p.is_absolute() {
        bail!("absolute paths are not allowed: {:?}", p);
    }
    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            bail!("parent traversal not allowed: {:?}", p);
        }
    }
    Ok(p)
}

/// Resolves manifest paths under a destination root and makes sure no
/// existing ancestor is a symlink, so nothing is written through one.
/// Directories already checked are remembered.
#[derive(Debug)]
pub struct Resolver {
    root: PathBuf,
    checked: HashSet<PathBuf>,
}

impl Resolver {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf(), checked: HashSet::new() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&mut self, rel: &[u8]) -> Result<PathBuf> {
        let rel = relative_path(rel)?;
        let mut cur = self.root.clone();
        let mut comps = rel.components().peekable();
        while let Some(comp) = comps.next() {
            cur.push(comp);
            if comps.peek().is_none() || self.checked.contains(&cur) {
                continue;
            }
            match std::fs::symlink_metadata(&cur) {
                Ok(m) if m.file_type().is_symlink() => {
                    bail!("symlink in path (not following): {:?}", cur);
                }
                Ok(_) => {
                    self.checked.insert(cur.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("stat {}", cur.display())),
            }
        }
        Ok(cur)
    }
}
