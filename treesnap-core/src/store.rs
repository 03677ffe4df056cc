//! Content-addressed reference store: `<root>/<hex[0..2]>/<hex[2..]>`.
//!
//! Append-only. Objects are never rewritten or removed once present, so
//! concurrent readers and writers only ever race on creation, and losing
//! that race is harmless.

use crate::digest;
use anyhow::{bail, Context, Result};
use std::fs::{self, Permissions};
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// `ab/cdef...` for digest `abcdef...`.
pub fn object_relpath(digest: &str) -> String {
    format!("{}/{}", &digest[..2], &digest[2..])
}

/// Check that `relpath` is exactly `<2 hex>/<62 hex>` and return the digest.
pub fn parse_object_relpath(relpath: &str) -> Result<String> {
    let Some((shard, rest)) = relpath.split_once('/') else {
        bail!("content reference {:?} is not <xx>/<rest>", relpath);
    };
    let digest = format!("{}{}", shard, rest);
    if shard.len() != 2 || !digest::is_sha256_hex(&digest) {
        bail!("content reference {:?} is not a sha256 object path", relpath);
    }
    Ok(digest.to_ascii_lowercase())
}

#[derive(Clone, Debug)]
pub struct ReferenceStore {
    root: PathBuf,
}

impl ReferenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the object named by a manifest `contents=` value.
    pub fn object_path(&self, relpath: &str) -> Result<PathBuf> {
        let digest = parse_object_relpath(relpath)?;
        Ok(self.path_for_digest(&digest))
    }

    pub fn path_for_digest(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..2]).join(&digest[2..])
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.path_for_digest(digest).is_file()
    }

    /// Add a copy of `source` as the object for `digest`; the object never
    /// shares an inode with the scanned tree. Returns `false` if the object
    /// was already present.
    pub fn insert(&self, digest: &str, source: &Path) -> Result<bool> {
        let obj = self.path_for_digest(digest);
        if obj.is_file() {
            return Ok(false);
        }
        let shard = self.root.join(&digest[..2]);
        fs::create_dir_all(&shard).with_context(|| format!("create {}", shard.display()))?;
        let mut tmp = NamedTempFile::new_in(&shard)?;
        let mut src = fs::File::open(source).with_context(|| format!("open {}", source.display()))?;
        io::copy(&mut src, tmp.as_file_mut())?;
        tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;
        match tmp.persist_noclobber(&obj) {
            Ok(_) => {
                tracing::debug!("stored {} as {}", source.display(), obj.display());
                Ok(true)
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error).with_context(|| format!("write {}", obj.display())),
        }
    }
}
