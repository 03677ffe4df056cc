use crate::manifest::{render_path, Entry, EntryKind, Line, MTime, ManifestReader};
use crate::path_safety::Resolver;
use crate::store::ReferenceStore;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File, Metadata, Permissions};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub reference_store: Option<PathBuf>,
    /// Re-create paths recorded as hard links of an earlier entry.
    pub hard_links: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { reference_store: None, hard_links: true }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ApplySummary {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub linked_from_store: u64,
    pub copied_from_store: u64,
    pub kept_in_place: u64,
    pub hard_links: u64,
    pub skipped_optional: u64,
}

/// Reconstruct the tree described by `manifest` under `dest`.
///
/// `dest` should be absent, empty, or a skeleton left by
/// [`crate::minimize::minimize`] from the same tree. Failures leave a
/// partially populated destination behind; callers should throw it away and
/// start again.
pub fn apply(manifest: &Path, dest: &Path, opts: &ApplyOptions) -> Result<ApplySummary> {
    let reader = ManifestReader::open(manifest)?;
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut applier = Applier::new(dest, opts);
    for item in reader {
        let (lineno, line) = item.with_context(|| format!("parse {}", manifest.display()))?;
        applier.line(line).with_context(|| format!("{}: line {}", manifest.display(), lineno))?;
    }
    applier.finish()
}

struct Applier {
    resolver: Resolver,
    store: Option<ReferenceStore>,
    hard_links: bool,
    /// Directories in manifest order, finished once everything is placed.
    dirs: Vec<(PathBuf, Option<u32>, Option<MTime>)>,
    pending_links: Vec<(Vec<u8>, Vec<u8>)>,
    /// Store objects already hard-linked by this run.
    claimed: HashSet<PathBuf>,
    summary: ApplySummary,
}

impl Applier {
    fn new(dest: &Path, opts: &ApplyOptions) -> Self {
        Self {
            resolver: Resolver::new(dest),
            store: opts.reference_store.as_ref().map(ReferenceStore::new),
            hard_links: opts.hard_links,
            dirs: Vec::new(),
            pending_links: Vec::new(),
            claimed: HashSet::new(),
            summary: ApplySummary::default(),
        }
    }

    fn line(&mut self, line: Line) -> Result<()> {
        match line {
            Line::Entry(e) => {
                let path = self.resolver.resolve(&e.path)?;
                match e.kind {
                    EntryKind::Dir => self.dir(&e, path),
                    EntryKind::Link => self.symlink(&e, &path),
                    EntryKind::File => self.file(&e, &path),
                }
            }
            Line::HardLink { path, first } => {
                self.pending_links.push((path, first));
                Ok(())
            }
        }
    }

    fn dir(&mut self, e: &Entry, path: PathBuf) -> Result<()> {
        match fs::symlink_metadata(&path) {
            Ok(md) if md.is_dir() => {
                // Skeleton directories keep their final mode; make sure we
                // can still populate them until finish() puts it back.
                if md.mode() & 0o200 == 0 {
                    fs::set_permissions(&path, Permissions::from_mode((md.mode() & 0o7777) | 0o700))?;
                }
            }
            Ok(_) => bail!("{} exists and is not a directory", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&path).with_context(|| format!("mkdir {}", path.display()))?;
            }
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        }
        tracing::debug!("dir {}", render_path(&e.path));
        self.summary.directories += 1;
        self.dirs.push((path, e.mode, e.mtime));
        Ok(())
    }

    fn symlink(&mut self, e: &Entry, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let Some(target) = e.link.as_deref().map(OsStr::from_bytes) else {
            bail!("{}: symlink without target", render_path(&e.path));
        };
        match fs::symlink_metadata(path) {
            Ok(md) if md.file_type().is_symlink() => {
                if fs::read_link(path)?.as_os_str() != target {
                    fs::remove_file(path)?;
                    std::os::unix::fs::symlink(target, path)
                        .with_context(|| format!("symlink {}", path.display()))?;
                }
            }
            Ok(_) => bail!("{} exists and is not a symlink", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                std::os::unix::fs::symlink(target, path)
                    .with_context(|| format!("symlink {}", path.display()))?;
            }
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        }
        if let Some(t) = e.mtime {
            filetime::set_symlink_file_times(path, t.to_filetime(), t.to_filetime())
                .with_context(|| format!("set times on {}", path.display()))?;
        }
        tracing::debug!("link {}", render_path(&e.path));
        self.summary.symlinks += 1;
        Ok(())
    }

    fn file(&mut self, e: &Entry, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        match fs::symlink_metadata(path) {
            Ok(md) if md.is_file() => {
                if md.len() != e.size() {
                    bail!(
                        "{} exists with size {} but the manifest records {}",
                        path.display(),
                        md.len(),
                        e.size()
                    );
                }
                self.summary.kept_in_place += 1;
            }
            Ok(_) => bail!("{} exists and is not a regular file", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if e.size() == 0 {
                    File::create(path).with_context(|| format!("create {}", path.display()))?;
                } else if !self.place_content(e, path)? {
                    self.summary.skipped_optional += 1;
                    return Ok(());
                }
            }
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        }
        // Linking or copying leaves whatever metadata the source had, so the
        // recorded mode and time go on last.
        if let Some(mode) = e.mode {
            fs::set_permissions(path, Permissions::from_mode(mode))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        if let Some(t) = e.mtime {
            filetime::set_file_mtime(path, t.to_filetime())
                .with_context(|| format!("set mtime on {}", path.display()))?;
        }
        tracing::debug!("file {}", render_path(&e.path));
        self.summary.files += 1;
        Ok(())
    }

    /// Fill `path` from the reference store. `Ok(false)` means an optional
    /// entry had no content available and was skipped.
    fn place_content(&mut self, e: &Entry, path: &Path) -> Result<bool> {
        let name = render_path(&e.path);
        let Some(store) = &self.store else {
            if e.optional {
                return Ok(false);
            }
            bail!("{}: {} bytes of content needed but no reference store given", name, e.size());
        };
        let Some(relpath) = e.content_ref() else {
            bail!("{}: no sha256 or contents to look up in the reference store", name);
        };
        let obj = store.object_path(&relpath).with_context(|| name.clone())?;
        let obj_md = match fs::metadata(&obj) {
            Ok(md) => md,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if e.optional {
                    tracing::debug!("{}: {} not in store, optional", name, relpath);
                    return Ok(false);
                }
                bail!("{}: content {} missing from reference store {}", name, relpath, store.root().display());
            }
            Err(err) => return Err(err).with_context(|| format!("stat {}", obj.display())),
        };
        if obj_md.len() != e.size() {
            bail!("{}: store object {} has size {}, expected {}", name, obj.display(), obj_md.len(), e.size());
        }

        // An object linked earlier in this run already carries that entry's
        // mode and time; only share it again if they are the same.
        if !self.claimed.contains(&obj) || metadata_matches(&obj_md, e) {
            match fs::hard_link(&obj, path) {
                Ok(()) => {
                    self.claimed.insert(obj);
                    self.summary.linked_from_store += 1;
                    return Ok(true);
                }
                Err(err) => tracing::debug!("link {} failed ({}), copying", obj.display(), err),
            }
        }
        fs::copy(&obj, path).with_context(|| format!("copy {} to {}", obj.display(), path.display()))?;
        self.summary.copied_from_store += 1;
        Ok(true)
    }

    fn finish(mut self) -> Result<ApplySummary> {
        if self.hard_links {
            for (rel, first_rel) in std::mem::take(&mut self.pending_links) {
                self.relink(&rel, &first_rel)?;
            }
        }
        // Deepest first, so setting a parent's time is not undone by work
        // in a child and a read-only parent does not block its children.
        for (path, mode, mtime) in self.dirs.iter().rev() {
            if let Some(mode) = mode {
                fs::set_permissions(path, Permissions::from_mode(*mode))
                    .with_context(|| format!("chmod {}", path.display()))?;
            }
            if let Some(t) = mtime {
                filetime::set_file_mtime(path, t.to_filetime())
                    .with_context(|| format!("set mtime on {}", path.display()))?;
            }
        }
        Ok(self.summary)
    }

    fn relink(&mut self, rel: &[u8], first_rel: &[u8]) -> Result<()> {
        let path = self.resolver.resolve(rel)?;
        let first = self.resolver.resolve(first_rel)?;
        let first_md = match fs::symlink_metadata(&first) {
            Ok(md) if md.is_file() => md,
            _ => {
                tracing::warn!(
                    "{} not created, cannot link {} to it",
                    render_path(first_rel),
                    render_path(rel)
                );
                return Ok(());
            }
        };
        ensure_parent(&path)?;
        match fs::symlink_metadata(&path) {
            Ok(md) if md.dev() == first_md.dev() && md.ino() == first_md.ino() => return Ok(()),
            Ok(md) if md.is_file() => {
                tracing::debug!("{} already present as a separate file", render_path(rel));
                return Ok(());
            }
            Ok(_) => bail!("{} exists and is not a regular file", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
        }
        fs::hard_link(&first, &path)
            .with_context(|| format!("link {} to {}", path.display(), first.display()))?;
        self.summary.hard_links += 1;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    Ok(())
}

fn metadata_matches(md: &Metadata, e: &Entry) -> bool {
    e.mode.map_or(true, |m| md.mode() & 0o7777 == m)
        && e.mtime.map_or(true, |t| MTime::from_metadata(md) == t)
}
