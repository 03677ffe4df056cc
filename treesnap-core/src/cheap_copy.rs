//! Fast duplication of a directory tree. Regular files are hard-linked
//! whenever possible, so a copy of a large runtime costs little more than
//! its directory structure.

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Top-level directories that `usrmerge` folds into `usr/`.
pub const USRMERGE_DIRS: &[&str] = &["bin", "lib", "lib32", "lib64", "sbin"];

#[derive(Clone, Copy, Debug, Default)]
pub struct CopyOptions {
    /// Turn top-level `bin`, `lib*` and `sbin` directories into symlinks to
    /// `usr/<name>`, merging their contents there.
    pub usrmerge: bool,
    /// Copy file contents instead of hard-linking.
    pub force_copy: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CopySummary {
    pub hard_linked: u64,
    pub copied: u64,
    pub symlinks: u64,
    pub directories: u64,
    /// Symlinks dropped by `usrmerge` because they would point at themselves.
    pub redundant_symlinks: u64,
    pub skipped: u64,
}

/// Copy `source` to `dest`. `dest` must not exist (its parent must) or be an
/// empty directory.
pub fn cheap_copy(source: &Path, dest: &Path, opts: &CopyOptions) -> Result<CopySummary> {
    let src_md =
        fs::symlink_metadata(source).with_context(|| format!("stat {}", source.display()))?;
    if !src_md.is_dir() {
        bail!("{} is not a directory", source.display());
    }
    prepare_destination(dest)?;

    let mut copier = Copier::new(dest, opts);
    copier.note_dir(PathBuf::new(), src_md.mode(), false);
    let walker = WalkDir::new(source).min_depth(1).follow_links(false).sort_by_file_name();
    for ent in walker {
        let ent = ent.with_context(|| format!("walk {}", source.display()))?;
        let rel = ent.path().strip_prefix(source)?.to_path_buf();
        copier.entry(&ent, &rel).with_context(|| format!("copy {}", ent.path().display()))?;
    }
    copier.finish()
}

fn prepare_destination(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(md) if md.is_dir() => {
            if fs::read_dir(dest)?.next().is_some() {
                bail!("{} already exists and is not empty", dest.display());
            }
            Ok(())
        }
        Ok(_) => bail!("{} already exists", dest.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir(dest)
            .with_context(|| format!("create {} (its parent must exist)", dest.display())),
        Err(e) => Err(e).with_context(|| format!("stat {}", dest.display())),
    }
}

struct Copier<'a> {
    dest: &'a Path,
    usrmerge: bool,
    force_copy: bool,
    /// Top-level directories currently being merged into `usr/`.
    merging: HashSet<OsString>,
    /// Destination paths (relative) that came from a merged directory and
    /// may be overridden by the `usr/` side.
    from_merge: HashSet<PathBuf>,
    dir_modes: HashMap<PathBuf, u32>,
    dir_order: Vec<PathBuf>,
    summary: CopySummary,
}

impl<'a> Copier<'a> {
    fn new(dest: &'a Path, opts: &CopyOptions) -> Self {
        Self {
            dest,
            usrmerge: opts.usrmerge,
            force_copy: opts.force_copy,
            merging: HashSet::new(),
            from_merge: HashSet::new(),
            dir_modes: HashMap::new(),
            dir_order: Vec::new(),
            summary: CopySummary::default(),
        }
    }

    fn entry(&mut self, ent: &walkdir::DirEntry, rel: &Path) -> Result<()> {
        let md = ent.metadata()?;
        let ft = md.file_type();
        if self.usrmerge && ent.depth() == 1 && ft.is_dir() && is_usrmerge_dir(ent.file_name()) {
            return self.start_merge(ent.file_name(), md.mode());
        }
        let (mapped, merged) = self.map(rel);
        let target = self.dest.join(&mapped);

        if ft.is_dir() {
            match fs::symlink_metadata(&target) {
                Ok(existing) if existing.is_dir() => {}
                Ok(_) => {
                    if !self.claim(&mapped, merged)? {
                        return Ok(());
                    }
                    fs::create_dir(&target)?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir(&target)?,
                Err(e) => return Err(e.into()),
            }
            self.note_dir(mapped.clone(), md.mode(), merged);
            self.summary.directories += 1;
        } else if ft.is_symlink() {
            let link = fs::read_link(ent.path())?;
            if self.usrmerge && points_to_itself(rel, &mapped, &link) {
                tracing::debug!("dropping {} -> {} (same file after usrmerge)", rel.display(), link.display());
                self.summary.redundant_symlinks += 1;
                return Ok(());
            }
            let link = if merged { retarget(rel, &mapped, link) } else { link };
            if !self.claim(&mapped, merged)? {
                return Ok(());
            }
            std::os::unix::fs::symlink(&link, &target)?;
            self.summary.symlinks += 1;
        } else if ft.is_file() {
            if !self.claim(&mapped, merged)? {
                return Ok(());
            }
            self.link_or_copy(ent.path(), &target, &md)?;
        } else {
            tracing::warn!("skipping {} (not a file, directory or symlink)", ent.path().display());
            self.summary.skipped += 1;
            return Ok(());
        }
        if merged {
            self.from_merge.insert(mapped);
        }
        Ok(())
    }

    /// Replace top-level `name` with `name -> usr/name` and send its contents
    /// to `usr/name`.
    fn start_merge(&mut self, name: &OsStr, mode: u32) -> Result<()> {
        let usr_sub = Path::new("usr").join(name);
        let target = self.dest.join(&usr_sub);
        if fs::symlink_metadata(&target).is_err() {
            fs::create_dir_all(&target).with_context(|| format!("mkdir {}", target.display()))?;
            self.from_merge.insert(usr_sub.clone());
        }
        self.note_dir(usr_sub.clone(), mode, true);
        std::os::unix::fs::symlink(&usr_sub, self.dest.join(name))?;
        self.merging.insert(name.to_os_string());
        self.summary.symlinks += 1;
        tracing::debug!("merging {} into {}", name.to_string_lossy(), usr_sub.display());
        Ok(())
    }

    /// Where `rel` lands in the destination, and whether it was redirected
    /// by a merge.
    fn map(&self, rel: &Path) -> (PathBuf, bool) {
        if let Some(Component::Normal(first)) = rel.components().next() {
            if self.merging.contains(first) {
                return (Path::new("usr").join(rel), true);
            }
        }
        (rel.to_path_buf(), false)
    }

    /// Decide whether to create `mapped`. Existing `usr/` entries win over
    /// merged ones; a merged entry in the way of a `usr/` entry is removed.
    fn claim(&mut self, mapped: &Path, merged: bool) -> Result<bool> {
        let target = self.dest.join(mapped);
        let existing = match fs::symlink_metadata(&target) {
            Ok(md) => md,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if merged {
            tracing::debug!("{} already provided, keeping it", mapped.display());
            return Ok(false);
        }
        if !self.from_merge.contains(mapped) {
            bail!("{} already exists", target.display());
        }
        if existing.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        self.from_merge.retain(|p| !p.starts_with(mapped));
        self.dir_modes.retain(|p, _| !p.starts_with(mapped));
        Ok(true)
    }

    fn note_dir(&mut self, path: PathBuf, mode: u32, merged: bool) {
        if !self.dir_modes.contains_key(&path) {
            self.dir_order.push(path.clone());
            self.dir_modes.insert(path, mode & 0o7777);
        } else if !merged {
            self.dir_modes.insert(path, mode & 0o7777);
        }
    }

    fn link_or_copy(&mut self, src: &Path, dst: &Path, src_md: &Metadata) -> Result<()> {
        if !self.force_copy {
            match fs::hard_link(src, dst) {
                Ok(()) => {
                    let md = fs::symlink_metadata(dst)?;
                    if md.dev() == src_md.dev() && md.ino() == src_md.ino() {
                        self.summary.hard_linked += 1;
                        return Ok(());
                    }
                    tracing::debug!("{} is not the same inode after linking, copying", dst.display());
                    fs::remove_file(dst)?;
                }
                Err(e) => tracing::debug!("hard link {} failed ({}), copying", src.display(), e),
            }
        }
        fs::copy(src, dst).with_context(|| format!("copy to {}", dst.display()))?;
        fs::set_permissions(dst, Permissions::from_mode(src_md.mode() & 0o7777))?;
        // Whole seconds only.
        filetime::set_file_mtime(dst, FileTime::from_unix_time(src_md.mtime(), 0))?;
        self.summary.copied += 1;
        Ok(())
    }

    fn finish(self) -> Result<CopySummary> {
        for rel in self.dir_order.iter().rev() {
            let Some(mode) = self.dir_modes.get(rel) else {
                continue;
            };
            let path = self.dest.join(rel);
            fs::set_permissions(&path, Permissions::from_mode(*mode))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        tracing::info!(
            "copied {}: {} hard links, {} copies, {} symlinks, {} directories",
            self.dest.display(),
            self.summary.hard_linked,
            self.summary.copied,
            self.summary.symlinks,
            self.summary.directories
        );
        Ok(self.summary)
    }
}

fn is_usrmerge_dir(name: &OsStr) -> bool {
    USRMERGE_DIRS.iter().any(|d| OsStr::new(d) == name)
}

/// Resolve `link` as seen from directory `base`, purely lexically, with the
/// tree root acting as `/`.
fn resolve_lexically(base: &Path, link: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let start = if link.has_root() { Path::new("") } else { base };
    for comp in start.components().chain(link.components()) {
        match comp {
            Component::RootDir | Component::Prefix(_) => out = PathBuf::new(),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(n) => out.push(n),
        }
    }
    out
}

/// Where `p` ends up once every usrmerge directory lives under `usr/`.
fn merged_location(p: &Path) -> PathBuf {
    match p.components().next() {
        Some(Component::Normal(first)) if is_usrmerge_dir(first) => Path::new("usr").join(p),
        _ => p.to_path_buf(),
    }
}

/// Whether the symlink at source path `rel`, placed at `mapped`, would
/// resolve to its own location in the merged tree (`bin/which ->
/// /usr/bin/which`, `usr/bin/less -> /bin/less`).
fn points_to_itself(rel: &Path, mapped: &Path, link: &Path) -> bool {
    let base = rel.parent().unwrap_or(Path::new(""));
    merged_location(&resolve_lexically(base, link)) == mapped
}

/// A relative symlink moved from `rel` to `mapped` keeps its text if that
/// still reaches the same file; otherwise it is rewritten to do so.
fn retarget(rel: &Path, mapped: &Path, link: PathBuf) -> PathBuf {
    if link.has_root() {
        return link;
    }
    let old_base = rel.parent().unwrap_or(Path::new(""));
    let new_base = mapped.parent().unwrap_or(Path::new(""));
    let want = merged_location(&resolve_lexically(old_base, &link));
    if merged_location(&resolve_lexically(new_base, &link)) == want {
        return link;
    }
    pathdiff::diff_paths(&want, new_base).unwrap_or(link)
}
