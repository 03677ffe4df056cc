use crate::digest;
use crate::escape::{case_fold, non_portable};
use crate::manifest::{render_path, Entry, EntryKind, MTime, ManifestWriter, ANCHOR};
use crate::minimize::{minimize, MinimizeOptions, MinimizeSummary};
use crate::progress::Progress;
use crate::store::{object_relpath, ReferenceStore};
use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Add every hashed file to this store.
    pub reference_store: Option<PathBuf>,
    /// Glob patterns (relative to the root) to leave out.
    pub exclude: Vec<String>,
    pub progress: bool,
    /// Files hashed in parallel before their lines are written out.
    pub batch_size: usize,
    /// Minimize the tree once its manifest is on disk.
    pub minimize: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            reference_store: None,
            exclude: Vec::new(),
            progress: false,
            batch_size: 256,
            minimize: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ScanSummary {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub hard_links: u64,
    pub bytes_hashed: u64,
    pub objects_added: u64,
    pub warnings: u64,
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimized: Option<MinimizeSummary>,
}

/// (device, inode) of every multiply-linked file seen so far, mapped to the
/// first path it was seen at. Only lives as long as one scan.
#[derive(Debug, Default)]
struct InodeTable {
    first_path: HashMap<(u64, u64), Vec<u8>>,
}

impl InodeTable {
    /// `None` for the first occurrence, otherwise the path seen first.
    fn observe(&mut self, dev: u64, ino: u64, path: &[u8]) -> Option<Vec<u8>> {
        match self.first_path.get(&(dev, ino)) {
            Some(first) => Some(first.clone()),
            None => {
                self.first_path.insert((dev, ino), path.to_vec());
                None
            }
        }
    }
}

enum Item {
    Entry { entry: Entry, hash_from: Option<PathBuf> },
    HardLink { path: Vec<u8>, first: Vec<u8> },
}

/// A line (or two) waiting for its content hash before being written.
struct Pending {
    notes: Vec<String>,
    item: Item,
}

pub struct Scanner<'a> {
    root: &'a Path,
    opts: &'a ScanOptions,
    store: Option<ReferenceStore>,
    excludes: GlobSet,
    inodes: InodeTable,
    /// Case-folded sibling names per directory depth.
    siblings: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    progress: Progress,
    summary: ScanSummary,
}

impl<'a> Scanner<'a> {
    pub fn new(root: &'a Path, opts: &'a ScanOptions) -> Result<Self> {
        let mut b = GlobSetBuilder::new();
        for g in &opts.exclude {
            b.add(Glob::new(g).with_context(|| format!("bad exclude pattern {:?}", g))?);
        }
        Ok(Self {
            root,
            opts,
            store: opts.reference_store.as_ref().map(ReferenceStore::new),
            excludes: b.build()?,
            inodes: InodeTable::default(),
            siblings: Vec::new(),
            progress: Progress::new(opts.progress),
            summary: ScanSummary::default(),
        })
    }

    /// Walk the tree and write one manifest line per entry.
    pub fn scan<W: Write>(mut self, out: &mut ManifestWriter<W>) -> Result<ScanSummary> {
        let root_md = std::fs::symlink_metadata(self.root)
            .with_context(|| format!("stat {}", self.root.display()))?;
        if !root_md.is_dir() {
            bail!("{} is not a directory", self.root.display());
        }
        // The manifest always carries the anchor; make one up if the walk
        // will not record it.
        let anchor_note = if std::fs::symlink_metadata(self.root.join(ANCHOR)).is_err() {
            Some("root anchor not present in source, synthesized")
        } else if self.excludes.is_match(ANCHOR) {
            Some("root anchor excluded, synthesized")
        } else {
            None
        };

        self.progress.set_stage("Scanning");
        self.progress.start();
        let result = self.walk(out, &root_md, anchor_note);
        self.progress.stop();
        result?;
        Ok(self.summary)
    }

    fn walk<W: Write>(
        &mut self,
        out: &mut ManifestWriter<W>,
        root_md: &std::fs::Metadata,
        anchor_note: Option<&str>,
    ) -> Result<()> {
        let root = self.root;
        let excludes = self.excludes.clone();
        let walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
        let mut batch: Vec<Pending> = Vec::with_capacity(self.opts.batch_size);
        for ent in walker.into_iter().filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            e.depth() == 0 || !excludes.is_match(rel)
        }) {
            let ent = ent.with_context(|| format!("walk {}", root.display()))?;
            let rel = ent.path().strip_prefix(root)?.as_os_str().as_bytes().to_vec();
            let md = ent.metadata().with_context(|| format!("stat {}", ent.path().display()))?;
            let mut notes = Vec::new();
            if ent.depth() > 0 {
                self.check_name(ent.depth(), ent.file_name().as_bytes(), &rel, &mut notes);
            }
            if let Some(item) = self.record(&ent, rel, &md)? {
                batch.push(Pending { notes, item });
            }
            if let (0, Some(note)) = (ent.depth(), anchor_note) {
                batch.push(Pending {
                    notes: vec![note.to_string()],
                    item: Item::Entry {
                        entry: Entry {
                            path: ANCHOR.as_bytes().to_vec(),
                            kind: EntryKind::File,
                            mode: Some(0o644),
                            mtime: Some(MTime::from_metadata(root_md)),
                            ..Entry::default()
                        },
                        hash_from: None,
                    },
                });
                self.summary.files += 1;
            }
            if batch.len() >= self.opts.batch_size.max(1) {
                self.flush(&mut batch, out)?;
            }
        }
        self.flush(&mut batch, out)
    }

    fn record(
        &mut self,
        ent: &walkdir::DirEntry,
        rel: Vec<u8>,
        md: &std::fs::Metadata,
    ) -> Result<Option<Item>> {
        let mut entry = Entry {
            mode: Some(md.mode() & 0o7777),
            mtime: Some(MTime::from_metadata(md)),
            ..Entry::default()
        };
        let ft = md.file_type();
        if ft.is_dir() {
            entry.kind = EntryKind::Dir;
            self.summary.directories += 1;
        } else if ft.is_symlink() {
            let target = std::fs::read_link(ent.path())
                .with_context(|| format!("readlink {}", ent.path().display()))?;
            entry.kind = EntryKind::Link;
            entry.link = Some(target.into_os_string().into_vec());
            self.summary.symlinks += 1;
        } else if ft.is_file() {
            if md.nlink() > 1 {
                if let Some(first) = self.inodes.observe(md.dev(), md.ino(), &rel) {
                    self.summary.hard_links += 1;
                    return Ok(Some(Item::HardLink { path: rel, first }));
                }
            }
            entry.kind = EntryKind::File;
            entry.size = Some(md.len());
            self.summary.files += 1;
            if md.len() > 0 {
                entry.path = rel;
                return Ok(Some(Item::Entry { entry, hash_from: Some(ent.path().to_path_buf()) }));
            }
        } else {
            tracing::warn!("skipping {} (not a file, directory or symlink)", ent.path().display());
            self.summary.skipped += 1;
            return Ok(None);
        }
        entry.path = rel;
        Ok(Some(Item::Entry { entry, hash_from: None }))
    }

    /// Advisory checks on one name: case collisions with siblings and
    /// names that would not survive a restricted filesystem.
    fn check_name(&mut self, depth: usize, name: &[u8], rel: &[u8], notes: &mut Vec<String>) {
        self.siblings.truncate(depth);
        while self.siblings.len() < depth {
            self.siblings.push(HashMap::new());
        }
        let key = case_fold(name);
        let seen = &mut self.siblings[depth - 1];
        if let Some(other) = seen.get(&key) {
            let msg = format!("case collision: {} {}", render_path(other), render_path(rel));
            tracing::warn!("{}", msg);
            notes.push(msg);
            self.summary.warnings += 1;
        } else {
            seen.insert(key, rel.to_vec());
        }
        if let Some(why) = non_portable(name) {
            let msg = format!("non-portable name ({}): {}", why, render_path(rel));
            tracing::warn!("{}", msg);
            notes.push(msg);
            self.summary.warnings += 1;
        }
    }

    fn flush<W: Write>(&mut self, batch: &mut Vec<Pending>, out: &mut ManifestWriter<W>) -> Result<()> {
        let store = self.store.as_ref();
        let progress = &self.progress;
        let (bytes, added) = batch
            .par_iter_mut()
            .map(|p| -> Result<(u64, u64)> {
                let Item::Entry { entry, hash_from: Some(src) } = &mut p.item else {
                    return Ok((0, 0));
                };
                let (hex, n) = digest::sha256_file(src)?;
                if n != entry.size() {
                    bail!("{} changed size while scanning ({} -> {})", src.display(), entry.size(), n);
                }
                progress.add_bytes(n);
                let added = match store {
                    Some(s) => u64::from(s.insert(&hex, src)?),
                    None => 0,
                };
                entry.contents = Some(object_relpath(&hex));
                entry.sha256 = Some(hex);
                Ok((n, added))
            })
            .try_reduce(|| (0, 0), |a, b| Ok((a.0 + b.0, a.1 + b.1)))?;
        self.summary.bytes_hashed += bytes;
        self.summary.objects_added += added;

        for p in batch.drain(..) {
            for note in &p.notes {
                out.comment(note)?;
            }
            match &p.item {
                Item::Entry { entry, .. } => out.entry(entry)?,
                Item::HardLink { path, first } => {
                    tracing::debug!("{} is a hard link to {}", render_path(path), render_path(first));
                    out.hard_link(path, first)?
                }
            }
            self.progress.inc_entries(1);
        }
        Ok(())
    }
}

/// Scan `root` and write its manifest to `output`. With `opts.minimize` the
/// tree is minimized once the manifest is safely on disk.
pub fn generate(root: &Path, output: &Path, opts: &ScanOptions) -> Result<ScanSummary> {
    let root_can = std::fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
    refuse_inside(&root_can, output.parent().unwrap_or(Path::new("")), "manifest directory")?;
    if let Some(store) = &opts.reference_store {
        refuse_inside(&root_can, store, "reference store")?;
    }
    let mut writer = ManifestWriter::create(output)?;
    let mut summary = Scanner::new(root, opts)?.scan(&mut writer)?;
    writer.persist(output)?;
    tracing::info!(
        "wrote {}: {} dirs, {} files, {} symlinks, {} hard links",
        output.display(),
        summary.directories,
        summary.files,
        summary.symlinks,
        summary.hard_links
    );
    if opts.minimize {
        summary.minimized = Some(minimize(root, &MinimizeOptions::default())?);
    }
    Ok(summary)
}

/// Fail if `path` (or the nearest part of it that exists) lies under `root`.
fn refuse_inside(root_can: &Path, path: &Path, what: &str) -> Result<()> {
    let path = if path.as_os_str().is_empty() { Path::new(".") } else { path };
    let Some(existing) = path.ancestors().find(|p| p.as_os_str().is_empty() || p.exists()) else {
        return Ok(());
    };
    let existing = if existing.as_os_str().is_empty() { Path::new(".") } else { existing };
    let can = std::fs::canonicalize(existing).with_context(|| format!("resolve {}", existing.display()))?;
    if can.starts_with(root_can) {
        bail!("{} {} would be written inside the scanned tree", what, path.display());
    }
    Ok(())
}
