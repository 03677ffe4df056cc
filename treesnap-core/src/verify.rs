use crate::digest;
use crate::manifest::{render_path, Entry, EntryKind, Line, MTime, ManifestReader, ANCHOR};
use crate::path_safety::relative_path;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Debug, Serialize)]
pub struct Mismatch {
    pub path: String,
    pub what: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    pub entries_ok: u64,
    pub mismatches: Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    fn mismatch(&mut self, rel: &[u8], what: impl Into<String>) {
        self.mismatches.push(Mismatch { path: render_path(rel), what: what.into() });
    }
}

/// Compare the tree at `root` with `manifest`: every entry's type, mode,
/// time, size, content hash and link target, recorded hard links, and
/// anything present on disk that the manifest does not mention.
pub fn verify(manifest: &Path, root: &Path) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let mut known: HashSet<Vec<u8>> = HashSet::new();
    let mut links = Vec::new();
    for item in ManifestReader::open(manifest)? {
        let (lineno, line) = item.with_context(|| format!("parse {}", manifest.display()))?;
        match line {
            Line::Entry(e) => {
                let before = report.mismatches.len();
                check_entry(root, &e, &mut report)
                    .with_context(|| format!("{}: line {}", manifest.display(), lineno))?;
                if report.mismatches.len() == before {
                    report.entries_ok += 1;
                }
                known.insert(e.path);
            }
            Line::HardLink { path, first } => {
                known.insert(path.clone());
                links.push((path, first));
            }
        }
    }
    for (path, first) in &links {
        check_hard_link(root, path, first, &mut report)?;
    }
    for ent in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        let ent = ent.with_context(|| format!("walk {}", root.display()))?;
        let rel = ent.path().strip_prefix(root)?.as_os_str().as_bytes();
        if !known.contains(rel) {
            report.mismatch(rel, "not in manifest");
        }
    }
    tracing::info!(
        "verified {} against {}: {} ok, {} mismatches",
        root.display(),
        manifest.display(),
        report.entries_ok,
        report.mismatches.len()
    );
    Ok(report)
}

fn on_disk(root: &Path, rel: &[u8]) -> Result<PathBuf> {
    Ok(root.join(relative_path(rel)?))
}

fn check_entry(root: &Path, e: &Entry, report: &mut VerifyReport) -> Result<()> {
    let path = on_disk(root, &e.path)?;
    let md = match fs::symlink_metadata(&path) {
        Ok(md) => md,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            // The scanner invents an empty anchor when the tree has none.
            if e.path != ANCHOR.as_bytes() || e.size() != 0 {
                report.mismatch(&e.path, "missing");
            }
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    let Some(kind) = EntryKind::from_metadata(&md) else {
        report.mismatch(&e.path, format!("expected type={}, found a special file", e.kind.as_str()));
        return Ok(());
    };
    if kind != e.kind {
        report.mismatch(&e.path, format!("expected type={}, found type={}", e.kind.as_str(), kind.as_str()));
        return Ok(());
    }
    if let Some(mode) = e.mode {
        // Symlink permissions are fixed by the kernel.
        if kind != EntryKind::Link && md.mode() & 0o7777 != mode {
            report.mismatch(&e.path, format!("mode {:o}, expected {:o}", md.mode() & 0o7777, mode));
        }
    }
    if let Some(t) = e.mtime {
        let found = MTime::from_metadata(&md);
        if found != t {
            report.mismatch(&e.path, format!("time {}, expected {}", found, t));
        }
    }
    match kind {
        EntryKind::File => {
            if md.len() != e.size() {
                report.mismatch(&e.path, format!("size {}, expected {}", md.len(), e.size()));
            } else if let Some(want) = &e.sha256 {
                let (got, _) = digest::sha256_file(&path)?;
                if &got != want {
                    report.mismatch(&e.path, format!("sha256 {}, expected {}", got, want));
                }
            }
        }
        EntryKind::Link => {
            let target = fs::read_link(&path)?;
            let want = e.link.as_deref().unwrap_or_default();
            if target.as_os_str().as_bytes() != want {
                report.mismatch(
                    &e.path,
                    format!("link to {}, expected {}", target.display(), String::from_utf8_lossy(want)),
                );
            }
        }
        EntryKind::Dir => {}
    }
    Ok(())
}

fn check_hard_link(root: &Path, rel: &[u8], first: &[u8], report: &mut VerifyReport) -> Result<()> {
    let a = fs::symlink_metadata(on_disk(root, rel)?);
    let b = fs::symlink_metadata(on_disk(root, first)?);
    match (a, b) {
        (Ok(a), Ok(b)) if a.dev() == b.dev() && a.ino() == b.ino() => {}
        (Ok(_), Ok(_)) => report.mismatch(rel, format!("not a hard link to {}", render_path(first))),
        (Err(_), _) => report.mismatch(rel, "missing"),
        (_, Err(_)) => report.mismatch(rel, format!("hard link target {} missing", render_path(first))),
    }
    Ok(())
}
