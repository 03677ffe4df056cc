use crate::manifest::ANCHOR;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug)]
pub struct MinimizeOptions {
    /// Leave the root `.ref` anchor in place even though it is empty.
    pub keep_anchor: bool,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self { keep_anchor: true }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MinimizeSummary {
    pub symlinks_removed: u64,
    pub files_removed: u64,
    pub dirs_removed: u64,
}

/// Strip everything a manifest can regenerate on its own: symlinks, empty
/// files, and directories that are or become empty. Walks bottom-up so a
/// directory is only tried once its contents have been dealt with. The root
/// itself always stays.
///
/// Only call this after the tree's manifest has been captured.
pub fn minimize(root: &Path, opts: &MinimizeOptions) -> Result<MinimizeSummary> {
    let mut summary = MinimizeSummary::default();
    let walker = WalkDir::new(root).min_depth(1).follow_links(false).contents_first(true);
    for ent in walker {
        let ent = ent.with_context(|| format!("walk {}", root.display()))?;
        let path = ent.path();
        let ft = ent.file_type();
        if ft.is_symlink() {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
            summary.symlinks_removed += 1;
        } else if ft.is_file() {
            let md = ent.metadata().with_context(|| format!("stat {}", path.display()))?;
            if md.len() != 0 {
                continue;
            }
            if opts.keep_anchor && ent.depth() == 1 && ent.file_name() == ANCHOR {
                continue;
            }
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
            summary.files_removed += 1;
        } else if ft.is_dir() {
            match fs::remove_dir(path) {
                Ok(()) => summary.dirs_removed += 1,
                // Something non-empty is still in there.
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {}
                Err(e) => return Err(e).with_context(|| format!("rmdir {}", path.display())),
            }
        }
    }
    tracing::info!(
        "minimized {}: removed {} symlinks, {} empty files, {} directories",
        root.display(),
        summary.symlinks_removed,
        summary.files_removed,
        summary.dirs_removed
    );
    Ok(summary)
}
