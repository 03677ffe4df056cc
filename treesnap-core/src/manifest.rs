use crate::digest;
use crate::escape::{escape, unescape};
use crate::store;
use anyhow::{anyhow, bail, Context, Result};
use filetime::FileTime;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt;
use std::fs::{File, Metadata, Permissions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::str::FromStr;
use tempfile::NamedTempFile;

/// First line of every manifest.
pub const HEADER: &str = "#mtree v2.0";

/// Empty file kept at the root of every snapshot.
pub const ANCHOR: &str = ".ref";

const HARDLINK_COMMENT: &str = "# hardlink ";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    #[default]
    File,
    Link,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Dir => "dir",
            EntryKind::File => "file",
            EntryKind::Link => "link",
        }
    }

    pub fn from_metadata(md: &Metadata) -> Option<Self> {
        let ft = md.file_type();
        if ft.is_dir() {
            Some(EntryKind::Dir)
        } else if ft.is_file() {
            Some(EntryKind::File)
        } else if ft.is_symlink() {
            Some(EntryKind::Link)
        } else {
            None
        }
    }
}

impl FromStr for EntryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dir" => Ok(EntryKind::Dir),
            "file" => Ok(EntryKind::File),
            "link" => Ok(EntryKind::Link),
            other => bail!("unsupported type={}", other),
        }
    }
}

/// Modification time. `nanos` is always below one billion.
///
/// Rendered as `<secs>.<nanos>` with exactly nine digits after the point,
/// and those digits are a nanosecond count: `1.000000234` is one second plus
/// 234 nanoseconds. The parser reads the fraction the same way, so `1.234`
/// is one second plus 234 nanoseconds, not 0.234 seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MTime {
    pub secs: i64,
    pub nanos: u32,
}

impl MTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn from_metadata(md: &Metadata) -> Self {
        Self { secs: md.mtime(), nanos: md.mtime_nsec() as u32 }
    }

    pub fn to_filetime(self) -> FileTime {
        FileTime::from_unix_time(self.secs, self.nanos)
    }
}

impl fmt::Display for MTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

impl FromStr for MTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
        let secs: i64 = secs.parse().map_err(|_| anyhow!("bad time={}", s))?;
        let nanos = if frac.is_empty() {
            0
        } else {
            if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                bail!("bad time={} (fraction must be at most 9 digits of nanoseconds)", s);
            }
            frac.parse::<u32>().map_err(|_| anyhow!("bad time={}", s))?
        };
        Ok(MTime { secs, nanos })
    }
}

/// One manifest entry. `path` is relative to the root, raw bytes, and empty
/// for the root itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub path: Vec<u8>,
    pub kind: EntryKind,
    pub mode: Option<u32>,
    pub mtime: Option<MTime>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub contents: Option<String>,
    pub link: Option<Vec<u8>>,
    /// Missing content is skipped rather than treated as an error.
    pub optional: bool,
}

impl Entry {
    pub fn size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Store-relative location of this file's content, `ab/cdef...`.
    pub fn content_ref(&self) -> Option<String> {
        self.contents.clone().or_else(|| self.sha256.as_deref().map(store::object_relpath))
    }

    pub fn to_line(&self) -> String {
        let mut line = render_path(&self.path);
        let kind = self.kind;
        line.push_str(" type=");
        line.push_str(kind.as_str());
        if let Some(mode) = self.mode {
            line.push_str(&format!(" mode={:o}", mode));
        }
        if kind == EntryKind::File && self.size() > 0 {
            line.push_str(&format!(" size={}", self.size()));
        }
        if let Some(t) = self.mtime {
            line.push_str(&format!(" time={}", t));
        }
        if kind == EntryKind::File && self.size() > 0 {
            if let Some(h) = &self.sha256 {
                line.push_str(" sha256=");
                line.push_str(h);
            }
            if let Some(c) = &self.contents {
                line.push_str(" contents=");
                line.push_str(&escape(c.as_bytes()));
            }
        }
        if let (EntryKind::Link, Some(target)) = (kind, &self.link) {
            line.push_str(" link=");
            line.push_str(&escape(target));
        }
        if self.optional {
            line.push_str(" optional");
        }
        line
    }
}

/// `.` for the root, `./<escaped>` otherwise.
pub fn render_path(rel: &[u8]) -> String {
    if rel.is_empty() {
        ".".to_string()
    } else {
        format!("./{}", escape(rel))
    }
}

/// Inverse of [`render_path`]; plain relative names without `./` are
/// accepted too.
pub fn parse_path(token: &str) -> Result<Vec<u8>> {
    let raw = unescape(token)?;
    let mut rel: &[u8] = &raw;
    if rel == b"." {
        return Ok(Vec::new());
    }
    if let Some(rest) = rel.strip_prefix(b"./") {
        rel = rest;
    }
    while let Some(rest) = rel.strip_suffix(b"/") {
        rel = rest;
    }
    if rel.is_empty() {
        bail!("empty path {:?}", token);
    }
    Ok(rel.to_vec())
}

/// A meaningful line of a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    Entry(Entry),
    /// `path` had the same inode as `first` when the manifest was written.
    HardLink { path: Vec<u8>, first: Vec<u8> },
}

/// Parse one line. Blank lines, comments and `ignore` entries give `None`.
pub fn parse_line(line: &str) -> Result<Option<Line>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(rest) = line.strip_prefix(HARDLINK_COMMENT) {
        let mut toks = rest.split_ascii_whitespace();
        let (Some(path), Some(first), None) = (toks.next(), toks.next(), toks.next()) else {
            bail!("malformed hardlink comment");
        };
        return Ok(Some(Line::HardLink { path: parse_path(path)?, first: parse_path(first)? }));
    }
    if line.starts_with('#') {
        return Ok(None);
    }

    let mut toks = line.split_ascii_whitespace();
    let path_tok = toks.next().ok_or_else(|| anyhow!("missing path"))?;
    if path_tok.starts_with('/') {
        bail!("mtree special commands ({}) are not supported", path_tok);
    }
    let mut e = Entry { path: parse_path(path_tok)?, ..Entry::default() };
    let mut kind = None;
    for tok in toks {
        let (key, value) = tok.split_once('=').unwrap_or((tok, ""));
        match key {
            "type" => kind = Some(value.parse()?),
            "mode" => {
                let mode = u32::from_str_radix(value, 8).map_err(|_| anyhow!("bad mode={}", value))?;
                if mode > 0o7777 {
                    bail!("mode={} out of range", value);
                }
                e.mode = Some(mode);
            }
            "time" => e.mtime = Some(value.parse()?),
            "size" => e.size = Some(value.parse().map_err(|_| anyhow!("bad size={}", value))?),
            "sha256" | "sha256digest" => {
                if !digest::is_sha256_hex(value) {
                    bail!("bad sha256={}", value);
                }
                e.sha256 = Some(value.to_ascii_lowercase());
            }
            "contents" | "content" => {
                let raw = unescape(value)?;
                let text = String::from_utf8(raw).map_err(|_| anyhow!("bad contents={}", value))?;
                e.contents = Some(text);
            }
            "link" => e.link = Some(unescape(value)?),
            "optional" => e.optional = true,
            "ignore" => return Ok(None),
            "uid" | "gid" | "uname" | "gname" | "nlink" | "flags" => {}
            other => bail!("unknown keyword {:?}", other),
        }
    }
    let Some(kind) = kind else {
        bail!("missing type=");
    };
    e.kind = kind;
    if kind == EntryKind::Link && e.link.is_none() {
        bail!("type=link without link=");
    }
    let has_content = e.sha256.is_some() || e.contents.is_some();
    if kind != EntryKind::File && has_content {
        bail!("content fields on a type={} entry", kind.as_str());
    }
    if kind == EntryKind::File {
        if has_content && e.size() == 0 {
            bail!("sha256=/contents= without a positive size=");
        }
        if !has_content && e.size() > 0 {
            bail!("size={} without sha256= or contents=", e.size());
        }
    }
    Ok(Some(Line::Entry(e)))
}

/// Streams manifest lines into a gzip encoder.
pub struct ManifestWriter<W: Write> {
    gz: GzEncoder<W>,
}

impl<W: Write> ManifestWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut gz = GzEncoder::new(inner, Compression::default());
        writeln!(gz, "{}", HEADER)?;
        Ok(Self { gz })
    }

    pub fn entry(&mut self, e: &Entry) -> Result<()> {
        writeln!(self.gz, "{}", e.to_line())?;
        Ok(())
    }

    /// Free-form comment. Newlines are flattened so a comment stays one line.
    pub fn comment(&mut self, text: &str) -> Result<()> {
        writeln!(self.gz, "# {}", text.replace(['\n', '\r'], " "))?;
        Ok(())
    }

    pub fn hard_link(&mut self, path: &[u8], first: &[u8]) -> Result<()> {
        writeln!(self.gz, "{}{} {}", HARDLINK_COMMENT, render_path(path), render_path(first))?;
        Ok(())
    }

    /// Finish the gzip stream and hand back the inner writer.
    pub fn finish(self) -> Result<W> {
        Ok(self.gz.finish()?)
    }
}

impl ManifestWriter<BufWriter<NamedTempFile>> {
    /// Start a manifest that will land at `dest` once [`Self::persist`] runs.
    /// Until then it lives in a temporary file next to `dest`.
    pub fn create(dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temporary manifest in {}", dir.display()))?;
        Self::new(BufWriter::new(tmp))
    }

    /// Close the gzip stream, flush and sync, then move the file into place.
    pub fn persist(self, dest: &Path) -> Result<()> {
        let buf = self.finish()?;
        let tmp = buf.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).with_context(|| format!("write {}", dest.display()))?;
        Ok(())
    }
}

/// Reads a manifest, gzip-compressed or plain.
pub struct ManifestReader {
    lines: std::io::Lines<Box<dyn BufRead>>,
    lineno: usize,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open manifest {}", path.display()))?;
        Self::from_reader(f)
    }

    pub fn from_reader<R: Read + 'static>(inner: R) -> Result<Self> {
        let mut br = BufReader::new(inner);
        let gzipped = br.fill_buf()?.starts_with(&[0x1f, 0x8b]);
        let src: Box<dyn BufRead> = if gzipped {
            Box::new(BufReader::new(MultiGzDecoder::new(br)))
        } else {
            Box::new(br)
        };
        let mut lines = src.lines();
        let first = lines.next().transpose().context("line 1")?.unwrap_or_default();
        if !first.starts_with("#mtree") {
            bail!("line 1: not an mtree manifest (expected {:?})", HEADER);
        }
        Ok(Self { lines, lineno: 1 })
    }
}

impl Iterator for ManifestReader {
    /// Line number and parsed line.
    type Item = Result<(usize, Line)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = self.lines.next()?;
            self.lineno += 1;
            let n = self.lineno;
            let parsed = raw
                .map_err(anyhow::Error::from)
                .and_then(|text| parse_line(&text))
                .with_context(|| format!("line {}", n));
            match parsed {
                Ok(Some(line)) => return Some(Ok((n, line))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
