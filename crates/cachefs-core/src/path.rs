//! Logical path algebra.
//!
//! A [`LogicalPath`] is the client-facing name of an entry: slash-separated,
//! normalized on construction (no doubled separators, no backslashes, no
//! trailing separator), immutable afterwards. `.` and `..` are kept in the
//! raw text; [`LogicalPath::normalized`] and [`LogicalPath::resolved_key`]
//! remove them.
//!
//! The segment offset index and the resolved key are computed on first use
//! and cached in the shared inner record, so clones share the work.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use crate::store::{StoreError, StoreResult};

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Identity of the filesystem that owns a path.
///
/// Paths from different filesystems never compare equal, even with
/// identical text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileSystemId(u64);

impl FileSystemId {
    /// Owner of paths built outside any filesystem.
    pub const DETACHED: FileSystemId = FileSystemId(0);

    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FileSystemId(NEXT.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

struct Inner {
    fs: FileSystemId,
    raw: String,
    offsets: OnceLock<Vec<usize>>,
    resolved: OnceLock<String>,
}

/// Immutable, normalized logical path.
#[derive(Clone)]
pub struct LogicalPath {
    inner: Arc<Inner>,
}

impl LogicalPath {
    /// Normalize `raw` into a detached path.
    pub fn new(raw: &str) -> StoreResult<Self> {
        Self::in_filesystem(FileSystemId::DETACHED, raw)
    }

    /// Normalize `raw` into a path owned by `fs`.
    pub fn in_filesystem(fs: FileSystemId, raw: &str) -> StoreResult<Self> {
        Ok(Self::from_normalized(fs, normalize(raw)?))
    }

    /// The absolute root `/` owned by `fs`.
    pub fn root_of(fs: FileSystemId) -> Self {
        Self::from_normalized(fs, SEPARATOR.to_string())
    }

    /// Wrap text that is already normalized.
    fn from_normalized(fs: FileSystemId, raw: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                fs,
                raw,
                offsets: OnceLock::new(),
                resolved: OnceLock::new(),
            }),
        }
    }

    fn derive(&self, raw: String) -> Self {
        Self::from_normalized(self.inner.fs, raw)
    }

    /// The owning filesystem.
    pub fn filesystem(&self) -> FileSystemId {
        self.inner.fs
    }

    /// Raw (normalized, unresolved) text.
    pub fn as_str(&self) -> &str {
        &self.inner.raw
    }

    pub fn is_absolute(&self) -> bool {
        self.inner.raw.starts_with(SEPARATOR)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.raw.is_empty()
    }

    fn offsets(&self) -> &[usize] {
        self.inner.offsets.get_or_init(|| {
            let bytes = self.inner.raw.as_bytes();
            (0..bytes.len())
                .filter(|&i| bytes[i] != b'/' && (i == 0 || bytes[i - 1] == b'/'))
                .collect()
        })
    }

    /// Byte range of segment `i`. Caller guarantees `i < name_count()`.
    fn segment_range(&self, i: usize) -> (usize, usize) {
        let offsets = self.offsets();
        let start = offsets[i];
        let end = match offsets.get(i + 1) {
            Some(next) => next - 1,
            None => self.inner.raw.len(),
        };
        (start, end)
    }

    fn segment(&self, i: usize) -> &str {
        let (start, end) = self.segment_range(i);
        &self.inner.raw[start..end]
    }

    /// Number of non-empty segments. The root and the empty path have none.
    pub fn name_count(&self) -> usize {
        self.offsets().len()
    }

    /// Segment `i` as a relative single-segment path.
    pub fn name(&self, i: usize) -> Option<LogicalPath> {
        if i >= self.name_count() {
            return None;
        }
        Some(self.derive(self.segment(i).to_string()))
    }

    /// Iterate the segments as text.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.name_count()).map(move |i| self.segment(i))
    }

    /// Relative path made of segments `begin..end`.
    pub fn subpath(&self, begin: usize, end: usize) -> Option<LogicalPath> {
        if begin >= end || end > self.name_count() {
            return None;
        }
        let (start, _) = self.segment_range(begin);
        let (_, stop) = self.segment_range(end - 1);
        Some(self.derive(self.inner.raw[start..stop].to_string()))
    }

    /// Last segment. A relative single-segment path is its own file name.
    pub fn file_name(&self) -> Option<LogicalPath> {
        match self.name_count() {
            0 => None,
            1 if !self.is_absolute() => Some(self.clone()),
            n => self.name(n - 1),
        }
    }

    /// Everything but the last segment.
    ///
    /// A single-segment absolute path has the root as parent; a relative
    /// single segment has none.
    pub fn parent(&self) -> Option<LogicalPath> {
        let count = self.name_count();
        match count {
            0 => None,
            1 => self.root(),
            _ => {
                let last = self.offsets()[count - 1];
                Some(self.derive(self.inner.raw[..last - 1].to_string()))
            }
        }
    }

    /// The root of an absolute path.
    pub fn root(&self) -> Option<LogicalPath> {
        if self.is_absolute() {
            Some(self.derive(SEPARATOR.to_string()))
        } else {
            None
        }
    }

    pub fn to_absolute(&self) -> LogicalPath {
        if self.is_absolute() {
            self.clone()
        } else {
            self.derive(format!("{SEPARATOR}{}", self.inner.raw))
        }
    }

    /// Join `other` onto this path.
    pub fn resolve(&self, other: &LogicalPath) -> LogicalPath {
        if other.is_absolute() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let base = self.as_str();
        let joined = if base.is_empty() {
            format!("{SEPARATOR}{}", other.as_str())
        } else if base.ends_with(SEPARATOR) {
            format!("{base}{}", other.as_str())
        } else {
            format!("{base}{SEPARATOR}{}", other.as_str())
        };
        self.derive(joined)
    }

    /// Parse `other` in this path's filesystem, then [`resolve`](Self::resolve) it.
    pub fn resolve_str(&self, other: &str) -> StoreResult<LogicalPath> {
        let other = LogicalPath::in_filesystem(self.inner.fs, other)?;
        Ok(self.resolve(&other))
    }

    /// Resolve `other` against this path's parent.
    pub fn resolve_sibling(&self, other: &LogicalPath) -> LogicalPath {
        match self.parent() {
            Some(parent) => parent.resolve(other),
            None => other.clone(),
        }
    }

    /// Relative path leading from this path to `other`.
    pub fn relativize(&self, other: &LogicalPath) -> StoreResult<LogicalPath> {
        if self.as_str() == other.as_str() {
            return Ok(self.derive(String::new()));
        }
        if self.is_absolute() != other.is_absolute() {
            return Err(StoreError::invalid_argument(format!(
                "cannot relativize {other} against {self}: absoluteness differs"
            )));
        }

        let base_count = self.name_count();
        let other_count = other.name_count();
        let common = self
            .names()
            .zip(other.names())
            .take_while(|(a, b)| a == b)
            .count();

        let mut parts: Vec<&str> = Vec::with_capacity(base_count - common + other_count - common);
        parts.extend(std::iter::repeat_n("..", base_count - common));
        parts.extend(other.names().skip(common));
        Ok(self.derive(parts.join("/")))
    }

    /// Remove `.` segments and fold `..` into their predecessors.
    ///
    /// `..` above the root of an absolute path is dropped; leading `..` of
    /// a relative path are kept.
    pub fn normalized(&self) -> LogicalPath {
        let resolved = resolve_dots(self);
        if resolved == self.as_str() {
            self.clone()
        } else {
            self.derive(resolved)
        }
    }

    /// Storage key: the dot-free absolute form without its leading separator.
    pub fn resolved_key(&self) -> &str {
        self.inner.resolved.get_or_init(|| {
            let absolute = resolve_dots(&self.to_absolute());
            absolute.trim_start_matches(SEPARATOR).to_string()
        })
    }

    /// Whole-segment prefix test. Absoluteness must agree.
    pub fn starts_with(&self, other: &LogicalPath) -> bool {
        if self.is_absolute() != other.is_absolute() {
            return false;
        }
        if other.name_count() > self.name_count() {
            return false;
        }
        if other.name_count() == 0 {
            return other.is_absolute() || self.is_empty();
        }
        self.names().zip(other.names()).all(|(a, b)| a == b)
    }

    /// Whole-segment suffix test. An absolute `other` must match entirely.
    pub fn ends_with(&self, other: &LogicalPath) -> bool {
        if other.is_absolute() {
            return self.as_str() == other.as_str();
        }
        let (n, m) = (self.name_count(), other.name_count());
        if m == 0 {
            return self.is_empty();
        }
        if m > n {
            return false;
        }
        self.names().skip(n - m).zip(other.names()).all(|(a, b)| a == b)
    }
}

/// Normalize raw path text.
///
/// Backslashes become separators, repeated separators collapse, one
/// trailing separator is dropped (the root stays `/`). NUL is rejected.
pub fn normalize(raw: &str) -> StoreResult<String> {
    if raw.contains('\0') {
        return Err(StoreError::invalid_path(format!(
            "{}: embedded NUL",
            raw.replace('\0', "\\0")
        )));
    }
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c == '\\' { SEPARATOR } else { c };
        if c == SEPARATOR && out.ends_with(SEPARATOR) {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with(SEPARATOR) {
        out.pop();
    }
    Ok(out)
}

/// Single left-to-right pass keeping a stack of the output length before
/// each kept segment; `..` truncates back to the top entry.
fn resolve_dots(path: &LogicalPath) -> String {
    let absolute = path.is_absolute();
    let mut out = String::with_capacity(path.as_str().len());
    if absolute {
        out.push(SEPARATOR);
    }
    // (output length before the segment, segment is itself "..")
    let mut stack: Vec<(usize, bool)> = Vec::new();

    for seg in path.names() {
        match seg {
            "." => {}
            ".." => match stack.last() {
                Some(&(start, false)) => {
                    stack.pop();
                    out.truncate(start);
                }
                _ if absolute => {}
                _ => push_segment(&mut out, &mut stack, "..", true, absolute),
            },
            _ => push_segment(&mut out, &mut stack, seg, false, absolute),
        }
    }
    out
}

fn push_segment(
    out: &mut String,
    stack: &mut Vec<(usize, bool)>,
    seg: &str,
    parent_ref: bool,
    absolute: bool,
) {
    stack.push((out.len(), parent_ref));
    let at_start = if absolute { out.len() == 1 } else { out.is_empty() };
    if !at_start {
        out.push(SEPARATOR);
    }
    out.push_str(seg);
}

impl PartialEq for LogicalPath {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fs == other.inner.fs && self.inner.raw == other.inner.raw
    }
}

impl Eq for LogicalPath {}

impl Hash for LogicalPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.fs.hash(state);
        self.inner.raw.hash(state);
    }
}

impl PartialOrd for LogicalPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner
            .raw
            .cmp(&other.inner.raw)
            .then(self.inner.fs.cmp(&other.inner.fs))
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.raw)
    }
}

impl fmt::Debug for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogicalPath").field(&self.inner.raw).finish()
    }
}
