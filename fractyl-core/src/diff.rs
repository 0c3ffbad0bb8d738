//! Textual differ
//!
//! Consumes two byte buffers and their display paths, emits unified diff
//! text. Binary inputs are detected by extension, by magic number, or by a
//! byte-class heuristic over the first 8 KiB (a NUL byte, or more than 30%
//! control bytes); binary pairs get a terse "Binary files ... differ" line
//! and no unified diff.

use std::ops::Range;

use anyhow::Result;
use imara_diff::intern::InternedInput;
use imara_diff::{diff, Algorithm, Sink};

use crate::index::Index;
use crate::object_store::ObjectStore;

/// Default unified-diff context width.
pub const DEFAULT_CONTEXT: usize = 3;

/// Window inspected by the byte-class heuristic.
const SNIFF_LEN: usize = 8 * 1024;

/// Extensions treated as binary without looking at content.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tgz", "bz2", "xz",
    "7z", "tar", "exe", "dll", "so", "dylib", "a", "o", "class", "jar", "wasm", "bin", "dat",
    "db", "sqlite", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "ogg", "avi", "mov",
];

/// Leading magic numbers treated as binary.
const BINARY_MAGICS: &[&[u8]] = &[
    b"\x7fELF",
    b"\x89PNG",
    b"\xff\xd8\xff",
    b"GIF8",
    b"%PDF",
    b"PK\x03\x04",
    b"\x1f\x8b",
];

/// Classify one buffer for diff purposes.
pub fn is_binary(path: &str, bytes: &[u8]) -> bool {
    if let Some(ext) = path.rsplit('.').next() {
        if path.contains('.') && BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    if BINARY_MAGICS.iter().any(|magic| bytes.starts_with(magic)) {
        return true;
    }

    let window = &bytes[..bytes.len().min(SNIFF_LEN)];
    if window.is_empty() {
        return false;
    }
    if window.contains(&0) {
        return true;
    }
    let control = window
        .iter()
        .filter(|&&b| (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r') || b == 0x7f)
        .count();
    control * 100 > window.len() * 30
}

/// Unified diff between two buffers. Returns an empty string when the
/// buffers are identical, and the terse binary notice when either side is
/// binary.
pub fn unified_diff(
    path_a: &str,
    bytes_a: &[u8],
    path_b: &str,
    bytes_b: &[u8],
    context: usize,
) -> String {
    if bytes_a == bytes_b {
        return String::new();
    }
    if is_binary(path_a, bytes_a) || is_binary(path_b, bytes_b) {
        return format!("Binary files a/{} and b/{} differ\n", path_a, path_b);
    }

    let before = String::from_utf8_lossy(bytes_a);
    let after = String::from_utf8_lossy(bytes_b);
    let input = InternedInput::new(before.as_ref(), after.as_ref());
    let changes = diff(Algorithm::Histogram, &input, ChangeCollector::default());
    if changes.is_empty() {
        return String::new();
    }

    let before_lines: Vec<&str> = input.before.iter().map(|&t| input.interner[t]).collect();
    let after_lines: Vec<&str> = input.after.iter().map(|&t| input.interner[t]).collect();

    let mut out = format!("--- a/{}\n+++ b/{}\n", path_a, path_b);
    render_hunks(&before_lines, &after_lines, &changes, context, &mut out);
    out
}

/// Collects raw change ranges from the diff algorithm.
#[derive(Default)]
struct ChangeCollector {
    changes: Vec<(Range<u32>, Range<u32>)>,
}

impl Sink for ChangeCollector {
    type Out = Vec<(Range<u32>, Range<u32>)>;

    fn process_change(&mut self, before: Range<u32>, after: Range<u32>) {
        self.changes.push((before, after));
    }

    fn finish(self) -> Self::Out {
        self.changes
    }
}

/// Group changes into hunks (gaps of at most 2*context merge) and print
/// them in unified format.
fn render_hunks(
    before: &[&str],
    after: &[&str],
    changes: &[(Range<u32>, Range<u32>)],
    context: usize,
    out: &mut String,
) {
    let mut i = 0;
    while i < changes.len() {
        let mut j = i;
        while j + 1 < changes.len()
            && (changes[j + 1].0.start as usize)
                <= changes[j].0.end as usize + 2 * context
        {
            j += 1;
        }

        let first = &changes[i];
        let last = &changes[j];
        let a_start = (first.0.start as usize).saturating_sub(context);
        let a_end = (last.0.end as usize + context).min(before.len());
        let b_start = (first.1.start as usize).saturating_sub(context);
        let b_end = (last.1.end as usize + context).min(after.len());

        out.push_str(&format!(
            "@@ -{} +{} @@\n",
            range_header(a_start, a_end - a_start),
            range_header(b_start, b_end - b_start)
        ));

        let mut pos = a_start;
        for (before_range, after_range) in &changes[i..=j] {
            for line in &before[pos..before_range.start as usize] {
                push_line(out, ' ', line);
            }
            for line in &before[before_range.start as usize..before_range.end as usize] {
                push_line(out, '-', line);
            }
            for line in &after[after_range.start as usize..after_range.end as usize] {
                push_line(out, '+', line);
            }
            pos = before_range.end as usize;
        }
        for line in &before[pos..a_end] {
            push_line(out, ' ', line);
        }

        i = j + 1;
    }
}

/// One output line. Tokens are normalized so the result is identical whether
/// the tokenizer kept line terminators or not.
fn push_line(out: &mut String, sign: char, line: &str) {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    out.push(sign);
    out.push_str(line);
    out.push('\n');
}

/// `start,count` with git's conventions: count of 1 is elided, and an empty
/// range names the line before it.
fn range_header(start: usize, count: usize) -> String {
    match count {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, count),
    }
}

/// Path-level difference between two indices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexDiff {
    /// Present only in the newer index, in its order.
    pub added: Vec<String>,
    /// Present only in the older index, in its order.
    pub deleted: Vec<String>,
    /// Present in both with differing hashes, in the older index's order.
    pub modified: Vec<String>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }
}

/// Compare two indices by path and hash.
pub fn compare_indices(older: &Index, newer: &Index) -> IndexDiff {
    let mut diff = IndexDiff::default();
    for entry in older.iter() {
        match newer.find(&entry.path) {
            None => diff.deleted.push(entry.path.clone()),
            Some(new_entry) if new_entry.hash != entry.hash => {
                diff.modified.push(entry.path.clone())
            }
            Some(_) => {}
        }
    }
    for entry in newer.iter() {
        if older.find(&entry.path).is_none() {
            diff.added.push(entry.path.clone());
        }
    }
    diff
}

/// Render an index-level diff: A/D/M status lines, then unified diffs for
/// each modified path, pulling both sides from the object store.
pub fn render_index_diff(
    store: &ObjectStore,
    older: &Index,
    newer: &Index,
    context: usize,
) -> Result<String> {
    let diff = compare_indices(older, newer);
    let mut out = String::new();

    for path in &diff.added {
        out.push_str(&format!("A {}\n", path));
    }
    for path in &diff.deleted {
        out.push_str(&format!("D {}\n", path));
    }
    for path in &diff.modified {
        out.push_str(&format!("M {}\n", path));
    }

    for path in &diff.modified {
        let old_entry = older.find(path).expect("modified path is in older index");
        let new_entry = newer.find(path).expect("modified path is in newer index");
        let old_bytes = store.get(&old_entry.hash)?;
        let new_bytes = store.get(&new_entry.hash)?;
        out.push_str(&unified_diff(path, &old_bytes, path, &new_bytes, context));
    }

    Ok(out)
}
