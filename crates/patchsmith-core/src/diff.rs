//! Unified diff generation, parsing, and in-memory application.
//!
//! Generation uses `similar` with three lines of context and git-style
//! headers. Parsing is driven by the hunk line counts, so removed lines that
//! happen to start with `--` or `++` are never mistaken for file headers.
//! Application is byte-exact: context lines are copied from the target text,
//! and `\ No newline at end of file` markers are honored on both sides.

use similar::{ChangeTag, TextDiff};
use std::fmt::{self, Write as _};
use thiserror::Error;

pub const CONTEXT_LINES: usize = 3;

/// How far (in lines) a hunk may float from its recorded position.
pub const MAX_HUNK_DRIFT: usize = 200;

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("diff has no '---'/'+++' file header")]
    MissingHeader,
    #[error("diff has no hunks")]
    NoHunks,
    #[error("invalid hunk header: {0}")]
    InvalidHunkHeader(String),
    #[error("hunk {hunk} is truncated")]
    TruncatedHunk { hunk: usize },
    #[error("unexpected line in hunk {hunk}: {line}")]
    UnexpectedLine { hunk: usize, line: String },
    #[error("hunk {hunk} does not match the target near line {line}")]
    HunkMismatch { hunk: usize, line: usize },
}

/// A single line in a diff hunk, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) | DiffLine::Add(s) | DiffLine::Remove(s) => s,
        }
    }

    fn on_old_side(&self) -> bool {
        !matches!(self, DiffLine::Add(_))
    }

    fn on_new_side(&self) -> bool {
        !matches!(self, DiffLine::Remove(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
    pub old_missing_newline: bool,
    pub new_missing_newline: bool,
}

impl DiffHunk {
    /// Index of the first old-side line this hunk covers, zero-based.
    fn nominal_index(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }
}

/// The `index <old>..<new> <mode>` line git writes after `diff --git`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobIndex {
    pub old_id: String,
    pub new_id: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub index: Option<BlobIndex>,
    pub hunks: Vec<DiffHunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tolerance {
    Exact,
    /// Lines compare equal when they differ only in runs of whitespace.
    IgnoreWhitespace,
}

struct HunkRange {
    start: usize,
    len: usize,
}

impl fmt::Display for HunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut beginning = self.start + 1;
        if self.len == 1 {
            write!(f, "{}", beginning)
        } else {
            if self.len == 0 {
                beginning -= 1;
            }
            write!(f, "{},{}", beginning, self.len)
        }
    }
}

/// Unified diff of `original` → `candidate` with `a/` and `b/` headers.
///
/// Returns an empty string when the texts are identical.
pub fn unified_diff(path: &str, original: &str, candidate: &str) -> String {
    unified_diff_with_index(path, original, candidate, None)
}

pub fn unified_diff_with_index(
    path: &str,
    original: &str,
    candidate: &str,
    index: Option<&BlobIndex>,
) -> String {
    let diff = TextDiff::from_lines(original, candidate);
    let groups = diff.grouped_ops(CONTEXT_LINES);
    if groups.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let _ = writeln!(out, "diff --git a/{0} b/{0}", path);
    if let Some(index) = index {
        let _ = writeln!(out, "index {}..{} {}", index.old_id, index.new_id, index.mode);
    }
    let _ = writeln!(out, "--- a/{}", path);
    let _ = writeln!(out, "+++ b/{}", path);

    for group in &groups {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old = HunkRange {
            start: first.old_range().start,
            len: last.old_range().end - first.old_range().start,
        };
        let new = HunkRange {
            start: first.new_range().start,
            len: last.new_range().end - first.new_range().start,
        };
        let _ = writeln!(out, "@@ -{} +{} @@", old, new);

        for op in group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                    ChangeTag::Equal => ' ',
                };
                out.push(sign);
                out.push_str(change.value());
                if change.missing_newline() {
                    out.push('\n');
                    out.push_str(NO_NEWLINE_MARKER);
                    out.push('\n');
                }
            }
        }
    }

    out
}

fn strip_path_prefix(raw: &str, prefix: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

fn parse_index_line(line: &str) -> Option<BlobIndex> {
    let rest = line.strip_prefix("index ")?;
    let mut parts = rest.split_whitespace();
    let ids = parts.next()?;
    let mode = parts.next().unwrap_or("").to_string();
    let (old_id, new_id) = ids.split_once("..")?;
    Some(BlobIndex {
        old_id: old_id.to_string(),
        new_id: new_id.to_string(),
        mode,
    })
}

/// Parse the first file section of a unified diff.
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, DiffError> {
    let lines: Vec<&str> = diff.split('\n').collect();
    let mut idx = 0;
    let mut index = None;
    let mut old_path = None;
    let mut new_path = None;

    while idx < lines.len() {
        let line = lines[idx];
        idx += 1;
        if line.starts_with("index ") {
            index = parse_index_line(line);
        } else if let Some(rest) = line.strip_prefix("--- ") {
            old_path = Some(strip_path_prefix(rest, "a/"));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = Some(strip_path_prefix(rest, "b/"));
            break;
        }
    }

    let (Some(old_path), Some(new_path)) = (old_path, new_path) else {
        return Err(DiffError::MissingHeader);
    };

    let mut hunks = Vec::new();
    while idx < lines.len() {
        let line = lines[idx];
        if line.starts_with("diff --git ") {
            break;
        }
        if line.starts_with("@@ ") {
            let hunk = parse_hunk(&lines, &mut idx, hunks.len() + 1)?;
            hunks.push(hunk);
        } else {
            idx += 1;
        }
    }

    if hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        index,
        hunks,
    })
}

fn parse_hunk(lines: &[&str], idx: &mut usize, number: usize) -> Result<DiffHunk, DiffError> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" || parts[3] != "@@" {
        return Err(DiffError::InvalidHunkHeader(header.to_string()));
    }
    let old_range = parts[1]
        .strip_prefix('-')
        .ok_or_else(|| DiffError::InvalidHunkHeader(header.to_string()))?;
    let new_range = parts[2]
        .strip_prefix('+')
        .ok_or_else(|| DiffError::InvalidHunkHeader(header.to_string()))?;
    let (old_start, old_count) = parse_range(old_range, header)?;
    let (new_start, new_count) = parse_range(new_range, header)?;

    *idx += 1;
    let mut hunk = DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
    };
    let mut old_seen = 0;
    let mut new_seen = 0;

    while old_seen < old_count || new_seen < new_count {
        let Some(line) = lines.get(*idx) else {
            return Err(DiffError::TruncatedHunk { hunk: number });
        };
        *idx += 1;

        let diff_line = if let Some(rest) = line.strip_prefix('+') {
            new_seen += 1;
            DiffLine::Add(rest.to_string())
        } else if let Some(rest) = line.strip_prefix('-') {
            old_seen += 1;
            DiffLine::Remove(rest.to_string())
        } else if let Some(rest) = line.strip_prefix(' ') {
            old_seen += 1;
            new_seen += 1;
            DiffLine::Context(rest.to_string())
        } else if line.is_empty() {
            // Some tools strip the single space of blank context lines.
            old_seen += 1;
            new_seen += 1;
            DiffLine::Context(String::new())
        } else if line.starts_with('\\') {
            mark_missing_newline(&mut hunk);
            continue;
        } else {
            return Err(DiffError::UnexpectedLine {
                hunk: number,
                line: line.to_string(),
            });
        };
        hunk.lines.push(diff_line);
    }

    if old_seen != old_count || new_seen != new_count {
        return Err(DiffError::TruncatedHunk { hunk: number });
    }

    if lines.get(*idx).is_some_and(|l| l.starts_with('\\')) {
        mark_missing_newline(&mut hunk);
        *idx += 1;
    }

    Ok(hunk)
}

fn mark_missing_newline(hunk: &mut DiffHunk) {
    match hunk.lines.last() {
        Some(DiffLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(DiffLine::Add(_)) => hunk.new_missing_newline = true,
        Some(DiffLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

fn parse_range(s: &str, header: &str) -> Result<(usize, usize), DiffError> {
    let invalid = || DiffError::InvalidHunkHeader(header.to_string());
    match s.split_once(',') {
        Some((start, count)) => Ok((
            start.parse().map_err(|_| invalid())?,
            count.parse().map_err(|_| invalid())?,
        )),
        None => Ok((s.parse().map_err(|_| invalid())?, 1)),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lines_equal(actual: &str, expected: &str, tolerance: Tolerance) -> bool {
    let actual = actual.strip_suffix('\n').unwrap_or(actual);
    match tolerance {
        Tolerance::Exact => actual == expected,
        Tolerance::IgnoreWhitespace => {
            actual == expected || collapse_whitespace(actual) == collapse_whitespace(expected)
        }
    }
}

fn hunk_matches_at(target: &[&str], pos: usize, expected: &[&str], tolerance: Tolerance) -> bool {
    pos + expected.len() <= target.len()
        && expected
            .iter()
            .enumerate()
            .all(|(i, exp)| lines_equal(target[pos + i], exp, tolerance))
}

/// Nearest position to `nominal` (not before `floor`) where the hunk fits.
fn locate_hunk(
    target: &[&str],
    nominal: usize,
    floor: usize,
    expected: &[&str],
    tolerance: Tolerance,
) -> Option<usize> {
    let nominal = nominal.max(floor).min(target.len());
    for distance in 0..=MAX_HUNK_DRIFT {
        let forward = nominal + distance;
        if hunk_matches_at(target, forward, expected, tolerance) {
            return Some(forward);
        }
        if distance > 0 {
            if let Some(backward) = nominal.checked_sub(distance) {
                if backward >= floor && hunk_matches_at(target, backward, expected, tolerance) {
                    return Some(backward);
                }
            }
        }
        if forward > target.len() && nominal.saturating_sub(distance) <= floor {
            break;
        }
    }
    None
}

/// Apply a parsed diff to `original`.
pub fn apply_diff(
    original: &str,
    diff: &UnifiedDiff,
    tolerance: Tolerance,
) -> Result<String, DiffError> {
    let target: Vec<&str> = original.split_inclusive('\n').collect();
    let mut out = String::with_capacity(original.len());
    let mut cursor = 0usize;
    let mut drift: isize = 0;

    for (number, hunk) in diff.hunks.iter().enumerate() {
        let expected: Vec<&str> = hunk
            .lines
            .iter()
            .filter(|l| l.on_old_side())
            .map(DiffLine::content)
            .collect();

        let nominal = (hunk.nominal_index() as isize + drift).max(0) as usize;
        let pos = locate_hunk(&target, nominal, cursor, &expected, tolerance).ok_or(
            DiffError::HunkMismatch {
                hunk: number + 1,
                line: hunk.old_start,
            },
        )?;
        drift = pos as isize - hunk.nominal_index() as isize;

        for line in &target[cursor..pos] {
            out.push_str(line);
        }

        let last_new = hunk.lines.iter().rposition(DiffLine::on_new_side);
        let mut old_pos = pos;
        for (i, line) in hunk.lines.iter().enumerate() {
            match line {
                DiffLine::Context(_) => {
                    out.push_str(target[old_pos]);
                    old_pos += 1;
                }
                DiffLine::Remove(_) => old_pos += 1,
                DiffLine::Add(content) => {
                    out.push_str(content);
                    if !(hunk.new_missing_newline && Some(i) == last_new) {
                        out.push('\n');
                    }
                }
            }
        }
        cursor = old_pos;
    }

    for line in &target[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

/// Parse and apply `diff_text` exactly, returning the patched text.
pub fn apply_diff_text(
    original: &str,
    diff_text: &str,
    tolerance: Tolerance,
) -> Result<String, DiffError> {
    let parsed = parse_unified_diff(diff_text)?;
    apply_diff(original, &parsed, tolerance)
}

/// True when `diff_text` turns `original` into exactly `candidate`.
pub fn round_trips(original: &str, candidate: &str, diff_text: &str) -> bool {
    apply_diff_text(original, diff_text, Tolerance::Exact)
        .map(|patched| patched == candidate)
        .unwrap_or(false)
}
