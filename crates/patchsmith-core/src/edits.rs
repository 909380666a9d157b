//! SEARCH/REPLACE edit command parsing.

use crate::blocks::extract_blocks;
use crate::protocol::{EditCommand, FileEditBatch};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const FILE_HEADER_PREFIX: &str = "### ";
pub const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
pub const DIVIDER_MARKER: &str = "=======";
pub const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

/// Sandbox directory models were shown paths under, followed by the repo dir.
pub const DEFAULT_SANDBOX_PREFIXES: &[&str] = &["playground"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseWarning {
    #[error("line {line}: edit triad appears before any file header; dropped")]
    OrphanTriad { line: usize },
    #[error("line {line}: edit triad for '{file}' is missing its separator; dropped")]
    MissingDivider { file: String, line: usize },
    #[error("line {line}: edit triad for '{file}' has more than one separator; dropped")]
    DuplicateDivider { file: String, line: usize },
    #[error("line {line}: edit triad for '{file}' was never closed; dropped")]
    Unterminated { file: String, line: usize },
    #[error("line {line}: stray '{marker}' outside an edit triad")]
    StrayMarker { marker: &'static str, line: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBlock {
    pub batch: FileEditBatch,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedBlock {
    fn absorb(&mut self, other: ParsedBlock) {
        self.batch.merge(other.batch);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("parent traversal is not allowed: {0}")]
    ParentTraversal(String),
}

enum Section<'a> {
    Idle,
    Search {
        opened_at: usize,
        search: Vec<&'a str>,
    },
    Replace {
        opened_at: usize,
        search: Vec<&'a str>,
        replace: Vec<&'a str>,
        extra_divider: bool,
    },
}

enum Hint {
    Start(Option<u32>),
    End(Option<u32>),
}

fn hint_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*-\s*(start_line|end_line)\s*:\s*(\S+)\s*$").ok())
        .as_ref()
}

/// Recognizes `- start_line : N` / `- end_line : N`; unparsable numbers
/// still consume the line but carry no value.
fn capture_hint(line: &str) -> Option<Hint> {
    let caps = hint_re()?.captures(line)?;
    let value = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
    match caps.get(1).map(|m| m.as_str()) {
        Some("start_line") => Some(Hint::Start(value)),
        Some("end_line") => Some(Hint::End(value)),
        _ => None,
    }
}

/// Parse one extracted block into per-file edit commands.
///
/// Malformed triads are dropped with a warning; the rest of the block still
/// parses. An empty batch means there was nothing to do.
pub fn parse_block(block: &str) -> ParsedBlock {
    let mut parsed = ParsedBlock::default();
    let mut current_file: Option<String> = None;
    let mut start_hint: Option<u32> = None;
    let mut end_hint: Option<u32> = None;
    let mut section = Section::Idle;

    for (idx, raw_line) in block.lines().enumerate() {
        let line_no = idx + 1;
        let marker = raw_line.trim_end();

        section = match section {
            Section::Idle => {
                if let Some(header) = raw_line.strip_prefix(FILE_HEADER_PREFIX) {
                    let token = clean_path_token(header);
                    current_file = (!token.is_empty()).then_some(token);
                    start_hint = None;
                    end_hint = None;
                    Section::Idle
                } else if marker == SEARCH_MARKER {
                    Section::Search {
                        opened_at: line_no,
                        search: Vec::new(),
                    }
                } else if marker == DIVIDER_MARKER || marker == REPLACE_MARKER {
                    let marker = if marker == DIVIDER_MARKER {
                        DIVIDER_MARKER
                    } else {
                        REPLACE_MARKER
                    };
                    parsed.warnings.push(ParseWarning::StrayMarker {
                        marker,
                        line: line_no,
                    });
                    Section::Idle
                } else {
                    match capture_hint(raw_line) {
                        Some(Hint::Start(value)) => start_hint = value,
                        Some(Hint::End(value)) => end_hint = value,
                        None => {}
                    }
                    Section::Idle
                }
            }
            Section::Search {
                opened_at,
                mut search,
            } => {
                if marker == DIVIDER_MARKER {
                    Section::Replace {
                        opened_at,
                        search,
                        replace: Vec::new(),
                        extra_divider: false,
                    }
                } else if marker == REPLACE_MARKER {
                    parsed.warnings.push(ParseWarning::MissingDivider {
                        file: display_file(&current_file),
                        line: opened_at,
                    });
                    start_hint = None;
                    end_hint = None;
                    Section::Idle
                } else if marker == SEARCH_MARKER {
                    parsed.warnings.push(ParseWarning::Unterminated {
                        file: display_file(&current_file),
                        line: opened_at,
                    });
                    Section::Search {
                        opened_at: line_no,
                        search: Vec::new(),
                    }
                } else {
                    search.push(raw_line);
                    Section::Search { opened_at, search }
                }
            }
            Section::Replace {
                opened_at,
                search,
                mut replace,
                extra_divider,
            } => {
                if marker == REPLACE_MARKER {
                    match (&current_file, extra_divider) {
                        (None, _) => parsed
                            .warnings
                            .push(ParseWarning::OrphanTriad { line: opened_at }),
                        (Some(file), true) => {
                            parsed.warnings.push(ParseWarning::DuplicateDivider {
                                file: file.clone(),
                                line: opened_at,
                            })
                        }
                        (Some(file), false) => {
                            let command = EditCommand::new(
                                join_trimmed(&search),
                                join_trimmed(&replace),
                            )
                            .with_hints(start_hint, end_hint);
                            parsed.batch.push(file.clone(), command);
                        }
                    }
                    start_hint = None;
                    end_hint = None;
                    Section::Idle
                } else if marker == SEARCH_MARKER {
                    parsed.warnings.push(ParseWarning::Unterminated {
                        file: display_file(&current_file),
                        line: opened_at,
                    });
                    Section::Search {
                        opened_at: line_no,
                        search: Vec::new(),
                    }
                } else if marker == DIVIDER_MARKER {
                    Section::Replace {
                        opened_at,
                        search,
                        replace,
                        extra_divider: true,
                    }
                } else {
                    replace.push(raw_line);
                    Section::Replace {
                        opened_at,
                        search,
                        replace,
                        extra_divider,
                    }
                }
            }
        };
    }

    match section {
        Section::Idle => {}
        Section::Search { opened_at, .. } | Section::Replace { opened_at, .. } => {
            parsed.warnings.push(ParseWarning::Unterminated {
                file: display_file(&current_file),
                line: opened_at,
            });
        }
    }

    parsed
}

/// Extract every block tagged `tag` from a raw completion and merge their
/// batches in order.
pub fn parse_completion(raw: &str, tag: &str) -> ParsedBlock {
    let mut merged = ParsedBlock::default();
    for block in extract_blocks(raw, tag).iter() {
        merged.absorb(parse_block(block));
    }
    merged
}

fn display_file(file: &Option<String>) -> String {
    file.clone().unwrap_or_else(|| "<none>".to_string())
}

fn clean_path_token(token: &str) -> String {
    token
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim()
        .to_string()
}

/// Join lines with `\n`, dropping fully blank lines at either edge while
/// keeping the indentation of the first kept line.
fn join_trimmed(lines: &[&str]) -> String {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    lines[start..end.max(start)].join("\n")
}

/// Normalize a model-supplied path into a repository-relative path.
///
/// A leading sandbox prefix is dropped together with the repository directory
/// that follows it. Absolute paths and `..` segments are rejected.
pub fn sanitize_edit_path<S: AsRef<str>>(
    token: &str,
    sandbox_prefixes: &[S],
) -> Result<String, PathError> {
    let cleaned = clean_path_token(token).replace('\\', "/");
    if cleaned.is_empty() {
        return Err(PathError::Empty);
    }

    let bytes = cleaned.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if cleaned.starts_with('/') || has_drive {
        return Err(PathError::Absolute(cleaned));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::ParentTraversal(cleaned.clone())),
            other => segments.push(other),
        }
    }

    let starts_with_prefix = segments.first().is_some_and(|first| {
        sandbox_prefixes
            .iter()
            .any(|prefix| prefix.as_ref() == *first)
    });
    if starts_with_prefix {
        let drop = segments.len().min(2);
        segments.drain(..drop);
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILES: &str = r#"### src/app.py
- start_line : 10
- end_line : 12
<<<<<<< SEARCH
def f():
    return 1
=======
def f():
    return 2
>>>>>>> REPLACE

### src/util.py
<<<<<<< SEARCH
    x = 1
=======
    x = 2
>>>>>>> REPLACE
<<<<<<< SEARCH
    y = 1
=======
    y = 2
>>>>>>> REPLACE
"#;

    #[test]
    fn parses_commands_under_each_header() {
        let parsed = parse_block(TWO_FILES);
        assert!(parsed.warnings.is_empty());
        let files: Vec<&str> = parsed.batch.iter().map(|(p, _)| p).collect();
        assert_eq!(files, vec!["src/app.py", "src/util.py"]);

        let app = parsed.batch.commands_for("src/app.py").unwrap();
        assert_eq!(app.len(), 1);
        assert_eq!(app[0].search_text, "def f():\n    return 1");
        assert_eq!(app[0].replace_text, "def f():\n    return 2");
        assert_eq!(app[0].start_line_hint, Some(10));
        assert_eq!(app[0].end_line_hint, Some(12));

        let util = parsed.batch.commands_for("src/util.py").unwrap();
        assert_eq!(util.len(), 2);
        assert_eq!(util[0].search_text, "    x = 1");
        assert_eq!(util[1].replace_text, "    y = 2");
        assert_eq!(util[0].start_line_hint, None);
    }

    #[test]
    fn malformed_triad_is_dropped_but_siblings_survive() {
        let block = "### a.py\n<<<<<<< SEARCH\nbroken\n>>>>>>> REPLACE\n<<<<<<< SEARCH\nok\n=======\nfine\n>>>>>>> REPLACE\n";
        let parsed = parse_block(block);
        assert_eq!(parsed.batch.command_count(), 1);
        assert_eq!(
            parsed.batch.commands_for("a.py").unwrap()[0].search_text,
            "ok"
        );
        assert!(matches!(
            parsed.warnings.as_slice(),
            [ParseWarning::MissingDivider { line: 2, .. }]
        ));
    }

    #[test]
    fn triad_without_header_is_orphaned() {
        let block = "<<<<<<< SEARCH\na\n=======\nb\n>>>>>>> REPLACE\n";
        let parsed = parse_block(block);
        assert!(parsed.batch.is_empty());
        assert_eq!(parsed.warnings, vec![ParseWarning::OrphanTriad { line: 1 }]);
    }

    #[test]
    fn unterminated_triad_reports_warning() {
        let parsed = parse_block("### a.py\n<<<<<<< SEARCH\na\n=======\nb\n");
        assert!(parsed.batch.is_empty());
        assert!(matches!(
            parsed.warnings.as_slice(),
            [ParseWarning::Unterminated { .. }]
        ));
    }

    #[test]
    fn blank_edge_lines_are_trimmed_but_indentation_kept() {
        let block = "### a.py\n<<<<<<< SEARCH\n\n    x = 1\n\n=======\n    x = 2\n   \n>>>>>>> REPLACE\n";
        let parsed = parse_block(block);
        let cmd = &parsed.batch.commands_for("a.py").unwrap()[0];
        assert_eq!(cmd.search_text, "    x = 1");
        assert_eq!(cmd.replace_text, "    x = 2");
    }

    #[test]
    fn empty_replace_is_a_deletion() {
        let block = "### a.py\n<<<<<<< SEARCH\nimport os\n=======\n>>>>>>> REPLACE\n";
        let parsed = parse_block(block);
        let cmd = &parsed.batch.commands_for("a.py").unwrap()[0];
        assert_eq!(cmd.replace_text, "");
    }

    #[test]
    fn parse_completion_merges_blocks_and_dedupes() {
        let raw = format!(
            "Here you go:\n```python\n{0}```\nAnd again:\n```python\n{0}```\n",
            TWO_FILES
        );
        let parsed = parse_completion(&raw, "python");
        assert_eq!(parsed.batch.command_count(), 3);
    }

    #[test]
    fn unfenced_completion_still_parses() {
        let parsed = parse_completion(TWO_FILES, "python");
        assert_eq!(parsed.batch.file_count(), 2);
    }

    #[test]
    fn sanitize_strips_sandbox_prefix_and_repo_dir() {
        assert_eq!(
            sanitize_edit_path("playground/requests/src/api.py", DEFAULT_SANDBOX_PREFIXES).unwrap(),
            "src/api.py"
        );
        assert_eq!(
            sanitize_edit_path("`./pkg\\mod.py`", DEFAULT_SANDBOX_PREFIXES).unwrap(),
            "pkg/mod.py"
        );
        assert_eq!(
            sanitize_edit_path("a/b.py", DEFAULT_SANDBOX_PREFIXES).unwrap(),
            "a/b.py"
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(matches!(
            sanitize_edit_path("../etc/passwd", DEFAULT_SANDBOX_PREFIXES),
            Err(PathError::ParentTraversal(_))
        ));
        assert!(matches!(
            sanitize_edit_path("src/../../x.py", DEFAULT_SANDBOX_PREFIXES),
            Err(PathError::ParentTraversal(_))
        ));
        assert!(matches!(
            sanitize_edit_path("/etc/passwd", DEFAULT_SANDBOX_PREFIXES),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            sanitize_edit_path("C:\\repo\\x.py", DEFAULT_SANDBOX_PREFIXES),
            Err(PathError::Absolute(_))
        ));
        assert_eq!(
            sanitize_edit_path("playground/repo", DEFAULT_SANDBOX_PREFIXES),
            Err(PathError::Empty)
        );
        assert_eq!(sanitize_edit_path("  ", DEFAULT_SANDBOX_PREFIXES), Err(PathError::Empty));
    }
}
