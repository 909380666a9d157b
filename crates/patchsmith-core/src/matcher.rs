//! Indentation-tolerant SEARCH/REPLACE matching.
//!
//! Search text must match whole lines: a match starts at the beginning of a
//! line and ends at a line end. Commands whose search text cannot be located
//! are skipped, so a batch yields the best-effort merge of what did match.

use crate::protocol::{EditCommand, FailureReason, MatchMode, PatchCandidate, Strategy};
use crate::syntax::{Language, SyntaxValidator};
use std::borrow::Cow;

pub const INDENT_DELTAS: [i32; 4] = [-4, 4, -8, 8];

const ELLIPSIS: &str = "...";

/// Retry order. Evaluation stops at the first rung that yields changed, valid
/// content.
pub const STRATEGY_LADDER: [Strategy; 10] = [
    Strategy::new(0, MatchMode::AllCommands),
    Strategy::new(-4, MatchMode::AllCommands),
    Strategy::new(4, MatchMode::AllCommands),
    Strategy::new(-8, MatchMode::AllCommands),
    Strategy::new(8, MatchMode::AllCommands),
    Strategy::new(0, MatchMode::OneAtATime),
    Strategy::new(-4, MatchMode::OneAtATime),
    Strategy::new(4, MatchMode::OneAtATime),
    Strategy::new(-8, MatchMode::OneAtATime),
    Strategy::new(8, MatchMode::OneAtATime),
];

/// Apply `commands` in order against progressively mutated text.
///
/// With `only_one_occurrence` at most one command is applied; the rest are
/// left for the caller to re-invoke with.
pub fn apply(commands: &[EditCommand], original: &str, only_one_occurrence: bool) -> String {
    let crlf = original.contains("\r\n");
    let mut current = original.to_string();

    for command in commands {
        let Some(command) = resolve_ellipsis(command, &current) else {
            continue;
        };
        let (search, replace) = if crlf {
            (
                Cow::Owned(command.search_text.replace('\n', "\r\n")),
                Cow::Owned(command.replace_text.replace('\n', "\r\n")),
            )
        } else {
            (
                Cow::Borrowed(command.search_text.as_str()),
                Cow::Borrowed(command.replace_text.as_str()),
            )
        };

        if let Some(next) = replace_first_line_aligned(&current, &search, &replace) {
            current = next;
            if only_one_occurrence {
                break;
            }
        }
    }

    current
}

/// Shift every line of both texts by `delta` spaces.
///
/// A negative delta strips that many leading spaces from lines that have
/// them and leaves other lines untouched.
pub fn shift_indentation(command: &EditCommand, delta: i32) -> EditCommand {
    EditCommand {
        search_text: shift_lines(&command.search_text, delta),
        replace_text: shift_lines(&command.replace_text, delta),
        start_line_hint: command.start_line_hint,
        end_line_hint: command.end_line_hint,
    }
}

fn shift_lines(text: &str, delta: i32) -> String {
    if delta == 0 {
        return text.to_string();
    }
    let width = delta.unsigned_abs() as usize;
    let pad = " ".repeat(width);
    text.split('\n')
        .map(|line| {
            if delta > 0 {
                format!("{}{}", pad, line)
            } else {
                line.strip_prefix(pad.as_str()).unwrap_or(line).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn line_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
}

fn ends_at_line_boundary(text: &str, end: usize) -> bool {
    end == text.len() || text[end..].starts_with('\n') || text[end..].starts_with("\r\n")
}

fn find_line_aligned(text: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    line_starts(text).find(|&start| {
        text[start..].starts_with(needle) && ends_at_line_boundary(text, start + needle.len())
    })
}

fn replace_first_line_aligned(text: &str, search: &str, replace: &str) -> Option<String> {
    let start = find_line_aligned(text, search)?;
    let mut end = start + search.len();

    // A pure deletion takes its line terminator with it.
    if replace.is_empty() {
        if text[end..].starts_with("\r\n") {
            end += 2;
        } else if text[end..].starts_with('\n') {
            end += 1;
        }
    }

    let mut out = String::with_capacity(text.len() + replace.len());
    out.push_str(&text[..start]);
    out.push_str(replace);
    out.push_str(&text[end..]);
    Some(out)
}

fn strip_leading_ellipsis_line(text: &str) -> Option<&str> {
    let (first, rest) = text.split_once('\n')?;
    (first.trim() == ELLIPSIS).then_some(rest)
}

/// Rewrites `...` placeholders into something matchable.
///
/// A bare `...` search with an unindented replacement inserts, followed by a
/// blank line, before the first top-level line that occurs exactly once.
/// Returns `None` when no such anchor exists.
fn resolve_ellipsis<'c>(command: &'c EditCommand, content: &str) -> Option<Cow<'c, EditCommand>> {
    let mut resolved = Cow::Borrowed(command);

    if let Some(rest) = strip_leading_ellipsis_line(&command.replace_text) {
        resolved.to_mut().replace_text = rest.to_string();
    }

    if command.search_text.trim() == ELLIPSIS {
        let replace_is_unindented = !resolved
            .replace_text
            .starts_with(|c: char| c.is_whitespace());
        if !replace_is_unindented {
            return Some(resolved);
        }
        let anchor = unique_top_level_line(content)?;
        let owned = resolved.to_mut();
        owned.replace_text = format!("{}\n\n{}", owned.replace_text, anchor);
        owned.search_text = anchor;
    } else if let Some(rest) = strip_leading_ellipsis_line(&command.search_text) {
        resolved.to_mut().search_text = rest.to_string();
    }

    Some(resolved)
}

fn unique_top_level_line(content: &str) -> Option<String> {
    let lines: Vec<&str> = content.lines().map(|l| l.trim_end_matches('\r')).collect();
    lines
        .iter()
        .find(|line| {
            !line.is_empty()
                && !line.starts_with(|c: char| c.is_whitespace())
                && lines.iter().filter(|other| *other == *line).count() == 1
        })
        .map(|line| line.to_string())
}

/// Runs the strategy ladder for one file, gating every rung on syntax.
pub struct PatchMatcher<'v> {
    validator: &'v dyn SyntaxValidator,
    language: Language,
}

impl<'v> PatchMatcher<'v> {
    pub fn new(validator: &'v dyn SyntaxValidator, language: Language) -> Self {
        Self {
            validator,
            language,
        }
    }

    fn is_valid(&self, content: &str) -> bool {
        self.validator.is_valid(content, self.language)
    }

    /// Produce the text one rung of the ladder yields, without judging it.
    pub fn run_strategy(
        &self,
        strategy: Strategy,
        commands: &[EditCommand],
        original: &str,
    ) -> String {
        let shifted: Cow<'_, [EditCommand]> = if strategy.indentation_delta == 0 {
            Cow::Borrowed(commands)
        } else {
            Cow::Owned(
                commands
                    .iter()
                    .map(|c| shift_indentation(c, strategy.indentation_delta))
                    .collect(),
            )
        };

        match strategy.match_mode {
            MatchMode::AllCommands => apply(&shifted, original, false),
            MatchMode::OneAtATime => {
                let mut current = original.to_string();
                for command in shifted.iter() {
                    let step = apply(std::slice::from_ref(command), &current, true);
                    if step != current && self.is_valid(&step) {
                        current = step;
                    }
                }
                current
            }
        }
    }

    pub fn synthesize(
        &self,
        file_path: &str,
        original: &str,
        commands: &[EditCommand],
    ) -> Result<PatchCandidate, FailureReason> {
        let mut saw_change = false;

        for strategy in STRATEGY_LADDER {
            let candidate = self.run_strategy(strategy, commands, original);
            if candidate == original {
                tracing::trace!(file = file_path, strategy = %strategy.label(), "no change");
                continue;
            }
            saw_change = true;
            if !self.is_valid(&candidate) {
                tracing::debug!(
                    file = file_path,
                    strategy = %strategy.label(),
                    "candidate rejected by syntax check"
                );
                continue;
            }

            tracing::debug!(file = file_path, strategy = %strategy.label(), "candidate accepted");
            return Ok(PatchCandidate {
                file_path: file_path.to_string(),
                original_content: original.to_string(),
                candidate_content: candidate,
                indentation_delta: strategy.indentation_delta,
                match_mode: strategy.match_mode,
            });
        }

        Err(if saw_change {
            FailureReason::NoValidEdit
        } else {
            FailureReason::NoChange
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::TreeSitterValidator;

    fn cmd(search: &str, replace: &str) -> EditCommand {
        EditCommand::new(search, replace)
    }

    const ORIGINAL: &str = "def f():\n    return 1\n";

    #[test]
    fn direct_match_replaces_indented_line() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let candidate = matcher
            .synthesize("a.py", ORIGINAL, &[cmd("    return 1", "    return 2")])
            .unwrap();
        assert_eq!(candidate.candidate_content, "def f():\n    return 2\n");
        assert_eq!(
            candidate.strategy(),
            Strategy::new(0, MatchMode::AllCommands)
        );
    }

    #[test]
    fn unindented_search_recovers_via_positive_shift() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);

        assert_eq!(apply(&[cmd("return 1", "return 2")], ORIGINAL, false), ORIGINAL);

        let candidate = matcher
            .synthesize("a.py", ORIGINAL, &[cmd("return 1", "return 2")])
            .unwrap();
        assert_eq!(candidate.candidate_content, "def f():\n    return 2\n");
        assert_eq!(candidate.indentation_delta, 4);
        assert_eq!(candidate.match_mode, MatchMode::AllCommands);
    }

    #[test]
    fn negative_shift_wins_before_other_rungs() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let original = "class A:\n    x = 1\n";
        let candidate = matcher
            .synthesize("a.py", original, &[cmd("        x = 1", "        x = 2")])
            .unwrap();
        assert_eq!(candidate.candidate_content, "class A:\n    x = 2\n");
        assert_eq!(
            candidate.strategy(),
            Strategy::new(-4, MatchMode::AllCommands)
        );
    }

    #[test]
    fn missing_second_command_is_skipped() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let commands = [
            cmd("    return 1", "    return 2"),
            cmd("    raise ValueError()", "    pass"),
        ];
        let candidate = matcher.synthesize("a.py", ORIGINAL, &commands).unwrap();
        assert_eq!(candidate.candidate_content, "def f():\n    return 2\n");
        assert_eq!(candidate.match_mode, MatchMode::AllCommands);
    }

    #[test]
    fn identical_replacement_is_no_change() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let err = matcher
            .synthesize("a.py", ORIGINAL, &[cmd("    return 1", "    return 1")])
            .unwrap_err();
        assert_eq!(err, FailureReason::NoChange);

        let err = matcher
            .synthesize("a.py", ORIGINAL, &[cmd("nowhere", "else")])
            .unwrap_err();
        assert_eq!(err, FailureReason::NoChange);
    }

    #[test]
    fn invalid_everywhere_is_no_valid_edit() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let err = matcher
            .synthesize("a.py", ORIGINAL, &[cmd("    return 1", "    return (1")])
            .unwrap_err();
        assert_eq!(err, FailureReason::NoValidEdit);
    }

    #[test]
    fn one_at_a_time_keeps_only_valid_steps() {
        let validator = TreeSitterValidator;
        let matcher = PatchMatcher::new(&validator, Language::Python);
        let original = "def f():\n    return 1\n\n\ndef g():\n    return 3\n";
        let commands = [
            cmd("    return 1", "    return (1"),
            cmd("    return 3", "    return 4"),
        ];
        let candidate = matcher.synthesize("a.py", original, &commands).unwrap();
        assert_eq!(candidate.match_mode, MatchMode::OneAtATime);
        assert_eq!(candidate.indentation_delta, 0);
        assert!(candidate.candidate_content.contains("    return 1\n"));
        assert!(candidate.candidate_content.contains("    return 4\n"));
    }

    #[test]
    fn commands_apply_in_declaration_order() {
        let original = "x = 1\nx = 2\n";
        let forward = [cmd("x = 1", "x = 2"), cmd("x = 2", "x = 3")];
        let backward = [cmd("x = 2", "x = 3"), cmd("x = 1", "x = 2")];
        assert_eq!(apply(&forward, original, false), "x = 3\nx = 2\n");
        assert_eq!(apply(&backward, original, false), "x = 2\nx = 3\n");
    }

    #[test]
    fn only_one_occurrence_applies_a_single_command() {
        let original = "a = 1\nb = 1\n";
        let commands = [cmd("missing", "x"), cmd("a = 1", "a = 2"), cmd("b = 1", "b = 2")];
        assert_eq!(apply(&commands, original, true), "a = 2\nb = 1\n");
    }

    #[test]
    fn match_must_cover_whole_lines() {
        assert_eq!(apply(&[cmd("x = 1", "x = 2")], "xx = 1\n", false), "xx = 1\n");
        assert_eq!(apply(&[cmd("x = 1", "x = 2")], "x = 10\n", false), "x = 10\n");
        assert_eq!(apply(&[cmd("x = 1", "x = 2")], "x = 1", false), "x = 2");
    }

    #[test]
    fn deletion_removes_line_terminator() {
        let original = "import os\nimport sys\n";
        assert_eq!(apply(&[cmd("import os", "")], original, false), "import sys\n");
    }

    #[test]
    fn crlf_files_match_lf_commands() {
        let original = "a = 1\r\nb = 2\r\n";
        assert_eq!(
            apply(&[cmd("a = 1\nb = 2", "a = 1\nb = 3")], original, false),
            "a = 1\r\nb = 3\r\n"
        );
    }

    #[test]
    fn shift_indentation_strips_only_when_present() {
        let shifted = shift_indentation(&cmd("    a\n  b\nc", "        d"), -4);
        assert_eq!(shifted.search_text, "a\n  b\nc");
        assert_eq!(shifted.replace_text, "    d");

        let pushed = shift_indentation(&cmd("a\n\nb", "c"), 4);
        assert_eq!(pushed.search_text, "    a\n    \n    b");
        assert_eq!(pushed.replace_text, "    c");
    }

    #[test]
    fn ellipsis_search_inserts_before_unique_top_level_line() {
        let original = "import os\n\ndef main():\n    pass\n";
        let out = apply(&[cmd("...", "import sys")], original, false);
        assert_eq!(out, "import sys\n\nimport os\n\ndef main():\n    pass\n");
    }

    #[test]
    fn leading_ellipsis_lines_are_dropped() {
        let original = "def f():\n    a = 1\n    b = 2\n";
        let out = apply(&[cmd("...\n    b = 2", "...\n    b = 3")], original, false);
        assert_eq!(out, "def f():\n    a = 1\n    b = 3\n");
    }

    #[test]
    fn ladder_order_is_fixed() {
        let deltas: Vec<(i32, MatchMode)> = STRATEGY_LADDER
            .iter()
            .map(|s| (s.indentation_delta, s.match_mode))
            .collect();
        assert_eq!(deltas[0], (0, MatchMode::AllCommands));
        assert_eq!(&deltas[1..5].iter().map(|d| d.0).collect::<Vec<_>>(), &INDENT_DELTAS);
        assert_eq!(deltas[5], (0, MatchMode::OneAtATime));
        assert!(deltas[6..].iter().all(|d| d.1 == MatchMode::OneAtATime));
    }
}
