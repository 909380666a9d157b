//! Fenced code block extraction from raw completion text.
//!
//! The extractor never allocates: blocks are slices of the input, produced
//! lazily by a line scanner. When the text contains no block with the
//! requested tag the whole input is yielded once, so unfenced completions
//! still reach the edit parser.

const FENCE: &str = "```";

/// Restartable view over the code blocks of one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlocks<'a> {
    text: &'a str,
    tag: &'a str,
}

pub fn extract_blocks<'a>(text: &'a str, tag: &'a str) -> CodeBlocks<'a> {
    CodeBlocks { text, tag }
}

impl<'a> CodeBlocks<'a> {
    /// Starts a fresh scan from the beginning of the text.
    pub fn iter(&self) -> Blocks<'a> {
        Blocks {
            text: self.text,
            tag: self.tag,
            pos: 0,
            found_any: false,
            exhausted: false,
        }
    }
}

impl<'a> IntoIterator for &CodeBlocks<'a> {
    type Item = &'a str;
    type IntoIter = Blocks<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    text: &'a str,
    tag: &'a str,
    pos: usize,
    found_any: bool,
    exhausted: bool,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.exhausted {
            return None;
        }

        while self.pos < self.text.len() {
            let (line, next) = line_at(self.text, self.pos);
            self.pos = next;
            if !opens_block(line, self.tag) {
                continue;
            }

            let body_start = next;
            let mut cursor = next;
            while cursor < self.text.len() {
                let (inner, after) = line_at(self.text, cursor);
                if inner.trim_start().starts_with(FENCE) {
                    self.pos = after;
                    self.found_any = true;
                    return Some(trim_final_newline(&self.text[body_start..cursor]));
                }
                cursor = after;
            }

            // Unterminated block: nothing after it can close a fence either.
            self.pos = self.text.len();
        }

        self.exhausted = true;
        if self.found_any {
            None
        } else {
            Some(self.text)
        }
    }
}

/// Returns the line starting at `start` without its terminator, and the
/// offset of the following line.
fn line_at(text: &str, start: usize) -> (&str, usize) {
    let rest = &text[start..];
    match rest.find('\n') {
        Some(idx) => {
            let line = &rest[..idx];
            (line.strip_suffix('\r').unwrap_or(line), start + idx + 1)
        }
        None => (rest, text.len()),
    }
}

fn trim_final_newline(body: &str) -> &str {
    match body.strip_suffix('\n') {
        Some(stripped) => stripped.strip_suffix('\r').unwrap_or(stripped),
        None => body,
    }
}

fn opens_block(line: &str, tag: &str) -> bool {
    let Some(info) = line.trim_start().strip_prefix(FENCE) else {
        return false;
    };
    let info = info.trim();
    if info.starts_with('`') {
        return false;
    }
    let wanted = canonical_tag(tag);
    if wanted.is_empty() {
        return true;
    }
    let word = info.split_whitespace().next().unwrap_or("");
    canonical_tag(word) == wanted
}

/// Folds the aliases models use for the same fence language.
pub fn canonical_tag(tag: &str) -> String {
    let lower = tag.trim().to_ascii_lowercase();
    match lower.as_str() {
        "c++" | "cpp" | "cc" | "cxx" | "hpp" => "cpp".to_string(),
        "py" | "python" | "python3" => "python".to_string(),
        "js" | "javascript" | "jsx" => "javascript".to_string(),
        "ts" | "typescript" | "tsx" => "typescript".to_string(),
        "rs" | "rust" => "rust".to_string(),
        "golang" | "go" => "go".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_blocks_in_order() {
        let text = "intro\n```python\nfirst = 1\n```\nnoise\n```python\nsecond = 2\nthird = 3\n```\n";
        let blocks: Vec<&str> = extract_blocks(text, "python").iter().collect();
        assert_eq!(blocks, vec!["first = 1", "second = 2\nthird = 3"]);
    }

    #[test]
    fn extraction_is_restartable_and_idempotent() {
        let text = "```java\nclass A {}\n```\n```java\nclass B {}\n```";
        let blocks = extract_blocks(text, "java");
        let first: Vec<&str> = blocks.iter().collect();
        let second: Vec<&str> = (&blocks).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn tag_match_is_case_insensitive_with_aliases() {
        let text = "```C++\nint main() {}\n```\n```Python\nx = 1\n```";
        let cpp: Vec<&str> = extract_blocks(text, "cpp").iter().collect();
        assert_eq!(cpp, vec!["int main() {}"]);
        let py: Vec<&str> = extract_blocks(text, "py").iter().collect();
        assert_eq!(py, vec!["x = 1"]);
    }

    #[test]
    fn falls_back_to_whole_input_when_no_block_matches() {
        let text = "### a.py\n<<<<<<< SEARCH\nx\n=======\ny\n>>>>>>> REPLACE";
        let collected: Vec<&str> = extract_blocks(text, "python").iter().collect();
        assert_eq!(collected, vec![text]);
    }

    #[test]
    fn other_language_blocks_do_not_count_as_matches() {
        let text = "```bash\nls\n```\n";
        let collected: Vec<&str> = extract_blocks(text, "python").iter().collect();
        assert_eq!(collected, vec![text]);
    }

    #[test]
    fn unterminated_block_is_dropped() {
        let text = "```python\na = 1\n```\n```python\nb = 2\n";
        let collected: Vec<&str> = extract_blocks(text, "python").iter().collect();
        assert_eq!(collected, vec!["a = 1"]);
    }

    #[test]
    fn handles_crlf_and_empty_blocks() {
        let text = "```python\r\nx = 1\r\n```\r\n```python\n```\n";
        let collected: Vec<&str> = extract_blocks(text, "python").iter().collect();
        assert_eq!(collected, vec!["x = 1", ""]);
    }
}
