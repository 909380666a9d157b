//! Repair prompt construction from localization output.

use anyhow::{Context, Result};
use patchsmith_core::syntax::Language;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A second issue is included only when it is at least this similar.
const SECOND_ISSUE_MIN_SIMILARITY: f64 = 0.1;
const NO_ISSUE: &str = "No issue description provided.";
const NO_METHODS: &str = "No related code snippets found.";

// ═══════════════════════════════════════════════════════════════════════════════
// LOCALIZATION INPUT
// ═══════════════════════════════════════════════════════════════════════════════

/// `<locations_dir>/<instance_id>.json` as written by the localizer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Localization {
    #[serde(default)]
    pub related_entities: RelatedEntities,
    #[serde(default)]
    pub issue: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedEntities {
    #[serde(default)]
    pub issues: Vec<RelatedIssue>,
    #[serde(default)]
    pub methods: Vec<RelatedMethod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedIssue {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedMethod {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub source_code: String,
    #[serde(default)]
    pub similarity: f64,
}

impl Localization {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Location file not found: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse location file '{}'", path.display()))
    }

    pub fn load_for(locations_dir: &Path, instance_id: &str) -> Result<Self> {
        Self::load(&locations_dir.join(format!("{}.json", instance_id)))
    }

    /// Top issue, plus the runner-up when it is similar enough; otherwise the
    /// bare `issue` field. Carriage returns are removed.
    pub fn problem_statement(&self) -> String {
        let mut issues: Vec<&RelatedIssue> = self.related_entities.issues.iter().collect();
        issues.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let mut statement = String::new();
        if let Some(top) = issues.first() {
            statement.push_str(&format!("### {}\n{}", top.title, top.content));
            if let Some(second) = issues.get(1) {
                if second.similarity > SECOND_ISSUE_MIN_SIMILARITY {
                    statement.push_str(&format!("\n\n### {}\n{}", second.title, second.content));
                }
            }
        }

        if statement.is_empty() {
            statement = self
                .issue
                .clone()
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| NO_ISSUE.to_string());
        }
        statement.replace('\r', "")
    }

    /// Methods by descending similarity under a `## Relevant Methods` heading.
    pub fn method_context(&self) -> String {
        let mut methods: Vec<&RelatedMethod> = self.related_entities.methods.iter().collect();
        if methods.is_empty() {
            return String::new();
        }
        methods.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        let mut out = String::from("## Relevant Methods\n");
        for method in methods {
            out.push_str(&format_method(method));
        }
        out
    }
}

fn format_method(method: &RelatedMethod) -> String {
    let mut out = format!("### {}\n", method.file_path);
    if !method.signature.is_empty() {
        out.push_str(&format!("- signature : {}\n", method.signature));
    }
    if let Some(start) = method.start_line {
        out.push_str(&format!("- start_line : {}\n", start));
    }
    if let Some(end) = method.end_line {
        out.push_str(&format!("- end_line : {}\n", end));
    }
    out.push_str(method.source_code.trim_end_matches('\n'));
    out.push_str("\n\n");
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROMPT
// ═══════════════════════════════════════════════════════════════════════════════

const REPAIR_TEMPLATE: &str = r#"We are currently solving the following issue within our repository. Here is the issue text:
--- BEGIN ISSUE ---
{problem_statement}
--- END ISSUE ---

Below are some code segments, each from a relevant file. One or more of these files may contain bugs.
--- BEGIN FILE ---
```
{content}
```
--- END FILE ---

Please first localize the bug based on the issue statement, and then generate *SEARCH/REPLACE* edits to fix the issue.

Every *SEARCH/REPLACE* edit must use this format:
1. The file path (e.g., {file_path_example})
2. The start of search block: <<<<<<< SEARCH
3. A contiguous chunk of lines to search for in the existing source code
4. The dividing line: =======
5. The lines to replace into the source code
6. The end of the replace block: >>>>>>> REPLACE
7. Line numbers start from 1 (not 0)

Here is an example for {language_name}:

{code_example}

IMPORTANT NOTES:
1. Line numbers start from 1 (not 0)
2. The SEARCH block must match the exact content and indentation from the original file.
3. The REPLACE block must maintain proper indentation relative to the surrounding code.
4. Only include the specific lines that need to be changed.
5. If modifying a method or function, include its entire definition in both SEARCH and REPLACE blocks if it helps clarity, or at least enough context.
6. Only generate edits when actual changes are needed.
7. Verify that the replacement code is actually different from the original.

Please note that the *SEARCH/REPLACE* edit REQUIRES PROPER INDENTATION. If you would like to add a line like '        print(x)' ({language_name}), you must fully write that out, with all those spaces before the code!
Wrap the *SEARCH/REPLACE* edit in blocks ```{code_block_lang}...```.
"#;

const PYTHON_EXAMPLE: &str = r#"```python
### django/core/management/commands/migrate.py
- start_line : 15
- end_line : 17
<<<<<<< SEARCH
    def my_method(self):
        result = 1 + 1
        return result
=======
    def my_method(self):
        result = 1 + 2  # Fixed the calculation
        return result
>>>>>>> REPLACE
```"#;

const JAVA_EXAMPLE: &str = r#"```java
### com/example/utils/StringUtils.java
- start_line : 25
- end_line : 28
<<<<<<< SEARCH
    public static boolean isEmpty(String str) {
        return str == null || str.length() == 0;
    }
=======
    public static boolean isEmpty(String str) {
        return str == null || str.trim().length() == 0;
    }
>>>>>>> REPLACE
```"#;

const CPP_EXAMPLE: &str = r#"```cpp
### src/math/calculator.cpp
- start_line : 8
- end_line : 11
<<<<<<< SEARCH
int Calculator::add(int a, int b) {
    return a - b; // Incorrect logic
}
=======
int Calculator::add(int a, int b) {
    return a + b; // Corrected logic
}
>>>>>>> REPLACE
```"#;

const GENERIC_EXAMPLE: &str = r#"```{code_block_lang}
### {file_path_example}
- start_line : 10
- end_line : 12
<<<<<<< SEARCH
    let total = compute(values);
    return total;
=======
    let total = compute(values);
    return total / count;
>>>>>>> REPLACE
```"#;

/// Per-language wording and example for the repair prompt. Python, Java and
/// C++ have dedicated examples; other parsed languages share a generic one
/// fenced with their own tag. Unknown languages use the Python profile.
#[derive(Debug, Clone, Copy)]
pub struct PromptProfile {
    pub language: Language,
    pub language_name: &'static str,
    pub file_path_example: &'static str,
    pub code_example: &'static str,
}

impl PromptProfile {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Java => Self {
                language,
                language_name: "Java",
                file_path_example: "com/example/MyClass.java",
                code_example: JAVA_EXAMPLE,
            },
            Language::Cpp => Self {
                language,
                language_name: "C++",
                file_path_example: "src/module/my_class.cpp",
                code_example: CPP_EXAMPLE,
            },
            Language::Rust => Self::generic(language, "Rust", "src/module/mod.rs"),
            Language::Go => Self::generic(language, "Go", "pkg/module/handler.go"),
            Language::JavaScript => Self::generic(language, "JavaScript", "src/module/handler.js"),
            Language::TypeScript | Language::Tsx => {
                Self::generic(language, "TypeScript", "src/module/handler.ts")
            }
            Language::Python | Language::Unknown => Self {
                language: Language::Python,
                language_name: "Python",
                file_path_example: "my_package/my_module.py",
                code_example: PYTHON_EXAMPLE,
            },
        }
    }

    fn generic(
        language: Language,
        language_name: &'static str,
        file_path_example: &'static str,
    ) -> Self {
        Self {
            language,
            language_name,
            file_path_example,
            code_example: GENERIC_EXAMPLE,
        }
    }

    /// Fence tag the model is asked to wrap its edits in.
    pub fn code_block_tag(&self) -> &'static str {
        self.language.fence_tag()
    }
}

pub fn build_prompt(localization: &Localization, profile: &PromptProfile) -> String {
    let methods = localization.method_context();
    let content = if methods.is_empty() {
        NO_METHODS.to_string()
    } else {
        methods
    };

    let example = render(
        profile.code_example,
        &[
            ("{code_block_lang}", profile.code_block_tag()),
            ("{file_path_example}", profile.file_path_example),
        ],
    );

    let problem_statement = localization.problem_statement();
    render(
        REPAIR_TEMPLATE,
        &[
            ("{problem_statement}", problem_statement.as_str()),
            ("{content}", content.as_str()),
            ("{file_path_example}", profile.file_path_example),
            ("{language_name}", profile.language_name),
            ("{code_example}", example.as_str()),
            ("{code_block_lang}", profile.code_block_tag()),
        ],
    )
}

/// Substitute placeholders in one left-to-right pass; inserted values are
/// never rescanned.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match values.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
