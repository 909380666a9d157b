//! Syntax gating for candidate file contents.
//!
//! Parsers are pooled per thread; building a tree-sitter parser is far more
//! expensive than reusing one across the retry ladder.

use std::cell::RefCell;
use std::path::Path;
use tree_sitter::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Java,
    Cpp,
    Rust,
    JavaScript,
    TypeScript,
    Tsx,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "py" | "pyi" => Language::Python,
            "java" => Language::Java,
            "cpp" | "cc" | "cxx" | "c++" | "hpp" | "hh" | "hxx" | "h" => Language::Cpp,
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "mts" | "cts" => Language::TypeScript,
            "tsx" => Language::Tsx,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }

    /// Maps a code-fence or CLI language tag.
    pub fn from_tag(tag: &str) -> Self {
        match crate::blocks::canonical_tag(tag).as_str() {
            "python" => Language::Python,
            "java" => Language::Java,
            "cpp" => Language::Cpp,
            "rust" => Language::Rust,
            "javascript" => Language::JavaScript,
            "typescript" => Language::TypeScript,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    /// Fence tag the model is asked to use for this language.
    pub fn fence_tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::TypeScript | Language::Tsx => "typescript",
            Language::Go => "go",
            Language::Unknown => "",
        }
    }

    pub fn has_parser(&self) -> bool {
        !matches!(self, Language::Unknown)
    }
}

pub trait SyntaxValidator: Send + Sync {
    fn is_valid(&self, content: &str, language: Language) -> bool;
}

impl<F> SyntaxValidator for F
where
    F: Fn(&str, Language) -> bool + Send + Sync,
{
    fn is_valid(&self, content: &str, language: Language) -> bool {
        self(content, language)
    }
}

/// Validator backed by tree-sitter grammars. Languages without a grammar
/// always pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSitterValidator;

impl SyntaxValidator for TreeSitterValidator {
    fn is_valid(&self, content: &str, language: Language) -> bool {
        if !language.has_parser() {
            return true;
        }
        if content.trim().is_empty() {
            return false;
        }
        match parse_has_errors(content, language) {
            Ok(has_errors) => !has_errors,
            Err(err) => {
                tracing::debug!(?language, error = %err, "parser unavailable; accepting content");
                true
            }
        }
    }
}

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static JAVA_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_java::LANGUAGE.into());
        p
    });

    static CPP_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_cpp::LANGUAGE.into());
        p
    });

    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

/// Returns true if parsing produced ERROR or MISSING nodes.
pub fn parse_has_errors(content: &str, language: Language) -> anyhow::Result<bool> {
    let parse_result = match language {
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Java => JAVA_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Cpp => CPP_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => TS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Tsx => TSX_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => return Err(anyhow::anyhow!("Unknown language")),
    };

    let tree = parse_result.ok_or_else(|| anyhow::anyhow!("Failed to parse content"))?;
    Ok(tree.root_node().has_error())
}
