//! Language identification and grammar resolution
//!
//! Maps file extensions to language IDs and resolves each language to its
//! tree-sitter grammar and compiled highlight query. A language whose query
//! fails to compile is simply unavailable: downstream stages render filler
//! tokens until it resolves (or forever, for plain text).

use std::collections::HashMap;
use std::path::Path;

use tree_sitter::{Language, Query};

/// Supported language identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LanguageId {
    #[default]
    PlainText,
    Rust,
    JavaScript,
    Json,
}

impl LanguageId {
    /// Detect language from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => LanguageId::Rust,
            "js" | "mjs" | "cjs" => LanguageId::JavaScript,
            "json" => LanguageId::Json,
            _ => LanguageId::PlainText,
        }
    }

    /// Detect language from file path
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(LanguageId::PlainText)
    }

    /// Get display name for the language
    pub fn display_name(&self) -> &'static str {
        match self {
            LanguageId::PlainText => "Plain Text",
            LanguageId::Rust => "Rust",
            LanguageId::JavaScript => "JavaScript",
            LanguageId::Json => "JSON",
        }
    }

    /// Check if this language has syntax highlighting support
    pub fn has_highlighting(&self) -> bool {
        !matches!(self, LanguageId::PlainText)
    }

    /// Numeric id packed into token metadata
    pub fn encoded(&self) -> u8 {
        match self {
            LanguageId::PlainText => 0,
            LanguageId::Rust => 1,
            LanguageId::JavaScript => 2,
            LanguageId::Json => 3,
        }
    }
}

/// Everything the tokenizer needs for one language: the grammar and its
/// compiled highlight query.
pub struct LanguageSupport {
    pub language: Language,
    pub highlights: Query,
}

/// Resolves grammars and queries per language.
///
/// Availability can toggle over time in a real host (grammars load
/// asynchronously); the registry models that with `set_available`, which
/// the backend observes through its dependency snapshot.
pub struct LanguageRegistry {
    support: HashMap<LanguageId, LanguageSupport>,
    disabled: HashMap<LanguageId, bool>,
}

impl LanguageRegistry {
    /// Create a registry with all built-in grammars initialized
    pub fn new() -> Self {
        let mut registry = Self {
            support: HashMap::new(),
            disabled: HashMap::new(),
        };
        registry.init_language(LanguageId::Rust);
        registry.init_language(LanguageId::JavaScript);
        registry.init_language(LanguageId::Json);
        registry
    }

    /// Create an empty registry (no grammars resolved yet)
    pub fn empty() -> Self {
        Self {
            support: HashMap::new(),
            disabled: HashMap::new(),
        }
    }

    fn init_language(&mut self, lang: LanguageId) {
        let (ts_lang, highlights_scm): (Language, &str) = match lang {
            LanguageId::Rust => (
                tree_sitter_rust::LANGUAGE.into(),
                tree_sitter_rust::HIGHLIGHTS_QUERY,
            ),
            LanguageId::JavaScript => (
                tree_sitter_javascript::LANGUAGE.into(),
                tree_sitter_javascript::HIGHLIGHT_QUERY,
            ),
            LanguageId::Json => (
                tree_sitter_json::LANGUAGE.into(),
                tree_sitter_json::HIGHLIGHTS_QUERY,
            ),
            LanguageId::PlainText => return,
        };

        match Query::new(&ts_lang, highlights_scm) {
            Ok(highlights) => {
                self.support.insert(
                    lang,
                    LanguageSupport {
                        language: ts_lang,
                        highlights,
                    },
                );
            }
            Err(e) => {
                tracing::error!("Failed to compile highlight query for {:?}: {:?}", lang, e);
            }
        }
    }

    /// Grammar + query for a language, if resolved and not disabled
    pub fn support(&self, lang: LanguageId) -> Option<&LanguageSupport> {
        if self.disabled.get(&lang).copied().unwrap_or(false) {
            return None;
        }
        self.support.get(&lang)
    }

    /// Toggle a language's availability (models async grammar load/unload)
    pub fn set_available(&mut self, lang: LanguageId, available: bool) {
        self.disabled.insert(lang, !available);
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
