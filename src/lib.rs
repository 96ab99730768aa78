//! Incremental tree-sitter tokenization for syntax highlighting
//!
//! This crate keeps a syntax tree and a token cache synchronized with an
//! edited text buffer. Typing stays responsive because edits only apply
//! cheap tree edits and token guesses synchronously; reparsing and
//! accurate re-tokenization run as bounded jobs drained from a work
//! queue, and only the regions the reparse actually changed are
//! recomputed.
//!
//! Entry point is [`TokenBackend`], one per open buffer:
//!
//! ```
//! use tokenkit::{EditedBuffer, LanguageId, Theme, TokenBackend};
//!
//! let mut buffer = EditedBuffer::new("fn main() {}\n");
//! let mut backend = TokenBackend::new(LanguageId::Rust, Theme::default_dark(), &buffer);
//! backend.run_until_idle(&buffer);
//!
//! let tokens = backend.get_line_tokens(&buffer, 0);
//! assert!(!tokens.is_empty());
//!
//! let edit = buffer.apply_edit(0, 0, "// doc\n");
//! backend.handle_content_change(&buffer, &[edit]);
//! backend.run_until_idle(&buffer);
//! ```

pub mod backend;
pub mod buffer;
pub mod diff;
pub mod languages;
pub mod store;
pub mod theme;
pub mod tokenizer;
pub mod tree;
pub mod work;

pub use backend::{LineTokens, TokenBackend, TokensChangedEvent};
pub use buffer::{BufferEdit, EditedBuffer, TextBuffer};
pub use languages::{LanguageId, LanguageRegistry};
pub use store::{TokenQuality, TokenSpan, TokenStore, TokenView};
pub use theme::Theme;
pub use tree::{SyntaxError, SyntaxTree};
pub use work::{StepBudget, WorkQueue, MAX_CHUNK_LINES};
