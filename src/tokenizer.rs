//! Tree-to-token conversion
//!
//! Runs the language's highlight query over a parsed tree and folds the
//! captures into gap-free token spans for the [`TokenStore`]. Capture
//! ranges may nest or coincide; coinciding captures stack their scopes on
//! one token, nested captures split the enclosing token so every byte
//! keeps exactly one metadata word.
//!
//! All write paths stamp results with the buffer version they were
//! computed against; a result that no longer matches the live version is
//! dropped before it reaches the store.

use std::ops::Range;

use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Point, Query, QueryCursor, TextProvider, Tree};

use crate::buffer::{BufferEdit, TextBuffer};
use crate::languages::LanguageId;
use crate::store::{TokenQuality, TokenSpan, TokenStore};
use crate::theme::Theme;
use crate::tree::SyntaxError;

/// Feeds node text to query predicates straight from the rope chunks,
/// never materializing the document.
struct BufferTextProvider<'a>(&'a dyn TextBuffer);

struct BufferChunks<'a> {
    buffer: &'a dyn TextBuffer,
    offset: usize,
    end: usize,
}

impl<'a> Iterator for BufferChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.end {
            return None;
        }
        let buffer: &'a dyn TextBuffer = self.buffer;
        let chunk = buffer.chunk_at(self.offset);
        if chunk.is_empty() {
            return None;
        }
        let take = chunk.len().min(self.end - self.offset);
        self.offset += take;
        Some(&chunk[..take])
    }
}

impl<'a> TextProvider<&'a [u8]> for BufferTextProvider<'a> {
    type I = BufferChunks<'a>;

    fn text(&mut self, node: Node) -> BufferChunks<'a> {
        BufferChunks {
            buffer: self.0,
            offset: node.start_byte(),
            end: node.end_byte(),
        }
    }
}

/// Working token during the splice: a byte range plus the capture scopes
/// that apply to it, innermost last.
#[derive(Debug, Clone)]
struct SplicedToken<'q> {
    start: usize,
    end: usize,
    scopes: Vec<&'q str>,
}

fn split_token_at(tokens: &mut Vec<SplicedToken<'_>>, at: usize) {
    if let Some(i) = tokens.iter().position(|t| t.start < at && at < t.end) {
        let tail_end = tokens[i].end;
        let tail_scopes = tokens[i].scopes.clone();
        tokens[i].end = at;
        tokens.insert(
            i + 1,
            SplicedToken {
                start: at,
                end: tail_end,
                scopes: tail_scopes,
            },
        );
    }
}

/// Fold raw captures into a gap-free sequence of scoped tokens covering
/// exactly `range`.
///
/// A capture matching an existing token's range stacks its scope on that
/// token; a capture inside an existing token splits it; uncaptured bytes
/// become scope-less fillers.
fn splice_captures<'q>(
    captures: Vec<(usize, usize, &'q str)>,
    range: &Range<usize>,
) -> Vec<SplicedToken<'q>> {
    let mut tokens: Vec<SplicedToken<'q>> = Vec::new();
    let mut covered_end = range.start;

    for (start, end, scope) in captures {
        let start = start.max(range.start).min(range.end);
        let end = end.min(range.end);
        if end <= start {
            continue;
        }

        if start >= covered_end {
            if start > covered_end {
                tokens.push(SplicedToken {
                    start: covered_end,
                    end: start,
                    scopes: Vec::new(),
                });
            }
            tokens.push(SplicedToken {
                start,
                end,
                scopes: vec![scope],
            });
            covered_end = end;
        } else {
            let inner_end = end.min(covered_end);
            split_token_at(&mut tokens, start);
            split_token_at(&mut tokens, inner_end);
            for token in tokens.iter_mut() {
                if token.start >= start && token.end <= inner_end {
                    token.scopes.push(scope);
                }
            }
            if end > covered_end {
                tokens.push(SplicedToken {
                    start: covered_end,
                    end,
                    scopes: vec![scope],
                });
                covered_end = end;
            }
        }
    }

    if covered_end < range.end {
        tokens.push(SplicedToken {
            start: covered_end,
            end: range.end,
            scopes: Vec::new(),
        });
    }

    tokens
}

/// Run the highlight query over `range` of the tree and return encoded,
/// gap-free token spans covering exactly that range.
///
/// Pure: commits nothing. `is_bracket` classifies a captured byte range
/// as bracket text (only consulted for punctuation scopes).
pub(crate) fn spans_for_range<T, I>(
    query: &Query,
    tree: &Tree,
    provider: T,
    range: Range<usize>,
    theme: &Theme,
    language: LanguageId,
    is_bracket: impl Fn(usize, usize) -> bool,
) -> Vec<TokenSpan>
where
    T: TextProvider<I>,
    I: AsRef<[u8]>,
{
    let mut cursor = QueryCursor::new();
    cursor.set_byte_range(range.clone());

    let mut raw: Vec<(usize, usize, &str)> = Vec::new();
    let mut captures = cursor.captures(query, tree.root_node(), provider);
    while let Some((query_match, capture_idx)) = captures.next() {
        let capture = &query_match.captures[*capture_idx];
        let name = query.capture_names()[capture.index as usize];
        let node = capture.node;
        raw.push((node.start_byte(), node.end_byte(), name));
    }

    let tokens = splice_captures(raw, &range);

    let mut spans = Vec::with_capacity(tokens.len());
    for token in tokens {
        let has_bracket = token.scopes.iter().any(|s| s.starts_with("punctuation"))
            && is_bracket(token.start, token.end);
        let metadata = theme.find_metadata(&token.scopes, language, has_bracket);
        spans.push(TokenSpan::new(token.end - token.start, metadata));
    }
    spans
}

fn range_contains_bracket(text: &str) -> bool {
    text.bytes()
        .any(|b| matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}'))
}

/// Byte offset of the first character of `line`, clamped to the buffer end
pub(crate) fn line_start_offset(buffer: &dyn TextBuffer, line: usize) -> usize {
    if line >= buffer.line_count() {
        buffer.len_bytes()
    } else {
        buffer.offset_at(Point { row: line, column: 0 })
    }
}

/// Converts trees to tokens for one buffer and owns that buffer's store.
pub struct Tokenizer {
    store: TokenStore,
    language: LanguageId,
}

impl Tokenizer {
    pub fn new(language: LanguageId) -> Self {
        Self {
            store: TokenStore::new(),
            language,
        }
    }

    pub fn language(&self) -> LanguageId {
        self.language
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TokenStore {
        &mut self.store
    }

    /// Drop all cached tokens (grammar or theme teardown)
    pub fn reset(&mut self) {
        self.store = TokenStore::new();
    }

    /// Synchronous edit response: splice guessed tokens into the store so
    /// the edited region renders plausibly until a real pass lands.
    pub fn handle_edit(&mut self, edit: &BufferEdit) {
        self.store.apply_edit_guess(edit);
    }

    /// Grow or shrink the store's coverage to `doc_len` with scope-less
    /// spans so later range writes always land inside the partition.
    pub fn ensure_coverage(&mut self, doc_len: usize, version: u64) {
        let covered = self.store.document_length();
        if covered < doc_len {
            self.store.update(
                0,
                covered,
                vec![TokenSpan::filler(doc_len - covered)],
                TokenQuality::None,
                version,
            );
        } else if covered > doc_len {
            self.store.delete(covered - doc_len, doc_len);
        }
    }

    /// Tokenize `range` against the live tree and commit at `quality`.
    /// Returns false when the store rejects the write as stale.
    pub fn tokenize_range(
        &mut self,
        tree: &Tree,
        query: &Query,
        buffer: &dyn TextBuffer,
        theme: &Theme,
        range: Range<usize>,
        quality: TokenQuality,
        version: u64,
    ) -> bool {
        let range = range.start.min(buffer.len_bytes())..range.end.min(buffer.len_bytes());
        if range.start >= range.end {
            return false;
        }
        let spans = spans_for_range(
            query,
            tree,
            BufferTextProvider(buffer),
            range.clone(),
            theme,
            self.language,
            |s, e| range_contains_bracket(&buffer.value_in_range(s, e)),
        );
        self.ensure_coverage(buffer.len_bytes(), version);
        self.store
            .update(range.end - range.start, range.start, spans, quality, version)
    }

    /// Tokenize the whole-line range `[start_line, end_line)` at
    /// `quality`. Fails with [`SyntaxError::StaleResult`] when the work
    /// was queued against a superseded buffer version; returns the
    /// committed byte range, or `None` when the range is empty or the
    /// store rejected the write.
    pub fn tokenize_chunk(
        &mut self,
        tree: &Tree,
        query: &Query,
        buffer: &dyn TextBuffer,
        theme: &Theme,
        start_line: usize,
        end_line: usize,
        quality: TokenQuality,
        version: u64,
    ) -> Result<Option<Range<usize>>, SyntaxError> {
        if version != buffer.version() {
            return Err(SyntaxError::StaleResult {
                computed: version,
                current: buffer.version(),
            });
        }
        let start = line_start_offset(buffer, start_line);
        let end = line_start_offset(buffer, end_line);
        if start >= end {
            return Ok(None);
        }
        if self.tokenize_range(tree, query, buffer, theme, start..end, quality, version) {
            Ok(Some(start..end))
        } else {
            Ok(None)
        }
    }

    /// Tokenize `range` of a detached parse of `text` (a document prefix,
    /// so offsets agree with the real buffer) and commit as a viewport
    /// guess. Returns the committed byte range.
    pub fn tokenize_detached(
        &mut self,
        tree: &Tree,
        query: &Query,
        text: &str,
        theme: &Theme,
        range: Range<usize>,
        doc_len: usize,
        version: u64,
    ) -> Option<Range<usize>> {
        let range = range.start.min(text.len())..range.end.min(text.len());
        if range.start >= range.end {
            return None;
        }
        let spans = spans_for_range(
            query,
            tree,
            text.as_bytes(),
            range.clone(),
            theme,
            self.language,
            |s, e| range_contains_bracket(&text[s..e]),
        );
        self.ensure_coverage(doc_len, version);
        if self.store.update(
            range.end - range.start,
            range.start,
            spans,
            TokenQuality::ViewportGuess,
            version,
        ) {
            Some(range)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EditedBuffer;
    use crate::languages::LanguageRegistry;
    use crate::theme::{metadata_color_index, metadata_has_bracket};
    use tree_sitter::Parser;

    fn rust_setup() -> (LanguageRegistry, Parser) {
        let registry = LanguageRegistry::new();
        let mut parser = Parser::new();
        parser
            .set_language(&registry.support(LanguageId::Rust).unwrap().language)
            .unwrap();
        (registry, parser)
    }

    fn parse(parser: &mut Parser, text: &str) -> Tree {
        parser.parse(text, None).unwrap()
    }

    #[test]
    fn test_tokenize_range_partitions_document() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let buffer = EditedBuffer::new("fn main() { let x = 1; }\n");
        let tree = parse(&mut parser, &buffer.text());

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        let committed = tokenizer.tokenize_range(
            &tree,
            query,
            &buffer,
            &theme,
            0..buffer.len_bytes(),
            TokenQuality::Accurate,
            buffer.version(),
        );
        assert!(committed);
        assert_eq!(tokenizer.store().document_length(), buffer.len_bytes());

        let views = tokenizer
            .store()
            .tokens_in_range(0, buffer.len_bytes());
        let mut expected_start = 0;
        for view in &views {
            assert_eq!(view.start, expected_start, "gap or overlap in partition");
            assert_eq!(view.quality, TokenQuality::Accurate);
            expected_start = view.end();
        }
        assert_eq!(expected_start, buffer.len_bytes());
    }

    #[test]
    fn test_keyword_gets_themed_color() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let buffer = EditedBuffer::new("fn main() {}\n");
        let tree = parse(&mut parser, &buffer.text());

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        tokenizer.tokenize_range(
            &tree,
            query,
            &buffer,
            &theme,
            0..buffer.len_bytes(),
            TokenQuality::Accurate,
            buffer.version(),
        );

        // "fn" is captured as a keyword and must not fall back to the
        // default foreground
        let fallback = theme.find_metadata(&[], LanguageId::Rust, false);
        let fn_token = tokenizer.store().token_at(0).unwrap();
        assert_ne!(
            metadata_color_index(fn_token.metadata),
            metadata_color_index(fallback)
        );
    }

    #[test]
    fn test_bracket_flag_set_on_punctuation() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let buffer = EditedBuffer::new("fn main() {}\n");
        let tree = parse(&mut parser, &buffer.text());

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        tokenizer.tokenize_range(
            &tree,
            query,
            &buffer,
            &theme,
            0..buffer.len_bytes(),
            TokenQuality::Accurate,
            buffer.version(),
        );

        let open_paren = buffer.text().find('(').unwrap();
        let token = tokenizer.store().token_at(open_paren).unwrap();
        assert!(metadata_has_bracket(token.metadata));

        let fn_token = tokenizer.store().token_at(0).unwrap();
        assert!(!metadata_has_bracket(fn_token.metadata));
    }

    #[test]
    fn test_stale_chunk_is_dropped() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let mut buffer = EditedBuffer::new("fn main() {}\n");
        let tree = parse(&mut parser, &buffer.text());

        let stale_version = buffer.version();
        buffer.apply_edit(0, 0, "// hi\n");

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        let committed = tokenizer.tokenize_chunk(
            &tree,
            query,
            &buffer,
            &theme,
            0,
            buffer.line_count(),
            TokenQuality::Accurate,
            stale_version,
        );
        assert!(matches!(
            committed,
            Err(SyntaxError::StaleResult {
                computed: 1,
                current: 2
            })
        ));
        assert!(tokenizer.store().is_empty());
    }

    #[test]
    fn test_edit_guess_preserves_partition() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let mut buffer = EditedBuffer::new("fn main() { let x = 1; }\n");
        let tree = parse(&mut parser, &buffer.text());

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        tokenizer.tokenize_range(
            &tree,
            query,
            &buffer,
            &theme,
            0..buffer.len_bytes(),
            TokenQuality::Accurate,
            buffer.version(),
        );

        let at = buffer.text().find('1').unwrap();
        let edit = buffer.apply_edit(at, at, "23_");
        tokenizer.handle_edit(&edit);

        assert_eq!(tokenizer.store().document_length(), buffer.len_bytes());
        let guess = tokenizer.store().token_at(at).unwrap();
        assert_eq!(guess.quality, TokenQuality::EditGuess);
    }

    #[test]
    fn test_stacked_captures_split_enclosing_token() {
        // A capture nested inside another must split the outer token;
        // exact duplicates must stack, not duplicate coverage.
        let captures = vec![(0, 10, "string"), (2, 5, "escape"), (2, 5, "string.special")];
        let tokens = splice_captures(captures, &(0..12));

        let ranges: Vec<(usize, usize)> = tokens.iter().map(|t| (t.start, t.end)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 5), (5, 10), (10, 12)]);
        assert_eq!(tokens[1].scopes, vec!["string", "escape", "string.special"]);
        assert_eq!(tokens[2].scopes, vec!["string"]);
        assert!(tokens[3].scopes.is_empty());
    }

    #[test]
    fn test_detached_viewport_write() {
        let (registry, mut parser) = rust_setup();
        let query = &registry.support(LanguageId::Rust).unwrap().highlights;
        let theme = Theme::default_dark();
        let text = "fn a() {}\nfn b() {}\n";
        let tree = parse(&mut parser, text);

        let mut tokenizer = Tokenizer::new(LanguageId::Rust);
        let committed = tokenizer.tokenize_detached(
            &tree,
            query,
            text,
            &theme,
            10..20,
            text.len(),
            1,
        );
        assert_eq!(committed, Some(10..20));

        assert!(tokenizer
            .store()
            .range_has_tokens(10, 20, TokenQuality::ViewportGuess));
        // Bytes before the viewport stay unresolved
        let head = tokenizer.store().token_at(0).unwrap();
        assert_eq!(head.quality, TokenQuality::None);
    }
}
