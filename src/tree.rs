//! Incremental syntax tree maintenance
//!
//! Owns one tree-sitter parser and the live tree for a buffer. Buffer
//! edits apply synchronously (cheap tree-edit calls); the actual reparse
//! is a scheduled step that feeds the parser through a chunked content
//! callback and diffs the result against the pre-parse tree to find the
//! regions whose tokens must be recomputed.
//!
//! Parser and tree handles are native resources; dropping the owned
//! values releases them deterministically, and a disposed flag stops any
//! still-queued steps.

use std::ops::Range;

use thiserror::Error;
use tree_sitter::{InputEdit, Parser, Tree};

use crate::buffer::{BufferEdit, TextBuffer};
use crate::diff::{find_changed_nodes, find_tree_changes, ChangedRegion};
use crate::languages::{LanguageId, LanguageSupport};
use crate::work::WorkQueue;

/// Internal failure taxonomy. None of these propagate to the host; the
/// backend degrades to fewer or guessed tokens.
#[derive(Error, Debug)]
pub enum SyntaxError {
    /// Grammar or query not yet resolved for the language
    #[error("parser unavailable for {0:?}")]
    ParserUnavailable(LanguageId),

    /// The parser produced no tree
    #[error("parse failed")]
    ParseFailure,

    /// A completed result no longer matches the buffer version
    #[error("stale result: computed against v{computed}, buffer at v{current}")]
    StaleResult { computed: u64, current: u64 },

    /// First parse failed with local edits pending; parser was hard-reset
    #[error("structural inconsistency; parser state was reset")]
    StructuralInconsistency,
}

/// Result of one reparse step
#[derive(Debug)]
pub enum ParseOutcome {
    /// The tree now reflects `version`; `changed` lists the byte regions
    /// whose tokens must be recomputed
    Parsed {
        version: u64,
        changed: Vec<ChangedRegion>,
    },
    /// Nothing was pending (or the tree is disposed)
    Idle,
}

/// One incremental tree, synchronized with a single buffer.
pub struct SyntaxTree {
    parser: Parser,
    language: LanguageId,
    /// Live tree: reflects every applied edit, not necessarily reparsed
    tree: Option<Tree>,
    /// Version the last committed parse reflects
    parsed_version: u64,
    /// Edits were applied since the last committed parse
    pending_edits: bool,
    /// At least one parse has been committed
    had_first_parse: bool,
    disposed: bool,
    /// Externally imposed parse-range restriction (intersected into the
    /// reported changed regions)
    range_restriction: Option<Range<usize>>,
}

impl SyntaxTree {
    /// Create a tree for one language. Fails as `ParserUnavailable` when
    /// the grammar cannot be installed into a parser.
    pub fn new(language: LanguageId, support: &LanguageSupport) -> Result<Self, SyntaxError> {
        let mut parser = Parser::new();
        parser
            .set_language(&support.language)
            .map_err(|_| SyntaxError::ParserUnavailable(language))?;
        Ok(Self {
            parser,
            language,
            tree: None,
            parsed_version: 0,
            pending_edits: false,
            had_first_parse: false,
            disposed: false,
            range_restriction: None,
        })
    }

    pub fn language(&self) -> LanguageId {
        self.language
    }

    /// The live tree (edited, possibly not yet reparsed)
    pub fn tree(&self) -> Option<&Tree> {
        self.tree.as_ref()
    }

    /// Version of the last committed parse
    pub fn parsed_version(&self) -> u64 {
        self.parsed_version
    }

    /// True while a reparse is outstanding (Parsing state)
    pub fn is_parsing(&self) -> bool {
        self.pending_edits
    }

    /// Restrict reported changed regions to a byte range (None lifts it)
    pub fn set_range_restriction(&mut self, restriction: Option<Range<usize>>) {
        self.range_restriction = restriction;
    }

    /// Project a buffer edit into tree-edit coordinates
    fn project_edit(edit: &BufferEdit) -> InputEdit {
        InputEdit {
            start_byte: edit.range_offset,
            old_end_byte: edit.old_end_offset,
            new_end_byte: edit.new_end_offset(),
            start_position: edit.start_position,
            old_end_position: edit.old_end_position,
            new_end_position: edit.new_end_position,
        }
    }

    /// Apply buffer edits synchronously to the live tree and schedule
    /// (replacing any pending) an asynchronous reparse.
    pub fn handle_content_change(&mut self, edits: &[BufferEdit], queue: &mut WorkQueue) {
        if self.disposed || edits.is_empty() {
            return;
        }
        for edit in edits {
            let input_edit = Self::project_edit(edit);
            if let Some(tree) = &mut self.tree {
                tree.edit(&input_edit);
            }
            tracing::trace!(
                "Tree edit at byte {}..{} -> {}..{}",
                input_edit.start_byte,
                input_edit.old_end_byte,
                input_edit.start_byte,
                input_edit.new_end_byte,
            );
        }
        self.pending_edits = true;
        if let Some(last) = edits.last() {
            queue.schedule_reparse(last.version);
        }
    }

    /// Run one reparse step against the current buffer contents.
    ///
    /// The parser reads through `chunk_at`, never materializing the whole
    /// buffer. The edited pre-parse tree doubles as the diff baseline:
    /// parse and diff commit atomically within the step, so a superseded
    /// result is simply never committed (the queue drops stale jobs).
    pub fn parse_step(&mut self, buffer: &dyn TextBuffer) -> Result<ParseOutcome, SyntaxError> {
        if self.disposed {
            return Ok(ParseOutcome::Idle);
        }
        if self.had_first_parse && !self.pending_edits {
            return Ok(ParseOutcome::Idle);
        }

        let version = buffer.version();
        let old_with_edits = self.tree.clone();

        let new_tree = self
            .parser
            .parse_with_options(
                &mut |byte, _| buffer.chunk_at(byte),
                old_with_edits.as_ref(),
                None,
            )
            .ok_or(SyntaxError::ParseFailure);

        let new_tree = match new_tree {
            Ok(tree) => tree,
            Err(_) if !self.had_first_parse && self.pending_edits => {
                // A failed first parse with edits already applied could
                // leave a structurally invalid incremental tree; reset
                // hard and let the next content change rebuild from
                // scratch.
                tracing::warn!("First parse failed with pending edits; resetting parser");
                self.parser.reset();
                self.tree = None;
                self.pending_edits = false;
                return Err(SyntaxError::StructuralInconsistency);
            }
            Err(e) => {
                tracing::warn!("Reparse failed for {:?}; keeping previous tree", self.language);
                return Err(e);
            }
        };

        let changed = match &old_with_edits {
            Some(old) if self.had_first_parse => {
                let nodes = find_changed_nodes(old, &new_tree);
                find_tree_changes(&new_tree, nodes, self.range_restriction.clone())
            }
            _ => {
                // First parse: everything is new
                let whole = ChangedRegion {
                    start: 0,
                    end: buffer.len_bytes(),
                };
                find_tree_changes(&new_tree, vec![whole], self.range_restriction.clone())
            }
        };

        self.tree = Some(new_tree);
        self.parsed_version = version;
        self.pending_edits = false;
        self.had_first_parse = true;

        tracing::debug!(
            "Parse committed at v{} with {} changed region(s)",
            version,
            changed.len()
        );
        Ok(ParseOutcome::Parsed { version, changed })
    }

    /// Parse standalone text with this tree's grammar (viewport and
    /// speculative passes). Does not touch the live tree.
    pub fn parse_detached(&mut self, text: &str) -> Option<Tree> {
        if self.disposed {
            return None;
        }
        self.parser.parse(text, None)
    }

    /// Release parser and tree handles; queued steps become no-ops
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.tree = None;
        self.pending_edits = false;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for SyntaxTree {
    fn drop(&mut self) {
        // Tree and parser release their native handles on drop; the flag
        // only matters for steps still queued elsewhere.
        self.disposed = true;
    }
}
