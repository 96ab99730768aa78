//! Tokenization facade
//!
//! One [`TokenBackend`] per open buffer ties the chain together: language
//! registry, syntax tree, tokenizer, token store, work queue. A link
//! changing upstream (language switch, theme switch) tears down and
//! rebuilds everything downstream of it.
//!
//! The backend never blocks: edits apply cheap guesses synchronously,
//! everything else is queued and drained by [`TokenBackend::step`] from
//! the host's idle loop.

use std::ops::Range;
use std::time::Duration;

use crate::buffer::{BufferEdit, TextBuffer};
use crate::languages::{LanguageId, LanguageRegistry};
use crate::store::TokenQuality;
use crate::theme::Theme;
use crate::tokenizer::{line_start_offset, spans_for_range, Tokenizer};
use crate::tree::{ParseOutcome, SyntaxTree};
use crate::work::{StepBudget, WorkQueue};

/// Below this size the document is considered cheap to tokenize
/// synchronously even without prior coverage.
const CHEAP_TOKENIZE_BYTES: usize = 64 * 1024;

/// Fired after tokens for some byte ranges were replaced in the store
#[derive(Debug, Clone)]
pub struct TokensChangedEvent {
    /// Buffer version the new tokens reflect
    pub version: u64,
    pub ranges: Vec<Range<usize>>,
}

/// A line's tokens: (end offset within the line, packed metadata) pairs
pub type LineTokens = Vec<(usize, u32)>;

type TokensListener = Box<dyn FnMut(&TokensChangedEvent)>;
type StateListener = Box<dyn FnMut(bool)>;

/// Facade over the tokenization chain for a single buffer.
pub struct TokenBackend {
    registry: LanguageRegistry,
    theme: Theme,
    language: LanguageId,
    tree: Option<SyntaxTree>,
    tokenizer: Tokenizer,
    queue: WorkQueue,
    viewport_lines: Option<Range<usize>>,
    background_complete: bool,
    tokens_listeners: Vec<TokensListener>,
    state_listeners: Vec<StateListener>,
}

impl TokenBackend {
    /// Build the chain for `language` and schedule the initial parse of
    /// `buffer`.
    pub fn new(language: LanguageId, theme: Theme, buffer: &dyn TextBuffer) -> Self {
        let mut backend = Self {
            registry: LanguageRegistry::new(),
            theme,
            language,
            tree: None,
            tokenizer: Tokenizer::new(language),
            queue: WorkQueue::new(),
            viewport_lines: None,
            background_complete: false,
            tokens_listeners: Vec::new(),
            state_listeners: Vec::new(),
        };
        backend.rebuild_chain(buffer);
        backend
    }

    /// Build with a caller-provided registry (tests inject disabled
    /// languages through this).
    pub fn with_registry(
        registry: LanguageRegistry,
        language: LanguageId,
        theme: Theme,
        buffer: &dyn TextBuffer,
    ) -> Self {
        let mut backend = Self {
            registry,
            theme,
            language,
            tree: None,
            tokenizer: Tokenizer::new(language),
            queue: WorkQueue::new(),
            viewport_lines: None,
            background_complete: false,
            tokens_listeners: Vec::new(),
            state_listeners: Vec::new(),
        };
        backend.rebuild_chain(buffer);
        backend
    }

    pub fn language(&self) -> LanguageId {
        self.language
    }

    pub fn theme(&self) -> &Theme {
        &self.theme
    }

    /// Register a tokens-changed listener
    pub fn on_did_change_tokens(&mut self, listener: impl FnMut(&TokensChangedEvent) + 'static) {
        self.tokens_listeners.push(Box::new(listener));
    }

    /// Register a background-tokenization-state listener; fired with
    /// `true` once when the whole document becomes accurately tokenized,
    /// `false` once when new work invalidates that.
    pub fn on_did_change_background_state(&mut self, listener: impl FnMut(bool) + 'static) {
        self.state_listeners.push(Box::new(listener));
    }

    fn emit_tokens_changed(&mut self, version: u64, ranges: Vec<Range<usize>>) {
        if ranges.is_empty() {
            return;
        }
        let event = TokensChangedEvent { version, ranges };
        for listener in &mut self.tokens_listeners {
            listener(&event);
        }
    }

    fn set_background_complete(&mut self, complete: bool) {
        if self.background_complete == complete {
            return;
        }
        self.background_complete = complete;
        tracing::debug!("Background tokenization complete: {}", complete);
        for listener in &mut self.state_listeners {
            listener(complete);
        }
    }

    /// Tear down tree, tokens, and pending work, then rebuild for the
    /// current language and schedule a full reparse.
    fn rebuild_chain(&mut self, buffer: &dyn TextBuffer) {
        if let Some(tree) = &mut self.tree {
            tree.dispose();
        }
        self.tree = None;
        self.tokenizer = Tokenizer::new(self.language);
        self.queue.clear();
        self.set_background_complete(false);

        let Some(support) = self.registry.support(self.language) else {
            // No grammar: the store stays empty and lines render unstyled
            return;
        };
        match SyntaxTree::new(self.language, support) {
            Ok(tree) => {
                self.tree = Some(tree);
                self.queue.schedule_reparse(buffer.version());
            }
            Err(e) => {
                tracing::error!("Cannot build syntax tree for {:?}: {}", self.language, e);
            }
        }
    }

    /// Mutable registry access for hosts that resolve grammars
    /// asynchronously; follow mutations with [`dependencies_changed`].
    ///
    /// [`dependencies_changed`]: TokenBackend::dependencies_changed
    pub fn registry_mut(&mut self) -> &mut LanguageRegistry {
        &mut self.registry
    }

    /// Re-derive the chain from the current dependency snapshot. A grammar
    /// that became unavailable tears the tree and tokens down; one that
    /// became available builds them.
    pub fn dependencies_changed(&mut self, buffer: &dyn TextBuffer) {
        let available = self.registry.support(self.language).is_some();
        if available != self.tree.is_some() {
            self.rebuild_chain(buffer);
        }
    }

    /// Switch the buffer's language; everything downstream is rebuilt.
    pub fn set_language(&mut self, language: LanguageId, buffer: &dyn TextBuffer) {
        if language == self.language {
            return;
        }
        tracing::info!("Language changed to {:?}", language);
        self.language = language;
        self.rebuild_chain(buffer);
    }

    /// Switch themes: all accurate tokens must be re-encoded, but the
    /// viewport is refreshed eagerly so the switch is visible immediately.
    pub fn set_theme(&mut self, theme: Theme, buffer: &dyn TextBuffer) {
        self.theme = theme;
        self.tokenizer.store_mut().mark_accurate_for_refresh();
        self.set_background_complete(false);
        if let Some(viewport) = self.viewport_lines.clone() {
            self.force_tokenization(buffer, viewport.start, viewport.end);
        }
        self.schedule_refresh_ranges(buffer);
    }

    /// Apply content edits: guessed tokens land synchronously, the real
    /// reparse is queued.
    pub fn handle_content_change(&mut self, buffer: &dyn TextBuffer, edits: &[BufferEdit]) {
        if edits.is_empty() {
            return;
        }
        for edit in edits {
            self.tokenizer.handle_edit(edit);
        }
        let guessed: Vec<Range<usize>> = edits
            .iter()
            .map(|e| e.range_offset..e.new_end_offset())
            .collect();
        let version = edits.last().map(|e| e.version).unwrap_or(buffer.version());
        self.set_background_complete(false);
        if let Some(tree) = &mut self.tree {
            tree.handle_content_change(edits, &mut self.queue);
        }
        self.emit_tokens_changed(version, guessed);
    }

    /// Line tokens for rendering: (end offset within line, metadata)
    /// pairs partitioning the line. Uncovered bytes fall back to the
    /// theme's default foreground.
    pub fn get_line_tokens(&self, buffer: &dyn TextBuffer, line: usize) -> LineTokens {
        let start = line_start_offset(buffer, line);
        let end = line_start_offset(buffer, line + 1);
        if start >= end {
            return Vec::new();
        }
        let fallback = self.theme.find_metadata(&[], self.language, false);
        let views = self.tokenizer.store().tokens_in_range(start, end);
        if views.is_empty() {
            return vec![(end - start, fallback)];
        }
        let mut out = Vec::with_capacity(views.len() + 1);
        let mut covered = start;
        for view in views {
            if view.start > covered {
                out.push((view.start - start, fallback));
            }
            out.push((view.end() - start, view.metadata));
            covered = view.end();
        }
        if covered < end {
            out.push((end - start, fallback));
        }
        out
    }

    pub fn has_tokens(&self) -> bool {
        !self.tokenizer.store().is_empty()
    }

    pub fn has_accurate_tokens_for_line(&self, buffer: &dyn TextBuffer, line: usize) -> bool {
        let start = line_start_offset(buffer, line);
        let end = line_start_offset(buffer, line + 1);
        if start >= end {
            return true;
        }
        self.tokenizer
            .store()
            .range_has_tokens(start, end, TokenQuality::Accurate)
    }

    /// Whether tokens up to `line` can be produced synchronously without
    /// noticeable latency: either the prefix is already covered or the
    /// document is small.
    pub fn is_cheap_to_tokenize(&self, buffer: &dyn TextBuffer, line: usize) -> bool {
        let start = line_start_offset(buffer, line);
        if start <= CHEAP_TOKENIZE_BYTES {
            return true;
        }
        start == 0
            || self
                .tokenizer
                .store()
                .range_has_tokens(0, start, TokenQuality::EditGuess)
    }

    /// Synchronously produce accurate tokens for `[start_line, end_line)`,
    /// parsing first if needed. One notification for the whole range.
    pub fn force_tokenization(
        &mut self,
        buffer: &dyn TextBuffer,
        start_line: usize,
        end_line: usize,
    ) {
        let Some(tree) = &mut self.tree else {
            return;
        };
        if tree.is_parsing() || tree.tree().is_none() {
            match tree.parse_step(buffer) {
                Ok(ParseOutcome::Parsed { version, changed }) => {
                    let regions: Vec<(usize, usize)> =
                        changed.iter().map(|r| (r.start, r.end)).collect();
                    for (s, e) in regions {
                        self.schedule_byte_range(buffer, s, e, version);
                    }
                }
                Ok(ParseOutcome::Idle) => {}
                Err(e) => {
                    tracing::warn!("Forced parse failed: {}", e);
                    return;
                }
            }
        }
        let Some(support) = self.registry.support(self.language) else {
            return;
        };
        let Some(tree) = self.tree.as_ref().and_then(|t| t.tree()) else {
            return;
        };
        let committed = self.tokenizer.tokenize_chunk(
            tree,
            &support.highlights,
            buffer,
            &self.theme,
            start_line,
            end_line,
            TokenQuality::Accurate,
            buffer.version(),
        );
        if let Ok(Some(range)) = committed {
            self.emit_tokens_changed(buffer.version(), vec![range]);
        }
    }

    /// The viewport moved. Lines not yet covered at viewport quality or
    /// better get an immediate guess pass from a detached parse of the
    /// document prefix; one notification covers the whole refresh.
    pub fn set_viewport(&mut self, buffer: &dyn TextBuffer, start_line: usize, end_line: usize) {
        self.viewport_lines = Some(start_line..end_line);
        let start = line_start_offset(buffer, start_line);
        let end = line_start_offset(buffer, end_line);
        if start >= end {
            return;
        }
        // Write only where quality is still below a viewport guess;
        // Accurate islands inside the viewport must not be downgraded.
        let pending =
            self.tokenizer
                .store()
                .ranges_below_quality(start, end, TokenQuality::ViewportGuess);
        if pending.is_empty() {
            return;
        }
        let Some(support) = self.registry.support(self.language) else {
            return;
        };
        let Some(tree) = &mut self.tree else {
            return;
        };
        // Parse only the prefix so offsets in the detached tree agree
        // with the live buffer
        let prefix = buffer.value_in_range(0, end);
        let Some(detached) = tree.parse_detached(&prefix) else {
            return;
        };
        let mut committed = Vec::new();
        for (s, e) in pending {
            if let Some(range) = self.tokenizer.tokenize_detached(
                &detached,
                &support.highlights,
                &prefix,
                &self.theme,
                s..e,
                buffer.len_bytes(),
                buffer.version(),
            ) {
                committed.push(range);
            }
        }
        if !committed.is_empty() {
            self.emit_tokens_changed(buffer.version(), committed);
        }
    }

    /// Speculatively tokenize `lines` as if inserted at `line`, without
    /// touching the store. Returns per-line (end offset, metadata) pairs.
    pub fn tokenize_lines_at(
        &mut self,
        buffer: &dyn TextBuffer,
        line: usize,
        lines: &[&str],
    ) -> Vec<LineTokens> {
        let Some(support) = self.registry.support(self.language) else {
            return lines.iter().map(|_| Vec::new()).collect();
        };
        let Some(tree) = &mut self.tree else {
            return lines.iter().map(|_| Vec::new()).collect();
        };
        let insert_at = line_start_offset(buffer, line);
        let mut text = buffer.value_in_range(0, insert_at);
        let prefix_len = text.len();
        for l in lines {
            text.push_str(l);
            text.push('\n');
        }
        let Some(detached) = tree.parse_detached(&text) else {
            return lines.iter().map(|_| Vec::new()).collect();
        };

        let mut out = Vec::with_capacity(lines.len());
        let mut offset = prefix_len;
        for l in lines {
            let line_end = offset + l.len();
            let spans = spans_for_range(
                &support.highlights,
                &detached,
                text.as_bytes(),
                offset..line_end,
                &self.theme,
                self.language,
                |s, e| text[s..e].bytes().any(|b| matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}')),
            );
            let mut pairs = Vec::with_capacity(spans.len());
            let mut end_in_line = 0;
            for span in spans {
                end_in_line += span.length;
                pairs.push((end_in_line, span.metadata));
            }
            out.push(pairs);
            offset = line_end + 1;
        }
        out
    }

    /// True once every queued job has drained and the store is accurate.
    pub fn is_background_complete(&self) -> bool {
        self.background_complete
    }

    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_idle()
    }

    fn schedule_byte_range(
        &mut self,
        buffer: &dyn TextBuffer,
        start: usize,
        end: usize,
        version: u64,
    ) {
        if start >= end {
            return;
        }
        let start_line = buffer.position_at(start).row;
        let end_line = (buffer.position_at(end).row + 1).min(buffer.line_count());
        self.queue
            .schedule_chunked_range(start_line, end_line, version);
    }

    fn schedule_refresh_ranges(&mut self, buffer: &dyn TextBuffer) {
        let pending = self.tokenizer.store().needs_refresh_ranges();
        let version = buffer.version();
        for (start, end) in pending {
            self.schedule_byte_range(buffer, start, end, version);
        }
    }

    /// Drain one job from the queue. Returns true when a job ran.
    pub fn step(&mut self, buffer: &dyn TextBuffer) -> bool {
        use crate::work::Job;

        let Some(job) = self.queue.next_current(buffer.version()) else {
            self.settle(buffer);
            return false;
        };

        match job {
            Job::Reparse { .. } => {
                let Some(tree) = &mut self.tree else {
                    return true;
                };
                match tree.parse_step(buffer) {
                    Ok(ParseOutcome::Parsed { version, changed }) => {
                        let regions: Vec<(usize, usize)> =
                            changed.iter().map(|r| (r.start, r.end)).collect();
                        for (s, e) in regions {
                            self.schedule_byte_range(buffer, s, e, version);
                        }
                    }
                    Ok(ParseOutcome::Idle) => {}
                    Err(e) => {
                        tracing::warn!("Background parse failed: {}", e);
                    }
                }
            }
            Job::TokenizeChunk {
                start_line,
                end_line,
                version,
            } => {
                let committed = match (
                    self.registry.support(self.language),
                    self.tree.as_ref().and_then(|t| t.tree()),
                ) {
                    (Some(support), Some(tree)) => match self.tokenizer.tokenize_chunk(
                        tree,
                        &support.highlights,
                        buffer,
                        &self.theme,
                        start_line,
                        end_line,
                        TokenQuality::Accurate,
                        version,
                    ) {
                        Ok(range) => range,
                        Err(e) => {
                            // Superseded work; the reparse for the newer
                            // version reschedules this range
                            tracing::trace!("{}", e);
                            None
                        }
                    },
                    _ => None,
                };
                if let Some(range) = committed {
                    self.emit_tokens_changed(version, vec![range]);
                }
            }
        }
        self.settle(buffer);
        true
    }

    /// Pump the queue until the budget runs out or it drains.
    pub fn run(&mut self, buffer: &dyn TextBuffer, mut budget: StepBudget) {
        while budget.consume() && self.step(buffer) {}
    }

    /// Pump with the default wall-clock yield budget.
    pub fn run_with_default_budget(&mut self, buffer: &dyn TextBuffer) {
        self.run(buffer, StepBudget::wall(Duration::from_millis(50)));
    }

    /// Drain completely (tests and synchronous hosts).
    pub fn run_until_idle(&mut self, buffer: &dyn TextBuffer) {
        self.run(buffer, StepBudget::unlimited());
    }

    /// When the queue is idle, either reschedule drifted ranges or declare
    /// background tokenization complete.
    fn settle(&mut self, buffer: &dyn TextBuffer) {
        if !self.queue.is_idle() {
            return;
        }
        if self.tree.as_ref().is_some_and(|t| t.is_parsing()) {
            return;
        }
        if self.registry.support(self.language).is_some()
            && self.tree.as_ref().is_some_and(|t| t.tree().is_some())
        {
            let pending = self.tokenizer.store().needs_refresh_ranges();
            if !pending.is_empty() {
                let version = buffer.version();
                for (start, end) in pending {
                    self.schedule_byte_range(buffer, start, end, version);
                }
                return;
            }
        }
        self.set_background_complete(true);
    }

    /// Release the chain's native resources; the backend stays usable as
    /// an inert (plain text) facade.
    pub fn dispose(&mut self) {
        if let Some(tree) = &mut self.tree {
            tree.dispose();
        }
        self.tree = None;
        self.tokenizer.reset();
        self.queue.clear();
    }
}
