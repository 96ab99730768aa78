//! Shared test helpers for integration tests
//!
//! Note: Functions may appear unused because each test file compiles separately.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use tokenkit::{
    EditedBuffer, LanguageId, TextBuffer, Theme, TokenBackend, TokensChangedEvent,
};

/// Records backend events for assertions
#[derive(Default)]
pub struct Recorder {
    pub token_events: Rc<RefCell<Vec<TokensChangedEvent>>>,
    pub state_events: Rc<RefCell<Vec<bool>>>,
}

impl Recorder {
    pub fn clear(&self) {
        self.token_events.borrow_mut().clear();
        self.state_events.borrow_mut().clear();
    }

    pub fn token_event_count(&self) -> usize {
        self.token_events.borrow().len()
    }

    pub fn completions(&self) -> usize {
        self.state_events.borrow().iter().filter(|&&c| c).count()
    }
}

/// Attach a recorder to both backend event streams
pub fn record(backend: &mut TokenBackend) -> Recorder {
    let recorder = Recorder::default();
    let tokens = recorder.token_events.clone();
    backend.on_did_change_tokens(move |e| tokens.borrow_mut().push(e.clone()));
    let states = recorder.state_events.clone();
    backend.on_did_change_background_state(move |c| states.borrow_mut().push(c));
    recorder
}

/// Buffer + backend + recorder for Rust source
pub fn rust_backend(text: &str) -> (EditedBuffer, TokenBackend, Recorder) {
    let buffer = EditedBuffer::new(text);
    let mut backend = TokenBackend::new(LanguageId::Rust, Theme::default_dark(), &buffer);
    let recorder = record(&mut backend);
    (buffer, backend, recorder)
}

/// Assert every line's tokens form a strictly increasing partition that
/// ends exactly at the line length (including the newline, when present).
pub fn assert_line_partitions(backend: &TokenBackend, buffer: &EditedBuffer) {
    for line in 0..buffer.line_count() {
        let tokens = backend.get_line_tokens(buffer, line);
        let newline = if line + 1 < buffer.line_count() { 1 } else { 0 };
        let expected_len = buffer.line_content(line).len() + newline;
        if expected_len == 0 {
            assert!(tokens.is_empty(), "tokens on empty line {}", line);
            continue;
        }
        assert!(!tokens.is_empty(), "no tokens for line {}", line);
        let mut prev = 0;
        for &(end, _) in &tokens {
            assert!(end > prev, "non-increasing token end on line {}", line);
            prev = end;
        }
        assert_eq!(prev, expected_len, "coverage hole on line {}", line);
    }
}

/// Number of lines spanned by a byte range
pub fn lines_in_range(buffer: &EditedBuffer, start: usize, end: usize) -> usize {
    buffer.position_at(end).row - buffer.position_at(start).row + 1
}
