//! Text buffer abstraction consumed by the tokenization engine
//!
//! The engine never owns the document text; it queries it through the
//! [`TextBuffer`] trait and receives versioned [`BufferEdit`] events from
//! the host. [`EditedBuffer`] is a ropey-backed implementation used by the
//! tests and by hosts that do not bring their own buffer.

use ropey::Rope;
use tree_sitter::Point;

/// A single replacement applied to the buffer.
///
/// Offsets are byte offsets into the *pre-edit* buffer. `version` is the
/// buffer version after the edit was applied; every tree and token batch
/// computed from this edit is stamped with it for staleness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEdit {
    /// Byte offset where the replaced range starts
    pub range_offset: usize,
    /// Byte offset where the replaced range ended before the edit
    pub old_end_offset: usize,
    /// Replacement text
    pub text: String,
    /// Buffer version after this edit
    pub version: u64,
    /// (row, col) of `range_offset` (same before and after the edit)
    pub start_position: Point,
    /// (row, col) of `old_end_offset` in the pre-edit buffer
    pub old_end_position: Point,
    /// (row, col) of the end of the inserted text in the post-edit buffer
    pub new_end_position: Point,
}

impl BufferEdit {
    /// Number of bytes removed by this edit
    pub fn deleted_len(&self) -> usize {
        self.old_end_offset - self.range_offset
    }

    /// Number of bytes inserted by this edit
    pub fn inserted_len(&self) -> usize {
        self.text.len()
    }

    /// Byte offset where the replaced range ends after the edit
    pub fn new_end_offset(&self) -> usize {
        self.range_offset + self.text.len()
    }
}

/// Read-only query surface of the host text buffer.
///
/// Mirrors the operations the engine needs: line access, ranged reads,
/// offset/position conversion, and the current version for staleness
/// detection.
pub trait TextBuffer {
    /// Content of a line, without the trailing newline
    fn line_content(&self, line: usize) -> String;
    /// Text in the byte range `[start, end)`
    fn value_in_range(&self, start: usize, end: usize) -> String;
    /// Byte offset of a (row, column-in-bytes) position
    fn offset_at(&self, point: Point) -> usize;
    /// (row, column-in-bytes) position of a byte offset
    fn position_at(&self, offset: usize) -> Point;
    /// Total length in bytes
    fn len_bytes(&self) -> usize;
    /// Number of lines
    fn line_count(&self) -> usize;
    /// Current buffer version (monotonically increasing)
    fn version(&self) -> u64;
    /// Read a chunk starting at `offset`, for the parser's content callback.
    ///
    /// `offset` is a plain byte offset and may fall inside a multi-byte
    /// character; the parser resumes wherever it stopped. Returns an empty
    /// slice at or past the end. Implementations should return the largest
    /// contiguous chunk they can without allocating.
    fn chunk_at(&self, offset: usize) -> &[u8];
}

/// Ropey-backed buffer with version tracking.
#[derive(Debug, Clone)]
pub struct EditedBuffer {
    rope: Rope,
    version: u64,
}

impl EditedBuffer {
    /// Create a buffer with initial text at version 1
    pub fn new(text: &str) -> Self {
        Self {
            rope: Rope::from(text),
            version: 1,
        }
    }

    /// Replace `[range_offset, old_end_offset)` with `text`, bump the
    /// version, and return the edit event describing the change.
    ///
    /// Positions for the tree-edit projection are captured from the
    /// pre-edit buffer (old end) and the post-edit buffer (new end).
    pub fn apply_edit(&mut self, range_offset: usize, old_end_offset: usize, text: &str) -> BufferEdit {
        let start_position = self.position_at(range_offset);
        let old_end_position = self.position_at(old_end_offset);

        let start_char = self.rope.byte_to_char(range_offset);
        let end_char = self.rope.byte_to_char(old_end_offset);
        self.rope.remove(start_char..end_char);
        self.rope.insert(start_char, text);
        self.version += 1;

        let new_end_position = self.position_at(range_offset + text.len());
        BufferEdit {
            range_offset,
            old_end_offset,
            text: text.to_string(),
            version: self.version,
            start_position,
            old_end_position,
            new_end_position,
        }
    }

    /// Replace the entire contents (a "flush" edit)
    pub fn set_text(&mut self, text: &str) -> BufferEdit {
        let old_len = self.rope.len_bytes();
        let old_end_position = self.position_at(old_len);
        self.rope = Rope::from(text);
        self.version += 1;
        let new_end_position = self.position_at(text.len());
        BufferEdit {
            range_offset: 0,
            old_end_offset: old_len,
            text: text.to_string(),
            version: self.version,
            start_position: Point { row: 0, column: 0 },
            old_end_position,
            new_end_position,
        }
    }

    /// The full text (allocates; prefer `chunk_at` in hot paths)
    pub fn text(&self) -> String {
        self.rope.to_string()
    }
}

impl TextBuffer for EditedBuffer {
    fn line_content(&self, line: usize) -> String {
        if line >= self.rope.len_lines() {
            return String::new();
        }
        let slice = self.rope.line(line);
        let mut s = slice.to_string();
        while s.ends_with('\n') || s.ends_with('\r') {
            s.pop();
        }
        s
    }

    fn value_in_range(&self, start: usize, end: usize) -> String {
        let end = end.min(self.rope.len_bytes());
        let start = start.min(end);
        let start_char = self.rope.byte_to_char(start);
        let end_char = self.rope.byte_to_char(end);
        self.rope.slice(start_char..end_char).to_string()
    }

    fn offset_at(&self, point: Point) -> usize {
        if point.row >= self.rope.len_lines() {
            return self.rope.len_bytes();
        }
        let line_start = self.rope.line_to_byte(point.row);
        let line_end = if point.row + 1 < self.rope.len_lines() {
            self.rope.line_to_byte(point.row + 1)
        } else {
            self.rope.len_bytes()
        };
        (line_start + point.column).min(line_end)
    }

    fn position_at(&self, offset: usize) -> Point {
        let offset = offset.min(self.rope.len_bytes());
        let row = self.rope.byte_to_line(offset);
        let column = offset - self.rope.line_to_byte(row);
        Point { row, column }
    }

    fn len_bytes(&self) -> usize {
        self.rope.len_bytes()
    }

    fn line_count(&self) -> usize {
        self.rope.len_lines()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn chunk_at(&self, offset: usize) -> &[u8] {
        if offset >= self.rope.len_bytes() {
            return &[];
        }
        let (chunk, chunk_byte_start, _, _) = self.rope.chunk_at_byte(offset);
        &chunk.as_bytes()[offset - chunk_byte_start..]
    }
}
