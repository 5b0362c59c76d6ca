//! Host editor buffer capability.
//!
//! The sync engine never owns editor state. It reads the live text and hands
//! back ordered range edits, leaving cursor placement and undo history to
//! whatever implements [`TextBuffer`].

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::codec::{Hunk, TextPatchCodec};

/// One range edit, offsets in chars relative to the text before the whole
/// batch is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEdit {
    Insert { at: usize, text: String },
    Delete { range: Range<usize> },
}

impl BufferEdit {
    pub fn start(&self) -> usize {
        match self {
            BufferEdit::Insert { at, .. } => *at,
            BufferEdit::Delete { range } => range.start,
        }
    }

    pub fn end(&self) -> usize {
        match self {
            BufferEdit::Insert { at, .. } => *at,
            BufferEdit::Delete { range } => range.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Edit reaches past the end of the text.
    OutOfBounds { offset: usize, len: usize },
    /// Edits out of order or overlapping.
    Overlapping { offset: usize },
    /// Buffer lock poisoned by a panicking writer.
    Poisoned,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::OutOfBounds { offset, len } => {
                write!(f, "Edit offset {offset} out of bounds for text of {len} chars")
            }
            BufferError::Overlapping { offset } => {
                write!(f, "Edit at {offset} overlaps or precedes the previous edit")
            }
            BufferError::Poisoned => write!(f, "Buffer lock poisoned"),
        }
    }
}

impl std::error::Error for BufferError {}

/// A live text surface the engine can read and edit.
pub trait TextBuffer {
    fn text(&self) -> String;

    /// Apply an ordered, non-overlapping batch of edits atomically.
    fn apply_edits(&mut self, edits: &[BufferEdit]) -> Result<(), BufferError>;
}

/// Buffer shared between the host and the sync engine.
pub type SharedBuffer = Arc<Mutex<dyn TextBuffer + Send>>;

pub fn shared<B: TextBuffer + Send + 'static>(buffer: B) -> SharedBuffer {
    Arc::new(Mutex::new(buffer))
}

/// Plain in-memory buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringBuffer {
    text: String,
    batches: usize,
}

impl StringBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            batches: 0,
        }
    }

    /// Number of non-empty edit batches applied so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Replace the whole text, as a user typing would.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }
}

impl TextBuffer for StringBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn apply_edits(&mut self, edits: &[BufferEdit]) -> Result<(), BufferError> {
        if edits.is_empty() {
            return Ok(());
        }
        self.text = apply_buffer_edits(&self.text, edits)?;
        self.batches += 1;
        Ok(())
    }
}

/// Apply a batch of edits to `text`, returning the result.
pub fn apply_buffer_edits(text: &str, edits: &[BufferEdit]) -> Result<String, BufferError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;

    for edit in edits {
        if edit.start() < pos || edit.end() < edit.start() {
            return Err(BufferError::Overlapping { offset: edit.start() });
        }
        if edit.end() > chars.len() {
            return Err(BufferError::OutOfBounds {
                offset: edit.end(),
                len: chars.len(),
            });
        }
        out.extend(&chars[pos..edit.start()]);
        match edit {
            BufferEdit::Insert { at, text } => {
                out.push_str(text);
                pos = *at;
            }
            BufferEdit::Delete { range } => pos = range.end,
        }
    }
    out.extend(&chars[pos..]);
    Ok(out)
}

/// Replay `hunks` onto the live buffer: patch its current text, then apply
/// only the minimal edits between the live text and that result, so
/// keystrokes made since the hunks were computed survive.
///
/// Returns whether every hunk applied.
pub fn replay(codec: &TextPatchCodec, buffer: &mut dyn TextBuffer, hunks: &[Hunk]) -> Result<bool, BufferError> {
    if hunks.is_empty() {
        return Ok(true);
    }

    let live = buffer.text();
    let result = match codec.apply(hunks, &live) {
        Ok(result) => result,
        Err(e) => {
            log::warn!("Not replaying patch: {e}");
            return Ok(false);
        }
    };

    let script = codec.edit_script(&live, &result.text);
    if !script.is_identity() {
        buffer.apply_edits(&script.to_buffer_edits())?;
    }
    Ok(result.is_clean())
}
