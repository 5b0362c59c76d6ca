//! Text patch codec.
//!
//! Computes context-anchored hunks between two texts and applies them with
//! fuzzy location matching, so a patch made against one version of a text
//! still lands on a copy that has drifted a little since. Also derives the
//! minimal edit script used to replay a patch onto a live editor buffer.

mod diff;
mod edit;
mod hunk;
mod matcher;

use std::fmt;

pub use diff::{Diff, Operation};
pub use edit::{EditOp, EditScript};
pub use hunk::{Hunk, MAX_HUNK_OFFSET};

/// Widest pattern the fuzzy matcher handles in one pass, in chars.
pub const MATCH_MAX_BITS: usize = 32;

/// Widest context margin a codec accepts. Splitting a long hunk needs room
/// for context on both sides of each matcher-sized piece.
pub const MAX_MARGIN: usize = MATCH_MAX_BITS / 2 - 1;

/// Matching and hunk-building parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecConfig {
    /// Score above which a placement is rejected. 0.0 demands an exact
    /// match, 1.0 accepts almost anything.
    pub match_threshold: f64,
    /// How far (in chars) from the expected location a match may sit before
    /// it counts as a full mismatch.
    pub match_distance: usize,
    /// For hunks wider than the matcher, the largest fraction of the
    /// expected text that may differ before the hunk is dropped.
    pub delete_threshold: f64,
    /// Context kept around each edit, in chars.
    pub margin: usize,
}

impl CodecConfig {
    pub const DEFAULT: Self = Self {
        match_threshold: 0.5,
        match_distance: 1000,
        delete_threshold: 0.5,
        margin: 4,
    };
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Outcome of applying a hunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    pub text: String,
    /// One entry per input hunk, `true` where it applied.
    pub applied: Vec<bool>,
}

impl PatchResult {
    /// Every hunk applied.
    pub fn is_clean(&self) -> bool {
        self.applied.iter().all(|ok| *ok)
    }
}

/// Structurally invalid input. Partial application is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    MalformedHunk { index: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MalformedHunk { index } => {
                write!(f, "Hunk {index} is malformed (bad lengths or position)")
            }
        }
    }
}

impl std::error::Error for CodecError {}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TextPatchCodec {
    config: CodecConfig,
}

impl TextPatchCodec {
    /// A `margin` wider than [`MAX_MARGIN`] is clamped to it.
    pub const fn new(mut config: CodecConfig) -> Self {
        if config.margin > MAX_MARGIN {
            config.margin = MAX_MARGIN;
        }
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Hunks turning `old` into `new`. Empty when the texts are equal.
    pub fn diff(&self, old: &str, new: &str) -> Vec<Hunk> {
        let mut diffs = diff::diff(old, new);
        if diffs.len() > 2 {
            diff::cleanup_semantic(&mut diffs);
        }
        let old: Vec<char> = old.chars().collect();
        hunk::make(self.config.margin, &old, &diffs)
    }

    /// Apply `hunks` to `text` in order. Hunks that find no acceptable
    /// placement are skipped and reported as `false`; the rest still apply.
    pub fn apply(&self, hunks: &[Hunk], text: &str) -> Result<PatchResult, CodecError> {
        if let Some(index) = hunks.iter().position(|h| !h.is_well_formed()) {
            return Err(CodecError::MalformedHunk { index });
        }

        let (text, applied) = hunk::apply(&self.config, hunks, text);
        Ok(PatchResult { text, applied })
    }

    /// Minimal script turning `old` into `new`.
    pub fn edit_script(&self, old: &str, new: &str) -> EditScript {
        EditScript::between(old, new)
    }
}
