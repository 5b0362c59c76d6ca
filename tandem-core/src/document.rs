//! Documents, fingerprints, and the patch value exchanged between peers.

use std::cell::OnceCell;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecConfig, Hunk, TextPatchCodec};

const CODEC: TextPatchCodec = TextPatchCodec::new(CodecConfig::DEFAULT);

/// Cheap content checksum: xxh32 (seed 0) of the UTF-8 bytes, lowercase
/// hex without padding. Used only to detect divergence.
pub fn fingerprint(text: &str) -> String {
    format!("{:x}", xxhash_rust::xxh32::xxh32(text.as_bytes(), 0))
}

/// A text with an id and a lazily computed fingerprint.
///
/// The cached fingerprint always describes the current text: every mutation
/// goes through [`Document::set_text`], which drops the cache.
#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    text: String,
    fingerprint: OnceCell<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            fingerprint: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.fingerprint = OnceCell::new();
    }

    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| fingerprint(&self.text))
    }

    /// Patch turning this document's text into `target`, tagged with the
    /// current fingerprint.
    pub fn create_patch(&self, target: &str) -> DocumentPatch {
        DocumentPatch::new(self.id.clone(), self.fingerprint(), CODEC.diff(&self.text, target))
    }

    /// Apply `patch` only if it was computed against exactly this text.
    /// On a fingerprint mismatch nothing changes and `false` is returned.
    pub fn apply_patch(&mut self, patch: &DocumentPatch) -> bool {
        if patch.base_fingerprint != self.fingerprint() {
            log::warn!(
                "Fingerprint mismatch on {}: patch base {} but document is {}",
                self.id,
                patch.base_fingerprint,
                self.fingerprint()
            );
            return false;
        }
        self.apply_patch_unverified(patch)
    }

    /// Apply `patch` wherever its hunks match. The text takes the
    /// best-effort result even when some hunks fail; the return value
    /// reports whether all of them applied.
    pub fn apply_patch_unverified(&mut self, patch: &DocumentPatch) -> bool {
        if patch.hunks.is_empty() {
            return true;
        }
        match CODEC.apply(&patch.hunks, &self.text) {
            Ok(result) => {
                if !result.is_clean() {
                    log::debug!(
                        "Patch on {} applied partially: {:?}",
                        self.id,
                        result.applied
                    );
                }
                let clean = result.is_clean();
                if result.text != self.text {
                    self.set_text(result.text);
                }
                clean
            }
            Err(e) => {
                log::warn!("Rejected patch on {}: {e}", self.id);
                false
            }
        }
    }
}

/// Patch value: target document, the fingerprint of the text it was
/// computed against, and its hunks in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub id: String,
    #[serde(rename = "hash")]
    pub base_fingerprint: String,
    #[serde(rename = "patches")]
    pub hunks: Vec<Hunk>,
}

impl DocumentPatch {
    pub fn new(id: impl Into<String>, base_fingerprint: impl Into<String>, hunks: Vec<Hunk>) -> Self {
        Self {
            id: id.into(),
            base_fingerprint: base_fingerprint.into(),
            hunks,
        }
    }

    /// No hunks: a pull probe or a convergence confirmation.
    pub fn empty(id: impl Into<String>, base_fingerprint: impl Into<String>) -> Self {
        Self::new(id, base_fingerprint, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }
}
