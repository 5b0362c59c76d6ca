//! Tandem core: documents, fingerprints, and the text patch codec.
//!
//! ```text
//!   live buffer ──diff──▶ DocumentPatch ──apply──▶ shadow / canonical
//!        ▲                                              │
//!        └────────── edit script (replay) ◀─────────────┘
//! ```
//!
//! Nothing here does I/O; the collab crate moves patches over the wire.

pub mod buffer;
pub mod codec;
pub mod document;

pub use buffer::{replay, shared, BufferEdit, BufferError, SharedBuffer, StringBuffer, TextBuffer};
pub use codec::{CodecConfig, CodecError, EditOp, EditScript, Hunk, PatchResult, TextPatchCodec};
pub use document::{fingerprint, Document, DocumentPatch};
