//! Edit scripts: the net effect of a patch expressed as retain/insert/delete
//! runs, ready to hand to a host editor as individual range edits.

use crate::buffer::{apply_buffer_edits, BufferEdit, BufferError};

use super::diff::{self, Operation};

/// One run of an edit script. Lengths count chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// Minimal sequence of runs turning one text into another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    ops: Vec<EditOp>,
}

impl EditScript {
    /// Script turning `old` into `new`.
    pub fn between(old: &str, new: &str) -> Self {
        let ops = diff::diff(old, new)
            .into_iter()
            .map(|d| match d.op {
                Operation::Equal => EditOp::Retain(d.char_len()),
                Operation::Delete => EditOp::Delete(d.char_len()),
                Operation::Insert => EditOp::Insert(d.text),
            })
            .collect();
        Self { ops }
    }

    pub fn ops(&self) -> &[EditOp] {
        &self.ops
    }

    /// True when the script changes nothing.
    pub fn is_identity(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, EditOp::Retain(_)))
    }

    /// Range edits in the coordinates of the text the script starts from,
    /// ordered and non-overlapping.
    pub fn to_buffer_edits(&self) -> Vec<BufferEdit> {
        let mut edits = Vec::new();
        let mut pos = 0;
        for op in &self.ops {
            match op {
                EditOp::Retain(n) => pos += n,
                EditOp::Delete(n) => {
                    edits.push(BufferEdit::Delete { range: pos..pos + n });
                    pos += n;
                }
                EditOp::Insert(text) => edits.push(BufferEdit::Insert {
                    at: pos,
                    text: text.clone(),
                }),
            }
        }
        edits
    }

    /// Run the script over `text`.
    pub fn apply(&self, text: &str) -> Result<String, BufferError> {
        apply_buffer_edits(text, &self.to_buffer_edits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_script() {
        let script = EditScript::between("same text", "same text");
        assert!(script.is_identity());
        assert!(script.to_buffer_edits().is_empty());
        assert!(EditScript::between("", "").ops().is_empty());
    }

    #[test]
    fn test_insert_in_middle() {
        let script = EditScript::between("abc", "abxc");
        assert_eq!(
            script.ops(),
            &[EditOp::Retain(2), EditOp::Insert("x".into()), EditOp::Retain(1)]
        );
        assert_eq!(
            script.to_buffer_edits(),
            vec![BufferEdit::Insert { at: 2, text: "x".into() }]
        );
    }

    #[test]
    fn test_replacement_offsets_use_original_coordinates() {
        let script = EditScript::between("hello world", "hello there world!");
        let edits = script.to_buffer_edits();
        for pair in edits.windows(2) {
            assert!(pair[0].end() <= pair[1].start());
        }
        assert_eq!(script.apply("hello world").as_deref(), Ok("hello there world!"));
    }

    #[test]
    fn test_replay_fidelity() {
        let cases = [
            ("", "fresh"),
            ("gone", ""),
            ("The quick brown fox", "The slow brown ox!"),
            ("line one\nline two\n", "line one\nline 2\nline three\n"),
            ("naïve café", "naive cafe ☕"),
        ];
        for (live, target) in cases {
            let script = EditScript::between(live, target);
            assert_eq!(script.apply(live).as_deref(), Ok(target), "{live:?} -> {target:?}");
        }
    }

    #[test]
    fn test_apply_to_wrong_text_fails() {
        let script = EditScript::between("abcdef", "abc");
        assert!(script.apply("ab").is_err());
    }
}
