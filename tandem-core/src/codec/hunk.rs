//! Context-anchored hunks: building them from a diff and applying them to
//! text that may have drifted since the hunks were made.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::diff::{self, collect, find, rfind, Diff, Operation};
use super::matcher::match_main;
use super::{CodecConfig, MATCH_MAX_BITS};

/// Largest position a hunk may claim. Offsets past this can only come from
/// a corrupt or hostile peer.
pub const MAX_HUNK_OFFSET: usize = u32::MAX as usize;

/// One context-anchored edit.
///
/// `diffs` carries the edit together with up to `margin` chars of
/// surrounding context. `start1`/`start2` are position hints in the source
/// and target texts; `length1`/`length2` are the char lengths the hunk
/// spans in each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

impl Hunk {
    /// Text this hunk expects to find.
    pub fn source_text(&self) -> String {
        diff::source_text(&self.diffs)
    }

    /// Text this hunk leaves behind.
    pub fn target_text(&self) -> String {
        diff::target_text(&self.diffs)
    }

    /// Lengths agree with the diff segments and positions are in range.
    pub fn is_well_formed(&self) -> bool {
        self.start1 <= MAX_HUNK_OFFSET
            && self.start2 <= MAX_HUNK_OFFSET
            && self.source_text().chars().count() == self.length1
            && self.target_text().chars().count() == self.length2
    }
}

impl fmt::Display for Hunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "@@ -{},{} +{},{} @@",
            self.start1.saturating_add(1),
            self.length1,
            self.start2.saturating_add(1),
            self.length2
        )?;
        for diff in &self.diffs {
            let sign = match diff.op {
                Operation::Insert => '+',
                Operation::Delete => '-',
                Operation::Equal => ' ',
            };
            writeln!(f, "{sign}{}", diff.text.escape_debug())?;
        }
        Ok(())
    }
}

/// Build hunks turning `text1` into the target described by `diffs`.
pub(crate) fn make(margin: usize, text1: &[char], diffs: &[Diff]) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    if diffs.is_empty() {
        return hunks;
    }

    let mut hunk = Hunk::default();
    let (mut count1, mut count2) = (0usize, 0usize);
    // Context is taken from the text as it stands once earlier hunks have
    // been applied, which is what the receiver will be matching against.
    let mut prepatch: Vec<char> = text1.to_vec();
    let mut postpatch: Vec<char> = text1.to_vec();

    for (x, diff) in diffs.iter().enumerate() {
        let chars: Vec<char> = diff.text.chars().collect();
        let len = chars.len();

        if hunk.diffs.is_empty() && diff.op != Operation::Equal {
            hunk.start1 = count1;
            hunk.start2 = count2;
        }

        match diff.op {
            Operation::Insert => {
                hunk.diffs.push(diff.clone());
                hunk.length2 += len;
                postpatch.splice(count2..count2, chars);
            }
            Operation::Delete => {
                hunk.length1 += len;
                hunk.diffs.push(diff.clone());
                postpatch.drain(count2..count2 + len);
            }
            Operation::Equal => {
                if len <= 2 * margin && !hunk.diffs.is_empty() && x + 1 != diffs.len() {
                    // Small equality inside a hunk.
                    hunk.diffs.push(diff.clone());
                    hunk.length1 += len;
                    hunk.length2 += len;
                } else if len >= 2 * margin && !hunk.diffs.is_empty() {
                    add_context(margin, &mut hunk, &prepatch);
                    hunks.push(std::mem::take(&mut hunk));
                    prepatch = postpatch.clone();
                    count1 = count2;
                }
            }
        }

        if diff.op != Operation::Insert {
            count1 += len;
        }
        if diff.op != Operation::Delete {
            count2 += len;
        }
    }

    if !hunk.diffs.is_empty() {
        add_context(margin, &mut hunk, &prepatch);
        hunks.push(hunk);
    }
    hunks
}

/// Grow the hunk's context until its source text is unique in `text`
/// (bounded by the matcher width), then wrap it in `margin` more chars.
fn add_context(margin: usize, hunk: &mut Hunk, text: &[char]) {
    if text.is_empty() {
        return;
    }

    let start = hunk.start2.min(text.len());
    let end = |padding: usize| (hunk.start2 + hunk.length1 + padding).min(text.len());

    let mut pattern = &text[start..end(0).max(start)];
    let mut padding = 0;
    while find(text, pattern, 0) != rfind(text, pattern, text.len())
        && pattern.len() < MATCH_MAX_BITS.saturating_sub(2 * margin)
    {
        padding += margin;
        pattern = &text[hunk.start2.saturating_sub(padding).min(text.len())..end(padding)];
    }
    padding += margin;

    let prefix_start = hunk.start2.saturating_sub(padding).min(start);
    let prefix = &text[prefix_start..start];
    let suffix_start = end(0).max(start);
    let suffix = &text[suffix_start..end(padding).max(suffix_start)];

    if !prefix.is_empty() {
        hunk.diffs.insert(0, Diff::equal(collect(prefix)));
    }
    if !suffix.is_empty() {
        hunk.diffs.push(Diff::equal(collect(suffix)));
    }

    hunk.start1 = hunk.start1.saturating_sub(prefix.len());
    hunk.start2 = hunk.start2.saturating_sub(prefix.len());
    hunk.length1 += prefix.len() + suffix.len();
    hunk.length2 += prefix.len() + suffix.len();
}

/// Sentinel padding wrapped around the text during application, so edits
/// at either end of the document still have context to anchor on.
fn padding(margin: usize) -> Vec<char> {
    (1..=margin as u32).filter_map(char::from_u32).collect()
}

/// Shift every hunk past the padding and extend the edge hunks into it.
fn add_padding(hunks: &mut [Hunk], margin: usize) -> Vec<char> {
    let null_padding = padding(margin);
    let pad = null_padding.len();

    for hunk in hunks.iter_mut() {
        hunk.start1 = hunk.start1.saturating_add(pad);
        hunk.start2 = hunk.start2.saturating_add(pad);
    }

    if let Some(first) = hunks.first_mut() {
        match first.diffs.first_mut() {
            Some(diff) if diff.op == Operation::Equal => {
                let len = diff.char_len();
                if pad > len {
                    let extra = pad - len;
                    diff.text = collect(&null_padding[len..]) + &diff.text;
                    first.start1 -= extra;
                    first.start2 -= extra;
                    first.length1 += extra;
                    first.length2 += extra;
                }
            }
            _ => {
                first.diffs.insert(0, Diff::equal(collect(&null_padding)));
                first.start1 -= pad;
                first.start2 -= pad;
                first.length1 += pad;
                first.length2 += pad;
            }
        }
    }

    if let Some(last) = hunks.last_mut() {
        match last.diffs.last_mut() {
            Some(diff) if diff.op == Operation::Equal => {
                let len = diff.char_len();
                if pad > len {
                    let extra = pad - len;
                    diff.text.push_str(&collect(&null_padding[..extra]));
                    last.length1 += extra;
                    last.length2 += extra;
                }
            }
            _ => {
                last.diffs.push(Diff::equal(collect(&null_padding)));
                last.length1 += pad;
                last.length2 += pad;
            }
        }
    }

    null_padding
}

/// Break hunks whose source span exceeds the matcher width into a chain of
/// smaller hunks, each carrying `margin` chars of context from its
/// neighbour.
fn split_max(hunks: &mut Vec<Hunk>, margin: usize) {
    let hunk_size = MATCH_MAX_BITS;
    let mut x = 0;
    while x < hunks.len() {
        if hunks[x].length1 <= hunk_size {
            x += 1;
            continue;
        }

        let mut big = hunks.remove(x);
        let mut start1 = big.start1;
        let mut start2 = big.start2;
        let mut precontext: Vec<char> = Vec::new();

        while !big.diffs.is_empty() {
            let mut hunk = Hunk {
                start1: start1.saturating_sub(precontext.len()),
                start2: start2.saturating_sub(precontext.len()),
                ..Hunk::default()
            };
            let mut empty = true;
            if !precontext.is_empty() {
                hunk.length1 = precontext.len();
                hunk.length2 = precontext.len();
                hunk.diffs.push(Diff::equal(collect(&precontext)));
            }

            while !big.diffs.is_empty() && hunk.length1 < hunk_size - margin {
                let op = big.diffs[0].op;
                let text: Vec<char> = big.diffs[0].text.chars().collect();

                if op == Operation::Insert {
                    hunk.length2 += text.len();
                    start2 += text.len();
                    hunk.diffs.push(big.diffs.remove(0));
                    empty = false;
                } else if op == Operation::Delete
                    && hunk.diffs.len() == 1
                    && hunk.diffs[0].op == Operation::Equal
                    && text.len() > 2 * hunk_size
                {
                    // A huge deletion goes out whole; apply matches its ends.
                    hunk.length1 += text.len();
                    start1 += text.len();
                    empty = false;
                    hunk.diffs.push(big.diffs.remove(0));
                } else {
                    let take = text.len().min(hunk_size - hunk.length1 - margin);
                    let piece = &text[..take];
                    hunk.length1 += take;
                    start1 += take;
                    if op == Operation::Equal {
                        hunk.length2 += take;
                        start2 += take;
                    } else {
                        empty = false;
                    }
                    hunk.diffs.push(Diff::new(op, collect(piece)));
                    if take == text.len() {
                        big.diffs.remove(0);
                    } else {
                        big.diffs[0].text = collect(&text[take..]);
                    }
                }
            }

            let target: Vec<char> = hunk.target_text().chars().collect();
            precontext = target[target.len().saturating_sub(margin)..].to_vec();

            let source: Vec<char> = diff::source_text(&big.diffs).chars().collect();
            let postcontext = &source[..source.len().min(margin)];
            if !postcontext.is_empty() {
                hunk.length1 += postcontext.len();
                hunk.length2 += postcontext.len();
                match hunk.diffs.last_mut() {
                    Some(last) if last.op == Operation::Equal => last.text.push_str(&collect(postcontext)),
                    _ => hunk.diffs.push(Diff::equal(collect(postcontext))),
                }
            }

            if !empty {
                hunks.insert(x, hunk);
                x += 1;
            }
        }
    }
}

/// Apply hunks in order. Returns the new text and whether each hunk
/// applied. A hunk split for the matcher counts as applied only when every
/// piece did.
pub(crate) fn apply(config: &CodecConfig, hunks: &[Hunk], text: &str) -> (String, Vec<bool>) {
    if hunks.is_empty() {
        return (text.to_string(), Vec::new());
    }

    let mut hunks = hunks.to_vec();
    let null_padding = add_padding(&mut hunks, config.margin);
    let pad = null_padding.len();

    let mut text: Vec<char> = null_padding
        .iter()
        .copied()
        .chain(text.chars())
        .chain(null_padding.iter().copied())
        .collect();

    // Drift between where hunks expect to land and where they did.
    let mut delta: isize = 0;
    let mut results = vec![true; hunks.len()];

    for (x, hunk) in hunks.into_iter().enumerate() {
        let mut pieces = vec![hunk];
        split_max(&mut pieces, config.margin);
        for piece in &pieces {
            if !apply_one(config, &mut text, piece, &mut delta) {
                log::trace!("hunk {x} did not apply");
                results[x] = false;
            }
        }
    }

    let from = pad.min(text.len());
    let to = text.len().saturating_sub(pad).max(from);
    (collect(&text[from..to]), results)
}

fn apply_one(config: &CodecConfig, text: &mut Vec<char>, hunk: &Hunk, delta: &mut isize) -> bool {
    let expected = (hunk.start2 as isize + *delta).max(0) as usize;
    let text1: Vec<char> = hunk.source_text().chars().collect();

    let mut end_loc = None;
    let start_loc = if text1.len() > MATCH_MAX_BITS {
        // Too long for bitap: anchor both ends separately.
        match_main(config, text, &text1[..MATCH_MAX_BITS], expected).and_then(|start| {
            end_loc = match_main(
                config,
                text,
                &text1[text1.len() - MATCH_MAX_BITS..],
                expected + text1.len() - MATCH_MAX_BITS,
            );
            match end_loc {
                Some(end) if start < end => Some(start),
                _ => None,
            }
        })
    } else {
        match_main(config, text, &text1, expected)
    };

    let Some(start) = start_loc else {
        *delta -= hunk.length2 as isize - hunk.length1 as isize;
        return false;
    };
    *delta = start as isize - expected as isize;

    let end = match end_loc {
        Some(end) => (end + MATCH_MAX_BITS).min(text.len()),
        None => (start + text1.len()).min(text.len()),
    };
    let text2: Vec<char> = text[start..end].to_vec();

    if text1 == text2 {
        text.splice(start..start + text1.len(), hunk.target_text().chars());
        return true;
    }

    // Imperfect match: map the hunk's edits through a diff of what it
    // expected against what is actually there.
    let diffs = diff::diff_chars(&text1, &text2);
    if text1.len() > MATCH_MAX_BITS
        && diff::levenshtein(&diffs) as f64 / text1.len() as f64 > config.delete_threshold
    {
        return false;
    }

    let mut index1 = 0;
    for edit in &hunk.diffs {
        let len = edit.char_len();
        match edit.op {
            Operation::Insert => {
                let at = (start + diff::x_index(&diffs, index1)).min(text.len());
                text.splice(at..at, edit.text.chars());
            }
            Operation::Delete => {
                let from = (start + diff::x_index(&diffs, index1)).min(text.len());
                let to = (start + diff::x_index(&diffs, index1 + len)).clamp(from, text.len());
                text.drain(from..to);
            }
            Operation::Equal => {}
        }
        if edit.op != Operation::Delete {
            index1 += len;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn make_str(old: &str, new: &str) -> Vec<Hunk> {
        let mut diffs = diff::diff(old, new);
        if diffs.len() > 2 {
            diff::cleanup_semantic(&mut diffs);
        }
        make(4, &chars(old), &diffs)
    }

    #[test]
    fn test_make_empty() {
        assert!(make_str("", "").is_empty());
        assert!(make_str("same", "same").is_empty());
    }

    #[test]
    fn test_make_adds_context() {
        let hunks = make_str("The quick brown fox jumps.", "The quick red fox jumps.");
        assert_eq!(hunks.len(), 1);
        let hunk = &hunks[0];
        assert!(hunk.is_well_formed());
        assert_eq!(hunk.diffs.first().map(|d| d.op), Some(Operation::Equal));
        assert_eq!(hunk.diffs.last().map(|d| d.op), Some(Operation::Equal));
        assert!(hunk.source_text().contains("brown"));
        assert!(hunk.target_text().contains("red"));
    }

    #[test]
    fn test_make_separates_distant_edits() {
        let old = "alpha beta gamma delta epsilon zeta eta theta";
        let new = "ALPHA beta gamma delta epsilon zeta eta THETA";
        let hunks = make_str(old, new);
        assert_eq!(hunks.len(), 2);
        assert!(hunks.iter().all(Hunk::is_well_formed));
    }

    #[test]
    fn test_apply_exact() {
        let old = "The quick brown fox jumps over the lazy dog.";
        let new = "That quick brown fox jumped over a lazy dog.";
        let hunks = make_str(old, new);
        let (text, results) = apply(&CodecConfig::default(), &hunks, old);
        assert_eq!(text, new);
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_apply_with_drift() {
        let old = "The quick brown fox jumps over the lazy dog.";
        let new = "That quick brown fox jumped over a lazy dog.";
        let hunks = make_str(old, new);
        let drifted = "The quick red rabbit jumps over the tired tiger.";
        let (text, results) = apply(&CodecConfig::default(), &hunks, drifted);
        assert_eq!(text, "That quick red rabbit jumped over a tired tiger.");
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_apply_failed_hunk_leaves_text() {
        let old = "The quick brown fox jumps over the lazy dog.";
        let new = "That quick brown fox jumped over a lazy dog.";
        let hunks = make_str(old, new);
        let unrelated = "I am the very model of a modern major general.";
        let (text, results) = apply(&CodecConfig::default(), &hunks, unrelated);
        assert_eq!(text, unrelated);
        assert!(results.iter().all(|ok| !*ok));
    }

    #[test]
    fn test_apply_at_document_edges() {
        let hunks = make_str("", "test");
        let (text, results) = apply(&CodecConfig::default(), &hunks, "");
        assert_eq!(text, "test");
        assert_eq!(results, vec![true]);

        let hunks = make_str("XY", "XtestY");
        let (text, _) = apply(&CodecConfig::default(), &hunks, "XY");
        assert_eq!(text, "XtestY");

        let hunks = make_str("y", "y123");
        let (text, _) = apply(&CodecConfig::default(), &hunks, "x");
        assert_eq!(text, "x123");
    }

    #[test]
    fn test_apply_long_hunks_are_split() {
        let old = "abcdefghijklmnopqrstuvwxyz01234567890";
        let new = "XabXcdXefXghXijXklXmnXopXqrXstXuvXwxXyzX01X23X45X67X89X0";
        let hunks = make_str(old, new);
        let (text, results) = apply(&CodecConfig::default(), &hunks, old);
        assert_eq!(text, new);
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_apply_big_delete() {
        let old = "x1234567890123456789012345678901234567890123456789012345678901234567890y";
        let hunks = make_str(old, "xabcy");
        let (text, results) = apply(&CodecConfig::default(), &hunks, old);
        assert_eq!(text, "xabcy");
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_apply_unicode() {
        let old = "héllo wörld, ünïcode";
        let new = "héllo wörld 🦀, ünïcode!";
        let hunks = make_str(old, new);
        let (text, _) = apply(&CodecConfig::default(), &hunks, old);
        assert_eq!(text, new);
    }

    #[test]
    fn test_apply_does_not_mutate_input_hunks() {
        let hunks = make_str("abc", "abxc");
        let before = hunks.clone();
        let _ = apply(&CodecConfig::default(), &hunks, "abc");
        assert_eq!(hunks, before);
    }

    #[test]
    fn test_out_of_range_start_is_malformed() {
        let mut hunks = make_str("abc", "abxc");
        assert!(hunks[0].is_well_formed());
        hunks[0].start1 = usize::MAX;
        hunks[0].start2 = usize::MAX;
        assert!(!hunks[0].is_well_formed());
        assert!(hunks[0].to_string().starts_with("@@ -"));
    }

    #[test]
    fn test_display_header() {
        let hunks = make_str("abc", "abxc");
        let rendered = hunks[0].to_string();
        assert!(rendered.starts_with("@@ -1,3 +1,4 @@"));
        assert!(rendered.contains("+x"));
    }
}
