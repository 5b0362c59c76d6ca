//! Character-level diff.
//!
//! Myers' O(ND) middle-snake bisection over `char` slices, with common
//! prefix/suffix trimming before the search and merge/semantic cleanup
//! passes afterwards. Every length in this module counts Unicode scalar
//! values, never bytes.
//!
//! Reference: Myers, "An O(ND) Difference Algorithm and Its Variations" (1986)

use serde::{Deserialize, Serialize};

/// Kind of a diff segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Delete,
    Insert,
    Equal,
}

/// One segment of a diff: an operation and the text it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub op: Operation,
    pub text: String,
}

impl Diff {
    pub fn new(op: Operation, text: impl Into<String>) -> Self {
        Self { op, text: text.into() }
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(Operation::Equal, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(Operation::Insert, text)
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(Operation::Delete, text)
    }

    /// Length of the segment in chars.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Diff two strings.
pub fn diff(old: &str, new: &str) -> Vec<Diff> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    diff_chars(&a, &b)
}

pub(crate) fn diff_chars(a: &[char], b: &[char]) -> Vec<Diff> {
    if a == b {
        return if a.is_empty() {
            Vec::new()
        } else {
            vec![Diff::equal(collect(a))]
        };
    }

    let prefix = common_prefix(a, b);
    let (a_rest, b_rest) = (&a[prefix..], &b[prefix..]);
    let suffix = common_suffix(a_rest, b_rest);
    let a_mid = &a_rest[..a_rest.len() - suffix];
    let b_mid = &b_rest[..b_rest.len() - suffix];

    let mut diffs = compute(a_mid, b_mid);
    if prefix > 0 {
        diffs.insert(0, Diff::equal(collect(&a[..prefix])));
    }
    if suffix > 0 {
        diffs.push(Diff::equal(collect(&a_rest[a_rest.len() - suffix..])));
    }
    cleanup_merge(&mut diffs);
    diffs
}

/// Diff two texts that share no common prefix or suffix.
fn compute(a: &[char], b: &[char]) -> Vec<Diff> {
    if a.is_empty() {
        return vec![Diff::insert(collect(b))];
    }
    if b.is_empty() {
        return vec![Diff::delete(collect(a))];
    }

    let (long, short, op) = if a.len() > b.len() {
        (a, b, Operation::Delete)
    } else {
        (b, a, Operation::Insert)
    };

    // Shorter text wholly inside the longer one: two edits around an equality.
    if let Some(i) = find(long, short, 0) {
        let mut diffs = Vec::with_capacity(3);
        if i > 0 {
            diffs.push(Diff::new(op, collect(&long[..i])));
        }
        diffs.push(Diff::equal(collect(short)));
        if i + short.len() < long.len() {
            diffs.push(Diff::new(op, collect(&long[i + short.len()..])));
        }
        return diffs;
    }

    if short.len() == 1 {
        return vec![Diff::delete(collect(a)), Diff::insert(collect(b))];
    }

    bisect(a, b)
}

/// Find the middle snake and recurse on both halves.
fn bisect(a: &[char], b: &[char]) -> Vec<Diff> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let v_offset = max_d;
    let v_length = (2 * max_d) as usize;

    let mut v1 = vec![-1isize; v_length];
    let mut v2 = vec![-1isize; v_length];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;

    let delta = n - m;
    // Odd delta: the forward path collides with the reverse path.
    let front = delta % 2 != 0;
    let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0isize, 0isize, 0isize, 0isize);

    for d in 0..max_d {
        let mut k1 = -d + k1_start;
        while k1 <= d - k1_end {
            let k1_offset = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 < m && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;
            if x1 > n {
                k1_end += 2;
            } else if y1 > m {
                k1_start += 2;
            } else if front {
                let k2_offset = v_offset + delta - k1;
                if k2_offset >= 0 && (k2_offset as usize) < v_length && v2[k2_offset as usize] != -1 {
                    let x2 = n - v2[k2_offset as usize];
                    if x1 >= x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2_start;
        while k2 <= d - k2_end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n && y2 < m && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize] {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > n {
                k2_end += 2;
            } else if y2 > m {
                k2_start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if k1_offset >= 0 && (k1_offset as usize) < v_length && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = v_offset + x1 - k1_offset;
                    if x1 >= n - x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize);
                    }
                }
            }
            k2 += 2;
        }
    }

    // No commonality at all.
    vec![Diff::delete(collect(a)), Diff::insert(collect(b))]
}

fn bisect_split(a: &[char], b: &[char], x: usize, y: usize) -> Vec<Diff> {
    let mut diffs = diff_chars(&a[..x], &b[..y]);
    diffs.extend(diff_chars(&a[x..], &b[y..]));
    diffs
}

/// Merge adjacent segments of the same kind and factor common affixes out
/// of delete/insert pairs into the surrounding equalities.
pub(crate) fn cleanup_merge(diffs: &mut Vec<Diff>) {
    let mut merged: Vec<Diff> = Vec::with_capacity(diffs.len());
    let mut deleted = String::new();
    let mut inserted = String::new();

    for diff in diffs.drain(..) {
        match diff.op {
            Operation::Delete => deleted.push_str(&diff.text),
            Operation::Insert => inserted.push_str(&diff.text),
            Operation::Equal => flush_pending(&mut merged, &mut deleted, &mut inserted, diff.text),
        }
    }
    flush_pending(&mut merged, &mut deleted, &mut inserted, String::new());

    *diffs = merged;
}

fn flush_pending(out: &mut Vec<Diff>, deleted: &mut String, inserted: &mut String, next_equal: String) {
    let mut trailing = String::new();

    if !deleted.is_empty() && !inserted.is_empty() {
        let del: Vec<char> = deleted.chars().collect();
        let ins: Vec<char> = inserted.chars().collect();

        let prefix = common_prefix(&del, &ins);
        if prefix > 0 {
            push_equal(out, collect(&ins[..prefix]));
        }
        let (del, ins) = (&del[prefix..], &ins[prefix..]);
        let suffix = common_suffix(del, ins);
        trailing = collect(&ins[ins.len() - suffix..]);

        *deleted = collect(&del[..del.len() - suffix]);
        *inserted = collect(&ins[..ins.len() - suffix]);
    }

    if !deleted.is_empty() {
        out.push(Diff::delete(std::mem::take(deleted)));
    }
    if !inserted.is_empty() {
        out.push(Diff::insert(std::mem::take(inserted)));
    }

    trailing.push_str(&next_equal);
    if !trailing.is_empty() {
        push_equal(out, trailing);
    }
}

fn push_equal(out: &mut Vec<Diff>, text: String) {
    if let Some(last) = out.last_mut() {
        if last.op == Operation::Equal {
            last.text.push_str(&text);
            return;
        }
    }
    out.push(Diff::equal(text));
}

/// Turn short equalities that are dwarfed by the edits on both sides into
/// a delete/insert pair, so hunks describe meaningful chunks instead of
/// coincidental single-char matches.
pub(crate) fn cleanup_semantic(diffs: &mut Vec<Diff>) {
    let mut changed = false;
    // Indices of equalities seen so far.
    let mut equalities: Vec<usize> = Vec::new();
    let mut last_equality: Option<String> = None;
    let mut pointer: isize = 0;
    // Edit volume before (1) and after (2) the last equality.
    let (mut ins1, mut del1, mut ins2, mut del2) = (0usize, 0usize, 0usize, 0usize);

    while (pointer as usize) < diffs.len() {
        let p = pointer as usize;
        if diffs[p].op == Operation::Equal {
            equalities.push(p);
            ins1 = ins2;
            del1 = del2;
            ins2 = 0;
            del2 = 0;
            last_equality = Some(diffs[p].text.clone());
        } else {
            if diffs[p].op == Operation::Insert {
                ins2 += diffs[p].char_len();
            } else {
                del2 += diffs[p].char_len();
            }

            let eliminate = last_equality.as_ref().is_some_and(|eq| {
                let len = eq.chars().count();
                len <= ins1.max(del1) && len <= ins2.max(del2)
            });
            if let (true, Some(eq), Some(&idx)) = (eliminate, last_equality.take(), equalities.last()) {
                diffs.insert(idx, Diff::delete(eq));
                diffs[idx + 1].op = Operation::Insert;
                equalities.pop();
                // The equality before this one needs re-evaluation too.
                equalities.pop();
                pointer = equalities.last().map_or(-1, |&i| i as isize);
                ins1 = 0;
                del1 = 0;
                ins2 = 0;
                del2 = 0;
                changed = true;
            }
        }
        pointer += 1;
    }

    if changed {
        cleanup_merge(diffs);
    }
}

/// Levenshtein distance implied by a diff, in chars.
pub(crate) fn levenshtein(diffs: &[Diff]) -> usize {
    let (mut distance, mut inserted, mut deleted) = (0, 0, 0);
    for diff in diffs {
        match diff.op {
            Operation::Insert => inserted += diff.char_len(),
            Operation::Delete => deleted += diff.char_len(),
            Operation::Equal => {
                distance += inserted.max(deleted);
                inserted = 0;
                deleted = 0;
            }
        }
    }
    distance + inserted.max(deleted)
}

/// Translate a char offset in the diff's source text to the equivalent
/// offset in its target text.
pub(crate) fn x_index(diffs: &[Diff], loc: usize) -> usize {
    let (mut chars1, mut chars2) = (0, 0);
    let (mut last1, mut last2) = (0, 0);
    for diff in diffs {
        let len = diff.char_len();
        if diff.op != Operation::Insert {
            chars1 += len;
        }
        if diff.op != Operation::Delete {
            chars2 += len;
        }
        if chars1 > loc {
            if diff.op == Operation::Delete {
                // Offset falls inside a deletion.
                return last2;
            }
            break;
        }
        last1 = chars1;
        last2 = chars2;
    }
    last2 + (loc - last1)
}

/// Source text of a diff (everything but insertions).
pub fn source_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Insert)
        .map(|d| d.text.as_str())
        .collect()
}

/// Target text of a diff (everything but deletions).
pub fn target_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Delete)
        .map(|d| d.text.as_str())
        .collect()
}

pub(crate) fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter().rev().zip(b.iter().rev()).take_while(|(x, y)| x == y).count()
}

/// First occurrence of `needle` starting at or after `from`.
pub(crate) fn find(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if from > hay.len() {
        return None;
    }
    if needle.is_empty() {
        return Some(from);
    }
    hay[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Last occurrence of `needle` starting at or before `from`.
pub(crate) fn rfind(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.len() > hay.len() {
        return None;
    }
    let last_start = (hay.len() - needle.len()).min(from);
    (0..=last_start).rev().find(|&i| hay[i..i + needle.len()] == *needle)
}

pub(crate) fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_identical_texts() {
        assert!(diff("", "").is_empty());
        assert_eq!(diff("abc", "abc"), vec![Diff::equal("abc")]);
    }

    #[test]
    fn test_simple_insert() {
        assert_eq!(
            diff("abc", "abxc"),
            vec![Diff::equal("ab"), Diff::insert("x"), Diff::equal("c")]
        );
    }

    #[test]
    fn test_simple_delete() {
        assert_eq!(
            diff("abxc", "abc"),
            vec![Diff::equal("ab"), Diff::delete("x"), Diff::equal("c")]
        );
    }

    #[test]
    fn test_disjoint_texts() {
        assert_eq!(diff("foo", "bar"), vec![Diff::delete("foo"), Diff::insert("bar")]);
    }

    #[test]
    fn test_empty_sides() {
        assert_eq!(diff("", "new"), vec![Diff::insert("new")]);
        assert_eq!(diff("old", ""), vec![Diff::delete("old")]);
    }

    #[test]
    fn test_bisect_texts_reconstruct() {
        let cases = [
            ("cat", "map"),
            ("the quick brown fox", "a quick brown dog jumps"),
            ("kitten sitting", "sitting kitten"),
            ("αβγδε", "αγδζε"),
        ];
        for (old, new) in cases {
            let diffs = diff(old, new);
            assert_eq!(source_text(&diffs), old, "source of {old:?} -> {new:?}");
            assert_eq!(target_text(&diffs), new, "target of {old:?} -> {new:?}");
        }
    }

    #[test]
    fn test_merge_factors_common_affixes() {
        let mut diffs = vec![
            Diff::delete("abc"),
            Diff::insert("abd"),
            Diff::equal("x"),
        ];
        cleanup_merge(&mut diffs);
        assert_eq!(
            diffs,
            vec![
                Diff::equal("ab"),
                Diff::delete("c"),
                Diff::insert("d"),
                Diff::equal("x"),
            ]
        );
    }

    #[test]
    fn test_merge_joins_runs() {
        let mut diffs = vec![
            Diff::equal("a"),
            Diff::equal("b"),
            Diff::insert("c"),
            Diff::insert("d"),
            Diff::equal(""),
        ];
        cleanup_merge(&mut diffs);
        assert_eq!(diffs, vec![Diff::equal("ab"), Diff::insert("cd")]);
    }

    #[test]
    fn test_semantic_eliminates_short_equality() {
        let mut diffs = vec![
            Diff::delete("ab"),
            Diff::equal("c"),
            Diff::delete("de"),
            Diff::insert("xyz"),
        ];
        cleanup_semantic(&mut diffs);
        assert_eq!(diffs, vec![Diff::delete("abcde"), Diff::insert("cxyz")]);
    }

    #[test]
    fn test_semantic_keeps_long_equality() {
        let mut diffs = vec![
            Diff::delete("a"),
            Diff::equal("long equality"),
            Diff::insert("b"),
        ];
        let before = diffs.clone();
        cleanup_semantic(&mut diffs);
        assert_eq!(diffs, before);
    }

    #[test]
    fn test_levenshtein() {
        let diffs = vec![Diff::delete("abc"), Diff::insert("1234"), Diff::equal("xyz")];
        assert_eq!(levenshtein(&diffs), 4);
        let diffs = vec![Diff::equal("xyz"), Diff::delete("abc"), Diff::insert("1234")];
        assert_eq!(levenshtein(&diffs), 4);
        let diffs = vec![Diff::delete("abc"), Diff::equal("xyz"), Diff::insert("1234")];
        assert_eq!(levenshtein(&diffs), 7);
    }

    #[test]
    fn test_x_index() {
        let diffs = vec![Diff::delete("a"), Diff::insert("1234"), Diff::equal("xyz")];
        assert_eq!(x_index(&diffs, 2), 5);
        let diffs = vec![Diff::equal("a"), Diff::delete("1234"), Diff::equal("xyz")];
        assert_eq!(x_index(&diffs, 3), 1);
    }

    #[test]
    fn test_find_and_rfind() {
        let hay = chars("abcabc");
        assert_eq!(find(&hay, &chars("bc"), 0), Some(1));
        assert_eq!(find(&hay, &chars("bc"), 2), Some(4));
        assert_eq!(rfind(&hay, &chars("bc"), 6), Some(4));
        assert_eq!(rfind(&hay, &chars("bc"), 3), Some(1));
        assert_eq!(find(&hay, &[], 3), Some(3));
        assert_eq!(rfind(&hay, &[], 0), Some(0));
        assert_eq!(rfind(&hay, &[], 99), Some(6));
        assert_eq!(find(&hay, &chars("zz"), 0), None);
    }
}
