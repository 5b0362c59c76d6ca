//! Approximate location matching.
//!
//! Finds the best placement of a short pattern near an expected location,
//! scoring candidates by error count relative to pattern length plus their
//! distance from the expected location. Patterns are limited to
//! [`MATCH_MAX_BITS`] chars so the bitap state fits in one machine word.
//!
//! Reference: Wu & Manber, "Fast Text Searching Allowing Errors" (1992)

use std::collections::HashMap;

use super::diff::{find, rfind};
use super::{CodecConfig, MATCH_MAX_BITS};

/// Locate `pattern` in `text` near `loc`. `None` when no placement scores
/// under the configured threshold.
pub(crate) fn match_main(config: &CodecConfig, text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    let loc = loc.min(text.len());
    if text == pattern {
        return Some(0);
    }
    if text.is_empty() {
        return None;
    }
    if loc + pattern.len() <= text.len() && text[loc..loc + pattern.len()] == *pattern {
        return Some(loc);
    }
    bitap(config, text, pattern, loc)
}

fn bitap(config: &CodecConfig, text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
    debug_assert!(!pattern.is_empty() && pattern.len() <= MATCH_MAX_BITS);

    let alphabet = alphabet(pattern);
    let score = |errors: usize, x: usize| -> f64 {
        let accuracy = errors as f64 / pattern.len() as f64;
        let proximity = loc.abs_diff(x);
        if config.match_distance == 0 {
            return if proximity == 0 { accuracy } else { 1.0 };
        }
        accuracy + proximity as f64 / config.match_distance as f64
    };

    let mut threshold = config.match_threshold;
    // Exact hits on either side tighten the threshold before the fuzzy search.
    if let Some(exact) = find(text, pattern, loc) {
        threshold = threshold.min(score(0, exact));
        if let Some(exact) = rfind(text, pattern, loc + pattern.len()) {
            threshold = threshold.min(score(0, exact));
        }
    }

    let match_mask: u32 = 1 << (pattern.len() - 1);
    let mut best_loc = None;
    let mut bin_max = pattern.len() + text.len();
    let mut last_rd: Vec<u32> = Vec::new();

    for d in 0..pattern.len() {
        // Binary search for how far from `loc` a match with `d` errors may sit.
        let mut bin_min = 0;
        let mut bin_mid = bin_max;
        while bin_min < bin_mid {
            if score(d, loc + bin_mid) <= threshold {
                bin_min = bin_mid;
            } else {
                bin_max = bin_mid;
            }
            bin_mid = (bin_max - bin_min) / 2 + bin_min;
        }
        bin_max = bin_mid;

        let mut start = (loc as isize - bin_mid as isize + 1).max(1) as usize;
        let finish = (loc + bin_mid).min(text.len()) + pattern.len();

        let mut rd = vec![0u32; finish + 2];
        rd[finish + 1] = (1u32 << d) - 1;

        let mut j = finish;
        while j >= start {
            let char_match = if j - 1 >= text.len() {
                0
            } else {
                alphabet.get(&text[j - 1]).copied().unwrap_or(0)
            };

            rd[j] = if d == 0 {
                ((rd[j + 1] << 1) | 1) & char_match
            } else {
                (((rd[j + 1] << 1) | 1) & char_match)
                    | (((last_rd[j + 1] | last_rd[j]) << 1) | 1)
                    | last_rd[j + 1]
            };

            if rd[j] & match_mask != 0 {
                let candidate = score(d, j - 1);
                if candidate <= threshold {
                    threshold = candidate;
                    best_loc = Some(j - 1);
                    if j - 1 > loc {
                        // Don't search further right than the mirror image of this hit.
                        start = (2 * loc as isize - (j - 1) as isize).max(1) as usize;
                    } else {
                        break;
                    }
                }
            }
            j -= 1;
        }

        if score(d + 1, loc) > threshold {
            // One more error can't beat what we have.
            break;
        }
        last_rd = rd;
    }

    best_loc
}

/// Bitmask per char: bit `len - i - 1` set where the pattern has that char.
fn alphabet(pattern: &[char]) -> HashMap<char, u32> {
    let mut masks = HashMap::with_capacity(pattern.len());
    for (i, c) in pattern.iter().enumerate() {
        *masks.entry(*c).or_insert(0) |= 1 << (pattern.len() - i - 1);
    }
    masks
}
