use std::collections::HashSet;

pub const BLOCK_PREFIX_CHARS: usize = 3;

/// Word-level Jaccard overlap; either side empty means no overlap.
pub fn jaccard_similarity(left: &str, right: &str) -> f64 {
    let left_tokens = tokens(left);
    let right_tokens = tokens(right);
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }

    let intersection = left_tokens.intersection(&right_tokens).count() as f64;
    let union = left_tokens.union(&right_tokens).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

pub fn edit_distance(left: &str, right: &str) -> usize {
    strsim::levenshtein(left, right)
}

/// Character (not byte) length, matching the unit `edit_distance` counts in.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn block_key(normalized: &str) -> String {
    normalized.chars().take(BLOCK_PREFIX_CHARS).collect()
}

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}
