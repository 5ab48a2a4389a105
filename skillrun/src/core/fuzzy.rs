//! Partial-ratio fuzzy similarity for the skill prefilter.
//!
//! Scores are on a 0..=100 scale. `ratio` is the normalized indel similarity
//! (`200 * lcs / (len_a + len_b)`); `partial_ratio` slides the shorter string
//! across the longer one and keeps the best window, including the partial
//! windows that overhang either end.

pub fn ratio(left: &str, right: &str) -> f64 {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    ratio_chars(&left, &right)
}

pub fn partial_ratio(left: &str, right: &str) -> f64 {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    let (short, long) = if left.len() <= right.len() {
        (left, right)
    } else {
        (right, left)
    };
    if short.is_empty() {
        return 0.0;
    }
    let width = short.len();
    let mut best = 0.0f64;
    for len in 1..width {
        best = best
            .max(ratio_chars(&short, &long[..len]))
            .max(ratio_chars(&short, &long[long.len() - len..]));
    }
    for window in long.windows(width) {
        best = best.max(ratio_chars(&short, window));
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn ratio_chars(left: &[char], right: &[char]) -> f64 {
    let total = left.len() + right.len();
    if total == 0 {
        return 100.0;
    }
    let lcs = lcs_len(left, right);
    200.0 * lcs as f64 / total as f64
}

fn lcs_len(left: &[char], right: &[char]) -> usize {
    let mut row = vec![0usize; right.len() + 1];
    for &a in left {
        let mut diagonal = 0;
        for (j, &b) in right.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if a == b {
                diagonal + 1
            } else {
                above.max(row[j])
            };
            diagonal = above;
        }
    }
    row[right.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_full() {
        assert_eq!(ratio("skill", "skill"), 100.0);
        assert_eq!(partial_ratio("skill", "skill"), 100.0);
    }

    #[test]
    fn substring_scores_full_partial_ratio() {
        assert_eq!(partial_ratio("inventory", "file inventory helper"), 100.0);
        assert!(ratio("inventory", "file inventory helper") < 100.0);
    }

    #[test]
    fn unrelated_strings_score_low() {
        assert!(partial_ratio("gamma", "alpha-tool handles alpha") < 99.0);
        assert_eq!(partial_ratio("", "anything"), 0.0);
    }

    #[test]
    fn ratio_counts_common_subsequence() {
        // lcs("abcd", "abxd") = 3 => 200 * 3 / 8
        assert_eq!(ratio("abcd", "abxd"), 75.0);
    }

    #[test]
    fn argument_order_does_not_matter() {
        let a = partial_ratio("search keyword", "searcher search by keyword");
        let b = partial_ratio("searcher search by keyword", "search keyword");
        assert_eq!(a, b);
    }
}
