//! Merge confidence policy.
//!
//! The base comes from edit distance, then token overlap and the
//! rare-variant heuristic adjust it. Every adjustment that fires adds a
//! fragment to the explanation, joined with `; `.

use serde::Serialize;

use crate::error::ResolveError;

pub const HIGH_OVERLAP: f64 = 0.8;
pub const GOOD_OVERLAP: f64 = 0.5;
pub const LOW_OVERLAP: f64 = 0.3;
pub const RARE_VARIANT_RATIO: f64 = 0.1;
pub const RARE_VARIANT_MIN_COMMON: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput<'a> {
    pub text1: &'a str,
    pub text2: &'a str,
    pub count1: i64,
    pub count2: i64,
    pub edit_distance: usize,
    pub jaccard: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeScore {
    pub confidence: f64,
    pub reason: String,
}

pub fn score_merge(input: ScoreInput<'_>) -> Result<MergeScore, ResolveError> {
    if !(0.0..=1.0).contains(&input.jaccard) {
        return Err(ResolveError::invalid(format!(
            "jaccard similarity must be in [0.0, 1.0], got {}",
            input.jaccard
        )));
    }
    if input.count1 < 0 || input.count2 < 0 {
        return Err(ResolveError::invalid("occurrence counts must be non-negative"));
    }

    if input.edit_distance == 0 {
        return Ok(MergeScore {
            confidence: 1.0,
            reason: "exact match different case".to_string(),
        });
    }

    let mut reasons = Vec::new();
    let mut confidence: f64 = match input.edit_distance {
        1 => {
            reasons.push("edit distance=1 (likely typo)".to_string());
            0.95
        }
        2 => {
            reasons.push("edit distance=2 (possible typo)".to_string());
            0.85
        }
        3 => {
            reasons.push("edit distance=3".to_string());
            0.70
        }
        other => {
            reasons.push(format!("edit distance={other}"));
            0.50
        }
    };

    let overlap_pct = (input.jaccard * 100.0).round();
    if input.jaccard >= HIGH_OVERLAP {
        confidence += 0.10;
        reasons.push(format!("high token overlap ({overlap_pct}%)"));
    } else if input.jaccard >= GOOD_OVERLAP {
        confidence += 0.05;
        reasons.push(format!("good token overlap ({overlap_pct}%)"));
    } else if input.jaccard < LOW_OVERLAP {
        confidence -= 0.15;
        reasons.push(format!("low token overlap ({overlap_pct}%)"));
    }

    let common = input.count1.max(input.count2);
    let rare = input.count1.min(input.count2);
    if common > 0 {
        let ratio = rare as f64 / common as f64;
        if ratio < RARE_VARIANT_RATIO && common > RARE_VARIANT_MIN_COMMON {
            confidence += 0.05;
            reasons.push(format!("rare variant ({rare} vs {common})"));
        }
    }

    Ok(MergeScore {
        confidence: confidence.min(1.0),
        reason: reasons.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(edit_distance: usize, jaccard: f64, count1: i64, count2: i64) -> ScoreInput<'static> {
        ScoreInput {
            text1: "a",
            text2: "b",
            count1,
            count2,
            edit_distance,
            jaccard,
        }
    }

    #[test]
    fn exact_match_short_circuits_every_adjustment() {
        let score = score_merge(input(0, 0.1, 1, 500)).expect("score");
        assert_eq!(score.confidence, 1.0);
        assert_eq!(score.reason, "exact match different case");
    }

    #[test]
    fn typo_of_common_name_caps_at_one() {
        let score = score_merge(ScoreInput {
            text1: "Jeffrey Epstein",
            text2: "Jefffrey Epstein",
            count1: 50,
            count2: 2,
            edit_distance: 1,
            jaccard: 0.5,
        })
        .expect("score");
        assert_eq!(score.confidence, 1.0);
        assert_eq!(
            score.reason,
            "edit distance=1 (likely typo); good token overlap (50%); rare variant (2 vs 50)"
        );
    }

    #[test]
    fn distance_three_with_shared_word_lands_in_manual_band() {
        let score = score_merge(ScoreInput {
            text1: "South Africa",
            text2: "South America",
            count1: 40,
            count2: 35,
            edit_distance: 3,
            jaccard: 0.5,
        })
        .expect("score");
        assert!((score.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn low_overlap_penalty_and_rare_boost_both_apply() {
        let score = score_merge(input(2, 0.2, 3, 80)).expect("score");
        assert!((score.confidence - 0.75).abs() < 1e-9);
        assert!(score.reason.contains("low token overlap (20%)"));
        assert!(score.reason.contains("rare variant (3 vs 80)"));
    }

    #[test]
    fn middling_overlap_leaves_base_untouched() {
        let score = score_merge(input(2, 1.0 / 3.0, 10, 10)).expect("score");
        assert!((score.confidence - 0.85).abs() < 1e-9);
        assert_eq!(score.reason, "edit distance=2 (possible typo)");
    }

    #[test]
    fn rare_variant_needs_a_common_side_above_ten() {
        let score = score_merge(input(4, 0.9, 1, 10)).expect("score");
        assert!((score.confidence - 0.60).abs() < 1e-9);
        assert!(!score.reason.contains("rare variant"));
    }

    #[test]
    fn high_overlap_at_distance_two_reaches_auto_band() {
        let score = score_merge(input(2, 0.8, 20, 20)).expect("score");
        assert!(score.confidence >= 0.95);
    }

    #[test]
    fn scoring_is_order_independent() {
        let first = score_merge(input(1, 0.5, 2, 50)).expect("first");
        let _ = score_merge(input(3, 0.1, 9, 9)).expect("unrelated");
        let again = score_merge(input(1, 0.5, 50, 2)).expect("swapped");
        assert_eq!(first, again);
        assert!(first.confidence >= 0.95);
    }

    #[test]
    fn rejects_out_of_range_similarity() {
        assert!(matches!(
            score_merge(input(1, 1.5, 1, 1)),
            Err(ResolveError::InputValidation(_))
        ));
        assert!(score_merge(input(1, 0.5, -1, 1)).is_err());
    }
}
